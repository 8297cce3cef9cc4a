//! Memory budgeting for sketch batches.
//!
//! Batch widths are derived once, at store construction, from the memory that
//! is free at that moment. The estimate is advisory; nothing locks the budget.

use std::fmt;

use sysinfo::System;

/// Bytes per sketch element (`f64`).
pub const BYTES_PER_ELEMENT: usize = std::mem::size_of::<f64>();

/// Matrices that are co-resident for every batch column (ones, sum, sum of squares).
pub const CO_RESIDENT_MATRICES: usize = 3;

/// Source of free-memory figures.
pub trait MemoryProbe: Send + Sync + fmt::Debug {
    /// Free bytes on the accelerator, or `None` when there is none.
    fn device_free_bytes(&self) -> Option<u64>;

    /// Bytes of host memory currently available.
    fn host_available_bytes(&self) -> u64;
}

/// Probe backed by the operating system. There is no accelerator.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemMemoryProbe;

impl MemoryProbe for SystemMemoryProbe {
    fn device_free_bytes(&self) -> Option<u64> {
        None
    }

    fn host_available_bytes(&self) -> u64 {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.available_memory()
    }
}

/// Probe reporting fixed figures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedMemoryProbe {
    pub device: Option<u64>,
    pub host: u64,
}

impl FixedMemoryProbe {
    /// Host-only probe.
    pub fn host(bytes: u64) -> Self {
        Self {
            device: None,
            host: bytes,
        }
    }

    /// Probe with both a device and a host budget.
    pub fn with_device(device: u64, host: u64) -> Self {
        Self {
            device: Some(device),
            host,
        }
    }

    /// Probe sized so that a domain of `domain_size` rows fits exactly
    /// `device_columns` / `host_columns` columns (before the host fraction).
    pub fn for_columns(domain_size: usize, device_columns: usize, host_columns: usize) -> Self {
        let per_column = column_bytes(domain_size);
        Self::with_device(device_columns as u64 * per_column, host_columns as u64 * per_column)
    }
}

impl MemoryProbe for FixedMemoryProbe {
    fn device_free_bytes(&self) -> Option<u64> {
        self.device
    }

    fn host_available_bytes(&self) -> u64 {
        self.host
    }
}

/// Bytes needed to hold one feature column of a batch.
#[inline]
pub fn column_bytes(domain_size: usize) -> u64 {
    (BYTES_PER_ELEMENT * CO_RESIDENT_MATRICES * domain_size.max(1)) as u64
}

/// Per-tier batch capacities, in feature columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchCapacity {
    /// Width of one batch (the device budget).
    pub device_columns: usize,
    /// Columns the host tier can hold.
    pub host_columns: usize,
}

impl BatchCapacity {
    /// Derive capacities from a probe.
    ///
    /// Only `host_fraction` of the available host memory is budgeted. Without
    /// an accelerator the device capacity equals the host capacity.
    pub fn estimate(probe: &dyn MemoryProbe, domain_size: usize, host_fraction: f64) -> Self {
        let host_bytes = (probe.host_available_bytes() as f64 * host_fraction) as u64;
        let per_column = column_bytes(domain_size);
        let host_columns = (host_bytes / per_column) as usize;
        let device_columns = probe
            .device_free_bytes()
            .map_or(host_columns, |bytes| (bytes / per_column) as usize);
        Self {
            device_columns,
            host_columns,
        }
    }

    /// Fixed capacities.
    pub fn new(device_columns: usize, host_columns: usize) -> Self {
        Self {
            device_columns,
            host_columns,
        }
    }

    /// Widest table that may be registered at once.
    #[inline]
    pub fn max_table_width(&self) -> usize {
        self.device_columns.min(self.host_columns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_uses_host_fraction() {
        let probe = FixedMemoryProbe::host(column_bytes(10) * 100);
        let cap = BatchCapacity::estimate(&probe, 10, 0.5);
        assert_eq!(cap.host_columns, 50);
        assert_eq!(cap.device_columns, 50);
        assert_eq!(cap.max_table_width(), 50);
    }

    #[test]
    fn estimate_with_device() {
        let probe = FixedMemoryProbe::for_columns(4, 8, 40);
        let cap = BatchCapacity::estimate(&probe, 4, 1.0);
        assert_eq!(cap, BatchCapacity::new(8, 40));
        assert_eq!(cap.max_table_width(), 8);
    }

    #[test]
    fn column_bytes_formula() {
        assert_eq!(column_bytes(1000), 8 * 3 * 1000);
        assert_eq!(column_bytes(0), column_bytes(1));
    }

    #[test]
    fn system_probe_reports_memory() {
        assert!(SystemMemoryProbe.device_free_bytes().is_none());
        let cap = BatchCapacity::estimate(&SystemMemoryProbe, 100, 0.5);
        assert_eq!(cap.device_columns, cap.host_columns);
    }
}
