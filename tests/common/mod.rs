//! Shared builders for integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use ndarray::Array2;

use joinsketch::data::{JoinKeyDomain, Table};
use joinsketch::sketch::{CalibratedTable, FixedMemoryProbe, Sketch};
use joinsketch::{DataMarket, MarketConfig};

/// Domain `1..=n` on key `k`.
pub fn int_domain(key: &str, n: i64) -> JoinKeyDomain {
    JoinKeyDomain::new().with_key(key, 1..=n)
}

/// Market whose stores on a domain of `domain_size` rows hold exactly
/// `device_columns` per batch and `host_columns` on the host.
pub fn fixed_market(domain_size: usize, device_columns: usize, host_columns: usize) -> DataMarket {
    let probe = FixedMemoryProbe::for_columns(domain_size, device_columns, host_columns);
    let config = MarketConfig::builder()
        .host_memory_fraction(1.0)
        .build()
        .unwrap();
    DataMarket::with_probe(config, Arc::new(probe))
}

/// One row per key value `1..=n`, with the given numeric columns.
pub fn keyed_table(key: &str, columns: &[(&str, Vec<f64>)]) -> Table {
    let n = columns.first().map_or(0, |(_, v)| v.len()) as i64;
    let mut builder = Table::builder().key_column(key, 1..=n);
    for (name, values) in columns {
        builder = builder.numeric_column(*name, values.clone());
    }
    builder.build().unwrap()
}

/// Calibrated table with distinct, position-derived values.
pub fn synthetic_calibrated(prefix: &str, width: usize, domain_size: usize) -> CalibratedTable {
    let values = Array2::from_shape_fn((domain_size, width), |(r, c)| {
        (r as f64 + 1.0) * 0.5 + c as f64 * 3.25
    });
    CalibratedTable {
        feature_names: (0..width).map(|i| format!("{prefix}{i}")).collect(),
        sketch: Sketch::new(
            Array2::ones((domain_size, width)),
            values.clone(),
            values.mapv(|v| v * v),
            None,
        ),
        dropped_rows: 0,
    }
}
