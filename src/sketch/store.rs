//! Batched, tiered storage of calibrated sketches.
//!
//! A [`SketchStore`] packs the feature columns of many tables into fixed-width
//! batches, greedily and in registration order. The last batch is open and
//! lives on the device tier; once full it is sealed and demoted to the host
//! tier, from where it may be spilled to disk.
//!
//! Every batch keeps an ordered list of [`FeatureIndexEntry`] records, one per
//! run of columns contributed by a table. Resolving a batch column back to its
//! source is a binary search over that list.

use std::borrow::Cow;
use std::collections::BTreeMap;

use thiserror::Error;

use super::calibrate::CalibratedTable;
use super::matrices::Sketch;
use super::memory::BatchCapacity;
use crate::io::{SpillDir, SpillError, SpilledBatch};

/// Identifier of a registered table.
pub type TableId = usize;

/// Position of a batch in its store.
pub type BatchId = usize;

// ============================================================================
// Policies and tiers
// ============================================================================

/// Whether a store holds seller candidates or the buyer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreRole {
    /// Many tables packed into many batches.
    Seller,
    /// A single batch carrying cross terms, replaced on every registration.
    Buyer,
}

/// When sealed batches are written to the disk tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpillPolicy {
    /// Never spill; the host budget may be overrun.
    Never,
    /// Spill a sealed batch when the host tier is over budget.
    #[default]
    WhenFull,
    /// Spill every sealed batch.
    Always,
}

/// Storage tier of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    Device,
    Host,
    Disk,
}

/// Where a batch's matrices currently live. A batch is in exactly one tier.
#[derive(Debug)]
pub enum Residency {
    Device(Sketch),
    Host(Sketch),
    Disk(SpilledBatch),
}

impl Residency {
    pub fn tier(&self) -> Tier {
        match self {
            Residency::Device(_) => Tier::Device,
            Residency::Host(_) => Tier::Host,
            Residency::Disk(_) => Tier::Disk,
        }
    }
}

// ============================================================================
// Index types
// ============================================================================

/// Start of a run of columns from one table inside a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureIndexEntry {
    /// Batch column where the run begins.
    pub start_offset: usize,
    /// Table the run belongs to.
    pub table_id: TableId,
    /// Table-local column of the run's first column.
    pub local_offset: usize,
}

/// Where one registered column was placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeaturePlacement {
    pub batch_id: BatchId,
    pub offset: usize,
}

/// Ordered feature names per table.
///
/// Registering the same table again appends its names, so table-local offsets
/// keep counting across partitions.
#[derive(Debug, Clone, Default)]
pub struct TableFeatureDirectory {
    names: BTreeMap<TableId, Vec<String>>,
}

impl TableFeatureDirectory {
    /// Append names for a table, returning the local offset of the first one.
    pub fn extend<I>(&mut self, table_id: TableId, names: I) -> usize
    where
        I: IntoIterator<Item = String>,
    {
        let entry = self.names.entry(table_id).or_default();
        let start = entry.len();
        entry.extend(names);
        start
    }

    /// All names of a table.
    pub fn names(&self, table_id: TableId) -> Option<&[String]> {
        self.names.get(&table_id).map(Vec::as_slice)
    }

    /// Name of one table-local column.
    pub fn name(&self, table_id: TableId, local_offset: usize) -> Option<&str> {
        self.names
            .get(&table_id)
            .and_then(|names| names.get(local_offset))
            .map(String::as_str)
    }

    /// Number of names recorded for a table.
    pub fn width(&self, table_id: TableId) -> usize {
        self.names.get(&table_id).map_or(0, Vec::len)
    }

    pub fn table_ids(&self) -> impl Iterator<Item = TableId> + '_ {
        self.names.keys().copied()
    }

    /// Keep only the first `len` names of a table.
    pub fn truncate(&mut self, table_id: TableId, len: usize) {
        if len == 0 {
            self.names.remove(&table_id);
        } else if let Some(names) = self.names.get_mut(&table_id) {
            names.truncate(len);
        }
    }

    pub fn clear(&mut self) {
        self.names.clear();
    }
}

// ============================================================================
// Batch
// ============================================================================

/// A horizontal slice of packed feature columns.
#[derive(Debug)]
pub struct Batch {
    id: BatchId,
    width: usize,
    sealed: bool,
    entries: Vec<FeatureIndexEntry>,
    residency: Residency,
}

impl Batch {
    fn open(id: BatchId, domain_size: usize) -> Self {
        Self {
            id,
            width: 0,
            sealed: false,
            entries: Vec::new(),
            residency: Residency::Device(Sketch::empty(domain_size)),
        }
    }

    #[inline]
    pub fn id(&self) -> BatchId {
        self.id
    }

    /// Number of columns.
    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    #[inline]
    pub fn tier(&self) -> Tier {
        self.residency.tier()
    }

    /// Index entries in increasing `start_offset` order.
    pub fn entries(&self) -> &[FeatureIndexEntry] {
        &self.entries
    }

    /// Resolve a batch column to `(table_id, local_offset)`.
    ///
    /// Finds the last entry whose `start_offset <= index` by binary search.
    pub fn resolve(&self, index: usize) -> Option<(TableId, usize)> {
        if index >= self.width {
            return None;
        }
        let pos = self.entries.partition_point(|e| e.start_offset <= index);
        let entry = self.entries.get(pos.checked_sub(1)?)?;
        Some((entry.table_id, index - entry.start_offset + entry.local_offset))
    }

    /// Columns contributed by `table_id`.
    fn width_of(&self, table_id: TableId) -> usize {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.table_id == table_id)
            .map(|(i, e)| {
                let end = self
                    .entries
                    .get(i + 1)
                    .map_or(self.width, |next| next.start_offset);
                end - e.start_offset
            })
            .sum()
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors raised by [`SketchStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// A table is wider than the smaller of the device and host budgets.
    #[error("table {table_id} has {width} features but at most {capacity} fit in a batch")]
    Capacity {
        table_id: TableId,
        width: usize,
        capacity: usize,
    },

    /// The sketch was built on a different domain.
    #[error("sketch has {actual} domain rows, store expects {expected}")]
    DomainMismatch { expected: usize, actual: usize },

    /// Feature names and sketch columns disagree.
    #[error("{names} feature names for {columns} sketch columns")]
    WidthMismatch { names: usize, columns: usize },

    #[error("no batch {0}")]
    UnknownBatch(BatchId),

    #[error("batch {0} is still open")]
    BatchOpen(BatchId),

    #[error("no spill directory configured")]
    NoSpillDir,

    #[error(transparent)]
    Spill(#[from] SpillError),
}

// ============================================================================
// Store
// ============================================================================

/// Store state before a seller registration.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Checkpoint {
    table_id: TableId,
    n_batches: usize,
    /// Width and entry count of the batch that was open, if any.
    open: Option<(usize, usize)>,
    directory_width: usize,
    host_columns_used: usize,
}


/// Sketch storage for one join key.
#[derive(Debug)]
pub struct SketchStore {
    role: StoreRole,
    domain_size: usize,
    capacity: BatchCapacity,
    spill_policy: SpillPolicy,
    spill_dir: Option<SpillDir>,
    batches: Vec<Batch>,
    directory: TableFeatureDirectory,
    host_columns_used: usize,
}

impl SketchStore {
    /// Create an empty store.
    ///
    /// Spilling is only possible with a `spill_dir`; without one every batch
    /// stays in memory regardless of `spill_policy`.
    pub fn new(
        role: StoreRole,
        domain_size: usize,
        capacity: BatchCapacity,
        spill_policy: SpillPolicy,
        spill_dir: Option<SpillDir>,
    ) -> Self {
        Self {
            role,
            domain_size,
            capacity,
            spill_policy,
            spill_dir,
            batches: Vec::new(),
            directory: TableFeatureDirectory::default(),
            host_columns_used: 0,
        }
    }

    #[inline]
    pub fn role(&self) -> StoreRole {
        self.role
    }

    #[inline]
    pub fn domain_size(&self) -> usize {
        self.domain_size
    }

    #[inline]
    pub fn capacity(&self) -> BatchCapacity {
        self.capacity
    }

    #[inline]
    pub fn n_batches(&self) -> usize {
        self.batches.len()
    }

    pub fn batches(&self) -> &[Batch] {
        &self.batches
    }

    pub fn batch(&self, batch_id: BatchId) -> Option<&Batch> {
        self.batches.get(batch_id)
    }

    pub fn directory(&self) -> &TableFeatureDirectory {
        &self.directory
    }

    /// Register the columns of a calibrated table.
    ///
    /// Seller stores append to the open batch and open new ones as batches
    /// fill. Buyer stores are reset and hold the table as their only batch,
    /// cross terms included.
    ///
    /// # Errors
    ///
    /// [`StoreError::Capacity`] if the table is wider than
    /// [`BatchCapacity::max_table_width`], or [`StoreError::Spill`] if a
    /// sealed batch cannot be written. Either way the store is left unchanged.
    pub fn register(
        &mut self,
        table_id: TableId,
        calibrated: &CalibratedTable,
    ) -> Result<Vec<FeaturePlacement>, StoreError> {
        let sketch = &calibrated.sketch;
        let width = sketch.n_features();
        if sketch.domain_size() != self.domain_size {
            return Err(StoreError::DomainMismatch {
                expected: self.domain_size,
                actual: sketch.domain_size(),
            });
        }
        if calibrated.feature_names.len() != width {
            return Err(StoreError::WidthMismatch {
                names: calibrated.feature_names.len(),
                columns: width,
            });
        }
        let capacity = self.capacity.max_table_width();
        if width > capacity {
            return Err(StoreError::Capacity {
                table_id,
                width,
                capacity,
            });
        }

        match self.role {
            StoreRole::Buyer => Ok(self.register_buyer(table_id, calibrated)),
            StoreRole::Seller => self.register_seller(table_id, calibrated),
        }
    }

    fn register_buyer(&mut self, table_id: TableId, calibrated: &CalibratedTable) -> Vec<FeaturePlacement> {
        self.reset();
        let width = calibrated.width();
        let local_offset = self
            .directory
            .extend(table_id, calibrated.feature_names.iter().cloned());
        self.batches.push(Batch {
            id: 0,
            width,
            sealed: true,
            entries: vec![FeatureIndexEntry {
                start_offset: 0,
                table_id,
                local_offset,
            }],
            residency: Residency::Device(calibrated.sketch.clone()),
        });
        tracing::debug!(table_id, width, "registered buyer sketch");
        (0..width)
            .map(|offset| FeaturePlacement { batch_id: 0, offset })
            .collect()
    }

    fn register_seller(
        &mut self,
        table_id: TableId,
        calibrated: &CalibratedTable,
    ) -> Result<Vec<FeaturePlacement>, StoreError> {
        let checkpoint = self.checkpoint(table_id);
        let (placements, to_spill) = self.pack(table_id, calibrated);

        // Highest id first, so a previously open batch is spilled last and a
        // failure never leaves it on disk.
        for &batch_id in to_spill.iter().rev() {
            if let Err(err) = self.spill(batch_id) {
                self.rollback(&checkpoint);
                return Err(err);
            }
        }
        Ok(placements)
    }

    /// Append a table's columns to the open batch, sealing batches as they
    /// fill. Returns the placements and the sealed batches due for spilling.
    fn pack(
        &mut self,
        table_id: TableId,
        calibrated: &CalibratedTable,
    ) -> (Vec<FeaturePlacement>, Vec<BatchId>) {
        let width = calibrated.width();
        let local_start = self
            .directory
            .extend(table_id, calibrated.feature_names.iter().cloned());
        let batch_width = self.capacity.device_columns;
        let mut placements = Vec::with_capacity(width);
        let mut to_spill = Vec::new();
        let mut pending_columns = 0;

        let mut cursor = 0;
        while cursor < width {
            if self.batches.last().map_or(true, Batch::is_sealed) {
                let id = self.batches.len();
                self.batches.push(Batch::open(id, self.domain_size));
            }
            let last = self.batches.len() - 1;
            let batch = &mut self.batches[last];

            let take = (batch_width - batch.width).min(width - cursor);
            if let Residency::Device(open) = &mut batch.residency {
                open.append_columns(&calibrated.sketch.columns(cursor, cursor + take));
            }
            batch.entries.push(FeatureIndexEntry {
                start_offset: batch.width,
                table_id,
                local_offset: local_start + cursor,
            });
            placements.extend((batch.width..batch.width + take).map(|offset| FeaturePlacement {
                batch_id: batch.id,
                offset,
            }));
            tracing::debug!(
                table_id,
                batch_id = batch.id,
                start_offset = batch.width,
                columns = take,
                "placed feature run"
            );

            batch.width += take;
            cursor += take;
            if batch.width == batch_width && self.seal(last, pending_columns) {
                pending_columns += batch_width;
                to_spill.push(last);
            }
        }

        (placements, to_spill)
    }

    /// Seal a full batch and demote it to the host tier.
    ///
    /// Returns whether the spill policy sends it to disk. `pending_columns`
    /// are host columns already due to be spilled.
    fn seal(&mut self, batch_id: BatchId, pending_columns: usize) -> bool {
        let batch = &mut self.batches[batch_id];
        batch.sealed = true;
        let residency = std::mem::replace(&mut batch.residency, Residency::Host(Sketch::empty(0)));
        batch.residency = match residency {
            Residency::Device(sketch) => Residency::Host(sketch),
            other => other,
        };
        self.host_columns_used += batch.width;

        let resident = self.host_columns_used - pending_columns;
        let over_budget = resident > self.capacity.host_columns;
        let wants_spill = match self.spill_policy {
            SpillPolicy::Never => false,
            SpillPolicy::WhenFull => over_budget,
            SpillPolicy::Always => true,
        };

        if wants_spill && self.spill_dir.is_some() {
            return true;
        }
        if over_budget {
            tracing::warn!(
                batch_id,
                host_columns_used = resident,
                host_columns = self.capacity.host_columns,
                "host tier over budget, batch kept in memory"
            );
        }
        false
    }

    pub(crate) fn checkpoint(&self, table_id: TableId) -> Checkpoint {
        let open = self
            .batches
            .last()
            .filter(|batch| !batch.sealed)
            .map(|batch| (batch.width, batch.entries.len()));
        Checkpoint {
            table_id,
            n_batches: self.batches.len(),
            open,
            directory_width: self.directory.width(table_id),
            host_columns_used: self.host_columns_used,
        }
    }

    /// Undo the seller registrations made since `checkpoint`.
    pub(crate) fn rollback(&mut self, checkpoint: &Checkpoint) {
        let dir = self.spill_dir.as_ref();
        for batch in self.batches.drain(checkpoint.n_batches..) {
            if let (Some(dir), Residency::Disk(spilled)) = (dir, &batch.residency) {
                if let Err(err) = dir.remove(spilled) {
                    tracing::warn!(batch_id = batch.id, error = %err, "failed to remove spilled batch");
                }
            }
        }

        if let (Some((width, n_entries)), Some(batch)) = (checkpoint.open, self.batches.last_mut()) {
            let kept = match &batch.residency {
                Residency::Device(sketch) | Residency::Host(sketch) => Some(sketch.columns(0, width)),
                Residency::Disk(spilled) => dir.and_then(|dir| {
                    let sketch = dir
                        .read_batch(spilled)
                        .and_then(|sketch| dir.remove(spilled).map(|()| sketch));
                    match sketch {
                        Ok(sketch) => Some(sketch.columns(0, width)),
                        Err(err) => {
                            tracing::warn!(batch_id = batch.id, error = %err, "failed to reload spilled batch");
                            None
                        }
                    }
                }),
            };
            if let Some(kept) = kept {
                batch.residency = Residency::Device(kept);
            }
            batch.width = width;
            batch.sealed = false;
            batch.entries.truncate(n_entries);
        }

        self.directory
            .truncate(checkpoint.table_id, checkpoint.directory_width);
        self.host_columns_used = checkpoint.host_columns_used;
    }

    /// Move a sealed batch to the disk tier.
    ///
    /// Spilling a batch that is already on disk is a no-op.
    pub fn spill(&mut self, batch_id: BatchId) -> Result<(), StoreError> {
        let dir = self.spill_dir.as_ref().ok_or(StoreError::NoSpillDir)?;
        let batch = self
            .batches
            .get_mut(batch_id)
            .ok_or(StoreError::UnknownBatch(batch_id))?;
        if !batch.sealed {
            return Err(StoreError::BatchOpen(batch_id));
        }
        let spilled = match &batch.residency {
            Residency::Disk(_) => return Ok(()),
            Residency::Device(sketch) | Residency::Host(sketch) => {
                dir.write_batch(batch_id as u32, sketch)?
            }
        };
        if batch.tier() == Tier::Host {
            self.host_columns_used -= batch.width;
        }
        batch.residency = Residency::Disk(spilled);
        Ok(())
    }

    /// Bring a spilled batch back to the host tier and delete its files.
    ///
    /// Restoring an in-memory batch is a no-op.
    pub fn restore(&mut self, batch_id: BatchId) -> Result<(), StoreError> {
        let batch = self
            .batches
            .get_mut(batch_id)
            .ok_or(StoreError::UnknownBatch(batch_id))?;
        let Residency::Disk(spilled) = &batch.residency else {
            return Ok(());
        };
        let dir = self.spill_dir.as_ref().ok_or(StoreError::NoSpillDir)?;
        let sketch = dir.read_batch(spilled)?;
        dir.remove(spilled)?;
        batch.residency = Residency::Host(sketch);
        self.host_columns_used += batch.width;
        Ok(())
    }

    /// Matrices of a batch, reloaded from disk if it was spilled.
    pub fn sketch(&self, batch_id: BatchId) -> Result<Cow<'_, Sketch>, StoreError> {
        let batch = self
            .batches
            .get(batch_id)
            .ok_or(StoreError::UnknownBatch(batch_id))?;
        match &batch.residency {
            Residency::Device(sketch) | Residency::Host(sketch) => Ok(Cow::Borrowed(sketch)),
            Residency::Disk(spilled) => {
                let dir = self.spill_dir.as_ref().ok_or(StoreError::NoSpillDir)?;
                Ok(Cow::Owned(dir.read_batch(spilled)?))
            }
        }
    }

    /// Resolve a batch column to `(table_id, local_offset)`.
    pub fn resolve(&self, batch_id: BatchId, index: usize) -> Option<(TableId, usize)> {
        self.batches.get(batch_id)?.resolve(index)
    }

    /// Resolve a batch column to its table and feature name.
    pub fn feature_name(&self, batch_id: BatchId, index: usize) -> Option<(TableId, &str)> {
        let (table_id, local) = self.resolve(batch_id, index)?;
        Some((table_id, self.directory.name(table_id, local)?))
    }

    /// Columns of `table_id` stored across all batches and tiers.
    pub fn total_width(&self, table_id: TableId) -> usize {
        self.batches.iter().map(|b| b.width_of(table_id)).sum()
    }

    /// Drop every batch and directory entry, deleting spilled files.
    pub fn reset(&mut self) {
        if let Some(dir) = &self.spill_dir {
            for batch in &self.batches {
                if let Residency::Disk(spilled) = &batch.residency {
                    if let Err(err) = dir.remove(spilled) {
                        tracing::warn!(batch_id = batch.id, error = %err, "failed to remove spilled batch");
                    }
                }
            }
        }
        self.batches.clear();
        self.directory.clear();
        self.host_columns_used = 0;
    }
}

impl Drop for SketchStore {
    fn drop(&mut self) {
        self.reset();
    }
}
