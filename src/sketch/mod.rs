//! Sketches: calibration, memory budgeting and batched storage.
//!
//! A sketch replaces the feature columns of a table with per-join-key-value
//! sufficient statistics (count, sum, sum of squares and, for buyers, pairwise
//! cross products). Sketches on the same join keys share one row axis, so
//! combining a buyer with any seller is an element-wise product followed by a
//! column sum.
//!
//! - [`Calibrator`] builds a [`Sketch`] from a [`Table`](crate::data::Table).
//! - [`SketchStore`] packs sketches into memory-bounded [`Batch`]es across
//!   device, host and disk tiers.
//! - [`BatchCapacity`] derives batch widths from a [`MemoryProbe`].

mod calibrate;
mod matrices;
mod memory;
mod store;

pub use calibrate::{CalibratedTable, CalibrationOptions, Calibrator};
pub use matrices::{n_pairs, pair_index, MatrixKind, Sketch};
pub use memory::{
    column_bytes, BatchCapacity, FixedMemoryProbe, MemoryProbe, SystemMemoryProbe,
    BYTES_PER_ELEMENT, CO_RESIDENT_MATRICES,
};
pub use store::{
    Batch, BatchId, FeatureIndexEntry, FeaturePlacement, Residency, SketchStore, SpillPolicy,
    StoreError, StoreRole, TableFeatureDirectory, TableId, Tier,
};
pub(crate) use store::Checkpoint;
