//! Persistence for the disk tier.
//!
//! Spilled batches are written by [`SpillDir`] through the [`SpillCodec`]
//! container format.

pub mod spill;

pub use spill::{SpillCodec, SpillDir, SpillError, SpillHeader, SpilledBatch};
