//! Schema validation errors.

use thiserror::Error;

/// Errors raised when a table does not match what an operation requested.
///
/// These are fatal for the call that produced them: calibration and
/// registration never return a partial result alongside a `SchemaError`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("missing required column: {0}")]
    MissingColumn(String),

    #[error("column {0} is not a join key")]
    NotAJoinKey(String),

    #[error("column {0} is not numeric")]
    NotNumeric(String),

    #[error("duplicate column name: {0}")]
    DuplicateColumn(String),

    #[error("column {column} has {actual} rows, expected {expected}")]
    LengthMismatch {
        column: String,
        expected: usize,
        actual: usize,
    },

    #[error("no domain registered for join key {0}")]
    UnknownDomain(String),

    #[error("at least one join key is required")]
    NoJoinKeys,
}
