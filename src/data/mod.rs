//! Tabular input types.
//!
//! Raw tables enter the crate through [`Table`], which pairs column data with
//! an explicit [`TableSchema`]. Join-key columns hold [`KeyValue`]s; every
//! other column is numeric (`f64`, missing values as `NaN`).
//!
//! [`JoinKeyDomain`] enumerates the possible values of each join key and
//! defines the row axis shared by all sketches on those keys.

mod domain;
mod error;
mod schema;
mod table;

pub use domain::JoinKeyDomain;
pub use error::SchemaError;
pub use schema::{ColumnKind, ColumnMeta, KeyValue, TableSchema};
pub use table::{ColumnData, Table, TableBuilder};
