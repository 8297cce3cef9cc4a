//! Column schema types.
//!
//! Tables carry an explicit, ordered schema so that column presence and kind
//! are validated once, up front, instead of failing deep inside calibration.

use std::collections::HashMap;
use std::fmt;

use super::error::SchemaError;

/// A single join-key value.
///
/// Join keys are compared by equality only; ordering is used to keep
/// directories deterministic.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyValue {
    Int(i64),
    Text(String),
}

impl From<i64> for KeyValue {
    fn from(value: i64) -> Self {
        KeyValue::Int(value)
    }
}

impl From<i32> for KeyValue {
    fn from(value: i32) -> Self {
        KeyValue::Int(value as i64)
    }
}

impl From<&str> for KeyValue {
    fn from(value: &str) -> Self {
        KeyValue::Text(value.to_owned())
    }
}

impl From<String> for KeyValue {
    fn from(value: String) -> Self {
        KeyValue::Text(value)
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::Int(v) => write!(f, "{v}"),
            KeyValue::Text(v) => f.write_str(v),
        }
    }
}

/// Logical column kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ColumnKind {
    /// Join-key column holding [`KeyValue`]s.
    JoinKey,

    /// Numeric column stored as `f64`. Missing values are `f64::NAN`.
    #[default]
    Numeric,
}

impl ColumnKind {
    /// Returns true if this is a join-key column.
    #[inline]
    pub fn is_join_key(&self) -> bool {
        matches!(self, ColumnKind::JoinKey)
    }

    /// Returns true if this is a numeric column.
    #[inline]
    pub fn is_numeric(&self) -> bool {
        matches!(self, ColumnKind::Numeric)
    }
}

/// Metadata for a single column.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnMeta {
    pub name: String,
    pub kind: ColumnKind,
}

impl ColumnMeta {
    /// Create metadata for a join-key column.
    pub fn join_key(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ColumnKind::JoinKey,
        }
    }

    /// Create metadata for a numeric column.
    pub fn numeric(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ColumnKind::Numeric,
        }
    }
}

/// Ordered list of column descriptors with a name index.
#[derive(Clone, Debug, Default)]
pub struct TableSchema {
    columns: Vec<ColumnMeta>,
    name_index: HashMap<String, usize>,
}

impl TableSchema {
    /// Create an empty schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a schema from column metadata, rejecting duplicate names.
    pub fn from_columns(columns: Vec<ColumnMeta>) -> Result<Self, SchemaError> {
        let mut schema = Self::new();
        for meta in columns {
            schema.push(meta)?;
        }
        Ok(schema)
    }

    /// Number of columns.
    pub fn n_columns(&self) -> usize {
        self.columns.len()
    }

    /// Get column metadata by position.
    pub fn get(&self, index: usize) -> Option<&ColumnMeta> {
        self.columns.get(index)
    }

    /// Position of a column by name.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.name_index.get(name).copied()
    }

    /// Whether a column with this name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.name_index.contains_key(name)
    }

    /// Look up a column, failing with [`SchemaError::MissingColumn`].
    pub fn require(&self, name: &str) -> Result<(usize, &ColumnMeta), SchemaError> {
        self.index_of(name)
            .map(|i| (i, &self.columns[i]))
            .ok_or_else(|| SchemaError::MissingColumn(name.to_owned()))
    }

    /// Require a join-key column.
    pub fn require_join_key(&self, name: &str) -> Result<usize, SchemaError> {
        let (idx, meta) = self.require(name)?;
        if !meta.kind.is_join_key() {
            return Err(SchemaError::NotAJoinKey(name.to_owned()));
        }
        Ok(idx)
    }

    /// Require a numeric column.
    pub fn require_numeric(&self, name: &str) -> Result<usize, SchemaError> {
        let (idx, meta) = self.require(name)?;
        if !meta.kind.is_numeric() {
            return Err(SchemaError::NotNumeric(name.to_owned()));
        }
        Ok(idx)
    }

    /// Names of all numeric columns, in schema order.
    pub fn numeric_names(&self) -> impl Iterator<Item = &str> {
        self.columns
            .iter()
            .filter(|m| m.kind.is_numeric())
            .map(|m| m.name.as_str())
    }

    /// Names of all join-key columns, in schema order.
    pub fn key_names(&self) -> impl Iterator<Item = &str> {
        self.columns
            .iter()
            .filter(|m| m.kind.is_join_key())
            .map(|m| m.name.as_str())
    }

    /// Iterate over column metadata.
    pub fn iter(&self) -> impl Iterator<Item = &ColumnMeta> {
        self.columns.iter()
    }

    /// Append a column.
    pub fn push(&mut self, meta: ColumnMeta) -> Result<(), SchemaError> {
        if self.name_index.contains_key(&meta.name) {
            return Err(SchemaError::DuplicateColumn(meta.name));
        }
        self.name_index.insert(meta.name.clone(), self.columns.len());
        self.columns.push(meta);
        Ok(())
    }

    /// Rename a column in place. The new name must be free.
    pub(crate) fn rename(&mut self, index: usize, new_name: String) -> Result<(), SchemaError> {
        if self.name_index.contains_key(&new_name) {
            return Err(SchemaError::DuplicateColumn(new_name));
        }
        let old = std::mem::replace(&mut self.columns[index].name, new_name.clone());
        self.name_index.remove(&old);
        self.name_index.insert(new_name, index);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_kind_default_is_numeric() {
        assert_eq!(ColumnKind::default(), ColumnKind::Numeric);
        assert!(ColumnKind::JoinKey.is_join_key());
        assert!(!ColumnKind::JoinKey.is_numeric());
    }

    #[test]
    fn key_value_conversions() {
        assert_eq!(KeyValue::from(3), KeyValue::Int(3));
        assert_eq!(KeyValue::from("a"), KeyValue::Text("a".into()));
        assert_eq!(KeyValue::from(7i64).to_string(), "7");
    }

    #[test]
    fn schema_rejects_duplicates() {
        let result = TableSchema::from_columns(vec![
            ColumnMeta::numeric("x"),
            ColumnMeta::join_key("x"),
        ]);
        assert_eq!(result.unwrap_err(), SchemaError::DuplicateColumn("x".into()));
    }

    #[test]
    fn schema_require_checks_kind() {
        let schema = TableSchema::from_columns(vec![
            ColumnMeta::join_key("zip"),
            ColumnMeta::numeric("price"),
        ])
        .unwrap();

        assert_eq!(schema.require_join_key("zip"), Ok(0));
        assert_eq!(schema.require_numeric("price"), Ok(1));
        assert_eq!(
            schema.require_numeric("zip"),
            Err(SchemaError::NotNumeric("zip".into()))
        );
        assert_eq!(
            schema.require_join_key("price"),
            Err(SchemaError::NotAJoinKey("price".into()))
        );
        assert_eq!(
            schema.require_numeric("nope"),
            Err(SchemaError::MissingColumn("nope".into()))
        );
    }

    #[test]
    fn schema_names_by_kind() {
        let schema = TableSchema::from_columns(vec![
            ColumnMeta::numeric("a"),
            ColumnMeta::join_key("k"),
            ColumnMeta::numeric("b"),
        ])
        .unwrap();
        assert_eq!(schema.numeric_names().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(schema.key_names().collect::<Vec<_>>(), vec!["k"]);
    }

    #[test]
    fn schema_rename_updates_index() {
        let mut schema =
            TableSchema::from_columns(vec![ColumnMeta::numeric("a"), ColumnMeta::numeric("b")])
                .unwrap();
        schema.rename(0, "c".into()).unwrap();
        assert_eq!(schema.index_of("c"), Some(0));
        assert_eq!(schema.index_of("a"), None);
        assert!(schema.rename(1, "c".into()).is_err());
    }
}
