//! In-memory table container and builder.
//!
//! This module provides [`Table`] and [`TableBuilder`].

use ndarray::{Array1, ArrayView1};

use super::error::SchemaError;
use super::schema::{ColumnMeta, KeyValue, TableSchema};

/// Storage for one column.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    Keys(Vec<KeyValue>),
    Numeric(Array1<f64>),
}

impl ColumnData {
    fn len(&self) -> usize {
        match self {
            ColumnData::Keys(v) => v.len(),
            ColumnData::Numeric(v) => v.len(),
        }
    }
}

/// A columnar table with join-key and numeric columns.
///
/// Column data is stored in schema order. All columns share one row count.
///
/// # Example
///
/// ```
/// use joinsketch::data::Table;
///
/// let table = Table::builder()
///     .key_column("zip", vec![1, 1, 2])
///     .numeric_column("price", vec![10.0, 12.0, 7.5])
///     .build()
///     .unwrap();
///
/// assert_eq!(table.n_rows(), 3);
/// assert_eq!(table.numeric("price").unwrap()[2], 7.5);
/// ```
#[derive(Debug, Clone)]
pub struct Table {
    schema: TableSchema,
    columns: Vec<ColumnData>,
    n_rows: usize,
}

impl Table {
    /// Create a builder.
    pub fn builder() -> TableBuilder {
        TableBuilder::new()
    }

    /// Number of rows.
    #[inline]
    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    /// The table schema.
    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    /// View of a numeric column.
    pub fn numeric(&self, name: &str) -> Result<ArrayView1<'_, f64>, SchemaError> {
        let idx = self.schema.require_numeric(name)?;
        match &self.columns[idx] {
            ColumnData::Numeric(values) => Ok(values.view()),
            ColumnData::Keys(_) => Err(SchemaError::NotNumeric(name.to_owned())),
        }
    }

    /// Values of a join-key column.
    pub fn keys(&self, name: &str) -> Result<&[KeyValue], SchemaError> {
        let idx = self.schema.require_join_key(name)?;
        match &self.columns[idx] {
            ColumnData::Keys(values) => Ok(values),
            ColumnData::Numeric(_) => Err(SchemaError::NotAJoinKey(name.to_owned())),
        }
    }

    /// Names of numeric columns not listed in `excluded`, in schema order.
    pub fn numeric_names_except(&self, excluded: &[&str]) -> Vec<String> {
        self.schema
            .numeric_names()
            .filter(|name| !excluded.contains(name))
            .map(str::to_owned)
            .collect()
    }

    /// Project onto the given columns, in the given order.
    pub fn select<S: AsRef<str>>(&self, names: &[S]) -> Result<Table, SchemaError> {
        let mut schema = TableSchema::new();
        let mut columns = Vec::with_capacity(names.len());
        for name in names {
            let (idx, meta) = self.schema.require(name.as_ref())?;
            schema.push(meta.clone())?;
            columns.push(self.columns[idx].clone());
        }
        Ok(Table {
            schema,
            columns,
            n_rows: self.n_rows,
        })
    }

    /// Append a numeric column, or replace it if one with the same name exists.
    pub fn with_numeric_column(
        mut self,
        name: impl Into<String>,
        values: Array1<f64>,
    ) -> Result<Table, SchemaError> {
        let name = name.into();
        if values.len() != self.n_rows {
            return Err(SchemaError::LengthMismatch {
                column: name,
                expected: self.n_rows,
                actual: values.len(),
            });
        }
        match self.schema.index_of(&name) {
            Some(idx) => {
                if !self.schema.get(idx).is_some_and(|m| m.kind.is_numeric()) {
                    return Err(SchemaError::NotNumeric(name));
                }
                self.columns[idx] = ColumnData::Numeric(values);
            }
            None => {
                self.schema.push(ColumnMeta::numeric(name))?;
                self.columns.push(ColumnData::Numeric(values));
            }
        }
        Ok(self)
    }

    /// Rename every numeric column with `f`, leaving join keys untouched.
    pub fn rename_numeric<F>(mut self, f: F) -> Result<Table, SchemaError>
    where
        F: Fn(&str) -> String,
    {
        for idx in 0..self.schema.n_columns() {
            let Some(meta) = self.schema.get(idx) else {
                continue;
            };
            if meta.kind.is_numeric() {
                let renamed = f(&meta.name);
                if renamed != meta.name {
                    self.schema.rename(idx, renamed)?;
                }
            }
        }
        Ok(self)
    }
}

/// Builder for [`Table`].
///
/// Length and name validation is deferred to [`TableBuilder::build`].
#[derive(Debug, Default)]
pub struct TableBuilder {
    metas: Vec<ColumnMeta>,
    columns: Vec<ColumnData>,
}

impl TableBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a join-key column.
    pub fn key_column<K, I>(mut self, name: impl Into<String>, values: I) -> Self
    where
        K: Into<KeyValue>,
        I: IntoIterator<Item = K>,
    {
        self.metas.push(ColumnMeta::join_key(name));
        self.columns
            .push(ColumnData::Keys(values.into_iter().map(Into::into).collect()));
        self
    }

    /// Add a numeric column.
    pub fn numeric_column(mut self, name: impl Into<String>, values: Vec<f64>) -> Self {
        self.metas.push(ColumnMeta::numeric(name));
        self.columns.push(ColumnData::Numeric(Array1::from(values)));
        self
    }

    /// Validate and build the table.
    pub fn build(self) -> Result<Table, SchemaError> {
        let n_rows = self.columns.first().map_or(0, ColumnData::len);
        for (meta, column) in self.metas.iter().zip(&self.columns) {
            if column.len() != n_rows {
                return Err(SchemaError::LengthMismatch {
                    column: meta.name.clone(),
                    expected: n_rows,
                    actual: column.len(),
                });
            }
        }
        let schema = TableSchema::from_columns(self.metas)?;
        Ok(Table {
            schema,
            columns: self.columns,
            n_rows,
        })
    }
}
