//! Join-key domains.
//!
//! A [`JoinKeyDomain`] fixes the row axis of every sketch built on a set of
//! join keys: the cartesian product of the per-key value lists, with the first
//! key varying slowest.

use std::collections::HashMap;

use super::error::SchemaError;
use super::schema::KeyValue;

#[derive(Debug, Clone)]
struct KeyValues {
    values: Vec<KeyValue>,
    positions: HashMap<KeyValue, usize>,
}

/// Mapping from join-key name to its ordered set of possible values.
///
/// # Example
///
/// ```
/// use joinsketch::data::{JoinKeyDomain, KeyValue};
///
/// let mut domain = JoinKeyDomain::new();
/// domain.insert("year", [2020, 2021]);
/// domain.insert("zip", ["a", "b", "c"]);
///
/// let keys = ["year".to_string(), "zip".to_string()];
/// assert_eq!(domain.size(&keys).unwrap(), 6);
///
/// let row = domain
///     .row_index(&keys, &[KeyValue::Int(2021), KeyValue::from("b")])
///     .unwrap();
/// assert_eq!(row, Some(4));
/// ```
#[derive(Debug, Clone, Default)]
pub struct JoinKeyDomain {
    keys: Vec<String>,
    values: HashMap<String, KeyValues>,
}

impl JoinKeyDomain {
    /// Create an empty domain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the ordered values of a join key. Duplicate values keep their
    /// first position.
    pub fn insert<K, I>(&mut self, key: impl Into<String>, values: I)
    where
        K: Into<KeyValue>,
        I: IntoIterator<Item = K>,
    {
        let key = key.into();
        let mut ordered = Vec::new();
        let mut positions = HashMap::new();
        for value in values.into_iter().map(Into::into) {
            if !positions.contains_key(&value) {
                positions.insert(value.clone(), ordered.len());
                ordered.push(value);
            }
        }
        if !self.values.contains_key(&key) {
            self.keys.push(key.clone());
        }
        self.values.insert(
            key,
            KeyValues {
                values: ordered,
                positions,
            },
        );
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with_key<K, I>(mut self, key: impl Into<String>, values: I) -> Self
    where
        K: Into<KeyValue>,
        I: IntoIterator<Item = K>,
    {
        self.insert(key, values);
        self
    }

    /// Join keys in insertion order.
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// Ordered values of one key.
    pub fn values(&self, key: &str) -> Result<&[KeyValue], SchemaError> {
        self.values
            .get(key)
            .map(|kv| kv.values.as_slice())
            .ok_or_else(|| SchemaError::UnknownDomain(key.to_owned()))
    }

    /// Number of rows in the cartesian product of the given keys.
    pub fn size<S: AsRef<str>>(&self, keys: &[S]) -> Result<usize, SchemaError> {
        keys.iter().try_fold(1usize, |acc, key| {
            Ok::<_, SchemaError>(acc * self.values(key.as_ref())?.len())
        })
    }

    /// Row of a key tuple on the cartesian axis of `keys`.
    ///
    /// Returns `Ok(None)` when some component is not part of its key's domain.
    pub fn row_index<S: AsRef<str>>(
        &self,
        keys: &[S],
        tuple: &[KeyValue],
    ) -> Result<Option<usize>, SchemaError> {
        debug_assert_eq!(keys.len(), tuple.len());
        let mut row = 0usize;
        for (key, value) in keys.iter().zip(tuple) {
            let kv = self
                .values
                .get(key.as_ref())
                .ok_or_else(|| SchemaError::UnknownDomain(key.as_ref().to_owned()))?;
            match kv.positions.get(value) {
                Some(&pos) => row = row * kv.values.len() + pos,
                None => return Ok(None),
            }
        }
        Ok(Some(row))
    }

    /// Restrict the domain to a subset of keys.
    pub fn restrict<S: AsRef<str>>(&self, keys: &[S]) -> Result<JoinKeyDomain, SchemaError> {
        let mut out = JoinKeyDomain::new();
        for key in keys {
            let values = self.values(key.as_ref())?;
            out.insert(key.as_ref(), values.iter().cloned());
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_is_product() {
        let domain = JoinKeyDomain::new()
            .with_key("a", [1, 2, 3])
            .with_key("b", ["x", "y"]);
        assert_eq!(domain.size(&["a", "b"]).unwrap(), 6);
        assert_eq!(domain.size(&["b"]).unwrap(), 2);
        assert_eq!(
            domain.size(&["c"]),
            Err(SchemaError::UnknownDomain("c".into()))
        );
    }

    #[test]
    fn row_index_first_key_slowest() {
        let domain = JoinKeyDomain::new()
            .with_key("a", [1, 2, 3])
            .with_key("b", ["x", "y"]);
        let keys = ["a", "b"];
        let idx = |a: i64, b: &str| {
            domain
                .row_index(&keys, &[KeyValue::Int(a), KeyValue::from(b)])
                .unwrap()
        };
        assert_eq!(idx(1, "x"), Some(0));
        assert_eq!(idx(1, "y"), Some(1));
        assert_eq!(idx(2, "x"), Some(2));
        assert_eq!(idx(3, "y"), Some(5));
        assert_eq!(idx(4, "y"), None);
    }

    #[test]
    fn duplicate_values_are_collapsed() {
        let domain = JoinKeyDomain::new().with_key("a", [1, 1, 2]);
        assert_eq!(domain.values("a").unwrap().len(), 2);
    }

    #[test]
    fn restrict_keeps_order() {
        let domain = JoinKeyDomain::new()
            .with_key("a", [1, 2])
            .with_key("b", [5, 6, 7]);
        let only_b = domain.restrict(&["b"]).unwrap();
        assert_eq!(only_b.keys(), &["b".to_string()]);
        assert_eq!(only_b.size(&["b"]).unwrap(), 3);
    }
}
