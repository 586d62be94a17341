//! Row structure for Ripple.
//!
//! A `Row` is an immutable tuple of values plus a stable identity. Rows are created
//! by source operators and shared by reference among downstream operators: cloning
//! a row only bumps a reference count.

use crate::key::Key;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A row of a table.
///
/// Equality and ordering compare identity first, then values. Use
/// [`Row::same_identity`] when only identity matters (update detection).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Row {
    /// Stable identity of this row.
    key: Key,
    /// Values stored in this row, indexed by column position.
    values: Arc<[Value]>,
}

impl Row {
    /// Creates a row with a connector-assigned identity.
    pub fn new(key: impl Into<Key>, values: Vec<Value>) -> Self {
        Self {
            key: key.into(),
            values: values.into(),
        }
    }

    /// Creates a row whose identity is derived from its content.
    pub fn from_values(values: Vec<Value>) -> Self {
        let key = Key::for_values(&values);
        Self::new(key, values)
    }

    /// Creates a row sharing an existing value buffer.
    pub fn with_shared(key: Key, values: Arc<[Value]>) -> Self {
        Self { key, values }
    }

    /// Returns the row identity.
    #[inline]
    pub fn key(&self) -> Key {
        self.key
    }

    /// Returns a reference to the values.
    #[inline]
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Returns the shared value buffer.
    #[inline]
    pub fn shared_values(&self) -> &Arc<[Value]> {
        &self.values
    }

    /// Gets a value at the given column index.
    #[inline]
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Returns the values at the given column indices, `Null` for out-of-range columns.
    pub fn project(&self, columns: &[usize]) -> Vec<Value> {
        columns
            .iter()
            .map(|&c| self.values.get(c).cloned().unwrap_or(Value::Null))
            .collect()
    }

    /// Returns a row with the same values under a different identity.
    pub fn rekeyed(&self, key: Key) -> Row {
        Row::with_shared(key, self.values.clone())
    }

    /// Returns the number of values in this row.
    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if this row has no values.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Returns true if both rows carry the same identity, regardless of values.
    #[inline]
    pub fn same_identity(&self, other: &Row) -> bool {
        self.key == other.key
    }
}

impl core::fmt::Display for Row {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{} [", self.key)?;
        for (i, v) in self.values.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{v}")?;
        }
        f.write_str("]")
    }
}
