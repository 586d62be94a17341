//! Collections maintained by incremental operators.
//!
//! A [`ZSet`] is a multiset of rows with signed multiplicities; it is what a batch
//! of deltas accumulates into. A [`KeyedTable`] is the current content of a table
//! indexed by row identity, and it is where diffs are checked for consistency.

use crate::delta::Delta;
use hashbrown::hash_map::Entry;
use hashbrown::HashMap;
use ripple_core::{Error, Key, Result, Row, Timestamp};
use serde::{Deserialize, Serialize};

/// How repeated insertions of the same row are treated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MultiplicityPolicy {
    /// A row is either present or absent; inserting a present row is a no-op.
    #[default]
    Set,
    /// Rows carry a count; each insertion must be matched by a deletion.
    Bag,
}

/// A multiset of rows with signed multiplicities.
///
/// Entries whose multiplicity reaches zero are removed, so an empty `ZSet` is
/// exactly the zero collection.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZSet {
    data: HashMap<Row, i64>,
}

impl ZSet {
    /// Creates an empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a collection from a batch of deltas.
    pub fn from_deltas<'a>(deltas: impl IntoIterator<Item = &'a Delta<Row>>) -> Self {
        let mut set = Self::new();
        set.apply(deltas);
        set
    }

    /// Adds `diff` to the multiplicity of `row`.
    pub fn update(&mut self, row: Row, diff: i64) {
        if diff == 0 {
            return;
        }
        match self.data.entry(row) {
            Entry::Occupied(mut e) => {
                *e.get_mut() += diff;
                if *e.get() == 0 {
                    e.remove();
                }
            }
            Entry::Vacant(e) => {
                e.insert(diff);
            }
        }
    }

    /// Applies a batch of deltas.
    pub fn apply<'a>(&mut self, deltas: impl IntoIterator<Item = &'a Delta<Row>>) {
        for d in deltas {
            self.update(d.data.clone(), d.diff);
        }
    }

    /// Applies a batch of deltas with their signs flipped.
    pub fn retract<'a>(&mut self, deltas: impl IntoIterator<Item = &'a Delta<Row>>) {
        for d in deltas {
            self.update(d.data.clone(), -d.diff);
        }
    }

    /// Returns the multiplicity of a row.
    #[inline]
    pub fn get(&self, row: &Row) -> i64 {
        self.data.get(row).copied().unwrap_or(0)
    }

    /// Returns the number of distinct rows.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if every multiplicity is zero.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Sum of all multiplicities.
    pub fn weight(&self) -> i64 {
        self.data.values().sum()
    }

    /// Returns true if some multiplicity is negative.
    pub fn has_negative(&self) -> bool {
        self.data.values().any(|&m| m < 0)
    }

    /// Iterates over rows and their multiplicities in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (&Row, i64)> {
        self.data.iter().map(|(r, &m)| (r, m))
    }

    /// Returns the content as insertion deltas, in row order.
    pub fn to_deltas(&self) -> Vec<Delta<Row>> {
        let mut out: Vec<Delta<Row>> = self
            .data
            .iter()
            .map(|(r, &m)| Delta::new(r.clone(), m))
            .collect();
        out.sort_by(|a, b| a.data.cmp(&b.data));
        out
    }

    /// Returns `self - other` as a batch of deltas, in row order.
    pub fn difference(&self, other: &ZSet) -> Vec<Delta<Row>> {
        let mut out = Vec::new();
        for (row, &m) in &self.data {
            let diff = m - other.get(row);
            if diff != 0 {
                out.push(Delta::new(row.clone(), diff));
            }
        }
        for (row, &m) in &other.data {
            if !self.data.contains_key(row) {
                out.push(Delta::new(row.clone(), -m));
            }
        }
        out.sort_by(|a, b| a.data.cmp(&b.data));
        out
    }

    /// Removes every row.
    pub fn clear(&mut self) {
        self.data.clear();
    }
}

/// Current content of a table, indexed by row identity.
///
/// Each identity maps to exactly one row plus its multiplicity. Diffs are checked
/// against the stored content; a diff that does not match it is reported as an
/// inconsistent diff instead of being applied.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeyedTable {
    rows: HashMap<Key, (Row, i64)>,
    policy: MultiplicityPolicy,
}

impl KeyedTable {
    /// Creates an empty table with the given policy.
    pub fn new(policy: MultiplicityPolicy) -> Self {
        Self {
            rows: HashMap::new(),
            policy,
        }
    }

    /// Returns the multiplicity policy.
    #[inline]
    pub fn policy(&self) -> MultiplicityPolicy {
        self.policy
    }

    /// Returns the row stored under `key`.
    #[inline]
    pub fn get(&self, key: Key) -> Option<&Row> {
        self.rows.get(&key).map(|(r, _)| r)
    }

    /// Returns the row stored under `key` together with its multiplicity.
    #[inline]
    pub fn entry(&self, key: Key) -> Option<(&Row, i64)> {
        self.rows.get(&key).map(|(r, m)| (r, *m))
    }

    /// Returns the multiplicity of `key` (zero when absent).
    #[inline]
    pub fn multiplicity(&self, key: Key) -> i64 {
        self.rows.get(&key).map(|(_, m)| *m).unwrap_or(0)
    }

    /// Returns true if a row with this identity is present.
    #[inline]
    pub fn contains(&self, key: Key) -> bool {
        self.rows.contains_key(&key)
    }

    /// Returns the number of identities present.
    #[inline]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if the table holds no rows.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Iterates over rows in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (&Row, i64)> {
        self.rows.values().map(|(r, m)| (r, *m))
    }

    /// Returns rows sorted by identity.
    pub fn sorted_rows(&self) -> Vec<Row> {
        let mut rows: Vec<Row> = self.rows.values().map(|(r, _)| r.clone()).collect();
        rows.sort();
        rows
    }

    /// Applies a single diff, returning the change visible to readers of the table.
    ///
    /// Under [`MultiplicityPolicy::Set`] an insertion of a row that is already present
    /// with equal values is absorbed and returns `None`.
    pub fn apply(&mut self, delta: &Delta<Row>, time: Timestamp) -> Result<Option<Delta<Row>>> {
        let key = delta.data.key();
        if delta.diff == 0 {
            return Ok(None);
        }
        match self.rows.get_mut(&key) {
            Some((existing, mult)) => {
                if existing.values() != delta.data.values() {
                    return Err(Error::inconsistent_diff(
                        key,
                        time,
                        format!("row {} does not match stored row {}", delta.data, existing),
                    ));
                }
                let next = match self.policy {
                    MultiplicityPolicy::Set if delta.diff > 0 => return Ok(None),
                    MultiplicityPolicy::Set => 0,
                    MultiplicityPolicy::Bag => *mult + delta.diff,
                };
                if next < 0 {
                    return Err(Error::inconsistent_diff(
                        key,
                        time,
                        format!("deleting {} copies of a row stored {} times", -delta.diff, mult),
                    ));
                }
                let visible = next - *mult;
                if next == 0 {
                    self.rows.remove(&key);
                } else {
                    *mult = next;
                }
                Ok(Some(Delta::new(delta.data.clone(), visible)))
            }
            None if delta.diff > 0 => {
                let mult = match self.policy {
                    MultiplicityPolicy::Set => 1,
                    MultiplicityPolicy::Bag => delta.diff,
                };
                self.rows.insert(key, (delta.data.clone(), mult));
                Ok(Some(Delta::new(delta.data.clone(), mult)))
            }
            None => Err(Error::inconsistent_diff(
                key,
                time,
                format!("delete of absent row {}", delta.data),
            )),
        }
    }

    /// Replaces whatever is stored under the row's identity, returning the visible changes.
    pub fn upsert(&mut self, row: Row) -> Vec<Delta<Row>> {
        let key = row.key();
        match self.rows.insert(key, (row.clone(), 1)) {
            Some((old, _)) if old.values() == row.values() => Vec::new(),
            Some((old, mult)) => vec![Delta::new(old, -mult), Delta::insert(row)],
            None => vec![Delta::insert(row)],
        }
    }

    /// Removes whatever is stored under `key`, returning the visible change.
    pub fn remove(&mut self, key: Key) -> Option<Delta<Row>> {
        self.rows
            .remove(&key)
            .map(|(row, mult)| Delta::new(row, -mult))
    }
}
