//! Delta type for incremental computation.
//!
//! A Delta represents a change to a data item, with a diff value indicating
//! whether it's an insertion (+1) or deletion (-1). Larger magnitudes stand for
//! repeated insertions or deletions of the same item.

use ripple_core::{Error, Result, Row, Timestamp};
use serde::{Deserialize, Serialize};

/// A differential change to a data item.
///
/// The `diff` field indicates the multiplicity of the change:
/// - `+1` means insertion
/// - `-1` means deletion
/// - Other values can represent multiple insertions/deletions
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Delta<T> {
    /// The data being changed
    pub data: T,
    /// The differential: +1 for insert, -1 for delete
    pub diff: i64,
}

impl<T> Delta<T> {
    /// Creates a new delta with the given data and diff.
    #[inline]
    pub fn new(data: T, diff: i64) -> Self {
        Self { data, diff }
    }

    /// Creates an insertion delta (+1).
    #[inline]
    pub fn insert(data: T) -> Self {
        Self { data, diff: 1 }
    }

    /// Creates a deletion delta (-1).
    #[inline]
    pub fn delete(data: T) -> Self {
        Self { data, diff: -1 }
    }

    /// Returns true if this is an insertion (diff > 0).
    #[inline]
    pub fn is_insert(&self) -> bool {
        self.diff > 0
    }

    /// Returns true if this is a deletion (diff < 0).
    #[inline]
    pub fn is_delete(&self) -> bool {
        self.diff < 0
    }

    /// Returns true if this delta has no effect (diff == 0).
    #[inline]
    pub fn is_noop(&self) -> bool {
        self.diff == 0
    }

    /// Maps the data to a new type.
    #[inline]
    pub fn map<U, F>(self, f: F) -> Delta<U>
    where
        F: FnOnce(T) -> U,
    {
        Delta {
            data: f(self.data),
            diff: self.diff,
        }
    }

    /// Negates the diff (turns insert into delete and vice versa).
    #[inline]
    pub fn negate(self) -> Self {
        Self {
            data: self.data,
            diff: -self.diff,
        }
    }

    /// Attaches a commit time.
    #[inline]
    pub fn at(self, time: Timestamp) -> Update<T> {
        Update {
            data: self.data,
            time,
            diff: self.diff,
        }
    }
}

impl<T: PartialEq> Delta<T> {
    /// Merges two deltas of the same item by summing their multiplicities.
    ///
    /// Returns `Ok(None)` when the changes cancel out.
    pub fn combine(self, other: Delta<T>) -> Result<Option<Delta<T>>> {
        if self.data != other.data {
            return Err(Error::invariant(
                "delta",
                Timestamp::ZERO,
                "cannot combine deltas of different rows",
            ));
        }
        let diff = self.diff + other.diff;
        Ok((diff != 0).then(|| Delta::new(self.data, diff)))
    }
}

impl<T: Clone> Delta<T> {
    /// Creates a negated copy of this delta.
    #[inline]
    pub fn negated(&self) -> Self {
        Self {
            data: self.data.clone(),
            diff: -self.diff,
        }
    }
}

/// A delta stamped with the commit that produced it, as handed to sinks.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Update<T> {
    /// The data being changed
    pub data: T,
    /// Commit time
    pub time: Timestamp,
    /// Signed multiplicity
    pub diff: i64,
}

impl<T: PartialEq> Update<T> {
    /// Merges two updates of the same item at the same time.
    pub fn combine(self, other: Update<T>) -> Result<Option<Update<T>>> {
        if self.time != other.time {
            return Err(Error::invariant(
                "delta",
                self.time,
                "cannot combine updates from different commits",
            ));
        }
        let time = self.time;
        Ok(Delta::new(self.data, self.diff)
            .combine(Delta::new(other.data, other.diff))?
            .map(|d| d.at(time)))
    }
}

/// A batch of deltas.
pub type DeltaBatch<T> = Vec<Delta<T>>;

/// Extension trait for working with delta batches.
pub trait DeltaBatchExt<T> {
    /// Filters out no-op deltas (diff == 0).
    fn compact(self) -> Self;

    /// Returns the net effect count (sum of all diffs).
    fn net_count(&self) -> i64;

    /// Negates every delta in the batch.
    fn negate_all(self) -> Self;
}

impl<T> DeltaBatchExt<T> for DeltaBatch<T> {
    fn compact(self) -> Self {
        self.into_iter().filter(|d| d.diff != 0).collect()
    }

    fn net_count(&self) -> i64 {
        self.iter().map(|d| d.diff).sum()
    }

    fn negate_all(self) -> Self {
        self.into_iter().map(Delta::negate).collect()
    }
}

/// Merges equal items and drops those whose multiplicities cancel out.
///
/// The result is sorted by item.
pub fn consolidate<T: Ord>(batch: &mut Vec<Delta<T>>) {
    if batch.len() <= 1 {
        batch.retain(|d| d.diff != 0);
        return;
    }
    batch.sort_by(|a, b| a.data.cmp(&b.data));
    let mut out: Vec<Delta<T>> = Vec::with_capacity(batch.len());
    for delta in batch.drain(..) {
        match out.last_mut() {
            Some(last) if last.data == delta.data => last.diff += delta.diff,
            _ => {
                if out.last().is_some_and(|l| l.diff == 0) {
                    out.pop();
                }
                out.push(delta);
            }
        }
    }
    out.retain(|d| d.diff != 0);
    *batch = out;
}

/// Consolidates a row batch into canonical order: by identity, deletions before
/// insertions, then by values.
///
/// Every operator output and every sink delivery goes through this, which makes the
/// order of diffs inside a commit independent of hashing and scheduling.
pub fn consolidate_rows(batch: &mut Vec<Delta<Row>>) {
    consolidate(batch);
    // Stable: rows with equal key and sign keep their value order.
    batch.sort_by(|a, b| {
        a.data
            .key()
            .cmp(&b.data.key())
            .then(a.diff.signum().cmp(&b.diff.signum()))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use ripple_core::Value;

    fn row(id: u64, v: i64) -> Row {
        Row::new(id, vec![Value::Int64(v)])
    }

    #[test]
    fn test_delta_insert() {
        let d = Delta::insert(42);
        assert!(d.is_insert());
        assert!(!d.is_delete());
        assert!(!d.is_noop());
        assert_eq!(d.diff, 1);
        assert_eq!(d.data, 42);
    }

    #[test]
    fn test_delta_delete() {
        let d = Delta::delete(42);
        assert!(!d.is_insert());
        assert!(d.is_delete());
        assert_eq!(d.diff, -1);
    }

    #[test]
    fn test_delta_negate() {
        let neg = Delta::insert(42).negate();
        assert!(neg.is_delete());
        assert_eq!(neg.data, 42);
    }

    #[test]
    fn test_delta_combine_sums_and_elides_zero() {
        let merged = Delta::new(7, 2).combine(Delta::new(7, 1)).unwrap();
        assert_eq!(merged, Some(Delta::new(7, 3)));

        let cancelled = Delta::insert(7).combine(Delta::delete(7)).unwrap();
        assert_eq!(cancelled, None);
    }

    #[test]
    fn test_delta_combine_rejects_different_items() {
        assert!(Delta::insert(1).combine(Delta::insert(2)).is_err());
    }

    #[test]
    fn test_update_combine_requires_same_time() {
        let a = Delta::insert(1).at(Timestamp(1));
        let b = Delta::insert(1).at(Timestamp(2));
        assert!(a.clone().combine(b).is_err());
        let c = Delta::insert(1).at(Timestamp(1));
        assert_eq!(a.combine(c).unwrap(), Some(Delta::new(1, 2).at(Timestamp(1))));
    }

    #[test]
    fn test_delta_batch_compact() {
        let batch: DeltaBatch<i32> = vec![Delta::insert(1), Delta::new(2, 0), Delta::delete(3)];
        assert_eq!(batch.compact().len(), 2);
    }

    #[test]
    fn test_delta_batch_net_count() {
        let batch: DeltaBatch<i32> = vec![Delta::insert(1), Delta::insert(2), Delta::delete(3)];
        assert_eq!(batch.net_count(), 1);
    }

    #[test]
    fn test_consolidate_merges_and_cancels() {
        let mut batch = vec![
            Delta::insert(3),
            Delta::insert(1),
            Delta::delete(3),
            Delta::insert(1),
            Delta::new(2, 0),
        ];
        consolidate(&mut batch);
        assert_eq!(batch, vec![Delta::new(1, 2)]);
    }

    #[test]
    fn test_consolidate_rows_puts_deletions_first() {
        let mut batch = vec![Delta::insert(row(1, 8)), Delta::delete(row(1, 10))];
        consolidate_rows(&mut batch);
        assert_eq!(batch, vec![Delta::delete(row(1, 10)), Delta::insert(row(1, 8))]);
    }

    #[test]
    fn test_consolidate_rows_orders_by_identity() {
        let mut batch = vec![Delta::insert(row(2, 1)), Delta::insert(row(1, 5))];
        consolidate_rows(&mut batch);
        assert_eq!(batch[0].data.key().value(), 1);
        assert_eq!(batch[1].data.key().value(), 2);
    }
}
