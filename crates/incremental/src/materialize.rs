//! Materialized views over output streams.
//!
//! A [`MaterializedView`] folds the deltas delivered for an output into the current
//! table. Sinks and tests use it to observe a derived table as of the last commit
//! applied.

use crate::collection::{KeyedTable, MultiplicityPolicy};
use crate::delta::Delta;
use ripple_core::{Error, Key, Result, Row, Timestamp};

/// A table maintained from a stream of committed deltas.
#[derive(Clone, Debug)]
pub struct MaterializedView {
    table: KeyedTable,
    time: Timestamp,
}

impl Default for MaterializedView {
    fn default() -> Self {
        Self::new()
    }
}

impl MaterializedView {
    /// Creates an empty view.
    pub fn new() -> Self {
        Self {
            table: KeyedTable::new(MultiplicityPolicy::Bag),
            time: Timestamp::ZERO,
        }
    }

    /// Creates a view holding `initial` as of `time`.
    pub fn with_initial(initial: Vec<Row>, time: Timestamp) -> Result<Self> {
        let mut view = Self::new();
        let deltas: Vec<Delta<Row>> = initial.into_iter().map(Delta::insert).collect();
        view.apply(time, &deltas)?;
        Ok(view)
    }

    /// Applies the deltas of one commit.
    ///
    /// Commits must arrive in increasing time order; a delta that does not match the
    /// current table is an inconsistent diff.
    pub fn apply(&mut self, time: Timestamp, deltas: &[Delta<Row>]) -> Result<()> {
        if time < self.time {
            return Err(Error::coordinator(format!(
                "commit {time} delivered after {}",
                self.time
            )));
        }
        for delta in deltas {
            self.table.apply(delta, time)?;
        }
        self.time = time;
        Ok(())
    }

    /// Returns the time of the last applied commit.
    #[inline]
    pub fn time(&self) -> Timestamp {
        self.time
    }

    /// Returns the row with the given identity.
    #[inline]
    pub fn get(&self, key: Key) -> Option<&Row> {
        self.table.get(key)
    }

    /// Returns the multiplicity of an identity.
    #[inline]
    pub fn multiplicity(&self, key: Key) -> i64 {
        self.table.multiplicity(key)
    }

    /// Returns the rows ordered by identity.
    pub fn rows(&self) -> Vec<Row> {
        self.table.sorted_rows()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Removes every row, keeping the time.
    pub fn clear(&mut self) {
        self.table = KeyedTable::new(MultiplicityPolicy::Bag);
    }
}
