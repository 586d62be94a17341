//! Pointer lookups between tables.
//!
//! Every row of the keys table names a row of the indexed table through a pointer
//! column. The output row keeps the identity of the keys row and takes the values
//! of the row it points to, so it changes whenever either row does.

use crate::collection::{KeyedTable, MultiplicityPolicy};
use crate::dataflow::{ColumnId, IxPolicy};
use crate::delta::Delta;
use crate::operators::OpContext;
use hashbrown::HashMap;
use ripple_core::{Error, Key, Result, Row, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Column and policy of a lookup, plus the arity of the indexed table.
#[derive(Clone, Copy, Debug)]
pub struct IxSpec {
    pub column: ColumnId,
    pub policy: IxPolicy,
    pub arity: usize,
}

/// Both tables of a lookup and, per indexed identity, the keys rows pointing at it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IxState {
    targets: KeyedTable,
    refs: KeyedTable,
    referrers: HashMap<Key, BTreeSet<Key>>,
}

impl Default for IxState {
    fn default() -> Self {
        Self {
            targets: KeyedTable::new(MultiplicityPolicy::Bag),
            refs: KeyedTable::new(MultiplicityPolicy::Bag),
            referrers: HashMap::new(),
        }
    }
}

enum Lookup {
    Found(Row, i64),
    Skipped,
    Missing(String),
}

impl IxState {
    /// Returns the keys table.
    pub fn refs(&self) -> &KeyedTable {
        &self.refs
    }

    fn pointer(row: &Row, column: ColumnId) -> Option<Key> {
        row.get(column).and_then(Value::as_pointer)
    }

    fn lookup(&self, key: Key, spec: IxSpec) -> Lookup {
        let Some((row, m)) = self.refs.entry(key) else {
            return Lookup::Skipped;
        };
        let value = row.get(spec.column).cloned().unwrap_or(Value::Null);
        match (&value, spec.policy) {
            (Value::Null, IxPolicy::SkipMissing) => Lookup::Skipped,
            (Value::Null, IxPolicy::ForwardNone) => {
                Lookup::Found(Row::new(key, vec![Value::Null; spec.arity]), m)
            }
            (Value::Null, IxPolicy::FailMissing) => {
                Lookup::Missing(format!("row {key} has no pointer in column {}", spec.column))
            }
            (Value::Pointer(target), policy) => match self.targets.get(*target) {
                Some(found) => Lookup::Found(Row::new(key, found.values().to_vec()), m),
                None if policy == IxPolicy::SkipMissing => Lookup::Skipped,
                None => Lookup::Missing(format!("row {key} points to missing row {target}")),
            },
            (other, _) => Lookup::Missing(format!(
                "column {} of row {key} holds {other} instead of a pointer",
                spec.column
            )),
        }
    }

    fn unlink(&mut self, key: Key, column: ColumnId) {
        let Some(target) = self.refs.get(key).and_then(|row| Self::pointer(row, column)) else {
            return;
        };
        if let Some(keys) = self.referrers.get_mut(&target) {
            keys.remove(&key);
            if keys.is_empty() {
                self.referrers.remove(&target);
            }
        }
    }

    fn link(&mut self, key: Key, column: ColumnId) {
        if let Some(target) = self.refs.get(key).and_then(|row| Self::pointer(row, column)) {
            self.referrers.entry(target).or_default().insert(key);
        }
    }

    /// Applies both batches and emits the change of every lookup they touch.
    ///
    /// A lookup that cannot be resolved is reported once, when it is recomputed,
    /// and produces no row.
    pub(crate) fn process(
        &mut self,
        to_ix: &[Delta<Row>],
        keys: &[Delta<Row>],
        spec: IxSpec,
        ctx: &mut OpContext,
    ) -> Result<Vec<Delta<Row>>> {
        let mut touched: BTreeSet<Key> = keys.iter().map(|d| d.data.key()).collect();
        for d in to_ix {
            if let Some(referrers) = self.referrers.get(&d.data.key()) {
                touched.extend(referrers.iter().copied());
            }
        }
        let before: Vec<Option<(Row, i64)>> = touched
            .iter()
            .map(|&k| match self.lookup(k, spec) {
                Lookup::Found(row, m) => Some((row, m)),
                Lookup::Skipped | Lookup::Missing(_) => None,
            })
            .collect();

        for d in to_ix {
            self.targets
                .apply(d, ctx.time())
                .map_err(|e| ctx.invariant(e.to_string()))?;
        }
        let changed: BTreeSet<Key> = keys.iter().map(|d| d.data.key()).collect();
        for &key in &changed {
            self.unlink(key, spec.column);
        }
        for d in keys {
            self.refs
                .apply(d, ctx.time())
                .map_err(|e| ctx.invariant(e.to_string()))?;
        }
        for &key in &changed {
            self.link(key, spec.column);
        }

        let mut changes = Vec::new();
        for (&key, old) in touched.iter().zip(before) {
            let new = match self.lookup(key, spec) {
                Lookup::Found(row, m) => Some((row, m)),
                Lookup::Skipped => None,
                Lookup::Missing(message) => {
                    let row = self.refs.get(key).cloned();
                    let err = Error::data(ctx.operator(), ctx.time(), row.clone(), message);
                    ctx.report(row.as_ref(), err)?;
                    None
                }
            };
            if old == new {
                continue;
            }
            if let Some((row, m)) = old {
                changes.push(Delta::new(row, -m));
            }
            if let Some((row, m)) = new {
                changes.push(Delta::new(row, m));
            }
        }
        Ok(changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::consolidate_rows;
    use crate::evaluator::ErrorPolicy;
    use crate::operators::test_context;
    use ripple_core::{ErrorKind, Timestamp};

    fn target(id: u64, name: &str) -> Row {
        Row::new(id, vec![Value::from(name)])
    }

    fn reference(id: u64, to: Option<u64>) -> Row {
        let value = to.map_or(Value::Null, |t| Value::Pointer(Key(t)));
        Row::new(id, vec![value])
    }

    fn spec(policy: IxPolicy) -> IxSpec {
        IxSpec {
            column: 0,
            policy,
            arity: 1,
        }
    }

    #[test]
    fn test_lookup_follows_pointer_and_target_updates() {
        let mut state = IxState::default();
        let out = state
            .process(
                &[Delta::insert(target(1, "ada")), Delta::insert(target(2, "bob"))],
                &[Delta::insert(reference(10, Some(2)))],
                spec(IxPolicy::FailMissing),
                &mut test_context(),
            )
            .unwrap();
        assert_eq!(out, vec![Delta::insert(target(10, "bob"))]);

        // the referenced row changes
        let mut out = state
            .process(
                &[Delta::delete(target(2, "bob")), Delta::insert(target(2, "rob"))],
                &[],
                spec(IxPolicy::FailMissing),
                &mut test_context(),
            )
            .unwrap();
        consolidate_rows(&mut out);
        assert_eq!(out, vec![Delta::delete(target(10, "bob")), Delta::insert(target(10, "rob"))]);

        // the pointer moves
        let mut out = state
            .process(
                &[],
                &[Delta::delete(reference(10, Some(2))), Delta::insert(reference(10, Some(1)))],
                spec(IxPolicy::FailMissing),
                &mut test_context(),
            )
            .unwrap();
        consolidate_rows(&mut out);
        assert_eq!(out, vec![Delta::delete(target(10, "rob")), Delta::insert(target(10, "ada"))]);

        // the old target no longer affects the lookup
        let out = state
            .process(
                &[Delta::delete(target(2, "rob"))],
                &[],
                spec(IxPolicy::FailMissing),
                &mut test_context(),
            )
            .unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_missing_target_fails_or_routes() {
        let mut state = IxState::default();
        let err = state
            .process(
                &[],
                &[Delta::insert(reference(10, Some(7)))],
                spec(IxPolicy::FailMissing),
                &mut test_context(),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Data);

        let mut state = IxState::default();
        let mut ctx = OpContext::new("ix#2", Timestamp(1), ErrorPolicy::Route);
        let out = state
            .process(
                &[],
                &[Delta::insert(reference(10, Some(7)))],
                spec(IxPolicy::FailMissing),
                &mut ctx,
            )
            .unwrap();
        assert!(out.is_empty());
        assert_eq!(ctx.into_errors().len(), 1);

        // the target arriving later resolves the lookup
        let out = state
            .process(
                &[Delta::insert(target(7, "eve"))],
                &[],
                spec(IxPolicy::FailMissing),
                &mut test_context(),
            )
            .unwrap();
        assert_eq!(out, vec![Delta::insert(target(10, "eve"))]);
    }

    #[test]
    fn test_skip_and_forward_policies() {
        let refs = [
            Delta::insert(reference(10, None)),
            Delta::insert(reference(11, Some(9))),
            Delta::insert(reference(12, Some(1))),
        ];
        let targets = [Delta::insert(target(1, "ada"))];

        let mut state = IxState::default();
        let out = state
            .process(&targets, &refs, spec(IxPolicy::SkipMissing), &mut test_context())
            .unwrap();
        assert_eq!(out, vec![Delta::insert(target(12, "ada"))]);

        let mut state = IxState::default();
        let mut ctx = OpContext::new("ix#2", Timestamp(1), ErrorPolicy::Route);
        let out = state
            .process(&targets, &refs, spec(IxPolicy::ForwardNone), &mut ctx)
            .unwrap();
        assert_eq!(
            out,
            vec![
                Delta::insert(Row::new(10, vec![Value::Null])),
                Delta::insert(target(12, "ada")),
            ]
        );
        assert_eq!(ctx.into_errors().len(), 1);
    }

    #[test]
    fn test_non_pointer_value_is_a_data_error() {
        let mut state = IxState::default();
        let err = state
            .process(
                &[],
                &[Delta::insert(Row::new(10, vec![Value::Int64(3)]))],
                spec(IxPolicy::SkipMissing),
                &mut test_context(),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Data);
    }
}
