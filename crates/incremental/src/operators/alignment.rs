//! Operators combining tables row by row through their identities.
//!
//! Restrict, UpdateRows, Zip, Subtract and Intersect keep their inputs as keyed
//! tables and recompute the output of every identity touched by a commit, emitting
//! the difference between its output before and after. Concat passes rows through and only tracks which
//! input owns each identity.

use crate::collection::{KeyedTable, MultiplicityPolicy};
use crate::delta::Delta;
use crate::operators::OpContext;
use hashbrown::HashMap;
use ripple_core::{Error, Key, Result, Row, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Identity ownership for a concat node.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ConcatState {
    /// Identity -> (input index, multiplicity)
    owners: HashMap<Key, (usize, i64)>,
}

/// Unions the changes of all inputs.
///
/// Retractions are processed before insertions so that moving an identity from one
/// input to another inside a single commit is not mistaken for a collision.
pub(crate) fn concat_incremental(
    state: &mut ConcatState,
    inputs: &[&[Delta<Row>]],
    ctx: &mut OpContext,
) -> Result<Vec<Delta<Row>>> {
    let mut output = Vec::new();
    for retractions in [true, false] {
        for (index, batch) in inputs.iter().enumerate() {
            for d in batch.iter().filter(|d| d.is_delete() == retractions) {
                let key = d.data.key();
                match state.owners.get_mut(&key) {
                    Some((owner, _)) if *owner != index => {
                        let err = Error::data(
                            ctx.operator(),
                            ctx.time(),
                            Some(d.data.clone()),
                            format!("identity {key} is produced by inputs {owner} and {index}"),
                        );
                        ctx.report(Some(&d.data), err)?;
                        continue;
                    }
                    Some((_, count)) => {
                        *count += d.diff;
                        if *count < 0 {
                            return Err(ctx.invariant(format!("over-retraction of {key}")));
                        }
                        if *count == 0 {
                            state.owners.remove(&key);
                        }
                    }
                    None if d.diff > 0 => {
                        state.owners.insert(key, (index, d.diff));
                    }
                    None => return Err(ctx.invariant(format!("retraction of unknown {key}"))),
                }
                output.push(d.clone());
            }
        }
    }
    Ok(output)
}

/// Both inputs of a row-aligned binary operator, keyed by identity.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PairState {
    left: KeyedTable,
    right: KeyedTable,
}

impl Default for PairState {
    fn default() -> Self {
        Self {
            left: KeyedTable::new(MultiplicityPolicy::Bag),
            right: KeyedTable::new(MultiplicityPolicy::Bag),
        }
    }
}

impl PairState {
    /// Returns the left input table.
    pub fn left(&self) -> &KeyedTable {
        &self.left
    }

    /// Returns the right input table.
    pub fn right(&self) -> &KeyedTable {
        &self.right
    }

    /// Applies both batches and emits, per touched identity, the change of
    /// `output(state, key)`.
    fn recompute<F>(
        &mut self,
        left: &[Delta<Row>],
        right: &[Delta<Row>],
        ctx: &OpContext,
        output: F,
    ) -> Result<(Vec<Delta<Row>>, BTreeSet<Key>)>
    where
        F: Fn(&PairState, Key) -> Option<(Row, i64)>,
    {
        let touched: BTreeSet<Key> = left
            .iter()
            .chain(right)
            .map(|d| d.data.key())
            .collect();
        let before: Vec<Option<(Row, i64)>> = touched.iter().map(|&k| output(self, k)).collect();
        for d in left {
            self.left
                .apply(d, ctx.time())
                .map_err(|e| ctx.invariant(e.to_string()))?;
        }
        for d in right {
            self.right
                .apply(d, ctx.time())
                .map_err(|e| ctx.invariant(e.to_string()))?;
        }
        let mut changes = Vec::new();
        for (&key, old) in touched.iter().zip(before) {
            let new = output(self, key);
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
        Ok((changes, touched))
    }
}

/// Keeps rows of `input` whose identity is present in `universe`.
pub(crate) fn restrict_incremental(
    state: &mut PairState,
    input: &[Delta<Row>],
    universe: &[Delta<Row>],
    ctx: &OpContext,
) -> Result<Vec<Delta<Row>>> {
    let (changes, touched) = state.recompute(input, universe, ctx, |s, key| {
        if s.right.contains(key) {
            s.left.entry(key).map(|(row, m)| (row.clone(), m))
        } else {
            None
        }
    })?;
    if let Some(key) = touched
        .iter()
        .find(|&&k| state.right.contains(k) && !state.left.contains(k))
    {
        return Err(ctx.invariant(format!(
            "identity {key} of the restricting table is missing from the input"
        )));
    }
    Ok(changes)
}

/// Rows of `base`, overridden by rows of `updates` with the same identity.
pub(crate) fn update_rows_incremental(
    state: &mut PairState,
    base: &[Delta<Row>],
    updates: &[Delta<Row>],
    ctx: &OpContext,
) -> Result<Vec<Delta<Row>>> {
    let (changes, _) = state.recompute(base, updates, ctx, |s, key| {
        s.right
            .entry(key)
            .or_else(|| s.left.entry(key))
            .map(|(row, m)| (row.clone(), m))
    })?;
    Ok(changes)
}

/// Concatenates the values of rows sharing an identity.
pub(crate) fn zip_incremental(
    state: &mut PairState,
    left: &[Delta<Row>],
    right: &[Delta<Row>],
    ctx: &OpContext,
) -> Result<Vec<Delta<Row>>> {
    let (changes, touched) = state.recompute(left, right, ctx, |s, key| {
        let (l, m) = s.left.entry(key)?;
        let r = s.right.get(key)?;
        let mut values: Vec<Value> = Vec::with_capacity(l.len() + r.len());
        values.extend_from_slice(l.values());
        values.extend_from_slice(r.values());
        Some((Row::new(key, values), m))
    })?;
    if let Some(key) = touched
        .iter()
        .find(|&&k| state.left.contains(k) != state.right.contains(k))
    {
        return Err(ctx.invariant(format!(
            "identity {key} is present on only one side of a zip"
        )));
    }
    Ok(changes)
}

/// Rows of `left` whose identity is absent from `right`.
pub(crate) fn subtract_incremental(
    state: &mut PairState,
    left: &[Delta<Row>],
    right: &[Delta<Row>],
    ctx: &OpContext,
) -> Result<Vec<Delta<Row>>> {
    let (changes, _) = state.recompute(left, right, ctx, |s, key| {
        if s.right.contains(key) {
            None
        } else {
            s.left.entry(key).map(|(row, m)| (row.clone(), m))
        }
    })?;
    Ok(changes)
}

/// The first input of an intersection and the identities of the others.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IntersectState {
    input: KeyedTable,
    others: Vec<KeyedTable>,
}

impl Default for IntersectState {
    fn default() -> Self {
        Self {
            input: KeyedTable::new(MultiplicityPolicy::Bag),
            others: Vec::new(),
        }
    }
}

impl IntersectState {
    fn output(&self, key: Key) -> Option<(Row, i64)> {
        if self.others.iter().all(|t| t.contains(key)) {
            self.input.entry(key).map(|(row, m)| (row.clone(), m))
        } else {
            None
        }
    }
}

/// Rows of `inputs[0]` whose identity is present in every other input.
pub(crate) fn intersect_incremental(
    state: &mut IntersectState,
    inputs: &[&[Delta<Row>]],
    ctx: &OpContext,
) -> Result<Vec<Delta<Row>>> {
    let Some((first, rest)) = inputs.split_first() else {
        return Ok(Vec::new());
    };
    while state.others.len() < rest.len() {
        state.others.push(KeyedTable::new(MultiplicityPolicy::Bag));
    }
    let touched: BTreeSet<Key> = inputs
        .iter()
        .flat_map(|batch| batch.iter().map(|d| d.data.key()))
        .collect();
    let before: Vec<Option<(Row, i64)>> = touched.iter().map(|&k| state.output(k)).collect();
    for d in *first {
        state
            .input
            .apply(d, ctx.time())
            .map_err(|e| ctx.invariant(e.to_string()))?;
    }
    for (table, batch) in state.others.iter_mut().zip(rest) {
        for d in *batch {
            table
                .apply(d, ctx.time())
                .map_err(|e| ctx.invariant(e.to_string()))?;
        }
    }
    let mut changes = Vec::new();
    for (&key, old) in touched.iter().zip(before) {
        let new = state.output(key);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::consolidate_rows;
    use crate::evaluator::ErrorPolicy;
    use crate::operators::test_context;
    use ripple_core::{ErrorKind, Timestamp};

    fn row(id: u64, v: i64) -> Row {
        Row::new(id, vec![Value::Int64(v)])
    }

    #[test]
    fn test_concat_passes_disjoint_inputs() {
        let mut state = ConcatState::default();
        let a = vec![Delta::insert(row(1, 1))];
        let b = vec![Delta::insert(row(2, 2))];
        let out = concat_incremental(&mut state, &[&a[..], &b[..]], &mut test_context()).unwrap();
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_concat_rejects_colliding_identity() {
        let mut state = ConcatState::default();
        let a = vec![Delta::insert(row(1, 1))];
        let b = vec![Delta::insert(row(1, 2))];
        let err = concat_incremental(&mut state, &[&a[..], &b[..]], &mut test_context()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Data);

        let mut state = ConcatState::default();
        let mut ctx = OpContext::new("concat#3", Timestamp(1), ErrorPolicy::Route);
        let out = concat_incremental(&mut state, &[&a[..], &b[..]], &mut ctx).unwrap();
        assert_eq!(out, a);
        assert_eq!(ctx.into_errors().len(), 1);
    }

    #[test]
    fn test_concat_allows_moving_identity_between_inputs() {
        let mut state = ConcatState::default();
        let a = vec![Delta::insert(row(1, 1))];
        concat_incremental(&mut state, &[&a[..], &[]], &mut test_context()).unwrap();
        let a = vec![Delta::delete(row(1, 1))];
        let b = vec![Delta::insert(row(1, 2))];
        let out = concat_incremental(&mut state, &[&a[..], &b[..]], &mut test_context()).unwrap();
        assert_eq!(out, vec![Delta::delete(row(1, 1)), Delta::insert(row(1, 2))]);
    }

    #[test]
    fn test_restrict_follows_universe() {
        let mut state = PairState::default();
        let input = vec![Delta::insert(row(1, 10)), Delta::insert(row(2, 20))];
        let universe = vec![Delta::insert(row(2, 0))];
        let out = restrict_incremental(&mut state, &input, &universe, &test_context()).unwrap();
        assert_eq!(out, vec![Delta::insert(row(2, 20))]);

        let out = restrict_incremental(
            &mut state,
            &[],
            &[Delta::insert(row(1, 0))],
            &test_context(),
        )
        .unwrap();
        assert_eq!(out, vec![Delta::insert(row(1, 10))]);
    }

    #[test]
    fn test_restrict_detects_broken_subset_promise() {
        let mut state = PairState::default();
        let err = restrict_incremental(
            &mut state,
            &[],
            &[Delta::insert(row(9, 0))],
            &test_context(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invariant);
    }

    #[test]
    fn test_update_rows_prefers_updates() {
        let mut state = PairState::default();
        let out = update_rows_incremental(
            &mut state,
            &[Delta::insert(row(1, 10)), Delta::insert(row(2, 20))],
            &[Delta::insert(row(2, 99))],
            &test_context(),
        )
        .unwrap();
        let mut out = out;
        consolidate_rows(&mut out);
        assert_eq!(out, vec![Delta::insert(row(1, 10)), Delta::insert(row(2, 99))]);

        let mut out = update_rows_incremental(
            &mut state,
            &[],
            &[Delta::delete(row(2, 99))],
            &test_context(),
        )
        .unwrap();
        consolidate_rows(&mut out);
        assert_eq!(out, vec![Delta::delete(row(2, 99)), Delta::insert(row(2, 20))]);
    }

    #[test]
    fn test_zip_aligns_rows() {
        let mut state = PairState::default();
        let out = zip_incremental(
            &mut state,
            &[Delta::insert(row(1, 10))],
            &[Delta::insert(row(1, 11))],
            &test_context(),
        )
        .unwrap();
        assert_eq!(
            out,
            vec![Delta::insert(Row::new(1, vec![Value::Int64(10), Value::Int64(11)]))]
        );

        let err = zip_incremental(
            &mut state,
            &[Delta::insert(row(2, 20))],
            &[],
            &test_context(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invariant);
    }

    #[test]
    fn test_subtract_removes_matching_identities() {
        let mut state = PairState::default();
        let out = subtract_incremental(
            &mut state,
            &[Delta::insert(row(1, 10)), Delta::insert(row(2, 20))],
            &[Delta::insert(row(2, 0))],
            &test_context(),
        )
        .unwrap();
        assert_eq!(out, vec![Delta::insert(row(1, 10))]);

        // the right side losing an identity brings the left row back
        let out = subtract_incremental(
            &mut state,
            &[],
            &[Delta::delete(row(2, 0)), Delta::insert(row(1, 0))],
            &test_context(),
        )
        .unwrap();
        assert_eq!(out, vec![Delta::delete(row(1, 10)), Delta::insert(row(2, 20))]);
    }

    #[test]
    fn test_intersect_needs_every_input() {
        let mut state = IntersectState::default();
        let input = vec![Delta::insert(row(1, 10)), Delta::insert(row(2, 20))];
        let b = vec![Delta::insert(row(1, 0)), Delta::insert(row(2, 0))];
        let c = vec![Delta::insert(row(2, 0))];
        let out = intersect_incremental(&mut state, &[&input[..], &b[..], &c[..]], &test_context())
            .unwrap();
        assert_eq!(out, vec![Delta::insert(row(2, 20))]);

        let b = vec![Delta::delete(row(2, 0))];
        let c = vec![Delta::insert(row(1, 0))];
        let out = intersect_incremental(&mut state, &[&[], &b[..], &c[..]], &test_context())
            .unwrap();
        assert_eq!(out, vec![Delta::insert(row(1, 10)), Delta::delete(row(2, 20))]);

        let input = vec![Delta::delete(row(1, 10)), Delta::insert(row(1, 11))];
        let mut out =
            intersect_incremental(&mut state, &[&input[..], &[], &[]], &test_context()).unwrap();
        consolidate_rows(&mut out);
        assert_eq!(out, vec![Delta::delete(row(1, 10)), Delta::insert(row(1, 11))]);
    }
}
