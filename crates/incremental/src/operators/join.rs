//! Incremental hash join operator.
//!
//! Both sides are indexed by join key. For a commit with left changes `ΔL` and right
//! changes `ΔR` the inner join changes by `ΔL ⋈ R + L' ⋈ ΔR`, where `L'` is the left
//! side after applying `ΔL`. Outer joins additionally track, per touched key, whether
//! the other side was empty before and after the commit, and retract or emit the
//! null-padded rows accordingly.

use crate::collection::ZSet;
use crate::dataflow::{ColumnId, JoinType};
use crate::delta::Delta;
use crate::operators::OpContext;
use hashbrown::HashMap;
use ripple_core::{Key, Result, Row, Value};
use serde::{Deserialize, Serialize};

/// Shape of a join node.
#[derive(Clone, Copy, Debug)]
pub struct JoinSpec<'a> {
    pub left_on: &'a [ColumnId],
    pub right_on: &'a [ColumnId],
    pub join_type: JoinType,
    pub left_arity: usize,
    pub right_arity: usize,
}

/// State for incremental join operations.
///
/// Each side maps a join key to the rows holding it, with multiplicities.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct JoinState {
    left_index: HashMap<Vec<Value>, ZSet>,
    right_index: HashMap<Vec<Value>, ZSet>,
}

impl JoinState {
    /// Creates an empty join state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct rows indexed on the left.
    pub fn left_count(&self) -> usize {
        self.left_index.values().map(ZSet::len).sum()
    }

    /// Number of distinct rows indexed on the right.
    pub fn right_count(&self) -> usize {
        self.right_index.values().map(ZSet::len).sum()
    }

    /// Processes the changes of both sides for one commit.
    pub fn process(
        &mut self,
        left: &[Delta<Row>],
        right: &[Delta<Row>],
        spec: JoinSpec<'_>,
        ctx: &OpContext,
    ) -> Result<Vec<Delta<Row>>> {
        let mut output = Vec::new();
        let outer = spec.join_type != JoinType::Inner;

        // ΔL ⋈ R
        let mut left_changes: HashMap<Vec<Value>, ZSet> = HashMap::new();
        for d in left {
            let key = d.data.project(spec.left_on);
            if let Some(rows) = self.right_index.get(&key) {
                for (r, m) in rows.iter() {
                    output.push(Delta::new(merge_rows(&d.data, r), d.diff * m));
                }
            }
            self.left_index
                .entry(key.clone())
                .or_default()
                .update(d.data.clone(), d.diff);
            left_changes.entry(key).or_default().update(d.data.clone(), d.diff);
        }
        settle(&mut self.left_index, left_changes.keys(), ctx)?;

        // L' ⋈ ΔR
        let mut right_changes: HashMap<Vec<Value>, ZSet> = HashMap::new();
        for d in right {
            let key = d.data.project(spec.right_on);
            if let Some(rows) = self.left_index.get(&key) {
                for (l, m) in rows.iter() {
                    output.push(Delta::new(merge_rows(l, &d.data), m * d.diff));
                }
            }
            self.right_index
                .entry(key.clone())
                .or_default()
                .update(d.data.clone(), d.diff);
            right_changes.entry(key).or_default().update(d.data.clone(), d.diff);
        }
        settle(&mut self.right_index, right_changes.keys(), ctx)?;

        if outer {
            let mut touched: Vec<&Vec<Value>> =
                left_changes.keys().chain(right_changes.keys()).collect();
            touched.sort();
            touched.dedup();
            for key in touched {
                if spec.join_type.keeps_left() {
                    pad_unmatched(
                        &self.left_index,
                        &self.right_index,
                        &left_changes,
                        &right_changes,
                        key,
                        |l| pad_right(l, spec.right_arity),
                        &mut output,
                    );
                }
                if spec.join_type.keeps_right() {
                    pad_unmatched(
                        &self.right_index,
                        &self.left_index,
                        &right_changes,
                        &left_changes,
                        key,
                        |r| pad_left(r, spec.left_arity),
                        &mut output,
                    );
                }
            }
        }
        Ok(output)
    }
}

/// Drops emptied index entries and rejects negative multiplicities.
fn settle<'a>(
    index: &mut HashMap<Vec<Value>, ZSet>,
    keys: impl Iterator<Item = &'a Vec<Value>>,
    ctx: &OpContext,
) -> Result<()> {
    for key in keys {
        let Some(rows) = index.get(key) else { continue };
        if rows.has_negative() {
            return Err(ctx.invariant("retraction of a row that was never joined"));
        }
        if rows.is_empty() {
            index.remove(key);
        }
    }
    Ok(())
}

/// Emits padding changes for rows of `own` under `key` whose match status on the
/// `other` side changed in this commit.
fn pad_unmatched<F>(
    own: &HashMap<Vec<Value>, ZSet>,
    other: &HashMap<Vec<Value>, ZSet>,
    own_changes: &HashMap<Vec<Value>, ZSet>,
    other_changes: &HashMap<Vec<Value>, ZSet>,
    key: &Vec<Value>,
    pad: F,
    output: &mut Vec<Delta<Row>>,
) where
    F: Fn(&Row) -> Row,
{
    let weight = |index: &HashMap<Vec<Value>, ZSet>| index.get(key).map_or(0, ZSet::weight);
    let other_after = weight(other);
    let other_before = other_after - weight(other_changes);
    if other_before == 0 {
        let mut before = own.get(key).cloned().unwrap_or_default();
        if let Some(changes) = own_changes.get(key) {
            for (row, m) in changes.iter() {
                before.update(row.clone(), -m);
            }
        }
        for (row, m) in before.iter() {
            output.push(Delta::new(pad(row), -m));
        }
    }
    if other_after == 0 {
        if let Some(rows) = own.get(key) {
            for (row, m) in rows.iter() {
                output.push(Delta::new(pad(row), m));
            }
        }
    }
}

/// Merges a matched pair; the identity is derived from both parents.
fn merge_rows(left: &Row, right: &Row) -> Row {
    let mut values = Vec::with_capacity(left.len() + right.len());
    values.extend_from_slice(left.values());
    values.extend_from_slice(right.values());
    Row::new(Key::pair(left.key(), right.key()), values)
}

fn pad_right(left: &Row, right_arity: usize) -> Row {
    let mut values = Vec::with_capacity(left.len() + right_arity);
    values.extend_from_slice(left.values());
    values.resize(left.len() + right_arity, Value::Null);
    Row::new(Key::left_unmatched(left.key()), values)
}

fn pad_left(right: &Row, left_arity: usize) -> Row {
    let mut values = vec![Value::Null; left_arity];
    values.extend_from_slice(right.values());
    Row::new(Key::right_unmatched(right.key()), values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::consolidate_rows;
    use crate::operators::test_context;
    use ripple_core::Timestamp;

    fn row(id: u64, k: i64, v: &str) -> Row {
        Row::new(id, vec![Value::Int64(k), Value::from(v)])
    }

    fn spec(join_type: JoinType) -> JoinSpec<'static> {
        JoinSpec {
            left_on: &[0],
            right_on: &[0],
            join_type,
            left_arity: 2,
            right_arity: 2,
        }
    }

    fn run(
        state: &mut JoinState,
        left: Vec<Delta<Row>>,
        right: Vec<Delta<Row>>,
        join_type: JoinType,
    ) -> Vec<Delta<Row>> {
        let mut out = state
            .process(&left, &right, spec(join_type), &test_context())
            .unwrap();
        consolidate_rows(&mut out);
        out
    }

    #[test]
    fn test_inner_join_insert_both_sides_in_one_commit() {
        let mut state = JoinState::new();
        let out = run(
            &mut state,
            vec![Delta::insert(row(1, 10, "a"))],
            vec![Delta::insert(row(2, 10, "x"))],
            JoinType::Inner,
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].diff, 1);
        assert_eq!(out[0].data.key(), Key::pair(Key(1), Key(2)));
        assert_eq!(out[0].data.len(), 4);
    }

    #[test]
    fn test_inner_join_delete_retracts() {
        let mut state = JoinState::new();
        run(
            &mut state,
            vec![Delta::insert(row(1, 10, "a"))],
            vec![Delta::insert(row(2, 10, "x")), Delta::insert(row(3, 10, "y"))],
            JoinType::Inner,
        );
        let out = run(
            &mut state,
            vec![Delta::delete(row(1, 10, "a"))],
            vec![],
            JoinType::Inner,
        );
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(Delta::is_delete));
        assert_eq!(state.left_count(), 0);
        assert_eq!(state.right_count(), 2);
    }

    #[test]
    fn test_inner_join_cancelling_commit_is_empty() {
        let mut state = JoinState::new();
        run(
            &mut state,
            vec![Delta::insert(row(1, 10, "a"))],
            vec![],
            JoinType::Inner,
        );
        let out = run(
            &mut state,
            vec![],
            vec![Delta::insert(row(2, 10, "x")), Delta::delete(row(2, 10, "x"))],
            JoinType::Inner,
        );
        assert!(out.is_empty());
    }

    #[test]
    fn test_left_outer_join_transitions() {
        let mut state = JoinState::new();
        let out = run(
            &mut state,
            vec![Delta::insert(row(1, 10, "a"))],
            vec![],
            JoinType::LeftOuter,
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].data.key(), Key::left_unmatched(Key(1)));
        assert_eq!(out[0].data.get(3), Some(&Value::Null));

        let out = run(
            &mut state,
            vec![],
            vec![Delta::insert(row(2, 10, "x"))],
            JoinType::LeftOuter,
        );
        assert_eq!(out.len(), 2);
        assert!(out
            .iter()
            .any(|d| d.is_insert() && d.data.key() == Key::pair(Key(1), Key(2))));
        assert!(out
            .iter()
            .any(|d| d.is_delete() && d.data.key() == Key::left_unmatched(Key(1))));

        let out = run(
            &mut state,
            vec![],
            vec![Delta::delete(row(2, 10, "x"))],
            JoinType::LeftOuter,
        );
        assert!(out
            .iter()
            .any(|d| d.is_insert() && d.data.key() == Key::left_unmatched(Key(1))));
    }

    #[test]
    fn test_full_outer_join_pads_both_sides() {
        let mut state = JoinState::new();
        let out = run(
            &mut state,
            vec![Delta::insert(row(1, 10, "a"))],
            vec![Delta::insert(row(2, 20, "x"))],
            JoinType::FullOuter,
        );
        assert_eq!(out.len(), 2);
        let right_only = out
            .iter()
            .find(|d| d.data.key() == Key::right_unmatched(Key(2)))
            .unwrap();
        assert_eq!(right_only.data.get(0), Some(&Value::Null));
        assert_eq!(right_only.data.get(2), Some(&Value::Int64(20)));
    }

    #[test]
    fn test_full_outer_join_pads_identity_zero_on_both_sides() {
        let mut state = JoinState::new();
        let out = run(
            &mut state,
            vec![Delta::insert(row(0, 10, "a"))],
            vec![Delta::insert(row(0, 20, "x"))],
            JoinType::FullOuter,
        );
        assert_eq!(out.len(), 2);
        assert_ne!(out[0].data.key(), out[1].data.key());

        let mut view = crate::materialize::MaterializedView::new();
        view.apply(Timestamp(1), &out).unwrap();
        assert_eq!(view.len(), 2);

        let out = run(
            &mut state,
            vec![],
            vec![Delta::delete(row(0, 20, "x")), Delta::insert(row(0, 10, "y"))],
            JoinType::FullOuter,
        );
        view.apply(Timestamp(2), &out).unwrap();
        assert_eq!(view.len(), 1);
        assert_eq!(
            view.get(Key::pair(Key(0), Key(0))).map(Row::len),
            Some(4)
        );
    }

    #[test]
    fn test_retracting_unknown_row_is_an_invariant_violation() {
        let mut state = JoinState::new();
        let err = state
            .process(
                &[Delta::delete(row(1, 10, "a"))],
                &[],
                spec(JoinType::Inner),
                &test_context(),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ripple_core::ErrorKind::Invariant);
    }
}
