//! Incremental grouped aggregation.
//!
//! Count, sum and average are maintained in O(1) per change. Min/max style reducers
//! keep the current extremum and only rescan the group's members when the extremum
//! itself is retracted. Each touched group emits at most a retraction of its previous
//! row and an insertion of its new one, and nothing when the row did not change.

use crate::collection::ZSet;
use crate::dataflow::{ColumnId, Reducer};
use crate::delta::Delta;
use crate::operators::OpContext;
use hashbrown::HashMap;
use ripple_core::{Error, Key, Result, Row, Value};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;

#[derive(Clone, Debug, Serialize, Deserialize)]
enum Accumulator {
    Count,
    Sum {
        int: i64,
        float: f64,
        /// Multiplicity of float contributions; the float part resets when it drops to zero.
        floats: i64,
    },
    Avg {
        sum: f64,
        count: i64,
    },
    Extremum {
        best: Option<(Value, Key)>,
        stale: bool,
    },
    /// Computed from the group members when the group is emitted.
    Members,
}

impl Accumulator {
    fn new(reducer: Reducer) -> Self {
        match reducer {
            Reducer::Count => Accumulator::Count,
            Reducer::Sum(_) => Accumulator::Sum {
                int: 0,
                float: 0.0,
                floats: 0,
            },
            Reducer::Avg(_) => Accumulator::Avg { sum: 0.0, count: 0 },
            Reducer::Min(_) | Reducer::Max(_) | Reducer::ArgMin(_) | Reducer::ArgMax(_) => {
                Accumulator::Extremum {
                    best: None,
                    stale: false,
                }
            }
            Reducer::Any(_) | Reducer::SortedTuple(_) => Accumulator::Members,
        }
    }
}

fn needs_members(reducer: &Reducer) -> bool {
    !matches!(reducer, Reducer::Count | Reducer::Sum(_) | Reducer::Avg(_))
}

/// Returns true if `candidate` should replace `current` as the extremum.
/// Ties go to the smaller identity.
fn beats(reducer: Reducer, candidate: (&Value, Key), current: (&Value, Key)) -> bool {
    let by_value = candidate.0.cmp(current.0);
    let by_value = match reducer {
        Reducer::Max(_) | Reducer::ArgMax(_) => by_value.reverse(),
        _ => by_value,
    };
    by_value.then(candidate.1.cmp(&current.1)) == Ordering::Less
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct GroupState {
    count: i64,
    members: ZSet,
    accumulators: Vec<Accumulator>,
    emitted: Option<Row>,
    /// Insertions dropped by a routed error; their retractions are dropped too.
    #[serde(default)]
    rejected: ZSet,
}

impl GroupState {
    fn new(reducers: &[Reducer]) -> Self {
        Self {
            count: 0,
            members: ZSet::new(),
            accumulators: reducers.iter().copied().map(Accumulator::new).collect(),
            emitted: None,
            rejected: ZSet::new(),
        }
    }

    /// Checks that a change can be applied without failing halfway.
    fn check(&self, reducers: &[Reducer], row: &Row, diff: i64) -> std::result::Result<(), String> {
        for (reducer, acc) in reducers.iter().zip(&self.accumulators) {
            let Some(column) = reducer.column() else { continue };
            let value = row.get(column).unwrap_or(&Value::Null);
            match (acc, value) {
                (_, Value::Null) => {}
                (Accumulator::Sum { int, .. }, Value::Int64(v)) => {
                    v.checked_mul(diff)
                        .and_then(|c| int.checked_add(c))
                        .ok_or_else(|| format!("integer overflow summing column {column}"))?;
                }
                (Accumulator::Sum { .. } | Accumulator::Avg { .. }, v) if v.as_numeric().is_none() => {
                    return Err(format!("cannot aggregate non-numeric value {v} in column {column}"));
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn apply(&mut self, reducers: &[Reducer], row: &Row, diff: i64, track_members: bool) {
        self.count += diff;
        if track_members {
            self.members.update(row.clone(), diff);
        }
        for (reducer, acc) in reducers.iter().zip(&mut self.accumulators) {
            let value = match reducer.column() {
                Some(column) => row.get(column).unwrap_or(&Value::Null),
                None => &Value::Null,
            };
            match acc {
                Accumulator::Count | Accumulator::Members => {}
                Accumulator::Sum { int, float, floats } => match value {
                    Value::Int64(v) => *int += v * diff,
                    Value::Float64(v) => {
                        *float += v * diff as f64;
                        *floats += diff;
                        if *floats == 0 {
                            *float = 0.0;
                        }
                    }
                    _ => {}
                },
                Accumulator::Avg { sum, count } => {
                    if let Some(v) = value.as_numeric() {
                        *sum += v * diff as f64;
                        *count += diff;
                        if *count == 0 {
                            *sum = 0.0;
                        }
                    }
                }
                Accumulator::Extremum { best, stale } => {
                    if value.is_null() {
                        continue;
                    }
                    let candidate = (value, row.key());
                    if diff > 0 {
                        let replace = match best.as_ref() {
                            Some((v, k)) => beats(*reducer, candidate, (v, *k)),
                            None => true,
                        };
                        if replace && !*stale {
                            *best = Some((value.clone(), row.key()));
                        }
                    } else if best
                        .as_ref()
                        .is_some_and(|(v, k)| v == value && *k == row.key())
                        && self.members.get(row) <= 0
                    {
                        *stale = true;
                    }
                }
            }
        }
    }

    fn rescan(&mut self, reducers: &[Reducer]) {
        for (reducer, acc) in reducers.iter().zip(&mut self.accumulators) {
            let Accumulator::Extremum { best, stale } = acc else { continue };
            if !*stale {
                continue;
            }
            let Some(column) = reducer.column() else { continue };
            let mut found: Option<(&Value, Key)> = None;
            for (row, m) in self.members.iter() {
                let value = row.get(column).unwrap_or(&Value::Null);
                if m <= 0 || value.is_null() {
                    continue;
                }
                let candidate = (value, row.key());
                if found.map_or(true, |current| beats(*reducer, candidate, current)) {
                    found = Some(candidate);
                }
            }
            *best = found.map(|(v, k)| (v.clone(), k));
            *stale = false;
        }
    }

    fn output_row(&self, group: &[Value], reducers: &[Reducer]) -> Row {
        let mut values = Vec::with_capacity(group.len() + reducers.len());
        values.extend_from_slice(group);
        for (reducer, acc) in reducers.iter().zip(&self.accumulators) {
            let value = match acc {
                Accumulator::Count => Value::Int64(self.count),
                Accumulator::Sum { int, float, floats } if *floats > 0 => {
                    Value::Float64(*int as f64 + float)
                }
                Accumulator::Sum { int, .. } => Value::Int64(*int),
                Accumulator::Avg { count: 0, .. } => Value::Null,
                Accumulator::Avg { sum, count } => Value::Float64(sum / *count as f64),
                Accumulator::Extremum { best: None, .. } => Value::Null,
                Accumulator::Extremum {
                    best: Some((v, k)), ..
                } => match reducer {
                    Reducer::ArgMin(_) | Reducer::ArgMax(_) => Value::Pointer(*k),
                    _ => v.clone(),
                },
                Accumulator::Members => self.member_value(*reducer),
            };
            values.push(value);
        }
        Row::new(Key::for_values(group), values)
    }

    fn member_value(&self, reducer: Reducer) -> Value {
        let Some(column) = reducer.column() else {
            return Value::Null;
        };
        let present = self
            .members
            .iter()
            .filter(|(_, m)| *m > 0)
            .filter_map(|(row, m)| row.get(column).filter(|v| !v.is_null()).map(|v| (v, m)));
        match reducer {
            Reducer::SortedTuple(_) => {
                let mut all: Vec<Value> = Vec::new();
                for (v, m) in present {
                    all.extend(std::iter::repeat(v.clone()).take(m as usize));
                }
                all.sort();
                Value::tuple(all)
            }
            _ => present.map(|(v, _)| v).min().cloned().unwrap_or(Value::Null),
        }
    }
}

/// State for a grouped aggregation node.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ReduceState {
    groups: HashMap<Vec<Value>, GroupState>,
}

impl ReduceState {
    /// Creates an empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of non-empty groups.
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Processes one commit worth of input changes.
    ///
    /// Output rows are the group columns followed by one value per reducer; the
    /// output identity is derived from the group columns.
    pub fn process(
        &mut self,
        input: &[Delta<Row>],
        group_by: &[ColumnId],
        reducers: &[Reducer],
        ctx: &mut OpContext,
    ) -> Result<Vec<Delta<Row>>> {
        let track_members = reducers.iter().any(needs_members);
        let mut touched: BTreeSet<Vec<Value>> = BTreeSet::new();
        for d in input {
            let group = d.data.project(group_by);
            let state = self
                .groups
                .entry(group.clone())
                .or_insert_with(|| GroupState::new(reducers));
            touched.insert(group);
            let mut diff = d.diff;
            if diff < 0 {
                let dropped = state.rejected.get(&d.data).min(-diff);
                state.rejected.update(d.data.clone(), -dropped);
                diff += dropped;
                if diff == 0 {
                    continue;
                }
            }
            if let Err(message) = state.check(reducers, &d.data, diff) {
                let err = Error::data(ctx.operator(), ctx.time(), Some(d.data.clone()), message);
                ctx.report(Some(&d.data), err)?;
                if diff > 0 {
                    state.rejected.update(d.data.clone(), diff);
                }
                continue;
            }
            state.apply(reducers, &d.data, diff, track_members);
        }

        let mut output = Vec::new();
        for group in touched {
            let Some(state) = self.groups.get_mut(&group) else { continue };
            if state.count < 0 || state.members.has_negative() {
                return Err(ctx.invariant(format!(
                    "group {group:?} retracted more rows than it holds"
                )));
            }
            state.rescan(reducers);
            let next = (state.count > 0).then(|| state.output_row(&group, reducers));
            if next != state.emitted {
                if let Some(old) = state.emitted.take() {
                    output.push(Delta::delete(old));
                }
                if let Some(new) = &next {
                    output.push(Delta::insert(new.clone()));
                }
                state.emitted = next;
            }
            if state.count == 0 && state.rejected.is_empty() {
                self.groups.remove(&group);
            }
        }
        Ok(output)
    }
}
