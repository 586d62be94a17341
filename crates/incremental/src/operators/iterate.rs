//! Fixpoint iteration.
//!
//! Round `r` of an iteration evaluates the body on `X_r` and produces
//! `X_{r+1} = body(X_r)`; the result is the first `X_n` with `body(X_n) = X_n`.
//! Every round keeps its own copy of the body's operator state, stored in an arena
//! indexed by round number, so a later commit only pushes the changes of `X_r`
//! through each round instead of recomputing the loop.
//!
//! Per round the arena also keeps `X_r` and the distance `body(X_r) - X_r`; the loop
//! stops at the first round whose distance is empty. Rounds past that point are
//! dropped and rebuilt from full content if a later commit needs them again.

use crate::collection::ZSet;
use crate::dataflow::{IterateSpec, NodeId};
use crate::delta::Delta;
use crate::evaluator::{new_slots, EvaluatorConfig, OperatorSlot, Pass, SourceInput};
use crate::operators::OpContext;
use parking_lot::Mutex;
use ripple_core::{Error, Result, Row};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::trace;

/// One round of an iteration.
#[derive(Debug, Serialize, Deserialize)]
struct Round {
    /// Body operator state at this round.
    slots: Vec<Mutex<OperatorSlot>>,
    /// `X_r` per variable.
    input: Vec<ZSet>,
    /// `body(X_r) - X_r` per variable.
    distance: Vec<ZSet>,
}

/// State of an iteration node.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct IterateState {
    /// Initial value of each variable.
    initial: Vec<ZSet>,
    /// Content of each imported table.
    imports: Vec<ZSet>,
    rounds: Vec<Round>,
    /// Last emitted fixpoint per variable.
    result: Vec<ZSet>,
}

impl IterateState {
    /// Number of rounds the last fixpoint took.
    pub fn depth(&self) -> usize {
        self.rounds.len()
    }

    /// Returns the current fixpoint of a variable.
    pub fn result(&self, variable: usize) -> Option<&ZSet> {
        self.result.get(variable)
    }
}

/// Advances an iteration by one commit and returns the change of every result.
///
/// `inputs` holds the changes of the variables' initial tables followed by those of
/// the imported tables.
pub(crate) fn run_iteration(
    state: &mut IterateState,
    spec: &IterateSpec,
    inputs: &[&[Delta<Row>]],
    ctx: &mut OpContext,
    config: &EvaluatorConfig,
) -> Result<Vec<Vec<Delta<Row>>>> {
    let vars = spec.variables.len();
    let (var_inputs, import_inputs) = inputs.split_at(vars.min(inputs.len()));
    state.initial.resize_with(vars, ZSet::new);
    state.imports.resize_with(spec.imports.len(), ZSet::new);
    state.result.resize_with(vars, ZSet::new);
    for (table, changes) in state.initial.iter_mut().zip(var_inputs) {
        table.apply(changes.iter());
    }
    for (table, changes) in state.imports.iter_mut().zip(import_inputs) {
        table.apply(changes.iter());
    }

    let limit = spec.limit.unwrap_or(config.iteration_limit);
    let prefix = format!("{}/", ctx.operator());
    let previous_depth = state.rounds.len();
    let mut dx: Vec<Vec<Delta<Row>>> = var_inputs.iter().map(|d| d.to_vec()).collect();
    dx.resize_with(vars, Vec::new);
    let mut round = 0usize;
    loop {
        if round >= limit as usize {
            return Err(Error::IterationLimit {
                operator: ctx.operator().to_string(),
                rounds: limit,
                time: ctx.time(),
            });
        }
        let import_changes: Vec<Vec<Delta<Row>>> = if round == state.rounds.len() {
            dx = if round == 0 {
                state.initial.iter().map(ZSet::to_deltas).collect()
            } else {
                let prev = &state.rounds[round - 1];
                prev.input
                    .iter()
                    .zip(&prev.distance)
                    .map(|(x, distance)| {
                        let mut next = x.clone();
                        next.apply(distance.to_deltas().iter());
                        next.to_deltas()
                    })
                    .collect()
            };
            state.rounds.push(Round {
                slots: new_slots(&spec.body, config.multiplicity, true),
                input: vec![ZSet::new(); vars],
                distance: vec![ZSet::new(); vars],
            });
            state.imports.iter().map(ZSet::to_deltas).collect()
        } else {
            import_inputs.iter().map(|d| d.to_vec()).collect()
        };

        let current = &mut state.rounds[round];
        for ((x, distance), changes) in current.input.iter_mut().zip(&mut current.distance).zip(&dx) {
            x.apply(changes.iter());
            distance.retract(changes.iter());
        }

        let mut seeds: BTreeMap<NodeId, SourceInput> = BTreeMap::new();
        for (&(source, _), changes) in spec.variables.iter().zip(&dx) {
            seeds.insert(source, SourceInput::Deltas(changes.clone()));
        }
        for (&source, changes) in spec.imports.iter().zip(import_changes) {
            seeds.insert(source, SourceInput::Deltas(changes));
        }
        let pass = Pass {
            graph: &spec.body,
            slots: &current.slots,
            config,
            time: ctx.time(),
            prefix: &prefix,
            pool: None,
        };
        let mut output = pass.run(seeds)?;
        ctx.absorb(std::mem::take(&mut output.errors));

        let dy: Vec<Vec<Delta<Row>>> = spec
            .variables
            .iter()
            .map(|&(_, result)| {
                std::mem::take(&mut output.ports[result])
                    .into_iter()
                    .next()
                    .unwrap_or_default()
            })
            .collect();
        for (distance, changes) in current.distance.iter_mut().zip(&dy) {
            distance.apply(changes.iter());
        }
        trace!(operator = ctx.operator(), round, "iteration round evaluated");

        if current.distance.iter().all(ZSet::is_empty) {
            state.rounds.truncate(round + 1);
            break;
        }
        dx = dy;
        round += 1;
    }

    // The fixpoint is `X_round`.
    let fixpoint = &state.rounds[round].input;
    let changes: Vec<Vec<Delta<Row>>> = if round + 1 == previous_depth {
        dx
    } else {
        fixpoint
            .iter()
            .zip(&state.result)
            .map(|(new, old)| new.difference(old))
            .collect()
    };
    for (result, batch) in state.result.iter_mut().zip(&changes) {
        result.apply(batch.iter());
    }
    Ok(changes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataflow::{GraphBuilder, JoinType, Reducer};
    use crate::delta::consolidate_rows;
    use ripple_core::{ErrorKind, Schema, Timestamp, Value};

    fn edge(from: i64, to: i64) -> Row {
        Row::from_values(vec![Value::Int64(from), Value::Int64(to)])
    }

    /// Transitive closure: `reach = distinct(edges ∪ reach ⋈ edges)`.
    fn closure_spec(limit: Option<u32>) -> IterateSpec {
        let mut b = GraphBuilder::new();
        let reach = b.source("var0", Schema::untyped(["from", "to"]));
        let edges = b.source("import0", Schema::untyped(["from", "to"]));
        let joined = b.join(reach, edges, vec![1], vec![0], JoinType::Inner);
        let extended = b.project(joined, vec![0, 3]);
        let all = b.concat(&[edges, extended]);
        let distinct = b.reduce(all, vec![0, 1], vec![Reducer::Count]);
        let result = b.project(distinct, vec![0, 1]);
        IterateSpec {
            body: b.build().unwrap(),
            variables: vec![(reach, result)],
            imports: vec![edges],
            limit,
        }
    }

    fn run(
        state: &mut IterateState,
        spec: &IterateSpec,
        edges: Vec<Delta<Row>>,
        time: u64,
    ) -> Result<Vec<Delta<Row>>> {
        let config = EvaluatorConfig::default();
        let mut ctx = OpContext::new("closure", Timestamp(time), config.error_policy);
        let mut out = run_iteration(state, spec, &[&edges[..], &edges[..]], &mut ctx, &config)?;
        let mut batch = out.remove(0);
        consolidate_rows(&mut batch);
        Ok(batch)
    }

    fn pairs(batch: &[Delta<Row>]) -> Vec<(i64, i64, i64)> {
        let mut out: Vec<(i64, i64, i64)> = batch
            .iter()
            .map(|d| {
                let v = |i: usize| d.data.get(i).and_then(Value::as_i64).unwrap_or(-1);
                (v(0), v(1), d.diff)
            })
            .collect();
        out.sort_unstable();
        out
    }

    #[test]
    fn test_transitive_closure_grows_and_shrinks() {
        let spec = closure_spec(None);
        let mut state = IterateState::default();

        let out = run(
            &mut state,
            &spec,
            vec![Delta::insert(edge(1, 2)), Delta::insert(edge(2, 3))],
            1,
        )
        .unwrap();
        assert_eq!(pairs(&out), vec![(1, 2, 1), (1, 3, 1), (2, 3, 1)]);
        assert_eq!(state.depth(), 2);

        let out = run(&mut state, &spec, vec![Delta::insert(edge(3, 4))], 2).unwrap();
        assert_eq!(pairs(&out), vec![(1, 4, 1), (2, 4, 1), (3, 4, 1)]);
        assert_eq!(state.depth(), 3);

        let out = run(&mut state, &spec, vec![Delta::delete(edge(2, 3))], 3).unwrap();
        assert_eq!(pairs(&out), vec![(1, 3, -1), (1, 4, -1), (2, 3, -1), (2, 4, -1)]);
        assert_eq!(state.depth(), 1);
        assert_eq!(state.result(0).map(ZSet::len), Some(2));
    }

    #[test]
    fn test_round_limit() {
        let spec = closure_spec(Some(2));
        let mut state = IterateState::default();
        let chain: Vec<Delta<Row>> = (0..6).map(|i| Delta::insert(edge(i, i + 1))).collect();
        let err = run(&mut state, &spec, chain, 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NonTermination);
        assert!(matches!(err, Error::IterationLimit { rounds: 2, .. }));
    }

    #[test]
    fn test_empty_commit_keeps_fixpoint() {
        let spec = closure_spec(None);
        let mut state = IterateState::default();
        run(
            &mut state,
            &spec,
            vec![Delta::insert(edge(1, 2)), Delta::insert(edge(2, 3))],
            1,
        )
        .unwrap();
        let out = run(&mut state, &spec, Vec::new(), 2).unwrap();
        assert!(out.is_empty());
        assert_eq!(state.depth(), 2);
    }
}
