//! Commit-at-a-time evaluation of a dataflow graph.
//!
//! The [`Evaluator`] owns one state slot per node. For a commit it seeds the changed
//! sources, then walks the graph level by level: nodes within a level only depend on
//! earlier levels, so a level may be spread over a rayon pool. Each slot sits behind
//! its own mutex and remembers the last commit it processed, which makes a second
//! pass over the same operator detectable.

use crate::collection::MultiplicityPolicy;
use crate::dataflow::{Graph, NodeId, NodeKind};
use crate::delta::{consolidate_rows, Delta};
use crate::operators::{
    concat_incremental, filter_incremental, flat_map_incremental, intersect_incremental,
    map_incremental, project_incremental, reindex_incremental, restrict_incremental,
    run_iteration, subtract_incremental, update_rows_incremental, zip_incremental, IxSpec,
    JoinSpec, OpContext, OperatorState, SourceEvent,
};
use parking_lot::{Mutex, MutexGuard};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use ripple_core::{DataError, Error, Result, Row, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, debug_span, error};

/// What happens to a row whose transformation fails.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Abort the commit.
    #[default]
    Fail,
    /// Drop the row and record the error in the commit's error log.
    Route,
}

/// Evaluation settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorConfig {
    /// Worker threads for independent operators; 1 evaluates inline.
    pub workers: usize,
    pub error_policy: ErrorPolicy,
    pub multiplicity: MultiplicityPolicy,
    /// Round limit for iterations that set none.
    pub iteration_limit: u32,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            error_policy: ErrorPolicy::Fail,
            multiplicity: MultiplicityPolicy::Set,
            iteration_limit: 1000,
        }
    }
}

/// State of one operator plus the last commit it processed.
#[derive(Debug, Serialize, Deserialize)]
pub struct OperatorSlot {
    last_pass: Option<Timestamp>,
    state: OperatorState,
}

impl OperatorSlot {
    /// Creates a slot that has never run.
    pub fn new(state: OperatorState) -> Self {
        Self {
            last_pass: None,
            state,
        }
    }

    /// Returns the operator state.
    #[inline]
    pub fn state(&self) -> &OperatorState {
        &self.state
    }

    /// Returns the last commit this operator processed.
    #[inline]
    pub fn last_pass(&self) -> Option<Timestamp> {
        self.last_pass
    }
}

/// Creates fresh slots for every node of `graph`.
pub(crate) fn new_slots(
    graph: &Graph,
    multiplicity: MultiplicityPolicy,
    nested: bool,
) -> Vec<Mutex<OperatorSlot>> {
    graph
        .nodes()
        .iter()
        .map(|node| Mutex::new(OperatorSlot::new(OperatorState::for_node(node, multiplicity, nested))))
        .collect()
}

/// Input fed to a source node for one pass.
#[derive(Debug)]
pub(crate) enum SourceInput {
    /// Raw events checked against the source table.
    Events(Vec<SourceEvent>),
    /// Already consistent changes, for sources of an iteration body.
    Deltas(Vec<Delta<Row>>),
}

impl SourceInput {
    fn is_empty(&self) -> bool {
        match self {
            SourceInput::Events(events) => events.is_empty(),
            SourceInput::Deltas(deltas) => deltas.is_empty(),
        }
    }
}

/// Output ports of every node after a pass, plus the routed errors.
pub(crate) struct PassOutput {
    /// Node -> port -> consolidated deltas. Untouched nodes have no ports.
    pub ports: Vec<Vec<Vec<Delta<Row>>>>,
    pub errors: Vec<DataError>,
}

/// One propagation of a commit through a graph.
pub(crate) struct Pass<'a> {
    pub graph: &'a Graph,
    pub slots: &'a [Mutex<OperatorSlot>],
    pub config: &'a EvaluatorConfig,
    pub time: Timestamp,
    /// Prepended to operator names, for nested graphs.
    pub prefix: &'a str,
    pub pool: Option<&'a ThreadPool>,
}

type NodeResult = Result<(Vec<Vec<Delta<Row>>>, Vec<DataError>)>;

fn port(ports: &[Vec<Vec<Delta<Row>>>], id: NodeId, index: usize) -> &[Delta<Row>] {
    ports[id].get(index).map(Vec::as_slice).unwrap_or_default()
}

impl Pass<'_> {
    /// Runs every node reachable from a seeded source, in level order.
    pub fn run(&self, seeds: BTreeMap<NodeId, SourceInput>) -> Result<PassOutput> {
        let affected = self.graph.reachable_from(
            seeds
                .iter()
                .filter(|(_, input)| !input.is_empty())
                .map(|(&id, _)| id),
        );
        let mut ports: Vec<Vec<Vec<Delta<Row>>>> = vec![Vec::new(); self.graph.len()];
        let mut errors = Vec::new();

        for level in self.graph.levels() {
            let ids: Vec<NodeId> = level.iter().copied().filter(|&id| affected[id]).collect();
            if ids.is_empty() {
                continue;
            }
            let results: Vec<NodeResult> = match self.pool {
                Some(pool) if ids.len() > 1 => pool.install(|| {
                    ids.par_iter()
                        .map(|&id| self.eval(id, &ports, &seeds))
                        .collect()
                }),
                _ => ids.iter().map(|&id| self.eval(id, &ports, &seeds)).collect(),
            };
            for (id, result) in ids.into_iter().zip(results) {
                let (out, routed) = result?;
                ports[id] = out;
                errors.extend(routed);
            }
        }
        Ok(PassOutput { ports, errors })
    }

    fn eval(
        &self,
        id: NodeId,
        ports: &[Vec<Vec<Delta<Row>>>],
        seeds: &BTreeMap<NodeId, SourceInput>,
    ) -> NodeResult {
        let node = self.graph.node(id);
        let mut ctx = OpContext::new(
            format!("{}{}", self.prefix, node.name()),
            self.time,
            self.config.error_policy,
        );
        let mut slot = self.slots[id].lock();
        if slot.last_pass == Some(self.time) {
            return Err(ctx.invariant("operator invoked twice in one commit"));
        }
        slot.last_pass = Some(self.time);

        let inputs: Vec<&[Delta<Row>]> = node.inputs().iter().map(|&i| port(ports, i, 0)).collect();
        let mut out = match (node.kind(), &mut slot.state) {
            (NodeKind::Source { schema, session }, OperatorState::Source(state)) => {
                let events: &[SourceEvent] = match seeds.get(&id) {
                    Some(SourceInput::Events(events)) => events.as_slice(),
                    Some(SourceInput::Deltas(_)) => {
                        return Err(ctx.invariant("source table fed with raw deltas"))
                    }
                    None => &[],
                };
                vec![state.apply(events, schema, *session, &mut ctx)?]
            }
            (NodeKind::Source { .. }, OperatorState::Stateless) => match seeds.get(&id) {
                Some(SourceInput::Deltas(deltas)) => vec![deltas.clone()],
                Some(SourceInput::Events(_)) => {
                    return Err(ctx.invariant("iteration source fed with raw events"))
                }
                None => vec![Vec::new()],
            },
            (NodeKind::Map { arity, mapper }, _) => {
                vec![map_incremental(inputs[0], *arity, |row: &Row| mapper(row), &mut ctx)?]
            }
            (NodeKind::Project { columns }, _) => vec![project_incremental(inputs[0], columns)],
            (NodeKind::Filter { predicate }, _) => {
                vec![filter_incremental(inputs[0], |row: &Row| predicate(row), &mut ctx)?]
            }
            (NodeKind::FlatMap { arity, mapper }, _) => {
                vec![flat_map_incremental(inputs[0], *arity, |row: &Row| mapper(row), &mut ctx)?]
            }
            (NodeKind::Reindex { columns }, _) => vec![reindex_incremental(inputs[0], columns)],
            (
                NodeKind::Join {
                    left_on,
                    right_on,
                    join_type,
                },
                OperatorState::Join(state),
            ) => {
                let spec = JoinSpec {
                    left_on,
                    right_on,
                    join_type: *join_type,
                    left_arity: self.graph.node(node.inputs()[0]).arity(),
                    right_arity: self.graph.node(node.inputs()[1]).arity(),
                };
                vec![state.process(inputs[0], inputs[1], spec, &ctx)?]
            }
            (NodeKind::Reduce { group_by, reducers }, OperatorState::Reduce(state)) => {
                vec![state.process(inputs[0], group_by, reducers, &mut ctx)?]
            }
            (NodeKind::Concat, OperatorState::Concat(state)) => {
                vec![concat_incremental(state, &inputs, &mut ctx)?]
            }
            (NodeKind::Restrict, OperatorState::Pair(state)) => {
                vec![restrict_incremental(state, inputs[0], inputs[1], &ctx)?]
            }
            (NodeKind::UpdateRows, OperatorState::Pair(state)) => {
                vec![update_rows_incremental(state, inputs[0], inputs[1], &ctx)?]
            }
            (NodeKind::Zip, OperatorState::Pair(state)) => {
                vec![zip_incremental(state, inputs[0], inputs[1], &ctx)?]
            }
            (NodeKind::Subtract, OperatorState::Pair(state)) => {
                vec![subtract_incremental(state, inputs[0], inputs[1], &ctx)?]
            }
            (NodeKind::Intersect, OperatorState::Intersect(state)) => {
                vec![intersect_incremental(state, &inputs, &ctx)?]
            }
            (NodeKind::Ix { column, policy }, OperatorState::Ix(state)) => {
                let spec = IxSpec {
                    column: *column,
                    policy: *policy,
                    arity: self.graph.node(node.inputs()[0]).arity(),
                };
                vec![state.process(inputs[0], inputs[1], spec, &mut ctx)?]
            }
            (NodeKind::Iterate(spec), OperatorState::Iterate(state)) => {
                run_iteration(state, spec, &inputs, &mut ctx, self.config)?
            }
            (NodeKind::IterateResult { index }, _) => {
                vec![port(ports, node.inputs()[0], *index).to_vec()]
            }
            (NodeKind::Output, _) => vec![inputs[0].to_vec()],
            (kind, _) => {
                return Err(ctx.invariant(format!("state does not fit a {} node", kind.tag())))
            }
        };
        for batch in &mut out {
            consolidate_rows(batch);
        }
        Ok((out, ctx.into_errors()))
    }
}

/// Result of evaluating one commit.
#[derive(Debug, Default)]
pub struct CommitOutput {
    pub time: Timestamp,
    /// Consolidated changes per output name. Every output is present.
    pub outputs: BTreeMap<String, Vec<Delta<Row>>>,
    /// Data errors routed during the commit.
    pub errors: Vec<DataError>,
}

/// Evaluates commits against a fixed graph.
///
/// # Example
///
/// ```rust
/// use ripple_core::{Row, Schema, Timestamp, Value};
/// use ripple_incremental::{Evaluator, EvaluatorConfig, GraphBuilder, SourceEvent};
/// use std::collections::BTreeMap;
/// use std::sync::Arc;
///
/// let mut builder = GraphBuilder::new();
/// let readings = builder.source("readings", Schema::untyped(["value"]));
/// builder.output(readings, "out");
/// let graph = Arc::new(builder.build().unwrap());
///
/// let mut evaluator = Evaluator::new(graph, EvaluatorConfig::default()).unwrap();
/// let row = Row::new(1, vec![Value::Int64(8)]);
/// let events = BTreeMap::from([(readings, vec![SourceEvent::insert(row)])]);
/// let output = evaluator.process(Timestamp(1), events).unwrap();
/// assert_eq!(output.outputs["out"].len(), 1);
/// ```
pub struct Evaluator {
    graph: Arc<Graph>,
    slots: Vec<Mutex<OperatorSlot>>,
    config: EvaluatorConfig,
    pool: Option<ThreadPool>,
    last_time: Timestamp,
    poisoned: bool,
}

impl Evaluator {
    /// Creates an evaluator with fresh operator state.
    pub fn new(graph: Arc<Graph>, config: EvaluatorConfig) -> Result<Self> {
        if config.workers == 0 {
            return Err(Error::config("workers must be at least 1"));
        }
        if config.iteration_limit == 0 {
            return Err(Error::config("iteration_limit must be at least 1"));
        }
        let pool = if config.workers > 1 {
            let pool = ThreadPoolBuilder::new()
                .num_threads(config.workers)
                .thread_name(|i| format!("ripple-worker-{i}"))
                .build()
                .map_err(|e| Error::config(format!("worker pool: {e}")))?;
            Some(pool)
        } else {
            None
        };
        let slots = new_slots(&graph, config.multiplicity, false);
        Ok(Self {
            graph,
            slots,
            config,
            pool,
            last_time: Timestamp::ZERO,
            poisoned: false,
        })
    }

    /// Returns the graph.
    #[inline]
    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    /// Returns the configuration.
    #[inline]
    pub fn config(&self) -> &EvaluatorConfig {
        &self.config
    }

    /// Returns the last commit that was fully evaluated.
    #[inline]
    pub fn last_time(&self) -> Timestamp {
        self.last_time
    }

    /// Returns true once a commit has failed; the state is then unusable.
    #[inline]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Locks the slot of one operator, for checkpointing.
    pub fn slot(&self, id: NodeId) -> MutexGuard<'_, OperatorSlot> {
        self.slots[id].lock()
    }

    /// Propagates one commit.
    ///
    /// `events` maps source nodes to the rows pushed into them, in arrival order.
    /// Every operator reachable from a changed source runs exactly once. On error the
    /// evaluator is poisoned: operator state may reflect part of the commit.
    pub fn process(
        &mut self,
        time: Timestamp,
        events: BTreeMap<NodeId, Vec<SourceEvent>>,
    ) -> Result<CommitOutput> {
        if self.poisoned {
            return Err(Error::coordinator("evaluator was poisoned by a failed commit"));
        }
        if time <= self.last_time {
            return Err(Error::coordinator(format!(
                "commit time {time} does not follow {}",
                self.last_time
            )));
        }
        for &id in events.keys() {
            if id >= self.graph.len() {
                return Err(Error::UnknownNode(format!("#{id}")));
            }
            let node = self.graph.node(id);
            if !matches!(node.kind(), NodeKind::Source { .. }) {
                return Err(Error::invalid_graph(format!("{} is not a source", node.name())));
            }
        }

        let span = debug_span!("commit", time = %time);
        let _enter = span.enter();
        let seeds = events
            .into_iter()
            .map(|(id, events)| (id, SourceInput::Events(events)))
            .collect();
        let pass = Pass {
            graph: &self.graph,
            slots: &self.slots,
            config: &self.config,
            time,
            prefix: "",
            pool: self.pool.as_ref(),
        };
        let mut result = match pass.run(seeds) {
            Ok(result) => result,
            Err(e) => {
                error!(time = %time, error = %e, "commit failed");
                self.poisoned = true;
                return Err(e);
            }
        };
        self.last_time = time;

        let outputs: BTreeMap<String, Vec<Delta<Row>>> = self
            .graph
            .outputs()
            .iter()
            .map(|(name, &id)| {
                let batch = std::mem::take(&mut result.ports[id])
                    .into_iter()
                    .next()
                    .unwrap_or_default();
                (name.clone(), batch)
            })
            .collect();
        debug!(
            changes = outputs.values().map(Vec::len).sum::<usize>(),
            errors = result.errors.len(),
            "commit evaluated"
        );
        Ok(CommitOutput {
            time,
            outputs,
            errors: result.errors,
        })
    }

    /// Replaces every operator state, as loaded from a snapshot taken at `time`.
    pub fn restore(&mut self, slots: Vec<OperatorSlot>, time: Timestamp) -> Result<()> {
        if slots.len() != self.graph.len() {
            return Err(Error::recovery(format!(
                "snapshot holds {} operators, graph has {}",
                slots.len(),
                self.graph.len()
            )));
        }
        for (node, slot) in self.graph.nodes().iter().zip(&slots) {
            if !slot.state.fits(node, false) {
                return Err(Error::recovery(format!(
                    "state of {} does not fit a {} node",
                    node.name(),
                    node.kind().tag()
                )));
            }
        }
        self.slots = slots.into_iter().map(Mutex::new).collect();
        self.last_time = time;
        self.poisoned = false;
        Ok(())
    }
}

impl std::fmt::Debug for Evaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Evaluator")
            .field("nodes", &self.graph.len())
            .field("config", &self.config)
            .field("last_time", &self.last_time)
            .field("poisoned", &self.poisoned)
            .finish()
    }
}
