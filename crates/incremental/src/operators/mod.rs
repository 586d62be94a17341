//! Incremental operators.
//!
//! Every operator consumes the consolidated input deltas of one commit and returns
//! its output deltas for the same commit:
//! - Source: validates pushed rows against the source table
//! - Filter / Map / Project / FlatMap / Reindex: stateless row-wise operators
//! - Join: maintains indexes of both sides and emits the bilinear join delta
//! - Reduce: maintains per-group accumulators and emits retract/insert pairs
//! - Concat / Restrict / UpdateRows / Zip / Intersect / Subtract: identity-aligned
//!   combinations
//! - Ix: pointer lookups into another table
//! - Iterate: runs a subgraph to a fixpoint, one round arena per commit depth

mod alignment;
mod filter;
mod iterate;
mod ix;
mod join;
mod map;
mod reduce;
mod source;

pub use alignment::{ConcatState, IntersectState, PairState};
pub use filter::filter_incremental;
pub use iterate::IterateState;
pub use ix::{IxSpec, IxState};
pub use join::{JoinSpec, JoinState};
pub use map::{flat_map_incremental, map_incremental, project_incremental, reindex_incremental};
pub use reduce::ReduceState;
pub use source::{Operation, SourceEvent, SourceState};

pub(crate) use alignment::{
    concat_incremental, intersect_incremental, restrict_incremental, subtract_incremental,
    update_rows_incremental, zip_incremental,
};
pub(crate) use iterate::run_iteration;

use crate::collection::MultiplicityPolicy;
use crate::dataflow::{Node, NodeKind};
use crate::evaluator::ErrorPolicy;
use ripple_core::{DataError, Error, Result, Row, Timestamp, TransformError};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Per-invocation context of an operator: who is running, at which time, and where
/// failed rows go.
#[derive(Debug)]
pub struct OpContext {
    operator: String,
    time: Timestamp,
    policy: ErrorPolicy,
    errors: Vec<DataError>,
}

impl OpContext {
    /// Creates a context for one operator invocation.
    pub fn new(operator: impl Into<String>, time: Timestamp, policy: ErrorPolicy) -> Self {
        Self {
            operator: operator.into(),
            time,
            policy,
            errors: Vec::new(),
        }
    }

    /// Returns the operator name.
    #[inline]
    pub fn operator(&self) -> &str {
        &self.operator
    }

    /// Returns the commit time.
    #[inline]
    pub fn time(&self) -> Timestamp {
        self.time
    }

    /// Returns the error policy.
    #[inline]
    pub fn policy(&self) -> ErrorPolicy {
        self.policy
    }

    /// Reports a failure. Fatal errors, and every error under
    /// [`ErrorPolicy::Fail`], are returned; routed data errors are recorded and the
    /// offending row is dropped.
    pub fn report(&mut self, row: Option<&Row>, error: Error) -> Result<()> {
        if error.is_fatal() || self.policy == ErrorPolicy::Fail {
            return Err(error);
        }
        let message = match &error {
            Error::Data(data) => data.message.clone(),
            other => other.to_string(),
        };
        warn!(operator = %self.operator, time = %self.time, %message, "row routed to error log");
        self.errors.push(DataError {
            operator: self.operator.clone(),
            time: self.time,
            row: row.cloned(),
            message,
        });
        Ok(())
    }

    /// Reports a failed user transformation on `row`.
    pub fn report_transform(&mut self, row: &Row, error: TransformError) -> Result<()> {
        let error = Error::data(self.operator.clone(), self.time, Some(row.clone()), error.message());
        self.report(Some(row), error)
    }

    /// Builds an invariant violation for this operator.
    pub fn invariant(&self, message: impl Into<String>) -> Error {
        Error::invariant(self.operator.clone(), self.time, message)
    }

    /// Records data errors reported by a nested evaluation.
    pub(crate) fn absorb(&mut self, errors: Vec<DataError>) {
        self.errors.extend(errors);
    }

    /// Returns the routed errors.
    pub fn into_errors(self) -> Vec<DataError> {
        self.errors
    }
}

/// State kept by an operator between commits.
#[derive(Debug, Serialize, Deserialize)]
pub enum OperatorState {
    /// Stateless operators, and sources of an iteration body.
    Stateless,
    Source(SourceState),
    Join(JoinState),
    Reduce(ReduceState),
    Concat(ConcatState),
    /// Restrict, UpdateRows, Zip and Subtract.
    Pair(PairState),
    Intersect(IntersectState),
    Ix(IxState),
    Iterate(IterateState),
}

impl OperatorState {
    /// Creates the initial state of a node. Sources nested in an iteration body are
    /// fed already consistent deltas and keep no table.
    pub fn for_node(node: &Node, multiplicity: MultiplicityPolicy, nested: bool) -> Self {
        match node.kind() {
            NodeKind::Source { .. } if nested => OperatorState::Stateless,
            NodeKind::Source { .. } => OperatorState::Source(SourceState::new(multiplicity)),
            NodeKind::Join { .. } => OperatorState::Join(JoinState::new()),
            NodeKind::Reduce { .. } => OperatorState::Reduce(ReduceState::new()),
            NodeKind::Concat => OperatorState::Concat(ConcatState::default()),
            NodeKind::Restrict | NodeKind::UpdateRows | NodeKind::Zip | NodeKind::Subtract => {
                OperatorState::Pair(PairState::default())
            }
            NodeKind::Intersect => OperatorState::Intersect(IntersectState::default()),
            NodeKind::Ix { .. } => OperatorState::Ix(IxState::default()),
            NodeKind::Iterate(_) => OperatorState::Iterate(IterateState::default()),
            _ => OperatorState::Stateless,
        }
    }

    /// Returns true if this state has the shape `node` expects.
    pub fn fits(&self, node: &Node, nested: bool) -> bool {
        std::mem::discriminant(self)
            == std::mem::discriminant(&Self::for_node(node, MultiplicityPolicy::Set, nested))
    }
}

#[cfg(test)]
pub(crate) fn test_context() -> OpContext {
    OpContext::new("test", Timestamp(1), ErrorPolicy::Fail)
}
