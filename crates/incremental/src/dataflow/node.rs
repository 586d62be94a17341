//! Dataflow node definitions.

use crate::dataflow::graph::Graph;
use ripple_core::{Row, Schema, TransformError, Value};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a node in a dataflow graph (its arena index).
pub type NodeId = usize;

/// Type alias for column identifier.
pub type ColumnId = usize;

/// Predicate for filtering rows.
pub type PredicateFn = Box<dyn Fn(&Row) -> Result<bool, TransformError> + Send + Sync>;

/// Mapper function computing the new values of a row.
pub type MapperFn = Box<dyn Fn(&Row) -> Result<Vec<Value>, TransformError> + Send + Sync>;

/// Mapper function producing any number of rows from one row.
pub type FlatMapperFn =
    Box<dyn Fn(&Row) -> Result<Vec<Vec<Value>>, TransformError> + Send + Sync>;

/// How a source interprets pushed rows.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    /// Inserts and deletes refer to exact rows.
    #[default]
    Native,
    /// An insert replaces whatever is stored under the same identity; a delete
    /// removes it regardless of values.
    Upsert,
}

/// Join variants.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JoinType {
    Inner,
    LeftOuter,
    RightOuter,
    FullOuter,
}

impl JoinType {
    /// Returns true if unmatched left rows are kept.
    #[inline]
    pub fn keeps_left(self) -> bool {
        matches!(self, JoinType::LeftOuter | JoinType::FullOuter)
    }

    /// Returns true if unmatched right rows are kept.
    #[inline]
    pub fn keeps_right(self) -> bool {
        matches!(self, JoinType::RightOuter | JoinType::FullOuter)
    }
}

/// What an indexed lookup does with a row whose pointer leads nowhere.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum IxPolicy {
    /// Null pointers and dangling pointers are data errors.
    #[default]
    FailMissing,
    /// Rows with a null or dangling pointer produce no output.
    SkipMissing,
    /// A null pointer yields a row of nulls; a dangling pointer is a data error.
    ForwardNone,
}

/// Per-group reducers.
///
/// Null inputs are ignored by every reducer except `Count`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Reducer {
    /// Number of rows in the group.
    Count,
    /// Sum of a numeric column. Stays integral while every input is an integer.
    Sum(ColumnId),
    /// Mean of a numeric column.
    Avg(ColumnId),
    Min(ColumnId),
    Max(ColumnId),
    /// Identity of the row holding the minimum.
    ArgMin(ColumnId),
    /// Identity of the row holding the maximum.
    ArgMax(ColumnId),
    /// Deterministic representative (smallest value) of the column.
    Any(ColumnId),
    /// All values of the column, sorted, as a tuple.
    SortedTuple(ColumnId),
}

impl Reducer {
    /// Returns the input column, if the reducer reads one.
    pub fn column(&self) -> Option<ColumnId> {
        match *self {
            Reducer::Count => None,
            Reducer::Sum(c)
            | Reducer::Avg(c)
            | Reducer::Min(c)
            | Reducer::Max(c)
            | Reducer::ArgMin(c)
            | Reducer::ArgMax(c)
            | Reducer::Any(c)
            | Reducer::SortedTuple(c) => Some(c),
        }
    }
}

/// An iteration subgraph.
///
/// The body is a complete graph of its own whose sources stand for the loop
/// variables and the imported tables. Each round feeds the previous round's
/// results back into the variable sources until nothing changes.
pub struct IterateSpec {
    /// The loop body.
    pub body: Graph,
    /// Pairs of (variable source, result node) inside the body.
    pub variables: Vec<(NodeId, NodeId)>,
    /// Body sources receiving imported tables, in input order.
    pub imports: Vec<NodeId>,
    /// Round limit overriding the engine-wide one.
    pub limit: Option<u32>,
}

/// Operation performed by a node.
///
/// Inputs are stored on the node, not in the kind; the comments list what each
/// input position means.
pub enum NodeKind {
    /// Entry point for pushed rows.
    Source { schema: Schema, session: SessionType },
    /// Row-wise transformation keeping identities. Inputs: `[input]`.
    Map { arity: usize, mapper: MapperFn },
    /// Column selection keeping identities. Inputs: `[input]`.
    Project { columns: Vec<ColumnId> },
    /// Keeps rows matching the predicate. Inputs: `[input]`.
    Filter { predicate: PredicateFn },
    /// One-to-many transformation; child identities are derived from the parent.
    /// Inputs: `[input]`.
    FlatMap { arity: usize, mapper: FlatMapperFn },
    /// Re-derives identities from the given columns. Inputs: `[input]`.
    Reindex { columns: Vec<ColumnId> },
    /// Equi-join. Inputs: `[left, right]`.
    Join {
        left_on: Vec<ColumnId>,
        right_on: Vec<ColumnId>,
        join_type: JoinType,
    },
    /// Grouped aggregation. Inputs: `[input]`.
    Reduce {
        group_by: Vec<ColumnId>,
        reducers: Vec<Reducer>,
    },
    /// Union of tables with disjoint identities. Inputs: any number.
    Concat,
    /// Rows of `input` whose identity is in `universe_of`. Inputs: `[input, universe_of]`.
    Restrict,
    /// Rows of `base`, replaced by rows of `updates` with the same identity.
    /// Inputs: `[base, updates]`.
    UpdateRows,
    /// Column-wise concatenation of two tables with equal universes.
    /// Inputs: `[left, right]`.
    Zip,
    /// Rows of `input` whose identity is present in every other input.
    /// Inputs: `[input, others...]`.
    Intersect,
    /// Rows of `left` whose identity is absent from `right`. Inputs: `[left, right]`.
    Subtract,
    /// For each row of `keys`, the row of `to_ix` that its `column` points to,
    /// under the identity of the `keys` row. Inputs: `[to_ix, keys]`.
    Ix { column: ColumnId, policy: IxPolicy },
    /// Fixpoint loop. Inputs: variables' initial tables, then imported tables.
    Iterate(Box<IterateSpec>),
    /// The `index`-th result of an iteration. Inputs: `[iterate]`.
    IterateResult { index: usize },
    /// Named result stream. Inputs: `[input]`.
    Output,
}

impl NodeKind {
    /// Short name used for generated operator names.
    pub fn tag(&self) -> &'static str {
        match self {
            NodeKind::Source { .. } => "source",
            NodeKind::Map { .. } => "map",
            NodeKind::Project { .. } => "project",
            NodeKind::Filter { .. } => "filter",
            NodeKind::FlatMap { .. } => "flat_map",
            NodeKind::Reindex { .. } => "reindex",
            NodeKind::Join { .. } => "join",
            NodeKind::Reduce { .. } => "reduce",
            NodeKind::Concat => "concat",
            NodeKind::Restrict => "restrict",
            NodeKind::UpdateRows => "update_rows",
            NodeKind::Zip => "zip",
            NodeKind::Intersect => "intersect",
            NodeKind::Subtract => "subtract",
            NodeKind::Ix { .. } => "ix",
            NodeKind::Iterate(_) => "iterate",
            NodeKind::IterateResult { .. } => "iterate_result",
            NodeKind::Output => "output",
        }
    }

    /// Returns true for nodes that need state across commits.
    pub fn is_stateful(&self) -> bool {
        matches!(
            self,
            NodeKind::Source { .. }
                | NodeKind::Join { .. }
                | NodeKind::Reduce { .. }
                | NodeKind::Concat
                | NodeKind::Restrict
                | NodeKind::UpdateRows
                | NodeKind::Zip
                | NodeKind::Intersect
                | NodeKind::Subtract
                | NodeKind::Ix { .. }
                | NodeKind::Iterate(_)
        )
    }
}

impl fmt::Debug for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Source { schema, session } => f
                .debug_struct("Source")
                .field("arity", &schema.arity())
                .field("session", session)
                .finish(),
            NodeKind::Map { arity, .. } => f.debug_struct("Map").field("arity", arity).finish(),
            NodeKind::Project { columns } => {
                f.debug_struct("Project").field("columns", columns).finish()
            }
            NodeKind::FlatMap { arity, .. } => {
                f.debug_struct("FlatMap").field("arity", arity).finish()
            }
            NodeKind::Reindex { columns } => {
                f.debug_struct("Reindex").field("columns", columns).finish()
            }
            NodeKind::Join {
                left_on,
                right_on,
                join_type,
            } => f
                .debug_struct("Join")
                .field("left_on", left_on)
                .field("right_on", right_on)
                .field("join_type", join_type)
                .finish(),
            NodeKind::Reduce { group_by, reducers } => f
                .debug_struct("Reduce")
                .field("group_by", group_by)
                .field("reducers", reducers)
                .finish(),
            NodeKind::Ix { column, policy } => f
                .debug_struct("Ix")
                .field("column", column)
                .field("policy", policy)
                .finish(),
            NodeKind::Iterate(spec) => f
                .debug_struct("Iterate")
                .field("variables", &spec.variables.len())
                .field("imports", &spec.imports.len())
                .field("limit", &spec.limit)
                .finish(),
            NodeKind::IterateResult { index } => {
                f.debug_struct("IterateResult").field("index", index).finish()
            }
            other => f.write_str(other.tag()),
        }
    }
}
