//! Dataflow graph construction and validation.
//!
//! A computation is described with a [`GraphBuilder`] and frozen into an immutable
//! [`Graph`]: arities, universes and the evaluation order are all computed once, at
//! build time.

mod graph;
mod node;
mod universe;

pub use graph::{Graph, GraphBuilder, Node};
pub use node::{
    ColumnId, FlatMapperFn, IterateSpec, IxPolicy, JoinType, MapperFn, NodeId, NodeKind,
    PredicateFn, Reducer, SessionType,
};
pub use universe::{UniverseId, UniverseRegistry};
