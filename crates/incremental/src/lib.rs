//! Ripple Incremental - operator graph and incremental evaluator.
//!
//! A computation is a graph of operators over tables. Each commit pushes a batch of
//! row changes into the sources; the evaluator propagates them through the graph so
//! that every derived table changes by exactly the deltas it needs, and each operator
//! runs at most once per commit.
//!
//! # Core Concepts
//!
//! - `Delta<T>`: a change to a collection, with a signed multiplicity
//! - `ZSet` / `KeyedTable`: collections maintained from deltas
//! - `GraphBuilder` / `Graph`: declaration and validation of the operator graph,
//!   including universe (row-identity set) tracking
//! - `Evaluator`: owns operator state and processes one commit at a time
//! - `MaterializedView`: a derived table rebuilt from its delta stream
//!
//! # Operators
//!
//! Source, Map, Project, Filter, FlatMap, Reindex, Join (inner and outer), Reduce,
//! Concat, Restrict, UpdateRows, Zip, Intersect, Subtract, Ix, Iterate and Output.
//!
//! # Example
//!
//! ```rust
//! use ripple_core::{Row, Schema, Timestamp, Value};
//! use ripple_incremental::{Delta, Evaluator, EvaluatorConfig, GraphBuilder, SourceEvent};
//! use std::collections::BTreeMap;
//! use std::sync::Arc;
//!
//! let mut builder = GraphBuilder::new();
//! let people = builder.source("people", Schema::untyped(["id", "age"]));
//! let adults = builder.filter(people, |row: &Row| {
//!     Ok(row.get(1).and_then(Value::as_i64).map_or(false, |age| age > 18))
//! });
//! builder.output(adults, "adults");
//! let graph = Arc::new(builder.build().unwrap());
//!
//! let mut evaluator = Evaluator::new(graph, EvaluatorConfig::default()).unwrap();
//! let alice = Row::new(1, vec![Value::Int64(1), Value::Int64(25)]);
//! let events = BTreeMap::from([(people, vec![SourceEvent::insert(alice.clone())])]);
//! let output = evaluator.process(Timestamp(1), events).unwrap();
//!
//! assert_eq!(output.outputs["adults"], vec![Delta::insert(alice)]);
//! ```

pub mod collection;
pub mod dataflow;
pub mod delta;
pub mod evaluator;
pub mod materialize;
pub mod operators;

pub use collection::{KeyedTable, MultiplicityPolicy, ZSet};
pub use dataflow::{
    ColumnId, Graph, GraphBuilder, IterateSpec, IxPolicy, JoinType, Node, NodeId, NodeKind,
    Reducer, SessionType, UniverseId, UniverseRegistry,
};
pub use delta::{consolidate, consolidate_rows, Delta, DeltaBatch, DeltaBatchExt, Update};
pub use evaluator::{CommitOutput, ErrorPolicy, Evaluator, EvaluatorConfig, OperatorSlot};
pub use materialize::MaterializedView;
pub use operators::{
    filter_incremental, flat_map_incremental, map_incremental, project_incremental,
    reindex_incremental, OpContext, Operation, OperatorState, SourceEvent,
};
