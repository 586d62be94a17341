//! Dataflow graph construction and validation.
//!
//! A [`GraphBuilder`] collects nodes in an arena; [`GraphBuilder::build`] checks the
//! structure (defined nodes, input counts, column references, acyclicity outside
//! iterations, universe compatibility) and produces an immutable [`Graph`] with a
//! topological order, parallel levels and a structural fingerprint.

use crate::dataflow::node::{
    ColumnId, FlatMapperFn, IterateSpec, IxPolicy, JoinType, MapperFn, NodeId, NodeKind,
    PredicateFn, Reducer, SessionType,
};
use crate::dataflow::universe::{UniverseId, UniverseRegistry};
use ripple_core::{Error, Result, Row, Schema, TransformError, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use twox_hash::XxHash64;

const FINGERPRINT_SEED: u64 = 0x6772_6170_685f_6670;

/// A validated node of a [`Graph`].
pub struct Node {
    name: String,
    kind: NodeKind,
    inputs: Vec<NodeId>,
    arity: usize,
    universe: UniverseId,
    level: usize,
}

impl Node {
    /// Returns the operator name, unique within the graph.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns what this node does.
    #[inline]
    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    /// Returns the nodes this one reads from.
    #[inline]
    pub fn inputs(&self) -> &[NodeId] {
        &self.inputs
    }

    /// Returns the number of columns of the produced table.
    #[inline]
    pub fn arity(&self) -> usize {
        self.arity
    }

    /// Returns the universe of the produced table.
    #[inline]
    pub fn universe(&self) -> UniverseId {
        self.universe
    }

    /// Returns the length of the longest path from a source to this node.
    #[inline]
    pub fn level(&self) -> usize {
        self.level
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("inputs", &self.inputs)
            .field("arity", &self.arity)
            .finish()
    }
}

/// An immutable, validated dataflow graph.
pub struct Graph {
    nodes: Vec<Node>,
    order: Vec<NodeId>,
    levels: Vec<Vec<NodeId>>,
    dependents: Vec<Vec<NodeId>>,
    sources: BTreeMap<String, NodeId>,
    outputs: BTreeMap<String, NodeId>,
    universes: UniverseRegistry,
    fingerprint: u64,
}

impl Graph {
    /// Returns the node with the given id.
    #[inline]
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    /// Returns all nodes, indexed by id.
    #[inline]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Returns the number of nodes.
    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no nodes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns node ids in a topological order.
    #[inline]
    pub fn order(&self) -> &[NodeId] {
        &self.order
    }

    /// Returns nodes grouped by level. Nodes of one level never depend on each other.
    #[inline]
    pub fn levels(&self) -> &[Vec<NodeId>] {
        &self.levels
    }

    /// Returns the nodes reading from `id`.
    #[inline]
    pub fn dependents(&self, id: NodeId) -> &[NodeId] {
        &self.dependents[id]
    }

    /// Looks up a source by name.
    pub fn source(&self, name: &str) -> Option<NodeId> {
        self.sources.get(name).copied()
    }

    /// Returns sources by name.
    pub fn sources(&self) -> &BTreeMap<String, NodeId> {
        &self.sources
    }

    /// Looks up an output by name.
    pub fn output(&self, name: &str) -> Option<NodeId> {
        self.outputs.get(name).copied()
    }

    /// Returns outputs by name.
    pub fn outputs(&self) -> &BTreeMap<String, NodeId> {
        &self.outputs
    }

    /// Returns the universe relations computed at build time.
    pub fn universes(&self) -> &UniverseRegistry {
        &self.universes
    }

    /// Structural hash of the graph. Snapshots are only valid for a graph with the
    /// same fingerprint.
    #[inline]
    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    /// Marks every node reachable from the given nodes.
    pub fn reachable_from(&self, changed: impl IntoIterator<Item = NodeId>) -> Vec<bool> {
        let mut marked = vec![false; self.nodes.len()];
        let mut stack: Vec<NodeId> = changed.into_iter().collect();
        while let Some(id) = stack.pop() {
            if marked[id] {
                continue;
            }
            marked[id] = true;
            stack.extend(self.dependents[id].iter().copied().filter(|&d| !marked[d]));
        }
        marked
    }
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("nodes", &self.nodes)
            .field("fingerprint", &format_args!("{:016x}", self.fingerprint))
            .finish()
    }
}

struct PendingNode {
    name: Option<String>,
    kind: Option<NodeKind>,
    inputs: Vec<NodeId>,
}

enum Promise {
    Subset { sub: NodeId, sup: NodeId },
    Equal(NodeId, NodeId),
}

/// Builder for a [`Graph`].
///
/// Node-adding methods return the new node's id immediately; structural errors are
/// reported by [`GraphBuilder::build`]. Cycles are only allowed through
/// [`GraphBuilder::iterate`]; [`GraphBuilder::declare`] exists so that higher level
/// front ends can refer to a node before defining it, and such a forward reference
/// must not close a loop.
///
/// # Example
///
/// ```
/// use ripple_core::Schema;
/// use ripple_incremental::{GraphBuilder, Reducer};
///
/// let mut builder = GraphBuilder::new();
/// let readings = builder.source("readings", Schema::untyped(["sensor", "value"]));
/// let max = builder.reduce(readings, vec![0], vec![Reducer::Max(1)]);
/// builder.output(max, "max_by_sensor");
/// let graph = builder.build().unwrap();
/// assert_eq!(graph.node(max).arity(), 2);
/// ```
#[derive(Default)]
pub struct GraphBuilder {
    nodes: Vec<PendingNode>,
    promises: Vec<Promise>,
}

impl GraphBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node with the given kind and inputs.
    pub fn add_node(&mut self, kind: NodeKind, inputs: Vec<NodeId>) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(PendingNode {
            name: None,
            kind: Some(kind),
            inputs,
        });
        id
    }

    /// Reserves a node to be defined later with [`GraphBuilder::define`].
    pub fn declare(&mut self, name: impl Into<String>) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(PendingNode {
            name: Some(name.into()),
            kind: None,
            inputs: Vec::new(),
        });
        id
    }

    /// Defines a node reserved with [`GraphBuilder::declare`].
    pub fn define(&mut self, id: NodeId, kind: NodeKind, inputs: Vec<NodeId>) -> Result<()> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| Error::UnknownNode(format!("#{id}")))?;
        if node.kind.is_some() {
            return Err(Error::invalid_graph(format!("node #{id} is already defined")));
        }
        node.kind = Some(kind);
        node.inputs = inputs;
        Ok(())
    }

    /// Sets the operator name of a node.
    pub fn rename(&mut self, id: NodeId, name: impl Into<String>) -> NodeId {
        if let Some(node) = self.nodes.get_mut(id) {
            node.name = Some(name.into());
        }
        id
    }

    /// Adds a named source.
    pub fn source(&mut self, name: impl Into<String>, schema: Schema) -> NodeId {
        self.source_with_session(name, schema, SessionType::Native)
    }

    /// Adds a named source with an explicit session type.
    pub fn source_with_session(
        &mut self,
        name: impl Into<String>,
        schema: Schema,
        session: SessionType,
    ) -> NodeId {
        let id = self.add_node(NodeKind::Source { schema, session }, Vec::new());
        self.rename(id, name)
    }

    /// Adds a row-wise transformation producing `arity` columns.
    pub fn map<F>(&mut self, input: NodeId, arity: usize, mapper: F) -> NodeId
    where
        F: Fn(&Row) -> std::result::Result<Vec<Value>, TransformError> + Send + Sync + 'static,
    {
        let mapper: MapperFn = Box::new(mapper);
        self.add_node(NodeKind::Map { arity, mapper }, vec![input])
    }

    /// Adds a column selection.
    pub fn project(&mut self, input: NodeId, columns: Vec<ColumnId>) -> NodeId {
        self.add_node(NodeKind::Project { columns }, vec![input])
    }

    /// Adds a filter.
    pub fn filter<F>(&mut self, input: NodeId, predicate: F) -> NodeId
    where
        F: Fn(&Row) -> std::result::Result<bool, TransformError> + Send + Sync + 'static,
    {
        let predicate: PredicateFn = Box::new(predicate);
        self.add_node(NodeKind::Filter { predicate }, vec![input])
    }

    /// Adds a one-to-many transformation producing `arity` columns per row.
    pub fn flat_map<F>(&mut self, input: NodeId, arity: usize, mapper: F) -> NodeId
    where
        F: Fn(&Row) -> std::result::Result<Vec<Vec<Value>>, TransformError>
            + Send
            + Sync
            + 'static,
    {
        let mapper: FlatMapperFn = Box::new(mapper);
        self.add_node(NodeKind::FlatMap { arity, mapper }, vec![input])
    }

    /// Re-derives row identities from the given columns.
    pub fn reindex(&mut self, input: NodeId, columns: Vec<ColumnId>) -> NodeId {
        self.add_node(NodeKind::Reindex { columns }, vec![input])
    }

    /// Adds an equi-join on the given column lists.
    pub fn join(
        &mut self,
        left: NodeId,
        right: NodeId,
        left_on: Vec<ColumnId>,
        right_on: Vec<ColumnId>,
        join_type: JoinType,
    ) -> NodeId {
        self.add_node(
            NodeKind::Join {
                left_on,
                right_on,
                join_type,
            },
            vec![left, right],
        )
    }

    /// Adds a grouped aggregation. Output columns are the group columns followed by
    /// one column per reducer.
    pub fn reduce(
        &mut self,
        input: NodeId,
        group_by: Vec<ColumnId>,
        reducers: Vec<Reducer>,
    ) -> NodeId {
        self.add_node(NodeKind::Reduce { group_by, reducers }, vec![input])
    }

    /// Adds a union of tables with disjoint identities.
    pub fn concat(&mut self, inputs: &[NodeId]) -> NodeId {
        self.add_node(NodeKind::Concat, inputs.to_vec())
    }

    /// Keeps rows of `input` whose identity is in the universe of `universe_of`.
    pub fn restrict(&mut self, input: NodeId, universe_of: NodeId) -> NodeId {
        self.add_node(NodeKind::Restrict, vec![input, universe_of])
    }

    /// Replaces rows of `base` by rows of `updates` with the same identity.
    pub fn update_rows(&mut self, base: NodeId, updates: NodeId) -> NodeId {
        self.add_node(NodeKind::UpdateRows, vec![base, updates])
    }

    /// Concatenates the columns of two tables with equal universes.
    pub fn zip(&mut self, left: NodeId, right: NodeId) -> NodeId {
        self.add_node(NodeKind::Zip, vec![left, right])
    }

    /// Keeps rows of `input` whose identity is in the universe of every table in
    /// `others`.
    pub fn intersect(&mut self, input: NodeId, others: &[NodeId]) -> NodeId {
        let mut inputs = vec![input];
        inputs.extend_from_slice(others);
        self.add_node(NodeKind::Intersect, inputs)
    }

    /// Keeps rows of `left` whose identity is not in the universe of `right`.
    pub fn subtract(&mut self, left: NodeId, right: NodeId) -> NodeId {
        self.add_node(NodeKind::Subtract, vec![left, right])
    }

    /// Looks up, for each row of `keys`, the row of `to_ix` referenced by the
    /// pointer in `column`. Output rows carry the identity of the `keys` row and
    /// the values of the referenced row.
    pub fn ix(
        &mut self,
        to_ix: NodeId,
        keys: NodeId,
        column: ColumnId,
        policy: IxPolicy,
    ) -> NodeId {
        self.add_node(NodeKind::Ix { column, policy }, vec![to_ix, keys])
    }

    /// Adds a named output.
    pub fn output(&mut self, input: NodeId, name: impl Into<String>) -> NodeId {
        let id = self.add_node(NodeKind::Output, vec![input]);
        self.rename(id, name)
    }

    /// Adds a fixpoint iteration.
    ///
    /// `body` receives a fresh builder along with one source per variable and one per
    /// import, and returns one result node per variable. Each round feeds the results
    /// back into the variable sources; the loop stops when a round reproduces its
    /// input. Returns the nodes carrying the final value of each variable.
    pub fn iterate<F>(
        &mut self,
        variables: &[NodeId],
        imports: &[NodeId],
        limit: Option<u32>,
        body: F,
    ) -> Result<Vec<NodeId>>
    where
        F: FnOnce(&mut GraphBuilder, &[NodeId], &[NodeId]) -> Vec<NodeId>,
    {
        let mut inner = GraphBuilder::new();
        let mut var_sources = Vec::with_capacity(variables.len());
        for (i, &v) in variables.iter().enumerate() {
            let arity = self.arity_of(v)?;
            var_sources.push(inner.source(format!("var{i}"), untyped(arity)));
        }
        let mut import_sources = Vec::with_capacity(imports.len());
        for (i, &v) in imports.iter().enumerate() {
            let arity = self.arity_of(v)?;
            import_sources.push(inner.source(format!("import{i}"), untyped(arity)));
        }

        let results = body(&mut inner, &var_sources, &import_sources);
        if results.len() != variables.len() {
            return Err(Error::invalid_graph(format!(
                "iteration body returned {} results for {} variables",
                results.len(),
                variables.len()
            )));
        }
        let graph = inner.build()?;
        if let Some(name) = graph.outputs().keys().next() {
            return Err(Error::invalid_graph(format!(
                "output {name} inside an iteration body"
            )));
        }
        for (&source, &result) in var_sources.iter().zip(&results) {
            let (want, got) = (graph.node(source).arity(), graph.node(result).arity());
            if want != got {
                return Err(Error::invalid_graph(format!(
                    "iteration result {} has {got} columns, variable has {want}",
                    graph.node(result).name()
                )));
            }
        }

        let spec = IterateSpec {
            body: graph,
            variables: var_sources.into_iter().zip(results).collect(),
            imports: import_sources,
            limit,
        };
        let mut inputs = variables.to_vec();
        inputs.extend_from_slice(imports);
        let iterate = self.add_node(NodeKind::Iterate(Box::new(spec)), inputs);
        Ok((0..variables.len())
            .map(|index| self.add_node(NodeKind::IterateResult { index }, vec![iterate]))
            .collect())
    }

    /// Promises that every identity of `sub` is also an identity of `sup`.
    pub fn promise_universe_is_subset_of(&mut self, sub: NodeId, sup: NodeId) {
        self.promises.push(Promise::Subset { sub, sup });
    }

    /// Promises that two tables always hold the same identities.
    pub fn promise_universes_are_equal(&mut self, a: NodeId, b: NodeId) {
        self.promises.push(Promise::Equal(a, b));
    }

    /// Computes the arity of a node from what has been added so far.
    pub fn arity_of(&self, id: NodeId) -> Result<usize> {
        let mut visiting = vec![false; self.nodes.len()];
        self.arity_inner(id, &mut visiting)
    }

    fn arity_inner(&self, id: NodeId, visiting: &mut [bool]) -> Result<usize> {
        let node = self
            .nodes
            .get(id)
            .ok_or_else(|| Error::UnknownNode(format!("#{id}")))?;
        let kind = node.kind.as_ref().ok_or_else(|| {
            Error::invalid_graph(format!(
                "arity of {} is unknown before it is defined",
                self.display_name(id)
            ))
        })?;
        if visiting[id] {
            return Err(Error::CyclicGraph {
                nodes: vec![self.display_name(id)],
            });
        }
        visiting[id] = true;
        let input_arity = |i: usize, visiting: &mut [bool]| -> Result<usize> {
            let input = *node.inputs.get(i).ok_or_else(|| {
                Error::invalid_graph(format!("{} is missing input {i}", self.display_name(id)))
            })?;
            self.arity_inner(input, visiting)
        };
        let arity = match kind {
            NodeKind::Source { schema, .. } => schema.arity(),
            NodeKind::Map { arity, .. } | NodeKind::FlatMap { arity, .. } => *arity,
            NodeKind::Project { columns } => columns.len(),
            NodeKind::Filter { .. }
            | NodeKind::Reindex { .. }
            | NodeKind::Concat
            | NodeKind::Restrict
            | NodeKind::UpdateRows
            | NodeKind::Intersect
            | NodeKind::Subtract
            | NodeKind::Ix { .. }
            | NodeKind::Output => input_arity(0, visiting)?,
            NodeKind::Join { .. } | NodeKind::Zip => {
                input_arity(0, visiting)? + input_arity(1, visiting)?
            }
            NodeKind::Reduce { group_by, reducers } => group_by.len() + reducers.len(),
            NodeKind::Iterate(_) => 0,
            NodeKind::IterateResult { index } => {
                let iterate = input_arity(0, visiting).map(|_| node.inputs[0])?;
                match self.nodes[iterate].kind.as_ref() {
                    Some(NodeKind::Iterate(spec)) => spec
                        .variables
                        .get(*index)
                        .map(|&(_, result)| spec.body.node(result).arity())
                        .ok_or_else(|| {
                            Error::invalid_graph(format!("iteration has no result {index}"))
                        })?,
                    _ => {
                        return Err(Error::invalid_graph(format!(
                            "{} does not read from an iteration",
                            self.display_name(id)
                        )))
                    }
                }
            }
        };
        visiting[id] = false;
        Ok(arity)
    }

    fn display_name(&self, id: NodeId) -> String {
        match &self.nodes[id] {
            PendingNode { name: Some(n), .. } => n.clone(),
            PendingNode { kind: Some(k), .. } => format!("{}#{id}", k.tag()),
            _ => format!("#{id}"),
        }
    }

    /// Validates the graph and freezes it.
    pub fn build(self) -> Result<Graph> {
        let len = self.nodes.len();
        let names: Vec<String> = (0..len).map(|id| self.display_name(id)).collect();

        let mut seen = BTreeSet::new();
        for name in &names {
            if !seen.insert(name.as_str()) {
                return Err(Error::invalid_graph(format!("duplicate operator name {name}")));
            }
        }

        let mut kinds = Vec::with_capacity(len);
        let mut inputs = Vec::with_capacity(len);
        for (id, node) in self.nodes.into_iter().enumerate() {
            let kind = node.kind.ok_or_else(|| {
                Error::invalid_graph(format!("{} is declared but never defined", names[id]))
            })?;
            for &input in &node.inputs {
                if input >= len {
                    return Err(Error::UnknownNode(format!(
                        "#{input} (input of {})",
                        names[id]
                    )));
                }
            }
            check_input_count(&names[id], &kind, node.inputs.len())?;
            kinds.push(kind);
            inputs.push(node.inputs);
        }

        let order = topological_order(&names, &inputs)?;

        let mut dependents = vec![Vec::new(); len];
        for (id, ins) in inputs.iter().enumerate() {
            for &input in ins {
                if !dependents[input].contains(&id) {
                    dependents[input].push(id);
                }
            }
        }

        let mut level = vec![0usize; len];
        let mut arity = vec![0usize; len];
        let mut universe = vec![0usize; len];
        let mut universes = UniverseRegistry::new();
        for &id in &order {
            level[id] = inputs[id].iter().map(|&i| level[i] + 1).max().unwrap_or(0);
            let name = &names[id];
            let ins = &inputs[id];
            let in_arity = |i: usize| arity[ins[i]];
            let (a, u) = match &kinds[id] {
                NodeKind::Source { schema, .. } => (schema.arity(), universes.fresh()),
                NodeKind::Map { arity, .. } => (*arity, universe[ins[0]]),
                NodeKind::Project { columns } => {
                    check_columns(name, columns, in_arity(0))?;
                    (columns.len(), universe[ins[0]])
                }
                NodeKind::Filter { .. } => (in_arity(0), universes.subset_of(universe[ins[0]])),
                NodeKind::FlatMap { arity, .. } => (*arity, universes.fresh()),
                NodeKind::Reindex { columns } => {
                    check_columns(name, columns, in_arity(0))?;
                    (in_arity(0), universes.fresh())
                }
                NodeKind::Join {
                    left_on, right_on, ..
                } => {
                    check_columns(name, left_on, in_arity(0))?;
                    check_columns(name, right_on, in_arity(1))?;
                    if left_on.len() != right_on.len() {
                        return Err(Error::invalid_graph(format!(
                            "{name} joins {} left columns with {} right columns",
                            left_on.len(),
                            right_on.len()
                        )));
                    }
                    (in_arity(0) + in_arity(1), universes.fresh())
                }
                NodeKind::Reduce { group_by, reducers } => {
                    check_columns(name, group_by, in_arity(0))?;
                    let columns: Vec<ColumnId> =
                        reducers.iter().filter_map(Reducer::column).collect();
                    check_columns(name, &columns, in_arity(0))?;
                    (group_by.len() + reducers.len(), universes.fresh())
                }
                NodeKind::Concat => {
                    let a = in_arity(0);
                    if let Some(&bad) = ins.iter().find(|&&i| arity[i] != a) {
                        return Err(Error::invalid_graph(format!(
                            "{name} concatenates tables with {a} and {} columns",
                            arity[bad]
                        )));
                    }
                    let u = universes.fresh();
                    for &i in ins {
                        universes.add_subset(universe[i], u);
                    }
                    (a, u)
                }
                NodeKind::Restrict => (in_arity(0), universe[ins[1]]),
                NodeKind::UpdateRows => {
                    if in_arity(0) != in_arity(1) {
                        return Err(Error::invalid_graph(format!(
                            "{name} updates a table of {} columns with {} columns",
                            in_arity(0),
                            in_arity(1)
                        )));
                    }
                    let u = universes.fresh();
                    universes.add_subset(universe[ins[0]], u);
                    universes.add_subset(universe[ins[1]], u);
                    (in_arity(0), u)
                }
                NodeKind::Zip => (in_arity(0) + in_arity(1), universe[ins[0]]),
                NodeKind::Intersect => {
                    let u = universes.subset_of(universe[ins[0]]);
                    for &other in &ins[1..] {
                        universes.add_subset(u, universe[other]);
                    }
                    (in_arity(0), u)
                }
                NodeKind::Subtract => (in_arity(0), universes.subset_of(universe[ins[0]])),
                NodeKind::Ix { column, policy } => {
                    check_columns(name, &[*column], in_arity(1))?;
                    let u = match policy {
                        IxPolicy::SkipMissing => universes.subset_of(universe[ins[1]]),
                        IxPolicy::FailMissing | IxPolicy::ForwardNone => universe[ins[1]],
                    };
                    (in_arity(0), u)
                }
                NodeKind::Iterate(spec) => {
                    let body_sources = spec
                        .variables
                        .iter()
                        .map(|&(source, _)| source)
                        .chain(spec.imports.iter().copied());
                    for (&input, source) in ins.iter().zip(body_sources) {
                        if arity[input] != spec.body.node(source).arity() {
                            return Err(Error::invalid_graph(format!(
                                "{name} expects {} columns from {}, got {}",
                                spec.body.node(source).arity(),
                                names[input],
                                arity[input]
                            )));
                        }
                    }
                    (0, universes.fresh())
                }
                NodeKind::IterateResult { index } => {
                    let result = match &kinds[ins[0]] {
                        NodeKind::Iterate(spec) => spec.variables.get(*index).map(|v| v.1),
                        _ => None,
                    };
                    match (result, &kinds[ins[0]]) {
                        (Some(result), NodeKind::Iterate(spec)) => {
                            (spec.body.node(result).arity(), universes.fresh())
                        }
                        _ => {
                            return Err(Error::invalid_graph(format!(
                                "{name} does not read result {index} of an iteration"
                            )))
                        }
                    }
                }
                NodeKind::Output => (in_arity(0), universe[ins[0]]),
            };
            arity[id] = a;
            universe[id] = u;
            if ins
                .iter()
                .any(|&i| matches!(kinds[i], NodeKind::Output))
            {
                return Err(Error::invalid_graph(format!("{name} reads from an output")));
            }
            if ins.iter().any(|&i| matches!(kinds[i], NodeKind::Iterate(_)))
                && !matches!(kinds[id], NodeKind::IterateResult { .. })
            {
                return Err(Error::invalid_graph(format!(
                    "{name} reads an iteration directly"
                )));
            }
        }

        for promise in &self.promises {
            match *promise {
                Promise::Subset { sub, sup } if sub < len && sup < len => {
                    universes.add_subset(universe[sub], universe[sup])
                }
                Promise::Equal(a, b) if a < len && b < len => {
                    universes.union(universe[a], universe[b])
                }
                _ => return Err(Error::UnknownNode("node named in a universe promise".into())),
            }
        }

        for &id in &order {
            let ins = &inputs[id];
            match kinds[id] {
                NodeKind::Restrict if !universes.is_subset(universe[ins[1]], universe[ins[0]]) => {
                    return Err(Error::universe_mismatch(
                        names[id].clone(),
                        format!(
                            "universe of {} is not a subset of the universe of {}",
                            names[ins[1]], names[ins[0]]
                        ),
                    ));
                }
                NodeKind::Zip if !universes.are_equal(universe[ins[0]], universe[ins[1]]) => {
                    return Err(Error::universe_mismatch(
                        names[id].clone(),
                        format!(
                            "{} and {} do not share a universe",
                            names[ins[0]], names[ins[1]]
                        ),
                    ));
                }
                _ => {}
            }
        }

        let max_level = order.iter().map(|&id| level[id]).max().unwrap_or(0);
        let mut levels = vec![Vec::new(); if len == 0 { 0 } else { max_level + 1 }];
        for &id in &order {
            levels[level[id]].push(id);
        }
        for l in &mut levels {
            l.sort_unstable();
        }

        let mut sources = BTreeMap::new();
        let mut outputs = BTreeMap::new();
        for (id, kind) in kinds.iter().enumerate() {
            match kind {
                NodeKind::Source { .. } => {
                    sources.insert(names[id].clone(), id);
                }
                NodeKind::Output => {
                    outputs.insert(names[id].clone(), id);
                }
                _ => {}
            }
        }

        let nodes: Vec<Node> = kinds
            .into_iter()
            .zip(inputs)
            .zip(names)
            .enumerate()
            .map(|(id, ((kind, inputs), name))| Node {
                name,
                kind,
                inputs,
                arity: arity[id],
                universe: universe[id],
                level: level[id],
            })
            .collect();
        let fingerprint = fingerprint(&nodes);

        Ok(Graph {
            nodes,
            order,
            levels,
            dependents,
            sources,
            outputs,
            universes,
            fingerprint,
        })
    }
}

fn untyped(arity: usize) -> Schema {
    Schema::untyped((0..arity).map(|c| format!("c{c}")))
}

fn check_input_count(name: &str, kind: &NodeKind, count: usize) -> Result<()> {
    let expected = match kind {
        NodeKind::Source { .. } => Some(0),
        NodeKind::Map { .. }
        | NodeKind::Project { .. }
        | NodeKind::Filter { .. }
        | NodeKind::FlatMap { .. }
        | NodeKind::Reindex { .. }
        | NodeKind::Reduce { .. }
        | NodeKind::IterateResult { .. }
        | NodeKind::Output => Some(1),
        NodeKind::Join { .. }
        | NodeKind::Restrict
        | NodeKind::UpdateRows
        | NodeKind::Zip
        | NodeKind::Subtract
        | NodeKind::Ix { .. } => Some(2),
        NodeKind::Iterate(spec) => Some(spec.variables.len() + spec.imports.len()),
        NodeKind::Concat | NodeKind::Intersect if count == 0 => {
            return Err(Error::invalid_graph(format!("{name} has no inputs")));
        }
        NodeKind::Concat | NodeKind::Intersect => None,
    };
    match expected {
        Some(e) if e != count => Err(Error::invalid_graph(format!(
            "{name} takes {e} inputs, got {count}"
        ))),
        _ => Ok(()),
    }
}

fn check_columns(name: &str, columns: &[ColumnId], arity: usize) -> Result<()> {
    match columns.iter().find(|&&c| c >= arity) {
        Some(c) => Err(Error::invalid_graph(format!(
            "{name} refers to column {c} of a table with {arity} columns"
        ))),
        None => Ok(()),
    }
}

/// Kahn's algorithm, always releasing the smallest ready id first.
fn topological_order(names: &[String], inputs: &[Vec<NodeId>]) -> Result<Vec<NodeId>> {
    let len = inputs.len();
    let mut pending: Vec<usize> = inputs.iter().map(Vec::len).collect();
    let mut dependents = vec![Vec::new(); len];
    for (id, ins) in inputs.iter().enumerate() {
        for &input in ins {
            dependents[input].push(id);
        }
    }
    let mut ready: BTreeSet<NodeId> = (0..len).filter(|&id| pending[id] == 0).collect();
    let mut order = Vec::with_capacity(len);
    while let Some(id) = ready.pop_first() {
        order.push(id);
        for &d in &dependents[id] {
            pending[d] -= 1;
            if pending[d] == 0 {
                ready.insert(d);
            }
        }
    }
    if order.len() == len {
        return Ok(order);
    }

    // Walk backwards through unfinished inputs until a node repeats.
    let mut path: Vec<NodeId> = Vec::new();
    let mut position = vec![None; len];
    let mut current = (0..len).find(|&id| pending[id] > 0).unwrap_or(0);
    loop {
        if let Some(start) = position[current] {
            let mut nodes = vec![names[current].clone()];
            nodes.extend(path[start..].iter().rev().map(|&id| names[id].clone()));
            return Err(Error::CyclicGraph { nodes });
        }
        position[current] = Some(path.len());
        path.push(current);
        current = match inputs[current].iter().find(|&&i| pending[i] > 0) {
            Some(&next) => next,
            None => {
                return Err(Error::CyclicGraph {
                    nodes: vec![names[current].clone()],
                })
            }
        };
    }
}

fn fingerprint(nodes: &[Node]) -> u64 {
    let mut hasher = XxHash64::with_seed(FINGERPRINT_SEED);
    nodes.len().hash(&mut hasher);
    for node in nodes {
        node.name.hash(&mut hasher);
        format!("{:?}", node.kind).hash(&mut hasher);
        node.inputs.hash(&mut hasher);
        node.arity.hash(&mut hasher);
        match &node.kind {
            NodeKind::Source { schema, .. } => format!("{schema:?}").hash(&mut hasher),
            NodeKind::Iterate(spec) => {
                spec.body.fingerprint().hash(&mut hasher);
                spec.variables.hash(&mut hasher);
                spec.imports.hash(&mut hasher);
            }
            _ => {}
        }
    }
    hasher.finish()
}
