//! Universe bookkeeping.
//!
//! Every table has a universe: the set of identities it may contain. Operators that
//! keep identities (map, project) share the universe of their input, filtering ones
//! produce a subset, and everything else starts a fresh universe. Equalities are
//! kept in a union-find; subset relations form a graph over its classes.

/// Identifier of a universe within one graph.
pub type UniverseId = usize;

/// Equality and subset relations between universes.
#[derive(Clone, Debug, Default)]
pub struct UniverseRegistry {
    parent: Vec<UniverseId>,
    /// `(sub, sup)` pairs, over original ids.
    subsets: Vec<(UniverseId, UniverseId)>,
}

impl UniverseRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a universe unrelated to any other.
    pub fn fresh(&mut self) -> UniverseId {
        let id = self.parent.len();
        self.parent.push(id);
        id
    }

    /// Allocates a universe known to be a subset of `sup`.
    pub fn subset_of(&mut self, sup: UniverseId) -> UniverseId {
        let id = self.fresh();
        self.subsets.push((id, sup));
        id
    }

    /// Returns the number of allocated universes.
    pub fn len(&self) -> usize {
        self.parent.len()
    }

    /// Returns true if no universe was allocated.
    pub fn is_empty(&self) -> bool {
        self.parent.is_empty()
    }

    fn find(&self, mut id: UniverseId) -> UniverseId {
        while self.parent[id] != id {
            id = self.parent[id];
        }
        id
    }

    /// Records that two universes are equal.
    pub fn union(&mut self, a: UniverseId, b: UniverseId) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            // Keep the older class as representative.
            let (keep, merge) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[merge] = keep;
        }
    }

    /// Records that `sub` is a subset of `sup`.
    pub fn add_subset(&mut self, sub: UniverseId, sup: UniverseId) {
        self.subsets.push((sub, sup));
    }

    /// Returns true if `sub` is known to be a subset of (or equal to) `sup`.
    pub fn is_subset(&self, sub: UniverseId, sup: UniverseId) -> bool {
        let target = self.find(sup);
        let start = self.find(sub);
        if start == target {
            return true;
        }
        let mut visited = vec![false; self.parent.len()];
        let mut stack = vec![start];
        visited[start] = true;
        while let Some(current) = stack.pop() {
            for &(a, b) in &self.subsets {
                if self.find(a) != current {
                    continue;
                }
                let next = self.find(b);
                if next == target {
                    return true;
                }
                if !visited[next] {
                    visited[next] = true;
                    stack.push(next);
                }
            }
        }
        false
    }

    /// Returns true if the two universes are known to be equal.
    pub fn are_equal(&self, a: UniverseId, b: UniverseId) -> bool {
        self.find(a) == self.find(b) || (self.is_subset(a, b) && self.is_subset(b, a))
    }
}
