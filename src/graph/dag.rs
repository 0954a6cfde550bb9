//! Dependency graph with deterministic ordering.
//!
//! Nodes map to the set of nodes they depend on. Every ordering breaks ties
//! by node name, so the result never depends on insertion order.

use std::collections::{BTreeMap, BTreeSet};

/// Directed acyclic graph of node dependencies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dag {
    /// node -> nodes it depends on
    deps: BTreeMap<String, BTreeSet<String>>,
}

impl Dag {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node with no dependencies (no-op if present).
    pub fn add_node(&mut self, node: impl Into<String>) {
        self.deps.entry(node.into()).or_default();
    }

    /// Records that `node` depends on `dependency`.
    ///
    /// The dependency does not need to be a node yet; see [`Dag::dangling`].
    pub fn add_edge(&mut self, dependency: impl Into<String>, node: impl Into<String>) {
        self.deps
            .entry(node.into())
            .or_default()
            .insert(dependency.into());
    }

    /// Returns true if the node exists.
    #[must_use]
    pub fn contains(&self, node: &str) -> bool {
        self.deps.contains_key(node)
    }

    /// Node names in sorted order.
    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.deps.keys().map(String::as_str)
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.deps.len()
    }

    /// Returns true if the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.deps.is_empty()
    }

    /// Direct dependencies of a node.
    #[must_use]
    pub fn dependencies(&self, node: &str) -> Option<&BTreeSet<String>> {
        self.deps.get(node)
    }

    /// Edges whose dependency is not a node: `(node, missing dependency)`.
    #[must_use]
    pub fn dangling(&self) -> Vec<(&str, &str)> {
        self.deps
            .iter()
            .flat_map(|(node, deps)| {
                deps.iter()
                    .filter(|d| !self.deps.contains_key(d.as_str()))
                    .map(move |d| (node.as_str(), d.as_str()))
            })
            .collect()
    }

    /// Kahn's algorithm with a name-ordered ready set.
    ///
    /// # Errors
    ///
    /// Returns a cycle (first node repeated at the end) if the graph is not
    /// acyclic.
    pub fn topological_order(&self) -> Result<Vec<String>, Vec<String>> {
        let mut frontier = Frontier::new(self);
        let mut order = Vec::with_capacity(self.len());

        while let Some(node) = frontier.pop_ready() {
            frontier.complete(&node);
            order.push(node);
        }

        if order.len() == self.len() {
            Ok(order)
        } else {
            Err(self.find_cycle().unwrap_or_default())
        }
    }

    /// Finds one cycle, starting from the smallest node name that is on one.
    #[must_use]
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Mark {
            Unvisited,
            OnStack,
            Done,
        }

        fn visit<'a>(
            dag: &'a Dag,
            node: &'a str,
            marks: &mut BTreeMap<&'a str, Mark>,
            stack: &mut Vec<&'a str>,
        ) -> Option<Vec<String>> {
            marks.insert(node, Mark::OnStack);
            stack.push(node);

            for dep in dag.deps.get(node).into_iter().flatten() {
                let Some((dep_name, _)) = dag.deps.get_key_value(dep.as_str()) else {
                    continue;
                };
                match marks.get(dep_name.as_str()).copied().unwrap_or(Mark::Unvisited) {
                    Mark::OnStack => {
                        let start = stack.iter().position(|n| *n == dep_name.as_str())?;
                        // Stack holds dependents before dependencies; report in
                        // dependency direction: a -> b means b waits for a.
                        let mut cycle: Vec<String> =
                            stack[start..].iter().rev().map(|n| (*n).to_string()).collect();
                        cycle.insert(0, dep_name.clone());
                        return Some(cycle);
                    }
                    Mark::Unvisited => {
                        if let Some(cycle) = visit(dag, dep_name, marks, stack) {
                            return Some(cycle);
                        }
                    }
                    Mark::Done => {}
                }
            }

            stack.pop();
            marks.insert(node, Mark::Done);
            None
        }

        let mut marks: BTreeMap<&str, Mark> = BTreeMap::new();
        for node in self.deps.keys() {
            if marks.get(node.as_str()).copied().unwrap_or(Mark::Unvisited) == Mark::Unvisited {
                let mut stack = Vec::new();
                if let Some(cycle) = visit(self, node, &mut marks, &mut stack) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    /// The same graph with every edge reversed (for teardown).
    #[must_use]
    pub fn reversed(&self) -> Self {
        let mut reversed = Self::new();
        for (node, deps) in &self.deps {
            reversed.add_node(node.clone());
            for dep in deps {
                if self.contains(dep) {
                    reversed.add_edge(node.clone(), dep.clone());
                }
            }
        }
        reversed
    }

    /// Restricts the graph to `keep`, dropping edges to removed nodes.
    #[must_use]
    pub fn subgraph(&self, keep: &BTreeSet<String>) -> Self {
        let deps = self
            .deps
            .iter()
            .filter(|(node, _)| keep.contains(*node))
            .map(|(node, deps)| {
                let kept = deps.iter().filter(|d| keep.contains(*d)).cloned().collect();
                (node.clone(), kept)
            })
            .collect();
        Self { deps }
    }
}

/// Incremental scheduler view of a [`Dag`].
///
/// Nodes become ready once every dependency has completed. Dependencies that
/// are not nodes of the graph count as already satisfied.
#[derive(Debug, Clone)]
pub struct Frontier {
    remaining: BTreeMap<String, BTreeSet<String>>,
    dependents: BTreeMap<String, BTreeSet<String>>,
    ready: BTreeSet<String>,
    started: BTreeSet<String>,
    completed: BTreeSet<String>,
}

impl Frontier {
    /// Builds the frontier for a graph.
    #[must_use]
    pub fn new(dag: &Dag) -> Self {
        let mut remaining = BTreeMap::new();
        let mut dependents: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut ready = BTreeSet::new();

        for (node, deps) in &dag.deps {
            let pending: BTreeSet<String> =
                deps.iter().filter(|d| dag.contains(d)).cloned().collect();
            for dep in &pending {
                dependents.entry(dep.clone()).or_default().insert(node.clone());
            }
            if pending.is_empty() {
                ready.insert(node.clone());
            }
            remaining.insert(node.clone(), pending);
        }

        Self {
            remaining,
            dependents,
            ready,
            started: BTreeSet::new(),
            completed: BTreeSet::new(),
        }
    }

    /// Takes the ready node with the smallest name.
    pub fn pop_ready(&mut self) -> Option<String> {
        let node = self.ready.pop_first()?;
        self.started.insert(node.clone());
        Some(node)
    }

    /// Marks a node as completed, releasing its dependents.
    pub fn complete(&mut self, node: &str) {
        if !self.completed.insert(node.to_string()) {
            return;
        }
        let Some(dependents) = self.dependents.get(node) else {
            return;
        };
        for dependent in dependents {
            if let Some(pending) = self.remaining.get_mut(dependent) {
                pending.remove(node);
                if pending.is_empty() && !self.started.contains(dependent) {
                    self.ready.insert(dependent.clone());
                }
            }
        }
    }

    /// Nodes ready to start.
    #[must_use]
    pub const fn ready(&self) -> &BTreeSet<String> {
        &self.ready
    }

    /// Nodes never handed out by [`Frontier::pop_ready`], in name order.
    #[must_use]
    pub fn not_started(&self) -> Vec<String> {
        self.remaining
            .keys()
            .filter(|n| !self.started.contains(*n))
            .cloned()
            .collect()
    }

    /// Returns true once every node has completed.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.completed.len() >= self.remaining.len()
            && self.remaining.keys().all(|n| self.completed.contains(n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dag(edges: &[(&str, &str)], nodes: &[&str]) -> Dag {
        let mut dag = Dag::new();
        for node in nodes {
            dag.add_node(*node);
        }
        for (dep, node) in edges {
            dag.add_edge(*dep, *node);
        }
        dag
    }

    fn position(order: &[String], node: &str) -> usize {
        order.iter().position(|n| n == node).unwrap()
    }

    #[test]
    fn test_order_respects_edges() {
        let g = dag(
            &[("sgA", "instanceA"), ("sgB", "instanceA")],
            &["instanceA", "sgB", "sgA"],
        );
        let order = g.topological_order().unwrap();
        assert_eq!(order, vec!["sgA", "sgB", "instanceA"]);
    }

    #[test]
    fn test_order_is_independent_of_insertion() {
        let a = dag(
            &[("vpc", "subnets"), ("subnets", "dbSubnetGroup"), ("sg", "db")],
            &["db", "sg", "vpc"],
        );
        let b = dag(
            &[("sg", "db"), ("subnets", "dbSubnetGroup"), ("vpc", "subnets")],
            &["vpc", "sg", "db"],
        );
        assert_eq!(a.topological_order(), b.topological_order());
    }

    #[test]
    fn test_two_cycle() {
        let g = dag(&[("a", "b"), ("b", "a")], &["a", "b"]);
        let cycle = g.topological_order().unwrap_err();
        assert_eq!(cycle.first(), cycle.last());
        assert_eq!(cycle.len(), 3);
        assert!(cycle.contains(&"a".to_string()) && cycle.contains(&"b".to_string()));
    }

    #[test]
    fn test_three_cycle_with_tail() {
        let g = dag(
            &[("root", "a"), ("a", "b"), ("b", "c"), ("c", "a")],
            &["root", "a", "b", "c"],
        );
        let cycle = g.find_cycle().unwrap();
        assert_eq!(cycle.len(), 4);
        assert!(!cycle.contains(&"root".to_string()));
        assert_eq!(cycle.first(), cycle.last());
    }

    #[test]
    fn test_acyclic_has_no_cycle() {
        let g = dag(&[("a", "b"), ("a", "c"), ("b", "d"), ("c", "d")], &[]);
        assert!(g.find_cycle().is_none());
        let order = g.topological_order().unwrap();
        assert!(position(&order, "a") < position(&order, "b"));
        assert!(position(&order, "c") < position(&order, "d"));
    }

    #[test]
    fn test_dangling_edges() {
        let g = dag(&[("ghost", "policy")], &["policy"]);
        assert_eq!(g.dangling(), vec![("policy", "ghost")]);
    }

    #[test]
    fn test_reversed_order_tears_down_dependents_first() {
        let g = dag(&[("bucket", "policy"), ("bucket", "website")], &[]);
        let order = g.reversed().topological_order().unwrap();
        assert_eq!(order.last().map(String::as_str), Some("bucket"));
    }

    #[test]
    fn test_subgraph_drops_external_edges() {
        let g = dag(&[("vpc", "sg"), ("sg", "api")], &[]);
        let keep: BTreeSet<String> = ["sg".to_string(), "api".to_string()].into();
        let sub = g.subgraph(&keep);
        assert!(sub.dependencies("sg").unwrap().is_empty());
        assert!(sub.dangling().is_empty());
    }

    #[test]
    fn test_frontier_releases_in_waves() {
        let g = dag(&[("a", "c"), ("b", "c")], &[]);
        let mut frontier = Frontier::new(&g);

        assert_eq!(frontier.pop_ready().as_deref(), Some("a"));
        assert_eq!(frontier.pop_ready().as_deref(), Some("b"));
        assert_eq!(frontier.pop_ready(), None);

        frontier.complete("a");
        assert!(frontier.ready().is_empty());
        frontier.complete("b");
        assert_eq!(frontier.pop_ready().as_deref(), Some("c"));
        assert!(!frontier.is_finished());
        frontier.complete("c");
        assert!(frontier.is_finished());
        assert!(frontier.not_started().is_empty());
    }
}
