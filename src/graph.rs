//! Dependency Graph: directed edges `dependent -> dependency`,
//! topological ordering with a deterministic tie-break, cycle detection,
//! and reverse lookups.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use parking_lot::RwLock;

use crate::error::GraphError;

/// A DAG of module names. Guarded by a single read-write lock: readers
/// (topological sort, lookups) take the read side, mutators (`add_edge`,
/// `remove_node`) take the write side.
#[derive(Default)]
pub struct DependencyGraph {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    /// dependent -> set of dependencies
    deps: HashMap<String, BTreeSet<String>>,
    /// dependency -> set of dependents
    rdeps: HashMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent: ensures `name` has an entry, even with no edges.
    pub fn add_node(&self, name: &str) {
        let mut inner = self.inner.write();
        inner.deps.entry(name.to_string()).or_default();
        inner.rdeps.entry(name.to_string()).or_default();
    }

    /// Idempotent: `dependent` depends on `dependency`. Creates both nodes
    /// if absent.
    pub fn add_edge(&self, dependent: &str, dependency: &str) {
        let mut inner = self.inner.write();
        inner
            .deps
            .entry(dependent.to_string())
            .or_default()
            .insert(dependency.to_string());
        inner
            .rdeps
            .entry(dependency.to_string())
            .or_default()
            .insert(dependent.to_string());
        inner.deps.entry(dependency.to_string()).or_default();
        inner.rdeps.entry(dependent.to_string()).or_default();
    }

    /// Removes `name` and every edge touching it.
    pub fn remove_node(&self, name: &str) {
        let mut inner = self.inner.write();
        if let Some(dependencies) = inner.deps.remove(name) {
            for dep in &dependencies {
                if let Some(set) = inner.rdeps.get_mut(dep) {
                    set.remove(name);
                }
            }
        }
        if let Some(dependents) = inner.rdeps.remove(name) {
            for dpt in &dependents {
                if let Some(set) = inner.deps.get_mut(dpt) {
                    set.remove(name);
                }
            }
        }
    }

    pub fn dependencies_of(&self, name: &str) -> BTreeSet<String> {
        self.inner
            .read()
            .deps
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    pub fn dependents_of(&self, name: &str) -> BTreeSet<String> {
        self.inner
            .read()
            .rdeps
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    pub fn transitive_dependencies_of(&self, name: &str) -> BTreeSet<String> {
        let inner = self.inner.read();
        Self::transitive(&inner.deps, name)
    }

    pub fn transitive_dependents_of(&self, name: &str) -> BTreeSet<String> {
        let inner = self.inner.read();
        Self::transitive(&inner.rdeps, name)
    }

    fn transitive(edges: &HashMap<String, BTreeSet<String>>, start: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(start.to_string());
        while let Some(node) = queue.pop_front() {
            if let Some(next) = edges.get(&node) {
                for n in next {
                    if seen.insert(n.clone()) {
                        queue.push_back(n.clone());
                    }
                }
            }
        }
        seen
    }

    pub fn has_node(&self, name: &str) -> bool {
        self.inner.read().deps.contains_key(name)
    }

    pub fn nodes(&self) -> Vec<String> {
        self.inner.read().deps.keys().cloned().collect()
    }

    /// Topologically sorts `subset` (or every known node when `None`) so
    /// that every dependency appears before its dependent. Ties are broken
    /// lexicographically on name so the output is reproducible (Kahn's
    /// algorithm with a sorted frontier).
    pub fn topological_order(&self, subset: Option<&[String]>) -> Result<Vec<String>, GraphError> {
        let inner = self.inner.read();
        let nodes: BTreeSet<String> = match subset {
            Some(s) => s.iter().cloned().collect(),
            None => inner.deps.keys().cloned().collect(),
        };

        // in-degree counts only edges within the selected subset.
        let mut indeg: HashMap<String, usize> = nodes.iter().map(|n| (n.clone(), 0)).collect();
        let mut forward: HashMap<String, BTreeSet<String>> =
            nodes.iter().map(|n| (n.clone(), BTreeSet::new())).collect();

        for n in &nodes {
            if let Some(deps) = inner.deps.get(n) {
                for d in deps {
                    if nodes.contains(d) {
                        forward.get_mut(d).unwrap().insert(n.clone());
                        *indeg.get_mut(n).unwrap() += 1;
                    }
                }
            }
        }

        let mut frontier: BTreeSet<String> = indeg
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(n, _)| n.clone())
            .collect();

        let mut order = Vec::with_capacity(nodes.len());
        while let Some(n) = frontier.iter().next().cloned() {
            frontier.remove(&n);
            order.push(n.clone());
            for dependent in &forward[&n] {
                let d = indeg.get_mut(dependent).unwrap();
                *d -= 1;
                if *d == 0 {
                    frontier.insert(dependent.clone());
                }
            }
        }

        if order.len() != nodes.len() {
            let remaining: Vec<String> = nodes
                .into_iter()
                .filter(|n| !order.contains(n))
                .collect();
            drop(inner);
            let cycles = self.detect_cycles_among(&remaining);
            let path = cycles
                .into_iter()
                .next()
                .unwrap_or(remaining);
            return Err(GraphError::CyclicDependency { path });
        }

        Ok(order)
    }

    /// Like `topological_order`, but groups nodes into levels: every node in
    /// a level has all its in-subset dependencies satisfied by earlier
    /// levels, and nodes within a level have no dependency relationship to
    /// each other — safe to start concurrently (`start_all_concurrent`).
    pub fn topological_levels(
        &self,
        subset: Option<&[String]>,
    ) -> Result<Vec<Vec<String>>, GraphError> {
        let inner = self.inner.read();
        let nodes: BTreeSet<String> = match subset {
            Some(s) => s.iter().cloned().collect(),
            None => inner.deps.keys().cloned().collect(),
        };

        let mut indeg: HashMap<String, usize> = nodes.iter().map(|n| (n.clone(), 0)).collect();
        let mut forward: HashMap<String, BTreeSet<String>> =
            nodes.iter().map(|n| (n.clone(), BTreeSet::new())).collect();

        for n in &nodes {
            if let Some(deps) = inner.deps.get(n) {
                for d in deps {
                    if nodes.contains(d) {
                        forward.get_mut(d).unwrap().insert(n.clone());
                        *indeg.get_mut(n).unwrap() += 1;
                    }
                }
            }
        }

        let mut levels = Vec::new();
        let mut frontier: Vec<String> = indeg
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(n, _)| n.clone())
            .collect();
        frontier.sort();

        let mut placed = 0usize;
        while !frontier.is_empty() {
            placed += frontier.len();
            let mut next = BTreeSet::new();
            for n in &frontier {
                for dependent in &forward[n] {
                    let d = indeg.get_mut(dependent).unwrap();
                    *d -= 1;
                    if *d == 0 {
                        next.insert(dependent.clone());
                    }
                }
            }
            levels.push(std::mem::take(&mut frontier));
            frontier = next.into_iter().collect();
        }

        if placed != nodes.len() {
            drop(inner);
            let remaining: Vec<String> = nodes
                .into_iter()
                .filter(|n| !levels.iter().flatten().any(|placed| placed == n))
                .collect();
            let cycles = self.detect_cycles_among(&remaining);
            let path = cycles.into_iter().next().unwrap_or(remaining);
            return Err(GraphError::CyclicDependency { path });
        }

        Ok(levels)
    }

    /// Enumerates all cycles present anywhere in the graph.
    pub fn detect_cycles(&self) -> Vec<Vec<String>> {
        let all = self.nodes();
        self.detect_cycles_among(&all)
    }

    /// DFS-based cycle enumeration restricted to `candidates`, used both by
    /// the public `detect_cycles` and to explain a failed topological sort.
    fn detect_cycles_among(&self, candidates: &[String]) -> Vec<Vec<String>> {
        let inner = self.inner.read();
        let candidate_set: HashSet<&String> = candidates.iter().collect();

        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        let mut colors: HashMap<&str, Color> =
            candidates.iter().map(|n| (n.as_str(), Color::White)).collect();
        let mut path: Vec<String> = Vec::new();
        let mut cycles = Vec::new();

        fn dfs<'a>(
            node: &'a str,
            inner: &'a Inner,
            candidate_set: &HashSet<&'a String>,
            colors: &mut HashMap<&'a str, Color>,
            path: &mut Vec<String>,
            cycles: &mut Vec<Vec<String>>,
        ) {
            colors.insert(node, Color::Gray);
            path.push(node.to_string());

            if let Some(deps) = inner.deps.get(node) {
                for dep in deps {
                    if !candidate_set.contains(dep) {
                        continue;
                    }
                    match colors.get(dep.as_str()).copied().unwrap_or(Color::White) {
                        Color::Gray => {
                            if let Some(start) = path.iter().position(|n| n == dep) {
                                let mut cycle: Vec<String> = path[start..].to_vec();
                                cycle.push(dep.clone());
                                cycles.push(cycle);
                            }
                        }
                        Color::White => {
                            dfs(dep, inner, candidate_set, colors, path, cycles);
                        }
                        Color::Black => {}
                    }
                }
            }

            path.pop();
            colors.insert(node, Color::Black);
        }

        for n in candidates {
            if colors.get(n.as_str()).copied() == Some(Color::White) {
                dfs(n, &inner, &candidate_set, &mut colors, &mut path, &mut cycles);
            }
        }

        cycles
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topo_sort_orders_dependencies_first() {
        let g = DependencyGraph::new();
        g.add_edge("b", "a");
        g.add_edge("c", "b");
        let order = g.topological_order(None).unwrap();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn topo_sort_is_deterministic_via_lex_tiebreak() {
        let g = DependencyGraph::new();
        g.add_node("z");
        g.add_node("a");
        g.add_node("m");
        let order = g.topological_order(None).unwrap();
        assert_eq!(order, vec!["a", "m", "z"]);
    }

    #[test]
    fn cycle_is_detected_and_topo_sort_fails() {
        let g = DependencyGraph::new();
        g.add_edge("x", "y");
        g.add_edge("y", "z");
        g.add_edge("z", "x");
        assert!(g.topological_order(None).is_err());
        let cycles = g.detect_cycles();
        assert_eq!(cycles.len(), 1);
        assert!(cycles[0].contains(&"x".to_string()));
        assert!(cycles[0].contains(&"y".to_string()));
        assert!(cycles[0].contains(&"z".to_string()));
    }

    #[test]
    fn topological_levels_groups_independent_nodes() {
        let g = DependencyGraph::new();
        g.add_edge("c", "a");
        g.add_edge("c", "b");
        g.add_node("a");
        g.add_node("b");
        let levels = g.topological_levels(None).unwrap();
        assert_eq!(levels.len(), 2);
        assert_eq!(levels[0], vec!["a".to_string(), "b".to_string()]);
        assert_eq!(levels[1], vec!["c".to_string()]);
    }

    #[test]
    fn add_edge_twice_is_idempotent() {
        let g = DependencyGraph::new();
        g.add_edge("a", "b");
        g.add_edge("a", "b");
        assert_eq!(g.dependencies_of("a").len(), 1);
    }

    #[test]
    fn remove_node_drops_incident_edges() {
        let g = DependencyGraph::new();
        g.add_edge("a", "b");
        g.remove_node("b");
        assert!(g.dependencies_of("a").is_empty());
        assert!(!g.has_node("b"));
    }

    #[test]
    fn transitive_lookups_follow_chains() {
        let g = DependencyGraph::new();
        g.add_edge("c", "b");
        g.add_edge("b", "a");
        assert_eq!(
            g.transitive_dependencies_of("c"),
            ["a", "b"].iter().map(|s| s.to_string()).collect()
        );
        assert_eq!(
            g.transitive_dependents_of("a"),
            ["b", "c"].iter().map(|s| s.to_string()).collect()
        );
    }
}
