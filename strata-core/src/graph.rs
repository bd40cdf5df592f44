//! Service dependency graph.
//!
//! Nodes are catalog keys. An edge points from a dependency to its dependent
//! and carries the `required` and `share_config` flags of the declaration, so
//! a topological order lists dependencies before the services using them.

use crate::error::{Result, StrataError};
use crate::types::ServiceSpec;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::collections::{HashMap, HashSet, VecDeque};

/// Flags carried by a dependency edge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DependencyEdge {
    pub required: bool,
    pub share_config: bool,
}

/// Directed dependency graph over catalog keys.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    graph: DiGraph<String, DependencyEdge>,
    index_map: HashMap<String, NodeIndex>,
    /// Insertion order for deterministic tie-breaking.
    insertion_order: Vec<NodeIndex>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Graph over the members of one stack.
    ///
    /// Declared dependencies on keys outside `specs` are dropped: a service
    /// only waits for dependencies that are part of the same stack.
    pub fn for_members<'a>(specs: impl IntoIterator<Item = &'a ServiceSpec> + Clone) -> Self {
        let mut dag = Self::new();
        for spec in specs.clone() {
            dag.add_service(&spec.key);
        }
        for spec in specs {
            for dep in &spec.dependencies {
                if dag.contains(&dep.key) {
                    dag.add_dependency(
                        &spec.key,
                        &dep.key,
                        DependencyEdge { required: dep.required, share_config: dep.share_config },
                    );
                }
            }
        }
        dag
    }

    /// Graph over a whole catalog. Unknown dependency keys become nodes too.
    pub fn from_catalog<'a>(specs: impl IntoIterator<Item = &'a ServiceSpec>) -> Self {
        let mut dag = Self::new();
        for spec in specs {
            dag.add_service(&spec.key);
            for dep in &spec.dependencies {
                dag.add_dependency(
                    &spec.key,
                    &dep.key,
                    DependencyEdge { required: dep.required, share_config: dep.share_config },
                );
            }
        }
        dag
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        self.index_map.contains_key(key)
    }

    /// Add a node. No-op if it already exists.
    pub fn add_service(&mut self, key: &str) -> NodeIndex {
        if let Some(&idx) = self.index_map.get(key) {
            return idx;
        }
        let idx = self.graph.add_node(key.to_string());
        self.index_map.insert(key.to_string(), idx);
        self.insertion_order.push(idx);
        idx
    }

    /// Record that `dependent` depends on `dependency`.
    pub fn add_dependency(&mut self, dependent: &str, dependency: &str, edge: DependencyEdge) {
        let from = self.add_service(dependency);
        let to = self.add_service(dependent);
        self.graph.add_edge(from, to, edge);
    }

    /// Keys grouped into layers: each layer only depends on earlier ones.
    ///
    /// Kahn's algorithm; ties resolve in insertion order.
    pub fn layers(&self) -> Result<Vec<Vec<String>>> {
        let mut in_degree: HashMap<NodeIndex, usize> =
            self.graph.node_indices().map(|idx| (idx, 0)).collect();
        for edge in self.graph.edge_references() {
            *in_degree.entry(edge.target()).or_insert(0) += 1;
        }

        let mut current: VecDeque<NodeIndex> = self
            .insertion_order
            .iter()
            .filter(|idx| in_degree.get(idx).copied().unwrap_or(0) == 0)
            .copied()
            .collect();

        let mut layers = Vec::new();
        let mut visited = 0;
        while !current.is_empty() {
            let mut layer = Vec::with_capacity(current.len());
            let mut next: HashSet<NodeIndex> = HashSet::new();

            while let Some(idx) = current.pop_front() {
                visited += 1;
                layer.push(self.graph[idx].clone());
                for neighbor in self.graph.neighbors_directed(idx, Direction::Outgoing) {
                    if let Some(deg) = in_degree.get_mut(&neighbor) {
                        *deg = deg.saturating_sub(1);
                        if *deg == 0 {
                            next.insert(neighbor);
                        }
                    }
                }
            }

            layers.push(layer);
            current = self.insertion_order.iter().filter(|idx| next.contains(idx)).copied().collect();
        }

        if visited != self.graph.node_count() {
            let service = self
                .insertion_order
                .iter()
                .find(|idx| in_degree.get(idx).copied().unwrap_or(0) > 0)
                .map_or_else(|| "unknown".to_string(), |&idx| self.graph[idx].clone());
            return Err(StrataError::CircularDependency { service });
        }

        Ok(layers)
    }

    /// Fail with `CircularDependency` if the graph has a cycle.
    pub fn validate(&self) -> Result<()> {
        self.layers().map(|_| ())
    }

    /// Dependencies of `key` with their edge flags, in insertion order.
    pub fn dependencies(&self, key: &str) -> Vec<(String, DependencyEdge)> {
        let Some(&idx) = self.index_map.get(key) else {
            return Vec::new();
        };
        let mut deps: Vec<(NodeIndex, DependencyEdge)> = self
            .graph
            .edges_directed(idx, Direction::Incoming)
            .map(|edge| (edge.source(), *edge.weight()))
            .collect();
        deps.sort_by_key(|(n, _)| self.position(*n));
        deps.into_iter().map(|(n, edge)| (self.graph[n].clone(), edge)).collect()
    }

    /// Dependencies that must be ready before `key` may start.
    pub fn required_dependencies(&self, key: &str) -> Vec<String> {
        self.dependencies(key)
            .into_iter()
            .filter(|(_, edge)| edge.required)
            .map(|(dep, _)| dep)
            .collect()
    }

    /// Dependencies whose configuration is merged into `key`'s environment.
    pub fn share_config_dependencies(&self, key: &str) -> Vec<String> {
        self.dependencies(key)
            .into_iter()
            .filter(|(_, edge)| edge.share_config)
            .map(|(dep, _)| dep)
            .collect()
    }

    /// Services that depend on `key`, required or not.
    pub fn dependents(&self, key: &str) -> Vec<String> {
        let Some(&idx) = self.index_map.get(key) else {
            return Vec::new();
        };
        let mut dependents: Vec<NodeIndex> =
            self.graph.neighbors_directed(idx, Direction::Outgoing).collect();
        dependents.sort_by_key(|n| self.position(*n));
        dependents.dedup();
        dependents.into_iter().map(|n| self.graph[n].clone()).collect()
    }

    fn position(&self, idx: NodeIndex) -> usize {
        self.insertion_order.iter().position(|&i| i == idx).unwrap_or(usize::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Dependency;

    fn spec(key: &str, deps: &[(&str, bool, bool)]) -> ServiceSpec {
        let mut spec = ServiceSpec::new(key, "busybox");
        spec.dependencies = deps
            .iter()
            .map(|(k, required, share_config)| Dependency {
                key: k.to_string(),
                required: *required,
                share_config: *share_config,
            })
            .collect();
        spec
    }

    #[test]
    fn test_layers_put_dependencies_first() {
        let specs = vec![
            spec("web", &[("db", true, true), ("cache", false, false)]),
            spec("db", &[]),
            spec("cache", &[]),
            spec("worker", &[("web", true, false)]),
        ];
        let dag = DependencyGraph::for_members(&specs);

        let layers = dag.layers().unwrap();
        assert_eq!(layers[0], vec!["db".to_string(), "cache".to_string()]);
        assert_eq!(layers[1], vec!["web".to_string()]);
        assert_eq!(layers[2], vec!["worker".to_string()]);
        assert_eq!(layers.len(), 3);
    }

    #[test]
    fn test_edge_flags() {
        let specs = vec![
            spec("web", &[("db", true, true), ("cache", false, false)]),
            spec("db", &[]),
            spec("cache", &[]),
        ];
        let dag = DependencyGraph::for_members(&specs);

        assert_eq!(dag.required_dependencies("web"), vec!["db".to_string()]);
        assert_eq!(dag.share_config_dependencies("web"), vec!["db".to_string()]);
        assert_eq!(dag.dependents("db"), vec!["web".to_string()]);
        assert_eq!(dag.dependents("cache"), vec!["web".to_string()]);
        assert!(dag.dependents("web").is_empty());
    }

    #[test]
    fn test_members_ignore_outside_dependencies() {
        let specs = vec![spec("web", &[("db", true, false)])];
        let dag = DependencyGraph::for_members(&specs);
        assert_eq!(dag.len(), 1);
        assert!(dag.required_dependencies("web").is_empty());

        let catalog = DependencyGraph::from_catalog(&specs);
        assert_eq!(catalog.len(), 2);
    }

    #[test]
    fn test_cycle_detected() {
        let specs = vec![spec("a", &[("b", true, false)]), spec("b", &[("a", false, false)])];
        let err = DependencyGraph::from_catalog(&specs).validate().unwrap_err();
        assert!(matches!(err, StrataError::CircularDependency { .. }));

        let self_loop = vec![spec("a", &[("a", false, false)])];
        assert!(DependencyGraph::from_catalog(&self_loop).validate().is_err());
    }
}
