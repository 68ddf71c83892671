//! Resolver: pure orderings computed from the graph plus the
//! registry's current metadata. No side effects; safe to call repeatedly.

use std::sync::Arc;

use crate::error::GraphError;
use crate::graph::DependencyGraph;
use crate::registry::Registry;

pub struct Resolver {
    graph: Arc<DependencyGraph>,
}

impl Resolver {
    pub fn new(graph: Arc<DependencyGraph>) -> Self {
        Self { graph }
    }

    /// Topologically sorts `subset` so every dependency precedes its
    /// dependent, lexicographic tie-break for deterministic output.
    pub fn resolve_start_order(&self, subset: &[String]) -> Result<Vec<String>, GraphError> {
        self.graph.topological_order(Some(subset))
    }

    /// The exact reverse of `resolve_start_order`.
    pub fn resolve_stop_order(&self, subset: &[String]) -> Result<Vec<String>, GraphError> {
        let mut order = self.resolve_start_order(subset)?;
        order.reverse();
        Ok(order)
    }

    /// Groups `subset` into levels safe to start concurrently within a
    /// level, used by `Manager::start_all_concurrent`.
    pub fn resolve_start_levels(&self, subset: &[String]) -> Result<Vec<Vec<String>>, GraphError> {
        self.graph.topological_levels(Some(subset))
    }

    /// Every `(dependent, missing_dependency)` pair where `dependent` is in
    /// `subset` but names a required dependency unknown to `registry`.
    pub fn validate_dependencies(
        &self,
        subset: &[String],
        registry: &Registry,
    ) -> Vec<(String, String)> {
        let mut missing = Vec::new();
        for name in subset {
            let Some(entry) = registry.get(name) else {
                continue;
            };
            let Some(meta) = entry.snapshot().metadata else {
                continue;
            };
            for dep in &meta.dependencies {
                if !registry.has(dep) {
                    missing.push((name.clone(), dep.clone()));
                }
            }
        }
        missing
    }

    pub fn check_cycles(&self) -> Vec<Vec<String>> {
        self.graph.detect_cycles()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::EventBus;
    use crate::module::{ModuleFactory, ModuleInstance, ModuleMetadata};
    use async_trait::async_trait;
    use std::any::Any;

    struct Dummy(ModuleMetadata);
    #[async_trait]
    impl ModuleInstance for Dummy {
        fn metadata(&self) -> ModuleMetadata {
            self.0.clone()
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn factory(meta: ModuleMetadata) -> Arc<dyn ModuleFactory> {
        Arc::new(move || -> Arc<dyn ModuleInstance> { Arc::new(Dummy(meta.clone())) })
    }

    #[tokio::test]
    async fn start_order_respects_edges_and_stop_is_reverse() {
        let graph = Arc::new(DependencyGraph::new());
        let bus = Arc::new(EventBus::new());
        let registry = Registry::new(graph.clone(), bus);

        registry.add("a", factory(ModuleMetadata::new("a", "1"))).unwrap();
        registry
            .add("b", factory(ModuleMetadata::new("b", "1").with_dependencies(["a"])))
            .unwrap();
        registry
            .add("c", factory(ModuleMetadata::new("c", "1").with_dependencies(["b"])))
            .unwrap();

        for name in ["a", "b", "c"] {
            let inst = registry.factory_of(name).unwrap().create();
            registry.attach_instance(name, inst).await.unwrap();
        }

        let resolver = Resolver::new(graph);
        let subset = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let start = resolver.resolve_start_order(&subset).unwrap();
        assert_eq!(start, vec!["a", "b", "c"]);
        let stop = resolver.resolve_stop_order(&subset).unwrap();
        assert_eq!(stop, vec!["c", "b", "a"]);
    }

    #[tokio::test]
    async fn validate_dependencies_reports_missing_names() {
        let graph = Arc::new(DependencyGraph::new());
        let bus = Arc::new(EventBus::new());
        let registry = Registry::new(graph.clone(), bus);

        registry
            .add("b", factory(ModuleMetadata::new("b", "1").with_dependencies(["a"])))
            .unwrap();
        let inst = registry.factory_of("b").unwrap().create();
        registry.attach_instance("b", inst).await.unwrap();

        let resolver = Resolver::new(graph);
        let missing = resolver.validate_dependencies(&["b".to_string()], &registry);
        assert_eq!(missing, vec![("b".to_string(), "a".to_string())]);
    }
}
