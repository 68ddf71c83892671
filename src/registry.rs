//! Registry: the authoritative store. All state mutations funnel through
//! here: a per-entry lock guards state/config, plus a registry-wide map
//! lock (here, `DashMap`'s internal sharding plays that role).

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;

use crate::error::{IllegalTransitionError, ManagerError};
use crate::event_bus::{event_type, Event, EventBus};
use crate::graph::DependencyGraph;
use crate::module::{ModuleFactory, ModuleInstance, ModuleMetadata};
use crate::state::{Action, ModuleState, StateMachine};

/// Last recorded failure on an entry (`RegistryEntry.error`).
#[derive(Debug, Clone)]
pub struct ErrorRecord {
    pub kind: &'static str,
    pub message: String,
}

/// Point-in-time, lock-free copy of one entry's observable fields.
#[derive(Debug, Clone)]
pub struct RegistryEntrySnapshot {
    pub name: String,
    pub metadata: Option<ModuleMetadata>,
    pub state: ModuleState,
    pub config: Option<Value>,
    pub error: Option<ErrorRecord>,
}

struct EntryData {
    metadata: Option<ModuleMetadata>,
    state: ModuleState,
    last_stable_state: ModuleState,
    config: Option<Value>,
    error: Option<ErrorRecord>,
}

/// One module's registry record. The `hook_lock` is the per-module lock:
/// whoever holds it is the only caller allowed to invoke a lifecycle hook
/// on this module's instance right now.
pub struct Entry {
    pub name: String,
    factory: Arc<dyn ModuleFactory>,
    instance: RwLock<Option<Arc<dyn ModuleInstance>>>,
    data: RwLock<EntryData>,
    pub hook_lock: tokio::sync::Mutex<()>,
}

impl Entry {
    pub fn instance(&self) -> Option<Arc<dyn ModuleInstance>> {
        self.instance.read().clone()
    }

    pub fn snapshot(&self) -> RegistryEntrySnapshot {
        let data = self.data.read();
        RegistryEntrySnapshot {
            name: self.name.clone(),
            metadata: data.metadata.clone(),
            state: data.state,
            config: data.config.clone(),
            error: data.error.clone(),
        }
    }

    pub fn state(&self) -> ModuleState {
        self.data.read().state
    }
}

pub struct Registry {
    entries: DashMap<String, Arc<Entry>>,
    graph: Arc<DependencyGraph>,
    bus: Arc<EventBus>,
}

impl Registry {
    pub fn new(graph: Arc<DependencyGraph>, bus: Arc<EventBus>) -> Self {
        Self {
            entries: DashMap::new(),
            graph,
            bus,
        }
    }

    pub fn has(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Entry>> {
        self.entries.get(name).map(|e| e.value().clone())
    }

    pub fn list(&self) -> Vec<RegistryEntrySnapshot> {
        self.entries.iter().map(|e| e.value().snapshot()).collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    /// Creates an entry in NOT_INSTALLED. Fails with `DuplicateModule` if
    /// `name` is already known.
    pub fn add(&self, name: &str, factory: Arc<dyn ModuleFactory>) -> Result<(), ManagerError> {
        if self.entries.contains_key(name) {
            return Err(ManagerError::DuplicateModule(name.to_string()));
        }
        self.entries.insert(
            name.to_string(),
            Arc::new(Entry {
                name: name.to_string(),
                factory,
                instance: RwLock::new(None),
                data: RwLock::new(EntryData {
                    metadata: None,
                    state: ModuleState::NotInstalled,
                    last_stable_state: ModuleState::NotInstalled,
                    config: None,
                    error: None,
                }),
                hook_lock: tokio::sync::Mutex::new(()),
            }),
        );
        Ok(())
    }

    pub fn factory_of(&self, name: &str) -> Option<Arc<dyn ModuleFactory>> {
        self.entries.get(name).map(|e| e.factory.clone())
    }

    /// Attaches a freshly-constructed instance, reads its metadata, rebuilds
    /// the dependency graph edges, and transitions NOT_INSTALLED -> LOADED,
    /// publishing `module.loaded`. Refuses the attach with `CyclicDependency`
    /// (leaving no transition recorded) if the new edges close a cycle back
    /// to this module.
    pub async fn attach_instance(
        &self,
        name: &str,
        instance: Arc<dyn ModuleInstance>,
    ) -> Result<(), ManagerError> {
        let metadata = instance.metadata();
        {
            let entry = self
                .entries
                .get(name)
                .ok_or_else(|| ManagerError::ModuleNotFound(name.to_string()))?
                .clone();
            *entry.instance.write() = Some(instance);
            entry.data.write().metadata = Some(metadata.clone());
        }

        self.graph.add_node(name);
        for dep in &metadata.dependencies {
            self.graph.add_edge(name, dep);
        }
        for dep in &metadata.optional_dependencies {
            self.graph.add_edge(name, dep);
        }

        // A module that (transitively) depends on itself is refused at
        // load time rather than left to surface later as a stuck
        // topological sort.
        if self.graph.transitive_dependencies_of(name).contains(name) {
            return Err(ManagerError::CyclicDependency(
                crate::error::GraphError::CyclicDependency {
                    path: self
                        .graph
                        .detect_cycles()
                        .into_iter()
                        .find(|c| c.contains(&name.to_string()))
                        .unwrap_or_else(|| vec![name.to_string()]),
                },
            ));
        }

        self.transition(name, Action::Load, event_type::LOADED, serde_json::json!({}))
            .await
    }

    pub fn set_config(&self, name: &str, config: Value) -> Result<(), ManagerError> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| ManagerError::ModuleNotFound(name.to_string()))?;
        entry.data.write().config = Some(config);
        Ok(())
    }

    /// Applies `action`, publishing `event_type` plus `module.state_changed`
    /// on success. No transition is silent.
    pub async fn transition(
        &self,
        name: &str,
        action: Action,
        event_type: &str,
        payload: Value,
    ) -> Result<(), ManagerError> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| ManagerError::ModuleNotFound(name.to_string()))?
            .clone();

        let (from, to) = {
            let mut data = entry.data.write();
            let from = data.state;
            let to = StateMachine::apply(name, from, action)
                .map_err(ManagerError::IllegalTransition)?;
            data.state = to;
            if to != ModuleState::Error {
                data.last_stable_state = to;
                data.error = None;
            }
            (from, to)
        };

        tracing::info!(module = name, from = %from, to = %to, action = ?action, "module state transition");

        self.bus
            .publish(Event::new(event_type, Some(name.to_string()), payload))
            .await;
        self.bus
            .publish(Event::new(
                crate::event_bus::event_type::STATE_CHANGED,
                Some(name.to_string()),
                serde_json::json!({ "from": from.to_string(), "to": to.to_string() }),
            ))
            .await;

        Ok(())
    }

    /// Forces ERROR, preserving the pre-failure state as `last_stable_state`
    /// (already captured by the most recent successful `transition`), and
    /// publishes `module.error`.
    pub async fn record_error(&self, name: &str, err: &ManagerError) -> Result<(), ManagerError> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| ManagerError::ModuleNotFound(name.to_string()))?
            .clone();

        {
            let mut data = entry.data.write();
            data.state = ModuleState::Error;
            data.error = Some(ErrorRecord {
                kind: err.kind(),
                message: err.to_string(),
            });
        }

        tracing::error!(module = name, kind = err.kind(), error = %err, "module entered error state");

        self.bus
            .publish(Event::new(
                event_type::ERROR,
                Some(name.to_string()),
                serde_json::json!({ "kind": err.kind(), "message": err.to_string() }),
            ))
            .await;
        Ok(())
    }

    /// ERROR -> last stable state (or LOADED if none was ever recorded).
    pub fn last_stable_state(&self, name: &str) -> Option<ModuleState> {
        self.entries.get(name).map(|e| e.data.read().last_stable_state)
    }

    pub fn reset_from_error(&self, name: &str) -> Result<(), ManagerError> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| ManagerError::ModuleNotFound(name.to_string()))?;
        let mut data = entry.data.write();
        if data.state != ModuleState::Error {
            return Err(ManagerError::IllegalTransition(IllegalTransitionError {
                module: name.to_string(),
                from: data.state,
                action: "reset",
            }));
        }
        data.state = data.last_stable_state;
        data.error = None;
        Ok(())
    }

    /// Removes the entry and all its graph edges (used by `unload_module`).
    pub fn remove(&self, name: &str) {
        self.entries.remove(name);
        self.graph.remove_node(name);
    }

    pub fn graph(&self) -> &Arc<DependencyGraph> {
        &self.graph
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::ModuleMetadata;
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
    async fn add_then_attach_transitions_to_loaded() {
        let registry = Registry::new(Arc::new(DependencyGraph::new()), Arc::new(EventBus::new()));
        registry.add("a", factory(ModuleMetadata::new("a", "1.0"))).unwrap();
        let inst = registry.factory_of("a").unwrap().create();
        registry.attach_instance("a", inst).await.unwrap();
        assert_eq!(registry.get("a").unwrap().state(), ModuleState::Loaded);
    }

    #[tokio::test]
    async fn duplicate_add_is_rejected() {
        let registry = Registry::new(Arc::new(DependencyGraph::new()), Arc::new(EventBus::new()));
        registry.add("a", factory(ModuleMetadata::new("a", "1.0"))).unwrap();
        let err = registry.add("a", factory(ModuleMetadata::new("a", "1.0"))).unwrap_err();
        assert!(matches!(err, ManagerError::DuplicateModule(_)));
    }

    #[tokio::test]
    async fn record_error_sets_state_and_preserves_message() {
        let registry = Registry::new(Arc::new(DependencyGraph::new()), Arc::new(EventBus::new()));
        registry.add("a", factory(ModuleMetadata::new("a", "1.0"))).unwrap();
        let inst = registry.factory_of("a").unwrap().create();
        registry.attach_instance("a", inst).await.unwrap();

        registry
            .record_error("a", &ManagerError::ModuleNotFound("x".into()))
            .await
            .unwrap();
        let snap = registry.get("a").unwrap().snapshot();
        assert_eq!(snap.state, ModuleState::Error);
        assert!(snap.error.is_some());
    }
}
