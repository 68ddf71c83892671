//! End-to-end lifecycle scenarios exercised through the public `Manager`
//! facade, each driven by an in-memory `ModuleSource` rather than a real
//! filesystem.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use modkit_lifecycle::{
    event_type, ConcurrentStartPolicy, Event, EventHandler, Manager, ManagerConfig, ManagerError,
    ModuleFactory, ModuleInstance, ModuleMetadata, ModuleSource, ModuleState,
};

/// A module whose hooks just record what happened to it, optionally
/// rejecting a particular config value.
struct RecordingModule {
    metadata: ModuleMetadata,
    log: Arc<Mutex<Vec<String>>>,
    reject_config: Option<Value>,
    start_delay: Option<Duration>,
}

#[async_trait]
impl ModuleInstance for RecordingModule {
    fn metadata(&self) -> ModuleMetadata {
        self.metadata.clone()
    }

    async fn install(&self, config: &Value) -> anyhow::Result<()> {
        self.log
            .lock()
            .unwrap()
            .push(format!("install:{}", self.metadata.name));
        let _ = config;
        Ok(())
    }

    async fn start(&self) -> anyhow::Result<()> {
        if let Some(delay) = self.start_delay {
            tokio::time::sleep(delay).await;
        }
        self.log
            .lock()
            .unwrap()
            .push(format!("start:{}", self.metadata.name));
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.log
            .lock()
            .unwrap()
            .push(format!("stop:{}", self.metadata.name));
        Ok(())
    }

    async fn uninstall(&self) -> anyhow::Result<()> {
        self.log
            .lock()
            .unwrap()
            .push(format!("uninstall:{}", self.metadata.name));
        Ok(())
    }

    fn validate_config(&self, config: &Value) -> Option<bool> {
        self.reject_config
            .as_ref()
            .map(|rejected| config != rejected)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Default)]
struct InMemorySource {
    modules: HashMap<String, ModuleMetadata>,
    log: Arc<Mutex<Vec<String>>>,
    reject_config: HashMap<String, Value>,
    start_delay: HashMap<String, Duration>,
}

impl InMemorySource {
    fn with(mut self, name: &str, deps: &[&str]) -> Self {
        self.modules.insert(
            name.to_string(),
            ModuleMetadata::new(name, "1.0").with_dependencies(deps.iter().map(|s| s.to_string())),
        );
        self
    }

    fn rejecting(mut self, name: &str, rejected: Value) -> Self {
        self.reject_config.insert(name.to_string(), rejected);
        self
    }

    fn with_start_delay(mut self, name: &str, delay: Duration) -> Self {
        self.start_delay.insert(name.to_string(), delay);
        self
    }
}

struct StaticFactory {
    metadata: ModuleMetadata,
    log: Arc<Mutex<Vec<String>>>,
    reject_config: Option<Value>,
    start_delay: Option<Duration>,
}

impl ModuleFactory for StaticFactory {
    fn create(&self) -> Arc<dyn ModuleInstance> {
        Arc::new(RecordingModule {
            metadata: self.metadata.clone(),
            log: self.log.clone(),
            reject_config: self.reject_config.clone(),
            start_delay: self.start_delay,
        })
    }
}

#[async_trait]
impl ModuleSource for InMemorySource {
    async fn discover(&self) -> anyhow::Result<Vec<String>> {
        let mut names: Vec<String> = self.modules.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn load(&self, name: &str) -> anyhow::Result<Box<dyn ModuleFactory>> {
        let metadata = self
            .modules
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("unknown module '{name}'"))?
            .clone();
        Ok(Box::new(StaticFactory {
            metadata,
            log: self.log.clone(),
            reject_config: self.reject_config.get(name).cloned(),
            start_delay: self.start_delay.get(name).copied(),
        }))
    }
}

struct RecordingHandler {
    events: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(event.event_type.clone());
        Ok(())
    }
}

fn recording_handler(events: Arc<Mutex<Vec<String>>>) -> Arc<dyn EventHandler> {
    Arc::new(RecordingHandler { events })
}

#[tokio::test]
async fn linear_chain_start_fires_events_in_dependency_order() {
    let source = Arc::new(
        InMemorySource::default()
            .with("a", &[])
            .with("b", &["a"])
            .with("c", &["b"]),
    );
    let manager = Manager::new(source, ManagerConfig::default());

    let started_order = Arc::new(Mutex::new(Vec::new()));
    manager.bus().subscribe(
        event_type::STARTED,
        Arc::new(StartedOrderHandler(started_order.clone())),
    );

    for name in manager.discover().await.unwrap() {
        manager.load_module(&name).await.unwrap();
    }
    manager.start_all().await.unwrap();

    assert_eq!(*started_order.lock().unwrap(), vec!["a", "b", "c"]);
    for name in ["a", "b", "c"] {
        assert_eq!(
            manager.list_modules().into_iter().find(|m| m.name == name).unwrap().state,
            ModuleState::Started
        );
    }
}

struct StartedOrderHandler(Arc<Mutex<Vec<String>>>);
#[async_trait]
impl EventHandler for StartedOrderHandler {
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        if let Some(name) = &event.module_name {
            self.0.lock().unwrap().push(name.clone());
        }
        Ok(())
    }
}

#[tokio::test]
async fn cycle_is_refused_at_load_and_registry_keeps_only_the_loaded_prefix() {
    let source = Arc::new(
        InMemorySource::default()
            .with("x", &["y"])
            .with("y", &["z"])
            .with("z", &["x"]),
    );
    let manager = Manager::new(source, ManagerConfig::default());

    manager.load_module("x").await.unwrap();
    manager.load_module("y").await.unwrap();
    let err = manager.load_module("z").await.unwrap_err();
    assert!(matches!(err, ManagerError::CyclicDependency(_)));

    let names: Vec<String> = manager.list_modules().into_iter().map(|m| m.name).collect();
    assert_eq!(names.len(), 2);
    assert!(names.contains(&"x".to_string()));
    assert!(names.contains(&"y".to_string()));
    for name in ["x", "y"] {
        assert_eq!(
            manager.list_modules().into_iter().find(|m| m.name == name).unwrap().state,
            ModuleState::Loaded
        );
    }
}

#[tokio::test]
async fn start_without_dependency_fails_and_leaves_module_installed() {
    let source = Arc::new(InMemorySource::default().with("a", &[]).with("b", &["a"]));
    let manager = Manager::new(source, ManagerConfig::default());

    manager.load_module("a").await.unwrap();
    manager.load_module("b").await.unwrap();
    manager.install_module("b", None).await.unwrap();

    let err = manager.start_module("b").await.unwrap_err();
    assert!(matches!(err, ManagerError::DependencyNotStarted { .. }));
    assert_eq!(
        manager.list_modules().into_iter().find(|m| m.name == "b").unwrap().state,
        ModuleState::Installed
    );
}

#[tokio::test]
async fn cascading_stop_walks_dependents_before_dependencies() {
    let source = Arc::new(
        InMemorySource::default()
            .with("a", &[])
            .with("b", &["a"])
            .with("c", &["b"]),
    );
    let manager = Manager::new(source, ManagerConfig::default());
    for name in ["a", "b", "c"] {
        manager.load_module(name).await.unwrap();
    }
    manager.start_all().await.unwrap();

    let stopped_order = Arc::new(Mutex::new(Vec::new()));
    manager
        .bus()
        .subscribe(event_type::STOPPED, Arc::new(StartedOrderHandler(stopped_order.clone())));

    manager.stop_module("a", true).await.unwrap();

    assert_eq!(*stopped_order.lock().unwrap(), vec!["c", "b", "a"]);
    for name in ["a", "b", "c"] {
        assert_eq!(
            manager.list_modules().into_iter().find(|m| m.name == name).unwrap().state,
            ModuleState::Stopped
        );
    }
}

#[tokio::test]
async fn rejected_config_blocks_install_and_leaves_module_loaded() {
    let source = Arc::new(
        InMemorySource::default()
            .with("s", &[])
            .rejecting("s", serde_json::json!({"port": "eighty"})),
    );
    let manager = Manager::new(source, ManagerConfig::default());
    manager.load_module("s").await.unwrap();

    let events = Arc::new(Mutex::new(Vec::new()));
    manager
        .bus()
        .subscribe(event_type::INSTALLED, recording_handler(events.clone()));

    let err = manager
        .install_module("s", Some(serde_json::json!({"port": "eighty"})))
        .await
        .unwrap_err();
    assert!(matches!(err, ManagerError::ModuleConfigError { .. }));
    assert_eq!(
        manager.list_modules().into_iter().find(|m| m.name == "s").unwrap().state,
        ModuleState::Loaded
    );
    assert!(events.lock().unwrap().is_empty());
}

#[tokio::test]
async fn reload_preserves_dependents_final_running_state() {
    let source = Arc::new(InMemorySource::default().with("db", &[]).with("api", &["db"]));
    let manager = Manager::new(source, ManagerConfig::default());
    for name in ["db", "api"] {
        manager.load_module(name).await.unwrap();
    }
    manager.start_all().await.unwrap();

    let reloaded_events = Arc::new(Mutex::new(Vec::new()));
    manager
        .bus()
        .subscribe(event_type::RELOADED, recording_handler(reloaded_events.clone()));

    manager.reload_module("db").await.unwrap();

    for name in ["db", "api"] {
        assert_eq!(
            manager.list_modules().into_iter().find(|m| m.name == name).unwrap().state,
            ModuleState::Started
        );
    }
    assert_eq!(reloaded_events.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn wildcard_subscriptions_match_as_specified() {
    let source = Arc::new(InMemorySource::default().with("a", &[]));
    let manager = Manager::new(source, ManagerConfig::default());

    let module_star = Arc::new(Mutex::new(Vec::new()));
    let any_star = Arc::new(Mutex::new(Vec::new()));
    let exact = Arc::new(Mutex::new(Vec::new()));
    manager.bus().subscribe("module.*", recording_handler(module_star.clone()));
    manager.bus().subscribe("*", recording_handler(any_star.clone()));
    manager
        .bus()
        .subscribe(event_type::STARTED, recording_handler(exact.clone()));

    manager.load_module("a").await.unwrap();
    manager.install_module("a", None).await.unwrap();
    manager.start_module("a").await.unwrap();

    assert!(module_star.lock().unwrap().len() >= 3);
    assert!(any_star.lock().unwrap().len() >= module_star.lock().unwrap().len());
    assert_eq!(exact.lock().unwrap(), vec![event_type::STARTED.to_string()]);
}

#[tokio::test]
async fn failing_handler_does_not_stop_later_handlers_and_raises_error_event() {
    let source = Arc::new(InMemorySource::default().with("a", &[]));
    let manager = Manager::new(source, ManagerConfig::default());

    struct Failing;
    #[async_trait]
    impl EventHandler for Failing {
        async fn handle(&self, _event: &Event) -> anyhow::Result<()> {
            anyhow::bail!("handler blew up")
        }
    }

    let second_ran = Arc::new(AtomicUsize::new(0));
    let error_events = Arc::new(Mutex::new(Vec::new()));

    manager.bus().subscribe(event_type::STARTED, Arc::new(Failing));
    let counter = second_ran.clone();
    manager.bus().subscribe(
        event_type::STARTED,
        Arc::new(CountingHandler(counter)),
    );
    manager
        .bus()
        .subscribe(event_type::ERROR, recording_handler(error_events.clone()));

    manager.load_module("a").await.unwrap();
    manager.install_module("a", None).await.unwrap();
    manager.start_module("a").await.unwrap();

    assert_eq!(second_ran.load(Ordering::SeqCst), 1);
    assert_eq!(error_events.lock().unwrap().len(), 1);
}

struct CountingHandler(Arc<AtomicUsize>);
#[async_trait]
impl EventHandler for CountingHandler {
    async fn handle(&self, _event: &Event) -> anyhow::Result<()> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn start_all_concurrent_starts_independent_modules_within_a_level() {
    let source = Arc::new(
        InMemorySource::default()
            .with("a", &[])
            .with("b", &[])
            .with("c", &["a", "b"]),
    );
    let manager = Manager::new(source, ManagerConfig::default());
    for name in ["a", "b", "c"] {
        manager.load_module(name).await.unwrap();
    }

    manager
        .start_all_concurrent(ConcurrentStartPolicy::FailFast)
        .await
        .unwrap();

    for name in ["a", "b", "c"] {
        assert_eq!(
            manager.list_modules().into_iter().find(|m| m.name == name).unwrap().state,
            ModuleState::Started
        );
    }
}

#[tokio::test]
async fn hook_exceeding_default_timeout_moves_module_to_error() {
    let source = Arc::new(
        InMemorySource::default()
            .with("slow", &[])
            .with_start_delay("slow", Duration::from_millis(200)),
    );
    let manager = Manager::new(
        source,
        ManagerConfig {
            default_hook_timeout: Some(Duration::from_millis(20)),
            ..Default::default()
        },
    );

    manager.load_module("slow").await.unwrap();
    manager.install_module("slow", None).await.unwrap();

    let err = manager.start_module("slow").await.unwrap_err();
    assert!(matches!(err, ManagerError::Timeout { ref module, .. } if module == "slow"));

    let snapshot = manager
        .list_modules()
        .into_iter()
        .find(|m| m.name == "slow")
        .unwrap();
    assert_eq!(snapshot.state, ModuleState::Error);
}

#[tokio::test]
async fn trigger_reload_reinstalls_and_restarts_a_running_module() {
    let source = Arc::new(InMemorySource::default().with("a", &[]));
    let manager = Manager::new(source, ManagerConfig::default());

    manager.load_module("a").await.unwrap();
    manager.install_module("a", None).await.unwrap();
    manager.start_module("a").await.unwrap();

    manager.trigger_reload("a").await.unwrap();

    let snapshot = manager
        .list_modules()
        .into_iter()
        .find(|m| m.name == "a")
        .unwrap();
    assert_eq!(snapshot.state, ModuleState::Started);
}
