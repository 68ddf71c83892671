//! Manager: the public facade. Encapsulates concurrency, event
//! publication, and lifecycle hook invocation on top of the Registry,
//! Resolver and Event Bus.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::error::{IllegalTransitionError, ManagerError};
use crate::event_bus::{event_type, Event, EventBus};
use crate::graph::DependencyGraph;
use crate::module::{
    validate_against_schema, ModuleFactory, ModuleInstance, ModuleSource,
};
use crate::registry::{Registry, RegistryEntrySnapshot};
use crate::resolver::Resolver;
use crate::state::{Action, ModuleState};

/// Options recognized by the Manager. `module_dirs` is opaque to the
/// core — it is only meaningful to whatever `ModuleSource` the caller wired
/// up.
#[derive(Debug, Clone, Default)]
pub struct ManagerConfig {
    pub module_dirs: Vec<String>,
    pub exclude_modules: HashSet<String>,
    pub enable_hot_reload: bool,
    /// Applied to every lifecycle hook invocation. `None` means hooks run
    /// to completion with no deadline.
    pub default_hook_timeout: Option<Duration>,
}

/// Failure-handling policy for `start_all_concurrent`. `FailFast` is the
/// default and matches `start_all`'s own abort-on-first-failure semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConcurrentStartPolicy {
    #[default]
    FailFast,
    FailSoft,
}

/// Public facade over the lifecycle core. Cheap to clone: every field is
/// an `Arc`, so multiple `Manager` values — and multiple independent
/// managers within one process — can share or not share state as the
/// caller wishes. There is no global state.
#[derive(Clone)]
pub struct Manager {
    registry: Arc<Registry>,
    resolver: Arc<Resolver>,
    graph: Arc<DependencyGraph>,
    bus: Arc<EventBus>,
    source: Arc<dyn ModuleSource>,
    config: Arc<ManagerConfig>,
}

impl Manager {
    pub fn new(source: Arc<dyn ModuleSource>, config: ManagerConfig) -> Self {
        let graph = Arc::new(DependencyGraph::new());
        let bus = Arc::new(EventBus::new());
        let registry = Arc::new(Registry::new(graph.clone(), bus.clone()));
        let resolver = Arc::new(Resolver::new(graph.clone()));
        Self {
            registry,
            resolver,
            graph,
            bus,
            source,
            config: Arc::new(config),
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn list_modules(&self) -> Vec<RegistryEntrySnapshot> {
        self.registry.list()
    }

    /// Runs a lifecycle hook future, applying `ManagerConfig::default_hook_timeout`
    /// when set. Translates a hook error into `HookFailure` and an expired
    /// deadline into `Timeout`; does not record the error or transition state
    /// itself, callers do that with the outcome.
    async fn run_hook<F>(&self, name: &str, hook: &'static str, fut: F) -> Result<(), ManagerError>
    where
        F: std::future::Future<Output = anyhow::Result<()>>,
    {
        match self.config.default_hook_timeout {
            Some(budget) => {
                let started = Instant::now();
                match tokio::time::timeout(budget, fut).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(source)) => Err(ManagerError::HookFailure {
                        module: name.to_string(),
                        hook,
                        source,
                    }),
                    Err(_) => Err(ManagerError::Timeout {
                        module: name.to_string(),
                        elapsed_ms: started.elapsed().as_millis(),
                    }),
                }
            }
            None => fut.await.map_err(|source| ManagerError::HookFailure {
                module: name.to_string(),
                hook,
                source,
            }),
        }
    }

    /// Asks the attached `ModuleSource` what's available, filtering out
    /// `exclude_modules`. Does not instantiate anything.
    pub async fn discover(&self) -> Result<Vec<String>, ManagerError> {
        let names = self
            .source
            .discover()
            .await
            .map_err(|e| ManagerError::ModuleLoadError {
                module: "<discover>".to_string(),
                source: e,
            })?;
        Ok(names
            .into_iter()
            .filter(|n| !self.config.exclude_modules.contains(n))
            .collect())
    }

    /// Instantiates `name` via the attached `ModuleSource` and registers it
    /// NOT_INSTALLED -> LOADED. Rolls back fully (entry and graph edges) on
    /// any failure, including a cyclic dependency introduced by this load.
    pub async fn load_module(&self, name: &str) -> Result<(), ManagerError> {
        if self.config.exclude_modules.contains(name) {
            return Err(ManagerError::ModuleNotFound(name.to_string()));
        }
        if self.registry.has(name) {
            return Err(ManagerError::DuplicateModule(name.to_string()));
        }

        let factory_box = self
            .source
            .load(name)
            .await
            .map_err(|e| ManagerError::ModuleLoadError {
                module: name.to_string(),
                source: e,
            })?;
        let factory: Arc<dyn ModuleFactory> = Arc::from(factory_box);

        self.registry.add(name, factory.clone())?;

        let instance = factory.create();
        let metadata = instance.metadata();
        if metadata.name != name {
            self.registry.remove(name);
            return Err(ManagerError::ModuleLoadError {
                module: name.to_string(),
                source: anyhow::anyhow!(
                    "module factory for '{}' produced metadata for '{}'",
                    name,
                    metadata.name
                ),
            });
        }

        if let Err(e) = self.registry.attach_instance(name, instance.clone()).await {
            // Roll back fully: a cyclic load must leave no trace of the
            // new module.
            self.registry.remove(name);
            return Err(e);
        }

        if let Err(e) = self.run_hook(name, "bootstrap", instance.bootstrap()).await {
            // A failed bootstrap must leave no trace either, same as a
            // cyclic load: the entry never reached a state a caller could
            // observe as half-alive.
            self.registry.remove(name);
            return Err(e);
        }

        tracing::info!(module = name, "module loaded");
        Ok(())
    }

    /// Validates `config` (via the module's own `validate_config`, falling
    /// back to its declared schema) and runs the install hook.
    pub async fn install_module(
        &self,
        name: &str,
        config: Option<Value>,
    ) -> Result<(), ManagerError> {
        let entry = self
            .registry
            .get(name)
            .ok_or_else(|| ManagerError::ModuleNotFound(name.to_string()))?;
        let _guard = entry.hook_lock.lock().await;

        let state = entry.state();
        if state != ModuleState::Loaded {
            return Err(ManagerError::IllegalTransition(IllegalTransitionError {
                module: name.to_string(),
                from: state,
                action: "install",
            }));
        }

        let config_value = config.unwrap_or(Value::Null);
        let instance = entry
            .instance()
            .ok_or_else(|| ManagerError::ModuleNotFound(name.to_string()))?;

        let valid = match instance.validate_config(&config_value) {
            Some(result) => result,
            None => {
                let snapshot = entry.snapshot();
                match snapshot.metadata.as_ref().and_then(|m| m.config_schema.as_ref()) {
                    Some(schema) => validate_against_schema(schema, &config_value).is_ok(),
                    None => true,
                }
            }
        };
        if !valid {
            return Err(ManagerError::ModuleConfigError {
                module: name.to_string(),
                reason: "configuration rejected by validate_config".to_string(),
            });
        }

        match self.run_hook(name, "install", instance.install(&config_value)).await {
            Ok(()) => {
                self.registry.set_config(name, config_value)?;
                self.registry
                    .transition(name, Action::Install, event_type::INSTALLED, serde_json::json!({}))
                    .await
            }
            Err(err) => {
                self.registry.record_error(name, &err).await?;
                Err(err)
            }
        }
    }

    /// Requires every required dependency to already be STARTED; does not
    /// auto-start dependencies.
    pub async fn start_module(&self, name: &str) -> Result<(), ManagerError> {
        let entry = self
            .registry
            .get(name)
            .ok_or_else(|| ManagerError::ModuleNotFound(name.to_string()))?;
        let _guard = entry.hook_lock.lock().await;

        let state = entry.state();
        if !matches!(state, ModuleState::Installed | ModuleState::Stopped) {
            return Err(ManagerError::IllegalTransition(IllegalTransitionError {
                module: name.to_string(),
                from: state,
                action: "start",
            }));
        }

        let dependencies = entry
            .snapshot()
            .metadata
            .map(|m| m.dependencies)
            .unwrap_or_default();
        for dep in &dependencies {
            let dep_started = self
                .registry
                .get(dep)
                .map(|d| d.state() == ModuleState::Started)
                .unwrap_or(false);
            if !dep_started {
                return Err(ManagerError::DependencyNotStarted {
                    module: name.to_string(),
                    dependency: dep.clone(),
                });
            }
        }

        let instance = entry
            .instance()
            .ok_or_else(|| ManagerError::ModuleNotFound(name.to_string()))?;

        match self.run_hook(name, "start", instance.start()).await {
            Ok(()) => {
                self.registry
                    .transition(name, Action::Start, event_type::STARTED, serde_json::json!({}))
                    .await
            }
            Err(err) => {
                self.registry.record_error(name, &err).await?;
                Err(err)
            }
        }
    }

    /// The actual per-module stop: requires STARTED, invokes the hook, and
    /// transitions. Does not look at dependents — callers (`stop_module`,
    /// `stop_all`, the cascade loop) are responsible for ordering.
    async fn stop_single(&self, name: &str) -> Result<(), ManagerError> {
        let entry = self
            .registry
            .get(name)
            .ok_or_else(|| ManagerError::ModuleNotFound(name.to_string()))?;
        let _guard = entry.hook_lock.lock().await;

        let state = entry.state();
        if state != ModuleState::Started {
            return Err(ManagerError::IllegalTransition(IllegalTransitionError {
                module: name.to_string(),
                from: state,
                action: "stop",
            }));
        }

        let instance = entry
            .instance()
            .ok_or_else(|| ManagerError::ModuleNotFound(name.to_string()))?;

        match self.run_hook(name, "stop", instance.stop()).await {
            Ok(()) => {
                self.registry
                    .transition(name, Action::Stop, event_type::STOPPED, serde_json::json!({}))
                    .await
            }
            Err(err) => {
                self.registry.record_error(name, &err).await?;
                Err(err)
            }
        }
    }

    /// Stops `name`. If any (transitive) dependent is still running, fails
    /// with `DependentStillRunning` unless `cascade` is set, in which case
    /// every running dependent is stopped first, reverse-topologically.
    pub async fn stop_module(&self, name: &str, cascade: bool) -> Result<(), ManagerError> {
        if !self.registry.has(name) {
            return Err(ManagerError::ModuleNotFound(name.to_string()));
        }

        let transitive_dependents = self.graph.transitive_dependents_of(name);
        let mut started_dependents: Vec<String> = transitive_dependents
            .into_iter()
            .filter(|d| {
                self.registry
                    .get(d)
                    .map(|e| e.state() == ModuleState::Started)
                    .unwrap_or(false)
            })
            .collect();

        if !started_dependents.is_empty() {
            if !cascade {
                started_dependents.sort();
                return Err(ManagerError::DependentStillRunning {
                    module: name.to_string(),
                    dependent: started_dependents[0].clone(),
                });
            }
            let order = self
                .resolver
                .resolve_stop_order(&started_dependents)
                .map_err(ManagerError::CyclicDependency)?;
            for dependent in order {
                self.stop_single(&dependent).await?;
            }
        }

        self.stop_single(name).await
    }

    /// Refuses if a dependent is still started; otherwise runs the
    /// uninstall hook and returns the entry to LOADED.
    pub async fn uninstall_module(&self, name: &str) -> Result<(), ManagerError> {
        let entry = self
            .registry
            .get(name)
            .ok_or_else(|| ManagerError::ModuleNotFound(name.to_string()))?;

        let started_dependents: Vec<String> = self
            .graph
            .dependents_of(name)
            .into_iter()
            .filter(|d| {
                self.registry
                    .get(d)
                    .map(|e| e.state() == ModuleState::Started)
                    .unwrap_or(false)
            })
            .collect();
        if let Some(dependent) = started_dependents.into_iter().next() {
            return Err(ManagerError::DependentStillRunning {
                module: name.to_string(),
                dependent,
            });
        }

        let _guard = entry.hook_lock.lock().await;
        let state = entry.state();
        if !matches!(state, ModuleState::Stopped | ModuleState::Installed) {
            return Err(ManagerError::IllegalTransition(IllegalTransitionError {
                module: name.to_string(),
                from: state,
                action: "uninstall",
            }));
        }

        let instance = entry
            .instance()
            .ok_or_else(|| ManagerError::ModuleNotFound(name.to_string()))?;

        match self.run_hook(name, "uninstall", instance.uninstall()).await {
            Ok(()) => {
                self.registry.set_config(name, Value::Null)?;
                self.registry
                    .transition(name, Action::Uninstall, event_type::UNINSTALLED, serde_json::json!({}))
                    .await
            }
            Err(err) => {
                self.registry.record_error(name, &err).await?;
                Err(err)
            }
        }
    }

    /// Drops the entry entirely, freeing its name for a future `load_module`.
    pub async fn unload_module(&self, name: &str) -> Result<(), ManagerError> {
        let entry = self
            .registry
            .get(name)
            .ok_or_else(|| ManagerError::ModuleNotFound(name.to_string()))?;
        let _guard = entry.hook_lock.lock().await;

        let state = entry.state();
        if state != ModuleState::Loaded {
            return Err(ManagerError::IllegalTransition(IllegalTransitionError {
                module: name.to_string(),
                from: state,
                action: "unload",
            }));
        }

        self.registry
            .transition(name, Action::Unload, event_type::UNLOADED, serde_json::json!({}))
            .await?;
        drop(_guard);
        self.registry.remove(name);
        Ok(())
    }

    /// Installs any LOADED entries with a null config first, skipping
    /// (not aborting) those whose `validate_config(null)` rejects it, then
    /// starts everything in topological order. The first hook failure
    /// moves that module to ERROR and aborts the remaining starts;
    /// already-started modules are left running.
    pub async fn start_all(&self) -> Result<(), ManagerError> {
        let candidates: Vec<String> = self
            .registry
            .list()
            .into_iter()
            .filter(|s| matches!(s.state, ModuleState::Loaded | ModuleState::Installed))
            .map(|s| s.name)
            .collect();
        let order = self
            .resolver
            .resolve_start_order(&candidates)
            .map_err(ManagerError::CyclicDependency)?;

        for name in order {
            let state = self
                .registry
                .get(&name)
                .map(|e| e.state())
                .unwrap_or(ModuleState::NotInstalled);

            if state == ModuleState::Loaded {
                match self.install_module(&name, None).await {
                    Ok(()) => {}
                    Err(ManagerError::ModuleConfigError { .. }) => {
                        tracing::debug!(module = %name, "start_all: skipping module, null config rejected");
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }

            let state = self
                .registry
                .get(&name)
                .map(|e| e.state())
                .unwrap_or(ModuleState::NotInstalled);
            if !matches!(state, ModuleState::Installed | ModuleState::Stopped) {
                continue;
            }

            self.start_module(&name).await?;
        }
        Ok(())
    }

    /// Best-effort: individual failures are logged as `module.error`
    /// events (via `stop_single`'s `record_error`) but do not halt the
    /// sweep.
    pub async fn stop_all(&self) {
        let started: Vec<String> = self
            .registry
            .list()
            .into_iter()
            .filter(|s| s.state == ModuleState::Started)
            .map(|s| s.name)
            .collect();

        let order = self
            .resolver
            .resolve_stop_order(&started)
            .unwrap_or_else(|_| {
                let mut v = started;
                v.sort();
                v.reverse();
                v
            });

        for name in order {
            if let Err(e) = self.stop_single(&name).await {
                tracing::warn!(module = %name, error = %e, "stop_all: continuing sweep after failure");
            }
        }
    }

    /// Re-instantiates a module in place, preserving its dependents'
    /// eventual running state.
    pub async fn reload_module(&self, name: &str) -> Result<(), ManagerError> {
        let entry = self
            .registry
            .get(name)
            .ok_or_else(|| ManagerError::ModuleNotFound(name.to_string()))?;

        let prior_state = entry.state();
        let prior_config = entry.snapshot().config;

        {
            let _guard = entry.hook_lock.lock().await;
            let instance = entry
                .instance()
                .ok_or_else(|| ManagerError::ModuleNotFound(name.to_string()))?;
            if let Err(err) = self.run_hook(name, "reload", instance.reload()).await {
                self.registry.record_error(name, &err).await?;
                return Err(err);
            }
        }

        let started_dependents: Vec<String> = self
            .graph
            .transitive_dependents_of(name)
            .into_iter()
            .filter(|d| {
                self.registry
                    .get(d)
                    .map(|e| e.state() == ModuleState::Started)
                    .unwrap_or(false)
            })
            .collect();

        match prior_state {
            ModuleState::Started => {
                self.stop_module(name, true).await?;
            }
            ModuleState::Installed | ModuleState::Stopped => {}
            other => {
                return Err(ManagerError::IllegalTransition(IllegalTransitionError {
                    module: name.to_string(),
                    from: other,
                    action: "reload",
                }));
            }
        }

        self.uninstall_module(name).await?;

        let factory = self
            .registry
            .factory_of(name)
            .ok_or_else(|| ManagerError::ModuleNotFound(name.to_string()))?;
        self.unload_module(name).await?;

        self.registry.add(name, factory.clone())?;
        let fresh_instance = factory.create();
        self.registry.attach_instance(name, fresh_instance).await?;

        self.install_module(name, prior_config).await?;
        self.start_module(name).await?;

        let restart_order = self
            .resolver
            .resolve_start_order(&started_dependents)
            .unwrap_or_else(|_| {
                let mut v = started_dependents;
                v.sort();
                v
            });
        for dependent in restart_order {
            self.start_module(&dependent).await?;
        }

        self.bus
            .publish(Event::new(event_type::RELOADED, Some(name.to_string()), serde_json::json!({})))
            .await;
        tracing::info!(module = name, "module reloaded");
        Ok(())
    }

    /// Hands back the live instance of `name`, for modules that inject one
    /// another by name rather than by compile-time reference.
    pub fn get_module(&self, name: &str) -> Result<Arc<dyn ModuleInstance>, ManagerError> {
        self.registry
            .get(name)
            .and_then(|e| e.instance())
            .ok_or_else(|| ManagerError::ModuleNotFound(name.to_string()))
    }

    /// Concurrent fan-out within a topological level. `FailFast` (default)
    /// stops attempting further levels on the first failure within a
    /// level; `FailSoft` attempts every module regardless of siblings'
    /// failures and collects every error.
    pub async fn start_all_concurrent(
        &self,
        policy: ConcurrentStartPolicy,
    ) -> Result<(), Vec<ManagerError>> {
        let candidates: Vec<String> = self
            .registry
            .list()
            .into_iter()
            .filter(|s| matches!(s.state, ModuleState::Loaded | ModuleState::Installed))
            .map(|s| s.name)
            .collect();

        let levels = self
            .resolver
            .resolve_start_levels(&candidates)
            .map_err(|e| vec![ManagerError::CyclicDependency(e)])?;

        let mut failed_modules: HashSet<String> = HashSet::new();

        for level in levels {
            let runnable: Vec<String> = level
                .into_iter()
                .filter(|name| {
                    // A module whose dependency failed earlier this run
                    // can't meaningfully be attempted: it will just bounce
                    // off DependencyNotStarted.
                    let deps = self
                        .registry
                        .get(name)
                        .and_then(|e| e.snapshot().metadata)
                        .map(|m| m.dependencies)
                        .unwrap_or_default();
                    !deps.iter().any(|d| failed_modules.contains(d))
                })
                .collect();

            let futures = runnable.iter().map(|name| {
                let this = self.clone();
                let name = name.clone();
                async move {
                    let state = this
                        .registry
                        .get(&name)
                        .map(|e| e.state())
                        .unwrap_or(ModuleState::NotInstalled);
                    if state == ModuleState::Loaded {
                        match this.install_module(&name, None).await {
                            Ok(()) => {}
                            Err(ManagerError::ModuleConfigError { .. }) => return Ok(()),
                            Err(e) => return Err((name.clone(), e)),
                        }
                    }
                    let state = this
                        .registry
                        .get(&name)
                        .map(|e| e.state())
                        .unwrap_or(ModuleState::NotInstalled);
                    if !matches!(state, ModuleState::Installed | ModuleState::Stopped) {
                        return Ok(());
                    }
                    this.start_module(&name)
                        .await
                        .map_err(|e| (name.clone(), e))
                }
            });

            let results = futures::future::join_all(futures).await;
            let mut level_errors = Vec::new();
            for result in results {
                if let Err((name, err)) = result {
                    failed_modules.insert(name);
                    level_errors.push(err);
                }
            }

            if !level_errors.is_empty() {
                match policy {
                    ConcurrentStartPolicy::FailFast => return Err(level_errors),
                    ConcurrentStartPolicy::FailSoft => {
                        // keep going: later levels skip anything depending
                        // on a failed module (handled by `runnable` filter
                        // above), everything else is still attempted.
                        continue;
                    }
                }
            }
        }

        Ok(())
    }

    /// Explicit entry point for an externally-observed source change:
    /// reloads `name` in place. Exists independently of the watcher below
    /// so a caller with its own file-watching or signal-handling loop can
    /// drive reloads without `enable_hot_reload` being set.
    pub async fn trigger_reload(&self, name: &str) -> Result<(), ManagerError> {
        self.reload_module(name).await
    }

    /// When `enable_hot_reload` is set, subscribes to the attached
    /// `ModuleSource`'s change signal and spawns a task that calls
    /// `trigger_reload` for every name it emits. Returns `None` if hot
    /// reload is disabled or the source declines to support watching.
    /// A reload failure is logged and does not stop the watcher.
    pub async fn start_hot_reload_watcher(&self) -> Option<tokio::task::JoinHandle<()>> {
        if !self.config.enable_hot_reload {
            return None;
        }
        let mut changes = self.source.watch().await?;
        let this = self.clone();
        Some(tokio::spawn(async move {
            while let Some(name) = changes.recv().await {
                if let Err(err) = this.trigger_reload(&name).await {
                    tracing::warn!(module = %name, error = %err, "hot reload failed");
                }
            }
        }))
    }
}
