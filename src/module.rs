//! Module identity, metadata and the lifecycle capability set.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

/// The declarative shape of a module, cached on its registry entry once
/// attached. Dependency order is preserved for diagnostics even though it
/// has no bearing on correctness.
#[derive(Debug, Clone, Default)]
pub struct ModuleMetadata {
    pub name: String,
    pub version: String,
    pub description: Option<String>,
    pub dependencies: Vec<String>,
    pub optional_dependencies: Vec<String>,
    pub config_schema: Option<HashMap<String, ConfigValueType>>,
}

impl ModuleMetadata {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            ..Default::default()
        }
    }

    pub fn with_dependencies(mut self, deps: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_optional_dependencies(
        mut self,
        deps: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.optional_dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_config_schema(mut self, schema: HashMap<String, ConfigValueType>) -> Self {
        self.config_schema = Some(schema);
        self
    }
}

/// The declarative type shapes a `config_schema` entry may require. Used
/// only by the structural fallback in `validate_against_schema` when a
/// module does not implement its own `validate_config`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigValueType {
    String,
    Integer,
    Float,
    Bool,
    Object,
    Array,
}

impl ConfigValueType {
    fn matches(self, v: &Value) -> bool {
        match self {
            ConfigValueType::String => v.is_string(),
            ConfigValueType::Integer => v.is_i64() || v.is_u64(),
            ConfigValueType::Float => v.is_f64() || v.is_i64() || v.is_u64(),
            ConfigValueType::Bool => v.is_boolean(),
            ConfigValueType::Object => v.is_object(),
            ConfigValueType::Array => v.is_array(),
        }
    }
}

/// Structurally checks `config` against `schema`, used as a fallback when a
/// module has no `validate_config` override of its own. Every declared key
/// must be present and type-match; unknown keys are tolerated (the schema
/// describes what the module reads, not a closed set).
pub fn validate_against_schema(
    schema: &HashMap<String, ConfigValueType>,
    config: &Value,
) -> Result<(), String> {
    let obj = config
        .as_object()
        .ok_or_else(|| "config must be a JSON object".to_string())?;
    for (key, expected) in schema {
        match obj.get(key) {
            None => return Err(format!("missing required config key '{key}'")),
            Some(v) if !expected.matches(v) => {
                return Err(format!("config key '{key}' does not match expected type {expected:?}"))
            }
            Some(_) => {}
        }
    }
    Ok(())
}

/// The lifecycle capability set a user-supplied module offers. Every
/// hook is `async` so a purely synchronous implementation is simply one
/// whose body never awaits — a single call path, no runtime type
/// inspection. Every method has a no-op default so "hook absent" requires
/// no wrapper type.
#[async_trait]
pub trait ModuleInstance: Send + Sync {
    fn metadata(&self) -> ModuleMetadata;

    async fn bootstrap(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn install(&self, _config: &Value) -> anyhow::Result<()> {
        Ok(())
    }

    async fn start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn uninstall(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn reload(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// `None` means "no custom validation"; the Manager falls back to
    /// `validate_against_schema` against `metadata().config_schema`.
    fn validate_config(&self, _config: &Value) -> Option<bool> {
        None
    }

    /// Escape hatch for downcasting to a concrete module type, used for
    /// dependency injection between modules.
    fn as_any(&self) -> &dyn Any;
}

/// A fresh-instance producer, invoked on initial `load_module` and again
/// on every `reload_module`.
pub trait ModuleFactory: Send + Sync {
    fn create(&self) -> Arc<dyn ModuleInstance>;
}

impl<F> ModuleFactory for F
where
    F: Fn() -> Arc<dyn ModuleInstance> + Send + Sync,
{
    fn create(&self) -> Arc<dyn ModuleInstance> {
        (self)()
    }
}

/// External collaborator: discovers module names and hands back
/// factories. Disk scanning, package resolution, and file watching all
/// live on the other side of this trait — out of scope for the core.
#[async_trait]
pub trait ModuleSource: Send + Sync {
    async fn discover(&self) -> anyhow::Result<Vec<String>>;

    async fn load(&self, name: &str) -> anyhow::Result<Box<dyn ModuleFactory>>;

    /// Optional; only polled when `ManagerConfig::enable_hot_reload` is set.
    /// Default: no watching support.
    async fn watch(&self) -> Option<tokio::sync::mpsc::Receiver<String>> {
        None
    }
}
