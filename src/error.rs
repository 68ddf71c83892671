//! Error taxonomy for the lifecycle core.
//!
//! One closed enum covers every failure kind raised across the graph,
//! state machine, registry, resolver and manager; callers match on
//! variants rather than parsing messages.

use thiserror::Error;

use crate::state::ModuleState;

/// Errors raised while mutating the dependency graph.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("cyclic dependency detected: {}", path.join(" -> "))]
    CyclicDependency { path: Vec<String> },
}

/// Errors raised by the state machine when a transition is not legal
/// from the entry's current state.
#[derive(Debug, Error)]
#[error("illegal transition '{action}' for module '{module}' in state {from:?}")]
pub struct IllegalTransitionError {
    pub module: String,
    pub from: ModuleState,
    pub action: &'static str,
}

/// Top-level error type returned by the Manager and Registry.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("module '{0}' not found")]
    ModuleNotFound(String),

    #[error("module '{0}' is already registered")]
    DuplicateModule(String),

    #[error("failed to load module '{module}'")]
    ModuleLoadError {
        module: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("invalid configuration for module '{module}': {reason}")]
    ModuleConfigError { module: String, reason: String },

    #[error(transparent)]
    IllegalTransition(#[from] IllegalTransitionError),

    #[error(transparent)]
    CyclicDependency(#[from] GraphError),

    #[error("module '{module}' cannot start: dependency '{dependency}' is not started")]
    DependencyNotStarted { module: String, dependency: String },

    #[error("module '{module}' cannot stop: dependent '{dependent}' is still started")]
    DependentStillRunning { module: String, dependent: String },

    #[error("hook '{hook}' failed for module '{module}'")]
    HookFailure {
        module: String,
        hook: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("operation on module '{module}' timed out after {elapsed_ms}ms")]
    Timeout { module: String, elapsed_ms: u128 },
}

impl ManagerError {
    /// Stable, short kind tag for logging/metrics (not a Display message).
    pub fn kind(&self) -> &'static str {
        match self {
            ManagerError::ModuleNotFound(_) => "ModuleNotFound",
            ManagerError::DuplicateModule(_) => "DuplicateModule",
            ManagerError::ModuleLoadError { .. } => "ModuleLoadError",
            ManagerError::ModuleConfigError { .. } => "ModuleConfigError",
            ManagerError::IllegalTransition(_) => "IllegalTransition",
            ManagerError::CyclicDependency(_) => "CyclicDependency",
            ManagerError::DependencyNotStarted { .. } => "DependencyNotStarted",
            ManagerError::DependentStillRunning { .. } => "DependentStillRunning",
            ManagerError::HookFailure { .. } => "HookFailure",
            ManagerError::Timeout { .. } => "Timeout",
        }
    }

    pub fn module_name(&self) -> Option<&str> {
        match self {
            ManagerError::ModuleNotFound(m) => Some(m),
            ManagerError::DuplicateModule(m) => Some(m),
            ManagerError::ModuleLoadError { module, .. } => Some(module),
            ManagerError::ModuleConfigError { module, .. } => Some(module),
            ManagerError::IllegalTransition(e) => Some(&e.module),
            ManagerError::CyclicDependency(_) => None,
            ManagerError::DependencyNotStarted { module, .. } => Some(module),
            ManagerError::DependentStillRunning { module, .. } => Some(module),
            ManagerError::HookFailure { module, .. } => Some(module),
            ManagerError::Timeout { module, .. } => Some(module),
        }
    }
}
