//! # modkit-lifecycle
//!
//! A dependency-aware module lifecycle core: a directed dependency graph
//! with deterministic topological ordering and cycle detection, a fixed
//! state machine (`NOT_INSTALLED -> LOADED -> INSTALLED -> STARTED`, with
//! `STOPPED`/`ERROR` side states), a `Registry`/`Manager` pair coordinating
//! concurrent lifecycle operations over that state machine, and a
//! pattern-matched event bus for lifecycle notifications.
//!
//! ## Basic usage
//!
//! ```rust,ignore
//! use modkit_lifecycle::{Manager, ManagerConfig, ModuleSource};
//! use std::sync::Arc;
//!
//! async fn run(source: Arc<dyn ModuleSource>) -> anyhow::Result<()> {
//!     let manager = Manager::new(source, ManagerConfig::default());
//!     for name in manager.discover().await? {
//!         manager.load_module(&name).await?;
//!     }
//!     manager.start_all().await?;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod event_bus;
pub mod graph;
pub mod manager;
pub mod module;
pub mod registry;
pub mod resolver;
pub mod state;

pub use error::{GraphError, IllegalTransitionError, ManagerError};
pub use event_bus::{event_type, Event, EventBus, EventHandler, SubscriptionId};
pub use graph::DependencyGraph;
pub use manager::{ConcurrentStartPolicy, Manager, ManagerConfig};
pub use module::{
    validate_against_schema, ConfigValueType, ModuleFactory, ModuleInstance, ModuleMetadata,
    ModuleSource,
};
pub use registry::{ErrorRecord, Registry, RegistryEntrySnapshot};
pub use resolver::Resolver;
pub use state::{Action, ModuleState, StateMachine};
