pub mod config;
pub mod consistency;
pub mod coordinator;
pub mod lifecycle;
pub mod locks;
pub mod relay;

#[cfg(test)]
pub(crate) mod testing;

pub use config::OrchestratorConfig;
pub use consistency::{ConsistencyChecker, ConsistencyReport};
pub use coordinator::{CoordinatorError, RunCoordinator};
pub use lifecycle::{LifecycleError, LifecycleService};
pub use locks::ProjectLocks;
pub use relay::{LogEvent, LogEventKind, LogRelay};
