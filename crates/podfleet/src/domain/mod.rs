pub mod context;
pub mod executor;
pub mod health;
pub mod lifecycle;
pub mod orchestrator;
pub mod plan;
pub mod pod_cache;
pub mod pod_spec;
pub mod readiness;
pub mod run_state;
pub mod session;
pub mod traits;
pub mod types;

#[cfg(test)]
pub(crate) mod mock;

// Re-export the types most callers need
pub use context::FleetContext;
pub use orchestrator::{FleetOrchestrator, FleetSpec, QuorumPolicy};
pub use run_state::{RunEvent, RunState};
pub use session::{FleetRun, RunConfig, RunProgress, RunReport};
pub use types::{FleetError, WorkerPod};
