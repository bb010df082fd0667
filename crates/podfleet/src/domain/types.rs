//! Core data types shared by the fleet components
//!
//! Worker pod descriptors, command execution results and the error kinds every
//! cluster-facing operation reports.

use core::error::Error;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::Serialize;

/// Errors reported by fleet operations.
///
/// Travels inside an [`error_stack::Report`] so the underlying transport error
/// stays attached to the chain.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum FleetError {
    #[display("Cluster request failed: {message}")]
    Transport { message: String },
    #[display("Pod {namespace}/{pod_name} not found")]
    NotFound { namespace: String, pod_name: String },
    #[display("Pod {namespace}/{pod_name} already exists")]
    AlreadyExists { namespace: String, pod_name: String },
    #[display("Cluster is not healthy, health endpoint returned {payload:?}")]
    Unhealthy { payload: String },
    #[display("Operation cancelled: {reason}")]
    Cancelled { reason: CancelReason },
    #[display("Failed executing command {command:?} on {namespace}/{pod_name}")]
    Exec {
        namespace: String,
        pod_name: String,
        command: String,
    },
    #[display("Transition {event:?} is not allowed from {from:?}")]
    InvalidTransition {
        from: super::run_state::RunState,
        event: super::run_state::RunEvent,
    },
    #[display("Only {ready} of {requested} workers became ready, {required} required")]
    QuorumNotMet {
        ready: usize,
        requested: usize,
        required: usize,
    },
    #[display("Invalid fleet specification: {message}")]
    InvalidSpec { message: String },
}

impl Error for FleetError {}

impl FleetError {
    /// True for both deadline expiry and explicit cancellation.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, FleetError::Cancelled { .. })
    }

    /// True when the API server confirmed the pod does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, FleetError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, FleetError::AlreadyExists { .. })
    }
}

/// Why an operation was abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// A bounded wait ran out of time.
    Timeout(Duration),
    /// The caller's cancellation token fired.
    Requested,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Timeout(after) => write!(f, "timed out after {after:?}"),
            CancelReason::Requested => write!(f, "cancellation requested"),
        }
    }
}

/// Result type for fleet operations
pub type Result<T> = std::result::Result<T, error_stack::Report<FleetError>>;

/// Last observed status of a worker pod
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum PodStatus {
    /// Accepted by the API server, not yet running
    #[default]
    Pending,
    /// Phase is running but at least one container is not ready
    Running,
    /// Phase is running and every container reports ready
    Ready,
    /// The pod terminated or could not be scheduled
    Failed,
    /// Deletion has been requested
    Deleted,
}

/// Descriptor of a single worker pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerPod {
    pub name: String,
    pub namespace: String,
    pub image: String,
    pub command: Vec<String>,
    pub keep_alive_secs: u64,
    pub labels: BTreeMap<String, String>,
    pub status: PodStatus,
}

impl WorkerPod {
    pub fn is_ready(&self) -> bool {
        self.status == PodStatus::Ready
    }

    pub fn with_status(mut self, status: PodStatus) -> Self {
        self.status = status;
        self
    }
}

/// Output collected from one exec session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    /// Set when the remote command exited unsuccessfully.
    pub failure: Option<String>,
}

/// Outcome of a remote command
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason")]
pub enum ExecOutcome {
    Succeeded,
    Failed(String),
}

/// Result of running one command on one worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    pub pod_name: String,
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    pub outcome: ExecOutcome,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        self.outcome == ExecOutcome::Succeeded
    }
}

/// A named step of a worker plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    pub display_name: String,
    pub command: String,
}

impl RemoteCommand {
    pub fn new(display_name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            command: command.into(),
        }
    }
}

/// Emitted each time a worker finishes one plan step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionDone {
    pub pod_name: String,
    pub name: String,
    pub duration: Duration,
    pub succeeded: bool,
}

/// Files assigned to a single worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestInfo {
    pub pod_name: String,
    pub properties_file: String,
    pub scenario_file: String,
    pub results_file: String,
}

pub(crate) mod duration_millis {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }
}
