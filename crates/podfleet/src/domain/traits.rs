//! Seams between the fleet logic and the outside world
//!
//! The Kubernetes-backed implementations live in `infrastructure::k8s`; tests
//! use the fakes in `domain::mock`.

use std::time::Duration;

use error_stack::Report;
use k8s_openapi::api::core::v1::Pod;
use tracing::warn;

use super::types::{ExecOutput, FleetError, Result, WorkerPod};

/// Pod and health operations against the cluster API server
#[async_trait::async_trait]
pub trait ClusterApi: Send + Sync {
    /// Submit a pod object, returning what the API server stored
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod>;

    /// Fetch the current state of a pod
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod>;

    /// Request deletion with background propagation, without waiting for it
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;

    /// List pods matching a label selector
    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>>;

    /// Raw body of the API server health endpoint
    async fn health(&self) -> Result<String>;
}

/// Runs one shell command inside a worker pod and waits for it to exit
#[async_trait::async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn run(&self, pod: &WorkerPod, command: &str) -> Result<ExecOutput>;
}

/// Time source used by polling loops
#[async_trait::async_trait]
pub trait Clock: Send + Sync {
    /// Monotonic time since the clock was created
    fn elapsed(&self) -> Duration;

    async fn sleep(&self, duration: Duration);
}

/// Wall clock backed by tokio's timer.
#[derive(Debug, Clone)]
pub struct TokioClock {
    origin: tokio::time::Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Clock for TokioClock {
    fn elapsed(&self) -> Duration {
        self.origin.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Receives notice of best-effort cleanup attempts
pub trait CleanupObserver: Send + Sync {
    fn on_attempt(&self, namespace: &str, pod_name: &str);

    fn on_failure(&self, namespace: &str, pod_name: &str, error: &Report<FleetError>);
}

/// Logs cleanup failures through `tracing`.
#[derive(Debug, Default)]
pub struct TracingCleanupObserver;

impl CleanupObserver for TracingCleanupObserver {
    fn on_attempt(&self, namespace: &str, pod_name: &str) {
        tracing::debug!(namespace = %namespace, pod_name = %pod_name, "Deleting worker pod");
    }

    fn on_failure(&self, namespace: &str, pod_name: &str, error: &Report<FleetError>) {
        warn!(
            namespace = %namespace,
            pod_name = %pod_name,
            "Failed to delete worker pod, ignoring: {error:?}"
        );
    }
}
