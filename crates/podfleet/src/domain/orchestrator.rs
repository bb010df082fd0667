//! Fleet-wide bring-up, command fan-out and teardown
//!
//! Every operation here fans out one unit of work per worker and waits for all
//! of them before returning. A worker that fails never stops its peers, and its
//! outcome is always part of the returned result.

use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

use super::executor::{execute, run_cancellable, to_execution_result};
use super::lifecycle::PodLifecycleManager;
use super::pod_cache::PodCache;
use super::plan::WorkerPlan;
use super::traits::{CleanupObserver, RemoteExecutor};
use super::types::{
    ActionDone, CancelReason, ExecutionResult, FleetError, Result, TestInfo, WorkerPod,
};

/// How many workers must be ready before the fleet is usable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QuorumPolicy {
    #[default]
    All,
    AtLeast(usize),
    /// Percentage of requested workers, rounded up
    Percent(u8),
}

impl QuorumPolicy {
    pub fn required(&self, requested: usize) -> usize {
        match *self {
            QuorumPolicy::All => requested,
            QuorumPolicy::AtLeast(n) => n.min(requested),
            QuorumPolicy::Percent(p) => (requested * usize::from(p.min(100))).div_ceil(100),
        }
    }
}

/// Shape of the fleet to bring up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetSpec {
    pub namespace: String,
    pub name_prefix: String,
    pub workers: usize,
    pub keep_alive_secs: u64,
    /// Overrides the lifecycle manager's readiness timeout
    pub ready_timeout: Option<Duration>,
    pub quorum: QuorumPolicy,
}

impl FleetSpec {
    /// Worker names are `<prefix>-<index>`, starting at zero.
    pub fn worker_names(&self) -> Vec<String> {
        (0..self.workers)
            .map(|index| format!("{}-{index}", self.name_prefix))
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |message: String| Err(Report::new(FleetError::InvalidSpec { message }));
        if self.workers == 0 {
            return invalid("worker count must be at least 1".to_string());
        }
        if self.name_prefix.is_empty() || self.namespace.is_empty() {
            return invalid("namespace and name prefix must not be empty".to_string());
        }
        if self.keep_alive_secs == 0 {
            return invalid("keep-alive must be at least one second".to_string());
        }
        if let QuorumPolicy::AtLeast(0) | QuorumPolicy::Percent(0) = self.quorum {
            return invalid("quorum must require at least one worker".to_string());
        }
        Ok(())
    }
}

/// Bring-up result for a single worker
#[derive(Debug)]
pub struct WorkerOutcome {
    pub name: String,
    pub result: Result<WorkerPod>,
}

impl WorkerOutcome {
    pub fn is_ready(&self) -> bool {
        self.result.as_ref().is_ok_and(WorkerPod::is_ready)
    }
}

/// Outcome of [`FleetOrchestrator::bring_up_fleet`], one entry per requested worker
#[derive(Debug)]
pub struct FleetBringUp {
    pub outcomes: Vec<WorkerOutcome>,
    pub required: usize,
}

impl FleetBringUp {
    pub fn ready_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_ready()).count()
    }

    pub fn quorum_met(&self) -> bool {
        self.ready_count() >= self.required
    }

    pub fn ready_names(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter(|o| o.is_ready())
            .map(|o| o.name.clone())
            .collect()
    }

    /// Error describing a missed quorum, if any.
    pub fn check_quorum(&self) -> Result<()> {
        if self.quorum_met() {
            return Ok(());
        }
        Err(Report::new(FleetError::QuorumNotMet {
            ready: self.ready_count(),
            requested: self.outcomes.len(),
            required: self.required,
        }))
    }
}

/// What one worker did while running its plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerReport {
    pub info: TestInfo,
    pub results: Vec<ExecutionResult>,
}

impl WorkerReport {
    /// True when every step ran and succeeded.
    pub fn succeeded(&self, planned_steps: usize) -> bool {
        self.results.len() == planned_steps && self.results.iter().all(ExecutionResult::succeeded)
    }
}

pub struct FleetOrchestrator {
    lifecycle: Arc<PodLifecycleManager>,
    executor: Arc<dyn RemoteExecutor>,
    observer: Arc<dyn CleanupObserver>,
}

impl FleetOrchestrator {
    pub fn new(
        lifecycle: Arc<PodLifecycleManager>,
        executor: Arc<dyn RemoteExecutor>,
        observer: Arc<dyn CleanupObserver>,
    ) -> Self {
        Self {
            lifecycle,
            executor,
            observer,
        }
    }

    pub fn cache(&self) -> &Arc<PodCache> {
        self.lifecycle.cache()
    }

    pub fn lifecycle(&self) -> &Arc<PodLifecycleManager> {
        &self.lifecycle
    }

    /// Create every worker and wait for each to become ready, all concurrently.
    ///
    /// Workers already cached as ready are reused instead of being created again.
    #[tracing::instrument(skip(self, spec, cancel), fields(namespace = %spec.namespace, workers = spec.workers))]
    pub async fn bring_up_fleet(
        &self,
        spec: &FleetSpec,
        cancel: &CancellationToken,
    ) -> FleetBringUp {
        let names = spec.worker_names();
        let outcomes = join_all(names.into_iter().map(|name| async move {
            let result = self.bring_up_worker(spec, &name, cancel).await;
            if let Err(e) = &result {
                warn!(pod_name = %name, "Worker did not become ready: {e:?}");
            }
            WorkerOutcome { name, result }
        }))
        .await;

        let bring_up = FleetBringUp {
            outcomes,
            required: spec.quorum.required(spec.workers),
        };
        info!(
            ready = bring_up.ready_count(),
            required = bring_up.required,
            "Fleet bring-up finished"
        );
        bring_up
    }

    async fn bring_up_worker(
        &self,
        spec: &FleetSpec,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<WorkerPod> {
        if cancel.is_cancelled() {
            return Err(Report::new(FleetError::Cancelled {
                reason: CancelReason::Requested,
            }));
        }
        match self.cache().get(name) {
            Some(cached) if cached.is_ready() => {
                info!(pod_name = %name, "Reusing ready worker");
                return Ok(cached);
            }
            // Already submitted by an earlier bring-up, only wait for it.
            Some(_) => {}
            None => {
                self.lifecycle
                    .create_worker(&spec.namespace, name, spec.keep_alive_secs, cancel)
                    .await?;
            }
        }

        self.lifecycle
            .await_ready(&spec.namespace, name, spec.ready_timeout, cancel)
            .await
    }

    /// Run `command` on every ready worker concurrently.
    ///
    /// Results come back ordered by pod name.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn dispatch(
        &self,
        command: &str,
        cancel: &CancellationToken,
    ) -> Vec<ExecutionResult> {
        let pods = self.cache().ready_pods();
        if pods.is_empty() {
            warn!("No ready workers to dispatch to");
        }

        let executor = &*self.executor;
        join_all(
            pods.iter()
                .map(|pod| async move { execute(executor, pod, command, cancel).await }),
        )
        .await
    }

    /// Run each worker's plan step by step, all workers concurrently.
    ///
    /// A failed step ends that worker's plan; the others carry on. Every
    /// finished step is reported on `actions` when given.
    #[tracing::instrument(skip_all, fields(workers = plans.len()))]
    pub async fn run_plans(
        &self,
        plans: &[WorkerPlan],
        cancel: &CancellationToken,
        actions: Option<&mpsc::UnboundedSender<ActionDone>>,
    ) -> Vec<WorkerReport> {
        join_all(
            plans
                .iter()
                .map(|plan| self.run_worker_plan(plan, cancel, actions)),
        )
        .await
    }

    async fn run_worker_plan(
        &self,
        plan: &WorkerPlan,
        cancel: &CancellationToken,
        actions: Option<&mpsc::UnboundedSender<ActionDone>>,
    ) -> WorkerReport {
        let mut results = Vec::with_capacity(plan.steps.len());
        let pod_name = &plan.info.pod_name;

        let Some(pod) = self.cache().get(pod_name).filter(WorkerPod::is_ready) else {
            warn!(pod_name = %pod_name, "Worker is not ready, skipping its plan");
            return WorkerReport {
                info: plan.info.clone(),
                results,
            };
        };

        for step in &plan.steps {
            let started = Instant::now();
            let result = run_cancellable(&*self.executor, &pod, &step.command, cancel).await;
            let result = to_execution_result(&pod, &step.command, result, started.elapsed());
            let succeeded = result.succeeded();

            if let Some(actions) = actions {
                let _ = actions.send(ActionDone {
                    pod_name: pod_name.clone(),
                    name: step.display_name.clone(),
                    duration: result.duration,
                    succeeded,
                });
            }
            info!(
                pod_name = %pod_name,
                step = %step.display_name,
                succeeded,
                "Plan step finished"
            );
            results.push(result);

            if !succeeded {
                break;
            }
        }

        WorkerReport {
            info: plan.info.clone(),
            results,
        }
    }

    /// Request deletion of every cached worker.
    ///
    /// Best effort: failures go to the cleanup observer and are otherwise ignored.
    #[tracing::instrument(skip(self))]
    pub async fn teardown_fleet(&self) {
        let pods = self.cache().list();
        info!(count = pods.len(), "Tearing down fleet");
        self.delete_workers(&pods).await;
    }

    /// Request deletion of `pods` concurrently.
    ///
    /// A worker whose delete fails stays cached so a later teardown retries it.
    pub async fn delete_workers(&self, pods: &[WorkerPod]) {
        join_all(pods.iter().map(|pod| async move {
            self.observer.on_attempt(&pod.namespace, &pod.name);
            if let Err(e) = self
                .lifecycle
                .delete_worker(&pod.namespace, &pod.name)
                .await
            {
                self.observer.on_failure(&pod.namespace, &pod.name, &e);
            }
        }))
        .await;
    }
}
