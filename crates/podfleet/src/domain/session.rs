//! Drives one fleet run through the [`RunStateMachine`]
//!
//! [`FleetRun`] turns confirmation events into state transitions and carries out
//! the resulting effects: it spawns the load-test task on start, tears the fleet
//! down on cancel and keeps healthy workers on reset. Progress is published on a
//! `watch` channel and finished plan steps on an `mpsc` channel, so a
//! presentation layer never has to reach into the orchestrator.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use error_stack::Report;
use futures::future::join_all;
use serde::Serialize;
use tokio::select;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::orchestrator::{FleetBringUp, FleetOrchestrator, FleetSpec, WorkerReport};
use super::plan::LoadTestPlan;
use super::run_state::{Effect, RunEvent, RunState, RunStateMachine};
use super::types::{ActionDone, FleetError, Result, WorkerPod};

/// Everything a run needs besides the cluster
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub spec: FleetSpec,
    pub plan: LoadTestPlan,
    /// Upper bound for the load-test phase; unfinished steps are cancelled
    pub deadline: Option<Duration>,
}

/// Snapshot published whenever the run moves
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunProgress {
    pub state: RunState,
    pub requested: usize,
    pub ready: usize,
    pub message: Option<String>,
}

/// Bring-up result of one worker, in a form that can be kept and printed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerSummary {
    pub name: String,
    pub ready: bool,
    pub error: Option<String>,
}

/// Final account of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub bring_up: Vec<WorkerSummary>,
    pub quorum_met: bool,
    pub deadline_exceeded: bool,
    pub workers: Vec<WorkerReport>,
}

impl RunReport {
    pub fn all_succeeded(&self, planned_steps: usize) -> bool {
        self.quorum_met && self.workers.iter().all(|w| w.succeeded(planned_steps))
    }
}

fn summarize(bring_up: &FleetBringUp) -> Vec<WorkerSummary> {
    bring_up
        .outcomes
        .iter()
        .map(|outcome| WorkerSummary {
            name: outcome.name.clone(),
            ready: outcome.is_ready(),
            error: outcome.result.as_ref().err().map(|e| e.to_string()),
        })
        .collect()
}

pub struct FleetRun {
    orchestrator: Arc<FleetOrchestrator>,
    config: RunConfig,
    machine: RunStateMachine,
    prepared: Option<Vec<WorkerSummary>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<RunReport>>,
    report: Option<RunReport>,
    progress: Arc<watch::Sender<RunProgress>>,
    actions: mpsc::UnboundedSender<ActionDone>,
}

impl FleetRun {
    /// Create a driver plus the receiving ends of its notification channels.
    pub fn new(
        orchestrator: Arc<FleetOrchestrator>,
        config: RunConfig,
    ) -> (
        Self,
        watch::Receiver<RunProgress>,
        mpsc::UnboundedReceiver<ActionDone>,
    ) {
        let (progress, progress_rx) = watch::channel(RunProgress {
            state: RunState::NotStarted,
            requested: config.spec.workers,
            ready: 0,
            message: None,
        });
        let (actions, actions_rx) = mpsc::unbounded_channel();

        let run = Self {
            orchestrator,
            config,
            machine: RunStateMachine::new(),
            prepared: None,
            cancel: CancellationToken::new(),
            task: None,
            report: None,
            progress: Arc::new(progress),
            actions,
        };
        (run, progress_rx, actions_rx)
    }

    pub fn state(&self) -> RunState {
        self.machine.state()
    }

    /// Current descriptors of every known worker
    pub fn workers(&self) -> Vec<WorkerPod> {
        self.orchestrator.cache().list()
    }

    pub fn report(&self) -> Option<&RunReport> {
        self.report.as_ref()
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Bring the fleet up ahead of the start confirmation.
    ///
    /// Optional: a run that was not prepared brings the fleet up after start.
    /// Firing `cancel` ends the bring-up early; workers created so far stay
    /// cached for teardown.
    pub async fn prepare(&mut self, cancel: &CancellationToken) -> Result<Vec<WorkerSummary>> {
        if !matches!(self.state(), RunState::NotStarted | RunState::StartConfirm) {
            return Err(Report::new(FleetError::InvalidTransition {
                from: self.state(),
                event: RunEvent::RequestStart,
            }));
        }

        let bring_up = self
            .orchestrator
            .bring_up_fleet(&self.config.spec, cancel)
            .await;
        let summary = summarize(&bring_up);
        self.publish(
            bring_up.ready_count(),
            Some(format!(
                "{} of {} workers ready",
                bring_up.ready_count(),
                bring_up.outcomes.len()
            )),
        );
        self.prepared = Some(summary.clone());
        Ok(summary)
    }

    pub fn request_start(&mut self) -> Result<RunState> {
        self.fire(RunEvent::RequestStart)
    }

    /// Start the run.
    ///
    /// When the fleet was prepared, the quorum has to be met already.
    pub fn confirm_start(&mut self) -> Result<RunState> {
        if self.state() == RunState::StartConfirm && self.prepared.is_some() {
            let spec = &self.config.spec;
            let ready = self.ready_workers();
            let required = spec.quorum.required(spec.workers);
            if ready < required {
                return Err(Report::new(FleetError::QuorumNotMet {
                    ready,
                    requested: spec.workers,
                    required,
                }));
            }
        }
        self.fire(RunEvent::ConfirmStart)
    }

    pub fn request_cancel(&mut self) -> Result<RunState> {
        self.fire(RunEvent::RequestCancel)
    }

    /// Abort the load test and delete the fleet.
    pub async fn confirm_cancel(&mut self) -> Result<RunState> {
        let state = self.fire(RunEvent::ConfirmCancel)?;
        self.teardown().await;
        Ok(state)
    }

    pub fn request_reset(&mut self) -> Result<RunState> {
        self.fire(RunEvent::RequestReset)
    }

    /// Return to `NotStarted`, keeping workers that are still healthy.
    pub async fn confirm_reset(&mut self) -> Result<RunState> {
        let state = self.fire(RunEvent::ConfirmReset)?;
        self.rearm().await;
        Ok(state)
    }

    pub fn decline(&mut self) -> Result<RunState> {
        self.fire(RunEvent::Decline)
    }

    /// Mark the results as gathered and hand out the report.
    pub fn collect(&mut self) -> Result<Option<&RunReport>> {
        self.fire(RunEvent::Collect)?;
        Ok(self.report.as_ref())
    }

    /// Wait for the load-test task and feed its completion to the state machine.
    ///
    /// Cancel safe, so it can sit in a `select!` next to input handling.
    pub async fn wait_finished(&mut self) -> Result<RunState> {
        let Some(task) = self.task.as_mut() else {
            return Ok(self.state());
        };

        let joined = task.await;
        self.task = None;
        match joined {
            Ok(report) => self.report = Some(report),
            Err(e) => error!("Load-test task failed: {e}"),
        }

        match self.state() {
            RunState::InProgress | RunState::CancelConfirm => self.fire(RunEvent::FleetFinished),
            state => Ok(state),
        }
    }

    fn ready_workers(&self) -> usize {
        let names = self.config.spec.worker_names();
        self.orchestrator
            .cache()
            .ready_pods()
            .iter()
            .filter(|pod| names.contains(&pod.name))
            .count()
    }

    fn fire(&mut self, event: RunEvent) -> Result<RunState> {
        let transition = self.machine.apply(event)?;
        info!(from = %transition.from, to = %transition.to, ?event, "Run state changed");

        match transition.effect {
            Effect::StartRun => self.start_task(),
            Effect::None | Effect::Teardown | Effect::Rearm => {}
        }
        self.publish(self.ready_workers(), None);
        Ok(transition.to)
    }

    fn publish(&self, ready: usize, message: Option<String>) {
        let state = self.state();
        self.progress.send_modify(|progress| {
            progress.state = state;
            progress.ready = ready;
            if message.is_some() {
                progress.message = message;
            }
        });
    }

    fn start_task(&mut self) {
        let orchestrator = self.orchestrator.clone();
        let config = self.config.clone();
        let prepared = self.prepared.take();
        let cancel = self.cancel.clone();
        let actions = self.actions.clone();
        let progress = self.progress.clone();

        self.report = None;
        self.task = Some(tokio::spawn(async move {
            execute_run(orchestrator, config, prepared, cancel, actions, progress).await
        }));
    }

    async fn teardown(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            match task.await {
                Ok(report) => self.report = Some(report),
                Err(e) => error!("Load-test task failed: {e}"),
            }
        }
        self.orchestrator.teardown_fleet().await;
        self.cancel = CancellationToken::new();
        self.publish(0, Some("fleet torn down".to_string()));
    }

    async fn rearm(&mut self) {
        let lifecycle = self.orchestrator.lifecycle();
        if let Err(e) = lifecycle.discover(&self.config.spec.namespace).await {
            warn!("Failed to discover fleet pods, keeping cached ones: {e:?}");
        }
        let cached = self.orchestrator.cache().list();

        let unhealthy: Vec<WorkerPod> = join_all(cached.iter().map(|pod| async move {
            match lifecycle.refresh(&pod.namespace, &pod.name).await {
                Ok(fresh) if fresh.is_ready() => None,
                Ok(fresh) => Some(fresh),
                Err(_) => None,
            }
        }))
        .await
        .into_iter()
        .flatten()
        .collect();

        for pod in &unhealthy {
            warn!(pod_name = %pod.name, status = ?pod.status, "Dropping unhealthy worker");
        }
        self.orchestrator.delete_workers(&unhealthy).await;

        self.prepared = None;
        self.report = None;
        self.cancel = CancellationToken::new();
        let ready = self.ready_workers();
        self.publish(ready, Some(format!("{ready} healthy workers kept")));
    }
}

async fn execute_run(
    orchestrator: Arc<FleetOrchestrator>,
    config: RunConfig,
    prepared: Option<Vec<WorkerSummary>>,
    cancel: CancellationToken,
    actions: mpsc::UnboundedSender<ActionDone>,
    progress: Arc<watch::Sender<RunProgress>>,
) -> RunReport {
    let started_at = Utc::now();

    let (bring_up, quorum_met) = match prepared {
        Some(summary) => (summary, true),
        None => {
            let bring_up = orchestrator.bring_up_fleet(&config.spec, &cancel).await;
            let quorum_met = bring_up.quorum_met();
            (summarize(&bring_up), quorum_met)
        }
    };

    let ready: Vec<String> = bring_up
        .iter()
        .filter(|w| w.ready)
        .map(|w| w.name.clone())
        .collect();
    progress.send_modify(|p| {
        p.ready = ready.len();
        p.message = Some(format!("{} workers running the load test", ready.len()));
    });

    if !quorum_met {
        warn!(ready = ready.len(), "Quorum not met, skipping load test");
        progress.send_modify(|p| p.message = Some("quorum not met".to_string()));
        return RunReport {
            started_at,
            finished_at: Utc::now(),
            bring_up,
            quorum_met,
            deadline_exceeded: false,
            workers: Vec::new(),
        };
    }

    let plans = config.plan.assign(&ready);
    let plan_cancel = cancel.child_token();
    let run_plans = orchestrator.run_plans(&plans, &plan_cancel, Some(&actions));
    tokio::pin!(run_plans);

    let mut deadline_exceeded = false;
    let workers = match config.deadline {
        Some(deadline) => select! {
            workers = &mut run_plans => workers,
            _ = tokio::time::sleep(deadline) => {
                warn!(?deadline, "Run deadline reached, cancelling remaining steps");
                deadline_exceeded = true;
                plan_cancel.cancel();
                run_plans.await
            }
        },
        None => run_plans.await,
    };

    RunReport {
        started_at,
        finished_at: Utc::now(),
        bring_up,
        quorum_met,
        deadline_exceeded,
        workers,
    }
}
