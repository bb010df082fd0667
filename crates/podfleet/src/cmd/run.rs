use std::fs::File;
use std::io::BufWriter;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

use crate::cmd::{connect, report};
use crate::config::{ClusterArgs, RunArgs};
use crate::domain::health::check_connection;
use crate::domain::session::WorkerSummary;
use crate::domain::types::ActionDone;
use crate::domain::{FleetContext, FleetRun, RunProgress, RunReport, RunState};

pub async fn run_load_test(cluster: &ClusterArgs, args: &RunArgs) -> Result<()> {
    let (handle, kube) = connect(cluster).await?;
    check_connection(&*kube).await.map_err(report)?;

    let (fleet, config) = args
        .resolve(&handle.default_namespace)
        .context("invalid run configuration")?;
    let planned_steps = config.plan.steps_per_worker();

    let orchestrator = Arc::new(
        FleetContext::new(kube.clone(), kube).orchestrator(fleet.template, fleet.readiness),
    );
    let (mut run, progress, actions) = FleetRun::new(orchestrator.clone(), config);
    let watchers = [
        tokio::spawn(log_progress(progress)),
        tokio::spawn(log_actions(actions)),
    ];

    let interrupted = CancellationToken::new();
    let interrupt_watch = tokio::spawn(cancel_on_ctrl_c(interrupted.clone()));

    let result = drive(&mut run, args, &interrupted).await;

    if let Some(report) = run.report() {
        print_report(report, planned_steps);
        if let Some(path) = &args.report {
            write_report(report, path)?;
        }
    }
    let keep_fleet = args.keep_fleet && !interrupted.is_cancelled();
    if run.state() != RunState::Cancelled && !keep_fleet {
        orchestrator.teardown_fleet().await;
    }
    interrupt_watch.abort();
    for watcher in watchers {
        watcher.abort();
    }

    result?;
    match run.report() {
        Some(report) if report.all_succeeded(planned_steps) => Ok(()),
        Some(_) => anyhow::bail!("load test did not succeed on every worker"),
        None => Ok(()),
    }
}

async fn drive(run: &mut FleetRun, args: &RunArgs, interrupted: &CancellationToken) -> Result<()> {
    let prepared = run.prepare(interrupted).await.map_err(report)?;
    print_bring_up(&prepared);
    if interrupted.is_cancelled() {
        anyhow::bail!("interrupted while bringing up the fleet");
    }

    run.request_start().map_err(report)?;
    let ready = prepared.iter().filter(|w| w.ready).count();
    if !args.yes {
        let question = format!("Start the load test on {ready} workers?");
        let answer = tokio::select! {
            answer = confirm(&question) => Some(answer?),
            _ = interrupted.cancelled() => None,
        };
        match answer {
            Some(true) => {}
            Some(false) => {
                run.decline().map_err(report)?;
                println!("Load test not started");
                return Ok(());
            }
            None => {
                eprintln!();
                run.decline().map_err(report)?;
                anyhow::bail!("interrupted before the load test started");
            }
        }
    }
    run.confirm_start().map_err(report)?;

    let cancelled = tokio::select! {
        finished = run.wait_finished() => {
            finished.map_err(report)?;
            false
        }
        _ = interrupted.cancelled() => true,
    };

    if cancelled && run.state() == RunState::InProgress {
        warn!("Interrupted, cancelling the load test");
        run.request_cancel().map_err(report)?;
        run.confirm_cancel().await.map_err(report)?;
    }
    if run.state() == RunState::Completed {
        run.collect().map_err(report)?;
    }
    Ok(())
}

async fn cancel_on_ctrl_c(interrupted: CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            warn!("Interrupted, the fleet will be torn down");
            interrupted.cancel();
        }
        Err(e) => warn!("Failed to listen for Ctrl-C: {e}"),
    }
}

/// Ask on stderr and read the answer from stdin.
///
/// The read runs on its own thread so an abandoned prompt does not hold up exit.
async fn confirm(question: &str) -> Result<bool> {
    eprint!("{question} [y/N] ");
    let (answer_tx, answer_rx) = oneshot::channel();
    std::thread::spawn(move || {
        let mut line = String::new();
        let read = std::io::stdin().read_line(&mut line).map(|_| line);
        let _ = answer_tx.send(read);
    });

    let line = answer_rx
        .await
        .context("confirmation reader stopped")?
        .context("failed to read confirmation")?;
    Ok(matches!(
        line.trim().to_ascii_lowercase().as_str(),
        "y" | "yes"
    ))
}

async fn log_progress(mut progress: watch::Receiver<RunProgress>) {
    while progress.changed().await.is_ok() {
        let current = progress.borrow_and_update().clone();
        info!(
            state = %current.state,
            ready = current.ready,
            requested = current.requested,
            "{}",
            current.message.unwrap_or_default()
        );
    }
}

async fn log_actions(mut actions: mpsc::UnboundedReceiver<ActionDone>) {
    while let Some(action) = actions.recv().await {
        info!(
            pod_name = %action.pod_name,
            step = %action.name,
            duration_ms = action.duration.as_millis() as u64,
            succeeded = action.succeeded,
            "Step done"
        );
    }
}

fn print_bring_up(workers: &[WorkerSummary]) {
    for worker in workers {
        match &worker.error {
            None if worker.ready => println!("{:<24} ready", worker.name),
            None => println!("{:<24} not ready", worker.name),
            Some(error) => println!("{:<24} not ready: {error}", worker.name),
        }
    }
}

fn print_report(report: &RunReport, planned_steps: usize) {
    println!();
    if !report.quorum_met {
        println!("Quorum not met, the load test did not run");
    }
    if report.deadline_exceeded {
        println!("Run deadline exceeded, unfinished steps were cancelled");
    }
    for worker in &report.workers {
        let verdict = if worker.succeeded(planned_steps) { "ok" } else { "FAILED" };
        println!(
            "{} [{verdict}] results in {}",
            worker.info.pod_name, worker.info.results_file
        );
        for result in &worker.results {
            super::exec::print_result(result);
        }
    }
}

fn write_report(report: &RunReport, path: &std::path::Path) -> Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), report)
        .with_context(|| format!("failed to write run report to {}", path.display()))?;
    info!(path = %path.display(), "Run report written");
    Ok(())
}
