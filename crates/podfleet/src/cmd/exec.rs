use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::cmd::{connect, report};
use crate::config::{ClusterArgs, ExecArgs};
use crate::domain::types::{ExecOutcome, ExecutionResult};
use crate::domain::FleetContext;

pub async fn run_exec(cluster: &ClusterArgs, args: &ExecArgs) -> Result<()> {
    let (handle, kube) = connect(cluster).await?;
    let fleet = args.fleet.resolve(&handle.default_namespace)?;

    let orchestrator = FleetContext::new(kube.clone(), kube).orchestrator(fleet.template, fleet.readiness);
    orchestrator
        .lifecycle()
        .discover(&fleet.spec.namespace)
        .await
        .map_err(report)?;

    let cancel = CancellationToken::new();
    let watchdog = tokio::spawn(cancel_on_interrupt(
        cancel.clone(),
        args.timeout_secs.map(Duration::from_secs),
    ));
    let results = orchestrator.dispatch(&args.command, &cancel).await;
    watchdog.abort();

    if results.is_empty() {
        anyhow::bail!("no ready workers in {}", fleet.spec.namespace);
    }
    for result in &results {
        print_result(result);
    }

    let failed = results.iter().filter(|r| !r.succeeded()).count();
    if failed > 0 {
        anyhow::bail!("command failed on {failed} of {} workers", results.len());
    }
    Ok(())
}

/// Cancel on Ctrl-C, or once `timeout` passed.
async fn cancel_on_interrupt(cancel: CancellationToken, timeout: Option<Duration>) {
    let deadline = async {
        match timeout {
            Some(timeout) => tokio::time::sleep(timeout).await,
            None => futures::future::pending().await,
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => warn!("Interrupted, abandoning running commands"),
        _ = deadline => warn!("Timed out, abandoning running commands"),
    }
    cancel.cancel();
}

pub(crate) fn print_result(result: &ExecutionResult) {
    let status = match &result.outcome {
        ExecOutcome::Succeeded => "succeeded".to_string(),
        ExecOutcome::Failed(reason) => format!("failed: {reason}"),
    };
    println!(
        "==> {} ({status}, {} ms)",
        result.pod_name,
        result.duration.as_millis()
    );
    if !result.stdout.is_empty() {
        print!("{}", result.stdout);
    }
    if !result.stderr.is_empty() {
        eprint!("{}", result.stderr);
    }
}
