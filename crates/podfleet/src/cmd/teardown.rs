use anyhow::Result;

use crate::cmd::{connect, report};
use crate::config::{ClusterArgs, TeardownArgs};
use crate::domain::FleetContext;

/// Delete every pod carrying the fleet label, whether or not this process created it.
pub async fn run_teardown(cluster: &ClusterArgs, args: &TeardownArgs) -> Result<()> {
    let (handle, kube) = connect(cluster).await?;
    let fleet = args.fleet.resolve(&handle.default_namespace)?;

    let orchestrator = FleetContext::new(kube.clone(), kube).orchestrator(fleet.template, fleet.readiness);
    let found = orchestrator
        .lifecycle()
        .discover(&fleet.spec.namespace)
        .await
        .map_err(report)?;

    orchestrator.teardown_fleet().await;

    let remaining = orchestrator.cache().len();
    println!(
        "Requested deletion of {} of {} worker pods in {}",
        found.len().saturating_sub(remaining),
        found.len(),
        fleet.spec.namespace
    );
    if remaining > 0 {
        anyhow::bail!("{remaining} worker pods could not be deleted");
    }
    Ok(())
}
