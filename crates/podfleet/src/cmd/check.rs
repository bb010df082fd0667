use anyhow::Result;

use crate::cmd::{connect, report};
use crate::config::ClusterArgs;
use crate::domain::health::check_connection;

pub async fn run_check(cluster: &ClusterArgs) -> Result<()> {
    let (handle, kube) = connect(cluster).await?;
    check_connection(&*kube).await.map_err(report)?;

    println!(
        "Cluster is healthy, default namespace {}",
        handle.default_namespace
    );
    Ok(())
}
