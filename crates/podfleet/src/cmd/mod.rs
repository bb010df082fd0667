//! Command layer - Entry points for the podfleet subcommands

pub mod check;
pub mod exec;
pub mod run;
pub mod teardown;

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use error_stack::Report;

use crate::config::ClusterArgs;
use crate::infrastructure::k8s::KubeCluster;
use crate::infrastructure::kube_client::{self, ClusterHandle};

pub use check::run_check;
pub use exec::run_exec;
pub use run::run_load_test;
pub use teardown::run_teardown;

/// Carry an error-stack report, with its whole chain, across the anyhow boundary.
pub(crate) fn report<C>(e: Report<C>) -> anyhow::Error
where
    C: fmt::Debug + fmt::Display + Send + Sync + 'static,
{
    anyhow::anyhow!("{e:?}")
}

pub(crate) async fn connect(cluster: &ClusterArgs) -> Result<(ClusterHandle, Arc<KubeCluster>)> {
    let handle = kube_client::init_kube_client(cluster.kubeconfig.clone(), cluster.context.clone())
        .await
        .map_err(report)?;
    let kube = Arc::new(KubeCluster::new(handle.client.clone()));
    Ok((handle, kube))
}
