//! One-shot cluster health probe

use error_stack::Report;
use error_stack::ResultExt;
use tracing::info;

use super::traits::ClusterApi;
use super::types::{FleetError, Result};

/// Body returned by a healthy API server on `/healthz`.
pub const HEALTHY_PAYLOAD: &str = "ok";

/// Ask the API server whether it is healthy.
///
/// Succeeds only when the health endpoint answers with exactly `ok`. There is
/// no retry here; callers decide whether to try again.
pub async fn check_connection(api: &dyn ClusterApi) -> Result<bool> {
    let payload = api
        .health()
        .await
        .change_context(FleetError::Transport {
            message: "failed to connect to cluster".to_string(),
        })?;

    if payload != HEALTHY_PAYLOAD {
        return Err(Report::new(FleetError::Unhealthy { payload }));
    }

    info!("Cluster health check passed");
    Ok(true)
}
