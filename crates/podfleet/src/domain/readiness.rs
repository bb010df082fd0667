//! Bounded readiness polling
//!
//! [`poll_until_ready`] only depends on a status fetch and a [`Clock`], so it can
//! be driven by fakes in tests.

use std::future::Future;
use std::time::Duration;

use error_stack::Report;
use k8s_openapi::api::core::v1::Pod;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use super::pod_spec::observed_status;
use super::traits::Clock;
use super::types::{CancelReason, FleetError, PodStatus, Result};

pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// How long and how often to poll a pod for readiness
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_READY_TIMEOUT,
        }
    }
}

impl ReadinessPolicy {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

fn cancelled(reason: CancelReason) -> Report<FleetError> {
    Report::new(FleetError::Cancelled { reason })
}

/// Poll `fetch` until the returned pod is ready.
///
/// Fetch errors are logged and count as "not ready yet". Gives up with
/// [`CancelReason::Timeout`] once `policy.timeout` has elapsed, and with
/// [`CancelReason::Requested`] as soon as `cancel` fires.
pub async fn poll_until_ready<F, Fut>(
    mut fetch: F,
    clock: &dyn Clock,
    policy: &ReadinessPolicy,
    cancel: &CancellationToken,
) -> Result<Pod>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<Pod>> + Send,
{
    let started = clock.elapsed();
    let remaining = |clock: &dyn Clock| {
        policy
            .timeout
            .saturating_sub(clock.elapsed().saturating_sub(started))
    };

    let mut attempt = 0u32;
    loop {
        attempt += 1;
        if cancel.is_cancelled() {
            return Err(cancelled(CancelReason::Requested));
        }
        let left = remaining(clock);
        if left.is_zero() {
            return Err(cancelled(CancelReason::Timeout(policy.timeout)));
        }

        let fetched = select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled(CancelReason::Requested)),
            fetched = fetch() => fetched,
            _ = clock.sleep(left) => return Err(cancelled(CancelReason::Timeout(policy.timeout))),
        };

        match fetched {
            Ok(pod) => match observed_status(&pod) {
                PodStatus::Ready => return Ok(pod),
                status => debug!(attempt, ?status, "Pod not ready yet"),
            },
            Err(e) => warn!(attempt, "Failed to fetch pod status, will retry: {e:?}"),
        }

        let nap = policy.interval.min(remaining(clock));
        select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled(CancelReason::Requested)),
            _ = clock.sleep(nap) => {}
        }
    }
}
