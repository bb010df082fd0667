//! Cancellable command execution on top of a [`RemoteExecutor`]

use std::time::Duration;

use error_stack::Report;
use tokio::select;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use super::traits::RemoteExecutor;
use super::types::{
    CancelReason, ExecOutcome, ExecOutput, ExecutionResult, FleetError, Result, WorkerPod,
};

/// Run `command` on `pod`, giving up as soon as `cancel` fires.
///
/// Abandoning the exec stream does not stop a command that already started in
/// the pod.
pub async fn run_cancellable(
    executor: &dyn RemoteExecutor,
    pod: &WorkerPod,
    command: &str,
    cancel: &CancellationToken,
) -> Result<ExecOutput> {
    select! {
        biased;
        _ = cancel.cancelled() => Err(Report::new(FleetError::Cancelled {
            reason: CancelReason::Requested,
        })
        .attach_printable(format!("running {command:?} on {}/{}", pod.namespace, pod.name))),
        output = executor.run(pod, command) => output,
    }
}

/// Run a command and fold the outcome into an [`ExecutionResult`].
///
/// Never fails: stream errors and cancellation become a `Failed` outcome with
/// the error as the reason.
pub async fn execute(
    executor: &dyn RemoteExecutor,
    pod: &WorkerPod,
    command: &str,
    cancel: &CancellationToken,
) -> ExecutionResult {
    let started = Instant::now();
    let result = run_cancellable(executor, pod, command, cancel).await;
    to_execution_result(pod, command, result, started.elapsed())
}

pub(crate) fn to_execution_result(
    pod: &WorkerPod,
    command: &str,
    result: Result<ExecOutput>,
    duration: Duration,
) -> ExecutionResult {
    let (stdout, stderr, outcome) = match result {
        Ok(ExecOutput {
            stdout,
            stderr,
            failure: None,
        }) => {
            debug!(pod_name = %pod.name, ?duration, "Command succeeded");
            (stdout, stderr, ExecOutcome::Succeeded)
        }
        Ok(ExecOutput {
            stdout,
            stderr,
            failure: Some(reason),
        }) => {
            warn!(pod_name = %pod.name, %reason, "Command exited unsuccessfully");
            (stdout, stderr, ExecOutcome::Failed(reason))
        }
        Err(e) => {
            warn!(pod_name = %pod.name, "Command could not be run: {e:?}");
            (String::new(), String::new(), ExecOutcome::Failed(e.to_string()))
        }
    };

    ExecutionResult {
        pod_name: pod.name.clone(),
        command: command.to_string(),
        stdout,
        stderr,
        outcome,
        duration,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::domain::mock::{ExecBehaviour, MockCluster};
    use crate::domain::pod_spec::WorkerTemplate;
    use crate::domain::traits::ClusterApi;

    async fn running_pod(cluster: &MockCluster, name: &str) -> WorkerPod {
        let template = WorkerTemplate::default();
        cluster
            .create_pod("default", &template.build_pod("default", name, 60))
            .await
            .unwrap();
        template.describe("default", name, 60)
    }

    #[test(tokio::test)]
    async fn captures_stdout() {
        let cluster = MockCluster::new();
        let pod = running_pod(&cluster, "w-0").await;

        let result = execute(&cluster, &pod, "echo ok", &CancellationToken::new()).await;

        assert_eq!(result.stdout, "ok\n");
        assert_eq!(result.outcome, ExecOutcome::Succeeded);
        assert_eq!(result.command, "echo ok");
    }

    #[test(tokio::test)]
    async fn non_zero_exit_keeps_output() {
        let cluster = MockCluster::new();
        cluster.set_exec_behaviour("w-0", ExecBehaviour::ExitFailure);
        let pod = running_pod(&cluster, "w-0").await;

        let result = execute(&cluster, &pod, "false", &CancellationToken::new()).await;

        assert_eq!(result.stderr, "boom\n");
        assert!(matches!(result.outcome, ExecOutcome::Failed(ref r) if r.contains("exit code")));
    }

    #[test(tokio::test)]
    async fn stream_error_names_pod_and_command() {
        let cluster = MockCluster::new();
        cluster.set_exec_behaviour("w-0", ExecBehaviour::StreamError);
        let pod = running_pod(&cluster, "w-0").await;

        let err = run_cancellable(&cluster, &pod, "jmeter -n", &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(
            err.current_context().to_string(),
            "Failed executing command \"jmeter -n\" on default/w-0"
        );
        assert!(format!("{err:?}").contains("websocket closed unexpectedly"));
    }

    #[test(tokio::test)]
    async fn cancellation_interrupts_hanging_command() {
        let cluster = Arc::new(MockCluster::new());
        cluster.set_exec_behaviour("w-0", ExecBehaviour::Hang);
        let pod = running_pod(&cluster, "w-0").await;
        let cancel = CancellationToken::new();

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                cancel.cancel();
            })
        };

        let err = run_cancellable(&*cluster, &pod, "sleep 1000", &cancel)
            .await
            .unwrap_err();
        canceller.await.unwrap();

        assert_eq!(
            err.current_context(),
            &FleetError::Cancelled {
                reason: CancelReason::Requested
            }
        );
    }
}
