use error_stack::{Context, Report, ResultExt};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::{Api, AttachParams, DeleteParams, ListParams, PostParams};
use kube::Client;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::domain::traits::{ClusterApi, RemoteExecutor};
use crate::domain::types::{ExecOutput, FleetError, Result, WorkerPod};

const HEALTH_PATH: &str = "/healthz";
const NO_EXIT_STATUS: &str = "exec stream closed without reporting an exit status";

/// Cluster access through a kube [`Client`]
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn transport(message: String) -> FleetError {
    FleetError::Transport { message }
}

/// Map an API error on a named pod, keeping 404 and 409 apart from other failures.
fn pod_error(error: kube::Error, namespace: &str, name: &str, action: &str) -> Report<FleetError> {
    let context = match &error {
        kube::Error::Api(response) if response.code == 404 => FleetError::NotFound {
            namespace: namespace.to_string(),
            pod_name: name.to_string(),
        },
        kube::Error::Api(response) if response.code == 409 => FleetError::AlreadyExists {
            namespace: namespace.to_string(),
            pod_name: name.to_string(),
        },
        _ => transport(format!("failed to {action} pod {namespace}/{name}")),
    };
    Report::new(error).change_context(context)
}

#[async_trait::async_trait]
impl ClusterApi for KubeCluster {
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod> {
        let name = pod.metadata.name.as_deref().unwrap_or_default();
        self.pods(namespace)
            .create(&PostParams::default(), pod)
            .await
            .map_err(|e| pod_error(e, namespace, name, "create"))
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod> {
        self.pods(namespace)
            .get(name)
            .await
            .map_err(|e| pod_error(e, namespace, name, "get"))
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        self.pods(namespace)
            .delete(name, &DeleteParams::background())
            .await
            .map_err(|e| pod_error(e, namespace, name, "delete"))?;
        Ok(())
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>> {
        let pods = self
            .pods(namespace)
            .list(&ListParams::default().labels(label_selector))
            .await
            .change_context_lazy(|| {
                transport(format!("failed to list pods {label_selector} in {namespace}"))
            })?;
        Ok(pods.items)
    }

    async fn health(&self) -> Result<String> {
        let request = http::Request::get(HEALTH_PATH)
            .body(Vec::new())
            .change_context_lazy(|| transport("failed to build health request".to_string()))?;

        self.client
            .request_text(request)
            .await
            .change_context_lazy(|| transport(format!("GET {HEALTH_PATH} failed")))
    }
}

#[async_trait::async_trait]
impl RemoteExecutor for KubeCluster {
    /// Run `command` through `/bin/sh -c` in the worker's container.
    async fn run(&self, pod: &WorkerPod, command: &str) -> Result<ExecOutput> {
        let exec_error = || FleetError::Exec {
            namespace: pod.namespace.clone(),
            pod_name: pod.name.clone(),
            command: command.to_string(),
        };

        let params = AttachParams::default()
            .container(pod.name.clone())
            .stdin(false)
            .stdout(true)
            .stderr(true);

        let mut attached = self
            .pods(&pod.namespace)
            .exec(&pod.name, ["/bin/sh", "-c", command], &params)
            .await
            .change_context_lazy(exec_error)?;

        let (stdout, stderr) = tokio::try_join!(
            read_stream(attached.stdout()),
            read_stream(attached.stderr())
        )
        .change_context_lazy(exec_error)
        .attach_printable("failed reading exec output")?;

        let status = match attached.take_status() {
            Some(status) => status.await,
            None => None,
        };
        let joined = attached.join().await;

        finish_exec(stdout, stderr, status, joined)
            .change_context_lazy(exec_error)
            .attach_printable("exec stream interrupted")
    }
}

/// Combine captured output with how the exec session ended.
///
/// A session whose stream task failed is an error even if some output arrived.
fn finish_exec<E: Context>(
    stdout: String,
    stderr: String,
    status: Option<Status>,
    joined: std::result::Result<(), E>,
) -> std::result::Result<ExecOutput, Report<E>> {
    joined.map_err(Report::new)?;
    Ok(ExecOutput {
        stdout,
        stderr,
        failure: exec_failure(status),
    })
}

async fn read_stream(stream: Option<impl AsyncRead + Unpin>) -> std::io::Result<String> {
    let mut buf = Vec::new();
    if let Some(mut stream) = stream {
        stream.read_to_end(&mut buf).await?;
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Failure message carried by the exec status channel, if the command failed.
///
/// A closed channel without any status counts as a failure.
fn exec_failure(status: Option<Status>) -> Option<String> {
    let Some(status) = status else {
        return Some(NO_EXIT_STATUS.to_string());
    };
    if status.status.as_deref() != Some("Failure") {
        return None;
    }
    Some(
        status
            .message
            .or(status.reason)
            .unwrap_or_else(|| "command failed".to_string()),
    )
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn success_status_is_not_a_failure() {
        let status = Status {
            status: Some("Success".to_string()),
            ..Default::default()
        };
        assert_eq!(exec_failure(Some(status)), None);
    }

    #[test]
    fn missing_status_is_a_failure() {
        let output = finish_exec::<std::io::Error>(
            "partial".to_string(),
            String::new(),
            None,
            Ok(()),
        )
        .unwrap();

        assert_eq!(output.stdout, "partial");
        assert_eq!(output.failure.as_deref(), Some(NO_EXIT_STATUS));
    }

    #[test]
    fn interrupted_stream_is_an_exec_error() {
        let dropped = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "connection reset");
        let err = finish_exec("partial".to_string(), String::new(), None, Err(dropped))
            .change_context(FleetError::Exec {
                namespace: "default".to_string(),
                pod_name: "w-0".to_string(),
                command: "sleep 60".to_string(),
            })
            .unwrap_err();

        assert!(matches!(
            err.current_context(),
            FleetError::Exec { pod_name, command, .. } if pod_name == "w-0" && command == "sleep 60"
        ));
        assert_eq!(
            err.downcast_ref::<std::io::Error>().map(|e| e.kind()),
            Some(std::io::ErrorKind::ConnectionReset)
        );
    }

    #[test]
    fn stream_error_wins_over_success_status() {
        let status = Status {
            status: Some("Success".to_string()),
            ..Default::default()
        };
        let dropped = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "websocket closed");

        assert!(finish_exec(String::new(), String::new(), Some(status), Err(dropped)).is_err());
    }

    #[test]
    fn non_zero_exit_carries_message() {
        let status = Status {
            status: Some("Failure".to_string()),
            message: Some("command terminated with non-zero exit code: 2".to_string()),
            reason: Some("NonZeroExitCode".to_string()),
            ..Default::default()
        };
        assert_eq!(
            exec_failure(Some(status)).as_deref(),
            Some("command terminated with non-zero exit code: 2")
        );
    }

    #[test]
    fn failure_without_message_falls_back_to_reason() {
        let status = Status {
            status: Some("Failure".to_string()),
            reason: Some("InternalError".to_string()),
            ..Default::default()
        };
        assert_eq!(exec_failure(Some(status)).as_deref(), Some("InternalError"));
    }
}
