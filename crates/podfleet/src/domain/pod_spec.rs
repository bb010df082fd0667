//! Worker pod object submitted to the cluster and status extraction

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Container, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use super::types::{PodStatus, WorkerPod};

pub const APP_LABEL_KEY: &str = "app";
pub const DEFAULT_IMAGE: &str = "ubuntu:22.04";
pub const DEFAULT_APP_LABEL: &str = "jmeter_pod";

/// Image and labelling shared by every worker in a fleet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerTemplate {
    pub image: String,
    pub app_label: String,
}

impl Default for WorkerTemplate {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE.to_string(),
            app_label: DEFAULT_APP_LABEL.to_string(),
        }
    }
}

impl WorkerTemplate {
    /// Selector matching every pod created from this template
    pub fn label_selector(&self) -> String {
        format!("{APP_LABEL_KEY}={}", self.app_label)
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(APP_LABEL_KEY.to_string(), self.app_label.clone())])
    }

    /// Descriptor for a worker that has not been submitted yet.
    pub fn describe(&self, namespace: &str, name: &str, keep_alive_secs: u64) -> WorkerPod {
        WorkerPod {
            name: name.to_string(),
            namespace: namespace.to_string(),
            image: self.image.clone(),
            command: keep_alive_command(keep_alive_secs),
            keep_alive_secs,
            labels: self.labels(),
            status: PodStatus::Pending,
        }
    }

    /// Pod object for a worker.
    ///
    /// The single container is named after the pod and only sleeps, so it stays
    /// alive long enough to receive exec commands. Restarts are disabled because a
    /// restarted worker has lost whatever was prepared inside it.
    pub fn build_pod(&self, namespace: &str, name: &str, keep_alive_secs: u64) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                labels: Some(self.labels()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                restart_policy: Some("Never".to_string()),
                containers: vec![Container {
                    name: name.to_string(),
                    image: Some(self.image.clone()),
                    image_pull_policy: Some("IfNotPresent".to_string()),
                    command: Some(keep_alive_command(keep_alive_secs)),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            status: None,
        }
    }
}

fn keep_alive_command(keep_alive_secs: u64) -> Vec<String> {
    vec!["sleep".to_string(), keep_alive_secs.to_string()]
}

/// Map the cluster's view of a pod onto a worker status.
pub fn observed_status(pod: &Pod) -> PodStatus {
    if pod.metadata.deletion_timestamp.is_some() {
        return PodStatus::Deleted;
    }

    let Some(status) = pod.status.as_ref() else {
        return PodStatus::Pending;
    };

    match status.phase.as_deref() {
        Some("Running") => {
            let has_unready = status
                .container_statuses
                .as_ref()
                .is_some_and(|containers| containers.iter().any(|c| !c.ready));
            if has_unready {
                PodStatus::Running
            } else {
                PodStatus::Ready
            }
        }
        Some("Failed") | Some("Succeeded") => PodStatus::Failed,
        _ => PodStatus::Pending,
    }
}

/// Build a descriptor from a pod object read back from the cluster.
pub fn describe_pod(pod: &Pod) -> Option<WorkerPod> {
    let name = pod.metadata.name.clone()?;
    let namespace = pod
        .metadata
        .namespace
        .clone()
        .unwrap_or_else(|| "default".to_string());
    let container = pod.spec.as_ref().and_then(|spec| spec.containers.first());
    let command = container
        .and_then(|c| c.command.clone())
        .unwrap_or_default();
    let keep_alive_secs = command
        .get(1)
        .and_then(|secs| secs.parse().ok())
        .unwrap_or_default();

    Some(WorkerPod {
        name,
        namespace,
        image: container.and_then(|c| c.image.clone()).unwrap_or_default(),
        command,
        keep_alive_secs,
        labels: pod.metadata.labels.clone().unwrap_or_default(),
        status: observed_status(pod),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use k8s_openapi::api::core::v1::{ContainerStatus, PodStatus as K8sPodStatus};
    use similar_asserts::assert_eq;

    use super::*;

    /// Attach a phase and per-container readiness to a pod object.
    pub(crate) fn with_phase(mut pod: Pod, phase: &str, ready: &[bool]) -> Pod {
        let container_statuses = ready
            .iter()
            .enumerate()
            .map(|(i, ready)| ContainerStatus {
                name: format!("c-{i}"),
                ready: *ready,
                ..Default::default()
            })
            .collect();
        pod.status = Some(K8sPodStatus {
            phase: Some(phase.to_string()),
            container_statuses: Some(container_statuses),
            ..Default::default()
        });
        pod
    }

    #[test]
    fn worker_pod_object_matches_contract() {
        let pod = WorkerTemplate::default().build_pod("load", "jmeter-worker-0", 60);

        assert_eq!(pod.metadata.name.as_deref(), Some("jmeter-worker-0"));
        assert_eq!(pod.metadata.namespace.as_deref(), Some("load"));
        assert_eq!(
            pod.metadata.labels.unwrap().get("app").map(String::as_str),
            Some("jmeter_pod")
        );

        let spec = pod.spec.unwrap();
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        assert_eq!(spec.containers.len(), 1);
        let container = &spec.containers[0];
        assert_eq!(container.name, "jmeter-worker-0");
        assert_eq!(container.image.as_deref(), Some("ubuntu:22.04"));
        assert_eq!(container.image_pull_policy.as_deref(), Some("IfNotPresent"));
        assert_eq!(
            container.command,
            Some(vec!["sleep".to_string(), "60".to_string()])
        );
    }

    #[test]
    fn status_requires_running_phase_and_ready_containers() {
        let pod = WorkerTemplate::default().build_pod("default", "w-0", 60);

        assert_eq!(observed_status(&pod), PodStatus::Pending);
        assert_eq!(
            observed_status(&with_phase(pod.clone(), "Pending", &[false])),
            PodStatus::Pending
        );
        assert_eq!(
            observed_status(&with_phase(pod.clone(), "Running", &[true, false])),
            PodStatus::Running
        );
        assert_eq!(
            observed_status(&with_phase(pod.clone(), "Running", &[true, true])),
            PodStatus::Ready
        );
        assert_eq!(
            observed_status(&with_phase(pod, "Failed", &[false])),
            PodStatus::Failed
        );
    }

    #[test]
    fn describe_reads_keep_alive_back() {
        let template = WorkerTemplate::default();
        let pod = with_phase(template.build_pod("default", "w-1", 90), "Running", &[true]);

        let described = describe_pod(&pod).unwrap();
        assert_eq!(
            described,
            template
                .describe("default", "w-1", 90)
                .with_status(PodStatus::Ready)
        );
    }
}
