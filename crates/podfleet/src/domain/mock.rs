//! Test adapters implementing the cluster, executor, clock and observer traits

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use error_stack::Report;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

use super::pod_spec::tests::with_phase;
use super::traits::{CleanupObserver, Clock, ClusterApi, RemoteExecutor};
use super::types::{ExecOutput, FleetError, Result, WorkerPod};

/// Scripted readiness and API behaviour for one pod name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodBehaviour {
    /// The first `n` status reads report `Pending`, later ones report ready
    ReadyAfter(usize),
    /// Running, but its container never becomes ready
    NeverReady,
    /// The first `n` status reads fail, later ones report ready
    FailGet(usize),
    /// Every status read fails as if the API server were overloaded
    Unavailable,
    RejectCreate,
}

/// Scripted exec behaviour for one pod name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecBehaviour {
    /// `echo <text>` prints `<text>\n`, anything else prints nothing
    Echo,
    /// The command runs but exits non-zero
    ExitFailure,
    /// The exec stream cannot be established
    StreamError,
    /// The command never finishes
    Hang,
}

struct StoredPod {
    pod: Pod,
    reads: usize,
    /// Reads left before a deleted pod is gone
    terminating: Option<usize>,
}

/// In-memory stand-in for the API server and the exec endpoint
pub struct MockCluster {
    pods: Mutex<HashMap<String, StoredPod>>,
    behaviours: Mutex<HashMap<String, PodBehaviour>>,
    lingering: Mutex<HashMap<String, usize>>,
    undeletable: Mutex<HashSet<String>>,
    exec_behaviours: Mutex<HashMap<String, ExecBehaviour>>,
    health: Mutex<std::result::Result<String, String>>,
    created: Mutex<Vec<String>>,
    deleted: Mutex<Vec<String>>,
    executed: Mutex<Vec<(String, String)>>,
}

impl MockCluster {
    pub fn new() -> Self {
        Self {
            pods: Mutex::new(HashMap::new()),
            behaviours: Mutex::new(HashMap::new()),
            lingering: Mutex::new(HashMap::new()),
            undeletable: Mutex::new(HashSet::new()),
            exec_behaviours: Mutex::new(HashMap::new()),
            health: Mutex::new(Ok("ok".to_string())),
            created: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
            executed: Mutex::new(Vec::new()),
        }
    }

    pub fn set_behaviour(&self, pod_name: &str, behaviour: PodBehaviour) {
        self.behaviours
            .lock()
            .unwrap()
            .insert(pod_name.to_string(), behaviour);
    }

    /// Refuse every delete request for this pod.
    pub fn reject_deletes(&self, pod_name: &str) {
        self.undeletable
            .lock()
            .unwrap()
            .insert(pod_name.to_string());
    }

    /// Keep a deleted pod around, terminating, for `reads` further status reads.
    pub fn set_terminating_reads(&self, pod_name: &str, reads: usize) {
        self.lingering
            .lock()
            .unwrap()
            .insert(pod_name.to_string(), reads);
    }

    pub fn set_exec_behaviour(&self, pod_name: &str, behaviour: ExecBehaviour) {
        self.exec_behaviours
            .lock()
            .unwrap()
            .insert(pod_name.to_string(), behaviour);
    }

    pub fn set_health(&self, health: std::result::Result<String, String>) {
        *self.health.lock().unwrap() = health;
    }

    pub fn created(&self) -> Vec<String> {
        self.created.lock().unwrap().clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        let mut deleted = self.deleted.lock().unwrap().clone();
        deleted.sort();
        deleted
    }

    /// Commands run so far, as `(pod_name, command)` in execution order
    pub fn executed(&self) -> Vec<(String, String)> {
        self.executed.lock().unwrap().clone()
    }

    pub fn exists(&self, pod_name: &str) -> bool {
        self.pods.lock().unwrap().contains_key(pod_name)
    }

    fn behaviour(&self, pod_name: &str) -> PodBehaviour {
        self.behaviours
            .lock()
            .unwrap()
            .get(pod_name)
            .copied()
            .unwrap_or(PodBehaviour::ReadyAfter(1))
    }

    fn render(pod: &Pod, behaviour: PodBehaviour, reads: usize) -> Option<Pod> {
        let pod = pod.clone();
        match behaviour {
            PodBehaviour::Unavailable => None,
            PodBehaviour::ReadyAfter(n) if reads < n => Some(with_phase(pod, "Pending", &[false])),
            PodBehaviour::FailGet(n) if reads < n => None,
            PodBehaviour::NeverReady => Some(with_phase(pod, "Running", &[false])),
            _ => Some(with_phase(pod, "Running", &[true])),
        }
    }
}

fn transport(message: impl Into<String>) -> Report<FleetError> {
    Report::new(FleetError::Transport {
        message: message.into(),
    })
}

#[async_trait::async_trait]
impl ClusterApi for MockCluster {
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod> {
        let name = pod.metadata.name.clone().unwrap_or_default();
        if self.behaviour(&name) == PodBehaviour::RejectCreate {
            return Err(transport(format!(
                "admission webhook denied pod {name}"
            )));
        }

        let mut pods = self.pods.lock().unwrap();
        if pods.contains_key(&name) {
            return Err(Report::new(FleetError::AlreadyExists {
                namespace: namespace.to_string(),
                pod_name: name,
            }));
        }
        pods.insert(
            name.clone(),
            StoredPod {
                pod: pod.clone(),
                reads: 0,
                terminating: None,
            },
        );
        drop(pods);
        self.created.lock().unwrap().push(name);
        Ok(with_phase(pod.clone(), "Pending", &[]))
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod> {
        let not_found = || {
            Report::new(FleetError::NotFound {
                namespace: namespace.to_string(),
                pod_name: name.to_string(),
            })
        };
        let behaviour = self.behaviour(name);
        let mut pods = self.pods.lock().unwrap();
        let stored = pods.get_mut(name).ok_or_else(not_found)?;

        let terminating = stored.terminating;
        match terminating {
            Some(0) => {
                pods.remove(name);
                return Err(not_found());
            }
            Some(left) => {
                stored.terminating = Some(left - 1);
                return Ok(stored.pod.clone());
            }
            None => {}
        }

        let reads = stored.reads;
        stored.reads += 1;
        Self::render(&stored.pod, behaviour, reads)
            .ok_or_else(|| transport("the server is currently unable to handle the request"))
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        if self.undeletable.lock().unwrap().contains(name) {
            return Err(transport(format!(
                "pods \"{name}\" is forbidden: cannot delete"
            )));
        }

        let linger = self.lingering.lock().unwrap().get(name).copied();
        let mut pods = self.pods.lock().unwrap();
        let Some(stored) = pods.get_mut(name) else {
            return Err(Report::new(FleetError::NotFound {
                namespace: namespace.to_string(),
                pod_name: name.to_string(),
            }));
        };
        match (stored.terminating, linger) {
            (Some(_), _) => {}
            (None, Some(reads)) => {
                stored.pod.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
                stored.terminating = Some(reads);
            }
            (None, None) => {
                pods.remove(name);
            }
        }
        drop(pods);
        self.deleted.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn list_pods(&self, _namespace: &str, label_selector: &str) -> Result<Vec<Pod>> {
        let (key, value) = label_selector
            .split_once('=')
            .ok_or_else(|| transport(format!("bad selector {label_selector}")))?;

        let pods = self.pods.lock().unwrap();
        let mut listed: Vec<Pod> = pods
            .iter()
            .filter(|(_, stored)| {
                stored
                    .pod
                    .metadata
                    .labels
                    .as_ref()
                    .and_then(|labels: &BTreeMap<String, String>| labels.get(key))
                    .is_some_and(|v| v == value)
            })
            .filter_map(|(name, stored)| {
                Self::render(&stored.pod, self.behaviour(name), stored.reads)
            })
            .collect();
        listed.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        Ok(listed)
    }

    async fn health(&self) -> Result<String> {
        self.health.lock().unwrap().clone().map_err(transport)
    }
}

#[async_trait::async_trait]
impl RemoteExecutor for MockCluster {
    async fn run(&self, pod: &WorkerPod, command: &str) -> Result<ExecOutput> {
        let behaviour = self
            .exec_behaviours
            .lock()
            .unwrap()
            .get(&pod.name)
            .copied()
            .unwrap_or(ExecBehaviour::Echo);

        if !self.exists(&pod.name) {
            return Err(transport(format!("pods \"{}\" not found", pod.name)));
        }
        self.executed
            .lock()
            .unwrap()
            .push((pod.name.clone(), command.to_string()));

        match behaviour {
            ExecBehaviour::Echo => Ok(ExecOutput {
                stdout: command
                    .strip_prefix("echo ")
                    .map(|text| format!("{text}\n"))
                    .unwrap_or_default(),
                ..Default::default()
            }),
            ExecBehaviour::ExitFailure => Ok(ExecOutput {
                stdout: String::new(),
                stderr: "boom\n".to_string(),
                failure: Some("command terminated with non-zero exit code: 1".to_string()),
            }),
            ExecBehaviour::StreamError => Err(Report::new(FleetError::Exec {
                namespace: pod.namespace.clone(),
                pod_name: pod.name.clone(),
                command: command.to_string(),
            })
            .attach_printable("websocket closed unexpectedly")),
            ExecBehaviour::Hang => futures::future::pending().await,
        }
    }
}

/// Clock whose `sleep` advances time instantly.
#[derive(Debug, Default)]
pub struct FakeClock {
    now_ms: AtomicU64,
}

impl FakeClock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl Clock for FakeClock {
    fn elapsed(&self) -> Duration {
        Duration::from_millis(self.now_ms.load(Ordering::SeqCst))
    }

    async fn sleep(&self, duration: Duration) {
        self.now_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
        tokio::task::yield_now().await;
    }
}

/// Cleanup observer that remembers every call.
#[derive(Debug, Default)]
pub struct RecordingCleanupObserver {
    attempts: Mutex<Vec<String>>,
    failures: Mutex<Vec<String>>,
}

impl RecordingCleanupObserver {
    pub fn attempts(&self) -> Vec<String> {
        let mut attempts = self.attempts.lock().unwrap().clone();
        attempts.sort();
        attempts
    }

    pub fn failures(&self) -> Vec<String> {
        self.failures.lock().unwrap().clone()
    }
}

impl CleanupObserver for RecordingCleanupObserver {
    fn on_attempt(&self, _namespace: &str, pod_name: &str) {
        self.attempts.lock().unwrap().push(pod_name.to_string());
    }

    fn on_failure(&self, _namespace: &str, pod_name: &str, _error: &Report<FleetError>) {
        self.failures.lock().unwrap().push(pod_name.to_string());
    }
}
