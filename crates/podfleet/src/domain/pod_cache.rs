//! In-memory cache of worker pod descriptors
//!
//! Every higher component reads worker state from here. Entries are updated
//! atomically and cloned out on read, so readers never see a partially written
//! descriptor. No method performs I/O.

use dashmap::DashMap;
use tracing::debug;

use super::types::{PodStatus, WorkerPod};

#[derive(Debug, Default)]
pub struct PodCache {
    pods: DashMap<String, WorkerPod>,
}

impl PodCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the descriptor stored under `name`.
    pub fn put(&self, name: &str, pod: WorkerPod) {
        debug!(pod_name = %name, status = ?pod.status, "Caching worker pod");
        self.pods.insert(name.to_string(), pod);
    }

    pub fn get(&self, name: &str) -> Option<WorkerPod> {
        self.pods.get(name).map(|entry| entry.clone())
    }

    pub fn remove(&self, name: &str) -> Option<WorkerPod> {
        self.pods.remove(name).map(|(_, pod)| pod)
    }

    /// Snapshot of all descriptors ordered by pod name.
    pub fn list(&self) -> Vec<WorkerPod> {
        let mut pods: Vec<WorkerPod> = self.pods.iter().map(|entry| entry.clone()).collect();
        pods.sort_by(|a, b| a.name.cmp(&b.name));
        pods
    }

    /// Pods whose last observed status is `Ready`.
    pub fn ready_pods(&self) -> Vec<WorkerPod> {
        self.list().into_iter().filter(WorkerPod::is_ready).collect()
    }

    /// Update the status of a cached pod in place.
    ///
    /// Returns false when the pod is not cached.
    pub fn update_status(&self, name: &str, status: PodStatus) -> bool {
        match self.pods.get_mut(name) {
            Some(mut entry) => {
                entry.status = status;
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.pods.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.pods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pods.is_empty()
    }
}
