//! Creation, readiness tracking and deletion of individual worker pods
//!
//! The lifecycle manager is the only component that writes worker status into
//! the [`PodCache`]. Cache updates happen after each cluster round trip; no
//! cache entry is held while waiting on the API server.

use std::sync::Arc;
use std::time::Duration;

use error_stack::{Report, ResultExt};
use k8s_openapi::api::core::v1::Pod;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::pod_cache::PodCache;
use super::pod_spec::{describe_pod, observed_status, WorkerTemplate};
use super::readiness::{poll_until_ready, ReadinessPolicy};
use super::traits::{ClusterApi, Clock};
use super::types::{CancelReason, FleetError, PodStatus, Result, WorkerPod};

pub struct PodLifecycleManager {
    api: Arc<dyn ClusterApi>,
    cache: Arc<PodCache>,
    clock: Arc<dyn Clock>,
    template: WorkerTemplate,
    readiness: ReadinessPolicy,
}

impl PodLifecycleManager {
    pub fn new(
        api: Arc<dyn ClusterApi>,
        cache: Arc<PodCache>,
        clock: Arc<dyn Clock>,
        template: WorkerTemplate,
        readiness: ReadinessPolicy,
    ) -> Self {
        Self {
            api,
            cache,
            clock,
            template,
            readiness,
        }
    }

    pub fn cache(&self) -> &Arc<PodCache> {
        &self.cache
    }

    pub fn template(&self) -> &WorkerTemplate {
        &self.template
    }

    pub fn readiness(&self) -> &ReadinessPolicy {
        &self.readiness
    }

    /// Submit a worker pod that sleeps for `keep_alive_secs`.
    ///
    /// Returns once the API server accepted the object; the pod is usually not
    /// scheduled yet. The descriptor is cached while the create call is in
    /// flight and dropped again if the call fails.
    ///
    /// A live pod already carrying the name is adopted. One that is still
    /// terminating is waited out and then created afresh.
    #[tracing::instrument(skip(self, cancel), fields(pod_name = %name))]
    pub async fn create_worker(
        &self,
        namespace: &str,
        name: &str,
        keep_alive_secs: u64,
        cancel: &CancellationToken,
    ) -> Result<WorkerPod> {
        let pending = self.template.describe(namespace, name, keep_alive_secs);
        self.cache.put(name, pending.clone());

        let object = self.template.build_pod(namespace, name, keep_alive_secs);
        let created = match self.api.create_pod(namespace, &object).await {
            Ok(created) => Ok(created),
            Err(e) if e.current_context().is_already_exists() => {
                self.replace_existing(namespace, name, &object, cancel).await
            }
            Err(e) => Err(e),
        };
        let created = match created {
            Ok(created) => created,
            Err(e) => {
                self.cache.remove(name);
                return Err(e.attach_printable(format!("creating worker pod {namespace}/{name}")));
            }
        };

        let worker = pending.with_status(observed_status(&created));
        self.cache.put(name, worker.clone());
        info!(namespace = %namespace, "Worker pod created");
        Ok(worker)
    }

    async fn replace_existing(
        &self,
        namespace: &str,
        name: &str,
        object: &Pod,
        cancel: &CancellationToken,
    ) -> Result<Pod> {
        match self.api.get_pod(namespace, name).await {
            Ok(existing) if existing.metadata.deletion_timestamp.is_none() => {
                info!(namespace = %namespace, pod_name = %name, "Adopting existing worker pod");
                return Ok(existing);
            }
            Ok(_) => self.wait_until_gone(namespace, name, cancel).await?,
            Err(e) if e.current_context().is_not_found() => {}
            Err(e) => return Err(e),
        }
        self.api.create_pod(namespace, object).await
    }

    /// Poll a terminating pod until the API server no longer knows it.
    ///
    /// Bounded by the readiness timeout.
    async fn wait_until_gone(
        &self,
        namespace: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        info!(namespace = %namespace, pod_name = %name, "Waiting for terminating worker pod to go away");
        let started = self.clock.elapsed();
        loop {
            match self.api.get_pod(namespace, name).await {
                Err(e) if e.current_context().is_not_found() => return Ok(()),
                Err(e) => debug!(pod_name = %name, "Terminating pod status unavailable: {e:?}"),
                Ok(_) => {}
            }

            if self.clock.elapsed().saturating_sub(started) >= self.readiness.timeout {
                return Err(Report::new(FleetError::Cancelled {
                    reason: CancelReason::Timeout(self.readiness.timeout),
                })
                .attach_printable(format!("pod {namespace}/{name} is still terminating")));
            }
            select! {
                _ = cancel.cancelled() => {
                    return Err(Report::new(FleetError::Cancelled {
                        reason: CancelReason::Requested,
                    }));
                }
                _ = self.clock.sleep(self.readiness.interval) => {}
            }
        }
    }

    /// Poll the pod until it is running with every container ready.
    ///
    /// `timeout` overrides the manager's default readiness timeout.
    #[tracing::instrument(skip(self, cancel), fields(pod_name = %name))]
    pub async fn await_ready(
        &self,
        namespace: &str,
        name: &str,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<WorkerPod> {
        let policy = match timeout {
            Some(timeout) => self.readiness.with_timeout(timeout),
            None => self.readiness,
        };

        let api = &*self.api;
        let cache = &*self.cache;
        let fetch = move || async move {
            let pod = api.get_pod(namespace, name).await?;
            cache.update_status(name, observed_status(&pod));
            Ok(pod)
        };

        let ready = poll_until_ready(fetch, &*self.clock, &policy, cancel)
            .await
            .attach_printable_lazy(|| format!("waiting for worker pod {namespace}/{name}"))?;

        let worker = match describe_pod(&ready) {
            Some(described) => described,
            None => self
                .cache
                .get(name)
                .unwrap_or_else(|| self.template.describe(namespace, name, 0))
                .with_status(PodStatus::Ready),
        };
        self.cache.put(name, worker.clone());
        info!(namespace = %namespace, "Worker pod ready");
        Ok(worker)
    }

    /// Request deletion of a worker without waiting for it to disappear.
    ///
    /// The descriptor leaves the cache once the API server accepted the request
    /// or reported the pod as already gone.
    #[tracing::instrument(skip(self), fields(pod_name = %name))]
    pub async fn delete_worker(&self, namespace: &str, name: &str) -> Result<()> {
        match self.api.delete_pod(namespace, name).await {
            Ok(()) => {}
            Err(e) if e.current_context().is_not_found() => {
                info!(namespace = %namespace, "Worker pod already gone");
            }
            Err(e) => {
                return Err(e.attach_printable(format!("deleting worker pod {namespace}/{name}")));
            }
        }

        self.cache.update_status(name, PodStatus::Deleted);
        self.cache.remove(name);
        info!(namespace = %namespace, "Worker pod deletion requested");
        Ok(())
    }

    /// Re-read one worker from the cluster.
    ///
    /// A pod the API server reports as missing is dropped from the cache. Any
    /// other failure leaves the cached descriptor untouched.
    pub async fn refresh(&self, namespace: &str, name: &str) -> Result<WorkerPod> {
        match self.api.get_pod(namespace, name).await {
            Ok(pod) => {
                let worker = describe_pod(&pod).ok_or_else(|| {
                    Report::new(FleetError::Transport {
                        message: format!("pod {namespace}/{name} has no name"),
                    })
                })?;
                self.cache.put(name, worker.clone());
                Ok(worker)
            }
            Err(e) if e.current_context().is_not_found() => {
                warn!(pod_name = %name, "Dropping worker that no longer exists");
                self.cache.remove(name);
                Err(e)
            }
            Err(e) => {
                warn!(pod_name = %name, "Could not refresh worker, keeping it cached");
                Err(e)
            }
        }
    }

    /// Load every pod carrying this fleet's label into the cache.
    pub async fn discover(&self, namespace: &str) -> Result<Vec<WorkerPod>> {
        let selector = self.template.label_selector();
        let pods = self
            .api
            .list_pods(namespace, &selector)
            .await
            .change_context(FleetError::Transport {
                message: format!("listing pods with selector {selector}"),
            })?;

        let workers: Vec<WorkerPod> = pods
            .iter()
            .filter(|pod| pod.metadata.deletion_timestamp.is_none())
            .filter_map(describe_pod)
            .collect();
        for worker in &workers {
            self.cache.put(&worker.name, worker.clone());
        }
        info!(namespace = %namespace, count = workers.len(), "Discovered worker pods");
        Ok(workers)
    }
}
