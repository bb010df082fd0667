//! Explicit wiring of the fleet components

use std::sync::Arc;

use super::lifecycle::PodLifecycleManager;
use super::orchestrator::FleetOrchestrator;
use super::pod_cache::PodCache;
use super::pod_spec::WorkerTemplate;
use super::readiness::ReadinessPolicy;
use super::traits::{CleanupObserver, Clock, ClusterApi, RemoteExecutor, TokioClock, TracingCleanupObserver};

/// Everything the fleet components share, passed around instead of globals
#[derive(Clone)]
pub struct FleetContext {
    pub api: Arc<dyn ClusterApi>,
    pub executor: Arc<dyn RemoteExecutor>,
    pub cache: Arc<PodCache>,
    pub clock: Arc<dyn Clock>,
    pub observer: Arc<dyn CleanupObserver>,
}

impl FleetContext {
    /// Context with a fresh cache, the tokio clock and tracing-backed cleanup reporting.
    pub fn new(api: Arc<dyn ClusterApi>, executor: Arc<dyn RemoteExecutor>) -> Self {
        Self {
            api,
            executor,
            cache: Arc::new(PodCache::new()),
            clock: Arc::new(TokioClock::new()),
            observer: Arc::new(TracingCleanupObserver),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn CleanupObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn lifecycle(&self, template: WorkerTemplate, readiness: ReadinessPolicy) -> PodLifecycleManager {
        PodLifecycleManager::new(
            self.api.clone(),
            self.cache.clone(),
            self.clock.clone(),
            template,
            readiness,
        )
    }

    pub fn orchestrator(&self, template: WorkerTemplate, readiness: ReadinessPolicy) -> FleetOrchestrator {
        FleetOrchestrator::new(
            Arc::new(self.lifecycle(template, readiness)),
            self.executor.clone(),
            self.observer.clone(),
        )
    }
}
