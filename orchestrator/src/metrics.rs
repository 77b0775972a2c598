use prometheus::{IntCounter, IntGauge, Registry};

/// Prometheus metrics for one orchestrator instance, on an owned registry so
/// embedding services can expose it however they like.
pub struct Metrics {
    registry: Registry,

    pub jobs_dispatched: IntCounter,
    pub jobs_retried: IntCounter,
    pub jobs_failed: IntCounter,
    pub snapshots_persisted: IntCounter,
    pub active_workers: IntGauge,
}

impl Metrics {
    pub fn new() -> Metrics {
        let registry = Registry::new();

        let jobs_dispatched = IntCounter::new(
            "backfill_jobs_dispatched_total",
            "Jobs handed to a worker, including retried dispatches",
        )
        .unwrap();
        let jobs_retried = IntCounter::new(
            "backfill_jobs_retried_total",
            "Transient job failures that were retried",
        )
        .unwrap();
        let jobs_failed = IntCounter::new(
            "backfill_jobs_failed_total",
            "Jobs that failed terminally and ended the request",
        )
        .unwrap();
        let snapshots_persisted = IntCounter::new(
            "backfill_snapshots_persisted_total",
            "Complete store snapshots written to durable storage",
        )
        .unwrap();
        let active_workers = IntGauge::new(
            "backfill_active_workers",
            "Workers currently executing a job",
        )
        .unwrap();

        registry.register(Box::new(jobs_dispatched.clone())).unwrap();
        registry.register(Box::new(jobs_retried.clone())).unwrap();
        registry.register(Box::new(jobs_failed.clone())).unwrap();
        registry
            .register(Box::new(snapshots_persisted.clone()))
            .unwrap();
        registry.register(Box::new(active_workers.clone())).unwrap();

        Metrics {
            registry,
            jobs_dispatched,
            jobs_retried,
            jobs_failed,
            snapshots_persisted,
            active_workers,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
