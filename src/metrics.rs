use crate::{Error, OperatorConfig};
use prometheus::{histogram_opts, opts, HistogramVec, IntCounterVec, IntGaugeVec, Registry};
use tokio::time::Instant;

#[derive(Clone)]
pub struct Metrics {
    pub full_reconciliations: IntCounterVec,
    pub events: IntCounterVec,
    pub failures: IntCounterVec,
    pub running: IntGaugeVec,
    pub watch_restarts: IntCounterVec,
    pub reconcile_duration: HistogramVec,
    pub info: IntGaugeVec,
    /// Per Spark cluster
    pub running_workers: IntGaugeVec,
    pub started_clusters: IntCounterVec,
}

impl Default for Metrics {
    fn default() -> Self {
        let reconcile_duration = HistogramVec::new(
            histogram_opts!(
                "operator_full_reconciliation_duration_seconds",
                "The duration of a full reconciliation to complete in seconds"
            )
            .buckets(vec![0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60.]),
            &["kind"],
        )
        .unwrap();
        let full_reconciliations = IntCounterVec::new(
            opts!(
                "operator_full_reconciliations_total",
                "Number of full reconciliations",
            ),
            &["kind", "namespace"],
        )
        .unwrap();
        let events = IntCounterVec::new(
            opts!("operator_events_total", "Handled watch events"),
            &["kind", "namespace", "action"],
        )
        .unwrap();
        let failures = IntCounterVec::new(
            opts!(
                "operator_handler_errors_total",
                "Failed add, delete or modify operations",
            ),
            &["kind", "namespace", "error"],
        )
        .unwrap();
        let running = IntGaugeVec::new(
            opts!("operator_running_entities", "Entities the operator currently manages"),
            &["kind", "namespace"],
        )
        .unwrap();
        let watch_restarts = IntCounterVec::new(
            opts!("operator_watch_restarts_total", "Watches that had to be re-opened"),
            &["kind", "namespace"],
        )
        .unwrap();
        let info = IntGaugeVec::new(
            opts!("operator_info", "Operator configuration"),
            &["version", "watch_namespace", "crd", "full_reconciliation_interval_s"],
        )
        .unwrap();
        let running_workers = IntGaugeVec::new(
            opts!("operator_running_workers", "Number of workers per Spark cluster"),
            &["cluster", "namespace"],
        )
        .unwrap();
        let started_clusters = IntCounterVec::new(
            opts!(
                "operator_started_clusters_total",
                "Spark clusters started by the operator"
            ),
            &["namespace"],
        )
        .unwrap();
        Metrics {
            full_reconciliations,
            events,
            failures,
            running,
            watch_restarts,
            reconcile_duration,
            info,
            running_workers,
            started_clusters,
        }
    }
}

impl Metrics {
    /// Register API metrics to start tracking them.
    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        registry.register(Box::new(self.reconcile_duration.clone()))?;
        registry.register(Box::new(self.full_reconciliations.clone()))?;
        registry.register(Box::new(self.events.clone()))?;
        registry.register(Box::new(self.failures.clone()))?;
        registry.register(Box::new(self.running.clone()))?;
        registry.register(Box::new(self.watch_restarts.clone()))?;
        registry.register(Box::new(self.info.clone()))?;
        registry.register(Box::new(self.running_workers.clone()))?;
        registry.register(Box::new(self.started_clusters.clone()))?;
        Ok(self)
    }

    pub fn record_info(&self, config: &OperatorConfig) {
        let crd = config.crd.map(|crd| crd.to_string()).unwrap_or_default();
        self.info
            .with_label_values(&[
                env!("CARGO_PKG_VERSION"),
                config.watch_namespace.as_str(),
                crd.as_str(),
                config.full_reconciliation_interval_s.to_string().as_str(),
            ])
            .set(1);
    }

    pub fn event_handled(&self, kind: &str, namespace: &str, action: &str) {
        self.events.with_label_values(&[kind, namespace, action]).inc()
    }

    pub fn handler_failure(&self, kind: &str, namespace: &str, e: &Error) {
        self.failures
            .with_label_values(&[kind, namespace, e.metric_label()])
            .inc()
    }

    pub fn set_running(&self, kind: &str, namespace: &str, count: usize) {
        self.running
            .with_label_values(&[kind, namespace])
            .set(i64::try_from(count).unwrap_or(i64::MAX))
    }

    pub fn watch_restarted(&self, kind: &str, namespace: &str) {
        self.watch_restarts.with_label_values(&[kind, namespace]).inc()
    }

    pub fn cluster_started(&self, cluster: &str, namespace: &str, workers: i32) {
        self.started_clusters.with_label_values(&[namespace]).inc();
        self.set_workers(cluster, namespace, workers);
    }

    pub fn set_workers(&self, cluster: &str, namespace: &str, workers: i32) {
        self.running_workers
            .with_label_values(&[cluster, namespace])
            .set(i64::from(workers))
    }

    pub fn cluster_stopped(&self, cluster: &str, namespace: &str) {
        // absent when the cluster was started by another process
        let _ = self.running_workers.remove_label_values(&[cluster, namespace]);
    }

    pub fn count_and_measure(&self, kind: &str, namespace: &str) -> ReconcileMeasurer {
        self.full_reconciliations
            .with_label_values(&[kind, namespace])
            .inc();
        ReconcileMeasurer {
            start: Instant::now(),
            metric: self.reconcile_duration.clone(),
            kind: kind.to_string(),
        }
    }
}

/// Smart function duration measurer
///
/// Relies on Drop to calculate duration and register the observation in the histogram
pub struct ReconcileMeasurer {
    start: Instant,
    metric: HistogramVec,
    kind: String,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric
            .with_label_values(&[self.kind.as_str()])
            .observe(duration);
    }
}
