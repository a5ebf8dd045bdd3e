use std::time::Instant;

use kube::ResourceExt;
use prometheus::{histogram_opts, opts, HistogramVec, IntCounter, IntCounterVec, Registry};

use crate::{
    crd::{Backup, RunPhase},
    AppError,
};

#[derive(Clone)]
pub struct Metrics {
    pub reconciliations: IntCounter,
    pub failures: IntCounterVec,
    pub reconcile_duration: HistogramVec,
    pub runs: IntCounterVec,
}

impl Default for Metrics {
    fn default() -> Self {
        let reconcile_duration = HistogramVec::new(
            histogram_opts!(
                "gobackup_reconcile_duration_seconds",
                "The duration of reconcile to complete in seconds"
            )
            .buckets(vec![0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60.]),
            &[],
        )
        .unwrap();
        let failures = IntCounterVec::new(
            opts!("gobackup_reconciliation_errors_total", "reconciliation errors"),
            &["instance", "error"],
        )
        .unwrap();
        let reconciliations =
            IntCounter::new("gobackup_reconciliations_total", "reconciliations").unwrap();
        let runs = IntCounterVec::new(
            opts!("gobackup_backup_runs_total", "finished backup runs by outcome"),
            &["phase"],
        )
        .unwrap();
        Metrics { reconciliations, failures, reconcile_duration, runs }
    }
}

impl Metrics {
    /// Register API metrics to start tracking them.
    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        registry.register(Box::new(self.reconcile_duration.clone()))?;
        registry.register(Box::new(self.failures.clone()))?;
        registry.register(Box::new(self.reconciliations.clone()))?;
        registry.register(Box::new(self.runs.clone()))?;
        Ok(self)
    }

    pub fn reconcile_failure(&self, backup: &Backup, e: &AppError) {
        self.failures.with_label_values(&[backup.name_any().as_ref(), e.metric_label().as_ref()]).inc()
    }

    pub fn count_and_measure(&self) -> ReconcileMeasurer {
        self.reconciliations.inc();
        ReconcileMeasurer { start: Instant::now(), metric: self.reconcile_duration.clone() }
    }

    pub fn run_completed(&self, phase: RunPhase) {
        self.runs.with_label_values(&[phase.as_str()]).inc()
    }
}

/// Smart function duration measurer
///
/// Relies on Drop to calculate duration and register the observation in the histogram
pub struct ReconcileMeasurer {
    start: Instant,
    metric: HistogramVec,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric.with_label_values(&[]).observe(duration);
    }
}
