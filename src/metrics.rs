//! Metrics collection for the worker pool
//!
//! Prometheus counters and histograms describing queue throughput, per-stage
//! message failures, outbound call attempts and worker health. One registry
//! is shared by every worker; all instruments are atomic so no locking is
//! involved on the hot path.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::{sync::Arc, time::Duration};
use tracing::debug;

use crate::error::{AppError, AppResult};

const NAMESPACE: &str = "call_billing_worker";

/// Pipeline stage at which a message was abandoned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    Decode,
    Billing,
    Response,
    Store,
}

impl FailureStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureStage::Decode => "decode",
            FailureStage::Billing => "billing",
            FailureStage::Response => "response",
            FailureStage::Store => "store",
        }
    }
}

struct Instruments {
    registry: Registry,
    messages_received: IntCounter,
    messages_billed: IntCounter,
    messages_deleted: IntCounter,
    message_failures: IntCounterVec,
    delete_failures: IntCounter,
    iteration_faults: IntCounter,
    http_attempts: IntCounterVec,
    http_latency: HistogramVec,
    workers_running: IntGauge,
}

/// Shared handle to the process metrics registry
#[derive(Clone)]
pub struct WorkerMetrics {
    inner: Arc<Instruments>,
}

impl WorkerMetrics {
    /// Creates a fresh registry with every instrument registered
    pub fn new() -> AppResult<Self> {
        let registry = Registry::new();

        let messages_received = IntCounter::with_opts(
            Opts::new("messages_received_total", "Messages fetched from the queue")
                .namespace(NAMESPACE),
        )
        .map_err(metrics_error)?;
        let messages_billed = IntCounter::with_opts(
            Opts::new("messages_billed_total", "Messages billed and persisted")
                .namespace(NAMESPACE),
        )
        .map_err(metrics_error)?;
        let messages_deleted = IntCounter::with_opts(
            Opts::new("messages_deleted_total", "Messages acknowledged on the queue")
                .namespace(NAMESPACE),
        )
        .map_err(metrics_error)?;
        let message_failures = IntCounterVec::new(
            Opts::new("message_failures_total", "Messages left for redelivery, by stage")
                .namespace(NAMESPACE),
            &["stage"],
        )
        .map_err(metrics_error)?;
        let delete_failures = IntCounter::with_opts(
            Opts::new("delete_failures_total", "Delete entries rejected or never confirmed")
                .namespace(NAMESPACE),
        )
        .map_err(metrics_error)?;
        let iteration_faults = IntCounter::with_opts(
            Opts::new("iteration_faults_total", "Worker iterations that ended in a fault")
                .namespace(NAMESPACE),
        )
        .map_err(metrics_error)?;
        let http_attempts = IntCounterVec::new(
            Opts::new("http_attempts_total", "Outbound HTTP attempts by status")
                .namespace(NAMESPACE),
            &["app", "status"],
        )
        .map_err(metrics_error)?;
        let http_latency = HistogramVec::new(
            HistogramOpts::new("http_attempt_duration_seconds", "Outbound HTTP attempt latency")
                .namespace(NAMESPACE),
            &["app"],
        )
        .map_err(metrics_error)?;
        let workers_running = IntGauge::with_opts(
            Opts::new("workers_running", "Workers currently inside their polling loop")
                .namespace(NAMESPACE),
        )
        .map_err(metrics_error)?;

        registry
            .register(Box::new(messages_received.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(messages_billed.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(messages_deleted.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(message_failures.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(delete_failures.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(iteration_faults.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(http_attempts.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(http_latency.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(workers_running.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            inner: Arc::new(Instruments {
                registry,
                messages_received,
                messages_billed,
                messages_deleted,
                message_failures,
                delete_failures,
                iteration_faults,
                http_attempts,
                http_latency,
                workers_running,
            }),
        })
    }

    pub fn record_received(&self, count: usize) {
        self.inner.messages_received.inc_by(count as u64);
    }

    pub fn record_billed(&self) {
        self.inner.messages_billed.inc();
    }

    pub fn record_deleted(&self, count: usize) {
        self.inner.messages_deleted.inc_by(count as u64);
    }

    pub fn record_failure(&self, stage: FailureStage) {
        self.inner
            .message_failures
            .with_label_values(&[stage.as_str()])
            .inc();
    }

    pub fn record_delete_failures(&self, count: usize) {
        self.inner.delete_failures.inc_by(count as u64);
    }

    pub fn record_iteration_fault(&self) {
        self.inner.iteration_faults.inc();
    }

    /// Records one outbound HTTP attempt and its latency
    pub fn record_http_attempt(&self, app: &str, status: u16, elapsed: Duration) {
        let status = status.to_string();
        self.inner
            .http_attempts
            .with_label_values(&[app, status.as_str()])
            .inc();
        self.inner
            .http_latency
            .with_label_values(&[app])
            .observe(elapsed.as_secs_f64());
    }

    pub fn worker_started(&self) {
        self.inner.workers_running.inc();
    }

    pub fn worker_stopped(&self) {
        self.inner.workers_running.dec();
    }

    pub fn workers_running(&self) -> i64 {
        self.inner.workers_running.get()
    }

    pub fn failures(&self, stage: FailureStage) -> u64 {
        self.inner
            .message_failures
            .with_label_values(&[stage.as_str()])
            .get()
    }

    pub fn deleted(&self) -> u64 {
        self.inner.messages_deleted.get()
    }

    pub fn iteration_faults(&self) -> u64 {
        self.inner.iteration_faults.get()
    }

    /// Renders the registry in the Prometheus text exposition format
    pub fn render(&self) -> AppResult<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        let metric_families = self.inner.registry.gather();
        debug!("Gathering {} metric families", metric_families.len());

        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(metrics_error)?;

        String::from_utf8(buffer).map_err(|e| crate::internal_error!(e))
    }
}

fn metrics_error(err: prometheus::Error) -> AppError {
    crate::internal_error!(format!("metrics error: {}", err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = WorkerMetrics::new().unwrap();

        metrics.record_received(3);
        metrics.record_deleted(2);
        metrics.record_failure(FailureStage::Decode);
        metrics.record_failure(FailureStage::Decode);
        metrics.record_failure(FailureStage::Store);
        metrics.record_iteration_fault();

        assert_eq!(metrics.deleted(), 2);
        assert_eq!(metrics.failures(FailureStage::Decode), 2);
        assert_eq!(metrics.failures(FailureStage::Store), 1);
        assert_eq!(metrics.failures(FailureStage::Billing), 0);
        assert_eq!(metrics.iteration_faults(), 1);
    }

    #[test]
    fn test_worker_gauge() {
        let metrics = WorkerMetrics::new().unwrap();
        metrics.worker_started();
        metrics.worker_started();
        metrics.worker_stopped();
        assert_eq!(metrics.workers_running(), 1);
    }

    #[test]
    fn test_render_text_format() {
        let metrics = WorkerMetrics::new().unwrap();
        metrics.record_http_attempt("balance_api", 503, Duration::from_millis(12));
        metrics.record_received(1);

        let text = metrics.render().unwrap();
        assert!(text.contains("call_billing_worker_messages_received_total 1"));
        assert!(text.contains("call_billing_worker_http_attempts_total"));
        assert!(text.contains("status=\"503\""));
    }
}
