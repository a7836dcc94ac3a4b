//! Metrics collection for observability
//!
//! Prometheus metrics for monitoring the ledger, held in a private registry
//! so several ledgers can live in one process.
//!
//! # Metrics
//!
//! - `ledger_transfers_total{outcome}` - Transfers by outcome
//! - `ledger_deposits_total{outcome}` - Deposits by outcome
//! - `ledger_version_conflicts_total` - Attempts aborted by a version conflict
//! - `ledger_retries_exhausted_total` - Operations that ran out of attempts
//! - `ledger_drift_detected_total` - Reconciliations that found drift
//! - `ledger_corrections_total` - Adjustment entries appended by the reconciler
//! - `ledger_commit_duration_seconds` - Latency of a successful operation

use crate::Result;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

/// Outcome label for a committed operation
pub const OUTCOME_COMMITTED: &str = "committed";

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Transfers by outcome
    pub transfers_total: IntCounterVec,

    /// Deposits by outcome
    pub deposits_total: IntCounterVec,

    /// Attempts aborted by a version conflict
    pub version_conflicts_total: IntCounter,

    /// Operations that exhausted their retry budget
    pub retries_exhausted_total: IntCounter,

    /// Accounts found drifted
    pub drift_detected_total: IntCounter,

    /// Drift corrections applied
    pub corrections_total: IntCounter,

    /// Latency of successful operations
    pub commit_duration: Histogram,

    registry: Arc<Registry>,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let transfers_total = IntCounterVec::new(
            Opts::new("ledger_transfers_total", "Transfers by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(transfers_total.clone()))?;

        let deposits_total = IntCounterVec::new(
            Opts::new("ledger_deposits_total", "Deposits by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(deposits_total.clone()))?;

        let version_conflicts_total = IntCounter::new(
            "ledger_version_conflicts_total",
            "Attempts aborted by a version conflict",
        )?;
        registry.register(Box::new(version_conflicts_total.clone()))?;

        let retries_exhausted_total = IntCounter::new(
            "ledger_retries_exhausted_total",
            "Operations that ran out of retry attempts",
        )?;
        registry.register(Box::new(retries_exhausted_total.clone()))?;

        let drift_detected_total = IntCounter::new(
            "ledger_drift_detected_total",
            "Reconciliations that found balance drift",
        )?;
        registry.register(Box::new(drift_detected_total.clone()))?;

        let corrections_total = IntCounter::new(
            "ledger_corrections_total",
            "Adjustment entries appended by the reconciler",
        )?;
        registry.register(Box::new(corrections_total.clone()))?;

        let commit_duration = Histogram::with_opts(
            HistogramOpts::new(
                "ledger_commit_duration_seconds",
                "Latency of successful ledger operations",
            )
            .buckets(vec![0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0]),
        )?;
        registry.register(Box::new(commit_duration.clone()))?;

        Ok(Self {
            transfers_total,
            deposits_total,
            version_conflicts_total,
            retries_exhausted_total,
            drift_detected_total,
            corrections_total,
            commit_duration,
            registry,
        })
    }

    /// Record a transfer outcome (`committed` or an error kind)
    pub fn record_transfer(&self, outcome: &str) {
        self.transfers_total.with_label_values(&[outcome]).inc();
    }

    /// Record a deposit outcome
    pub fn record_deposit(&self, outcome: &str) {
        self.deposits_total.with_label_values(&[outcome]).inc();
    }

    /// Record an attempt lost to a version conflict
    pub fn record_version_conflict(&self) {
        self.version_conflicts_total.inc();
    }

    /// Record retry exhaustion
    pub fn record_retries_exhausted(&self) {
        self.retries_exhausted_total.inc();
    }

    /// Record a drifted account
    pub fn record_drift(&self) {
        self.drift_detected_total.inc();
    }

    /// Record an applied correction
    pub fn record_correction(&self) {
        self.corrections_total.inc();
    }

    /// Record operation latency
    pub fn record_commit_duration(&self, duration_seconds: f64) {
        self.commit_duration.observe(duration_seconds);
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render the registry in the Prometheus text format
    pub fn encode_text(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer)
            .map_err(|e| prometheus::Error::Msg(format!("Non UTF-8 metrics output: {}", e)).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        assert_eq!(metrics.version_conflicts_total.get(), 0);
        assert_eq!(metrics.corrections_total.get(), 0);
    }

    #[test]
    fn test_two_collectors_do_not_collide() {
        let first = Metrics::new().unwrap();
        let second = Metrics::new().unwrap();

        first.record_version_conflict();
        assert_eq!(first.version_conflicts_total.get(), 1);
        assert_eq!(second.version_conflicts_total.get(), 0);
    }

    #[test]
    fn test_outcome_labels() {
        let metrics = Metrics::new().unwrap();
        metrics.record_transfer(OUTCOME_COMMITTED);
        metrics.record_transfer(OUTCOME_COMMITTED);
        metrics.record_transfer("insufficient_funds");

        assert_eq!(
            metrics
                .transfers_total
                .with_label_values(&[OUTCOME_COMMITTED])
                .get(),
            2
        );
        assert_eq!(
            metrics
                .transfers_total
                .with_label_values(&["insufficient_funds"])
                .get(),
            1
        );
    }

    #[test]
    fn test_encode_text() {
        let metrics = Metrics::new().unwrap();
        metrics.record_deposit(OUTCOME_COMMITTED);
        metrics.record_commit_duration(0.004);

        let body = metrics.encode_text().unwrap();
        assert!(body.contains("ledger_deposits_total{outcome=\"committed\"} 1"));
        assert!(body.contains("ledger_commit_duration_seconds_count 1"));
    }
}
