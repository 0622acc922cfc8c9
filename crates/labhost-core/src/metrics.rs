//! Prometheus metrics for repair.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `labhost_repair_actions_total` | Counter | `action`, `outcome`, `board` |
//! | `labhost_repair_full_failures_total` | Counter | `board` |
//!
//! `outcome` is one of `succeeded`, `not_applicable` or `failed`. Hosts
//! without a `board:` label are counted under [`UNKNOWN_BOARD`].

use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};
use thiserror::Error;

use crate::repair::{OutcomeKind, RepairAction};

/// Longest label value recorded; longer values are truncated.
pub const MAX_LABEL_VALUE_LEN: usize = 64;

/// Board label for hosts whose board is not known.
pub const UNKNOWN_BOARD: &str = "unknown";

/// Errors that can occur during metrics operations.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Failed to register a metric with Prometheus.
    #[error("failed to register metric: {0}")]
    RegistrationFailed(#[from] prometheus::Error),

    /// Failed to encode metrics output.
    #[error("failed to encode metrics: {0}")]
    EncodingFailed(String),
}

/// Result type for metrics operations.
pub type MetricsResult<T> = Result<T, MetricsError>;

/// Counters for repair actions.
///
/// Clones share the underlying counters.
#[derive(Clone)]
pub struct RepairMetrics {
    actions_total: IntCounterVec,
    full_failures_total: IntCounterVec,
}

impl std::fmt::Debug for RepairMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepairMetrics").finish_non_exhaustive()
    }
}

impl RepairMetrics {
    /// Creates the repair counters and registers them with `registry`.
    ///
    /// # Errors
    ///
    /// Returns an error if a counter is already registered.
    pub fn new(registry: &Registry) -> MetricsResult<Self> {
        let actions_total = IntCounterVec::new(
            Opts::new(
                "labhost_repair_actions_total",
                "Repair actions run, by action, outcome and board",
            ),
            &["action", "outcome", "board"],
        )?;
        registry.register(Box::new(actions_total.clone()))?;

        let full_failures_total = IntCounterVec::new(
            Opts::new(
                "labhost_repair_full_failures_total",
                "Repairs that exhausted every action, by board",
            ),
            &["board"],
        )?;
        registry.register(Box::new(full_failures_total.clone()))?;

        Ok(Self {
            actions_total,
            full_failures_total,
        })
    }

    /// Counts one repair action ending with `outcome` on a `board` host.
    pub fn action_completed(&self, action: RepairAction, outcome: OutcomeKind, board: &str) {
        self.actions_total
            .with_label_values(&[action.name(), outcome_label(outcome), truncate_label(board)])
            .inc();
    }

    /// Counts a repair that exhausted every action.
    pub fn full_repair_failed(&self, board: &str) {
        self.full_failures_total
            .with_label_values(&[truncate_label(board)])
            .inc();
    }

    /// How many times `action` ended with `outcome` on `board` hosts.
    #[must_use]
    pub fn action_count(&self, action: RepairAction, outcome: OutcomeKind, board: &str) -> u64 {
        self.actions_total
            .with_label_values(&[action.name(), outcome_label(outcome), truncate_label(board)])
            .get()
    }

    /// How many repairs of `board` hosts exhausted every action.
    #[must_use]
    pub fn full_repair_failure_count(&self, board: &str) -> u64 {
        self.full_failures_total
            .with_label_values(&[truncate_label(board)])
            .get()
    }
}

/// A Prometheus registry holding the repair counters.
#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    registry: Registry,
    repair_metrics: RepairMetrics,
}

impl MetricsRegistry {
    /// Creates a registry with the repair counters registered.
    ///
    /// # Errors
    ///
    /// Returns an error if metric registration fails.
    pub fn new() -> MetricsResult<Self> {
        let registry = Registry::new();
        let repair_metrics = RepairMetrics::new(&registry)?;
        Ok(Self {
            registry,
            repair_metrics,
        })
    }

    /// The repair counters.
    #[must_use]
    pub const fn repair_metrics(&self) -> &RepairMetrics {
        &self.repair_metrics
    }

    /// Encodes every metric in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode_text(&self) -> MetricsResult<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| MetricsError::EncodingFailed(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::EncodingFailed(e.to_string()))
    }
}

const fn outcome_label(outcome: OutcomeKind) -> &'static str {
    match outcome {
        OutcomeKind::Succeeded => "succeeded",
        OutcomeKind::NotApplicable => "not_applicable",
        OutcomeKind::Failed => "failed",
    }
}

/// Truncates `value` to at most [`MAX_LABEL_VALUE_LEN`] bytes on a char
/// boundary.
fn truncate_label(value: &str) -> &str {
    if value.len() <= MAX_LABEL_VALUE_LEN {
        return value;
    }
    let end = value
        .char_indices()
        .map(|(i, _)| i)
        .take_while(|&i| i <= MAX_LABEL_VALUE_LEN)
        .last()
        .unwrap_or(0);
    &value[..end]
}
