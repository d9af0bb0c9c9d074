//! Observability metrics for suite execution.
//!
//! Metrics go through the `metrics` crate facade; the host installs whatever
//! recorder it exports with. Without a recorder every call is a no-op.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `marshal_modules_total` | Counter | `result` | Modules finished, by outcome |
//! | `marshal_module_duration_seconds` | Histogram | `result` | Wall time per module |
//! | `marshal_test_cases_total` | Counter | `status` | Final case statuses reported |
//! | `marshal_retry_attempts_total` | Counter | `strategy` | Retry attempts started |
//! | `marshal_retry_recovered_total` | Counter | - | Cases that passed on retry |
//! | `marshal_diagnostic_captures_total` | Counter | `kind`, `result` | Failure diagnostic captures |
//! | `marshal_preparer_failures_total` | Counter | `phase` | Preparer setup/teardown failures |
//! | `marshal_modules_remaining` | Gauge | - | Modules left in the current shard |

use std::time::Duration;

use metrics::{counter, gauge, histogram};

use crate::result::TestStatus;

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: Modules finished.
    pub const MODULES_TOTAL: &str = "marshal_modules_total";
    /// Histogram: Module wall time in seconds.
    pub const MODULE_DURATION_SECONDS: &str = "marshal_module_duration_seconds";
    /// Counter: Final case statuses.
    pub const TEST_CASES_TOTAL: &str = "marshal_test_cases_total";
    /// Counter: Retry attempts started.
    pub const RETRY_ATTEMPTS_TOTAL: &str = "marshal_retry_attempts_total";
    /// Counter: Cases that passed on a retry attempt.
    pub const RETRY_RECOVERED_TOTAL: &str = "marshal_retry_recovered_total";
    /// Counter: Failure diagnostic captures.
    pub const DIAGNOSTIC_CAPTURES_TOTAL: &str = "marshal_diagnostic_captures_total";
    /// Counter: Preparer failures.
    pub const PREPARER_FAILURES_TOTAL: &str = "marshal_preparer_failures_total";
    /// Gauge: Modules left in the current shard.
    pub const MODULES_REMAINING: &str = "marshal_modules_remaining";
}

/// Label keys used across metrics.
pub mod labels {
    /// Outcome (passed, failed, not_run, preparation_failed).
    pub const RESULT: &str = "result";
    /// Final case status.
    pub const STATUS: &str = "status";
    /// Retry strategy.
    pub const STRATEGY: &str = "strategy";
    /// Diagnostic kind (bugreport, screenshot, logcat, reboot).
    pub const KIND: &str = "kind";
    /// Preparation phase (setup, teardown).
    pub const PHASE: &str = "phase";
}

/// High-level interface for recording suite metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct SuiteMetrics;

impl SuiteMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Records a finished module.
    pub fn record_module(&self, result: &str, duration: Duration) {
        counter!(names::MODULES_TOTAL, labels::RESULT => result.to_string()).increment(1);
        histogram!(
            names::MODULE_DURATION_SECONDS,
            labels::RESULT => result.to_string(),
        )
        .record(duration.as_secs_f64());
    }

    /// Records the final status of one case.
    pub fn record_test_case(&self, status: TestStatus) {
        counter!(names::TEST_CASES_TOTAL, labels::STATUS => status.as_label()).increment(1);
    }

    /// Records the start of a retry attempt.
    pub fn record_retry_attempt(&self, strategy: &str) {
        counter!(
            names::RETRY_ATTEMPTS_TOTAL,
            labels::STRATEGY => strategy.to_string(),
        )
        .increment(1);
    }

    /// Records cases that passed on retry.
    pub fn record_retry_recovered(&self, count: usize) {
        counter!(names::RETRY_RECOVERED_TOTAL).increment(count as u64);
    }

    /// Records a diagnostic capture.
    pub fn record_diagnostic(&self, kind: &'static str, succeeded: bool) {
        let result = if succeeded { "success" } else { "failure" };
        counter!(
            names::DIAGNOSTIC_CAPTURES_TOTAL,
            labels::KIND => kind,
            labels::RESULT => result,
        )
        .increment(1);
    }

    /// Records a preparer failure.
    pub fn record_preparer_failure(&self, phase: &'static str) {
        counter!(names::PREPARER_FAILURES_TOTAL, labels::PHASE => phase).increment(1);
    }

    /// Sets the number of modules left in the current shard.
    #[allow(clippy::cast_precision_loss)] // module counts are small
    pub fn set_modules_remaining(&self, count: usize) {
        gauge!(names::MODULES_REMAINING).set(count as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suite_metrics_record_without_recorder() {
        let metrics = SuiteMetrics::new();
        metrics.record_module("passed", Duration::from_millis(250));
        metrics.record_test_case(TestStatus::AssumptionFailure);
        metrics.record_retry_attempt("retry_any_failure");
        metrics.record_retry_recovered(2);
        metrics.record_diagnostic("screenshot", false);
        metrics.record_preparer_failure("teardown");
        metrics.set_modules_remaining(3);
    }
}
