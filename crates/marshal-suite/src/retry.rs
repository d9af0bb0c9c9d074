//! Test-case granular retry.
//!
//! [`GranularRetryWrapper`] runs one test unit for up to `max_attempts`
//! attempts. Attempt 0 always runs unfiltered. Every attempt reports into a
//! fresh, attempt-scoped listener chain; results are stored per run name and
//! attempt and merged on demand by [`GranularRetryWrapper::final_results`].
//!
//! ## Continuation
//!
//! | Strategy              | Runs another attempt when...              |
//! |-----------------------|-------------------------------------------|
//! | `NO_RETRY`            | never                                     |
//! | `ITERATIONS`          | always, until `max_attempts`              |
//! | `RETRY_ANY_FAILURE`   | the last attempt had failed cases         |
//! | `RERUN_UNTIL_FAILURE` | the last attempt had no failure at all    |

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use marshal_core::{InvocationContext, LogStream, TargetError};
use serde::{Deserialize, Serialize};

use crate::collector::{CollectorSink, MetricCollector, clone_for_attempt};
use crate::diagnostics::FailureDiagnostics;
use crate::error::{Error, Result};
use crate::listener::{CollectingListener, ResultSink};
use crate::merge::MergeStrategy;
use crate::metrics::SuiteMetrics;
use crate::result::{
    FailureDescription, FailureStatus, Metrics, RunResult, TestDescription, TestStatus,
};
use crate::unit::{TestUnit, UnitFault, inject_context};

/// Policy deciding whether another attempt runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetryStrategy {
    /// Run once.
    #[default]
    NoRetry,
    /// Run exactly `max_attempts` times.
    Iterations,
    /// Rerun failed cases until they pass or attempts run out.
    RetryAnyFailure,
    /// Rerun everything until something fails or attempts run out.
    RerunUntilFailure,
}

impl RetryStrategy {
    /// Returns the merge rule implied by this strategy.
    #[must_use]
    pub const fn merge_strategy(self) -> MergeStrategy {
        match self {
            Self::NoRetry => MergeStrategy::NoMerge,
            Self::Iterations => MergeStrategy::LastAttemptWins,
            Self::RetryAnyFailure => MergeStrategy::AnyPassWins,
            Self::RerunUntilFailure => MergeStrategy::AnyFailIsFail,
        }
    }

    /// Returns the strategy name as used in configuration.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NoRetry => "NO_RETRY",
            Self::Iterations => "ITERATIONS",
            Self::RetryAnyFailure => "RETRY_ANY_FAILURE",
            Self::RerunUntilFailure => "RERUN_UNTIL_FAILURE",
        }
    }
}

impl fmt::Display for RetryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RetryStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "NO_RETRY" => Ok(Self::NoRetry),
            "ITERATIONS" => Ok(Self::Iterations),
            "RETRY_ANY_FAILURE" => Ok(Self::RetryAnyFailure),
            "RERUN_UNTIL_FAILURE" => Ok(Self::RerunUntilFailure),
            _ => Err(Error::configuration(format!("unknown retry strategy '{s}'"))),
        }
    }
}

/// Retry parameters for one module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    /// Upper bound on attempts, including attempt 0.
    pub max_attempts: u32,
    /// Continuation policy.
    pub strategy: RetryStrategy,
    /// Reboot every physical target before the final attempt.
    pub reboot_before_last_attempt: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            strategy: RetryStrategy::NoRetry,
            reboot_before_last_attempt: false,
        }
    }
}

impl RetryConfig {
    /// Creates a retry configuration.
    #[must_use]
    pub const fn new(max_attempts: u32, strategy: RetryStrategy) -> Self {
        Self {
            max_attempts,
            strategy,
            reboot_before_last_attempt: false,
        }
    }

    /// Reboots physical targets before the final attempt.
    #[must_use]
    pub const fn with_reboot_before_last_attempt(mut self, reboot: bool) -> Self {
        self.reboot_before_last_attempt = reboot;
        self
    }
}

/// Bookkeeping of a retry loop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryStatistics {
    /// Wall time spent in retries (attempt 0 excluded).
    #[serde(with = "humantime_serde")]
    pub retry_time: Duration,
    /// Cases that failed and later passed.
    pub success_retried: usize,
    /// Cases still failing when the loop ended.
    pub failed_retried: usize,
    /// Attempt at which each recovered case first passed.
    pub attempt_success: BTreeMap<TestDescription, u32>,
}

impl RetryStatistics {
    /// Adds another unit's statistics into this one.
    pub fn absorb(&mut self, other: &Self) {
        self.retry_time += other.retry_time;
        self.success_retried += other.success_retried;
        self.failed_retried += other.failed_retried;
        for (test, attempt) in &other.attempt_success {
            self.attempt_success.entry(test.clone()).or_insert(*attempt);
        }
    }
}

/// Options applied to every event of an attempt.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct AttemptOptions {
    /// Report every started case as IGNORED and drop failures.
    pub mark_skipped: bool,
}

/// The listener chain of one attempt.
///
/// Results go to a fresh collector; failures tap the diagnostics sink; the
/// artifacts it captures, and every artifact the unit logs, go straight to
/// the downstream sink.
struct AttemptListener<'a> {
    attempt: u32,
    unit: &'a str,
    collector: &'a mut CollectingListener,
    diagnostics: Option<&'a mut FailureDiagnostics>,
    downstream: &'a mut dyn ResultSink,
    options: AttemptOptions,
    open_run: Option<(String, Instant)>,
    expected: usize,
    ended: usize,
}

impl<'a> AttemptListener<'a> {
    async fn forward_diagnostics(&mut self) {
        let Some(diagnostics) = self.diagnostics.as_deref_mut() else {
            return;
        };
        for log in diagnostics.take_pending_logs() {
            self.downstream.test_log(&log.name, &log.stream).await;
        }
    }

    /// Converts a fault escaping the unit into run events.
    ///
    /// Returns the target error when the fault aborts the invocation.
    async fn settle(&mut self, outcome: std::result::Result<(), UnitFault>) -> Option<TargetError> {
        let fatal = match outcome {
            Ok(()) => None,
            Err(UnitFault::Runtime { message }) => {
                tracing::error!(unit = self.unit, attempt = self.attempt, error = %message, "test unit failed");
                self.fail_run(FailureDescription::new(FailureStatus::TestFailure, message))
                    .await;
                None
            }
            Err(UnitFault::Target(e)) if !e.is_unavailable() => {
                tracing::warn!(unit = self.unit, serial = e.serial(), error = %e, "target recovered during run");
                self.fail_run(
                    FailureDescription::new(FailureStatus::InfraFailure, e.to_string())
                        .with_cause(e.serial()),
                )
                .await;
                None
            }
            Err(UnitFault::Target(e)) => {
                tracing::error!(unit = self.unit, serial = e.serial(), error = %e, "target unavailable during run");
                self.fail_run(
                    FailureDescription::new(
                        FailureStatus::LostTarget,
                        format!("Run in progress was not completed due to: {e}"),
                    )
                    .with_cause(e.serial()),
                )
                .await;
                Some(e)
            }
        };
        if let Some((name, started)) = self.open_run.clone() {
            if fatal.is_none() {
                tracing::debug!(run = %name, "closing run left open by the unit");
            }
            self.run_ended(started.elapsed(), &Metrics::new()).await;
        }
        fatal
    }

    async fn fail_run(&mut self, failure: FailureDescription) {
        if self.open_run.is_none() {
            let unit = self.unit;
            self.run_started(unit, 0, self.attempt).await;
        }
        self.collector.on_run_failed(&failure);
    }
}

#[async_trait]
impl<'a> ResultSink for AttemptListener<'a> {
    async fn run_started(&mut self, name: &str, expected_count: usize, _attempt: u32) {
        self.collector
            .on_run_started(name, expected_count, self.attempt);
        match &self.open_run {
            Some((open, _)) if open == name => self.expected += expected_count,
            _ => {
                self.open_run = Some((name.to_string(), Instant::now()));
                self.expected = expected_count;
                self.ended = 0;
            }
        }
    }

    async fn test_started(&mut self, test: &TestDescription, started_at: DateTime<Utc>) {
        self.collector.on_test_started(test, started_at);
        if self.options.mark_skipped {
            self.collector.on_test_status(test, TestStatus::Ignored, None);
        }
    }

    async fn test_failed(&mut self, test: &TestDescription, trace: &str) {
        if self.options.mark_skipped {
            return;
        }
        self.collector.on_test_status(test, TestStatus::Fail, Some(trace));
        if let Some(diagnostics) = self.diagnostics.as_deref_mut() {
            diagnostics.test_failed(test, trace).await;
        }
        self.forward_diagnostics().await;
    }

    async fn test_assumption_failure(&mut self, test: &TestDescription, trace: &str) {
        if self.options.mark_skipped {
            return;
        }
        self.collector
            .on_test_status(test, TestStatus::AssumptionFailure, Some(trace));
    }

    async fn test_ignored(&mut self, test: &TestDescription) {
        self.collector.on_test_status(test, TestStatus::Ignored, None);
    }

    async fn test_ended(&mut self, test: &TestDescription, ended_at: DateTime<Utc>, metrics: &Metrics) {
        self.collector.on_test_ended(test, ended_at, metrics);
        self.ended += 1;
        let status = self
            .collector
            .current_run()
            .and_then(|r| r.tests.get(test))
            .map_or(TestStatus::Incomplete, |c| c.status);
        tracing::info!(
            unit = self.unit,
            attempt = self.attempt,
            "[{}/{}] {} {}",
            self.ended,
            self.expected,
            test,
            status.as_label().to_ascii_lowercase(),
        );
    }

    async fn run_failed(&mut self, failure: &FailureDescription) {
        if self.options.mark_skipped {
            return;
        }
        self.collector.on_run_failed(failure);
    }

    async fn run_ended(&mut self, elapsed: Duration, metrics: &Metrics) {
        self.collector.on_run_ended(elapsed, metrics);
        self.open_run = None;
    }

    async fn test_log(&mut self, name: &str, stream: &LogStream) {
        self.downstream.test_log(name, stream).await;
    }
}

/// Runs one test unit with test-case granular retry.
pub struct GranularRetryWrapper {
    unit: Box<dyn TestUnit>,
    config: RetryConfig,
    collectors: Vec<Box<dyn MetricCollector>>,
    options: AttemptOptions,
    attempts: IndexMap<String, Vec<RunResult>>,
    attempts_run: u32,
    statistics: RetryStatistics,
    metrics: SuiteMetrics,
}

impl GranularRetryWrapper {
    /// Wraps `unit` with the given retry configuration.
    #[must_use]
    pub fn new(unit: Box<dyn TestUnit>, config: RetryConfig) -> Self {
        Self {
            unit,
            config,
            collectors: Vec::new(),
            options: AttemptOptions::default(),
            attempts: IndexMap::new(),
            attempts_run: 0,
            statistics: RetryStatistics::default(),
            metrics: SuiteMetrics::new(),
        }
    }

    /// Attaches metric collectors, cloned fresh for every attempt.
    #[must_use]
    pub fn with_collectors(mut self, collectors: Vec<Box<dyn MetricCollector>>) -> Self {
        self.collectors = collectors;
        self
    }

    /// Reports every case as IGNORED. Retries are disabled.
    #[must_use]
    pub fn with_tests_marked_skipped(mut self, mark_skipped: bool) -> Self {
        self.options.mark_skipped = mark_skipped;
        self
    }

    /// Returns the name of the wrapped unit.
    #[must_use]
    pub fn name(&self) -> &str {
        self.unit.name()
    }

    /// Returns the number of attempts that ran.
    #[must_use]
    pub const fn attempts_run(&self) -> u32 {
        self.attempts_run
    }

    /// Returns the retry bookkeeping.
    #[must_use]
    pub const fn statistics(&self) -> &RetryStatistics {
        &self.statistics
    }

    /// Returns every attempt of `run_name`, oldest first.
    #[must_use]
    pub fn attempts(&self, run_name: &str) -> &[RunResult] {
        self.attempts.get(run_name).map_or(&[], Vec::as_slice)
    }

    /// Returns the run names reported so far, in first-seen order.
    pub fn run_names(&self) -> impl Iterator<Item = &str> {
        self.attempts.keys().map(String::as_str)
    }

    /// Merges every run's attempts with the strategy's merge rule.
    ///
    /// Every run name with at least one attempt is present in the output.
    #[must_use]
    pub fn final_results(&self) -> Vec<RunResult> {
        let strategy = self.config.strategy.merge_strategy();
        self.attempts
            .values()
            .filter_map(|attempts| crate::merge::merge_attempts(attempts, strategy))
            .collect()
    }

    /// Case statuses observed in `attempt`, across every run.
    fn statuses_at(&self, attempt: u32) -> BTreeMap<TestDescription, TestStatus> {
        self.attempts
            .values()
            .flatten()
            .filter(|r| r.attempt == attempt)
            .flat_map(|r| r.tests.values().map(|c| (c.description.clone(), c.status)))
            .collect()
    }

    fn failed_at(&self, attempt: u32) -> BTreeSet<TestDescription> {
        self.statuses_at(attempt)
            .into_iter()
            .filter(|(_, s)| s.is_failed())
            .map(|(t, _)| t)
            .collect()
    }

    fn run_failure_at(&self, attempt: u32) -> bool {
        self.attempts
            .values()
            .flatten()
            .any(|r| r.attempt == attempt && r.is_run_failure())
    }

    fn should_retry(&self, attempt: u32) -> bool {
        match self.config.strategy {
            RetryStrategy::NoRetry => false,
            RetryStrategy::Iterations => true,
            RetryStrategy::RetryAnyFailure => !self.failed_at(attempt).is_empty(),
            RetryStrategy::RerunUntilFailure => {
                self.failed_at(attempt).is_empty() && !self.run_failure_at(attempt)
            }
        }
    }

    /// Narrows the unit to the previous attempt's failures when it can be filtered.
    fn prepare_retry(&mut self, failed: &BTreeSet<TestDescription>) {
        if self.config.strategy != RetryStrategy::RetryAnyFailure {
            return;
        }
        if let Some(filter) = self.unit.as_case_filter() {
            filter.clear_include_filters();
            for test in failed {
                filter.add_include_filter(&test.to_string());
            }
        } else {
            tracing::debug!(unit = self.unit.name(), "unit is not filterable, rerunning all cases");
        }
    }

    async fn run_attempt(
        &mut self,
        attempt: u32,
        ctx: &InvocationContext,
        downstream: &mut dyn ResultSink,
        diagnostics: Option<&mut FailureDiagnostics>,
    ) -> Result<()> {
        inject_context(self.unit.as_mut(), ctx);
        let mut wrap = clone_for_attempt(&self.collectors);
        if !wrap.is_empty() {
            if let Some(has_collectors) = self.unit.as_has_collectors() {
                has_collectors.set_collectors(std::mem::take(&mut wrap));
            }
        }

        let mut collector = CollectingListener::for_attempt(attempt);
        let fatal = {
            let unit_name = self.unit.name().to_string();
            let mut listener = AttemptListener {
                attempt,
                unit: &unit_name,
                collector: &mut collector,
                diagnostics,
                downstream,
                options: self.options,
                open_run: None,
                expected: 0,
                ended: 0,
            };
            let outcome = if wrap.is_empty() {
                self.unit.run(&mut listener).await
            } else {
                let mut sink = CollectorSink::new(&mut listener, wrap);
                self.unit.run(&mut sink).await
            };
            listener.settle(outcome).await
        };

        for run in collector.into_runs() {
            for case in run.tests.values() {
                self.metrics.record_test_case(case.status);
            }
            self.attempts.entry(run.name.clone()).or_default().push(run);
        }
        self.attempts_run = attempt + 1;
        fatal.map_or(Ok(()), |source| Err(Error::TargetUnavailable { source }))
    }

    /// Runs attempt 0 and every retry the strategy allows.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TargetUnavailable`] when a target is lost; the results
    /// of every attempt up to that point are kept.
    #[tracing::instrument(skip_all, fields(unit = self.unit.name(), strategy = %self.config.strategy))]
    pub async fn run(
        &mut self,
        ctx: &InvocationContext,
        downstream: &mut dyn ResultSink,
        mut diagnostics: Option<&mut FailureDiagnostics>,
    ) -> Result<()> {
        self.run_attempt(0, ctx, downstream, diagnostics.as_deref_mut())
            .await?;

        let max_attempts = if self.options.mark_skipped {
            1
        } else {
            self.config.max_attempts.max(1)
        };
        if max_attempts == 1 || self.config.strategy == RetryStrategy::NoRetry {
            return Ok(());
        }

        let started = Instant::now();
        let mut still_failing = self.failed_at(0);
        let mut outcome = Ok(());
        for attempt in 1..max_attempts {
            if ctx.stop_signal().is_requested() {
                tracing::info!(attempt, "invocation stop requested, not retrying");
                break;
            }
            if !self.should_retry(attempt - 1) {
                break;
            }
            if self.config.reboot_before_last_attempt && attempt == max_attempts - 1 {
                if let Err(e) = reboot_physical_targets(ctx).await {
                    outcome = Err(e);
                    break;
                }
            }
            self.prepare_retry(&still_failing);
            self.metrics.record_retry_attempt(self.config.strategy.as_str());
            tracing::info!(attempt, max_attempts, failed = still_failing.len(), "starting retry attempt");
            if let Err(e) = self
                .run_attempt(attempt, ctx, downstream, diagnostics.as_deref_mut())
                .await
            {
                outcome = Err(e);
                break;
            }

            let statuses = self.statuses_at(attempt);
            let recovered: BTreeSet<TestDescription> = still_failing
                .iter()
                .filter(|t| statuses.get(*t).is_some_and(|s| !s.is_failed()))
                .cloned()
                .collect();
            for test in &recovered {
                self.statistics
                    .attempt_success
                    .entry(test.clone())
                    .or_insert(attempt);
            }
            self.statistics.success_retried += recovered.len();
            self.metrics.record_retry_recovered(recovered.len());
            still_failing = still_failing
                .difference(&recovered)
                .cloned()
                .chain(
                    statuses
                        .into_iter()
                        .filter(|(_, s)| s.is_failed())
                        .map(|(t, _)| t),
                )
                .collect();
        }
        self.statistics.failed_retried = still_failing.len();
        self.statistics.retry_time = started.elapsed();
        tracing::info!(
            attempts = self.attempts_run,
            success_retried = self.statistics.success_retried,
            failed_retried = self.statistics.failed_retried,
            "retry loop finished"
        );
        outcome
    }
}

/// Reboots every physical target, in allocation order.
async fn reboot_physical_targets(ctx: &InvocationContext) -> Result<()> {
    for target in ctx.physical_targets() {
        tracing::info!(serial = target.serial(), "rebooting before last attempt");
        match target.reboot().await {
            Ok(()) => {}
            Err(e) if e.is_unavailable() => return Err(Error::TargetUnavailable { source: e }),
            Err(e) => tracing::warn!(serial = target.serial(), error = %e, "reboot before last attempt failed"),
        }
    }
    Ok(())
}
