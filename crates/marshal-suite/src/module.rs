//! Module definition and its lifecycle state machine.
//!
//! ## State Machine
//!
//! ```text
//! CREATED → PREPARING → RUNNING → AGGREGATING → TEARDOWN → DONE
//!               │                                  ↑
//!               └→ PREPARATION_FAILED → SYNTHETIC_FAILURE_REPORT
//! ```
//!
//! A module reports exactly one run, named after the module, once teardown
//! has finished: the merged results of all its units, or a single synthetic
//! `<module>#PreparationError` case when setup failed. Teardown always runs
//! exactly once. A lost target is reported, torn down, and then returned as
//! [`Error::TargetUnavailable`].

use std::fmt;
use std::time::Instant;

use marshal_core::{InvocationContext, TargetError};
use serde::{Deserialize, Serialize};

use crate::collector::MetricCollector;
use crate::diagnostics::FailureDiagnostics;
use crate::error::{Error, Result};
use crate::listener::{ResultSink, report_run};
use crate::metrics::SuiteMetrics;
use crate::preparer::{PreparationFailure, PreparationPipeline};
use crate::result::{
    FailureDescription, FailureStatus, RunResult, TestCaseResult, TestDescription, TestStatus,
};
use crate::retry::{GranularRetryWrapper, RetryConfig, RetryStatistics};
use crate::unit::TestUnit;

/// Message of the run failure added when a module reports fewer cases than announced.
pub const MODULE_INCOMPLETE_MESSAGE: &str = "Module did not run all its tests.";

/// Method name of the synthetic case reported when setup fails.
pub const PREPARATION_ERROR_METHOD: &str = "PreparationError";

/// Lifecycle state of a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModuleState {
    /// Built, not started.
    Created,
    /// Preparers are running.
    Preparing,
    /// A preparer failed.
    PreparationFailed,
    /// The synthetic failure run is being assembled.
    SyntheticFailureReport,
    /// Units are running.
    Running,
    /// Unit results are being merged.
    Aggregating,
    /// Preparers are being torn down.
    Teardown,
    /// The final result was reported.
    Done,
}

impl ModuleState {
    /// Returns true if the module finished.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Done)
    }

    /// Returns true if transitioning to `target` is valid.
    #[must_use]
    pub const fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Created => matches!(target, Self::Preparing),
            Self::Preparing => matches!(target, Self::PreparationFailed | Self::Running),
            Self::PreparationFailed => matches!(target, Self::SyntheticFailureReport),
            Self::SyntheticFailureReport | Self::Aggregating => matches!(target, Self::Teardown),
            Self::Running => matches!(target, Self::Aggregating),
            Self::Teardown => matches!(target, Self::Done),
            Self::Done => false,
        }
    }

    /// Returns the states reachable from this one.
    #[must_use]
    pub fn valid_transitions(&self) -> Vec<Self> {
        match self {
            Self::Created => vec![Self::Preparing],
            Self::Preparing => vec![Self::PreparationFailed, Self::Running],
            Self::PreparationFailed => vec![Self::SyntheticFailureReport],
            Self::SyntheticFailureReport | Self::Aggregating => vec![Self::Teardown],
            Self::Running => vec![Self::Aggregating],
            Self::Teardown => vec![Self::Done],
            Self::Done => vec![],
        }
    }
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "CREATED",
            Self::Preparing => "PREPARING",
            Self::PreparationFailed => "PREPARATION_FAILED",
            Self::SyntheticFailureReport => "SYNTHETIC_FAILURE_REPORT",
            Self::Running => "RUNNING",
            Self::Aggregating => "AGGREGATING",
            Self::Teardown => "TEARDOWN",
            Self::Done => "DONE",
        };
        f.write_str(s)
    }
}

/// How a module's cases are executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleRunStrategy {
    /// Run normally.
    #[default]
    Run,
    /// Report every case as IGNORED without trusting its outcome.
    MarkTestsSkipped,
}

/// Descriptive metadata of a module.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModuleMetadata {
    /// Target ABI, e.g. `arm64-v8a`.
    pub architecture: Option<String>,
    /// Parameterization tags, e.g. `instant_app`.
    pub parameterization: Vec<String>,
    /// Capability tokens a target must hold.
    pub required_tokens: Vec<String>,
    /// Run-strategy override.
    pub run_strategy: ModuleRunStrategy,
}

/// What one module run produced.
#[derive(Debug, Clone)]
pub struct ModuleOutcome {
    /// Module name.
    pub name: String,
    /// The reported run.
    pub result: RunResult,
    /// Retry bookkeeping summed over units.
    pub retry: RetryStatistics,
    /// True if setup failed.
    pub preparation_failed: bool,
    /// Teardown failures, in the order they happened.
    pub teardown_failures: Vec<String>,
}

impl ModuleOutcome {
    /// Returns true if the module failed in any way.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.preparation_failed || self.result.is_failed()
    }
}

/// One module: its preparers, its units, and its lifecycle.
pub struct ModuleDefinition {
    name: String,
    units: Vec<Box<dyn TestUnit>>,
    pipeline: PreparationPipeline,
    metadata: ModuleMetadata,
    collectors: Vec<Box<dyn MetricCollector>>,
    retry: RetryConfig,
    collect_tests_only: bool,
    state: ModuleState,
    metrics: SuiteMetrics,
}

impl ModuleDefinition {
    /// Creates a module with no preparers and no retry.
    #[must_use]
    pub fn new(name: impl Into<String>, units: Vec<Box<dyn TestUnit>>) -> Self {
        Self {
            name: name.into(),
            units,
            pipeline: PreparationPipeline::default(),
            metadata: ModuleMetadata::default(),
            collectors: Vec::new(),
            retry: RetryConfig::default(),
            collect_tests_only: false,
            state: ModuleState::Created,
            metrics: SuiteMetrics::new(),
        }
    }

    /// Sets the preparation pipeline.
    #[must_use]
    pub fn with_pipeline(mut self, pipeline: PreparationPipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    /// Sets the metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: ModuleMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Sets the metric collectors.
    #[must_use]
    pub fn with_collectors(mut self, collectors: Vec<Box<dyn MetricCollector>>) -> Self {
        self.collectors = collectors;
        self
    }

    /// Sets the retry configuration.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Asks every collect-capable unit to only report its cases.
    #[must_use]
    pub const fn with_collect_tests_only(mut self, collect_only: bool) -> Self {
        self.collect_tests_only = collect_only;
        self
    }

    /// Returns the module name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the metadata.
    #[must_use]
    pub const fn metadata(&self) -> &ModuleMetadata {
        &self.metadata
    }

    /// Returns the current state.
    #[must_use]
    pub const fn state(&self) -> ModuleState {
        self.state
    }

    fn transition(&mut self, target: ModuleState) -> Result<()> {
        if !self.state.can_transition_to(target) {
            return Err(Error::InvalidStateTransition {
                from: self.state.to_string(),
                to: target.to_string(),
                reason: format!(
                    "valid transitions from {}: {:?}",
                    self.state,
                    self.state.valid_transitions()
                ),
            });
        }
        tracing::debug!(module = %self.name, from = %self.state, to = %target, "module state transition");
        self.state = target;
        Ok(())
    }

    fn preparation_failure_run(&self, failure: &PreparationFailure) -> RunResult {
        let message = failure.to_string();
        let id = TestDescription::new(self.name.clone(), PREPARATION_ERROR_METHOD);
        let mut case = TestCaseResult::started(id.clone(), chrono::Utc::now());
        case.status = TestStatus::Fail;
        case.message = Some(message.clone());
        case.ended_at = Some(case.started_at);

        let mut run = RunResult::new(self.name.clone(), 1, 0);
        run.tests.insert(id, case);
        run.add_run_failure(
            FailureDescription::new(FailureStatus::InfraFailure, message)
                .with_cause(failure.preparer.clone()),
        );
        run.complete = true;
        run
    }

    fn aggregate(&self, unit_runs: Vec<RunResult>) -> RunResult {
        let mut module_run = RunResult::new(self.name.clone(), 0, 0);
        for run in unit_runs {
            module_run.expected_count += run.expected_count;
            module_run.elapsed += run.elapsed;
            module_run.metrics.extend(run.metrics);
            module_run.tests.extend(run.tests);
            for failure in run.run_failures {
                module_run.add_run_failure(failure);
            }
        }
        if module_run.has_count_mismatch() {
            tracing::warn!(
                module = %self.name,
                expected = module_run.expected_count,
                observed = module_run.num_tests(),
                "module test count differs from the announced count"
            );
            let cause = format!(
                "expected {} tests, observed {}",
                module_run.expected_count,
                module_run.num_tests()
            );
            module_run.add_run_failure(
                FailureDescription::new(FailureStatus::Incomplete, MODULE_INCOMPLETE_MESSAGE)
                    .with_cause(cause),
            );
        }
        module_run.complete = true;
        module_run
    }

    async fn run_units(
        &mut self,
        ctx: &InvocationContext,
        sink: &mut dyn ResultSink,
        mut diagnostics: Option<&mut FailureDiagnostics>,
    ) -> (Vec<RunResult>, RetryStatistics, Option<TargetError>) {
        let mark_skipped = self.metadata.run_strategy == ModuleRunStrategy::MarkTestsSkipped;
        let retry = if self.collect_tests_only {
            RetryConfig::default()
        } else {
            self.retry.clone()
        };
        let mut runs = Vec::new();
        let mut statistics = RetryStatistics::default();
        for mut unit in std::mem::take(&mut self.units) {
            if self.collect_tests_only || mark_skipped {
                match unit.as_test_collector() {
                    Some(collector) => collector.set_collect_tests_only(true),
                    None if mark_skipped => {
                        tracing::warn!(unit = unit.name(), "unit cannot collect only; it will execute and be reported skipped");
                    }
                    None => {}
                }
            }
            let collectors = self.collectors.iter().map(|c| c.clone_box()).collect();
            let mut wrapper = GranularRetryWrapper::new(unit, retry.clone())
                .with_collectors(collectors)
                .with_tests_marked_skipped(mark_skipped);
            let outcome = wrapper.run(ctx, sink, diagnostics.as_deref_mut()).await;
            runs.extend(wrapper.final_results());
            statistics.absorb(wrapper.statistics());
            match outcome {
                Ok(()) => {}
                Err(Error::TargetUnavailable { source }) => {
                    return (runs, statistics, Some(source));
                }
                Err(e) => {
                    tracing::error!(module = %self.name, unit = wrapper.name(), error = %e, "unit wrapper failed");
                }
            }
        }
        (runs, statistics, None)
    }

    /// Runs the whole lifecycle and reports the module's run to `sink`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TargetUnavailable`] after reporting and teardown when a
    /// target was lost, and [`Error::InvalidStateTransition`] when the module
    /// already ran.
    pub async fn run(
        &mut self,
        ctx: &InvocationContext,
        sink: &mut dyn ResultSink,
        diagnostics: Option<&mut FailureDiagnostics>,
    ) -> Result<ModuleOutcome> {
        let started = Instant::now();
        self.transition(ModuleState::Preparing)?;

        let (mut result, mut fatal, retry, preparation_failed) = match self.pipeline.set_up(ctx).await {
            Err(failure) => {
                tracing::error!(module = %self.name, preparer = %failure.preparer, error = %failure.error, "module setup failed");
                self.transition(ModuleState::PreparationFailed)?;
                self.transition(ModuleState::SyntheticFailureReport)?;
                let run = self.preparation_failure_run(&failure);
                (run, failure.as_unavailable().cloned(), RetryStatistics::default(), true)
            }
            Ok(()) => {
                self.transition(ModuleState::Running)?;
                let (runs, statistics, lost) = self.run_units(ctx, sink, diagnostics).await;
                self.transition(ModuleState::Aggregating)?;
                (self.aggregate(runs), lost, statistics, false)
            }
        };

        self.transition(ModuleState::Teardown)?;
        let cause = result.run_failure_message();
        let report = self.pipeline.tear_down(ctx, cause.as_deref()).await;
        let teardown_failures: Vec<String> = report.failures.iter().map(ToString::to_string).collect();
        if let Err(failure) = report.into_result() {
            if fatal.is_none() {
                fatal = failure.as_unavailable().cloned();
            }
            result.add_run_failure(
                FailureDescription::new(
                    FailureStatus::InfraFailure,
                    format!("Teardown of {} failed: {}", failure.preparer, failure.error),
                )
                .with_cause(failure.preparer.clone()),
            );
        }

        sink.module_started(&self.name).await;
        report_run(sink, &result).await;
        if result.is_failed() && fatal.is_none() {
            capture_failure_bugreports(&self.name, ctx, sink).await;
        }
        sink.module_ended().await;
        self.transition(ModuleState::Done)?;

        let outcome = ModuleOutcome {
            name: self.name.clone(),
            result,
            retry,
            preparation_failed,
            teardown_failures,
        };
        let label = if fatal.is_some() {
            "target_unavailable"
        } else if preparation_failed {
            "preparation_failed"
        } else if outcome.is_failed() {
            "failed"
        } else {
            "passed"
        };
        self.metrics.record_module(label, started.elapsed());
        tracing::info!(
            module = %self.name,
            result = label,
            tests = outcome.result.num_tests(),
            failed = outcome.result.failed_tests().len(),
            "module finished"
        );

        match fatal {
            Some(source) => Err(Error::TargetUnavailable { source }),
            None => Ok(outcome),
        }
    }
}

/// Captures one bugreport per physical target after a module failed.
async fn capture_failure_bugreports(module: &str, ctx: &InvocationContext, sink: &mut dyn ResultSink) {
    for target in ctx.physical_targets() {
        let name = format!("module-{module}-failure-{}-bugreport", target.serial());
        match target.capture_bugreport(marshal_core::BugreportKind::Full).await {
            Ok(stream) => sink.test_log(&name, &stream).await,
            Err(e) => {
                tracing::warn!(module, serial = target.serial(), error = %e, "module failure bugreport not captured");
            }
        }
    }
}

impl fmt::Debug for ModuleDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleDefinition")
            .field("name", &self.name)
            .field("units", &self.units.iter().map(|u| u.name()).collect::<Vec<_>>())
            .field("preparers", &self.pipeline.names().collect::<Vec<_>>())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;

    use crate::listener::CollectingListener;
    use crate::preparer::{MultiTargetPreparer, PreparerError};
    use crate::result::Metrics;
    use crate::unit::UnitFault;

    struct Fixed {
        name: &'static str,
        announced: usize,
        cases: Vec<&'static str>,
    }

    #[async_trait]
    impl TestUnit for Fixed {
        fn name(&self) -> &str {
            self.name
        }

        async fn run(&mut self, sink: &mut dyn ResultSink) -> std::result::Result<(), UnitFault> {
            sink.run_started(self.name, self.announced, 0).await;
            for case in &self.cases {
                let id = TestDescription::new(self.name, *case);
                sink.test_started(&id, Utc::now()).await;
                sink.test_ended(&id, Utc::now(), &Metrics::new()).await;
            }
            sink.run_ended(Duration::from_millis(1), &Metrics::new()).await;
            Ok(())
        }
    }

    struct Prep {
        name: &'static str,
        fail_setup: bool,
        journal: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl MultiTargetPreparer for Prep {
        fn name(&self) -> &str {
            self.name
        }

        async fn set_up(&mut self, _ctx: &InvocationContext) -> std::result::Result<(), PreparerError> {
            self.journal.lock().unwrap().push(format!("setup:{}", self.name));
            if self.fail_setup {
                return Err(PreparerError::failed("apk install failed"));
            }
            Ok(())
        }

        async fn tear_down(
            &mut self,
            _ctx: &InvocationContext,
            _cause: Option<&str>,
        ) -> std::result::Result<(), PreparerError> {
            self.journal.lock().unwrap().push(format!("teardown:{}", self.name));
            Ok(())
        }
    }

    #[test]
    fn state_transitions() {
        assert!(ModuleState::Created.can_transition_to(ModuleState::Preparing));
        assert!(ModuleState::Preparing.can_transition_to(ModuleState::PreparationFailed));
        assert!(ModuleState::SyntheticFailureReport.can_transition_to(ModuleState::Teardown));
        assert!(!ModuleState::PreparationFailed.can_transition_to(ModuleState::Running));
        assert!(!ModuleState::Done.can_transition_to(ModuleState::Preparing));
        assert!(ModuleState::Done.is_terminal());
        for state in [ModuleState::Created, ModuleState::Running, ModuleState::Teardown] {
            for next in state.valid_transitions() {
                assert!(state.can_transition_to(next));
            }
        }
    }

    #[tokio::test]
    async fn units_are_reported_as_one_module_run() {
        let mut module = ModuleDefinition::new(
            "CtsExampleTestCases",
            vec![
                Box::new(Fixed { name: "first", announced: 2, cases: vec!["a", "b"] }),
                Box::new(Fixed { name: "second", announced: 1, cases: vec!["c"] }),
            ],
        );
        let mut sink = CollectingListener::new();
        let outcome = module
            .run(&InvocationContext::new(Vec::new()), &mut sink, None)
            .await
            .unwrap();

        assert_eq!(module.state(), ModuleState::Done);
        assert!(!outcome.is_failed());
        assert_eq!(sink.modules(), ["CtsExampleTestCases"]);
        let run = sink.latest("CtsExampleTestCases").unwrap();
        assert_eq!(run.expected_count, 3);
        assert_eq!(run.count_status(TestStatus::Pass), 3);
        assert_eq!(sink.run_names().count(), 1);
    }

    #[tokio::test]
    async fn short_count_adds_module_incomplete_failure() {
        let mut module = ModuleDefinition::new(
            "CtsShort",
            vec![Box::new(Fixed { name: "unit", announced: 3, cases: vec!["a"] })],
        );
        let mut sink = CollectingListener::new();
        let outcome = module
            .run(&InvocationContext::new(Vec::new()), &mut sink, None)
            .await
            .unwrap();
        assert!(outcome.is_failed());
        assert!(
            outcome
                .result
                .run_failures
                .iter()
                .any(|f| f.message == MODULE_INCOMPLETE_MESSAGE)
        );
    }

    #[tokio::test]
    async fn over_count_adds_module_incomplete_failure() {
        let mut module = ModuleDefinition::new(
            "CtsOver",
            vec![Box::new(Fixed { name: "unit", announced: 1, cases: vec!["a", "b", "c"] })],
        );
        let mut sink = CollectingListener::new();
        let outcome = module
            .run(&InvocationContext::new(Vec::new()), &mut sink, None)
            .await
            .unwrap();

        assert_eq!(outcome.result.expected_count, 1);
        assert_eq!(outcome.result.num_tests(), 3);
        assert!(outcome.is_failed());
        let failure = outcome
            .result
            .run_failures
            .iter()
            .find(|f| f.message == MODULE_INCOMPLETE_MESSAGE)
            .expect("count mismatch reported");
        assert_eq!(failure.cause.as_deref(), Some("expected 1 tests, observed 3"));
    }

    #[tokio::test]
    async fn setup_failure_reports_synthetic_case_and_tears_down() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let preparers: Vec<Box<dyn MultiTargetPreparer>> = vec![
            Box::new(Prep { name: "first", fail_setup: true, journal: journal.clone() }),
            Box::new(Prep { name: "second", fail_setup: false, journal: journal.clone() }),
        ];
        let mut module = ModuleDefinition::new(
            "CtsBroken",
            vec![Box::new(Fixed { name: "unit", announced: 1, cases: vec!["a"] })],
        )
        .with_pipeline(PreparationPipeline::new(preparers, Vec::new()));

        let mut sink = CollectingListener::new();
        let outcome = module
            .run(&InvocationContext::new(Vec::new()), &mut sink, None)
            .await
            .unwrap();

        assert!(outcome.preparation_failed);
        let run = sink.latest("CtsBroken").unwrap();
        assert_eq!(run.num_tests(), 1);
        let id = TestDescription::new("CtsBroken", PREPARATION_ERROR_METHOD);
        assert_eq!(id.to_string(), "CtsBroken#PreparationError");
        assert_eq!(run.tests[&id].status, TestStatus::Fail);
        assert_eq!(*journal.lock().unwrap(), vec!["setup:first", "teardown:second", "teardown:first"]);
    }

    #[tokio::test]
    async fn module_runs_only_once() {
        let mut module = ModuleDefinition::new("CtsOnce", Vec::new());
        let ctx = InvocationContext::new(Vec::new());
        let mut sink = CollectingListener::new();
        module.run(&ctx, &mut sink, None).await.unwrap();
        let err = module.run(&ctx, &mut sink, None).await.unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));
    }
}
