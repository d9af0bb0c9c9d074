//! Cross-invocation retry.
//!
//! [`RetryRescheduler`] reads the record of a previous invocation and builds a
//! reduced one: the original command line without its sharding options, an
//! exclude filter for everything that does not need to run again, and a
//! [`ResultsPlayer`] that replays the excluded results first so the final
//! report covers the same scope as the original.
//!
//! Exclude filters are either a module name, excluding the whole module, or
//! `"<module> <class>#<method>"`, excluding one case.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use marshal_core::InvocationContext;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::listener::{ResultSink, report_run};
use crate::result::{
    FailureDescription, FailureStatus, INCOMPLETE_TEST_TRACE, Metrics, RunResult, TestCaseResult,
    TestDescription, TestStatus,
};
use crate::suite::{ModuleSpec, SuiteRunner};
use crate::unit::{HasContext, TestUnit, UnitFault};

/// Options removed from the prior command line.
const SHARDING_OPTIONS: [&str; 2] = ["--shard-count", "--shard-index"];

const DEFAULT_READINESS_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Record of one case of a previous invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriorTestRecord {
    /// Class of the case.
    pub class_name: String,
    /// Method of the case.
    pub method_name: String,
    /// Final status.
    pub status: TestStatus,
    /// Failure trace or skip reason.
    #[serde(default)]
    pub message: Option<String>,
    /// When the case started.
    pub started_at: DateTime<Utc>,
    /// When the case ended.
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    /// Case metrics.
    #[serde(default)]
    pub metrics: Metrics,
}

/// Record of one module of a previous invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriorModuleRecord {
    /// Module name.
    pub name: String,
    /// Run-level failure message, if the module run failed.
    #[serde(default)]
    pub run_failure: Option<String>,
    /// Number of cases the module announced.
    #[serde(default)]
    pub expected_count: usize,
    /// Wall time of the module run.
    #[serde(default, with = "humantime_serde")]
    pub elapsed: Duration,
    /// Case records, in report order.
    #[serde(default)]
    pub tests: Vec<PriorTestRecord>,
}

impl PriorModuleRecord {
    /// Rebuilds the module's run result.
    #[must_use]
    pub fn to_run_result(&self) -> RunResult {
        let mut run = RunResult::new(self.name.clone(), self.expected_count, 0);
        for test in &self.tests {
            let description = TestDescription::new(test.class_name.clone(), test.method_name.clone());
            run.tests.insert(
                description.clone(),
                TestCaseResult {
                    description,
                    status: test.status,
                    message: test.message.clone(),
                    metrics: test.metrics.clone(),
                    started_at: test.started_at,
                    ended_at: test.ended_at,
                },
            );
        }
        if let Some(message) = &self.run_failure {
            run.add_run_failure(FailureDescription::new(FailureStatus::TestFailure, message.clone()));
        }
        run.elapsed = self.elapsed;
        run.complete = true;
        run
    }
}

/// The record of a previous invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriorRunRecord {
    /// The invocation's original command line.
    pub command_line: String,
    /// Module records, in report order.
    #[serde(default)]
    pub modules: Vec<PriorModuleRecord>,
}

impl PriorRunRecord {
    /// Parses a JSON record.
    ///
    /// # Errors
    ///
    /// Returns a rescheduler error if the JSON does not describe a record.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::rescheduler(format!("invalid prior run record: {e}")))
    }
}

/// Which prior outcomes are run again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetryType {
    /// Cases that failed.
    Failed,
    /// Cases that never completed, and modules that did not run all their cases.
    NotExecuted,
}

impl fmt::Display for RetryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed => f.write_str("FAILED"),
            Self::NotExecuted => f.write_str("NOT_EXECUTED"),
        }
    }
}

impl FromStr for RetryType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "failed" => Ok(Self::Failed),
            "not_executed" | "not-executed" => Ok(Self::NotExecuted),
            _ => Err(Error::configuration(format!(
                "retry type must be one of failed, not_executed (got {s})"
            ))),
        }
    }
}

/// How a prior case is classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorOutcome {
    /// The case failed.
    Failed,
    /// The case never completed.
    NotExecuted,
    /// Anything else: passed, assumption failure, ignored.
    Passed,
}

impl From<TestStatus> for PriorOutcome {
    fn from(status: TestStatus) -> Self {
        match status {
            TestStatus::Fail => Self::Failed,
            TestStatus::Incomplete => Self::NotExecuted,
            TestStatus::Pass | TestStatus::AssumptionFailure | TestStatus::Ignored => Self::Passed,
        }
    }
}

/// The reduced invocation built from a prior record.
#[derive(Debug)]
pub struct RescheduledInvocation {
    /// Original arguments without sharding options.
    pub args: Vec<String>,
    /// `args` joined back into a command line.
    pub command_line: String,
    /// Filters excluding what does not run again.
    pub exclude_filters: Vec<String>,
    /// Replays the excluded results.
    pub replay: ResultsPlayer,
}

impl RescheduledInvocation {
    /// Returns the invocation's units: the replay first, then `suite` with
    /// the exclude filters applied.
    #[must_use]
    pub fn into_test_units(self, mut suite: SuiteRunner) -> Vec<Box<dyn TestUnit>> {
        let specs = std::mem::take(suite.specs_mut());
        *suite.specs_mut() = apply_exclude_filters(&self.exclude_filters, specs);
        vec![Box::new(self.replay), Box::new(suite)]
    }
}

/// Applies module and case exclude filters to `specs`.
///
/// Whole-module filters drop the spec; case filters go to its filterable units.
#[must_use]
pub fn apply_exclude_filters(filters: &[String], specs: Vec<ModuleSpec>) -> Vec<ModuleSpec> {
    let excluded_modules: BTreeSet<&str> = filters
        .iter()
        .filter(|f| !f.contains(' '))
        .map(String::as_str)
        .collect();
    specs
        .into_iter()
        .filter(|spec| !excluded_modules.contains(spec.name.as_str()))
        .map(|mut spec| {
            for filter in filters {
                if let Some((module, test)) = filter.split_once(' ') {
                    if module == spec.name {
                        spec.add_exclude_filter(test);
                    }
                }
            }
            spec
        })
        .collect()
}

/// Builds a reduced invocation from a prior record.
#[derive(Debug, Clone)]
pub struct RetryRescheduler {
    retry_types: BTreeSet<RetryType>,
    excluded_modules: BTreeSet<String>,
}

impl Default for RetryRescheduler {
    fn default() -> Self {
        Self {
            retry_types: [RetryType::Failed, RetryType::NotExecuted].into_iter().collect(),
            excluded_modules: BTreeSet::new(),
        }
    }
}

impl RetryRescheduler {
    /// Reruns failed and not-executed cases.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reruns only cases of `retry_type`.
    #[must_use]
    pub fn with_retry_type(mut self, retry_type: RetryType) -> Self {
        self.retry_types = std::iter::once(retry_type).collect();
        self
    }

    /// Keeps the prior results of `module` instead of rerunning it.
    #[must_use]
    pub fn with_excluded_module(mut self, module: impl Into<String>) -> Self {
        self.excluded_modules.insert(module.into());
        self
    }

    fn should_run_test(&self, status: TestStatus) -> bool {
        match PriorOutcome::from(status) {
            PriorOutcome::Failed => self.retry_types.contains(&RetryType::Failed),
            PriorOutcome::NotExecuted => self.retry_types.contains(&RetryType::NotExecuted),
            PriorOutcome::Passed => false,
        }
    }

    fn should_run_module(&self, run: &RunResult) -> bool {
        if self.excluded_modules.contains(&run.name) {
            return false;
        }
        if self.retry_types.contains(&RetryType::NotExecuted)
            && (run.is_run_failure() || run.has_count_mismatch())
        {
            return true;
        }
        run.tests.values().any(|c| self.should_run_test(c.status))
    }

    /// Classifies the prior record and builds the reduced invocation.
    ///
    /// # Errors
    ///
    /// Returns a rescheduler error if the command line cannot be tokenized.
    #[tracing::instrument(skip_all, fields(modules = record.modules.len()))]
    pub fn reschedule(&self, record: &PriorRunRecord) -> Result<RescheduledInvocation> {
        let tokens = shlex::split(&record.command_line).ok_or_else(|| {
            Error::rescheduler(format!(
                "cannot tokenize prior command line: {}",
                record.command_line
            ))
        })?;
        let args = strip_sharding_options(tokens);
        let command_line = shlex::try_join(args.iter().map(String::as_str))
            .map_err(|e| Error::rescheduler(format!("cannot rebuild command line: {e}")))?;

        let mut exclude_filters = Vec::new();
        let mut replay = ResultsPlayer::new();
        let clears_run_failures = self.retry_types.contains(&RetryType::NotExecuted);
        for module in &record.modules {
            let run = module.to_run_result();
            if !self.should_run_module(&run) {
                tracing::debug!(module = %run.name, "keeping prior results of whole module");
                exclude_filters.push(run.name.clone());
                replay.add(run);
                continue;
            }
            let kept: IndexMap<TestDescription, TestCaseResult> = run
                .tests
                .iter()
                .filter(|(_, case)| !self.should_run_test(case.status))
                .map(|(id, case)| (id.clone(), case.clone()))
                .collect();
            tracing::debug!(module = %run.name, kept = kept.len(), rerun = run.num_tests() - kept.len(), "rescheduling module");
            for id in kept.keys() {
                exclude_filters.push(format!("{} {id}", run.name));
            }
            if kept.is_empty() {
                continue;
            }
            let mut partial = run;
            partial.expected_count = kept.len();
            partial.tests = kept;
            if clears_run_failures {
                partial.run_failures.clear();
            }
            replay.add(partial);
        }

        tracing::info!(
            filters = exclude_filters.len(),
            replayed_modules = replay.len(),
            "rescheduled prior invocation"
        );
        Ok(RescheduledInvocation {
            args,
            command_line,
            exclude_filters,
            replay,
        })
    }
}

fn strip_sharding_options(tokens: Vec<String>) -> Vec<String> {
    let mut args = Vec::with_capacity(tokens.len());
    let mut tokens = tokens.into_iter();
    while let Some(token) = tokens.next() {
        if SHARDING_OPTIONS.contains(&token.as_str()) {
            tokens.next();
            continue;
        }
        if SHARDING_OPTIONS
            .iter()
            .any(|option| token.strip_prefix(option).is_some_and(|rest| rest.starts_with('=')))
        {
            continue;
        }
        args.push(token);
    }
    args
}

/// Replays prior results verbatim, ahead of the rerun.
#[derive(Debug, Clone)]
pub struct ResultsPlayer {
    modules: Vec<RunResult>,
    readiness_timeout: Duration,
    ctx: Option<InvocationContext>,
}

impl Default for ResultsPlayer {
    fn default() -> Self {
        Self {
            modules: Vec::new(),
            readiness_timeout: DEFAULT_READINESS_TIMEOUT,
            ctx: None,
        }
    }
}

impl ResultsPlayer {
    /// Creates an empty player.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets how long to wait for each target before replaying.
    #[must_use]
    pub const fn with_readiness_timeout(mut self, timeout: Duration) -> Self {
        self.readiness_timeout = timeout;
        self
    }

    /// Queues a module run for replay.
    ///
    /// Cases that never completed are replayed as failures.
    pub fn add(&mut self, mut run: RunResult) {
        for case in run.tests.values_mut() {
            if case.status == TestStatus::Incomplete {
                case.status = TestStatus::Fail;
                case.message = Some(INCOMPLETE_TEST_TRACE.to_string());
                case.ended_at.get_or_insert(case.started_at);
            }
        }
        self.modules.push(run);
    }

    /// Returns the number of queued module runs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Returns the queued runs.
    #[must_use]
    pub fn modules(&self) -> &[RunResult] {
        &self.modules
    }
}

impl HasContext for ResultsPlayer {
    fn set_context(&mut self, ctx: InvocationContext) {
        self.ctx = Some(ctx);
    }
}

#[async_trait]
impl TestUnit for ResultsPlayer {
    fn name(&self) -> &str {
        "results-player"
    }

    fn as_has_context(&mut self) -> Option<&mut dyn HasContext> {
        Some(self)
    }

    async fn run(&mut self, sink: &mut dyn ResultSink) -> std::result::Result<(), UnitFault> {
        if let Some(ctx) = &self.ctx {
            for target in ctx.physical_targets() {
                target.wait_for_available(self.readiness_timeout).await?;
            }
        }

        let started = Instant::now();
        tracing::debug!(modules = self.modules.len(), "replaying prior results");
        for run in std::mem::take(&mut self.modules) {
            sink.module_started(&run.name).await;
            report_run(sink, &run).await;
            sink.module_ended().await;
        }
        tracing::debug!(elapsed = ?started.elapsed(), "done replaying prior results");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::CollectingListener;

    fn prior(method: &str, status: TestStatus) -> PriorTestRecord {
        PriorTestRecord {
            class_name: "FooTest".into(),
            method_name: method.into(),
            status,
            message: status.is_failed().then(|| "boom".to_string()),
            started_at: Utc::now(),
            ended_at: Some(Utc::now()),
            metrics: Metrics::new(),
        }
    }

    fn record() -> PriorRunRecord {
        PriorRunRecord {
            command_line: "cts --shard-count 2 --shard-index=1 -m 'Cts Foo'".into(),
            modules: vec![
                PriorModuleRecord {
                    name: "CtsPassing".into(),
                    run_failure: None,
                    expected_count: 2,
                    elapsed: Duration::from_secs(3),
                    tests: vec![prior("a", TestStatus::Pass), prior("b", TestStatus::Ignored)],
                },
                PriorModuleRecord {
                    name: "CtsMixed".into(),
                    run_failure: None,
                    expected_count: 3,
                    elapsed: Duration::from_secs(5),
                    tests: vec![
                        prior("a", TestStatus::Pass),
                        prior("b", TestStatus::Fail),
                        prior("c", TestStatus::Incomplete),
                    ],
                },
            ],
        }
    }

    #[test]
    fn sharding_options_are_stripped() {
        let rescheduled = RetryRescheduler::new().reschedule(&record()).unwrap();
        assert_eq!(rescheduled.args, vec!["cts", "-m", "Cts Foo"]);
        assert_eq!(shlex::split(&rescheduled.command_line), Some(rescheduled.args.clone()));
    }

    #[test]
    fn unbalanced_quotes_are_rejected() {
        let mut record = record();
        record.command_line = "cts -m 'unterminated".into();
        let err = RetryRescheduler::new().reschedule(&record).unwrap_err();
        assert!(matches!(err, Error::Rescheduler { .. }));
    }

    #[test]
    fn passed_modules_are_excluded_whole() {
        let rescheduled = RetryRescheduler::new().reschedule(&record()).unwrap();
        assert_eq!(
            rescheduled.exclude_filters,
            vec!["CtsPassing", "CtsMixed FooTest#a"]
        );
        assert_eq!(rescheduled.replay.len(), 2);
        let partial = &rescheduled.replay.modules()[1];
        assert_eq!(partial.num_tests(), 1);
        assert_eq!(partial.expected_count, 1);
    }

    #[test]
    fn retry_type_narrows_what_reruns() {
        let rescheduled = RetryRescheduler::new()
            .with_retry_type(RetryType::Failed)
            .reschedule(&record())
            .unwrap();
        assert!(rescheduled.exclude_filters.contains(&"CtsMixed FooTest#c".to_string()));
        let partial = &rescheduled.replay.modules()[1];
        let c = TestDescription::new("FooTest", "c");
        assert_eq!(partial.tests[&c].status, TestStatus::Fail);
        assert_eq!(partial.tests[&c].message.as_deref(), Some(INCOMPLETE_TEST_TRACE));
    }

    #[test]
    fn opted_out_modules_keep_prior_results() {
        let rescheduled = RetryRescheduler::new()
            .with_excluded_module("CtsMixed")
            .reschedule(&record())
            .unwrap();
        assert_eq!(rescheduled.exclude_filters, vec!["CtsPassing", "CtsMixed"]);
    }

    #[test]
    fn run_failure_triggers_not_executed_rerun() {
        let mut record = record();
        record.modules[0].run_failure = Some("instrumentation crashed".into());
        let rescheduled = RetryRescheduler::new().reschedule(&record).unwrap();
        assert!(!rescheduled.exclude_filters.contains(&"CtsPassing".to_string()));
        assert!(!rescheduled.replay.modules()[0].is_run_failure());

        let rescheduled = RetryRescheduler::new()
            .with_retry_type(RetryType::Failed)
            .reschedule(&record)
            .unwrap();
        assert!(rescheduled.exclude_filters.contains(&"CtsPassing".to_string()));
    }

    #[test]
    fn record_parses_from_json() {
        let original = record();
        let json = serde_json::to_string(&original).unwrap();
        assert_eq!(PriorRunRecord::from_json(&json).unwrap(), original);
        assert!(PriorRunRecord::from_json("{}").is_err());
    }

    #[test]
    fn retry_type_parses() {
        assert_eq!("failed".parse::<RetryType>().unwrap(), RetryType::Failed);
        assert_eq!("NOT_EXECUTED".parse::<RetryType>().unwrap(), RetryType::NotExecuted);
        assert!("flaky".parse::<RetryType>().is_err());
    }

    #[tokio::test]
    async fn player_replays_module_runs() {
        let rescheduled = RetryRescheduler::new().reschedule(&record()).unwrap();
        let mut player = rescheduled.replay;
        let mut sink = CollectingListener::new();
        player.run(&mut sink).await.unwrap();

        assert_eq!(sink.modules(), ["CtsPassing", "CtsMixed"]);
        let passing = sink.latest("CtsPassing").unwrap();
        assert_eq!(passing.count_status(TestStatus::Pass), 1);
        assert_eq!(passing.count_status(TestStatus::Ignored), 1);
        assert_eq!(passing.elapsed, Duration::from_secs(3));
        assert!(player.is_empty());
    }
}
