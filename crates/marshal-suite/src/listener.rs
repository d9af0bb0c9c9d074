//! The result listener protocol.
//!
//! Test units report through [`ResultSink`]: a run is bracketed by
//! `run_started`/`run_ended`, each case by `test_started`/`test_ended`, with
//! status events in between. Named binary artifacts travel through
//! `test_log`, independent of result aggregation.
//!
//! ## Sinks in this module
//!
//! - [`ResultForwarder`]: fans every event out to an ordered list of sinks.
//! - [`CollectingListener`]: aggregates events into [`RunResult`]s keyed by
//!   run name and attempt.
//! - [`SharedCollector`] / [`ShardSink`]: one aggregator fed by several
//!   concurrently running shards.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use marshal_core::LogStream;

use crate::merge::{MergeStrategy, merge_attempts};
use crate::result::{
    FailureDescription, INCOMPLETE_TEST_TRACE, Metrics, RunResult, TestCaseResult,
    TestDescription, TestStatus,
};

/// A named artifact waiting to be forwarded to sibling sinks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedArtifact {
    /// Artifact name.
    pub name: String,
    /// Captured data.
    pub stream: LogStream,
}

impl LoggedArtifact {
    /// Creates a new artifact.
    #[must_use]
    pub fn new(name: impl Into<String>, stream: LogStream) -> Self {
        Self {
            name: name.into(),
            stream,
        }
    }
}

/// Receiver of test lifecycle events.
///
/// Every method has a no-op default so that sinks only implement what they
/// care about.
#[async_trait]
pub trait ResultSink: Send {
    /// A module started.
    async fn module_started(&mut self, _name: &str) {}

    /// The current module ended.
    async fn module_ended(&mut self) {}

    /// A run started. `expected_count` is the number of cases the run will report.
    async fn run_started(&mut self, _name: &str, _expected_count: usize, _attempt: u32) {}

    /// A case started.
    async fn test_started(&mut self, _test: &TestDescription, _started_at: DateTime<Utc>) {}

    /// A case failed.
    async fn test_failed(&mut self, _test: &TestDescription, _trace: &str) {}

    /// A precondition of a case did not hold.
    async fn test_assumption_failure(&mut self, _test: &TestDescription, _trace: &str) {}

    /// A case was skipped.
    async fn test_ignored(&mut self, _test: &TestDescription) {}

    /// A case ended.
    async fn test_ended(
        &mut self,
        _test: &TestDescription,
        _ended_at: DateTime<Utc>,
        _metrics: &Metrics,
    ) {
    }

    /// The current run failed as a whole.
    async fn run_failed(&mut self, _failure: &FailureDescription) {}

    /// The current run ended.
    async fn run_ended(&mut self, _elapsed: Duration, _metrics: &Metrics) {}

    /// A named artifact was captured.
    async fn test_log(&mut self, _name: &str, _stream: &LogStream) {}

    /// Artifacts this sink produced that its siblings should receive.
    fn take_pending_logs(&mut self) -> Vec<LoggedArtifact> {
        Vec::new()
    }
}

/// Replays a finished run into a sink, case by case.
///
/// INCOMPLETE cases are reported as failed with [`INCOMPLETE_TEST_TRACE`] and
/// then ended, so no receiver is left with a dangling started case.
pub async fn report_run(sink: &mut dyn ResultSink, run: &RunResult) {
    sink.run_started(&run.name, run.expected_count, run.attempt)
        .await;
    for case in run.tests.values() {
        sink.test_started(&case.description, case.started_at).await;
        let trace = case.message.as_deref().unwrap_or_default();
        match case.status {
            TestStatus::Pass => {}
            TestStatus::Fail => sink.test_failed(&case.description, trace).await,
            TestStatus::AssumptionFailure => {
                sink.test_assumption_failure(&case.description, trace).await;
            }
            TestStatus::Ignored => sink.test_ignored(&case.description).await,
            TestStatus::Incomplete => {
                sink.test_failed(&case.description, INCOMPLETE_TEST_TRACE).await;
            }
        }
        let ended_at = case.ended_at.unwrap_or(case.started_at);
        sink.test_ended(&case.description, ended_at, &case.metrics)
            .await;
    }
    for failure in &run.run_failures {
        sink.run_failed(failure).await;
    }
    sink.run_ended(run.elapsed, &run.metrics).await;
}

/// Fans events out to an ordered list of sinks.
///
/// After each event, artifacts pending on any sink are delivered to every
/// other sink, so a diagnostics sink can publish what it captured without
/// holding a reference to its siblings.
pub struct ResultForwarder<'a> {
    sinks: Vec<&'a mut dyn ResultSink>,
}

impl<'a> ResultForwarder<'a> {
    /// Creates a forwarder over the given sinks, called in order.
    #[must_use]
    pub fn new(sinks: Vec<&'a mut dyn ResultSink>) -> Self {
        Self { sinks }
    }

    /// Returns the number of sinks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// Returns true if there are no sinks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    async fn flush_pending(&mut self) {
        let mut pending = Vec::new();
        for (origin, sink) in self.sinks.iter_mut().enumerate() {
            pending.extend(sink.take_pending_logs().into_iter().map(|log| (origin, log)));
        }
        for (origin, log) in pending {
            for (index, sink) in self.sinks.iter_mut().enumerate() {
                if index != origin {
                    sink.test_log(&log.name, &log.stream).await;
                }
            }
        }
    }
}

#[async_trait]
impl<'a> ResultSink for ResultForwarder<'a> {
    async fn module_started(&mut self, name: &str) {
        for sink in &mut self.sinks {
            sink.module_started(name).await;
        }
        self.flush_pending().await;
    }

    async fn module_ended(&mut self) {
        for sink in &mut self.sinks {
            sink.module_ended().await;
        }
        self.flush_pending().await;
    }

    async fn run_started(&mut self, name: &str, expected_count: usize, attempt: u32) {
        for sink in &mut self.sinks {
            sink.run_started(name, expected_count, attempt).await;
        }
        self.flush_pending().await;
    }

    async fn test_started(&mut self, test: &TestDescription, started_at: DateTime<Utc>) {
        for sink in &mut self.sinks {
            sink.test_started(test, started_at).await;
        }
        self.flush_pending().await;
    }

    async fn test_failed(&mut self, test: &TestDescription, trace: &str) {
        for sink in &mut self.sinks {
            sink.test_failed(test, trace).await;
        }
        self.flush_pending().await;
    }

    async fn test_assumption_failure(&mut self, test: &TestDescription, trace: &str) {
        for sink in &mut self.sinks {
            sink.test_assumption_failure(test, trace).await;
        }
        self.flush_pending().await;
    }

    async fn test_ignored(&mut self, test: &TestDescription) {
        for sink in &mut self.sinks {
            sink.test_ignored(test).await;
        }
        self.flush_pending().await;
    }

    async fn test_ended(&mut self, test: &TestDescription, ended_at: DateTime<Utc>, metrics: &Metrics) {
        for sink in &mut self.sinks {
            sink.test_ended(test, ended_at, metrics).await;
        }
        self.flush_pending().await;
    }

    async fn run_failed(&mut self, failure: &FailureDescription) {
        for sink in &mut self.sinks {
            sink.run_failed(failure).await;
        }
        self.flush_pending().await;
    }

    async fn run_ended(&mut self, elapsed: Duration, metrics: &Metrics) {
        for sink in &mut self.sinks {
            sink.run_ended(elapsed, metrics).await;
        }
        self.flush_pending().await;
    }

    async fn test_log(&mut self, name: &str, stream: &LogStream) {
        for sink in &mut self.sinks {
            sink.test_log(name, stream).await;
        }
    }
}

/// Aggregates events into [`RunResult`]s keyed by run name.
///
/// A run that is started again under the same name before it ended keeps
/// accumulating into the same result, and its expected count grows by the
/// newly announced amount. A run started again after it ended becomes a new
/// attempt with the next attempt number.
///
/// A collector created with [`CollectingListener::for_attempt`] pins every
/// run to one attempt; restarting an ended run reopens it instead.
#[derive(Debug, Clone, Default)]
pub struct CollectingListener {
    runs: IndexMap<String, Vec<RunResult>>,
    current: Option<String>,
    fixed_attempt: Option<u32>,
    modules: Vec<String>,
    logs: Vec<LoggedArtifact>,
}

impl CollectingListener {
    /// Creates an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a collector that records every run under `attempt`.
    #[must_use]
    pub fn for_attempt(attempt: u32) -> Self {
        Self {
            fixed_attempt: Some(attempt),
            ..Self::default()
        }
    }

    /// Returns the run names in first-seen order.
    pub fn run_names(&self) -> impl Iterator<Item = &str> {
        self.runs.keys().map(String::as_str)
    }

    /// Returns every recorded attempt of `name`, oldest first.
    #[must_use]
    pub fn attempts(&self, name: &str) -> &[RunResult] {
        self.runs.get(name).map_or(&[], Vec::as_slice)
    }

    /// Returns every recorded run, grouped by name.
    pub fn all_runs(&self) -> impl Iterator<Item = &RunResult> {
        self.runs.values().flatten()
    }

    /// Returns the latest attempt of `name`.
    #[must_use]
    pub fn latest(&self, name: &str) -> Option<&RunResult> {
        self.runs.get(name).and_then(|r| r.last())
    }

    /// Returns the names of modules seen, in order.
    #[must_use]
    pub fn modules(&self) -> &[String] {
        &self.modules
    }

    /// Returns the artifacts received.
    #[must_use]
    pub fn logs(&self) -> &[LoggedArtifact] {
        &self.logs
    }

    /// Returns true while a run is open.
    #[must_use]
    pub fn has_open_run(&self) -> bool {
        self.current.is_some()
    }

    /// Returns the open run.
    #[must_use]
    pub fn current_run(&self) -> Option<&RunResult> {
        let name = self.current.as_ref()?;
        self.runs.get(name).and_then(|r| r.last())
    }

    /// Returns true if any recorded run failed.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.all_runs().any(RunResult::is_failed)
    }

    /// Merges the attempts of every run with `strategy`, in first-seen order.
    #[must_use]
    pub fn merged(&self, strategy: MergeStrategy) -> Vec<RunResult> {
        self.runs
            .values()
            .filter_map(|attempts| merge_attempts(attempts, strategy))
            .collect()
    }

    /// Consumes the collector and returns every run in order.
    #[must_use]
    pub fn into_runs(self) -> Vec<RunResult> {
        self.runs.into_values().flatten().collect()
    }

    /// Removes and returns every ended run.
    pub fn take_completed(&mut self) -> Vec<RunResult> {
        let mut completed = Vec::new();
        for attempts in self.runs.values_mut() {
            let (done, open): (Vec<_>, Vec<_>) = attempts.drain(..).partition(|r| r.complete);
            completed.extend(done);
            *attempts = open;
        }
        self.runs.retain(|_, attempts| !attempts.is_empty());
        completed
    }

    /// Appends a finished run, renumbering its attempt if needed.
    pub fn push_completed(&mut self, mut run: RunResult) {
        let attempts = self.runs.entry(run.name.clone()).or_default();
        if let Some(last) = attempts.last() {
            if last.attempt >= run.attempt {
                run.attempt = last.attempt + 1;
            }
        }
        attempts.push(run);
    }

    /// Records a module start.
    pub fn on_module_started(&mut self, name: &str) {
        self.modules.push(name.to_string());
    }

    /// Opens (or reopens) a run.
    pub fn on_run_started(&mut self, name: &str, expected_count: usize, attempt: u32) {
        if let Some(open) = self.current.as_deref() {
            if open != name {
                tracing::warn!(open, new = name, "run started while another run is open");
            }
        }
        let fixed = self.fixed_attempt;
        let attempts = self.runs.entry(name.to_string()).or_default();
        match attempts.last_mut() {
            Some(last) if !last.complete => {
                last.expected_count += expected_count;
            }
            Some(last) if fixed.is_some_and(|a| a == last.attempt) => {
                last.complete = false;
                last.expected_count += expected_count;
            }
            last => {
                let mut number = fixed.unwrap_or(attempt);
                if let Some(last) = last {
                    if last.attempt >= number {
                        number = last.attempt + 1;
                    }
                }
                attempts.push(RunResult::new(name, expected_count, number));
            }
        }
        self.current = Some(name.to_string());
    }

    fn open_run_mut(&mut self) -> Option<&mut RunResult> {
        let name = self.current.as_ref()?;
        self.runs.get_mut(name).and_then(|r| r.last_mut())
    }

    fn case_mut(&mut self, test: &TestDescription) -> Option<&mut TestCaseResult> {
        let Some(run) = self.open_run_mut() else {
            tracing::warn!(test = %test, "test event received with no open run");
            return None;
        };
        let case = run.tests.get_mut(test);
        if case.is_none() {
            tracing::warn!(test = %test, "test event received for a case that never started");
        }
        case
    }

    /// Records a case start.
    pub fn on_test_started(&mut self, test: &TestDescription, started_at: DateTime<Utc>) {
        if let Some(run) = self.open_run_mut() {
            run.tests
                .insert(test.clone(), TestCaseResult::started(test.clone(), started_at));
        } else {
            tracing::warn!(test = %test, "test started with no open run");
        }
    }

    /// Records a case status other than PASS.
    pub fn on_test_status(&mut self, test: &TestDescription, status: TestStatus, trace: Option<&str>) {
        if let Some(case) = self.case_mut(test) {
            case.status = status;
            case.message = trace.filter(|t| !t.is_empty()).map(str::to_string);
        }
    }

    /// Records a case end. A case with no status event passed.
    pub fn on_test_ended(&mut self, test: &TestDescription, ended_at: DateTime<Utc>, metrics: &Metrics) {
        if let Some(case) = self.case_mut(test) {
            if case.status == TestStatus::Incomplete {
                case.status = TestStatus::Pass;
            }
            case.ended_at = Some(ended_at);
            case.metrics.extend(metrics.clone());
        }
    }

    /// Records a run-level failure on the open run.
    pub fn on_run_failed(&mut self, failure: &FailureDescription) {
        if let Some(run) = self.open_run_mut() {
            run.add_run_failure(failure.clone());
        } else {
            tracing::warn!(failure = %failure, "run failure received with no open run");
        }
    }

    /// Closes the open run.
    pub fn on_run_ended(&mut self, elapsed: Duration, metrics: &Metrics) {
        if let Some(run) = self.open_run_mut() {
            run.elapsed += elapsed;
            run.metrics.extend(metrics.clone());
            run.complete = true;
        }
        self.current = None;
    }

    /// Records an artifact.
    pub fn on_test_log(&mut self, name: &str, stream: &LogStream) {
        self.logs.push(LoggedArtifact::new(name, stream.clone()));
    }
}

#[async_trait]
impl ResultSink for CollectingListener {
    async fn module_started(&mut self, name: &str) {
        self.on_module_started(name);
    }

    async fn run_started(&mut self, name: &str, expected_count: usize, attempt: u32) {
        self.on_run_started(name, expected_count, attempt);
    }

    async fn test_started(&mut self, test: &TestDescription, started_at: DateTime<Utc>) {
        self.on_test_started(test, started_at);
    }

    async fn test_failed(&mut self, test: &TestDescription, trace: &str) {
        self.on_test_status(test, TestStatus::Fail, Some(trace));
    }

    async fn test_assumption_failure(&mut self, test: &TestDescription, trace: &str) {
        self.on_test_status(test, TestStatus::AssumptionFailure, Some(trace));
    }

    async fn test_ignored(&mut self, test: &TestDescription) {
        self.on_test_status(test, TestStatus::Ignored, None);
    }

    async fn test_ended(&mut self, test: &TestDescription, ended_at: DateTime<Utc>, metrics: &Metrics) {
        self.on_test_ended(test, ended_at, metrics);
    }

    async fn run_failed(&mut self, failure: &FailureDescription) {
        self.on_run_failed(failure);
    }

    async fn run_ended(&mut self, elapsed: Duration, metrics: &Metrics) {
        self.on_run_ended(elapsed, metrics);
    }

    async fn test_log(&mut self, name: &str, stream: &LogStream) {
        self.on_test_log(name, stream);
    }
}

/// One aggregator shared by concurrently running shards.
#[derive(Debug, Clone, Default)]
pub struct SharedCollector {
    inner: Arc<tokio::sync::Mutex<CollectingListener>>,
}

impl SharedCollector {
    /// Creates an empty shared collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the sink one shard reports into.
    #[must_use]
    pub fn shard_sink(&self, shard_index: u32) -> ShardSink {
        ShardSink {
            shard_index,
            local: CollectingListener::new(),
            shared: self.clone(),
        }
    }

    /// Returns a copy of everything collected so far.
    pub async fn snapshot(&self) -> CollectingListener {
        self.inner.lock().await.clone()
    }
}

/// Buffers one shard's events and publishes each run once it ends.
///
/// Runs from different shards never interleave in the shared collector.
/// Artifacts are published immediately.
#[derive(Debug)]
pub struct ShardSink {
    shard_index: u32,
    local: CollectingListener,
    shared: SharedCollector,
}

impl ShardSink {
    /// Returns the shard this sink belongs to.
    #[must_use]
    pub const fn shard_index(&self) -> u32 {
        self.shard_index
    }
}

#[async_trait]
impl ResultSink for ShardSink {
    async fn module_started(&mut self, name: &str) {
        self.shared.inner.lock().await.on_module_started(name);
    }

    async fn run_started(&mut self, name: &str, expected_count: usize, attempt: u32) {
        self.local.on_run_started(name, expected_count, attempt);
    }

    async fn test_started(&mut self, test: &TestDescription, started_at: DateTime<Utc>) {
        self.local.on_test_started(test, started_at);
    }

    async fn test_failed(&mut self, test: &TestDescription, trace: &str) {
        self.local.on_test_status(test, TestStatus::Fail, Some(trace));
    }

    async fn test_assumption_failure(&mut self, test: &TestDescription, trace: &str) {
        self.local
            .on_test_status(test, TestStatus::AssumptionFailure, Some(trace));
    }

    async fn test_ignored(&mut self, test: &TestDescription) {
        self.local.on_test_status(test, TestStatus::Ignored, None);
    }

    async fn test_ended(&mut self, test: &TestDescription, ended_at: DateTime<Utc>, metrics: &Metrics) {
        self.local.on_test_ended(test, ended_at, metrics);
    }

    async fn run_failed(&mut self, failure: &FailureDescription) {
        self.local.on_run_failed(failure);
    }

    async fn run_ended(&mut self, elapsed: Duration, metrics: &Metrics) {
        self.local.on_run_ended(elapsed, metrics);
        let completed = self.local.take_completed();
        let mut shared = self.shared.inner.lock().await;
        for run in completed {
            tracing::debug!(shard_index = self.shard_index, run = %run.name, "publishing shard run");
            shared.push_completed(run);
        }
    }

    async fn test_log(&mut self, name: &str, stream: &LogStream) {
        self.shared.inner.lock().await.on_test_log(name, stream);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marshal_core::LogDataType;

    use crate::result::FailureStatus;

    fn id(method: &str) -> TestDescription {
        TestDescription::new("com.example.FooTest", method)
    }

    async fn pass(sink: &mut dyn ResultSink, method: &str) {
        sink.test_started(&id(method), Utc::now()).await;
        sink.test_ended(&id(method), Utc::now(), &Metrics::new()).await;
    }

    #[tokio::test]
    async fn collector_builds_run_result() {
        let mut collector = CollectingListener::new();
        collector.run_started("CtsFoo", 3, 0).await;
        pass(&mut collector, "a").await;
        collector.test_started(&id("b"), Utc::now()).await;
        collector.test_failed(&id("b"), "assertion failed").await;
        collector.test_ended(&id("b"), Utc::now(), &Metrics::new()).await;
        collector.test_started(&id("c"), Utc::now()).await;
        collector.run_failed(&FailureDescription::new(FailureStatus::InfraFailure, "crash")).await;
        collector.run_ended(Duration::from_millis(20), &Metrics::new()).await;

        let run = collector.latest("CtsFoo").unwrap();
        assert!(run.complete);
        assert_eq!(run.count_status(TestStatus::Pass), 1);
        assert_eq!(run.tests[&id("b")].status, TestStatus::Fail);
        assert_eq!(run.tests[&id("b")].message.as_deref(), Some("assertion failed"));
        assert_eq!(run.tests[&id("c")].status, TestStatus::Incomplete);
        assert!(run.is_run_failure());
        assert!(!collector.has_open_run());
    }

    #[tokio::test]
    async fn incomplete_run_accumulates_expected_count() {
        let mut collector = CollectingListener::new();
        collector.run_started("CtsFoo", 2, 0).await;
        pass(&mut collector, "a").await;
        collector.run_started("CtsFoo", 3, 0).await;
        pass(&mut collector, "b").await;
        collector.run_ended(Duration::ZERO, &Metrics::new()).await;

        assert_eq!(collector.attempts("CtsFoo").len(), 1);
        let run = collector.latest("CtsFoo").unwrap();
        assert_eq!(run.expected_count, 5);
        assert_eq!(run.num_tests(), 2);
    }

    #[tokio::test]
    async fn restarted_complete_run_is_next_attempt() {
        let mut collector = CollectingListener::new();
        for _ in 0..2 {
            collector.run_started("CtsFoo", 1, 0).await;
            pass(&mut collector, "a").await;
            collector.run_ended(Duration::ZERO, &Metrics::new()).await;
        }
        let attempts: Vec<u32> = collector.attempts("CtsFoo").iter().map(|r| r.attempt).collect();
        assert_eq!(attempts, vec![0, 1]);
    }

    #[tokio::test]
    async fn fixed_attempt_collector_reopens_run() {
        let mut collector = CollectingListener::for_attempt(2);
        for method in ["a", "b"] {
            collector.run_started("CtsFoo", 1, 0).await;
            pass(&mut collector, method).await;
            collector.run_ended(Duration::ZERO, &Metrics::new()).await;
        }
        let runs = collector.into_runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].attempt, 2);
        assert_eq!(runs[0].expected_count, 2);
    }

    #[tokio::test]
    async fn events_without_open_run_are_dropped() {
        let mut collector = CollectingListener::new();
        pass(&mut collector, "a").await;
        collector.run_failed(&FailureDescription::new(FailureStatus::InfraFailure, "x")).await;
        assert_eq!(collector.all_runs().count(), 0);
    }

    struct Producer {
        pending: Vec<LoggedArtifact>,
    }

    #[async_trait]
    impl ResultSink for Producer {
        async fn test_failed(&mut self, test: &TestDescription, _trace: &str) {
            self.pending.push(LoggedArtifact::new(
                format!("{test}-screenshot"),
                LogStream::new(LogDataType::Screenshot, "png"),
            ));
        }

        fn take_pending_logs(&mut self) -> Vec<LoggedArtifact> {
            std::mem::take(&mut self.pending)
        }
    }

    #[tokio::test]
    async fn forwarder_delivers_pending_logs_to_siblings() {
        let mut collector = CollectingListener::new();
        let mut producer = Producer { pending: Vec::new() };
        {
            let sinks: Vec<&mut dyn ResultSink> = vec![&mut collector, &mut producer];
            let mut forwarder = ResultForwarder::new(sinks);
            forwarder.run_started("CtsFoo", 1, 0).await;
            forwarder.test_started(&id("a"), Utc::now()).await;
            forwarder.test_failed(&id("a"), "boom").await;
            forwarder.test_ended(&id("a"), Utc::now(), &Metrics::new()).await;
            forwarder.run_ended(Duration::ZERO, &Metrics::new()).await;
        }
        assert_eq!(collector.logs().len(), 1);
        assert_eq!(collector.logs()[0].name, "com.example.FooTest#a-screenshot");
        assert!(collector.has_failures());
    }

    #[tokio::test]
    async fn report_run_preserves_statuses() {
        let mut source = CollectingListener::new();
        source.run_started("CtsFoo", 3, 0).await;
        pass(&mut source, "a").await;
        source.test_started(&id("b"), Utc::now()).await;
        source.test_ignored(&id("b")).await;
        source.test_ended(&id("b"), Utc::now(), &Metrics::new()).await;
        source.test_started(&id("c"), Utc::now()).await;
        source.run_ended(Duration::from_secs(1), &Metrics::new()).await;
        let original = source.latest("CtsFoo").unwrap().clone();

        let mut replayed = CollectingListener::new();
        report_run(&mut replayed, &original).await;
        let run = replayed.latest("CtsFoo").unwrap();
        assert_eq!(run.tests[&id("a")], original.tests[&id("a")]);
        assert_eq!(run.tests[&id("b")], original.tests[&id("b")]);
        assert_eq!(run.expected_count, 3);
    }

    #[tokio::test]
    async fn report_run_ends_incomplete_cases_as_failures() {
        let mut source = CollectingListener::new();
        source.run_started("CtsFoo", 2, 0).await;
        pass(&mut source, "a").await;
        source.test_started(&id("b"), Utc::now()).await;
        source.run_ended(Duration::from_secs(1), &Metrics::new()).await;
        let original = source.latest("CtsFoo").unwrap().clone();
        assert_eq!(original.tests[&id("b")].status, TestStatus::Incomplete);

        let mut replayed = CollectingListener::new();
        report_run(&mut replayed, &original).await;
        let b = &replayed.latest("CtsFoo").unwrap().tests[&id("b")];
        assert_eq!(b.status, TestStatus::Fail);
        assert_eq!(b.message.as_deref(), Some(INCOMPLETE_TEST_TRACE));
        assert_eq!(b.ended_at, Some(b.started_at));
    }

    #[tokio::test]
    async fn shard_sinks_publish_whole_runs() {
        let shared = SharedCollector::new();
        let mut first = shared.shard_sink(0);
        let mut second = shared.shard_sink(1);

        first.run_started("ModuleA", 1, 0).await;
        second.run_started("ModuleB", 1, 0).await;
        pass(&mut first, "a").await;
        pass(&mut second, "b").await;
        assert_eq!(shared.snapshot().await.all_runs().count(), 0);

        second.run_ended(Duration::ZERO, &Metrics::new()).await;
        first.run_ended(Duration::ZERO, &Metrics::new()).await;

        let snapshot = shared.snapshot().await;
        let names: Vec<&str> = snapshot.run_names().collect();
        assert_eq!(names, vec!["ModuleB", "ModuleA"]);
        assert_eq!(first.shard_index(), 0);
    }
}
