//! Metric collectors attached to a module's units.
//!
//! Collectors are cloned fresh for every attempt so that nothing observed in
//! one attempt leaks into the next. A unit implementing
//! [`crate::unit::HasCollectors`] receives the clones and drives them itself;
//! every other unit gets its sink wrapped in a [`CollectorSink`].

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use marshal_core::LogStream;

use crate::listener::{LoggedArtifact, ResultSink};
use crate::result::{FailureDescription, Metrics, TestDescription};

/// Host-side collector adding metrics to cases and runs.
pub trait MetricCollector: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Disabled collectors are never cloned into an attempt.
    fn is_disabled(&self) -> bool {
        false
    }

    /// Returns a fresh copy for the next attempt.
    fn clone_box(&self) -> Box<dyn MetricCollector>;

    /// A run started.
    fn on_run_start(&mut self, _run_name: &str) {}

    /// A case started.
    fn on_test_start(&mut self, _test: &TestDescription) {}

    /// A case ended; may add to `metrics`.
    fn on_test_end(&mut self, _test: &TestDescription, _metrics: &mut Metrics) {}

    /// The run ended; may add to `metrics`.
    fn on_run_end(&mut self, _metrics: &mut Metrics) {}
}

/// Clones every enabled collector for one attempt.
#[must_use]
pub fn clone_for_attempt(collectors: &[Box<dyn MetricCollector>]) -> Vec<Box<dyn MetricCollector>> {
    collectors
        .iter()
        .filter(|c| !c.is_disabled())
        .map(|c| c.clone_box())
        .collect()
}

/// Wraps a sink so that collectors see every event first.
pub struct CollectorSink<'a> {
    inner: &'a mut dyn ResultSink,
    collectors: Vec<Box<dyn MetricCollector>>,
}

impl<'a> CollectorSink<'a> {
    /// Wraps `inner` with the given collectors.
    #[must_use]
    pub fn new(inner: &'a mut dyn ResultSink, collectors: Vec<Box<dyn MetricCollector>>) -> Self {
        Self { inner, collectors }
    }
}

#[async_trait]
impl<'a> ResultSink for CollectorSink<'a> {
    async fn module_started(&mut self, name: &str) {
        self.inner.module_started(name).await;
    }

    async fn module_ended(&mut self) {
        self.inner.module_ended().await;
    }

    async fn run_started(&mut self, name: &str, expected_count: usize, attempt: u32) {
        for c in &mut self.collectors {
            c.on_run_start(name);
        }
        self.inner.run_started(name, expected_count, attempt).await;
    }

    async fn test_started(&mut self, test: &TestDescription, started_at: DateTime<Utc>) {
        for c in &mut self.collectors {
            c.on_test_start(test);
        }
        self.inner.test_started(test, started_at).await;
    }

    async fn test_failed(&mut self, test: &TestDescription, trace: &str) {
        self.inner.test_failed(test, trace).await;
    }

    async fn test_assumption_failure(&mut self, test: &TestDescription, trace: &str) {
        self.inner.test_assumption_failure(test, trace).await;
    }

    async fn test_ignored(&mut self, test: &TestDescription) {
        self.inner.test_ignored(test).await;
    }

    async fn test_ended(&mut self, test: &TestDescription, ended_at: DateTime<Utc>, metrics: &Metrics) {
        let mut metrics = metrics.clone();
        for c in &mut self.collectors {
            c.on_test_end(test, &mut metrics);
        }
        self.inner.test_ended(test, ended_at, &metrics).await;
    }

    async fn run_failed(&mut self, failure: &FailureDescription) {
        self.inner.run_failed(failure).await;
    }

    async fn run_ended(&mut self, elapsed: Duration, metrics: &Metrics) {
        let mut metrics = metrics.clone();
        for c in &mut self.collectors {
            c.on_run_end(&mut metrics);
        }
        self.inner.run_ended(elapsed, &metrics).await;
    }

    async fn test_log(&mut self, name: &str, stream: &LogStream) {
        self.inner.test_log(name, stream).await;
    }

    fn take_pending_logs(&mut self) -> Vec<LoggedArtifact> {
        self.inner.take_pending_logs()
    }
}
