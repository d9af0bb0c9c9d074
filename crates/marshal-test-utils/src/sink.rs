//! A result sink keeping the raw event stream.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use marshal_core::LogStream;
use marshal_suite::listener::ResultSink;
use marshal_suite::result::{FailureDescription, Metrics, TestDescription};

/// One event received by a [`RecordingSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    /// `module_started`.
    ModuleStarted(String),
    /// `module_ended`.
    ModuleEnded,
    /// `run_started`.
    RunStarted {
        /// Run name.
        name: String,
        /// Announced case count.
        expected_count: usize,
        /// Attempt number.
        attempt: u32,
    },
    /// `test_started`.
    TestStarted(TestDescription),
    /// `test_failed`.
    TestFailed(TestDescription),
    /// `test_assumption_failure`.
    TestAssumptionFailure(TestDescription),
    /// `test_ignored`.
    TestIgnored(TestDescription),
    /// `test_ended`.
    TestEnded(TestDescription),
    /// `run_failed`.
    RunFailed(FailureDescription),
    /// `run_ended`.
    RunEnded,
    /// `test_log`.
    Log(String),
}

/// Records every event in arrival order.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    events: Vec<SinkEvent>,
}

impl RecordingSink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every event in order.
    pub fn events(&self) -> &[SinkEvent] {
        &self.events
    }

    /// Returns the names of logged artifacts, in order.
    pub fn log_names(&self) -> Vec<&str> {
        self.events
            .iter()
            .filter_map(|e| match e {
                SinkEvent::Log(name) => Some(name.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Returns the run failures received, in order.
    pub fn run_failures(&self) -> Vec<&FailureDescription> {
        self.events
            .iter()
            .filter_map(|e| match e {
                SinkEvent::RunFailed(f) => Some(f),
                _ => None,
            })
            .collect()
    }

    /// Returns the position of the first event equal to `event`.
    pub fn position(&self, event: &SinkEvent) -> Option<usize> {
        self.events.iter().position(|e| e == event)
    }
}

#[async_trait]
impl ResultSink for RecordingSink {
    async fn module_started(&mut self, name: &str) {
        self.events.push(SinkEvent::ModuleStarted(name.to_string()));
    }

    async fn module_ended(&mut self) {
        self.events.push(SinkEvent::ModuleEnded);
    }

    async fn run_started(&mut self, name: &str, expected_count: usize, attempt: u32) {
        self.events.push(SinkEvent::RunStarted {
            name: name.to_string(),
            expected_count,
            attempt,
        });
    }

    async fn test_started(&mut self, test: &TestDescription, _started_at: DateTime<Utc>) {
        self.events.push(SinkEvent::TestStarted(test.clone()));
    }

    async fn test_failed(&mut self, test: &TestDescription, _trace: &str) {
        self.events.push(SinkEvent::TestFailed(test.clone()));
    }

    async fn test_assumption_failure(&mut self, test: &TestDescription, _trace: &str) {
        self.events.push(SinkEvent::TestAssumptionFailure(test.clone()));
    }

    async fn test_ignored(&mut self, test: &TestDescription) {
        self.events.push(SinkEvent::TestIgnored(test.clone()));
    }

    async fn test_ended(&mut self, test: &TestDescription, _ended_at: DateTime<Utc>, _metrics: &Metrics) {
        self.events.push(SinkEvent::TestEnded(test.clone()));
    }

    async fn run_failed(&mut self, failure: &FailureDescription) {
        self.events.push(SinkEvent::RunFailed(failure.clone()));
    }

    async fn run_ended(&mut self, _elapsed: Duration, _metrics: &Metrics) {
        self.events.push(SinkEvent::RunEnded);
    }

    async fn test_log(&mut self, name: &str, _stream: &LogStream) {
        self.events.push(SinkEvent::Log(name.to_string()));
    }
}
