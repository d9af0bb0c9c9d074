//! Test case and run results.
//!
//! A [`RunResult`] holds the outcome of one attempt of one named run: the
//! per-case results in the order they were first reported, the run-level
//! failures, and the count the producer promised up front. Merging several
//! attempts into one result lives in [`crate::merge`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Trace reported for a case that started but never ended.
pub const INCOMPLETE_TEST_TRACE: &str = "Test did not complete due to exception.";

/// Free-form key/value metrics attached to a case or a run.
pub type Metrics = BTreeMap<String, String>;

/// Identity of a single test case: `class#method`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TestDescription {
    /// Fully qualified class (or group) name.
    pub class_name: String,
    /// Method (or case) name.
    pub method_name: String,
}

impl TestDescription {
    /// Creates a new test identity.
    #[must_use]
    pub fn new(class_name: impl Into<String>, method_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            method_name: method_name.into(),
        }
    }
}

impl fmt::Display for TestDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.class_name, self.method_name)
    }
}

impl FromStr for TestDescription {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('#') {
            Some((class, method)) if !class.is_empty() && !method.is_empty() => {
                Ok(Self::new(class, method))
            }
            _ => Err(Error::Core(marshal_core::Error::InvalidInput(format!(
                "test identity must be 'class#method', got '{s}'"
            )))),
        }
    }
}

impl TryFrom<String> for TestDescription {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TestDescription> for String {
    fn from(value: TestDescription) -> Self {
        value.to_string()
    }
}

/// Final status of a single test case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestStatus {
    /// The case passed.
    Pass,
    /// The case failed.
    Fail,
    /// A precondition of the case did not hold.
    AssumptionFailure,
    /// The case was skipped.
    Ignored,
    /// The case started but never ended.
    Incomplete,
}

impl TestStatus {
    /// Returns true for the statuses counted as failures (FAIL and INCOMPLETE).
    #[must_use]
    pub const fn is_failed(self) -> bool {
        matches!(self, Self::Fail | Self::Incomplete)
    }

    /// Returns the status label used in logs and reports.
    #[must_use]
    pub const fn as_label(self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
            Self::AssumptionFailure => "ASSUMPTION_FAILURE",
            Self::Ignored => "IGNORED",
            Self::Incomplete => "INCOMPLETE",
        }
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Classification of a run-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureStatus {
    /// The code under test failed.
    TestFailure,
    /// The harness or a preparer failed.
    InfraFailure,
    /// The target was lost.
    LostTarget,
    /// Tests were expected but never executed.
    NotExecuted,
    /// The run stopped before reporting everything it announced.
    Incomplete,
}

/// A run-level failure: classification, message and optional cause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureDescription {
    /// Classification of the failure.
    pub status: FailureStatus,
    /// Human-readable message.
    pub message: String,
    /// Originating cause, when one is known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl FailureDescription {
    /// Creates a failure description without a cause.
    #[must_use]
    pub fn new(status: FailureStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            cause: None,
        }
    }

    /// Attaches the originating cause.
    #[must_use]
    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }
}

impl fmt::Display for FailureDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Result of a single test case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCaseResult {
    /// Case identity.
    pub description: TestDescription,
    /// Final status.
    pub status: TestStatus,
    /// Failure trace or skip reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Metrics reported at case end.
    #[serde(default)]
    pub metrics: Metrics,
    /// When the case started.
    pub started_at: DateTime<Utc>,
    /// When the case ended; `None` while in progress.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl TestCaseResult {
    /// Creates an in-progress case. It stays INCOMPLETE until it ends.
    #[must_use]
    pub fn started(description: TestDescription, started_at: DateTime<Utc>) -> Self {
        Self {
            description,
            status: TestStatus::Incomplete,
            message: None,
            metrics: Metrics::new(),
            started_at,
            ended_at: None,
        }
    }

    /// Returns true once the case has ended.
    #[must_use]
    pub const fn has_ended(&self) -> bool {
        self.ended_at.is_some()
    }
}

/// Result of one attempt of one named run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    /// Run name.
    pub name: String,
    /// Zero-based attempt number.
    pub attempt: u32,
    /// Number of cases the producer announced.
    pub expected_count: usize,
    /// Per-case results, in first-reported order.
    pub tests: IndexMap<TestDescription, TestCaseResult>,
    /// Run-level failures, in the order reported.
    #[serde(default)]
    pub run_failures: Vec<FailureDescription>,
    /// Run-level metrics.
    #[serde(default)]
    pub metrics: Metrics,
    /// Wall time reported at run end.
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
    /// True once the run-ended event was received.
    pub complete: bool,
}

impl RunResult {
    /// Creates an empty, open run.
    #[must_use]
    pub fn new(name: impl Into<String>, expected_count: usize, attempt: u32) -> Self {
        Self {
            name: name.into(),
            attempt,
            expected_count,
            tests: IndexMap::new(),
            run_failures: Vec::new(),
            metrics: Metrics::new(),
            elapsed: Duration::ZERO,
            complete: false,
        }
    }

    /// Returns the number of distinct cases observed.
    #[must_use]
    pub fn num_tests(&self) -> usize {
        self.tests.len()
    }

    /// Returns the number of cases with the given status.
    #[must_use]
    pub fn count_status(&self, status: TestStatus) -> usize {
        self.tests.values().filter(|t| t.status == status).count()
    }

    /// Returns the identities of failed cases (FAIL or INCOMPLETE).
    #[must_use]
    pub fn failed_tests(&self) -> BTreeSet<TestDescription> {
        self.tests
            .values()
            .filter(|t| t.status.is_failed())
            .map(|t| t.description.clone())
            .collect()
    }

    /// Returns true if any case failed.
    #[must_use]
    pub fn has_failed_tests(&self) -> bool {
        self.tests.values().any(|t| t.status.is_failed())
    }

    /// Returns true if a run-level failure was reported.
    #[must_use]
    pub fn is_run_failure(&self) -> bool {
        !self.run_failures.is_empty()
    }

    /// Returns true if anything in this run failed.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.is_run_failure() || self.has_failed_tests()
    }

    /// Returns true if the observed case count differs from the announced one.
    #[must_use]
    pub fn has_count_mismatch(&self) -> bool {
        self.num_tests() != self.expected_count
    }

    /// Records a run-level failure, dropping exact duplicates.
    pub fn add_run_failure(&mut self, failure: FailureDescription) {
        if !self.run_failures.contains(&failure) {
            self.run_failures.push(failure);
        }
    }

    /// Joins every run-level failure message.
    #[must_use]
    pub fn run_failure_message(&self) -> Option<String> {
        if self.run_failures.is_empty() {
            return None;
        }
        Some(
            self.run_failures
                .iter()
                .map(|f| f.message.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
        )
    }
}
