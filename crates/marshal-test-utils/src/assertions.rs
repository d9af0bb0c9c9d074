//! Custom assertions for marshal tests.

use marshal_suite::listener::CollectingListener;
use marshal_suite::result::{FailureStatus, RunResult, TestDescription, TestStatus};

/// Asserts that a run has no failed case and no run failure.
///
/// # Panics
///
/// Panics if anything in the run failed.
pub fn assert_run_passed(run: &RunResult) {
    assert!(
        !run.is_failed(),
        "Expected run {} to pass, but failed cases were {:?} and run failures were {:?}",
        run.name,
        run.failed_tests(),
        run.run_failures
    );
}

/// Asserts that a run carries a run failure with the given status.
///
/// # Panics
///
/// Panics if no run failure has `status`.
pub fn assert_run_failure(run: &RunResult, status: FailureStatus) {
    assert!(
        run.run_failures.iter().any(|f| f.status == status),
        "Expected run {} to carry a {:?} failure, but run failures were {:?}",
        run.name,
        status,
        run.run_failures
    );
}

/// Asserts the final status of one case.
///
/// # Panics
///
/// Panics if the case is missing or has another status.
pub fn assert_case_status(run: &RunResult, test: &TestDescription, expected: TestStatus) {
    let actual = run.tests.get(test).map(|c| c.status);
    assert_eq!(
        actual,
        Some(expected),
        "Expected {test} in run {} to be {expected}, but was {actual:?}",
        run.name
    );
}

/// Asserts the modules a listener saw, in order.
///
/// # Panics
///
/// Panics if the module lists differ.
pub fn assert_modules_reported(listener: &CollectingListener, expected: &[&str]) {
    let actual: Vec<&str> = listener.modules().iter().map(String::as_str).collect();
    assert_eq!(actual, expected, "Expected modules {expected:?}, but saw {actual:?}");
}

/// Asserts that a module was reported as not run, and returns its run.
///
/// # Panics
///
/// Panics if the module has no run or its run is not a zero-count
/// not-executed failure.
pub fn assert_not_run<'a>(listener: &'a CollectingListener, module: &str) -> &'a RunResult {
    let run = listener
        .latest(module)
        .unwrap_or_else(|| panic!("Expected a run for module {module}, but none was reported"));
    assert_eq!(run.num_tests(), 0, "Expected {module} to report no cases");
    assert_run_failure(run, FailureStatus::NotExecuted);
    run
}
