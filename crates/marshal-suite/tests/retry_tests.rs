//! Granular retry tests against scripted units and fake targets.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use marshal_core::StopSignal;
use marshal_suite::diagnostics::{DiagnosticsConfig, FailureDiagnostics};
use marshal_suite::error::Error;
use marshal_suite::result::{FailureStatus, TestStatus};
use marshal_suite::retry::{GranularRetryWrapper, RetryConfig, RetryStrategy};
use marshal_test_utils::{
    CaseScript, Operation, RecordingSink, ScriptedUnit, TestContext, assert_case_status,
    assert_run_failure, init_test_logging,
};

fn one_failing() -> ScriptedUnit {
    ScriptedUnit::new("FooTest")
        .with_case("test0", CaseScript::Pass)
        .with_case("test1", CaseScript::Fail)
        .with_case("test2", CaseScript::Pass)
}

fn strings(methods: &[&str]) -> Vec<String> {
    methods.iter().map(ToString::to_string).collect()
}

#[tokio::test]
async fn persistent_failure_is_retried_alone_until_attempts_run_out() {
    init_test_logging();
    let tc = TestContext::new();
    let unit = one_failing();
    let log = unit.execution_log();
    let test1 = unit.description("test1");
    let mut wrapper = GranularRetryWrapper::new(
        unit.boxed(),
        RetryConfig::new(3, RetryStrategy::RetryAnyFailure),
    );
    let mut sink = RecordingSink::new();

    wrapper.run(&tc.ctx, &mut sink, None).await.expect("retries run");

    assert_eq!(
        log.executions(),
        vec![
            strings(&["test0", "test1", "test2"]),
            strings(&["test1"]),
            strings(&["test1"]),
        ]
    );
    assert_eq!(wrapper.attempts_run(), 3);
    assert_eq!(wrapper.statistics().failed_retried, 1);
    assert_eq!(wrapper.statistics().success_retried, 0);

    let results = wrapper.final_results();
    assert_eq!(results.len(), 1);
    let merged = &results[0];
    assert_eq!(merged.num_tests(), 3);
    assert_eq!(merged.expected_count, 3);
    assert_case_status(merged, &test1, TestStatus::Fail);
    assert_eq!(merged.count_status(TestStatus::Pass), 2);
}

#[tokio::test]
async fn flaky_case_recovers_and_stops_the_retries() {
    let tc = TestContext::new();
    let unit = ScriptedUnit::new("FooTest")
        .with_case("stable", CaseScript::Pass)
        .with_case("flaky", CaseScript::FailTimes(1));
    let log = unit.execution_log();
    let flaky = unit.description("flaky");
    let mut wrapper = GranularRetryWrapper::new(
        unit.boxed(),
        RetryConfig::new(5, RetryStrategy::RetryAnyFailure),
    );

    wrapper
        .run(&tc.ctx, &mut RecordingSink::new(), None)
        .await
        .expect("retries run");

    assert_eq!(log.len(), 2);
    let stats = wrapper.statistics();
    assert_eq!(stats.success_retried, 1);
    assert_eq!(stats.failed_retried, 0);
    assert_eq!(stats.attempt_success.get(&flaky), Some(&1));
    assert_case_status(&wrapper.final_results()[0], &flaky, TestStatus::Pass);
    assert_eq!(wrapper.attempts("FooTest").len(), 2);
}

#[tokio::test]
async fn unfilterable_unit_reruns_every_case() {
    let tc = TestContext::new();
    let unit = one_failing().not_filterable();
    let log = unit.execution_log();
    let mut wrapper = GranularRetryWrapper::new(
        unit.boxed(),
        RetryConfig::new(2, RetryStrategy::RetryAnyFailure),
    );

    wrapper
        .run(&tc.ctx, &mut RecordingSink::new(), None)
        .await
        .expect("retries run");

    assert_eq!(log.len(), 2);
    assert!(log.executions().iter().all(|e| e.len() == 3));
}

#[tokio::test]
async fn iterations_run_every_attempt_and_keep_the_last() {
    let tc = TestContext::new();
    let unit = ScriptedUnit::new("FooTest").with_case("flaky", CaseScript::FailTimes(2));
    let log = unit.execution_log();
    let flaky = unit.description("flaky");
    let mut wrapper =
        GranularRetryWrapper::new(unit.boxed(), RetryConfig::new(3, RetryStrategy::Iterations));

    wrapper
        .run(&tc.ctx, &mut RecordingSink::new(), None)
        .await
        .expect("iterations run");

    assert_eq!(log.len(), 3);
    assert_case_status(&wrapper.final_results()[0], &flaky, TestStatus::Pass);
}

#[tokio::test]
async fn rerun_until_failure_stops_at_the_first_failure() {
    let tc = TestContext::new();
    let passing = ScriptedUnit::passing("FooTest", 2);
    let passing_log = passing.execution_log();
    let mut wrapper = GranularRetryWrapper::new(
        passing.boxed(),
        RetryConfig::new(3, RetryStrategy::RerunUntilFailure),
    );
    wrapper
        .run(&tc.ctx, &mut RecordingSink::new(), None)
        .await
        .expect("reruns run");
    assert_eq!(passing_log.len(), 3);

    let failing = one_failing();
    let failing_log = failing.execution_log();
    let mut wrapper = GranularRetryWrapper::new(
        failing.boxed(),
        RetryConfig::new(3, RetryStrategy::RerunUntilFailure),
    );
    wrapper
        .run(&tc.ctx, &mut RecordingSink::new(), None)
        .await
        .expect("reruns run");
    assert_eq!(failing_log.len(), 1);
}

#[tokio::test]
async fn no_retry_runs_once_whatever_the_attempt_budget() {
    let tc = TestContext::new();
    let unit = one_failing();
    let log = unit.execution_log();
    let mut wrapper =
        GranularRetryWrapper::new(unit.boxed(), RetryConfig::new(4, RetryStrategy::NoRetry));

    wrapper
        .run(&tc.ctx, &mut RecordingSink::new(), None)
        .await
        .expect("runs once");

    assert_eq!(log.len(), 1);
    assert_eq!(wrapper.statistics().failed_retried, 0);
}

#[tokio::test]
async fn reboots_physical_targets_before_the_last_attempt() {
    let tc = TestContext::with_targets(2);
    let mut wrapper = GranularRetryWrapper::new(
        one_failing().boxed(),
        RetryConfig::new(3, RetryStrategy::RetryAnyFailure).with_reboot_before_last_attempt(true),
    );

    wrapper
        .run(&tc.ctx, &mut RecordingSink::new(), None)
        .await
        .expect("retries run");

    for target in &tc.targets {
        assert_eq!(target.count(Operation::Reboot), 1);
    }
}

#[tokio::test]
async fn stop_request_prevents_further_attempts() {
    let tc = TestContext::new();
    let stop = StopSignal::new();
    stop.request();
    let ctx = tc.ctx.clone().with_stop_signal(stop);
    let unit = one_failing();
    let log = unit.execution_log();
    let mut wrapper = GranularRetryWrapper::new(
        unit.boxed(),
        RetryConfig::new(3, RetryStrategy::RetryAnyFailure),
    );

    wrapper
        .run(&ctx, &mut RecordingSink::new(), None)
        .await
        .expect("first attempt runs");

    assert_eq!(log.len(), 1);
}

#[tokio::test]
async fn lost_target_keeps_results_of_the_interrupted_attempt() {
    let tc = TestContext::new();
    let unit = ScriptedUnit::passing("FooTest", 5).target_error_at(2, tc.primary().unavailable());
    let mut wrapper = GranularRetryWrapper::new(
        unit.boxed(),
        RetryConfig::new(3, RetryStrategy::RetryAnyFailure),
    );

    let err = wrapper
        .run(&tc.ctx, &mut RecordingSink::new(), None)
        .await
        .expect_err("target loss aborts");

    assert!(matches!(err, Error::TargetUnavailable { .. }));
    let results = wrapper.final_results();
    assert_eq!(results[0].num_tests(), 2);
    assert_run_failure(&results[0], FailureStatus::LostTarget);
}

#[tokio::test]
async fn recovered_target_fails_the_run_without_aborting() {
    let tc = TestContext::new();
    let unit = ScriptedUnit::passing("FooTest", 2).target_error_at(
        1,
        marshal_core::TargetError::unresponsive_recovered("device-0", "adb hung"),
    );
    let mut wrapper = GranularRetryWrapper::new(
        unit.boxed(),
        RetryConfig::new(2, RetryStrategy::RetryAnyFailure),
    );

    wrapper
        .run(&tc.ctx, &mut RecordingSink::new(), None)
        .await
        .expect("recovered targets do not abort");

    let merged = &wrapper.final_results()[0];
    assert_run_failure(merged, FailureStatus::InfraFailure);
}

#[tokio::test]
async fn failure_diagnostics_go_to_the_downstream_sink() {
    let tc = TestContext::new();
    let config = DiagnosticsConfig {
        screenshot: true,
        logcat: true,
        ..DiagnosticsConfig::default()
    };
    let mut diagnostics = FailureDiagnostics::new(config, tc.ctx.targets().to_vec());
    let mut wrapper =
        GranularRetryWrapper::new(one_failing().boxed(), RetryConfig::new(1, RetryStrategy::NoRetry));
    let mut sink = RecordingSink::new();

    wrapper
        .run(&tc.ctx, &mut sink, Some(&mut diagnostics))
        .await
        .expect("runs");

    assert_eq!(
        sink.log_names(),
        vec!["FooTest#test1-device-0-screenshot", "FooTest#test1-device-0-logcat"]
    );
    assert_eq!(tc.primary().count(Operation::Screenshot), 1);
    assert_eq!(tc.primary().count(Operation::Reboot), 0);
}

#[tokio::test]
async fn reboot_on_failure_skips_production_builds() {
    let tc = TestContext::from_targets(vec![
        marshal_test_utils::FakeTarget::new("dev").production(),
    ]);
    let config = DiagnosticsConfig {
        reboot: true,
        ..DiagnosticsConfig::default()
    };
    let mut diagnostics = FailureDiagnostics::new(config, tc.ctx.targets().to_vec());
    let mut wrapper =
        GranularRetryWrapper::new(one_failing().boxed(), RetryConfig::new(1, RetryStrategy::NoRetry));

    wrapper
        .run(&tc.ctx, &mut RecordingSink::new(), Some(&mut diagnostics))
        .await
        .expect("runs");

    assert_eq!(tc.primary().count(Operation::Property), 1);
    assert_eq!(tc.primary().count(Operation::Reboot), 0);
}

#[tokio::test]
async fn unreadable_build_type_skips_reboot_and_keeps_the_result() {
    let tc = TestContext::new();
    tc.primary().inject_fault(
        Operation::Property,
        marshal_core::TargetError::command_failed("device-0", "getprop timed out"),
    );
    let config = DiagnosticsConfig {
        reboot: true,
        ..DiagnosticsConfig::default()
    };
    let mut diagnostics = FailureDiagnostics::new(config, tc.ctx.targets().to_vec());
    let unit = one_failing();
    let test1 = unit.description("test1");
    let mut wrapper =
        GranularRetryWrapper::new(unit.boxed(), RetryConfig::new(1, RetryStrategy::NoRetry));

    wrapper
        .run(&tc.ctx, &mut RecordingSink::new(), Some(&mut diagnostics))
        .await
        .expect("a failed property read does not abort the run");

    assert_eq!(tc.primary().count(Operation::Property), 1);
    assert_eq!(tc.primary().count(Operation::Reboot), 0);
    let merged = &wrapper.final_results()[0];
    assert_case_status(merged, &test1, TestStatus::Fail);
    assert_eq!(merged.count_status(TestStatus::Pass), 2);
    assert!(merged.run_failures.is_empty());
}
