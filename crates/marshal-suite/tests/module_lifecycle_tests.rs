//! Module lifecycle tests: setup, aggregation, teardown and reporting.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use marshal_suite::listener::CollectingListener;
use marshal_suite::module::{ModuleMetadata, ModuleRunStrategy};
use marshal_suite::result::{FailureStatus, TestDescription, TestStatus};
use marshal_suite::retry::RetryStrategy;
use marshal_suite::suite::{ModuleSpec, SuiteOrchestrator};
use marshal_test_utils::{
    CaseScript, Operation, PreparerJournal, RecordingPreparer, RecordingSink, ScriptedUnit,
    SinkEvent, TestContext, assert_case_status, assert_modules_reported, assert_run_failure,
    assert_run_passed, init_test_logging, passing_module, suite_config,
};

#[tokio::test]
async fn all_cases_pass_in_a_single_attempt() {
    init_test_logging();
    let tc = TestContext::new();
    let mut orchestrator = SuiteOrchestrator::new(suite_config(1, RetryStrategy::NoRetry));
    let mut listener = CollectingListener::new();

    let summary = orchestrator
        .run(&tc.ctx, vec![passing_module("ModuleA", 5)], 1, 0, &mut listener)
        .await
        .expect("suite runs");

    assert!(summary.is_success());
    assert_eq!(summary.retry.success_retried, 0);
    assert_eq!(summary.retry.failed_retried, 0);
    assert_modules_reported(&listener, &["ModuleA"]);
    let run = listener.latest("ModuleA").expect("module run");
    assert_run_passed(run);
    assert_eq!(run.num_tests(), 5);
    assert_eq!(run.count_status(TestStatus::Pass), 5);
    assert_eq!(run.expected_count, 5);
    assert_eq!(tc.primary().count(Operation::Bugreport), 0);
}

#[tokio::test]
async fn setup_failure_reports_synthetic_case_and_tears_down_every_preparer() {
    init_test_logging();
    let tc = TestContext::new();
    let journal = PreparerJournal::new();
    let unit = ScriptedUnit::passing("ModuleA", 3);
    let log = unit.execution_log();
    let spec = ModuleSpec::new("ModuleA")
        .with_multi_target_preparer(RecordingPreparer::new("p1", &journal).multi())
        .with_target_preparer(
            RecordingPreparer::new("p2", &journal)
                .failing_setup("install failed")
                .on_primary(),
        )
        .with_target_preparer(RecordingPreparer::new("p3", &journal).on_primary())
        .with_unit(unit.boxed());

    let mut orchestrator = SuiteOrchestrator::new(suite_config(1, RetryStrategy::NoRetry));
    let mut listener = CollectingListener::new();
    let summary = orchestrator
        .run(
            &tc.ctx,
            vec![spec, passing_module("ModuleB", 2)],
            1,
            0,
            &mut listener,
        )
        .await
        .expect("setup failures do not abort the suite");

    assert_eq!(
        journal.entries(),
        vec!["setup:p1", "setup:p2", "teardown:p3", "teardown:p2", "teardown:p1"]
    );
    assert_eq!(
        journal.teardown_causes(),
        vec![Some("p2: install failed".to_string()); 3]
    );
    assert!(log.is_empty(), "units must not run after a setup failure");

    let run = listener.latest("ModuleA").expect("module run");
    let synthetic = TestDescription::new("ModuleA", "PreparationError");
    assert_eq!(run.num_tests(), 1);
    assert_case_status(run, &synthetic, TestStatus::Fail);
    assert_eq!(
        run.tests[&synthetic].message.as_deref(),
        Some("p2: install failed")
    );
    assert_run_failure(run, FailureStatus::InfraFailure);

    assert!(summary.modules[0].preparation_failed);
    assert_modules_reported(&listener, &["ModuleA", "ModuleB"]);
    assert_run_passed(listener.latest("ModuleB").expect("second module ran"));
}

#[tokio::test]
async fn first_preparer_failing_still_tears_down_all_preparers() {
    let tc = TestContext::new();
    let journal = PreparerJournal::new();
    let spec = ModuleSpec::new("ModuleA")
        .with_multi_target_preparer(
            RecordingPreparer::new("p1", &journal)
                .failing_setup("flash failed")
                .multi(),
        )
        .with_multi_target_preparer(RecordingPreparer::new("p2", &journal).multi())
        .with_multi_target_preparer(RecordingPreparer::new("p3", &journal).multi())
        .with_unit(ScriptedUnit::passing("ModuleA", 1).boxed());

    let mut orchestrator = SuiteOrchestrator::new(suite_config(1, RetryStrategy::NoRetry));
    let mut listener = CollectingListener::new();
    orchestrator
        .run(&tc.ctx, vec![spec], 1, 0, &mut listener)
        .await
        .expect("setup failures do not abort the suite");

    assert_eq!(
        journal.entries(),
        vec!["setup:p1", "teardown:p3", "teardown:p2", "teardown:p1"]
    );
    assert_eq!(journal.torn_down(), vec!["p3", "p2", "p1"]);
    let run = listener.latest("ModuleA").expect("module run");
    assert_case_status(
        run,
        &TestDescription::new("ModuleA", "PreparationError"),
        TestStatus::Fail,
    );
}

#[tokio::test]
async fn teardown_attempts_every_preparer_after_one_fails() {
    let tc = TestContext::new();
    let journal = PreparerJournal::new();
    let spec = ModuleSpec::new("ModuleA")
        .with_multi_target_preparer(RecordingPreparer::new("p0", &journal).multi())
        .with_multi_target_preparer(
            RecordingPreparer::new("p1", &journal)
                .failing_teardown("umount failed")
                .multi(),
        )
        .with_multi_target_preparer(RecordingPreparer::new("p2", &journal).multi())
        .with_unit(ScriptedUnit::passing("ModuleA", 2).boxed());

    let mut orchestrator = SuiteOrchestrator::new(suite_config(1, RetryStrategy::NoRetry));
    let mut listener = CollectingListener::new();
    let summary = orchestrator
        .run(&tc.ctx, vec![spec], 1, 0, &mut listener)
        .await
        .expect("suite runs");

    assert_eq!(journal.torn_down(), vec!["p2", "p1", "p0"]);
    assert_eq!(summary.modules[0].teardown_failures, vec!["p1: umount failed"]);
    assert_eq!(journal.teardown_causes(), vec![None, None, None]);

    let run = listener.latest("ModuleA").expect("module run");
    assert_eq!(run.count_status(TestStatus::Pass), 2);
    assert!(run
        .run_failures
        .iter()
        .any(|f| f.status == FailureStatus::InfraFailure
            && f.message == "Teardown of p1 failed: umount failed"));
}

#[tokio::test]
async fn disabled_preparers_are_skipped() {
    let tc = TestContext::new();
    let journal = PreparerJournal::new();
    let spec = ModuleSpec::new("ModuleA")
        .with_multi_target_preparer(RecordingPreparer::new("p0", &journal).disabled().multi())
        .with_target_preparer(RecordingPreparer::new("p1", &journal).on_primary())
        .with_unit(ScriptedUnit::passing("ModuleA", 1).boxed());

    let mut orchestrator = SuiteOrchestrator::new(suite_config(1, RetryStrategy::NoRetry));
    let mut listener = CollectingListener::new();
    orchestrator
        .run(&tc.ctx, vec![spec], 1, 0, &mut listener)
        .await
        .expect("suite runs");

    assert_eq!(journal.entries(), vec!["setup:p1", "teardown:p1"]);
}

#[tokio::test]
async fn run_failure_is_passed_to_teardown_as_cause() {
    let tc = TestContext::new();
    let journal = PreparerJournal::new();
    let spec = ModuleSpec::new("ModuleA")
        .with_multi_target_preparer(RecordingPreparer::new("p0", &journal).multi())
        .with_unit(ScriptedUnit::passing("ModuleA", 3).failing_at(1, "instrumentation crashed").boxed());

    let mut orchestrator = SuiteOrchestrator::new(suite_config(1, RetryStrategy::NoRetry));
    let mut listener = CollectingListener::new();
    orchestrator
        .run(&tc.ctx, vec![spec], 1, 0, &mut listener)
        .await
        .expect("a runtime fault does not abort the suite");

    let causes = journal.teardown_causes();
    assert_eq!(causes.len(), 1);
    let cause = causes[0].as_deref().expect("teardown received the run failure");
    assert!(cause.contains("instrumentation crashed"));

    let run = listener.latest("ModuleA").expect("module run");
    assert_eq!(run.num_tests(), 1);
    assert_run_failure(run, FailureStatus::TestFailure);
    assert_run_failure(run, FailureStatus::Incomplete);
}

#[tokio::test]
async fn short_count_marks_module_incomplete() {
    let tc = TestContext::new();
    let spec = ModuleSpec::new("ModuleA")
        .with_unit(ScriptedUnit::passing("ModuleA", 2).announcing(4).boxed());

    let mut orchestrator = SuiteOrchestrator::new(suite_config(1, RetryStrategy::NoRetry));
    let mut listener = CollectingListener::new();
    let summary = orchestrator
        .run(&tc.ctx, vec![spec], 1, 0, &mut listener)
        .await
        .expect("suite runs");

    let run = listener.latest("ModuleA").expect("module run");
    assert_eq!(run.expected_count, 4);
    assert_eq!(run.num_tests(), 2);
    assert!(run
        .run_failures
        .iter()
        .any(|f| f.status == FailureStatus::Incomplete
            && f.message == "Module did not run all its tests."));
    assert_eq!(summary.failed_modules().collect::<Vec<_>>(), vec!["ModuleA"]);
}

#[tokio::test]
async fn over_count_marks_module_incomplete() {
    let tc = TestContext::new();
    let spec = ModuleSpec::new("ModuleA")
        .with_unit(ScriptedUnit::passing("ModuleA", 3).announcing(1).boxed());

    let mut orchestrator = SuiteOrchestrator::new(suite_config(1, RetryStrategy::NoRetry));
    let mut listener = CollectingListener::new();
    let summary = orchestrator
        .run(&tc.ctx, vec![spec], 1, 0, &mut listener)
        .await
        .expect("suite runs");

    let run = listener.latest("ModuleA").expect("module run");
    assert_eq!(run.expected_count, 1);
    assert_eq!(run.count_status(TestStatus::Pass), 3);
    assert_run_failure(run, FailureStatus::Incomplete);
    assert_eq!(summary.failed_modules().collect::<Vec<_>>(), vec!["ModuleA"]);
}

#[tokio::test]
async fn failed_module_captures_a_bugreport_between_run_end_and_module_end() {
    let tc = TestContext::with_targets(2);
    let spec = ModuleSpec::new("ModuleA").with_unit(
        ScriptedUnit::new("ModuleA")
            .with_case("ok", CaseScript::Pass)
            .with_case("broken", CaseScript::Fail)
            .boxed(),
    );

    let mut orchestrator = SuiteOrchestrator::new(suite_config(1, RetryStrategy::NoRetry));
    let mut sink = RecordingSink::new();
    orchestrator
        .run(&tc.ctx, vec![spec], 1, 0, &mut sink)
        .await
        .expect("suite runs");

    assert_eq!(
        sink.log_names(),
        vec![
            "module-ModuleA-failure-device-0-bugreport",
            "module-ModuleA-failure-device-1-bugreport",
        ]
    );
    let run_ended = sink.position(&SinkEvent::RunEnded).expect("run ended");
    let logged = sink
        .position(&SinkEvent::Log(
            "module-ModuleA-failure-device-0-bugreport".to_string(),
        ))
        .expect("bugreport logged");
    let module_ended = sink.position(&SinkEvent::ModuleEnded).expect("module ended");
    assert!(run_ended < logged && logged < module_ended);
    assert_eq!(sink.events()[0], SinkEvent::ModuleStarted("ModuleA".to_string()));
}

#[tokio::test]
async fn mark_tests_skipped_reports_every_case_ignored() {
    let tc = TestContext::new();
    let spec = ModuleSpec::new("ModuleA")
        .with_unit(
            ScriptedUnit::new("ModuleA")
                .with_case("a", CaseScript::Pass)
                .with_case("b", CaseScript::Fail)
                .boxed(),
        )
        .with_metadata(ModuleMetadata {
            run_strategy: ModuleRunStrategy::MarkTestsSkipped,
            ..ModuleMetadata::default()
        });

    let mut orchestrator = SuiteOrchestrator::new(suite_config(3, RetryStrategy::RetryAnyFailure));
    let mut listener = CollectingListener::new();
    let summary = orchestrator
        .run(&tc.ctx, vec![spec], 1, 0, &mut listener)
        .await
        .expect("suite runs");

    let run = listener.latest("ModuleA").expect("module run");
    assert_eq!(run.count_status(TestStatus::Ignored), 2);
    assert_run_passed(run);
    assert!(summary.is_success());
}

#[tokio::test]
async fn collect_only_reports_cases_without_retrying() {
    let tc = TestContext::new();
    let unit = ScriptedUnit::new("ModuleA")
        .with_case("a", CaseScript::Fail)
        .with_case("b", CaseScript::Pass);
    let log = unit.execution_log();

    let mut config = suite_config(3, RetryStrategy::RetryAnyFailure);
    config.collect_tests_only = true;
    let mut orchestrator = SuiteOrchestrator::new(config);
    let mut listener = CollectingListener::new();
    orchestrator
        .run(
            &tc.ctx,
            vec![ModuleSpec::new("ModuleA").with_unit(unit.boxed())],
            1,
            0,
            &mut listener,
        )
        .await
        .expect("suite runs");

    assert_eq!(log.len(), 1);
    let run = listener.latest("ModuleA").expect("module run");
    assert_eq!(run.count_status(TestStatus::Pass), 2);
}

#[tokio::test]
async fn units_of_one_module_are_reported_as_a_single_run() {
    let tc = TestContext::new();
    let spec = ModuleSpec::new("ModuleA")
        .with_unit(ScriptedUnit::passing("FooTest", 2).boxed())
        .with_unit(ScriptedUnit::passing("BarTest", 3).boxed());

    let mut orchestrator = SuiteOrchestrator::new(suite_config(1, RetryStrategy::NoRetry));
    let mut listener = CollectingListener::new();
    orchestrator
        .run(&tc.ctx, vec![spec], 1, 0, &mut listener)
        .await
        .expect("suite runs");

    assert_eq!(listener.run_names().collect::<Vec<_>>(), vec!["ModuleA"]);
    let run = listener.latest("ModuleA").expect("module run");
    assert_eq!(run.num_tests(), 5);
    assert_eq!(run.expected_count, 5);
}
