//! Merging the attempts of a run into one final result.
//!
//! Each retry strategy implies a merge rule:
//!
//! | Strategy              | Rule                   |
//! |-----------------------|------------------------|
//! | `NO_RETRY`            | [`MergeStrategy::NoMerge`] |
//! | `ITERATIONS`          | [`MergeStrategy::LastAttemptWins`] |
//! | `RETRY_ANY_FAILURE`   | [`MergeStrategy::AnyPassWins`] |
//! | `RERUN_UNTIL_FAILURE` | [`MergeStrategy::AnyFailIsFail`] |
//!
//! Whatever the rule, a single attempt merges to itself.

use serde::{Deserialize, Serialize};

use crate::result::{RunResult, TestCaseResult, TestStatus};

/// How per-case statuses from several attempts combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Only one attempt exists; it is returned unchanged.
    NoMerge,
    /// The latest attempt's status wins.
    LastAttemptWins,
    /// A pass in any attempt wins.
    AnyPassWins,
    /// A failure in any attempt sticks.
    AnyFailIsFail,
}

/// Rank used by [`MergeStrategy::AnyPassWins`]: PASS beats the non-failing
/// statuses, which beat FAIL and INCOMPLETE.
const fn pass_rank(status: TestStatus) -> u8 {
    match status {
        TestStatus::Pass => 2,
        TestStatus::AssumptionFailure | TestStatus::Ignored => 1,
        TestStatus::Fail | TestStatus::Incomplete => 0,
    }
}

fn replaces(strategy: MergeStrategy, existing: &TestCaseResult, candidate: &TestCaseResult) -> bool {
    match strategy {
        MergeStrategy::NoMerge | MergeStrategy::LastAttemptWins => true,
        MergeStrategy::AnyPassWins => pass_rank(candidate.status) >= pass_rank(existing.status),
        MergeStrategy::AnyFailIsFail => {
            !existing.status.is_failed() || candidate.status.is_failed()
        }
    }
}

/// Merges the attempts of one run, oldest first.
///
/// Cases keep the order in which they were first reported. The merged run
/// takes the latest attempt number, the largest expected count, the summed
/// elapsed time, and the run failures of the latest attempt (of every
/// attempt under [`MergeStrategy::AnyFailIsFail`]).
///
/// Returns `None` when there is nothing to merge.
#[must_use]
pub fn merge_attempts(attempts: &[RunResult], strategy: MergeStrategy) -> Option<RunResult> {
    let (last, _) = attempts.split_last()?;
    if attempts.len() == 1 {
        return Some(last.clone());
    }
    if strategy == MergeStrategy::NoMerge {
        tracing::warn!(run = %last.name, attempts = attempts.len(), "several attempts with no merge rule; keeping the latest");
        return Some(last.clone());
    }

    let mut merged = RunResult::new(last.name.clone(), 0, last.attempt);
    for attempt in attempts {
        merged.expected_count = merged.expected_count.max(attempt.expected_count);
        merged.elapsed += attempt.elapsed;
        merged.metrics.extend(attempt.metrics.clone());
        for (id, case) in &attempt.tests {
            match merged.tests.get_mut(id) {
                Some(existing) => {
                    if replaces(strategy, existing, case) {
                        *existing = case.clone();
                    }
                }
                None => {
                    merged.tests.insert(id.clone(), case.clone());
                }
            }
        }
        if strategy == MergeStrategy::AnyFailIsFail {
            for failure in &attempt.run_failures {
                merged.add_run_failure(failure.clone());
            }
        }
    }
    if strategy != MergeStrategy::AnyFailIsFail {
        merged.run_failures.clone_from(&last.run_failures);
    }
    merged.complete = last.complete;
    Some(merged)
}
