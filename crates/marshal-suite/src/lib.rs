//! # marshal-suite
//!
//! Suite, module, and retry execution engine for the marshal device test harness.
//!
//! This crate runs large suites of tests against allocated targets, providing:
//!
//! - **Module Lifecycle**: setup, run, and teardown of one module as a state machine
//! - **Granular Retry**: reruns of only the failed test cases, with merged results
//! - **Result Aggregation**: a listener protocol and collector for streamed test events
//! - **Failure Diagnostics**: best-effort captures when a case fails
//! - **Sharding**: deterministic partitions of the module list, run in parallel
//! - **Cross-Invocation Retry**: a reduced rerun of a previous invocation
//!
//! ## Core Concepts
//!
//! - **Module**: a named group of test units sharing one setup/teardown lifecycle
//! - **Test Unit**: an executable group of test cases reporting into a [`listener::ResultSink`]
//! - **Attempt**: one zero-indexed execution pass of a run
//! - **Run Result**: the record of one `(run name, attempt)`
//!
//! ## Failure Model
//!
//! Only a lost target travels up to the caller, as
//! [`error::Error::TargetUnavailable`]. Every other failure (a preparer, a
//! unit fault, a short case count) becomes a reported run failure.
//!
//! ## Example
//!
//! ```rust,no_run
//! use marshal_core::InvocationContext;
//! use marshal_suite::config::SuiteConfig;
//! use marshal_suite::error::Result;
//! use marshal_suite::listener::CollectingListener;
//! use marshal_suite::suite::{ModuleSpec, SuiteOrchestrator};
//!
//! # async fn run(ctx: InvocationContext, specs: Vec<ModuleSpec>) -> Result<()> {
//! let config = SuiteConfig::from_env()?;
//! let mut orchestrator = SuiteOrchestrator::new(config.clone());
//! let mut results = CollectingListener::new();
//! let summary = orchestrator
//!     .run(&ctx, specs, config.shard_count, config.shard_index, &mut results)
//!     .await?;
//! for module in summary.failed_modules() {
//!     println!("failed: {module}");
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod collector;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod listener;
pub mod merge;
pub mod metrics;
pub mod module;
pub mod preparer;
pub mod rescheduler;
pub mod result;
pub mod retry;
pub mod suite;
pub mod unit;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::collector::MetricCollector;
    pub use crate::config::SuiteConfig;
    pub use crate::diagnostics::{DiagnosticsConfig, FailureDiagnostics};
    pub use crate::error::{Error, Result};
    pub use crate::listener::{CollectingListener, ResultForwarder, ResultSink, SharedCollector};
    pub use crate::merge::MergeStrategy;
    pub use crate::module::{ModuleDefinition, ModuleMetadata, ModuleOutcome, ModuleState};
    pub use crate::preparer::{
        BoundPreparer, MultiTargetPreparer, PreparationPipeline, PreparerError, TargetPreparer,
    };
    pub use crate::rescheduler::{PriorRunRecord, ResultsPlayer, RetryRescheduler, RetryType};
    pub use crate::result::{RunResult, TestCaseResult, TestDescription, TestStatus};
    pub use crate::retry::{GranularRetryWrapper, RetryConfig, RetryStatistics, RetryStrategy};
    pub use crate::suite::{ModuleSpec, SuiteOrchestrator, SuiteRunner, SuiteSummary, shard};
    pub use crate::unit::{CaseFilter, TestUnit, UnitFault};
}
