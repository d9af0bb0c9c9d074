//! # marshal-test-utils
//!
//! Shared test utilities for marshal crates.
//!
//! This crate provides:
//! - [`FakeTarget`]: an in-memory target recording every call, with fault injection
//! - [`ScriptedUnit`]: a test unit reporting a scripted list of cases
//! - [`RecordingPreparer`]: a preparer journaling its setup and teardown
//! - [`RecordingSink`]: a result sink keeping the raw event stream
//! - Assertion helpers for run results and collected modules
//! - Fixtures building contexts and module specs

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
// Test utilities use expect/unwrap for cleaner test code - panics are acceptable in tests
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

pub mod assertions;
pub mod fixtures;
pub mod preparers;
pub mod sink;
pub mod target;
pub mod units;

pub use assertions::*;
pub use fixtures::*;
pub use preparers::*;
pub use sink::*;
pub use target::*;
pub use units::*;

/// Initializes tracing for tests.
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("marshal=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}
