//! Fixtures for suite-level tests.

use marshal_core::InvocationContext;
use marshal_suite::config::SuiteConfig;
use marshal_suite::retry::{RetryConfig, RetryStrategy};
use marshal_suite::suite::ModuleSpec;

use crate::target::FakeTarget;
use crate::units::ScriptedUnit;

/// Allocated fake targets and the context built over them.
pub struct TestContext {
    /// The fake targets, in allocation order.
    pub targets: Vec<FakeTarget>,
    /// Invocation context over `targets`.
    pub ctx: InvocationContext,
}

impl TestContext {
    /// Creates a context over one physical target, `device-0`.
    pub fn new() -> Self {
        Self::with_targets(1)
    }

    /// Creates a context over `count` physical targets, `device-0` onwards.
    pub fn with_targets(count: usize) -> Self {
        let targets: Vec<FakeTarget> = (0..count)
            .map(|i| FakeTarget::new(format!("device-{i}")))
            .collect();
        Self::from_targets(targets)
    }

    /// Creates a context over the given targets.
    pub fn from_targets(targets: Vec<FakeTarget>) -> Self {
        let ctx = InvocationContext::new(targets.iter().map(FakeTarget::shared).collect());
        Self { targets, ctx }
    }

    /// Returns the primary fake target.
    pub fn primary(&self) -> &FakeTarget {
        self.targets.first().expect("at least one target")
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Suite configuration with the given retry policy and nothing else enabled.
pub fn suite_config(max_attempts: u32, strategy: RetryStrategy) -> SuiteConfig {
    SuiteConfig {
        retry: RetryConfig::new(max_attempts, strategy),
        ..SuiteConfig::default()
    }
}

/// A module with one unit of `count` passing cases, named after the module.
pub fn passing_module(name: &str, count: usize) -> ModuleSpec {
    ModuleSpec::new(name).with_unit(ScriptedUnit::passing(name, count).boxed())
}

/// Passing modules named `Module0`, `Module1`, ... with `cases` cases each.
pub fn passing_modules(count: usize, cases: usize) -> Vec<ModuleSpec> {
    (0..count)
        .map(|i| passing_module(&format!("Module{i}"), cases))
        .collect()
}
