//! Test units and the capabilities the engine can inject into them.
//!
//! A [`TestUnit`] is an executable producing test events into a
//! [`ResultSink`]. Optional capabilities are discovered through the `as_*`
//! accessors: a unit that wants the primary target returns itself from
//! [`TestUnit::as_has_target`], and so on. Units that do not opt in are run
//! without injection.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use marshal_core::{BuildArtifact, InvocationContext, Target, TargetError};

use crate::collector::MetricCollector;
use crate::listener::ResultSink;
use crate::result::TestDescription;

/// Failure escaping a unit's `run`.
#[derive(Debug, thiserror::Error)]
pub enum UnitFault {
    /// An unexpected failure inside the unit. The run is marked failed and
    /// execution continues.
    #[error("{message}")]
    Runtime {
        /// Description, usually a stack trace.
        message: String,
    },

    /// A target failure. Recovered unresponsiveness is reported and execution
    /// continues; an unavailable target aborts the invocation.
    #[error(transparent)]
    Target(#[from] TargetError),
}

impl UnitFault {
    /// Creates a runtime fault.
    #[must_use]
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime {
            message: message.into(),
        }
    }
}

/// Receives the primary target before each run.
pub trait HasTarget {
    /// Injects the target.
    fn set_target(&mut self, target: Arc<dyn Target>);
}

/// Receives the build under test before each run.
pub trait HasBuildArtifact {
    /// Injects the build.
    fn set_build(&mut self, build: Arc<BuildArtifact>);
}

/// Receives the whole invocation context before each run.
pub trait HasContext {
    /// Injects the context.
    fn set_context(&mut self, ctx: InvocationContext);
}

/// Takes over the metric collectors instead of having the engine wrap its sink.
pub trait HasCollectors {
    /// Injects fresh collectors for the coming attempt.
    fn set_collectors(&mut self, collectors: Vec<Box<dyn MetricCollector>>);
}

/// Supports include and exclude filters on case identities.
///
/// A filter is either `class#method` or a bare `class`, which matches every
/// method of the class.
pub trait CaseFilter {
    /// Adds an include filter.
    fn add_include_filter(&mut self, filter: &str);
    /// Adds an exclude filter.
    fn add_exclude_filter(&mut self, filter: &str);
    /// Removes every include filter.
    fn clear_include_filters(&mut self);
    /// Returns the include filters.
    fn include_filters(&self) -> Vec<String>;
}

/// Can report its cases without executing them.
pub trait TestCollector {
    /// Switches collect-only mode on or off.
    fn set_collect_tests_only(&mut self, collect_only: bool);
}

/// An executable that produces test events.
#[async_trait]
pub trait TestUnit: Send {
    /// Name used in logs and as the fallback run name.
    fn name(&self) -> &str;

    /// The unit wants the primary target.
    fn as_has_target(&mut self) -> Option<&mut dyn HasTarget> {
        None
    }

    /// The unit wants the build under test.
    fn as_has_build(&mut self) -> Option<&mut dyn HasBuildArtifact> {
        None
    }

    /// The unit wants the invocation context.
    fn as_has_context(&mut self) -> Option<&mut dyn HasContext> {
        None
    }

    /// The unit drives metric collectors itself.
    fn as_has_collectors(&mut self) -> Option<&mut dyn HasCollectors> {
        None
    }

    /// The unit supports case filters.
    fn as_case_filter(&mut self) -> Option<&mut dyn CaseFilter> {
        None
    }

    /// The unit supports collect-only mode.
    fn as_test_collector(&mut self) -> Option<&mut dyn TestCollector> {
        None
    }

    /// Runs the unit, reporting every event to `sink`.
    async fn run(&mut self, sink: &mut dyn ResultSink) -> Result<(), UnitFault>;
}

/// Injects the target, build and context capabilities a unit opted into.
pub fn inject_context(unit: &mut dyn TestUnit, ctx: &InvocationContext) {
    if let Some(has_target) = unit.as_has_target() {
        if let Some(target) = ctx.primary_target() {
            has_target.set_target(Arc::clone(target));
        }
    }
    if let Some(has_build) = unit.as_has_build() {
        if let Some(build) = ctx.build() {
            has_build.set_build(Arc::clone(build));
        }
    }
    if let Some(has_context) = unit.as_has_context() {
        has_context.set_context(ctx.clone());
    }
}

/// Include/exclude filter set for units implementing [`CaseFilter`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaseFilterSet {
    include: BTreeSet<String>,
    exclude: BTreeSet<String>,
}

impl CaseFilterSet {
    /// Creates an empty filter set, matching everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn matches_filter(filter: &str, test: &TestDescription) -> bool {
        match filter.split_once('#') {
            Some((class, method)) => class == test.class_name && method == test.method_name,
            None => filter == test.class_name,
        }
    }

    /// Returns true if `test` should run.
    #[must_use]
    pub fn should_run(&self, test: &TestDescription) -> bool {
        if self.exclude.iter().any(|f| Self::matches_filter(f, test)) {
            return false;
        }
        self.include.is_empty() || self.include.iter().any(|f| Self::matches_filter(f, test))
    }
}

impl CaseFilter for CaseFilterSet {
    fn add_include_filter(&mut self, filter: &str) {
        self.include.insert(filter.to_string());
    }

    fn add_exclude_filter(&mut self, filter: &str) {
        self.exclude.insert(filter.to_string());
    }

    fn clear_include_filters(&mut self) {
        self.include.clear();
    }

    fn include_filters(&self) -> Vec<String> {
        self.include.iter().cloned().collect()
    }
}
