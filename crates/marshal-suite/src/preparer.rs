//! Target preparation and cleanup.
//!
//! A module's [`PreparationPipeline`] runs invocation-wide
//! [`MultiTargetPreparer`]s first, then per-target [`TargetPreparer`]s, each
//! in declaration order. Setup halts at the first failure. Teardown walks the
//! exact reverse order, attempts every enabled step even after one fails, and
//! reports the first failure once all of them have run.

use std::sync::Arc;

use async_trait::async_trait;
use marshal_core::{InvocationContext, Target, TargetError};

use crate::metrics::SuiteMetrics;

/// Errors raised by preparers.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PreparerError {
    /// The preparer could not do its job.
    #[error("{message}")]
    Failed {
        /// Description of the failure.
        message: String,
    },

    /// The target failed underneath the preparer.
    #[error(transparent)]
    Target(#[from] TargetError),
}

impl PreparerError {
    /// Creates a generic preparer failure.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    /// Returns the target error when the target was lost.
    #[must_use]
    pub const fn as_unavailable(&self) -> Option<&TargetError> {
        match self {
            Self::Target(e) if e.is_unavailable() => Some(e),
            _ => None,
        }
    }
}

/// Prepares one target before a module runs and cleans it up afterwards.
#[async_trait]
pub trait TargetPreparer: Send + Sync {
    /// Name used in logs and failure reports.
    fn name(&self) -> &str;

    /// Disabled preparers are skipped in both setup and teardown.
    fn is_disabled(&self) -> bool {
        false
    }

    /// Returns false for preparers with nothing to clean up.
    fn has_teardown(&self) -> bool {
        true
    }

    /// Prepares `target`.
    async fn set_up(
        &mut self,
        target: &Arc<dyn Target>,
        ctx: &InvocationContext,
    ) -> Result<(), PreparerError>;

    /// Cleans up `target`. `cause` is the failure that ended the module, if any.
    async fn tear_down(
        &mut self,
        _target: &Arc<dyn Target>,
        _ctx: &InvocationContext,
        _cause: Option<&str>,
    ) -> Result<(), PreparerError> {
        Ok(())
    }
}

/// Prepares several targets at once.
#[async_trait]
pub trait MultiTargetPreparer: Send + Sync {
    /// Name used in logs and failure reports.
    fn name(&self) -> &str;

    /// Disabled preparers are skipped in both setup and teardown.
    fn is_disabled(&self) -> bool {
        false
    }

    /// Returns false for preparers with nothing to clean up.
    fn has_teardown(&self) -> bool {
        true
    }

    /// Prepares every target of the invocation.
    async fn set_up(&mut self, ctx: &InvocationContext) -> Result<(), PreparerError>;

    /// Cleans up every target. `cause` is the failure that ended the module, if any.
    async fn tear_down(
        &mut self,
        _ctx: &InvocationContext,
        _cause: Option<&str>,
    ) -> Result<(), PreparerError> {
        Ok(())
    }
}

/// A per-target preparer bound to the target it prepares.
pub struct BoundPreparer {
    /// Index of the target in the invocation context.
    pub target_index: usize,
    /// The preparer.
    pub preparer: Box<dyn TargetPreparer>,
}

impl BoundPreparer {
    /// Binds a preparer to the primary target.
    #[must_use]
    pub fn primary(preparer: Box<dyn TargetPreparer>) -> Self {
        Self::on(0, preparer)
    }

    /// Binds a preparer to the target at `target_index`.
    #[must_use]
    pub fn on(target_index: usize, preparer: Box<dyn TargetPreparer>) -> Self {
        Self {
            target_index,
            preparer,
        }
    }
}

enum Step {
    Multi(Box<dyn MultiTargetPreparer>),
    Target(BoundPreparer),
}

impl Step {
    fn name(&self) -> &str {
        match self {
            Self::Multi(p) => p.name(),
            Self::Target(b) => b.preparer.name(),
        }
    }

    fn is_disabled(&self) -> bool {
        match self {
            Self::Multi(p) => p.is_disabled(),
            Self::Target(b) => b.preparer.is_disabled(),
        }
    }

    fn has_teardown(&self) -> bool {
        match self {
            Self::Multi(p) => p.has_teardown(),
            Self::Target(b) => b.preparer.has_teardown(),
        }
    }

    fn target<'c>(
        index: usize,
        ctx: &'c InvocationContext,
    ) -> Result<&'c Arc<dyn Target>, PreparerError> {
        ctx.target(index).ok_or_else(|| {
            PreparerError::failed(format!(
                "no target at index {index} ({} allocated)",
                ctx.targets().len()
            ))
        })
    }

    async fn set_up(&mut self, ctx: &InvocationContext) -> Result<(), PreparerError> {
        match self {
            Self::Multi(p) => p.set_up(ctx).await,
            Self::Target(b) => {
                let target = Self::target(b.target_index, ctx)?;
                b.preparer.set_up(target, ctx).await
            }
        }
    }

    async fn tear_down(
        &mut self,
        ctx: &InvocationContext,
        cause: Option<&str>,
    ) -> Result<(), PreparerError> {
        match self {
            Self::Multi(p) => p.tear_down(ctx, cause).await,
            Self::Target(b) => {
                let target = Self::target(b.target_index, ctx)?;
                b.preparer.tear_down(target, ctx, cause).await
            }
        }
    }
}

/// A failure attributed to one preparer.
#[derive(Debug, Clone)]
pub struct PreparationFailure {
    /// Name of the preparer.
    pub preparer: String,
    /// What went wrong.
    pub error: PreparerError,
}

impl PreparationFailure {
    /// Returns the target error when the target was lost.
    #[must_use]
    pub const fn as_unavailable(&self) -> Option<&TargetError> {
        self.error.as_unavailable()
    }
}

impl std::fmt::Display for PreparationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.preparer, self.error)
    }
}

/// Outcome of a teardown pass.
#[derive(Debug, Clone, Default)]
pub struct TeardownReport {
    /// Number of preparers whose teardown ran.
    pub attempted: usize,
    /// Every teardown failure, in the order they happened.
    pub failures: Vec<PreparationFailure>,
}

impl TeardownReport {
    /// Returns the first failure, raised only after every teardown ran.
    ///
    /// # Errors
    ///
    /// Returns the first recorded failure, preferring a lost target.
    pub fn into_result(self) -> Result<usize, PreparationFailure> {
        let attempted = self.attempted;
        let mut failures = self.failures.into_iter();
        let Some(first) = failures.next() else {
            return Ok(attempted);
        };
        if first.as_unavailable().is_some() {
            return Err(first);
        }
        Err(failures
            .find(|f| f.as_unavailable().is_some())
            .unwrap_or(first))
    }
}

/// The ordered preparers of one module.
#[derive(Default)]
pub struct PreparationPipeline {
    steps: Vec<Step>,
    metrics: SuiteMetrics,
}

impl PreparationPipeline {
    /// Builds a pipeline: multi-target preparers first, then per-target ones.
    #[must_use]
    pub fn new(
        multi_target: Vec<Box<dyn MultiTargetPreparer>>,
        per_target: Vec<BoundPreparer>,
    ) -> Self {
        let steps = multi_target
            .into_iter()
            .map(Step::Multi)
            .chain(per_target.into_iter().map(Step::Target))
            .collect();
        Self {
            steps,
            metrics: SuiteMetrics::new(),
        }
    }

    /// Returns the number of declared preparers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if no preparer is declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Returns the preparer names in setup order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(Step::name)
    }

    /// Runs setup in order, halting at the first failure.
    ///
    /// # Errors
    ///
    /// Returns the failing preparer and its error.
    pub async fn set_up(&mut self, ctx: &InvocationContext) -> Result<(), PreparationFailure> {
        for step in &mut self.steps {
            if step.is_disabled() {
                tracing::debug!(preparer = step.name(), "skipping disabled preparer");
                continue;
            }
            tracing::debug!(preparer = step.name(), "running preparer setup");
            if let Err(error) = step.set_up(ctx).await {
                tracing::warn!(preparer = step.name(), error = %error, "preparer setup failed");
                self.metrics.record_preparer_failure("setup");
                return Err(PreparationFailure {
                    preparer: step.name().to_string(),
                    error,
                });
            }
        }
        Ok(())
    }

    /// Runs teardown in reverse declared order over every step.
    ///
    /// Every enabled step with a teardown is attempted, however far setup got,
    /// so a step whose setup never ran still gets to clean up. Failures are
    /// collected in the returned report.
    pub async fn tear_down(&mut self, ctx: &InvocationContext, cause: Option<&str>) -> TeardownReport {
        let mut report = TeardownReport::default();
        for step in self.steps.iter_mut().rev() {
            if step.is_disabled() || !step.has_teardown() {
                continue;
            }
            report.attempted += 1;
            tracing::debug!(preparer = step.name(), "running preparer teardown");
            if let Err(error) = step.tear_down(ctx, cause).await {
                tracing::warn!(preparer = step.name(), error = %error, "preparer teardown failed");
                self.metrics.record_preparer_failure("teardown");
                report.failures.push(PreparationFailure {
                    preparer: step.name().to_string(),
                    error,
                });
            }
        }
        report
    }
}
