//! Suite orchestration: validation, sharding, and sequential module execution.
//!
//! A [`SuiteOrchestrator`] turns [`ModuleSpec`]s into [`ModuleDefinition`]s,
//! keeps the shard it was asked for, and runs the modules one after another on
//! the invocation's targets. Losing a target aborts the suite: every module
//! that did not run yet is reported as a zero-count failed run and the error
//! is returned to the caller. A stop request ends the suite the same way,
//! without an error.
//!
//! Parallelism only comes from sharding: [`run_sharded`] runs one orchestrator
//! per shard, each on its own targets, all reporting into a
//! [`SharedCollector`].

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use marshal_core::observability::{invocation_span, module_span};
use marshal_core::{BugreportKind, InvocationContext, StopSignal, Target, TargetError, TimedTarget};
use tokio::task::JoinSet;
use tracing::Instrument;

use crate::collector::MetricCollector;
use crate::config::SuiteConfig;
use crate::diagnostics::FailureDiagnostics;
use crate::error::{Error, Result};
use crate::listener::{ResultSink, SharedCollector};
use crate::metrics::SuiteMetrics;
use crate::module::{ModuleDefinition, ModuleMetadata, ModuleOutcome, ModuleState};
use crate::preparer::{BoundPreparer, MultiTargetPreparer, PreparationPipeline};
use crate::result::{FailureDescription, FailureStatus, Metrics};
use crate::retry::RetryStatistics;
use crate::unit::{HasContext, TestUnit, UnitFault, inject_context};

/// Everything needed to build one module.
#[derive(Default)]
pub struct ModuleSpec {
    /// Unique module name.
    pub name: String,
    /// Per-target preparers, in setup order.
    pub target_preparers: Vec<BoundPreparer>,
    /// Invocation-wide preparers, in setup order.
    pub multi_target_preparers: Vec<Box<dyn MultiTargetPreparer>>,
    /// Test units, in execution order.
    pub units: Vec<Box<dyn TestUnit>>,
    /// Descriptive metadata.
    pub metadata: ModuleMetadata,
    /// Metric collectors cloned into every attempt.
    pub collectors: Vec<Box<dyn MetricCollector>>,
    /// Build provider embedded in the module's own configuration. Not allowed in a suite.
    pub build_provider: Option<String>,
    /// Result reporters embedded in the module's own configuration. Not allowed in a suite.
    pub result_reporters: Vec<String>,
}

impl ModuleSpec {
    /// Creates an empty spec.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Appends a test unit.
    #[must_use]
    pub fn with_unit(mut self, unit: Box<dyn TestUnit>) -> Self {
        self.units.push(unit);
        self
    }

    /// Appends a per-target preparer.
    #[must_use]
    pub fn with_target_preparer(mut self, preparer: BoundPreparer) -> Self {
        self.target_preparers.push(preparer);
        self
    }

    /// Appends an invocation-wide preparer.
    #[must_use]
    pub fn with_multi_target_preparer(mut self, preparer: Box<dyn MultiTargetPreparer>) -> Self {
        self.multi_target_preparers.push(preparer);
        self
    }

    /// Sets the metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: ModuleMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Appends a metric collector.
    #[must_use]
    pub fn with_collector(mut self, collector: Box<dyn MetricCollector>) -> Self {
        self.collectors.push(collector);
        self
    }

    /// Declares an embedded build provider.
    #[must_use]
    pub fn with_build_provider(mut self, provider: impl Into<String>) -> Self {
        self.build_provider = Some(provider.into());
        self
    }

    /// Declares an embedded result reporter.
    #[must_use]
    pub fn with_result_reporter(mut self, reporter: impl Into<String>) -> Self {
        self.result_reporters.push(reporter.into());
        self
    }

    /// Excludes `filter` (`class` or `class#method`) from every filterable unit.
    ///
    /// Returns the number of units that accepted the filter.
    pub fn add_exclude_filter(&mut self, filter: &str) -> usize {
        let mut accepted = 0;
        for unit in &mut self.units {
            if let Some(filters) = unit.as_case_filter() {
                filters.add_exclude_filter(filter);
                accepted += 1;
            } else {
                tracing::warn!(module = %self.name, unit = unit.name(), filter, "unit does not support filters");
            }
        }
        accepted
    }
}

impl std::fmt::Debug for ModuleSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleSpec")
            .field("name", &self.name)
            .field("units", &self.units.len())
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

/// Checks that every spec can run inside a suite.
///
/// # Errors
///
/// Returns a configuration error for an empty or duplicate name, an embedded
/// build provider, or embedded result reporters.
pub fn validate_specs(specs: &[ModuleSpec]) -> Result<()> {
    let mut seen = BTreeSet::new();
    for spec in specs {
        if spec.name.trim().is_empty() {
            return Err(Error::configuration("module name must not be empty"));
        }
        if !seen.insert(spec.name.as_str()) {
            return Err(Error::configuration(format!(
                "module {} is declared more than once",
                spec.name
            )));
        }
        if let Some(provider) = &spec.build_provider {
            return Err(Error::configuration(format!(
                "module {} cannot be run in a suite: it declares build provider {provider}",
                spec.name
            )));
        }
        if !spec.result_reporters.is_empty() {
            return Err(Error::configuration(format!(
                "module {} cannot be run in a suite: it declares result reporters {:?}",
                spec.name, spec.result_reporters
            )));
        }
    }
    Ok(())
}

/// Returns shard `shard_index` of `shard_count` contiguous shards of `list`.
///
/// Every shard holds `ceil(len / shard_count)` elements except the last, which
/// takes whatever remains. An index at or beyond the list length yields an
/// empty shard. The shards of one list are a partition of it.
#[must_use]
pub fn shard<T>(mut list: Vec<T>, shard_count: u32, shard_index: u32) -> Vec<T> {
    let count = shard_count.max(1) as usize;
    let index = shard_index as usize;
    if count == 1 && index == 0 {
        return list;
    }
    let len = list.len();
    if index >= len || index >= count {
        return Vec::new();
    }
    let per_shard = len.div_ceil(count);
    let start = (index * per_shard).min(len);
    let end = if index == count - 1 {
        len
    } else {
        ((index + 1) * per_shard).min(len)
    };
    list.drain(start..end).collect()
}

/// Outcome of a system status check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusCheckResult {
    /// The system is healthy.
    Success,
    /// Something is off; the module still runs.
    Failure {
        /// What the checker found.
        message: String,
    },
}

/// Checks target health around every module.
#[async_trait]
pub trait SystemStatusChecker: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Runs before the module.
    async fn pre_execution_check(
        &mut self,
        _ctx: &InvocationContext,
    ) -> std::result::Result<StatusCheckResult, TargetError> {
        Ok(StatusCheckResult::Success)
    }

    /// Runs after the module.
    async fn post_execution_check(
        &mut self,
        _ctx: &InvocationContext,
    ) -> std::result::Result<StatusCheckResult, TargetError> {
        Ok(StatusCheckResult::Success)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CheckPhase {
    Pre,
    Post,
}

impl CheckPhase {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Pre => "pre",
            Self::Post => "post",
        }
    }
}

/// What one suite invocation did.
#[derive(Debug, Clone, Default)]
pub struct SuiteSummary {
    /// Outcomes of the modules that ran, in order.
    pub modules: Vec<ModuleOutcome>,
    /// Modules reported as not run.
    pub not_run: Vec<String>,
    /// Retry bookkeeping summed over modules.
    pub retry: RetryStatistics,
    /// True if a stop request ended the suite early.
    pub stopped: bool,
}

impl SuiteSummary {
    fn record(&mut self, outcome: ModuleOutcome) {
        self.retry.absorb(&outcome.retry);
        self.modules.push(outcome);
    }

    /// Returns the names of failed modules.
    pub fn failed_modules(&self) -> impl Iterator<Item = &str> {
        self.modules
            .iter()
            .filter(|m| m.is_failed())
            .map(|m| m.name.as_str())
    }

    /// Returns true if every module ran and passed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.not_run.is_empty() && self.modules.iter().all(|m| !m.is_failed())
    }
}

/// Reports each of `names` as a zero-count failed run.
async fn report_not_run(sink: &mut dyn ResultSink, names: &[String], reason: &str) {
    for name in names {
        sink.module_started(name).await;
        sink.run_started(name, 0, 0).await;
        sink.run_failed(&FailureDescription::new(
            FailureStatus::NotExecuted,
            format!("Module {name} not run due to {reason}"),
        ))
        .await;
        sink.run_ended(Duration::ZERO, &Metrics::new()).await;
        sink.module_ended().await;
    }
}

/// Runs the modules of one shard in order.
pub struct SuiteOrchestrator {
    config: SuiteConfig,
    checkers: Vec<Box<dyn SystemStatusChecker>>,
    metrics: SuiteMetrics,
}

impl SuiteOrchestrator {
    /// Creates an orchestrator with no status checkers.
    #[must_use]
    pub fn new(config: SuiteConfig) -> Self {
        Self {
            config,
            checkers: Vec::new(),
            metrics: SuiteMetrics::new(),
        }
    }

    /// Adds a status checker run around every module.
    #[must_use]
    pub fn with_status_checker(mut self, checker: Box<dyn SystemStatusChecker>) -> Self {
        self.checkers.push(checker);
        self
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &SuiteConfig {
        &self.config
    }

    fn build_module(&self, spec: ModuleSpec) -> ModuleDefinition {
        ModuleDefinition::new(spec.name, spec.units)
            .with_pipeline(PreparationPipeline::new(
                spec.multi_target_preparers,
                spec.target_preparers,
            ))
            .with_metadata(spec.metadata)
            .with_collectors(spec.collectors)
            .with_retry(self.config.retry.clone())
            .with_collect_tests_only(self.config.collect_tests_only)
    }

    /// Validates, shards, and runs `specs` on the invocation's targets.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for specs that cannot run in a suite, and
    /// [`Error::TargetUnavailable`] after the remaining modules were reported
    /// as not run.
    #[tracing::instrument(skip_all, fields(serial = ctx.primary_serial(), shard_index = shard_index, shard_count = shard_count))]
    pub async fn run(
        &mut self,
        ctx: &InvocationContext,
        specs: Vec<ModuleSpec>,
        shard_count: u32,
        shard_index: u32,
        sink: &mut dyn ResultSink,
    ) -> Result<SuiteSummary> {
        validate_specs(&specs)?;
        let modules: Vec<ModuleDefinition> =
            specs.into_iter().map(|spec| self.build_module(spec)).collect();
        let mut remaining: VecDeque<ModuleDefinition> =
            shard(modules, shard_count, shard_index).into();

        let mut summary = SuiteSummary::default();
        if remaining.is_empty() {
            tracing::info!("no modules to run in shard {} of {}", shard_index + 1, shard_count);
            return Ok(summary);
        }
        tracing::info!(
            modules = ?remaining.iter().map(ModuleDefinition::name).collect::<Vec<_>>(),
            "{} running {} modules",
            ctx.primary_serial(),
            remaining.len()
        );

        let mut diagnostics =
            FailureDiagnostics::new(self.config.diagnostics.clone(), ctx.targets().to_vec());
        while let Some(mut module) = remaining.pop_front() {
            self.metrics.set_modules_remaining(remaining.len() + 1);
            if ctx.stop_signal().is_requested() {
                remaining.push_front(module);
                let names: Vec<String> = remaining.iter().map(|m| m.name().to_string()).collect();
                tracing::warn!(modules = ?names, "invocation stop requested, following modules will not run");
                report_not_run(sink, &names, "invocation stop requested").await;
                summary.not_run = names;
                summary.stopped = true;
                self.metrics.set_modules_remaining(0);
                return Ok(summary);
            }

            let span = module_span(module.name(), ctx.primary_serial());
            let outcome = self
                .run_single_module(ctx, &mut module, sink, &mut diagnostics)
                .instrument(span)
                .await;
            match outcome {
                Ok(outcome) => summary.record(outcome),
                Err(e) if e.is_target_unavailable() => {
                    let mut names = Vec::with_capacity(remaining.len() + 1);
                    if module.state() == ModuleState::Created {
                        names.push(module.name().to_string());
                    }
                    names.extend(remaining.iter().map(|m| m.name().to_string()));
                    tracing::error!(modules = ?names, error = %e, "target unavailable, following modules did not run");
                    report_not_run(sink, &names, "target unavailable").await;
                    summary.not_run = names;
                    self.metrics.set_modules_remaining(0);
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }
        self.metrics.set_modules_remaining(0);
        Ok(summary)
    }

    async fn run_single_module(
        &mut self,
        ctx: &InvocationContext,
        module: &mut ModuleDefinition,
        sink: &mut dyn ResultSink,
        diagnostics: &mut FailureDiagnostics,
    ) -> Result<ModuleOutcome> {
        if self.config.reboot_per_module {
            reboot_before_module(ctx).await?;
        }
        if !self.config.skip_system_status_check {
            self.run_status_checks(CheckPhase::Pre, module.name(), ctx, sink)
                .await?;
        }
        let outcome = module.run(ctx, sink, Some(diagnostics)).await?;
        if !self.config.skip_system_status_check {
            self.run_status_checks(CheckPhase::Post, module.name(), ctx, sink)
                .await?;
        }
        Ok(outcome)
    }

    async fn run_status_checks(
        &mut self,
        phase: CheckPhase,
        module: &str,
        ctx: &InvocationContext,
        sink: &mut dyn ResultSink,
    ) -> Result<()> {
        if self.checkers.is_empty() {
            return Ok(());
        }
        tracing::info!(module, phase = phase.as_str(), "running system status checkers");
        let mut failures = Vec::new();
        for checker in &mut self.checkers {
            let result = match phase {
                CheckPhase::Pre => checker.pre_execution_check(ctx).await,
                CheckPhase::Post => checker.post_execution_check(ctx).await,
            };
            match result {
                Ok(StatusCheckResult::Success) => {}
                Ok(StatusCheckResult::Failure { message }) => {
                    tracing::warn!(checker = checker.name(), %message, "system status checker failed");
                    failures.push(checker.name().to_string());
                }
                Err(e) if e.is_unavailable() => return Err(Error::TargetUnavailable { source: e }),
                Err(e) => {
                    tracing::warn!(checker = checker.name(), error = %e, "system status checker errored");
                    failures.push(checker.name().to_string());
                }
            }
        }
        if failures.is_empty() {
            return Ok(());
        }
        tracing::warn!(checkers = ?failures, "failed system status checkers, capturing a bugreport");
        let Some(target) = ctx.primary_target() else {
            return Ok(());
        };
        match target.capture_bugreport(BugreportKind::Full).await {
            Ok(stream) => {
                let name = format!("bugreport-checker-{}-module-{module}", phase.as_str());
                sink.test_log(&name, &stream).await;
            }
            Err(e) if e.is_unavailable() => return Err(Error::TargetUnavailable { source: e }),
            Err(e) => tracing::warn!(serial = target.serial(), error = %e, "checker bugreport not captured"),
        }
        Ok(())
    }
}

/// Reboots every physical target before a module, except production builds.
async fn reboot_before_module(ctx: &InvocationContext) -> Result<()> {
    for target in ctx.physical_targets() {
        match target.is_production_build().await {
            Ok(true) => {
                tracing::error!(
                    serial = target.serial(),
                    "reboot per module should only be used during development, this is a production build"
                );
                continue;
            }
            Ok(false) => {}
            Err(e) if e.is_unavailable() => return Err(Error::TargetUnavailable { source: e }),
            Err(e) => {
                tracing::warn!(serial = target.serial(), error = %e, "build type unknown, not rebooting");
                continue;
            }
        }
        tracing::debug!(serial = target.serial(), "rebooting before starting next module");
        if let Err(e) = target.reboot().await {
            if e.is_unavailable() {
                return Err(Error::TargetUnavailable { source: e });
            }
            tracing::warn!(serial = target.serial(), error = %e, "reboot before module failed");
        }
    }
    Ok(())
}

/// Runs one orchestrator per shard concurrently, one tokio task each.
///
/// Shard `i` runs on `shard_targets[i]`, wrapped with the configured I/O
/// timeouts, and gets its module list from `specs_for_shard(i)`. Every shard
/// reports into `collector`. All shards run to completion; the first error,
/// in shard order, is returned after that.
///
/// # Errors
///
/// Returns the first shard error, or an internal error if a shard task panicked.
pub async fn run_sharded<F>(
    config: SuiteConfig,
    shard_targets: Vec<Vec<Arc<dyn Target>>>,
    specs_for_shard: F,
    collector: SharedCollector,
    stop: StopSignal,
) -> Result<Vec<SuiteSummary>>
where
    F: Fn(u32) -> Vec<ModuleSpec> + Send + Sync + 'static,
{
    let shard_count = u32::try_from(shard_targets.len())
        .map_err(|_| Error::configuration("too many shards"))?;
    if shard_count == 0 {
        return Err(Error::configuration("at least one shard is required"));
    }
    let specs_for_shard = Arc::new(specs_for_shard);

    let mut tasks = JoinSet::new();
    for (shard_index, targets) in (0..shard_count).zip(shard_targets) {
        let targets: Vec<Arc<dyn Target>> = targets
            .into_iter()
            .map(|t| {
                Arc::new(TimedTarget::new(
                    t,
                    config.target_io_timeout,
                    config.target_reboot_timeout,
                )) as Arc<dyn Target>
            })
            .collect();
        let ctx = InvocationContext::new(targets)
            .with_shard(shard_index, shard_count)
            .with_stop_signal(stop.clone());
        let span = invocation_span(&ctx.invocation_id(), shard_index, shard_count);
        let mut orchestrator = SuiteOrchestrator::new(config.clone());
        let mut sink = collector.shard_sink(shard_index);
        let factory = Arc::clone(&specs_for_shard);
        tasks.spawn(
            async move {
                let specs = factory(shard_index);
                let result = orchestrator
                    .run(&ctx, specs, shard_count, shard_index, &mut sink)
                    .await;
                (shard_index, result)
            }
            .instrument(span),
        );
    }

    let mut results = Vec::with_capacity(shard_count as usize);
    while let Some(joined) = tasks.join_next().await {
        let (shard_index, result) = joined
            .map_err(|e| Error::Core(marshal_core::Error::internal(format!("shard task failed: {e}"))))?;
        if let Err(e) = &result {
            tracing::error!(shard_index, error = %e, "shard failed");
        }
        results.push((shard_index, result));
    }
    results.sort_by_key(|(index, _)| *index);
    results.into_iter().map(|(_, result)| result).collect()
}

/// A suite packaged as a test unit, so it can run after other units.
pub struct SuiteRunner {
    name: String,
    orchestrator: SuiteOrchestrator,
    specs: Vec<ModuleSpec>,
    ctx: Option<InvocationContext>,
    summary: Option<SuiteSummary>,
}

impl SuiteRunner {
    /// Creates a runner, validating `specs` up front.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for specs that cannot run in a suite.
    pub fn new(
        name: impl Into<String>,
        orchestrator: SuiteOrchestrator,
        specs: Vec<ModuleSpec>,
    ) -> Result<Self> {
        validate_specs(&specs)?;
        Ok(Self {
            name: name.into(),
            orchestrator,
            specs,
            ctx: None,
            summary: None,
        })
    }

    /// Returns the specs still waiting to run.
    pub fn specs_mut(&mut self) -> &mut Vec<ModuleSpec> {
        &mut self.specs
    }

    /// Returns the summary once the suite ran.
    #[must_use]
    pub const fn summary(&self) -> Option<&SuiteSummary> {
        self.summary.as_ref()
    }
}

impl HasContext for SuiteRunner {
    fn set_context(&mut self, ctx: InvocationContext) {
        self.ctx = Some(ctx);
    }
}

#[async_trait]
impl TestUnit for SuiteRunner {
    fn name(&self) -> &str {
        &self.name
    }

    fn as_has_context(&mut self) -> Option<&mut dyn HasContext> {
        Some(self)
    }

    async fn run(&mut self, sink: &mut dyn ResultSink) -> std::result::Result<(), UnitFault> {
        let Some(ctx) = self.ctx.clone() else {
            return Err(UnitFault::runtime(format!("{} has no invocation context", self.name)));
        };
        let (shard_index, shard_count) = ctx.shard();
        let specs = std::mem::take(&mut self.specs);
        match self
            .orchestrator
            .run(&ctx, specs, shard_count, shard_index, sink)
            .await
        {
            Ok(summary) => {
                self.summary = Some(summary);
                Ok(())
            }
            Err(Error::TargetUnavailable { source }) => Err(UnitFault::Target(source)),
            Err(e) => Err(UnitFault::runtime(e.to_string())),
        }
    }
}

/// Runs the invocation's top-level units in order.
///
/// Each unit gets the capabilities it opted into. A runtime fault is logged and
/// the next unit runs; a lost target aborts the invocation.
///
/// # Errors
///
/// Returns [`Error::TargetUnavailable`] when a unit loses its target.
pub async fn run_invocation(
    ctx: &InvocationContext,
    units: Vec<Box<dyn TestUnit>>,
    sink: &mut dyn ResultSink,
) -> Result<()> {
    let (shard_index, shard_count) = ctx.shard();
    let span = invocation_span(&ctx.invocation_id(), shard_index, shard_count);
    async move {
        for mut unit in units {
            if ctx.stop_signal().is_requested() {
                tracing::warn!(unit = unit.name(), "invocation stop requested, skipping unit");
                continue;
            }
            inject_context(unit.as_mut(), ctx);
            match unit.run(&mut *sink).await {
                Ok(()) => {}
                Err(UnitFault::Target(e)) if e.is_unavailable() => {
                    tracing::error!(unit = unit.name(), error = %e, "target unavailable, aborting invocation");
                    return Err(Error::TargetUnavailable { source: e });
                }
                Err(e) => tracing::error!(unit = unit.name(), error = %e, "test unit failed"),
            }
        }
        Ok(())
    }
    .instrument(span)
    .await
}
