//! Scripted test units.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use marshal_core::TargetError;
use marshal_suite::listener::ResultSink;
use marshal_suite::result::{Metrics, TestDescription};
use marshal_suite::unit::{CaseFilter, CaseFilterSet, TestCollector, TestUnit, UnitFault};

/// How one scripted case behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseScript {
    /// Always passes.
    Pass,
    /// Always fails.
    Fail,
    /// Fails on its first `n` executions, then passes.
    FailTimes(u32),
    /// Reports an assumption failure.
    AssumptionFailure,
    /// Reports itself ignored.
    Ignored,
}

#[derive(Debug, Clone)]
enum ScriptedFault {
    Runtime(String),
    Target(TargetError),
}

impl ScriptedFault {
    fn to_fault(&self) -> UnitFault {
        match self {
            Self::Runtime(message) => UnitFault::runtime(message.clone()),
            Self::Target(e) => UnitFault::Target(e.clone()),
        }
    }
}

/// Shared record of the case methods each execution of a [`ScriptedUnit`] started.
#[derive(Debug, Clone, Default)]
pub struct ExecutionLog(Arc<Mutex<Vec<Vec<String>>>>);

impl ExecutionLog {
    /// Returns one entry per execution, listing the methods started.
    pub fn executions(&self) -> Vec<Vec<String>> {
        self.0.lock().expect("lock").clone()
    }

    /// Returns the number of executions.
    pub fn len(&self) -> usize {
        self.0.lock().expect("lock").len()
    }

    /// Returns true if the unit never ran.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn begin(&self) {
        self.0.lock().expect("lock").push(Vec::new());
    }

    fn started(&self, method: &str) {
        if let Some(last) = self.0.lock().expect("lock").last_mut() {
            last.push(method.to_string());
        }
    }
}

/// A unit reporting a fixed list of cases under one run name.
///
/// Cases belong to a single class. Filters are honoured unless the unit is
/// built with [`ScriptedUnit::not_filterable`].
#[derive(Debug, Clone)]
pub struct ScriptedUnit {
    run_name: String,
    class_name: String,
    cases: Vec<(String, CaseScript)>,
    failures_left: HashMap<String, u32>,
    filters: CaseFilterSet,
    filterable: bool,
    collect_only: bool,
    fault_at: Option<(usize, ScriptedFault)>,
    expected_override: Option<usize>,
    log: ExecutionLog,
}

impl ScriptedUnit {
    /// Creates a unit with no cases. The class name defaults to the run name.
    pub fn new(run_name: impl Into<String>) -> Self {
        let run_name = run_name.into();
        Self {
            class_name: run_name.clone(),
            run_name,
            cases: Vec::new(),
            failures_left: HashMap::new(),
            filters: CaseFilterSet::new(),
            filterable: true,
            collect_only: false,
            fault_at: None,
            expected_override: None,
            log: ExecutionLog::default(),
        }
    }

    /// Creates a unit with `count` passing cases named `test0`, `test1`, ...
    pub fn passing(run_name: impl Into<String>, count: usize) -> Self {
        (0..count).fold(Self::new(run_name), |unit, i| {
            unit.with_case(format!("test{i}"), CaseScript::Pass)
        })
    }

    /// Sets the class name of every case.
    #[must_use]
    pub fn with_class(mut self, class_name: impl Into<String>) -> Self {
        self.class_name = class_name.into();
        self
    }

    /// Appends a case.
    #[must_use]
    pub fn with_case(mut self, method: impl Into<String>, script: CaseScript) -> Self {
        let method = method.into();
        if let CaseScript::FailTimes(n) = script {
            self.failures_left.insert(method.clone(), n);
        }
        self.cases.push((method, script));
        self
    }

    /// Ignores filters and always runs every case.
    #[must_use]
    pub fn not_filterable(mut self) -> Self {
        self.filterable = false;
        self
    }

    /// Raises a runtime fault before starting the case at `index`.
    #[must_use]
    pub fn failing_at(mut self, index: usize, message: impl Into<String>) -> Self {
        self.fault_at = Some((index, ScriptedFault::Runtime(message.into())));
        self
    }

    /// Raises a target error before starting the case at `index`.
    #[must_use]
    pub fn target_error_at(mut self, index: usize, error: TargetError) -> Self {
        self.fault_at = Some((index, ScriptedFault::Target(error)));
        self
    }

    /// Announces `count` cases regardless of how many are scripted.
    #[must_use]
    pub fn announcing(mut self, count: usize) -> Self {
        self.expected_override = Some(count);
        self
    }

    /// Returns a handle to the execution log.
    pub fn execution_log(&self) -> ExecutionLog {
        self.log.clone()
    }

    /// Returns the description of the case `method`.
    pub fn description(&self, method: &str) -> TestDescription {
        TestDescription::new(&self.class_name, method)
    }

    /// Boxes the unit.
    pub fn boxed(self) -> Box<dyn TestUnit> {
        Box::new(self)
    }

    fn selected(&self) -> Vec<(String, CaseScript)> {
        self.cases
            .iter()
            .filter(|(method, _)| {
                !self.filterable
                    || self
                        .filters
                        .should_run(&TestDescription::new(&self.class_name, method))
            })
            .cloned()
            .collect()
    }

    fn fails_now(&mut self, method: &str, script: CaseScript) -> bool {
        match script {
            CaseScript::Fail => true,
            CaseScript::FailTimes(_) => match self.failures_left.get_mut(method) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    true
                }
                _ => false,
            },
            _ => false,
        }
    }
}

impl CaseFilter for ScriptedUnit {
    fn add_include_filter(&mut self, filter: &str) {
        self.filters.add_include_filter(filter);
    }

    fn add_exclude_filter(&mut self, filter: &str) {
        self.filters.add_exclude_filter(filter);
    }

    fn clear_include_filters(&mut self) {
        self.filters.clear_include_filters();
    }

    fn include_filters(&self) -> Vec<String> {
        self.filters.include_filters()
    }
}

impl TestCollector for ScriptedUnit {
    fn set_collect_tests_only(&mut self, collect_only: bool) {
        self.collect_only = collect_only;
    }
}

#[async_trait]
impl TestUnit for ScriptedUnit {
    fn name(&self) -> &str {
        &self.run_name
    }

    fn as_case_filter(&mut self) -> Option<&mut dyn CaseFilter> {
        if self.filterable {
            Some(self)
        } else {
            None
        }
    }

    fn as_test_collector(&mut self) -> Option<&mut dyn TestCollector> {
        Some(self)
    }

    async fn run(&mut self, sink: &mut dyn ResultSink) -> Result<(), UnitFault> {
        let selected = self.selected();
        let expected = self.expected_override.unwrap_or(selected.len());
        self.log.begin();
        sink.run_started(&self.run_name, expected, 0).await;

        for (index, (method, script)) in selected.into_iter().enumerate() {
            if let Some((at, fault)) = &self.fault_at {
                if *at == index {
                    return Err(fault.to_fault());
                }
            }
            let test = TestDescription::new(&self.class_name, &method);
            self.log.started(&method);
            sink.test_started(&test, Utc::now()).await;
            if !self.collect_only {
                if self.fails_now(&method, script) {
                    sink.test_failed(&test, &format!("{test} failed: expected true"))
                        .await;
                } else if script == CaseScript::AssumptionFailure {
                    sink.test_assumption_failure(&test, "assumption violated").await;
                } else if script == CaseScript::Ignored {
                    sink.test_ignored(&test).await;
                }
            }
            sink.test_ended(&test, Utc::now(), &Metrics::new()).await;
        }

        sink.run_ended(Duration::from_millis(1), &Metrics::new()).await;
        Ok(())
    }
}
