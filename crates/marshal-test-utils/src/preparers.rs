//! Preparers journaling their setup and teardown.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use marshal_core::{InvocationContext, Target, TargetError};
use marshal_suite::preparer::{BoundPreparer, MultiTargetPreparer, PreparerError, TargetPreparer};

/// Ordered log shared by several [`RecordingPreparer`]s.
///
/// Entries read `setup:<name>` and `teardown:<name>`.
#[derive(Debug, Clone, Default)]
pub struct PreparerJournal {
    entries: Arc<Mutex<Vec<String>>>,
    causes: Arc<Mutex<Vec<Option<String>>>>,
}

impl PreparerJournal {
    /// Creates an empty journal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every entry in order.
    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().expect("lock").clone()
    }

    /// Returns the preparers torn down, in teardown order.
    pub fn torn_down(&self) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter_map(|e| e.strip_prefix("teardown:").map(str::to_string))
            .collect()
    }

    /// Returns the cause passed to each teardown, in teardown order.
    pub fn teardown_causes(&self) -> Vec<Option<String>> {
        self.causes.lock().expect("lock").clone()
    }

    fn push(&self, entry: String) {
        self.entries.lock().expect("lock").push(entry);
    }
}

/// A preparer that records each call and can be scripted to fail.
///
/// Implements both [`MultiTargetPreparer`] and [`TargetPreparer`].
#[derive(Debug, Clone)]
pub struct RecordingPreparer {
    name: String,
    journal: PreparerJournal,
    setup_error: Option<PreparerError>,
    teardown_error: Option<PreparerError>,
    disabled: bool,
}

impl RecordingPreparer {
    /// Creates a preparer writing to `journal`.
    pub fn new(name: impl Into<String>, journal: &PreparerJournal) -> Self {
        Self {
            name: name.into(),
            journal: journal.clone(),
            setup_error: None,
            teardown_error: None,
            disabled: false,
        }
    }

    /// Fails setup with `message`.
    #[must_use]
    pub fn failing_setup(mut self, message: impl Into<String>) -> Self {
        self.setup_error = Some(PreparerError::failed(message));
        self
    }

    /// Fails setup because the target was lost.
    #[must_use]
    pub fn losing_target_in_setup(mut self, serial: &str) -> Self {
        self.setup_error = Some(PreparerError::Target(TargetError::unavailable(
            serial,
            "device offline during setup",
        )));
        self
    }

    /// Fails teardown with `message`.
    #[must_use]
    pub fn failing_teardown(mut self, message: impl Into<String>) -> Self {
        self.teardown_error = Some(PreparerError::failed(message));
        self
    }

    /// Marks the preparer disabled.
    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }

    /// Boxes the preparer as invocation-wide.
    pub fn multi(self) -> Box<dyn MultiTargetPreparer> {
        Box::new(self)
    }

    /// Binds the preparer to the primary target.
    pub fn on_primary(self) -> BoundPreparer {
        BoundPreparer::primary(Box::new(self))
    }

    /// Binds the preparer to the target at `index`.
    pub fn on_target(self, index: usize) -> BoundPreparer {
        BoundPreparer::on(index, Box::new(self))
    }

    fn do_set_up(&self) -> Result<(), PreparerError> {
        self.journal.push(format!("setup:{}", self.name));
        self.setup_error.clone().map_or(Ok(()), Err)
    }

    fn do_tear_down(&self, cause: Option<&str>) -> Result<(), PreparerError> {
        self.journal.push(format!("teardown:{}", self.name));
        self.journal
            .causes
            .lock()
            .expect("lock")
            .push(cause.map(str::to_string));
        self.teardown_error.clone().map_or(Ok(()), Err)
    }
}

#[async_trait]
impl MultiTargetPreparer for RecordingPreparer {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_disabled(&self) -> bool {
        self.disabled
    }

    async fn set_up(&mut self, _ctx: &InvocationContext) -> Result<(), PreparerError> {
        self.do_set_up()
    }

    async fn tear_down(
        &mut self,
        _ctx: &InvocationContext,
        cause: Option<&str>,
    ) -> Result<(), PreparerError> {
        self.do_tear_down(cause)
    }
}

#[async_trait]
impl TargetPreparer for RecordingPreparer {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_disabled(&self) -> bool {
        self.disabled
    }

    async fn set_up(
        &mut self,
        _target: &Arc<dyn Target>,
        _ctx: &InvocationContext,
    ) -> Result<(), PreparerError> {
        self.do_set_up()
    }

    async fn tear_down(
        &mut self,
        _target: &Arc<dyn Target>,
        _ctx: &InvocationContext,
        cause: Option<&str>,
    ) -> Result<(), PreparerError> {
        self.do_tear_down(cause)
    }
}
