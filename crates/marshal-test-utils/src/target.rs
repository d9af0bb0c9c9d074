//! In-memory target with call recording.
//!
//! [`FakeTarget`] answers every operation instantly. Faults are injected per
//! [`Operation`]; [`FakeTarget::disconnect`] makes every later call fail as
//! unavailable, the way a device dropping off the bus does.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use marshal_core::target::{BUILD_TYPE_PROPERTY, LogDataType, PRODUCTION_BUILD_TYPE};
use marshal_core::{BugreportKind, CommandResult, LogStream, Target, TargetError};

/// Kind of a target operation, used to inject faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// `execute_command`.
    Command,
    /// `pull_artifact`.
    Pull,
    /// `reboot`.
    Reboot,
    /// `get_property`.
    Property,
    /// `capture_bugreport`, either kind.
    Bugreport,
    /// `capture_screenshot`.
    Screenshot,
    /// `capture_logcat_window`.
    Logcat,
    /// `wait_for_available`.
    WaitForAvailable,
}

/// Record of a call made on a [`FakeTarget`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetCall {
    /// A shell command ran.
    Command {
        /// The command line.
        command: String,
    },
    /// A file was pulled.
    Pull {
        /// Remote path.
        remote_path: String,
    },
    /// The target rebooted.
    Reboot,
    /// A property was read.
    Property {
        /// Property key.
        key: String,
    },
    /// A bugreport was captured.
    Bugreport {
        /// Flavor requested.
        kind: BugreportKind,
    },
    /// A screenshot was captured.
    Screenshot,
    /// A logcat window was captured.
    Logcat {
        /// Size limit requested.
        max_bytes: usize,
    },
    /// Availability was awaited.
    WaitForAvailable,
}

impl TargetCall {
    /// Returns the operation kind of this call.
    pub const fn operation(&self) -> Operation {
        match self {
            Self::Command { .. } => Operation::Command,
            Self::Pull { .. } => Operation::Pull,
            Self::Reboot => Operation::Reboot,
            Self::Property { .. } => Operation::Property,
            Self::Bugreport { .. } => Operation::Bugreport,
            Self::Screenshot => Operation::Screenshot,
            Self::Logcat { .. } => Operation::Logcat,
            Self::WaitForAvailable => Operation::WaitForAvailable,
        }
    }
}

/// In-memory target for tests.
///
/// Clones share their call log and fault table, so a test can keep a handle
/// after moving the target into an [`Arc<dyn Target>`].
#[derive(Debug, Clone)]
pub struct FakeTarget {
    serial: String,
    is_virtual: bool,
    properties: Arc<Mutex<HashMap<String, String>>>,
    calls: Arc<Mutex<Vec<TargetCall>>>,
    faults: Arc<Mutex<HashMap<Operation, TargetError>>>,
    disconnected: Arc<AtomicBool>,
}

impl FakeTarget {
    /// Creates a physical target running a `userdebug` build.
    pub fn new(serial: impl Into<String>) -> Self {
        let mut properties = HashMap::new();
        properties.insert(BUILD_TYPE_PROPERTY.to_string(), "userdebug".to_string());
        Self {
            serial: serial.into(),
            is_virtual: false,
            properties: Arc::new(Mutex::new(properties)),
            calls: Arc::new(Mutex::new(Vec::new())),
            faults: Arc::new(Mutex::new(HashMap::new())),
            disconnected: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Creates a placeholder target with no device behind it.
    pub fn placeholder(serial: impl Into<String>) -> Self {
        Self {
            is_virtual: true,
            ..Self::new(serial)
        }
    }

    /// Makes the target report a production build.
    #[must_use]
    pub fn production(self) -> Self {
        self.set_property(BUILD_TYPE_PROPERTY, PRODUCTION_BUILD_TYPE);
        self
    }

    /// Sets a system property.
    pub fn set_property(&self, key: &str, value: &str) {
        self.properties
            .lock()
            .expect("lock")
            .insert(key.to_string(), value.to_string());
    }

    /// Removes a system property.
    pub fn clear_property(&self, key: &str) {
        self.properties.lock().expect("lock").remove(key);
    }

    /// Returns a shared handle for use as `Arc<dyn Target>`.
    pub fn shared(&self) -> Arc<dyn Target> {
        Arc::new(self.clone())
    }

    /// Returns every call made so far.
    pub fn calls(&self) -> Vec<TargetCall> {
        self.calls.lock().expect("lock").clone()
    }

    /// Returns the number of calls of the given kind.
    pub fn count(&self, operation: Operation) -> usize {
        self.calls
            .lock()
            .expect("lock")
            .iter()
            .filter(|c| c.operation() == operation)
            .count()
    }

    /// Clears recorded calls.
    pub fn clear_calls(&self) {
        self.calls.lock().expect("lock").clear();
    }

    /// Makes every later call of `operation` fail with `error`.
    pub fn inject_fault(&self, operation: Operation, error: TargetError) {
        self.faults.lock().expect("lock").insert(operation, error);
    }

    /// Clears all injected faults.
    pub fn clear_faults(&self) {
        self.faults.lock().expect("lock").clear();
    }

    /// Makes every later call fail as unavailable.
    pub fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }

    /// Brings a disconnected target back.
    pub fn reconnect(&self) {
        self.disconnected.store(false, Ordering::SeqCst);
    }

    /// Returns an unavailable error carrying this target's serial.
    pub fn unavailable(&self) -> TargetError {
        TargetError::unavailable(&self.serial, "device offline")
    }

    fn record(&self, call: TargetCall) -> Result<(), TargetError> {
        let operation = call.operation();
        self.calls.lock().expect("lock").push(call);
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(self.unavailable());
        }
        match self.faults.lock().expect("lock").get(&operation) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn stream(&self, data_type: LogDataType, label: &str) -> LogStream {
        LogStream::new(
            data_type,
            Bytes::from(format!("{label} from {}", self.serial)),
        )
    }
}

#[async_trait]
impl Target for FakeTarget {
    fn serial(&self) -> &str {
        &self.serial
    }

    fn is_virtual(&self) -> bool {
        self.is_virtual
    }

    async fn execute_command(
        &self,
        command: &str,
        _timeout: Duration,
    ) -> Result<CommandResult, TargetError> {
        self.record(TargetCall::Command {
            command: command.to_string(),
        })?;
        Ok(CommandResult::success(""))
    }

    async fn pull_artifact(&self, remote_path: &str) -> Result<PathBuf, TargetError> {
        self.record(TargetCall::Pull {
            remote_path: remote_path.to_string(),
        })?;
        let file_name = remote_path.rsplit('/').next().unwrap_or(remote_path);
        Ok(std::env::temp_dir().join(format!("{}-{file_name}", self.serial)))
    }

    async fn reboot(&self) -> Result<(), TargetError> {
        self.record(TargetCall::Reboot)
    }

    async fn get_property(&self, key: &str) -> Result<Option<String>, TargetError> {
        self.record(TargetCall::Property {
            key: key.to_string(),
        })?;
        Ok(self.properties.lock().expect("lock").get(key).cloned())
    }

    async fn capture_bugreport(&self, kind: BugreportKind) -> Result<LogStream, TargetError> {
        self.record(TargetCall::Bugreport { kind })?;
        Ok(match kind {
            BugreportKind::Full => self.stream(LogDataType::Bugreport, "bugreport"),
            BugreportKind::Lite => self.stream(LogDataType::BugreportLite, "bugreport-lite"),
        })
    }

    async fn capture_screenshot(&self) -> Result<LogStream, TargetError> {
        self.record(TargetCall::Screenshot)?;
        Ok(self.stream(LogDataType::Screenshot, "screenshot"))
    }

    async fn capture_logcat_window(&self, max_bytes: usize) -> Result<LogStream, TargetError> {
        self.record(TargetCall::Logcat { max_bytes })?;
        let mut stream = self.stream(LogDataType::Logcat, "logcat");
        stream.data.truncate(max_bytes);
        Ok(stream)
    }

    async fn wait_for_available(&self, _timeout: Duration) -> Result<(), TargetError> {
        self.record(TargetCall::WaitForAvailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_calls_and_injects_faults() {
        let target = FakeTarget::new("dev-1");
        target.reboot().await.unwrap();
        target.inject_fault(
            Operation::Screenshot,
            TargetError::command_failed("dev-1", "no display"),
        );
        assert!(target.capture_screenshot().await.is_err());
        assert_eq!(target.calls(), vec![TargetCall::Reboot, TargetCall::Screenshot]);
    }

    #[tokio::test]
    async fn disconnect_fails_everything_as_unavailable() {
        let target = FakeTarget::new("dev-1");
        let shared = target.shared();
        target.disconnect();
        let err = shared.reboot().await.unwrap_err();
        assert!(err.is_unavailable());
        assert_eq!(err.serial(), "dev-1");
    }

    #[tokio::test]
    async fn production_build_is_detected() {
        let target = FakeTarget::new("dev-1").production();
        assert!(target.is_production_build().await.unwrap());
        assert!(!FakeTarget::new("dev-2").is_production_build().await.unwrap());
    }
}
