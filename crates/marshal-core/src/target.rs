//! The capability surface of an allocated target (device).
//!
//! The harness never talks to a device directly. Everything it needs is
//! expressed by [`Target`]: command execution, artifact pull, reboot, property
//! reads and the diagnostic captures. Every operation may fail with a
//! [`TargetError`]; only [`TargetError::is_unavailable`] errors are treated as
//! fatal by the engine.
//!
//! [`TimedTarget`] bounds every operation by an explicit timeout. A timeout at
//! this boundary is classified as an unavailable target.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Property holding the build flavor of a target.
pub const BUILD_TYPE_PROPERTY: &str = "ro.build.type";

/// Build flavor value of production builds.
pub const PRODUCTION_BUILD_TYPE: &str = "user";

/// Errors raised at the target I/O boundary.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TargetError {
    /// Communication with the target was lost and could not be recovered.
    #[error("target {serial} unavailable: {message}")]
    Unavailable {
        /// Serial of the target.
        serial: String,
        /// Description of the loss.
        message: String,
    },

    /// The target hung, but recovery brought it back.
    #[error("target {serial} was unresponsive and recovered: {message}")]
    UnresponsiveRecovered {
        /// Serial of the target.
        serial: String,
        /// Description of what hung.
        message: String,
    },

    /// An operation reached the target but did not succeed.
    #[error("command on target {serial} failed: {message}")]
    CommandFailed {
        /// Serial of the target.
        serial: String,
        /// Description of the failure.
        message: String,
    },

    /// An operation exceeded its timeout.
    #[error("{operation} on target {serial} timed out after {after:?}")]
    Timeout {
        /// Serial of the target.
        serial: String,
        /// Name of the operation that timed out.
        operation: &'static str,
        /// The timeout that elapsed.
        after: Duration,
    },
}

impl TargetError {
    /// Creates an unavailable error.
    #[must_use]
    pub fn unavailable(serial: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unavailable {
            serial: serial.into(),
            message: message.into(),
        }
    }

    /// Creates an unresponsive-recovered error.
    #[must_use]
    pub fn unresponsive_recovered(serial: impl Into<String>, message: impl Into<String>) -> Self {
        Self::UnresponsiveRecovered {
            serial: serial.into(),
            message: message.into(),
        }
    }

    /// Creates a command failure.
    #[must_use]
    pub fn command_failed(serial: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CommandFailed {
            serial: serial.into(),
            message: message.into(),
        }
    }

    /// Returns true if this error means the target is gone for the rest of the invocation.
    ///
    /// Timeouts count: a timeout at the I/O boundary is a communication loss.
    #[must_use]
    pub const fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Timeout { .. })
    }

    /// Returns the serial of the target that raised the error.
    #[must_use]
    pub fn serial(&self) -> &str {
        match self {
            Self::Unavailable { serial, .. }
            | Self::UnresponsiveRecovered { serial, .. }
            | Self::CommandFailed { serial, .. }
            | Self::Timeout { serial, .. } => serial,
        }
    }
}

/// Exit classification of a command run on a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStatus {
    /// The command exited with status zero.
    Success,
    /// The command exited with a non-zero status.
    Failed,
    /// The command did not finish within its timeout.
    TimedOut,
}

/// Output of a command run on a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    /// Exit classification.
    pub status: CommandStatus,
    /// Exit code, when the command exited.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandResult {
    /// Creates a successful result with the given stdout.
    #[must_use]
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            status: CommandStatus::Success,
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Returns true if the command succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == CommandStatus::Success
    }
}

/// Flavor of a bugreport capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BugreportKind {
    /// Full bugreport, slow and large.
    Full,
    /// Lightweight bugreport.
    Lite,
}

/// Type tag of a named binary artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogDataType {
    /// Full bugreport archive.
    Bugreport,
    /// Lightweight bugreport archive.
    BugreportLite,
    /// PNG screenshot.
    Screenshot,
    /// Logcat text.
    Logcat,
    /// Generic text log.
    Text,
    /// Anything else.
    Unknown,
}

impl fmt::Display for LogDataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bugreport => write!(f, "BUGREPORT"),
            Self::BugreportLite => write!(f, "BUGREPORT_LITE"),
            Self::Screenshot => write!(f, "SCREENSHOT"),
            Self::Logcat => write!(f, "LOGCAT"),
            Self::Text => write!(f, "TEXT"),
            Self::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// A captured byte stream with its type tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogStream {
    /// Type tag of the data.
    pub data_type: LogDataType,
    /// Raw bytes.
    pub data: Bytes,
}

impl LogStream {
    /// Creates a new log stream.
    #[must_use]
    pub fn new(data_type: LogDataType, data: impl Into<Bytes>) -> Self {
        Self {
            data_type,
            data: data.into(),
        }
    }

    /// Returns the size of the stream in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if nothing was captured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// An allocated device under test.
///
/// Implementations own the wire protocol. Operations take `&self`; a target is
/// shared as `Arc<dyn Target>` between the suite, its modules, and diagnostics.
#[async_trait]
pub trait Target: Send + Sync {
    /// Stable identity of the target.
    fn serial(&self) -> &str;

    /// Returns true for placeholder targets with no physical device behind them.
    fn is_virtual(&self) -> bool {
        false
    }

    /// Runs a shell command on the target.
    async fn execute_command(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandResult, TargetError>;

    /// Pulls a file from the target to a local path.
    async fn pull_artifact(&self, remote_path: &str) -> Result<PathBuf, TargetError>;

    /// Reboots the target and waits for it to come back.
    async fn reboot(&self) -> Result<(), TargetError>;

    /// Reads a system property. `Ok(None)` when the property is unset.
    async fn get_property(&self, key: &str) -> Result<Option<String>, TargetError>;

    /// Captures a bugreport.
    async fn capture_bugreport(&self, kind: BugreportKind) -> Result<LogStream, TargetError>;

    /// Captures a screenshot.
    async fn capture_screenshot(&self) -> Result<LogStream, TargetError>;

    /// Captures at most `max_bytes` of the most recent logcat output.
    async fn capture_logcat_window(&self, max_bytes: usize) -> Result<LogStream, TargetError>;

    /// Blocks until the target is available again.
    async fn wait_for_available(&self, timeout: Duration) -> Result<(), TargetError>;

    /// Returns true when the target runs a production build.
    async fn is_production_build(&self) -> Result<bool, TargetError> {
        let build_type = self.get_property(BUILD_TYPE_PROPERTY).await?;
        Ok(build_type.as_deref() == Some(PRODUCTION_BUILD_TYPE))
    }
}

/// A [`Target`] decorator bounding every operation by a timeout.
///
/// Reboot and availability waits use `reboot_timeout`; everything else uses
/// `io_timeout`. An elapsed timeout becomes [`TargetError::Timeout`].
#[derive(Clone)]
pub struct TimedTarget {
    inner: Arc<dyn Target>,
    io_timeout: Duration,
    reboot_timeout: Duration,
}

impl TimedTarget {
    /// Wraps a target with the given timeouts.
    #[must_use]
    pub fn new(inner: Arc<dyn Target>, io_timeout: Duration, reboot_timeout: Duration) -> Self {
        Self {
            inner,
            io_timeout,
            reboot_timeout,
        }
    }

    async fn bounded<T, F>(
        &self,
        operation: &'static str,
        after: Duration,
        fut: F,
    ) -> Result<T, TargetError>
    where
        F: Future<Output = Result<T, TargetError>> + Send,
    {
        if let Ok(result) = tokio::time::timeout(after, fut).await {
            result
        } else {
            tracing::warn!(serial = self.inner.serial(), operation, ?after, "target operation timed out");
            Err(TargetError::Timeout {
                serial: self.inner.serial().to_string(),
                operation,
                after,
            })
        }
    }
}

#[async_trait]
impl Target for TimedTarget {
    fn serial(&self) -> &str {
        self.inner.serial()
    }

    fn is_virtual(&self) -> bool {
        self.inner.is_virtual()
    }

    async fn execute_command(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandResult, TargetError> {
        // The command's own timeout wins when it is shorter.
        let after = timeout.min(self.io_timeout);
        self.bounded(
            "execute_command",
            after,
            self.inner.execute_command(command, timeout),
        )
        .await
    }

    async fn pull_artifact(&self, remote_path: &str) -> Result<PathBuf, TargetError> {
        self.bounded(
            "pull_artifact",
            self.io_timeout,
            self.inner.pull_artifact(remote_path),
        )
        .await
    }

    async fn reboot(&self) -> Result<(), TargetError> {
        self.bounded("reboot", self.reboot_timeout, self.inner.reboot())
            .await
    }

    async fn get_property(&self, key: &str) -> Result<Option<String>, TargetError> {
        self.bounded("get_property", self.io_timeout, self.inner.get_property(key))
            .await
    }

    async fn capture_bugreport(&self, kind: BugreportKind) -> Result<LogStream, TargetError> {
        self.bounded(
            "capture_bugreport",
            self.io_timeout,
            self.inner.capture_bugreport(kind),
        )
        .await
    }

    async fn capture_screenshot(&self) -> Result<LogStream, TargetError> {
        self.bounded(
            "capture_screenshot",
            self.io_timeout,
            self.inner.capture_screenshot(),
        )
        .await
    }

    async fn capture_logcat_window(&self, max_bytes: usize) -> Result<LogStream, TargetError> {
        self.bounded(
            "capture_logcat_window",
            self.io_timeout,
            self.inner.capture_logcat_window(max_bytes),
        )
        .await
    }

    async fn wait_for_available(&self, timeout: Duration) -> Result<(), TargetError> {
        self.bounded(
            "wait_for_available",
            timeout.min(self.reboot_timeout),
            self.inner.wait_for_available(timeout),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SlowTarget;

    #[async_trait]
    impl Target for SlowTarget {
        fn serial(&self) -> &str {
            "slow-1"
        }

        async fn execute_command(
            &self,
            _command: &str,
            _timeout: Duration,
        ) -> Result<CommandResult, TargetError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(CommandResult::success(""))
        }

        async fn pull_artifact(&self, _remote_path: &str) -> Result<PathBuf, TargetError> {
            Ok(PathBuf::from("/tmp/artifact"))
        }

        async fn reboot(&self) -> Result<(), TargetError> {
            tokio::time::sleep(Duration::from_secs(600)).await;
            Ok(())
        }

        async fn get_property(&self, key: &str) -> Result<Option<String>, TargetError> {
            Ok((key == BUILD_TYPE_PROPERTY).then(|| "user".to_string()))
        }

        async fn capture_bugreport(&self, _kind: BugreportKind) -> Result<LogStream, TargetError> {
            Ok(LogStream::new(LogDataType::Bugreport, "br"))
        }

        async fn capture_screenshot(&self) -> Result<LogStream, TargetError> {
            Ok(LogStream::new(LogDataType::Screenshot, "png"))
        }

        async fn capture_logcat_window(&self, _max_bytes: usize) -> Result<LogStream, TargetError> {
            Ok(LogStream::new(LogDataType::Logcat, "log"))
        }

        async fn wait_for_available(&self, _timeout: Duration) -> Result<(), TargetError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timed_target_converts_elapsed_timeout() {
        let target = TimedTarget::new(
            Arc::new(SlowTarget),
            Duration::from_secs(5),
            Duration::from_secs(30),
        );

        let err = target
            .execute_command("ls", Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(err.is_unavailable());
        assert!(matches!(
            err,
            TargetError::Timeout {
                operation: "execute_command",
                ..
            }
        ));

        let err = target.reboot().await.unwrap_err();
        assert_eq!(err.serial(), "slow-1");
    }

    #[tokio::test]
    async fn production_build_is_detected_from_property() {
        assert!(SlowTarget.is_production_build().await.unwrap());
    }

    #[test]
    fn recovered_error_is_not_fatal() {
        let err = TargetError::unresponsive_recovered("dev-1", "adb hung");
        assert!(!err.is_unavailable());
        assert!(TargetError::unavailable("dev-1", "usb gone").is_unavailable());
    }
}
