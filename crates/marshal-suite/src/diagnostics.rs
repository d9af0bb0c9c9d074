//! Diagnostics captured when a test case fails.
//!
//! [`FailureDiagnostics`] is a [`ResultSink`] that reacts to `test_failed` by
//! capturing artifacts from every target of the invocation, in allocation
//! order. Captures are best effort: a failed capture is logged and never
//! changes a test result. Captured artifacts are handed to sibling sinks
//! through [`ResultSink::take_pending_logs`].
//!
//! Artifact names are keyed by test identity and target serial:
//! `<test>-<serial>-bugreport`, `<test>-<serial>-bugreport-lite`,
//! `<test>-<serial>-screenshot`, `<test>-<serial>-logcat`.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use marshal_core::{BugreportKind, LogStream, Target, TargetError};
use serde::{Deserialize, Serialize};

use crate::listener::{LoggedArtifact, ResultSink};
use crate::metrics::SuiteMetrics;
use crate::result::TestDescription;

/// Default cap on the logcat window captured per failure.
pub const DEFAULT_MAX_LOGCAT_BYTES: usize = 500 * 1024;

/// Which diagnostics to capture on failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DiagnosticsConfig {
    /// Capture a full bugreport.
    pub bugreport: bool,
    /// Capture a lightweight bugreport.
    pub bugreport_lite: bool,
    /// Capture a screenshot.
    pub screenshot: bool,
    /// Capture the recent logcat window.
    pub logcat: bool,
    /// Reboot the target after capture (never on production builds).
    pub reboot: bool,
    /// Upper bound of the logcat window, in bytes.
    pub max_logcat_bytes: usize,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            bugreport: false,
            bugreport_lite: false,
            screenshot: false,
            logcat: false,
            reboot: false,
            max_logcat_bytes: DEFAULT_MAX_LOGCAT_BYTES,
        }
    }
}

impl DiagnosticsConfig {
    /// Returns true if any capture is enabled.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.bugreport || self.bugreport_lite || self.screenshot || self.logcat || self.reboot
    }
}

/// Captures diagnostics from every target when a case fails.
pub struct FailureDiagnostics {
    config: DiagnosticsConfig,
    targets: Vec<Arc<dyn Target>>,
    pending: Vec<LoggedArtifact>,
    metrics: SuiteMetrics,
}

impl FailureDiagnostics {
    /// Creates a diagnostics sink over the given targets, in allocation order.
    #[must_use]
    pub fn new(config: DiagnosticsConfig, targets: Vec<Arc<dyn Target>>) -> Self {
        Self {
            config,
            targets,
            pending: Vec::new(),
            metrics: SuiteMetrics::new(),
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &DiagnosticsConfig {
        &self.config
    }

    fn record(
        &mut self,
        kind: &'static str,
        name: String,
        captured: Result<LogStream, TargetError>,
    ) {
        match captured {
            Ok(stream) => {
                tracing::debug!(artifact = %name, bytes = stream.len(), "captured failure diagnostic");
                self.metrics.record_diagnostic(kind, true);
                self.pending.push(LoggedArtifact::new(name, stream));
            }
            Err(e) => {
                tracing::warn!(artifact = %name, error = %e, "failed to capture failure diagnostic");
                self.metrics.record_diagnostic(kind, false);
            }
        }
    }

    /// Captures every enabled diagnostic for `test` from every target.
    #[tracing::instrument(skip_all, fields(test = %test))]
    pub async fn capture(&mut self, test: &TestDescription) {
        if !self.config.is_enabled() {
            return;
        }
        let targets = self.targets.clone();
        for target in &targets {
            let serial = target.serial();
            if self.config.bugreport {
                let captured = target.capture_bugreport(BugreportKind::Full).await;
                self.record("bugreport", format!("{test}-{serial}-bugreport"), captured);
            }
            if self.config.bugreport_lite {
                let captured = target.capture_bugreport(BugreportKind::Lite).await;
                self.record("bugreport_lite", format!("{test}-{serial}-bugreport-lite"), captured);
            }
            if self.config.screenshot {
                let captured = target.capture_screenshot().await;
                self.record("screenshot", format!("{test}-{serial}-screenshot"), captured);
            }
            if self.config.logcat {
                let max_bytes = self.config.max_logcat_bytes;
                let captured = target.capture_logcat_window(max_bytes).await.map(|mut stream| {
                    stream.data = trailing_window(stream.data, max_bytes);
                    stream
                });
                self.record("logcat", format!("{test}-{serial}-logcat"), captured);
            }
            if self.config.reboot {
                self.reboot_unless_production(target.as_ref()).await;
            }
        }
    }

    async fn reboot_unless_production(&mut self, target: &dyn Target) {
        match target.is_production_build().await {
            Ok(false) => {
                let rebooted = target.reboot().await;
                if let Err(e) = &rebooted {
                    tracing::warn!(serial = target.serial(), error = %e, "reboot after failure did not complete");
                }
                self.metrics.record_diagnostic("reboot", rebooted.is_ok());
            }
            Ok(true) => {
                tracing::info!(serial = target.serial(), "not rebooting a production build after failure");
            }
            Err(e) => {
                tracing::warn!(serial = target.serial(), error = %e, "could not read build type, skipping reboot");
            }
        }
    }
}

/// Keeps the most recent `max_bytes` of a captured log.
fn trailing_window(data: Bytes, max_bytes: usize) -> Bytes {
    if data.len() <= max_bytes {
        return data;
    }
    data.slice(data.len() - max_bytes..)
}

#[async_trait]
impl ResultSink for FailureDiagnostics {
    async fn test_failed(&mut self, test: &TestDescription, _trace: &str) {
        self.capture(test).await;
    }

    fn take_pending_logs(&mut self) -> Vec<LoggedArtifact> {
        std::mem::take(&mut self.pending)
    }
}
