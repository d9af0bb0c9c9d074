//! Suite configuration.
//!
//! [`SuiteConfig`] deserializes with serde defaults for every field and can be
//! overlaid from `MARSHAL_*` environment variables with
//! [`SuiteConfig::from_env`].
//!
//! | Variable | Field |
//! |---|---|
//! | `MARSHAL_MAX_ATTEMPTS` | `retry.max_attempts` |
//! | `MARSHAL_RETRY_STRATEGY` | `retry.strategy` |
//! | `MARSHAL_REBOOT_BEFORE_LAST_ATTEMPT` | `retry.reboot_before_last_attempt` |
//! | `MARSHAL_BUGREPORT_ON_FAILURE` | `diagnostics.bugreport` |
//! | `MARSHAL_BUGREPORT_LITE_ON_FAILURE` | `diagnostics.bugreport_lite` |
//! | `MARSHAL_SCREENSHOT_ON_FAILURE` | `diagnostics.screenshot` |
//! | `MARSHAL_LOGCAT_ON_FAILURE` | `diagnostics.logcat` |
//! | `MARSHAL_REBOOT_ON_FAILURE` | `diagnostics.reboot` |
//! | `MARSHAL_MAX_LOGCAT_BYTES` | `diagnostics.max_logcat_bytes` |
//! | `MARSHAL_REBOOT_PER_MODULE` | `reboot_per_module` |
//! | `MARSHAL_SKIP_SYSTEM_STATUS_CHECK` | `skip_system_status_check` |
//! | `MARSHAL_COLLECT_TESTS_ONLY` | `collect_tests_only` |
//! | `MARSHAL_SHARD_COUNT` | `shard_count` |
//! | `MARSHAL_SHARD_INDEX` | `shard_index` |
//! | `MARSHAL_TARGET_IO_TIMEOUT` | `target_io_timeout` (e.g. `5m`) |
//! | `MARSHAL_TARGET_REBOOT_TIMEOUT` | `target_reboot_timeout` |

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::diagnostics::DiagnosticsConfig;
use crate::error::{Error, Result};
use crate::retry::{RetryConfig, RetryStrategy};

const DEFAULT_TARGET_IO_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const DEFAULT_TARGET_REBOOT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Options of one suite invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SuiteConfig {
    /// Retry applied to every module.
    pub retry: RetryConfig,
    /// Captures taken when a case fails.
    pub diagnostics: DiagnosticsConfig,
    /// Reboot the targets before every module.
    pub reboot_per_module: bool,
    /// Skip the system status checkers around modules.
    pub skip_system_status_check: bool,
    /// Only report cases, without executing them.
    pub collect_tests_only: bool,
    /// Number of shards the module list is split into.
    pub shard_count: u32,
    /// Shard run by this invocation.
    pub shard_index: u32,
    /// Bound on every target operation except reboots.
    #[serde(with = "humantime_serde")]
    pub target_io_timeout: Duration,
    /// Bound on reboots and availability waits.
    #[serde(with = "humantime_serde")]
    pub target_reboot_timeout: Duration,
}

impl Default for SuiteConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            diagnostics: DiagnosticsConfig::default(),
            reboot_per_module: false,
            skip_system_status_check: false,
            collect_tests_only: false,
            shard_count: 1,
            shard_index: 0,
            target_io_timeout: DEFAULT_TARGET_IO_TIMEOUT,
            target_reboot_timeout: DEFAULT_TARGET_REBOOT_TIMEOUT,
        }
    }
}

impl SuiteConfig {
    /// Loads configuration from `MARSHAL_*` environment variables over the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is malformed or the result is invalid.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration through `lookup` over the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a value is malformed or the result is invalid.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let mut config = Self::default();

        if let Some(max) = env.u32("MARSHAL_MAX_ATTEMPTS")? {
            config.retry.max_attempts = max;
        }
        if let Some(strategy) = env.string("MARSHAL_RETRY_STRATEGY") {
            config.retry.strategy = strategy.parse::<RetryStrategy>()?;
        }
        if let Some(reboot) = env.bool("MARSHAL_REBOOT_BEFORE_LAST_ATTEMPT")? {
            config.retry.reboot_before_last_attempt = reboot;
        }

        if let Some(v) = env.bool("MARSHAL_BUGREPORT_ON_FAILURE")? {
            config.diagnostics.bugreport = v;
        }
        if let Some(v) = env.bool("MARSHAL_BUGREPORT_LITE_ON_FAILURE")? {
            config.diagnostics.bugreport_lite = v;
        }
        if let Some(v) = env.bool("MARSHAL_SCREENSHOT_ON_FAILURE")? {
            config.diagnostics.screenshot = v;
        }
        if let Some(v) = env.bool("MARSHAL_LOGCAT_ON_FAILURE")? {
            config.diagnostics.logcat = v;
        }
        if let Some(v) = env.bool("MARSHAL_REBOOT_ON_FAILURE")? {
            config.diagnostics.reboot = v;
        }
        if let Some(v) = env.usize("MARSHAL_MAX_LOGCAT_BYTES")? {
            config.diagnostics.max_logcat_bytes = v;
        }

        if let Some(v) = env.bool("MARSHAL_REBOOT_PER_MODULE")? {
            config.reboot_per_module = v;
        }
        if let Some(v) = env.bool("MARSHAL_SKIP_SYSTEM_STATUS_CHECK")? {
            config.skip_system_status_check = v;
        }
        if let Some(v) = env.bool("MARSHAL_COLLECT_TESTS_ONLY")? {
            config.collect_tests_only = v;
        }
        if let Some(v) = env.u32("MARSHAL_SHARD_COUNT")? {
            config.shard_count = v;
        }
        if let Some(v) = env.u32("MARSHAL_SHARD_INDEX")? {
            config.shard_index = v;
        }
        if let Some(v) = env.duration("MARSHAL_TARGET_IO_TIMEOUT")? {
            config.target_io_timeout = v;
        }
        if let Some(v) = env.duration("MARSHAL_TARGET_REBOOT_TIMEOUT")? {
            config.target_reboot_timeout = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks the configuration for inconsistent values.
    ///
    /// # Errors
    ///
    /// Returns a configuration error describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(Error::configuration("max attempts must be at least 1"));
        }
        if self.shard_count == 0 {
            return Err(Error::configuration("shard count must be at least 1"));
        }
        if self.shard_index >= self.shard_count {
            return Err(Error::configuration(format!(
                "shard index {} is out of range for {} shards",
                self.shard_index, self.shard_count
            )));
        }
        if self.target_io_timeout.is_zero() || self.target_reboot_timeout.is_zero() {
            return Err(Error::configuration("target timeouts must be greater than 0"));
        }
        Ok(())
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).and_then(|v| {
            let trimmed = v.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    fn u32(&self, name: &str) -> Result<Option<u32>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<u32>()
            .map(Some)
            .map_err(|e| Error::configuration(format!("{name} must be a u32: {e}")))
    }

    fn usize(&self, name: &str) -> Result<Option<usize>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<usize>()
            .map(Some)
            .map_err(|e| Error::configuration(format!("{name} must be a usize: {e}")))
    }

    fn bool(&self, name: &str) -> Result<Option<bool>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        parse_bool(name, &v).map(Some)
    }

    fn duration(&self, name: &str) -> Result<Option<Duration>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        humantime_serde::re::humantime::parse_duration(&v)
            .map(Some)
            .map_err(|e| Error::configuration(format!("{name} must be a duration (e.g. 30s, 5m): {e}")))
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    let value = value.trim().to_ascii_lowercase();
    match value.as_str() {
        "true" | "1" | "yes" | "y" => Ok(true),
        "false" | "0" | "no" | "n" => Ok(false),
        _ => Err(Error::configuration(format!(
            "{name} must be a boolean (true/false/1/0)"
        ))),
    }
}
