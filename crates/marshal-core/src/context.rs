//! The per-invocation context.
//!
//! One [`InvocationContext`] is built when an invocation starts and is passed
//! by reference into every engine call. It holds the targets the invocation
//! owns, the build under test, and the stop signal polled between tests and
//! modules. Nothing in marshal reads process-global state.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use crate::id::InvocationId;
use crate::target::Target;

/// Cooperative "invocation stop requested" flag.
///
/// Cloning shares the flag. The engine polls it between modules and between
/// retry attempts; a running test unit is always allowed to finish.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    /// Creates a signal in the not-requested state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests the invocation to stop.
    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns true once a stop has been requested.
    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Handle to the build under test.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildArtifact {
    /// Build identifier.
    pub build_id: String,
    /// Build flavor (e.g. `sdk_phone64-userdebug`).
    #[serde(default)]
    pub flavor: String,
    /// Named local files fetched for this build.
    #[serde(default)]
    pub files: BTreeMap<String, PathBuf>,
}

impl BuildArtifact {
    /// Creates a build handle with no files.
    #[must_use]
    pub fn new(build_id: impl Into<String>, flavor: impl Into<String>) -> Self {
        Self {
            build_id: build_id.into(),
            flavor: flavor.into(),
            files: BTreeMap::new(),
        }
    }

    /// Adds a named file.
    #[must_use]
    pub fn with_file(mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.files.insert(name.into(), path.into());
        self
    }
}

/// Everything one invocation owns.
#[derive(Clone)]
pub struct InvocationContext {
    invocation_id: InvocationId,
    targets: Vec<Arc<dyn Target>>,
    build: Option<Arc<BuildArtifact>>,
    stop: StopSignal,
    shard_index: u32,
    shard_count: u32,
}

impl InvocationContext {
    /// Creates a context owning the given targets, in allocation order.
    #[must_use]
    pub fn new(targets: Vec<Arc<dyn Target>>) -> Self {
        Self {
            invocation_id: InvocationId::generate(),
            targets,
            build: None,
            stop: StopSignal::new(),
            shard_index: 0,
            shard_count: 1,
        }
    }

    /// Attaches the build under test.
    #[must_use]
    pub fn with_build(mut self, build: BuildArtifact) -> Self {
        self.build = Some(Arc::new(build));
        self
    }

    /// Uses an externally owned stop signal.
    #[must_use]
    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    /// Records which shard this invocation runs.
    #[must_use]
    pub const fn with_shard(mut self, shard_index: u32, shard_count: u32) -> Self {
        self.shard_index = shard_index;
        self.shard_count = shard_count;
        self
    }

    /// Returns the invocation ID.
    #[must_use]
    pub const fn invocation_id(&self) -> InvocationId {
        self.invocation_id
    }

    /// Returns every target in allocation order.
    #[must_use]
    pub fn targets(&self) -> &[Arc<dyn Target>] {
        &self.targets
    }

    /// Returns the target at `index`.
    #[must_use]
    pub fn target(&self, index: usize) -> Option<&Arc<dyn Target>> {
        self.targets.get(index)
    }

    /// Returns the first allocated target.
    #[must_use]
    pub fn primary_target(&self) -> Option<&Arc<dyn Target>> {
        self.targets.first()
    }

    /// Returns the targets backed by a real device, in allocation order.
    pub fn physical_targets(&self) -> impl Iterator<Item = &Arc<dyn Target>> {
        self.targets.iter().filter(|t| !t.is_virtual())
    }

    /// Returns the build under test.
    #[must_use]
    pub fn build(&self) -> Option<&Arc<BuildArtifact>> {
        self.build.as_ref()
    }

    /// Returns the stop signal.
    #[must_use]
    pub fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    /// Returns `(shard_index, shard_count)`.
    #[must_use]
    pub const fn shard(&self) -> (u32, u32) {
        (self.shard_index, self.shard_count)
    }

    /// Returns the serial of the primary target, or `"none"`.
    #[must_use]
    pub fn primary_serial(&self) -> &str {
        self.primary_target().map_or("none", |t| t.serial())
    }
}

impl fmt::Debug for InvocationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvocationContext")
            .field("invocation_id", &self.invocation_id)
            .field(
                "targets",
                &self.targets.iter().map(|t| t.serial()).collect::<Vec<_>>(),
            )
            .field("build", &self.build)
            .field("stop_requested", &self.stop.is_requested())
            .field("shard", &(self.shard_index, self.shard_count))
            .finish()
    }
}
