//! # marshal-core
//!
//! Core abstractions for the marshal device test harness.
//!
//! This crate provides the foundational types and traits shared by the
//! execution engine and its collaborators:
//!
//! - **Identifiers**: Strongly-typed IDs for invocations
//! - **Targets**: The capability surface of an allocated device (`Target`)
//! - **Invocation Context**: The per-invocation object threaded through every call
//! - **Error Types**: Shared error definitions and result types
//! - **Observability**: Logging initialization and span helpers
//!
//! ## Crate Boundary
//!
//! `marshal-core` is the **only** crate allowed to define primitives shared
//! between the engine and the outside world. The wire protocol used to talk to
//! a device lives behind [`target::Target`]; nothing in this crate knows how a
//! command actually reaches a device.
//!
//! ## Example
//!
//! ```rust
//! use marshal_core::prelude::*;
//!
//! let invocation = InvocationId::generate();
//! let stop = StopSignal::new();
//! assert!(!stop.is_requested());
//! assert_eq!(invocation.to_string().len(), 26);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod context;
pub mod error;
pub mod id;
pub mod observability;
pub mod target;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::context::{BuildArtifact, InvocationContext, StopSignal};
    pub use crate::error::{Error, Result};
    pub use crate::id::InvocationId;
    pub use crate::target::{
        BugreportKind, CommandResult, LogDataType, LogStream, Target, TargetError, TimedTarget,
    };
}

// Re-export key types at crate root for ergonomics
pub use context::{BuildArtifact, InvocationContext, StopSignal};
pub use error::{Error, Result};
pub use id::InvocationId;
pub use observability::{LogFormat, init_logging};
pub use target::{
    BugreportKind, CommandResult, LogDataType, LogStream, Target, TargetError, TimedTarget,
};
