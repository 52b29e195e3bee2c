//! RBD attach/detach error types.
//!
//! Every failure surfaced by `librbd` is an [`RbdError`].  The enum derives
//! [`thiserror::Error`] for ergonomic `?` propagation and also implements
//! [`Serialize`]/[`Deserialize`] so an error can be reported alongside an
//! attach record by out-of-process callers such as `rbdctl`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ConnectionDescriptor;

/// Unified error type for descriptor, attach and detach operations.
#[derive(Debug, Error, Serialize, Deserialize, Clone)]
pub enum RbdError {
    /// The connector could not establish a local block device.
    #[error("failed to connect {protocol} volume: {reason}")]
    ConnectFailed {
        /// Transport protocol tag, e.g. `"rbd"`.
        protocol: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// The connector could not tear down a local block device.
    #[error("failed to disconnect {path}: {reason}")]
    DisconnectFailed {
        /// Raw device path handed out by the connector.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// The attached device exists but cannot be accessed.
    #[error("unable to access the backend storage via the path {path}: {reason}")]
    DeviceUnavailable {
        /// Device path that failed validation.
        path: String,
        /// Why the device was classified unavailable.
        reason: String,
        /// Connection descriptor the attach was performed with.
        descriptor: Box<ConnectionDescriptor>,
    },

    /// A host command (usually run through the root helper) exited non-zero.
    #[error("command `{command}` failed (exit code {code:?}): {stderr}")]
    CommandFailed {
        /// The full command line, helper prefix included.
        command: String,
        /// Exit code, or `None` when killed by a signal or timed out.
        code: Option<i32>,
        /// Captured standard error.
        stderr: String,
    },

    /// The storage cluster or base volume driver returned an error.
    #[error("backend error: {0}")]
    Backend(String),

    /// Invalid or inconsistent configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The caller supplied an invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An unclassified internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl RbdError {
    /// Create a [`RbdError::Backend`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn backend<E: std::fmt::Display>(e: E) -> Self {
        Self::Backend(e.to_string())
    }

    /// Create a [`RbdError::Config`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn config<E: std::fmt::Display>(e: E) -> Self {
        Self::Config(e.to_string())
    }

    /// Create a [`RbdError::Internal`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = RbdError> = std::result::Result<T, E>;
