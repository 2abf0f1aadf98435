//! Error types for the engine crate.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Engine error types.
#[derive(Debug, Error)]
pub enum Error {
    /// Loading or saving the durable snapshot failed.
    #[error("snapshot {operation} failed: {reason}")]
    Snapshot { operation: String, reason: String },

    /// Discovery has no endpoint under this name.
    #[error("plugin '{name}' not found")]
    PluginNotFound { name: String },

    /// The endpoint exists but does not implement the requested interface.
    #[error("plugin '{name}' does not implement {interface}")]
    NotImplemented { name: String, interface: String },

    /// Opening a client against an endpoint failed.
    #[error("connecting to plugin '{name}' failed: {reason}")]
    Connect { name: String, reason: String },

    /// A call on a plugin failed.
    #[error("plugin '{name}' {method} failed: {reason}")]
    Plugin {
        name: String,
        method: String,
        reason: String,
    },

    /// No stored spec for this group.
    #[error("group '{id}' not found")]
    GroupNotFound { id: String },

    /// The spec itself is unusable.
    #[error("invalid spec: {reason}")]
    InvalidSpec { reason: String },

    /// A dependency resolver rejected a spec.
    #[error("resolving dependencies of kind '{kind}' failed: {reason}")]
    Resolve { kind: String, reason: String },

    /// The operation queue was closed before the operation ran.
    #[error("operation queue closed")]
    QueueClosed,

    /// A bounded wait elapsed.
    #[error("timed out after {after:?} waiting for {what}")]
    Timeout { what: String, after: Duration },

    /// The backend was stopped.
    #[error("backend stopped")]
    Stopped,

    /// Invalid configuration.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// Core (I/O, parsing) failure.
    #[error(transparent)]
    Core(#[from] steward_core::Error),
}

impl Error {
    /// Create a snapshot error.
    pub fn snapshot(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Snapshot {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a plugin not found error.
    pub fn plugin_not_found(name: impl Into<String>) -> Self {
        Self::PluginNotFound { name: name.into() }
    }

    /// Create a not implemented error.
    pub fn not_implemented(name: impl Into<String>, interface: impl Into<String>) -> Self {
        Self::NotImplemented {
            name: name.into(),
            interface: interface.into(),
        }
    }

    /// Create a connect error.
    pub fn connect(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Connect {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create a plugin call error.
    pub fn plugin(
        name: impl Into<String>,
        method: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Plugin {
            name: name.into(),
            method: method.into(),
            reason: reason.into(),
        }
    }

    /// Create a group not found error.
    pub fn group_not_found(id: impl Into<String>) -> Self {
        Self::GroupNotFound { id: id.into() }
    }

    /// Create an invalid spec error.
    pub fn invalid_spec(reason: impl Into<String>) -> Self {
        Self::InvalidSpec {
            reason: reason.into(),
        }
    }

    /// Create a resolver error.
    pub fn resolve(kind: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Resolve {
            kind: kind.into(),
            reason: reason.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(what: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            what: what.into(),
            after,
        }
    }

    /// Create an invalid config error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }
}
