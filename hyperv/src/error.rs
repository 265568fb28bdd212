//! Error types for the Hyper-V job client.
//!
//! Two layers are kept apart: [`Error`] is what a call returns when it could
//! not run at all (bad input, closed session, broken transport), while
//! [`Failure`] lives inside an [`OperationResult`](crate::OperationResult)
//! and describes a provider operation that ran and did not succeed.

use core::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::config::ConfigError;
use crate::result::Failure;

/// Classification of transport-level failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TransportErrorKind {
    /// Host could not be reached (RPC server unavailable, name resolution).
    Unreachable,
    /// Credentials were rejected.
    AuthFailed,
    /// Connection dropped or any other I/O level failure.
    Network,
    /// The provider answered with something that could not be interpreted.
    MalformedResponse,
    /// The per-call timeout elapsed.
    TimedOut,
    /// The addressed object does not exist (removed jobs, deleted VMs).
    NotFound,
}

impl TransportErrorKind {
    /// Whether retrying the same call could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportErrorKind::Unreachable | TransportErrorKind::Network | TransportErrorKind::TimedOut
        )
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportErrorKind::Unreachable => write!(f, "Unreachable"),
            TransportErrorKind::AuthFailed => write!(f, "AuthFailed"),
            TransportErrorKind::Network => write!(f, "Network"),
            TransportErrorKind::MalformedResponse => write!(f, "MalformedResponse"),
            TransportErrorKind::TimedOut => write!(f, "TimedOut"),
            TransportErrorKind::NotFound => write!(f, "NotFound"),
        }
    }
}

/// Failure reported by a [`Transport`](crate::wmi::Transport) implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("transport error ({kind}): {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Unreachable, message)
    }

    pub fn auth_failed(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::AuthFailed, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Network, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::MalformedResponse, message)
    }

    pub fn timed_out(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::TimedOut, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::NotFound, message)
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == TransportErrorKind::NotFound
    }
}

/// Main error type for the crate.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("session is closed")]
    Disconnected,

    #[error("operation failed: {0}")]
    Operation(Failure),

    #[error("Validation failed for '{field}': {message}")]
    Validation {
        field: &'static str,
        message: String,
    },

    #[error("Required field missing: {0}")]
    MissingRequired(&'static str),

    #[error("Invalid VM id '{0}': expected a GUID")]
    InvalidVmId(String),

    #[error("VM not found: {0}")]
    VmNotFound(String),

    #[error("Virtual switch not found: {0}")]
    SwitchNotFound(String),

    #[error("{count} virtual switches match '{name}'")]
    AmbiguousSwitch { name: String, count: usize },

    #[error("Property '{property}' missing from {class}")]
    MissingProperty { class: String, property: String },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    pub(crate) fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Error::Validation {
            field,
            message: message.into(),
        }
    }

    pub(crate) fn missing_property(class: &str, property: &str) -> Self {
        Error::MissingProperty {
            class: class.to_string(),
            property: property.to_string(),
        }
    }

    /// Whether the error comes from a closed session.
    pub fn is_disconnected(&self) -> bool {
        matches!(self, Error::Disconnected)
    }
}

pub type Result<T> = core::result::Result<T, Error>;
