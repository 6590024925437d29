//! Error taxonomy shared by the guard layers.
//!
//! Lock, circuit and resource rejections stay distinct kinds because the
//! right recovery differs per kind. `GuardError::is_deferred` collapses them
//! into one "try again shortly" outcome for end users.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use crate::lifecycle::Cancelled;
use crate::locks::StoreError;

/// Whether a failure is worth counting against a dependency and retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Network blips, timeouts, 5xx: the dependency may recover.
    Transient,
    /// Bad input, missing permission, 4xx: retrying cannot help.
    Permanent,
}

/// Classification of an operation's error, supplied by the caller's error type.
pub trait Classify {
    /// Defaults to transient.
    fn failure_kind(&self) -> FailureKind {
        FailureKind::Transient
    }
}

impl Classify for std::io::Error {
    fn failure_kind(&self) -> FailureKind {
        use std::io::ErrorKind;
        match self.kind() {
            ErrorKind::NotFound
            | ErrorKind::PermissionDenied
            | ErrorKind::InvalidInput
            | ErrorKind::InvalidData
            | ErrorKind::AlreadyExists
            | ErrorKind::Unsupported => FailureKind::Permanent,
            _ => FailureKind::Transient,
        }
    }
}

/// Ready-made remote dependency error for callers without their own type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("transient remote error: {0}")]
    Transient(String),

    #[error("permanent remote error: {0}")]
    Permanent(String),
}

impl Classify for RemoteError {
    fn failure_kind(&self) -> FailureKind {
        match self {
            RemoteError::Transient(_) => FailureKind::Transient,
            RemoteError::Permanent(_) => FailureKind::Permanent,
        }
    }
}

/// Inspectable kind of a `GuardError`, for logs and metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardErrorKind {
    LockHeld,
    CircuitOpen,
    ResourceExhausted,
    LeaseLost,
    Cancelled,
    Store,
    Operation,
}

impl GuardErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GuardErrorKind::LockHeld => "lock_held",
            GuardErrorKind::CircuitOpen => "circuit_open",
            GuardErrorKind::ResourceExhausted => "resource_exhausted",
            GuardErrorKind::LeaseLost => "lease_lost",
            GuardErrorKind::Cancelled => "cancelled",
            GuardErrorKind::Store => "store",
            GuardErrorKind::Operation => "operation",
        }
    }
}

/// Message shown to end users for every deferred outcome.
pub const DEFERRED_MESSAGE: &str =
    "This action is already in progress or temporarily unavailable. Please try again shortly.";

/// Errors returned by `OperationGuard::run_exclusive`.
#[derive(Debug, Error)]
pub enum GuardError<E> {
    /// Another holder is executing the same logical operation.
    #[error("operation already in progress: lock '{lock_key}' held by {holder_id} until {expires_at}")]
    LockHeld {
        lock_key: String,
        holder_id: String,
        expires_at: DateTime<Utc>,
    },

    /// The remote dependency is known to be unhealthy.
    #[error("circuit for '{dependency}' is open; retry after {retry_after:?}")]
    CircuitOpen {
        dependency: String,
        retry_after: Duration,
    },

    /// The local process is shedding load.
    #[error("resource pressure {pressure:.1} is above the shedding ceiling")]
    ResourceExhausted { pressure: f64 },

    /// The lease could not be renewed while the operation ran, so the
    /// operation was abandoned before it finished.
    #[error("lease on '{lock_key}' was lost while the operation ran")]
    LeaseLost { lock_key: String },

    /// The caller's cancellation or deadline fired.
    #[error("operation cancelled")]
    Cancelled,

    /// The shared lock store failed.
    #[error("lock store error: {0}")]
    Store(StoreError),

    /// The wrapped operation itself failed.
    #[error("{0}")]
    Operation(E),
}

impl<E> GuardError<E> {
    pub fn kind(&self) -> GuardErrorKind {
        match self {
            GuardError::LockHeld { .. } => GuardErrorKind::LockHeld,
            GuardError::CircuitOpen { .. } => GuardErrorKind::CircuitOpen,
            GuardError::ResourceExhausted { .. } => GuardErrorKind::ResourceExhausted,
            GuardError::LeaseLost { .. } => GuardErrorKind::LeaseLost,
            GuardError::Cancelled => GuardErrorKind::Cancelled,
            GuardError::Store(_) => GuardErrorKind::Store,
            GuardError::Operation(_) => GuardErrorKind::Operation,
        }
    }

    /// True for the three protective rejections.
    pub fn is_deferred(&self) -> bool {
        matches!(
            self,
            GuardError::LockHeld { .. }
                | GuardError::CircuitOpen { .. }
                | GuardError::ResourceExhausted { .. }
        )
    }

    /// User-facing message for deferred outcomes, `None` otherwise.
    pub fn user_message(&self) -> Option<&'static str> {
        self.is_deferred().then_some(DEFERRED_MESSAGE)
    }

    /// The wrapped operation's error, if that is what failed.
    pub fn into_operation(self) -> Option<E> {
        match self {
            GuardError::Operation(e) => Some(e),
            _ => None,
        }
    }
}

impl<E> From<StoreError> for GuardError<E> {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Cancelled => GuardError::Cancelled,
            other => GuardError::Store(other),
        }
    }
}

impl<E> From<Cancelled> for GuardError<E> {
    fn from(_: Cancelled) -> Self {
        GuardError::Cancelled
    }
}
