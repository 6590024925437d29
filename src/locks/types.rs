//! Lock record and outcome types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::clock::{add_duration, elapsed_between};

/// What the caller wants to lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRequest {
    /// Stable identifier of the protected operation.
    pub lock_key: String,
    /// Descriptive operation name, e.g. "create-folder".
    pub operation_type: String,
    /// Descriptive subject, e.g. an employee identifier.
    pub subject: Option<String>,
}

impl LockRequest {
    pub fn new(lock_key: impl Into<String>, operation_type: impl Into<String>) -> Self {
        Self {
            lock_key: lock_key.into(),
            operation_type: operation_type.into(),
            subject: None,
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }
}

/// A lease over one logical operation, as persisted in the shared store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub lock_key: String,
    pub holder_id: String,
    pub operation_type: String,
    pub subject: Option<String>,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}

impl LockRecord {
    /// A fresh active lease for `request` held by `holder_id`.
    pub fn new(request: &LockRequest, holder_id: &str, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            lock_key: request.lock_key.clone(),
            holder_id: holder_id.to_string(),
            operation_type: request.operation_type.clone(),
            subject: request.subject.clone(),
            acquired_at: now,
            expires_at: add_duration(now, ttl),
            released_at: None,
            is_active: true,
        }
    }

    /// Active and unexpired at `now`.
    pub fn is_held_at(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.expires_at > now
    }

    /// Released or expired, so a challenger may take it over.
    pub fn is_stealable_at(&self, now: DateTime<Utc>) -> bool {
        !self.is_held_at(now)
    }

    /// Time left on the lease, zero once expired or released.
    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> Duration {
        if self.is_active {
            elapsed_between(now, self.expires_at)
        } else {
            Duration::ZERO
        }
    }
}

/// Proof of a granted lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockLease {
    pub lock_key: String,
    pub holder_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl From<&LockRecord> for LockLease {
    fn from(record: &LockRecord) -> Self {
        Self {
            lock_key: record.lock_key.clone(),
            holder_id: record.holder_id.clone(),
            acquired_at: record.acquired_at,
            expires_at: record.expires_at,
        }
    }
}

/// Result of one acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    Granted(LockLease),
    Held {
        holder_id: String,
        expires_at: DateTime<Utc>,
    },
}

impl AcquireOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, AcquireOutcome::Granted(_))
    }

    pub fn lease(&self) -> Option<&LockLease> {
        match self {
            AcquireOutcome::Granted(lease) => Some(lease),
            AcquireOutcome::Held { .. } => None,
        }
    }
}

/// Read-only view of a lock for dashboards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockStatus {
    #[serde(flatten)]
    pub record: LockRecord,
    /// Whether the lease is currently in force.
    pub held: bool,
    pub remaining_ttl_ms: u64,
}

impl LockStatus {
    pub fn at(record: LockRecord, now: DateTime<Utc>) -> Self {
        let held = record.is_held_at(now);
        let remaining_ttl_ms = if held {
            u64::try_from(record.remaining_ttl(now).as_millis()).unwrap_or(u64::MAX)
        } else {
            0
        };
        Self {
            record,
            held,
            remaining_ttl_ms,
        }
    }
}

impl std::fmt::Display for LockStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (holder: {}, operation: {}{}, {})",
            self.record.lock_key,
            self.record.holder_id,
            self.record.operation_type,
            self.record
                .subject
                .as_deref()
                .map(|s| format!(" for {s}"))
                .unwrap_or_default(),
            if self.held {
                format!("held, {}ms left", self.remaining_ttl_ms)
            } else if self.record.is_active {
                "EXPIRED".to_string()
            } else {
                "released".to_string()
            }
        )
    }
}
