//! Shared lock store abstraction.
//!
//! The store is the sole arbiter between clients. Every mutation is a
//! conditional write evaluated atomically by the store; there is no
//! unconditional update in this interface.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::lifecycle::Cancelled;
use crate::locks::types::LockRecord;
use crate::resilience::retries::{RetryHint, Retryable};

/// Errors from a lock store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("lock store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed lock record: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("lock store busy for '{0}'")]
    Contention(String),

    #[error("lock store operation cancelled")]
    Cancelled,
}

impl From<Cancelled> for StoreError {
    fn from(_: Cancelled) -> Self {
        StoreError::Cancelled
    }
}

impl Retryable for StoreError {
    fn retry_hint(&self) -> RetryHint {
        match self {
            StoreError::Io(_) | StoreError::Contention(_) => RetryHint::Backoff,
            StoreError::Serialization(_) | StoreError::Cancelled => RetryHint::Stop,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Holder-conditional mutation of an existing record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordUpdate {
    /// Move `expires_at` forward.
    Renew { expires_at: DateTime<Utc> },
    /// Mark inactive.
    Release { released_at: DateTime<Utc> },
}

impl RecordUpdate {
    /// Apply to a record that already passed the holder check.
    pub fn apply(&self, record: &mut LockRecord) {
        match *self {
            RecordUpdate::Renew { expires_at } => record.expires_at = expires_at,
            RecordUpdate::Release { released_at } => {
                record.is_active = false;
                record.released_at = Some(released_at);
            }
        }
    }
}

/// Conditional-write primitives consumed by the lock manager.
#[async_trait]
pub trait LockStore: Send + Sync + std::fmt::Debug {
    /// Insert `record` only if no record exists for its key.
    async fn insert_if_absent(&self, record: &LockRecord) -> StoreResult<bool>;

    /// Overwrite the record for `replacement.lock_key` only if, at the moment
    /// of the write, it exists and is inactive or has `expires_at <= now`.
    async fn steal_if_expired(&self, replacement: &LockRecord, now: DateTime<Utc>) -> StoreResult<bool>;

    /// Apply `update` only if the stored record is active and held by `holder_id`.
    async fn update_if_holder(
        &self,
        lock_key: &str,
        holder_id: &str,
        update: RecordUpdate,
    ) -> StoreResult<bool>;

    /// Plain read by key.
    async fn get(&self, lock_key: &str) -> StoreResult<Option<LockRecord>>;

    /// Every record in the store.
    async fn list(&self) -> StoreResult<Vec<LockRecord>>;
}

/// Shared decision used by store implementations for the steal condition.
pub(crate) fn steal_allowed(existing: &LockRecord, now: DateTime<Utc>) -> bool {
    existing.is_stealable_at(now)
}

/// Shared decision used by store implementations for the holder condition.
pub(crate) fn holder_matches(existing: &LockRecord, holder_id: &str) -> bool {
    existing.is_active && existing.holder_id == holder_id
}
