//! Lease-based distributed lock manager.
//!
//! # How It Works
//!
//! 1. Acquisition inserts a fresh record with a new random holder id; the
//!    insert only succeeds if no record exists for the key
//! 2. If a record exists and is active and unexpired, the lock is held
//! 3. If it is expired or released, a conditional steal overwrites it; the
//!    store re-checks the expiry at write time, so two stealers cannot both win
//! 4. A lost steal race is re-evaluated once, then reported as held by the
//!    winner; a key that never settles on a live holder is reported as
//!    store contention rather than a made-up holder
//!
//! Renew and release are conditional on the stored holder id, so a holder
//! whose lease was stolen after expiry can no longer touch the record.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use chrono::{DateTime, Utc};

use crate::clock::{add_duration, SharedClock};
use crate::lifecycle::Cancellation;
use crate::locks::store::{LockStore, RecordUpdate, StoreError};
use crate::locks::types::{AcquireOutcome, LockLease, LockRecord, LockRequest, LockStatus};
use crate::observability::metrics;
use crate::resilience::retries::{retry, RetryError, RetryHint, RetryPolicy, Retryable};

/// Read-decide-write rounds per acquisition before reporting `Held`.
const MAX_ACQUIRE_ROUNDS: u32 = 2;

/// Failure of `acquire_with_retry`.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock '{lock_key}' held by {holder_id} until {expires_at}")]
    Held {
        lock_key: String,
        holder_id: String,
        expires_at: DateTime<Utc>,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Retryable for LockError {
    fn retry_hint(&self) -> RetryHint {
        match self {
            LockError::Held { .. } => RetryHint::Backoff,
            LockError::Store(err) => err.retry_hint(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DistributedLockManager {
    store: Arc<dyn LockStore>,
    clock: SharedClock,
}

impl DistributedLockManager {
    pub fn new(store: Arc<dyn LockStore>, clock: SharedClock) -> Self {
        Self { store, clock }
    }

    pub fn store(&self) -> &Arc<dyn LockStore> {
        &self.store
    }

    /// Try once to take the lease for `request`.
    pub async fn acquire(
        &self,
        request: &LockRequest,
        ttl: Duration,
        cancel: &Cancellation,
    ) -> Result<AcquireOutcome, StoreError> {
        let holder_id = Uuid::new_v4().to_string();

        for round in 1..=MAX_ACQUIRE_ROUNDS {
            let now = self.clock.now();
            let candidate = LockRecord::new(request, &holder_id, now, ttl);

            if cancel.run(self.store.insert_if_absent(&candidate)).await?? {
                tracing::info!(
                    lock_key = %request.lock_key,
                    holder_id = %holder_id,
                    operation = %request.operation_type,
                    ttl_ms = ttl.as_millis() as u64,
                    "Lock granted"
                );
                metrics::record_lock_acquisition("granted");
                return Ok(AcquireOutcome::Granted(LockLease::from(&candidate)));
            }

            let Some(existing) = cancel.run(self.store.get(&request.lock_key)).await?? else {
                // Vanished between insert and read; go around again.
                continue;
            };

            if existing.is_held_at(now) {
                return Ok(Self::held(request, existing));
            }

            if cancel.run(self.store.steal_if_expired(&candidate, now)).await?? {
                tracing::info!(
                    lock_key = %request.lock_key,
                    holder_id = %holder_id,
                    previous_holder = %existing.holder_id,
                    previous_expired_at = %existing.expires_at,
                    "Lock stolen after expiry"
                );
                metrics::record_lock_acquisition("stolen");
                return Ok(AcquireOutcome::Granted(LockLease::from(&candidate)));
            }

            tracing::debug!(lock_key = %request.lock_key, round, "Lost steal race");
        }

        // Every round lost a race; report the holder that won the last one.
        match cancel.run(self.store.get(&request.lock_key)).await?? {
            Some(record) if record.is_held_at(self.clock.now()) => Ok(Self::held(request, record)),
            _ => {
                tracing::warn!(
                    lock_key = %request.lock_key,
                    rounds = MAX_ACQUIRE_ROUNDS,
                    "Lock record changed on every round without a live holder"
                );
                Err(StoreError::Contention(request.lock_key.clone()))
            }
        }
    }

    fn held(request: &LockRequest, record: LockRecord) -> AcquireOutcome {
        metrics::record_lock_acquisition("held");
        tracing::debug!(
            lock_key = %request.lock_key,
            holder_id = %record.holder_id,
            "Lock held by another instance"
        );
        AcquireOutcome::Held {
            holder_id: record.holder_id,
            expires_at: record.expires_at,
        }
    }

    /// Acquire, retrying `Held` and transient store errors under `policy`.
    pub async fn acquire_with_retry(
        &self,
        request: &LockRequest,
        ttl: Duration,
        policy: &RetryPolicy,
        cancel: &Cancellation,
    ) -> Result<LockLease, RetryError<LockError>> {
        retry(policy, cancel, move |_| async move {
            match self.acquire(request, ttl, cancel).await? {
                AcquireOutcome::Granted(lease) => Ok(lease),
                AcquireOutcome::Held {
                    holder_id,
                    expires_at,
                } => Err(LockError::Held {
                    lock_key: request.lock_key.clone(),
                    holder_id,
                    expires_at,
                }),
            }
        })
        .await
    }

    /// Extend the lease if `holder_id` still owns it.
    pub async fn renew(
        &self,
        lock_key: &str,
        holder_id: &str,
        ttl: Duration,
        cancel: &Cancellation,
    ) -> Result<bool, StoreError> {
        let expires_at = add_duration(self.clock.now(), ttl);
        let renewed = cancel
            .run(self.store.update_if_holder(lock_key, holder_id, RecordUpdate::Renew { expires_at }))
            .await??;
        if renewed {
            tracing::debug!(lock_key, holder_id, %expires_at, "Lock renewed");
        } else {
            tracing::warn!(lock_key, holder_id, "Lock renewal refused: lease lost");
        }
        Ok(renewed)
    }

    /// Mark the lease released if `holder_id` owns it. No-op otherwise.
    pub async fn release(
        &self,
        lock_key: &str,
        holder_id: &str,
        cancel: &Cancellation,
    ) -> Result<bool, StoreError> {
        let released_at = self.clock.now();
        let released = cancel
            .run(self.store.update_if_holder(lock_key, holder_id, RecordUpdate::Release { released_at }))
            .await??;
        metrics::record_lock_release(released);
        if released {
            tracing::info!(lock_key, holder_id, "Lock released");
        } else {
            tracing::debug!(lock_key, holder_id, "Release ignored: not the current holder");
        }
        Ok(released)
    }

    /// Read-only view of one lock.
    pub async fn status(&self, lock_key: &str) -> Result<Option<LockStatus>, StoreError> {
        let now = self.clock.now();
        Ok(self
            .store
            .get(lock_key)
            .await?
            .map(|record| LockStatus::at(record, now)))
    }

    /// Read-only view of every lock in the store.
    pub async fn list(&self) -> Result<Vec<LockStatus>, StoreError> {
        let now = self.clock.now();
        Ok(self
            .store
            .list()
            .await?
            .into_iter()
            .map(|record| LockStatus::at(record, now))
            .collect())
    }
}
