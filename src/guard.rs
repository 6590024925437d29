//! Operation guard: the composition root.
//!
//! # Responsibilities
//! - Refuse new work while the process is shedding load
//! - Hold a lease for the logical operation while it runs, renewing it
//!   every third of its TTL
//! - Route the call through the dependency's circuit breaker
//! - Feed failures to the resource monitor
//! - Release the lease on every exit path, including cancellation
//!
//! # Data Flow
//! ```text
//! run_exclusive(request, ttl, dependency, cancel, op)
//!     → monitor.shedding_pressure()      → ResourceExhausted
//!     → locks.acquire()                  → LockHeld
//!     → monitor.run_protected(
//!           breakers.execute(dependency, op))
//!       raced against keep_alive()        → CircuitOpen / Operation(E)
//!                                        → LeaseLost (renewal refused)
//!     → locks.release()                  (best effort, own deadline)
//! ```
//!
//! # Design Decisions
//! - The guard never retries; callers opt into `resilience::retry`
//! - A refused renewal means another caller may already own the key, so
//!   the operation future is dropped rather than left running unprotected
//! - Release uses its own short deadline so a cancelled caller still frees
//!   the lease; TTL expiry remains the backstop if that fails too

use serde::Serialize;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::SharedClock;
use crate::config::GuardConfig;
use crate::error::{Classify, GuardError};
use crate::lifecycle::{Cancellation, Cancelled};
use crate::locks::{
    AcquireOutcome, DistributedLockManager, LockLease, LockRequest, LockStatus, LockStore, StoreError,
};
use crate::observability::metrics;
use crate::pressure::{PressureStatus, ProtectedError, ResourceMonitor};
use crate::resilience::{CallError, CircuitBreaker, CircuitStatus};

/// Upper bound on the best-effort release after the operation finishes.
const RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

/// Floor on the renewal period for very short leases.
const MIN_RENEW_INTERVAL: Duration = Duration::from_millis(10);

/// Everything an operator dashboard needs, in one serializable value.
#[derive(Debug, Clone, Serialize)]
pub struct GuardSnapshot {
    pub resources: PressureStatus,
    pub circuits: Vec<CircuitStatus>,
    pub locks: Vec<LockStatus>,
}

#[derive(Debug, Clone)]
pub struct OperationGuard {
    locks: DistributedLockManager,
    breakers: Arc<CircuitBreaker>,
    monitor: Arc<ResourceMonitor>,
}

impl OperationGuard {
    pub fn new(
        locks: DistributedLockManager,
        breakers: Arc<CircuitBreaker>,
        monitor: Arc<ResourceMonitor>,
    ) -> Self {
        Self {
            locks,
            breakers,
            monitor,
        }
    }

    pub fn from_config(config: &GuardConfig, store: Arc<dyn LockStore>, clock: SharedClock) -> Self {
        Self {
            locks: DistributedLockManager::new(store, clock.clone()),
            breakers: Arc::new(CircuitBreaker::from_config(&config.breaker, clock.clone())),
            monitor: Arc::new(ResourceMonitor::new(config.pressure.clone(), clock)),
        }
    }

    pub fn locks(&self) -> &DistributedLockManager {
        &self.locks
    }

    pub fn breakers(&self) -> &Arc<CircuitBreaker> {
        &self.breakers
    }

    pub fn monitor(&self) -> &Arc<ResourceMonitor> {
        &self.monitor
    }

    /// Run `op` as the only holder of `request.lock_key`, through the
    /// circuit breaker for `dependency`.
    ///
    /// `op` is not invoked when the lock is held, the circuit is open, or
    /// the process is shedding load.
    pub async fn run_exclusive<F, Fut, T, E>(
        &self,
        request: &LockRequest,
        ttl: Duration,
        dependency: &str,
        cancel: &Cancellation,
        op: F,
    ) -> Result<T, GuardError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + Display,
    {
        let result = self.run_guarded(request, ttl, dependency, cancel, op).await;
        let outcome = match &result {
            Ok(_) => "success",
            Err(e) => e.kind().as_str(),
        };
        metrics::record_guard_outcome(outcome);
        result
    }

    async fn run_guarded<F, Fut, T, E>(
        &self,
        request: &LockRequest,
        ttl: Duration,
        dependency: &str,
        cancel: &Cancellation,
        op: F,
    ) -> Result<T, GuardError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + Display,
    {
        if let Some(pressure) = self.monitor.shedding_pressure() {
            tracing::warn!(
                lock_key = %request.lock_key,
                pressure,
                "Deferring operation: resource pressure"
            );
            metrics::record_load_shed();
            return Err(GuardError::ResourceExhausted { pressure });
        }

        let lease = match self.locks.acquire(request, ttl, cancel).await? {
            AcquireOutcome::Granted(lease) => lease,
            AcquireOutcome::Held {
                holder_id,
                expires_at,
            } => {
                tracing::info!(
                    lock_key = %request.lock_key,
                    holder_id = %holder_id,
                    "Deferring operation: already in progress"
                );
                return Err(GuardError::LockHeld {
                    lock_key: request.lock_key.clone(),
                    holder_id,
                    expires_at,
                });
            }
        };

        let protected = cancel.run(
            self.monitor
                .run_protected(|| self.breakers.execute(dependency, op)),
        );
        let outcome = tokio::select! {
            biased;
            outcome = protected => Some(outcome),
            () = self.keep_alive(&lease, ttl) => None,
        };

        let result = match outcome {
            None => Err(GuardError::LeaseLost {
                lock_key: lease.lock_key.clone(),
            }),
            Some(outcome) => Self::map_outcome(request, dependency, outcome),
        };

        // The caller's token may already have fired; release on a fresh one.
        let release_cancel = Cancellation::after(RELEASE_TIMEOUT);
        if let Err(e) = self
            .locks
            .release(&lease.lock_key, &lease.holder_id, &release_cancel)
            .await
        {
            tracing::warn!(
                lock_key = %lease.lock_key,
                holder_id = %lease.holder_id,
                error = %e,
                "Failed to release lock; it will expire at its TTL"
            );
        }

        result
    }

    /// Renew `lease` every third of `ttl`. Resolves only once a renewal is
    /// refused; store errors are logged and retried on the next beat.
    async fn keep_alive(&self, lease: &LockLease, ttl: Duration) {
        let period = (ttl / 3).max(MIN_RENEW_INTERVAL);
        loop {
            tokio::time::sleep(period).await;
            let beat = Cancellation::after(period);
            match self.locks.renew(&lease.lock_key, &lease.holder_id, ttl, &beat).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::error!(
                        lock_key = %lease.lock_key,
                        holder_id = %lease.holder_id,
                        "Lease lost while the operation ran, abandoning it"
                    );
                    return;
                }
                Err(e) => {
                    tracing::warn!(
                        lock_key = %lease.lock_key,
                        holder_id = %lease.holder_id,
                        error = %e,
                        "Lease renewal failed, will retry"
                    );
                }
            }
        }
    }

    fn map_outcome<T, E>(
        request: &LockRequest,
        dependency: &str,
        outcome: Result<Result<T, ProtectedError<CallError<E>>>, Cancelled>,
    ) -> Result<T, GuardError<E>>
    where
        E: Classify + Display,
    {
        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(ProtectedError::Exhausted { pressure })) => {
                Err(GuardError::ResourceExhausted { pressure })
            }
            Ok(Err(ProtectedError::Failed(CallError::Rejected(open)))) => {
                tracing::info!(
                    lock_key = %request.lock_key,
                    dependency = %open.dependency,
                    retry_after_ms = open.retry_after.as_millis() as u64,
                    "Deferring operation: circuit open"
                );
                Err(GuardError::CircuitOpen {
                    dependency: open.dependency,
                    retry_after: open.retry_after,
                })
            }
            Ok(Err(ProtectedError::Failed(CallError::Failed(e)))) => {
                tracing::warn!(
                    lock_key = %request.lock_key,
                    dependency,
                    error = %e,
                    kind = ?e.failure_kind(),
                    "Guarded operation failed"
                );
                Err(GuardError::Operation(e))
            }
            Err(Cancelled) => {
                tracing::info!(lock_key = %request.lock_key, "Guarded operation cancelled");
                Err(GuardError::Cancelled)
            }
        }
    }

    /// Aggregated read-only view of pressure, circuits and locks.
    pub async fn snapshot(&self) -> Result<GuardSnapshot, StoreError> {
        Ok(GuardSnapshot {
            resources: self.monitor.status(),
            circuits: self.breakers.statuses(),
            locks: self.locks.list().await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};
    use crate::config::BreakerConfig;
    use crate::error::RemoteError;
    use crate::locks::MemoryLockStore;
    use crate::pressure::PressureSignal;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    const TTL: Duration = Duration::from_secs(30);

    fn guard() -> (Arc<ManualClock>, OperationGuard) {
        let clock = ManualClock::starting_now();
        let config = GuardConfig {
            breaker: BreakerConfig {
                failure_threshold: 2,
                ..BreakerConfig::default()
            },
            ..GuardConfig::default()
        };
        let guard = OperationGuard::from_config(&config, Arc::new(MemoryLockStore::new()), clock.clone());
        (clock, guard)
    }

    fn request() -> LockRequest {
        LockRequest::new("create-folder:co1:e1", "create-folder").with_subject("e1")
    }

    #[tokio::test]
    async fn test_success_releases_lock() {
        let (_, guard) = guard();
        let value = guard
            .run_exclusive(&request(), TTL, "driveApi", &Cancellation::never(), || async {
                Ok::<_, RemoteError>("folder-id")
            })
            .await
            .unwrap();
        assert_eq!(value, "folder-id");

        let status = guard.locks().status(&request().lock_key).await.unwrap().unwrap();
        assert!(!status.held);
    }

    #[tokio::test]
    async fn test_held_lock_skips_operation() {
        let (_, guard) = guard();
        let cancel = Cancellation::never();
        let lease = guard.locks().acquire(&request(), TTL, &cancel).await.unwrap();
        assert!(lease.is_granted());

        let calls = AtomicU32::new(0);
        let err = guard
            .run_exclusive(&request(), TTL, "driveApi", &cancel, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, RemoteError>(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, GuardError::LockHeld { .. }));
        assert!(err.is_deferred());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_operation_error_is_returned_and_lock_released() {
        let (_, guard) = guard();
        let err = guard
            .run_exclusive(&request(), TTL, "driveApi", &Cancellation::never(), || async {
                Err::<(), _>(RemoteError::Permanent("folder name invalid".into()))
            })
            .await
            .unwrap_err();

        assert_eq!(
            err.into_operation(),
            Some(RemoteError::Permanent("folder name invalid".into()))
        );
        let status = guard.locks().status(&request().lock_key).await.unwrap().unwrap();
        assert!(!status.held);
    }

    #[tokio::test]
    async fn test_open_circuit_defers_without_calling() {
        let (_, guard) = guard();
        let cancel = Cancellation::never();
        for _ in 0..2 {
            let _ = guard
                .run_exclusive(&request(), TTL, "driveApi", &cancel, || async {
                    Err::<(), _>(RemoteError::Transient("503".into()))
                })
                .await;
        }

        let calls = AtomicU32::new(0);
        let err = guard
            .run_exclusive(&request(), TTL, "driveApi", &cancel, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, RemoteError>(())
            })
            .await
            .unwrap_err();

        match err {
            GuardError::CircuitOpen { dependency, retry_after } => {
                assert_eq!(dependency, "driveApi");
                assert_eq!(retry_after, Duration::from_secs(30));
            }
            other => panic!("expected circuit open, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        // The rejected attempt must not leave the lock behind.
        assert!(!guard.locks().status(&request().lock_key).await.unwrap().unwrap().held);
    }

    #[tokio::test]
    async fn test_resource_exhaustion_defers_before_locking() {
        let (_, guard) = guard();
        for _ in 0..4 {
            guard.monitor().report_signal(PressureSignal::DynamicModuleLoad);
        }
        assert!(guard.monitor().status().emergency_mode);

        let err = guard
            .run_exclusive(&request(), TTL, "driveApi", &Cancellation::never(), || async {
                Ok::<_, RemoteError>(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, GuardError::ResourceExhausted { pressure } if pressure >= 95.0));
        assert!(guard.locks().status(&request().lock_key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resource_errors_raise_pressure() {
        let (_, guard) = guard();
        let _ = guard
            .run_exclusive(&request(), TTL, "driveApi", &Cancellation::never(), || async {
                Err::<(), _>(RemoteError::Transient("Insufficient resources to start worker".into()))
            })
            .await;
        assert_eq!(guard.monitor().status().pressure, 15.0);
    }

    #[tokio::test]
    async fn test_cancellation_releases_lock() {
        let (_, guard) = guard();
        let cancel = Cancellation::after(Duration::from_millis(20));
        let err = guard
            .run_exclusive(&request(), TTL, "driveApi", &cancel, || async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, RemoteError>(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, GuardError::Cancelled));
        assert!(!err.is_deferred());
        let status = guard.locks().status(&request().lock_key).await.unwrap().unwrap();
        assert!(!status.held);
        assert!(status.record.released_at.is_some());
    }

    #[tokio::test]
    async fn test_lease_is_renewed_while_operation_runs() {
        let store: Arc<dyn LockStore> = Arc::new(MemoryLockStore::new());
        let config = GuardConfig::default();
        let owner = OperationGuard::from_config(&config, store.clone(), SystemClock::shared());
        let contender = OperationGuard::from_config(&config, store, SystemClock::shared());
        let ttl = Duration::from_millis(90);

        let owner_req = request();
        let owner_cancel = Cancellation::never();
        let long_op = owner.run_exclusive(&owner_req, ttl, "driveApi", &owner_cancel, || async {
            tokio::time::sleep(Duration::from_millis(400)).await;
            Ok::<_, RemoteError>("done")
        });
        // Arrives well after the original TTL would have run out.
        let late_caller = async {
            tokio::time::sleep(Duration::from_millis(250)).await;
            contender
                .run_exclusive(&request(), ttl, "driveApi", &Cancellation::never(), || async {
                    Ok::<_, RemoteError>("duplicate")
                })
                .await
        };

        let (owned, late) = tokio::join!(long_op, late_caller);
        assert_eq!(owned.unwrap(), "done");
        assert!(matches!(late, Err(GuardError::LockHeld { .. })));
    }

    #[tokio::test]
    async fn test_lost_lease_abandons_operation() {
        let (_, guard) = guard();
        let finished = AtomicBool::new(false);
        let ttl = Duration::from_millis(60);

        let op_req = request();
        let op_cancel = Cancellation::never();
        let op = guard.run_exclusive(&op_req, ttl, "driveApi", &op_cancel, || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            finished.store(true, Ordering::SeqCst);
            Ok::<_, RemoteError>(())
        });
        let revoke = async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let status = guard.locks().status(&request().lock_key).await.unwrap().unwrap();
            let holder = status.record.holder_id.clone();
            assert!(guard
                .locks()
                .release(&request().lock_key, &holder, &Cancellation::never())
                .await
                .unwrap());
        };

        let (result, ()) = tokio::join!(op, revoke);
        let err = result.unwrap_err();
        assert!(matches!(&err, GuardError::LeaseLost { lock_key } if lock_key == "create-folder:co1:e1"));
        assert!(!err.is_deferred());
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_snapshot_aggregates_state() {
        let (_, guard) = guard();
        let _ = guard
            .run_exclusive(&request(), TTL, "driveApi", &Cancellation::never(), || async {
                Ok::<_, RemoteError>(())
            })
            .await;

        let snapshot = guard.snapshot().await.unwrap();
        assert_eq!(snapshot.locks.len(), 1);
        assert_eq!(snapshot.circuits.len(), 1);
        assert_eq!(snapshot.circuits[0].name, "driveApi");
        assert_eq!(snapshot.resources.pressure, 0.0);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert!(json["locks"][0].get("lock_key").is_some());
    }
}
