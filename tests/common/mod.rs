//! Shared utilities for integration tests.

use std::sync::Arc;
use std::time::Duration;

use opguard::clock::{ManualClock, SharedClock};
use opguard::config::GuardConfig;
use opguard::locks::{FileLockStore, LockStore, MemoryLockStore};
use opguard::OperationGuard;

/// A guard over an in-memory store driven by a manual clock.
#[allow(dead_code)]
pub fn memory_guard() -> (Arc<ManualClock>, Arc<dyn LockStore>, OperationGuard) {
    let clock = ManualClock::starting_now();
    let store: Arc<dyn LockStore> = Arc::new(MemoryLockStore::new());
    let guard = OperationGuard::from_config(&GuardConfig::default(), store.clone(), clock.clone());
    (clock, store, guard)
}

/// A file store with short guard timings suitable for tests.
#[allow(dead_code)]
pub fn file_store(dir: &std::path::Path) -> Arc<dyn LockStore> {
    Arc::new(FileLockStore::new(dir).with_guard_timing(Duration::from_secs(15), Duration::from_secs(5)))
}

/// An independent guard ("another process") sharing `store` and `clock`.
#[allow(dead_code)]
pub fn guard_on(store: Arc<dyn LockStore>, clock: SharedClock) -> OperationGuard {
    OperationGuard::from_config(&GuardConfig::default(), store, clock)
}
