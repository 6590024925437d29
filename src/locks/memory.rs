//! In-process lock store.
//!
//! Every primitive runs under one mutex, which makes each conditional write
//! atomic. Useful for tests and for deduplicating work inside one process.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::locks::store::{holder_matches, steal_allowed, LockStore, RecordUpdate, StoreResult};
use crate::locks::types::LockRecord;

#[derive(Debug, Default)]
pub struct MemoryLockStore {
    records: Mutex<HashMap<String, LockRecord>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, LockRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn insert_if_absent(&self, record: &LockRecord) -> StoreResult<bool> {
        let mut records = self.records();
        if records.contains_key(&record.lock_key) {
            return Ok(false);
        }
        records.insert(record.lock_key.clone(), record.clone());
        Ok(true)
    }

    async fn steal_if_expired(&self, replacement: &LockRecord, now: DateTime<Utc>) -> StoreResult<bool> {
        let mut records = self.records();
        match records.get_mut(&replacement.lock_key) {
            Some(existing) if steal_allowed(existing, now) => {
                *existing = replacement.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_if_holder(
        &self,
        lock_key: &str,
        holder_id: &str,
        update: RecordUpdate,
    ) -> StoreResult<bool> {
        let mut records = self.records();
        match records.get_mut(lock_key) {
            Some(existing) if holder_matches(existing, holder_id) => {
                update.apply(existing);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, lock_key: &str) -> StoreResult<Option<LockRecord>> {
        Ok(self.records().get(lock_key).cloned())
    }

    async fn list(&self) -> StoreResult<Vec<LockRecord>> {
        let mut records: Vec<_> = self.records().values().cloned().collect();
        records.sort_by(|a, b| a.lock_key.cmp(&b.lock_key));
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::add_duration;
    use crate::locks::types::LockRequest;
    use std::time::Duration;

    fn record(holder: &str, now: DateTime<Utc>, ttl_secs: u64) -> LockRecord {
        let request = LockRequest::new("k", "op");
        LockRecord::new(&request, holder, now, Duration::from_secs(ttl_secs))
    }

    #[tokio::test]
    async fn test_insert_is_exclusive() {
        let store = MemoryLockStore::new();
        let now = Utc::now();
        assert!(store.insert_if_absent(&record("a", now, 30)).await.unwrap());
        assert!(!store.insert_if_absent(&record("b", now, 30)).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().unwrap().holder_id, "a");
    }

    #[tokio::test]
    async fn test_steal_requires_expiry() {
        let store = MemoryLockStore::new();
        let now = Utc::now();
        store.insert_if_absent(&record("a", now, 30)).await.unwrap();

        assert!(!store.steal_if_expired(&record("b", now, 30), now).await.unwrap());

        let later = add_duration(now, Duration::from_secs(31));
        assert!(store.steal_if_expired(&record("b", later, 30), later).await.unwrap());
        assert!(!store.steal_if_expired(&record("c", later, 30), later).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().unwrap().holder_id, "b");
    }

    #[tokio::test]
    async fn test_steal_missing_record_fails() {
        let store = MemoryLockStore::new();
        let now = Utc::now();
        assert!(!store.steal_if_expired(&record("a", now, 30), now).await.unwrap());
    }

    #[tokio::test]
    async fn test_update_checks_holder() {
        let store = MemoryLockStore::new();
        let now = Utc::now();
        store.insert_if_absent(&record("a", now, 30)).await.unwrap();

        let release = RecordUpdate::Release { released_at: now };
        assert!(!store.update_if_holder("k", "b", release).await.unwrap());
        assert!(store.update_if_holder("k", "a", release).await.unwrap());
        assert!(!store.update_if_holder("k", "a", release).await.unwrap());

        let stored = store.get("k").await.unwrap().unwrap();
        assert!(!stored.is_active);
        assert_eq!(stored.released_at, Some(now));
    }
}
