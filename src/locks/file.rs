//! Directory-backed lock store shared by independent processes.
//!
//! # Layout
//! ```text
//! <dir>/<encoded key>.json        current LockRecord (JSON)
//! <dir>/<encoded key>.json.guard  present while a writer is inside its critical section
//! ```
//!
//! # Design Decisions
//! - A guard file carries a random token and is published by hard-linking a
//!   fully written temp file, so it never exists without its token
//! - A guard is only ever removed by first renaming it aside and checking the
//!   token; a guard that turns out to belong to someone else is put back
//! - Breaking a stale guard happens under a second, short-lived breaker guard
//!   and re-checks staleness there, so concurrent waiters cannot each break
//!   a different generation of the same guard
//! - Records are written to a temp file and renamed into place, so plain
//!   reads never observe a torn record and need no guard
//! - Critical sections last a few milliseconds; a guard older than
//!   `guard_stale_after` belongs to a crashed writer and is broken
//! - All file I/O runs on the blocking pool. A started critical section runs
//!   to completion even if the awaiting caller is cancelled

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use uuid::Uuid;

use crate::config::LockConfig;
use crate::locks::store::{
    holder_matches, steal_allowed, LockStore, RecordUpdate, StoreError, StoreResult,
};
use crate::locks::types::LockRecord;

const RECORD_EXTENSION: &str = "json";

/// Lower bound on guard staleness. Shorter values would let waiters break
/// guards of writers that are still inside their critical section.
pub const MIN_GUARD_STALE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct FileLockStore {
    dir: PathBuf,
    guard_stale_after: Duration,
    guard_wait: Duration,
}

/// A published guard file, removed on drop if it still carries our token.
#[derive(Debug)]
struct HeldGuard {
    path: PathBuf,
    token: String,
}

impl Drop for HeldGuard {
    fn drop(&mut self) {
        match take_guard(&self.path, &self.token) {
            Ok(true) => {}
            Ok(false) => tracing::warn!(
                path = %self.path.display(),
                "Store guard file was broken by another writer"
            ),
            Err(e) => tracing::warn!(
                path = %self.path.display(),
                error = %e,
                "Failed to remove store guard file"
            ),
        }
    }
}

impl FileLockStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let defaults = LockConfig::default();
        Self {
            dir: dir.into(),
            guard_stale_after: Duration::from_millis(defaults.guard_stale_ms),
            guard_wait: Duration::from_millis(defaults.guard_wait_ms),
        }
    }

    pub fn from_config(config: &LockConfig) -> Self {
        Self::new(&config.store_dir)
            .with_guard_timing(
                Duration::from_millis(config.guard_stale_ms),
                Duration::from_millis(config.guard_wait_ms),
            )
    }

    /// Staleness is raised to `MIN_GUARD_STALE` if set lower.
    pub fn with_guard_timing(mut self, stale_after: Duration, wait: Duration) -> Self {
        self.guard_stale_after = stale_after.max(MIN_GUARD_STALE);
        self.guard_wait = wait;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, lock_key: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{RECORD_EXTENSION}", encode_key(lock_key)))
    }

    fn guard_path(&self, lock_key: &str) -> PathBuf {
        self.record_path(lock_key)
            .with_extension(format!("{RECORD_EXTENSION}.guard"))
    }

    /// Run `op` against a clone of this store on the blocking pool.
    async fn blocking<T, F>(&self, op: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(FileLockStore) -> StoreResult<T> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || op(store))
            .await
            .map_err(|e| StoreError::Io(io::Error::other(e)))?
    }

    /// Enter the critical section for `lock_key`.
    fn enter(&self, lock_key: &str) -> StoreResult<HeldGuard> {
        fs::create_dir_all(&self.dir)?;
        let guard_path = self.guard_path(lock_key);
        let token = Uuid::new_v4().simple().to_string();
        let started = Instant::now();

        loop {
            match publish_guard(&guard_path, &token) {
                Ok(()) => {
                    return Ok(HeldGuard {
                        path: guard_path,
                        token,
                    })
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if self.break_stale_guard(&guard_path)? {
                        tracing::warn!(
                            lock_key,
                            path = %guard_path.display(),
                            "Broke stale store guard file"
                        );
                        continue;
                    }
                    if started.elapsed() >= self.guard_wait {
                        return Err(StoreError::Contention(lock_key.to_string()));
                    }
                    std::thread::sleep(Duration::from_millis(fastrand::u64(1..=5)));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Remove the guard at `guard_path` if it is stale. Returns whether it was removed.
    fn break_stale_guard(&self, guard_path: &Path) -> io::Result<bool> {
        if self.stale_guard_token(guard_path).is_none() {
            return Ok(false);
        }

        let breaker_path = sibling(guard_path, "break");
        let breaker_token = Uuid::new_v4().simple().to_string();
        let _breaker = match publish_guard(&breaker_path, &breaker_token) {
            Ok(()) => HeldGuard {
                path: breaker_path,
                token: breaker_token,
            },
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                // Another waiter is breaking it, unless that waiter crashed.
                if let Some(token) = self.stale_guard_token(&breaker_path) {
                    take_guard(&breaker_path, &token)?;
                }
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        // The guard judged stale above may have been replaced since.
        match self.stale_guard_token(guard_path) {
            Some(token) => take_guard(guard_path, &token),
            None => Ok(false),
        }
    }

    /// Token of the guard at `guard_path` if it is older than the staleness bound.
    ///
    /// Age and token are read through one handle, so they describe the same file.
    fn stale_guard_token(&self, guard_path: &Path) -> Option<String> {
        let mut file = File::open(guard_path).ok()?;
        let modified = file.metadata().and_then(|meta| meta.modified()).ok()?;
        let age = SystemTime::now().duration_since(modified).ok()?;
        if age < self.guard_stale_after {
            return None;
        }
        let mut token = String::new();
        file.read_to_string(&mut token).ok()?;
        Some(token.trim().to_string())
    }

    fn read_record(path: &Path) -> StoreResult<Option<LockRecord>> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_record(path: &Path, record: &LockRecord) -> StoreResult<()> {
        let tmp = path.with_extension(format!("{RECORD_EXTENSION}.tmp.{}", Uuid::new_v4().simple()));
        let json = serde_json::to_vec_pretty(record)?;

        let written = (|| -> io::Result<()> {
            let mut file = OpenOptions::new().write(true).create_new(true).open(&tmp)?;
            file.write_all(&json)?;
            file.sync_all()?;
            fs::rename(&tmp, path)
        })();

        if let Err(e) = written {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }
}

/// Create the guard at `guard_path` holding `token`, failing with
/// `AlreadyExists` if any guard is present.
fn publish_guard(guard_path: &Path, token: &str) -> io::Result<()> {
    let tmp = sibling(guard_path, &format!("{token}.tmp"));
    let published = (|| -> io::Result<()> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(&tmp)?;
        file.write_all(token.as_bytes())?;
        fs::hard_link(&tmp, guard_path)
    })();
    let _ = fs::remove_file(&tmp);
    published
}

/// Remove the guard at `guard_path` only if it carries `token`.
///
/// The guard is renamed aside before its token is checked, so a guard
/// re-created by a peer in the meantime is never deleted; it is linked back
/// instead. Returns whether the guard with `token` was removed.
fn take_guard(guard_path: &Path, token: &str) -> io::Result<bool> {
    let aside = sibling(guard_path, &format!("{}.aside", Uuid::new_v4().simple()));
    match fs::rename(guard_path, &aside) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    }

    let found = fs::read_to_string(&aside).unwrap_or_default();
    if found.trim() == token {
        fs::remove_file(&aside)?;
        return Ok(true);
    }

    if let Err(e) = fs::hard_link(&aside, guard_path) {
        tracing::warn!(
            path = %guard_path.display(),
            error = %e,
            "Could not restore a store guard file taken by mistake"
        );
    }
    let _ = fs::remove_file(&aside);
    Ok(false)
}

#[async_trait]
impl LockStore for FileLockStore {
    async fn insert_if_absent(&self, record: &LockRecord) -> StoreResult<bool> {
        let record = record.clone();
        self.blocking(move |store| {
            let _section = store.enter(&record.lock_key)?;
            let path = store.record_path(&record.lock_key);
            if FileLockStore::read_record(&path)?.is_some() {
                return Ok(false);
            }
            FileLockStore::write_record(&path, &record)?;
            Ok(true)
        })
        .await
    }

    async fn steal_if_expired(&self, replacement: &LockRecord, now: DateTime<Utc>) -> StoreResult<bool> {
        let replacement = replacement.clone();
        self.blocking(move |store| {
            let _section = store.enter(&replacement.lock_key)?;
            let path = store.record_path(&replacement.lock_key);
            match FileLockStore::read_record(&path)? {
                Some(existing) if steal_allowed(&existing, now) => {
                    FileLockStore::write_record(&path, &replacement)?;
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
        .await
    }

    async fn update_if_holder(
        &self,
        lock_key: &str,
        holder_id: &str,
        update: RecordUpdate,
    ) -> StoreResult<bool> {
        let lock_key = lock_key.to_string();
        let holder_id = holder_id.to_string();
        self.blocking(move |store| {
            let _section = store.enter(&lock_key)?;
            let path = store.record_path(&lock_key);
            match FileLockStore::read_record(&path)? {
                Some(mut existing) if holder_matches(&existing, &holder_id) => {
                    update.apply(&mut existing);
                    FileLockStore::write_record(&path, &existing)?;
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
        .await
    }

    async fn get(&self, lock_key: &str) -> StoreResult<Option<LockRecord>> {
        let path = self.record_path(lock_key);
        self.blocking(move |_| FileLockStore::read_record(&path)).await
    }

    async fn list(&self) -> StoreResult<Vec<LockRecord>> {
        self.blocking(|store| {
            let entries = match fs::read_dir(&store.dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(e.into()),
            };

            let mut records = Vec::new();
            for entry in entries {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                    continue;
                }
                match FileLockStore::read_record(&path) {
                    Ok(Some(record)) => records.push(record),
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable lock record");
                    }
                }
            }
            records.sort_by(|a, b| a.lock_key.cmp(&b.lock_key));
            Ok(records)
        })
        .await
    }
}

/// `path` with `.suffix` appended to its file name.
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

/// File-name-safe form of a lock key. Bytes outside `[A-Za-z0-9_-]` become `%XX`.
fn encode_key(lock_key: &str) -> String {
    let mut encoded = String::with_capacity(lock_key.len());
    for byte in lock_key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }
    encoded
}
