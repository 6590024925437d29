//! Distributed lock subsystem.
//!
//! # Responsibilities
//! - Grant at most one holder per lock key at any instant
//! - Make expired or released leases available to the next caller
//! - Refuse renew/release from anyone but the current holder
//!
//! # Data Flow
//! ```text
//! LockRequest
//!     → manager.rs (insert, or read → decide → conditional steal)
//!     → store.rs (LockStore trait: conditional writes only)
//!         → memory.rs (single process)
//!         → file.rs (shared directory, one JSON record per key)
//! ```
//!
//! # Design Decisions
//! - No background cleanup: staleness is judged at acquisition time
//! - Holder ids are random per acquisition, never reused
//! - Expiry is compared against the manager's clock

pub mod file;
pub mod manager;
pub mod memory;
pub mod store;
pub mod types;

pub use file::FileLockStore;
pub use manager::{DistributedLockManager, LockError};
pub use memory::MemoryLockStore;
pub use store::{LockStore, RecordUpdate, StoreError, StoreResult};
pub use types::{AcquireOutcome, LockLease, LockRecord, LockRequest, LockStatus};
