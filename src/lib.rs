//! Operation guard library: lease locks, circuit breakers and load shedding
//! for side-effecting calls to remote dependencies.

pub mod clock;
pub mod config;
pub mod error;
pub mod guard;
pub mod lifecycle;
pub mod locks;
pub mod observability;
pub mod pressure;
pub mod resilience;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::schema::GuardConfig;
pub use error::{Classify, FailureKind, GuardError, GuardErrorKind, RemoteError};
pub use guard::{GuardSnapshot, OperationGuard};
pub use lifecycle::{Cancellation, Shutdown};
pub use locks::{DistributedLockManager, FileLockStore, LockRequest, LockStore, MemoryLockStore};
pub use pressure::ResourceMonitor;
pub use resilience::{CircuitBreaker, RetryPolicy};
