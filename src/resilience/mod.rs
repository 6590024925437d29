//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Call to a remote dependency:
//!     → circuit_breaker.rs (fail fast while the dependency is unhealthy)
//!     → On failure: classify transient vs permanent, count transient ones
//!
//! Caller-side retry (opt-in):
//!     → retries.rs (RetryPolicy executed by one loop, honours cancellation)
//!     → backoff.rs (exponential delay with jitter)
//! ```
//!
//! # Design Decisions
//! - Breaker state is process-local, one circuit per dependency name
//! - Retries are never hidden inside the breaker or the guard
//! - Jittered backoff prevents thundering herd

pub mod backoff;
pub mod circuit_breaker;
pub mod retries;

pub use circuit_breaker::{
    BreakerSettings, CallError, CircuitBreaker, CircuitOpen, CircuitStateKind, CircuitStatus,
};
pub use retries::{retry, RetryError, RetryHint, RetryPolicy, Retryable};
