//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Binary / embedding application:
//!     Shutdown::new() → token() per task or per operation
//!     Ctrl-C or caller deadline → Cancellation fires
//!     → lock waits, circuit-wrapped calls and the decay loop stop
//! ```
//!
//! # Design Decisions
//! - One signal type covers both explicit cancellation and deadlines
//! - Cancelled work never leaves a lock held past a best-effort release

pub mod shutdown;

pub use shutdown::{Cancellation, Cancelled, Shutdown};
