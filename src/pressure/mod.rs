//! Resource pressure subsystem.
//!
//! # Data Flow
//! ```text
//! Failed operation (any caller)
//!     → signals.rs (classify message into a weighted signal)
//!     → monitor.rs (add weight, clamp, hysteresis)
//!
//! Decay loop / explicit tick
//!     → monitor.rs (subtract decay, hysteresis)
//!
//! New work
//!     → monitor.rs run_protected (refuse at hard ceiling)
//! ```
//!
//! # Design Decisions
//! - One explicit monitor value per process, never a global
//! - Two watermarks prevent flapping at a single boundary
//! - Time comes from the injected clock so decay is testable

pub mod monitor;
pub mod signals;

pub use monitor::{PressureStatus, ProtectedError, ResourceMonitor};
pub use signals::PressureSignal;
