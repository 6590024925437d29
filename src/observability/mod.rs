//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! locks / resilience / pressure / guard:
//!     → tracing events at every state transition (logging.rs)
//!     → counters and gauges (metrics.rs)
//!
//! Consumers:
//!     → stderr via tracing-subscriber
//!     → Prometheus scrape endpoint (optional)
//! ```
//!
//! # Design Decisions
//! - Library code emits, the binary decides where output goes
//! - Metrics are cheap (atomic increments) and no-ops without a recorder

pub mod logging;
pub mod metrics;
