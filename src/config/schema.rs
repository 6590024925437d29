//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the guard
//! layers. All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GuardConfig {
    /// Lease lock settings.
    pub locks: LockConfig,

    /// Circuit breaker defaults and per-dependency overrides.
    pub breaker: BreakerConfig,

    /// Resource pressure monitor settings.
    pub pressure: PressureConfig,

    /// Caller-side retry policy.
    pub retry: RetryConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Lease lock configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LockConfig {
    /// TTL applied when the caller does not pass one, in seconds.
    pub default_ttl_secs: u64,

    /// Directory holding the shared lock records (file store).
    pub store_dir: String,

    /// Age after which an abandoned store guard file is broken, in milliseconds.
    pub guard_stale_ms: u64,

    /// Longest wait for a store guard file, in milliseconds.
    pub guard_wait_ms: u64,
}

impl LockConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 30,
            store_dir: ".opguard/locks".to_string(),
            guard_stale_ms: 10_000,
            guard_wait_ms: 2_000,
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive counted failures that open the circuit.
    pub failure_threshold: u32,

    /// Cooldown before a half-open probe is admitted, in milliseconds.
    pub open_timeout_ms: u64,

    /// Successful probes needed to close the circuit.
    pub half_open_success_required: u32,

    /// Cooldown growth per back-to-back re-open. 1.0 keeps it fixed.
    pub backoff_multiplier: f64,

    /// Upper bound on the grown cooldown, in milliseconds.
    pub max_open_timeout_ms: u64,

    /// Per-dependency overrides.
    pub dependencies: Vec<DependencyBreakerConfig>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout_ms: 30_000,
            half_open_success_required: 1,
            backoff_multiplier: 1.0,
            max_open_timeout_ms: 300_000,
            dependencies: Vec::new(),
        }
    }
}

/// Override for a single named dependency. Unset fields use the defaults.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DependencyBreakerConfig {
    /// Dependency name as passed to `CircuitBreaker::execute`.
    pub name: String,
    pub failure_threshold: Option<u32>,
    pub open_timeout_ms: Option<u64>,
    pub half_open_success_required: Option<u32>,
    pub backoff_multiplier: Option<f64>,
    pub max_open_timeout_ms: Option<u64>,
}

/// Resource pressure configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PressureConfig {
    /// Points added for "insufficient resources" class errors.
    pub insufficient_resources_weight: f64,

    /// Points added for failed dynamic module loads.
    pub dynamic_module_weight: f64,

    /// Pressure at which emergency mode is entered.
    pub high_watermark: f64,

    /// Pressure at which emergency mode is left.
    pub low_watermark: f64,

    /// Pressure at which new work is refused while in emergency mode.
    pub hard_ceiling: f64,

    /// Points removed per second without new signals.
    pub decay_per_sec: f64,

    /// Background decay tick interval in milliseconds.
    pub decay_interval_ms: u64,
}

impl Default for PressureConfig {
    fn default() -> Self {
        Self {
            insufficient_resources_weight: 15.0,
            dynamic_module_weight: 25.0,
            high_watermark: 80.0,
            low_watermark: 40.0,
            hard_ceiling: 95.0,
            decay_per_sec: 0.5,
            decay_interval_ms: 5_000,
        }
    }
}

/// Retry configuration handed to callers of the guard.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,

    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,

    /// Maximum delay for exponential backoff in milliseconds.
    pub max_delay_ms: u64,

    /// Jitter as a fraction of the computed delay (0.1 = up to 10%).
    pub jitter_ratio: f64,

    /// Delay multiplier applied when the local process is under pressure.
    pub deferred_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
            jitter_ratio: 0.1,
            deferred_multiplier: 4.0,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable the Prometheus scrape endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9100".to_string(),
        }
    }
}
