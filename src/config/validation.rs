//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (thresholds > 0, watermarks ordered)
//! - Detect duplicate dependency overrides
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GuardConfig → Result<(), Vec<ValidationError>>

use std::collections::HashSet;
use std::fmt;

use crate::config::schema::{BreakerConfig, GuardConfig, LockConfig, PressureConfig, RetryConfig};
use crate::locks::file::MIN_GUARD_STALE;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Check a parsed configuration for semantic errors.
pub fn validate_config(config: &GuardConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    validate_locks(&config.locks, &mut errors);
    validate_breaker(&config.breaker, &mut errors);
    validate_pressure(&config.pressure, &mut errors);
    validate_retry(&config.retry, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_locks(locks: &LockConfig, errors: &mut Vec<ValidationError>) {
    if locks.default_ttl_secs == 0 {
        errors.push(ValidationError::new("locks.default_ttl_secs", "must be greater than 0"));
    }
    if locks.store_dir.trim().is_empty() {
        errors.push(ValidationError::new("locks.store_dir", "must not be empty"));
    }
    if locks.guard_wait_ms == 0 {
        errors.push(ValidationError::new("locks.guard_wait_ms", "must be greater than 0"));
    }
    // A live critical section must never look abandoned to a waiter.
    let min_stale_ms = MIN_GUARD_STALE.as_millis() as u64;
    if locks.guard_stale_ms < min_stale_ms {
        errors.push(ValidationError::new(
            "locks.guard_stale_ms",
            format!("must be at least {min_stale_ms}"),
        ));
    } else if locks.guard_stale_ms <= locks.guard_wait_ms.saturating_mul(2) {
        errors.push(ValidationError::new(
            "locks.guard_stale_ms",
            "must be more than twice guard_wait_ms",
        ));
    }
}

fn validate_breaker(breaker: &BreakerConfig, errors: &mut Vec<ValidationError>) {
    check_breaker_values(
        "breaker",
        Some(breaker.failure_threshold),
        Some(breaker.half_open_success_required),
        Some(breaker.backoff_multiplier),
        errors,
    );
    if breaker.max_open_timeout_ms < breaker.open_timeout_ms {
        errors.push(ValidationError::new(
            "breaker.max_open_timeout_ms",
            "must be at least open_timeout_ms",
        ));
    }

    let mut seen = HashSet::new();
    for dep in &breaker.dependencies {
        let prefix = format!("breaker.dependencies[{}]", dep.name);
        if dep.name.trim().is_empty() {
            errors.push(ValidationError::new("breaker.dependencies.name", "must not be empty"));
        } else if !seen.insert(dep.name.as_str()) {
            errors.push(ValidationError::new(prefix.clone(), "duplicate dependency override"));
        }
        check_breaker_values(
            &prefix,
            dep.failure_threshold,
            dep.half_open_success_required,
            dep.backoff_multiplier,
            errors,
        );
    }
}

fn check_breaker_values(
    prefix: &str,
    failure_threshold: Option<u32>,
    half_open_success_required: Option<u32>,
    backoff_multiplier: Option<f64>,
    errors: &mut Vec<ValidationError>,
) {
    if failure_threshold == Some(0) {
        errors.push(ValidationError::new(
            format!("{prefix}.failure_threshold"),
            "must be greater than 0",
        ));
    }
    if half_open_success_required == Some(0) {
        errors.push(ValidationError::new(
            format!("{prefix}.half_open_success_required"),
            "must be greater than 0",
        ));
    }
    if let Some(multiplier) = backoff_multiplier {
        if !multiplier.is_finite() || multiplier < 1.0 {
            errors.push(ValidationError::new(
                format!("{prefix}.backoff_multiplier"),
                "must be a finite number >= 1.0",
            ));
        }
    }
}

fn validate_pressure(pressure: &PressureConfig, errors: &mut Vec<ValidationError>) {
    let in_range = |v: f64| v.is_finite() && (0.0..=100.0).contains(&v);

    for (field, value) in [
        ("pressure.high_watermark", pressure.high_watermark),
        ("pressure.low_watermark", pressure.low_watermark),
        ("pressure.hard_ceiling", pressure.hard_ceiling),
        ("pressure.insufficient_resources_weight", pressure.insufficient_resources_weight),
        ("pressure.dynamic_module_weight", pressure.dynamic_module_weight),
    ] {
        if !in_range(value) {
            errors.push(ValidationError::new(field, "must be within 0..=100"));
        }
    }

    if pressure.low_watermark >= pressure.high_watermark {
        errors.push(ValidationError::new(
            "pressure.low_watermark",
            "must be strictly lower than high_watermark",
        ));
    }
    if pressure.hard_ceiling < pressure.high_watermark {
        errors.push(ValidationError::new(
            "pressure.hard_ceiling",
            "must be at least high_watermark",
        ));
    }
    if !pressure.decay_per_sec.is_finite() || pressure.decay_per_sec < 0.0 {
        errors.push(ValidationError::new(
            "pressure.decay_per_sec",
            "must be a non-negative number",
        ));
    }
    if pressure.decay_interval_ms == 0 {
        errors.push(ValidationError::new(
            "pressure.decay_interval_ms",
            "must be greater than 0",
        ));
    }
}

fn validate_retry(retry: &RetryConfig, errors: &mut Vec<ValidationError>) {
    if retry.max_attempts == 0 {
        errors.push(ValidationError::new("retry.max_attempts", "must be at least 1"));
    }
    if retry.max_delay_ms < retry.base_delay_ms {
        errors.push(ValidationError::new(
            "retry.max_delay_ms",
            "must be at least base_delay_ms",
        ));
    }
    if !(0.0..=1.0).contains(&retry.jitter_ratio) {
        errors.push(ValidationError::new("retry.jitter_ratio", "must be within 0..=1"));
    }
    if !retry.deferred_multiplier.is_finite() || retry.deferred_multiplier < 1.0 {
        errors.push(ValidationError::new(
            "retry.deferred_multiplier",
            "must be a finite number >= 1.0",
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::DependencyBreakerConfig;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&GuardConfig::default()).is_ok());
    }

    #[test]
    fn test_collects_every_error() {
        let mut config = GuardConfig::default();
        config.locks.default_ttl_secs = 0;
        config.pressure.low_watermark = 90.0;
        config.retry.max_attempts = 0;

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"locks.default_ttl_secs"));
        assert!(fields.contains(&"pressure.low_watermark"));
        assert!(fields.contains(&"retry.max_attempts"));
    }

    #[test]
    fn test_rejects_shrinking_cooldown() {
        let mut config = GuardConfig::default();
        config.breaker.backoff_multiplier = 0.5;
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors[0].field, "breaker.backoff_multiplier");
    }

    #[test]
    fn test_rejects_short_guard_staleness() {
        let mut config = GuardConfig::default();
        config.locks.guard_stale_ms = 0;
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "locks.guard_stale_ms");

        config.locks.guard_stale_ms = 3_000;
        config.locks.guard_wait_ms = 2_000;
        let errors = validate_config(&config).unwrap_err();
        assert!(errors[0].message.contains("guard_wait_ms"));
    }

    #[test]
    fn test_duplicate_dependency_override() {
        let mut config = GuardConfig::default();
        let dep = DependencyBreakerConfig {
            name: "driveApi".into(),
            failure_threshold: Some(3),
            open_timeout_ms: None,
            half_open_success_required: None,
            backoff_multiplier: None,
            max_open_timeout_ms: None,
        };
        config.breaker.dependencies = vec![dep.clone(), dep];

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].to_string().contains("duplicate"));
    }
}
