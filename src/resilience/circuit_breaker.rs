//! Circuit breaker for remote dependency protection.
//!
//! # States
//! - Closed: normal operation, calls pass through
//! - Open: dependency assumed down, calls fail fast
//! - Half-Open: a single probe call tests whether it recovered
//!
//! # State Transitions
//! ```text
//! Closed → Open: consecutive counted failures >= failure_threshold
//! Open → Half-Open: next call after the open timeout elapses (becomes the probe)
//! Half-Open → Closed: half_open_success_required probes succeed
//! Half-Open → Open: probe fails (cooldown restarts)
//! ```
//!
//! # Design Decisions
//! - Per-dependency circuit breaker (not global), created lazily
//! - Fail fast in Open state (the operation is never invoked)
//! - Single probe in Half-Open (prevents hammering recovering dependency)
//! - Permanent failures are surfaced but never counted
//! - Cooldown after a failed probe is `open_timeout * backoff_multiplier^reopens`,
//!   capped at `max_open_timeout`; the default multiplier of 1.0 keeps it fixed

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;

use crate::clock::{elapsed_between, SharedClock};
use crate::config::BreakerConfig;
use crate::error::{Classify, FailureKind};
use crate::observability::metrics;

/// Circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStateKind {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitStateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitStateKind::Closed => "closed",
            CircuitStateKind::Open => "open",
            CircuitStateKind::HalfOpen => "half_open",
        }
    }
}

/// Resolved breaker settings for one dependency.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub open_timeout: Duration,
    pub half_open_success_required: u32,
    pub backoff_multiplier: f64,
    pub max_open_timeout: Duration,
}

impl BreakerSettings {
    /// Cooldown after `reopens` back-to-back failed probes.
    pub fn open_timeout_after(&self, reopens: u32) -> Duration {
        if reopens == 0 || self.backoff_multiplier <= 1.0 {
            return self.open_timeout;
        }
        let exponent = i32::try_from(reopens).unwrap_or(i32::MAX);
        let factor = self.backoff_multiplier.powi(exponent);
        let grown = self.open_timeout.as_secs_f64() * factor;
        let cap = self.max_open_timeout.as_secs_f64();
        if !grown.is_finite() || grown >= cap {
            self.max_open_timeout
        } else {
            Duration::from_secs_f64(grown)
        }
    }
}

impl Default for BreakerSettings {
    fn default() -> Self {
        let config = BreakerConfig::default();
        Self {
            failure_threshold: config.failure_threshold,
            open_timeout: Duration::from_millis(config.open_timeout_ms),
            half_open_success_required: config.half_open_success_required,
            backoff_multiplier: config.backoff_multiplier,
            max_open_timeout: Duration::from_millis(config.max_open_timeout_ms),
        }
    }
}

/// Rejection returned without invoking the operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("circuit for '{dependency}' is open; retry after {retry_after:?}")]
pub struct CircuitOpen {
    pub dependency: String,
    pub retry_after: Duration,
}

/// Error from `CircuitBreaker::execute`.
#[derive(Debug, Error)]
pub enum CallError<E> {
    #[error(transparent)]
    Rejected(CircuitOpen),

    #[error("{0}")]
    Failed(E),
}

/// Per-dependency state.
#[derive(Debug, Clone)]
struct CircuitState {
    name: String,
    state: CircuitStateKind,
    consecutive_failures: u32,
    opened_at: Option<DateTime<Utc>>,
    half_open_probe_in_flight: bool,
    half_open_successes: u32,
    consecutive_opens: u32,
}

impl CircuitState {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: CircuitStateKind::Closed,
            consecutive_failures: 0,
            opened_at: None,
            half_open_probe_in_flight: false,
            half_open_successes: 0,
            consecutive_opens: 0,
        }
    }
}

/// Read-only view of one circuit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitStatus {
    pub name: String,
    pub state: CircuitStateKind,
    pub consecutive_failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub half_open_probe_in_flight: bool,
    pub consecutive_opens: u32,
    pub open_timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Probe,
}

/// Frees the half-open probe slot if the probe future is dropped unfinished.
struct ProbeSlot<'a> {
    circuit: &'a Mutex<CircuitState>,
    armed: bool,
}

impl ProbeSlot<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ProbeSlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.circuit.lock().unwrap_or_else(PoisonError::into_inner);
            if state.state == CircuitStateKind::HalfOpen {
                state.half_open_probe_in_flight = false;
                tracing::debug!(dependency = %state.name, "Half-open probe abandoned");
            }
        }
    }
}

/// Registry of circuit breakers keyed by dependency name.
#[derive(Debug)]
pub struct CircuitBreaker {
    defaults: BreakerSettings,
    overrides: HashMap<String, BreakerSettings>,
    clock: SharedClock,
    circuits: DashMap<String, Arc<Mutex<CircuitState>>>,
}

impl CircuitBreaker {
    /// Create a registry where every dependency uses `defaults`.
    pub fn new(defaults: BreakerSettings, clock: SharedClock) -> Self {
        Self {
            defaults,
            overrides: HashMap::new(),
            clock,
            circuits: DashMap::new(),
        }
    }

    /// Create a registry from configuration, including per-dependency overrides.
    pub fn from_config(config: &BreakerConfig, clock: SharedClock) -> Self {
        let defaults = BreakerSettings {
            failure_threshold: config.failure_threshold,
            open_timeout: Duration::from_millis(config.open_timeout_ms),
            half_open_success_required: config.half_open_success_required,
            backoff_multiplier: config.backoff_multiplier,
            max_open_timeout: Duration::from_millis(config.max_open_timeout_ms),
        };
        let overrides = config
            .dependencies
            .iter()
            .map(|dep| {
                let settings = BreakerSettings {
                    failure_threshold: dep.failure_threshold.unwrap_or(defaults.failure_threshold),
                    open_timeout: dep
                        .open_timeout_ms
                        .map(Duration::from_millis)
                        .unwrap_or(defaults.open_timeout),
                    half_open_success_required: dep
                        .half_open_success_required
                        .unwrap_or(defaults.half_open_success_required),
                    backoff_multiplier: dep.backoff_multiplier.unwrap_or(defaults.backoff_multiplier),
                    max_open_timeout: dep
                        .max_open_timeout_ms
                        .map(Duration::from_millis)
                        .unwrap_or(defaults.max_open_timeout),
                };
                (dep.name.clone(), settings)
            })
            .collect();

        Self {
            defaults,
            overrides,
            clock,
            circuits: DashMap::new(),
        }
    }

    /// Use specific settings for one dependency.
    pub fn with_override(mut self, name: impl Into<String>, settings: BreakerSettings) -> Self {
        self.overrides.insert(name.into(), settings);
        self
    }

    /// Settings in effect for `name`.
    pub fn settings(&self, name: &str) -> &BreakerSettings {
        self.overrides.get(name).unwrap_or(&self.defaults)
    }

    fn circuit(&self, name: &str) -> Arc<Mutex<CircuitState>> {
        if let Some(existing) = self.circuits.get(name) {
            return Arc::clone(existing.value());
        }
        Arc::clone(
            self.circuits
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(CircuitState::new(name))))
                .value(),
        )
    }

    fn lock(circuit: &Mutex<CircuitState>) -> MutexGuard<'_, CircuitState> {
        circuit.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `op` through the breaker for dependency `name`.
    ///
    /// While the circuit is open (between probes) `op` is never invoked.
    pub async fn execute<F, Fut, T, E>(&self, name: &str, op: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify,
    {
        let circuit = self.circuit(name);
        let settings = self.settings(name);

        let admission = self.admit(&circuit, settings).map_err(CallError::Rejected)?;
        let mut probe = ProbeSlot {
            circuit: &circuit,
            armed: admission == Admission::Probe,
        };

        let result = op().await;
        probe.disarm();

        match &result {
            Ok(_) => self.on_success(&circuit, settings, admission),
            Err(e) => self.on_failure(&circuit, settings, admission, e.failure_kind()),
        }
        result.map_err(CallError::Failed)
    }

    fn admit(
        &self,
        circuit: &Mutex<CircuitState>,
        settings: &BreakerSettings,
    ) -> Result<Admission, CircuitOpen> {
        let mut state = Self::lock(circuit);
        match state.state {
            CircuitStateKind::Closed => Ok(Admission::Normal),
            CircuitStateKind::Open => {
                let now = self.clock.now();
                let cooldown = settings.open_timeout_after(state.consecutive_opens);
                let elapsed = state
                    .opened_at
                    .map(|at| elapsed_between(at, now))
                    .unwrap_or(cooldown);
                if elapsed >= cooldown {
                    state.state = CircuitStateKind::HalfOpen;
                    state.half_open_probe_in_flight = true;
                    state.half_open_successes = 0;
                    tracing::info!(dependency = %state.name, "Circuit half-open, admitting probe");
                    metrics::record_circuit_transition(&state.name, CircuitStateKind::HalfOpen.as_str());
                    Ok(Admission::Probe)
                } else {
                    metrics::record_circuit_rejection(&state.name);
                    Err(CircuitOpen {
                        dependency: state.name.clone(),
                        retry_after: cooldown - elapsed,
                    })
                }
            }
            CircuitStateKind::HalfOpen => {
                if state.half_open_probe_in_flight {
                    metrics::record_circuit_rejection(&state.name);
                    Err(CircuitOpen {
                        dependency: state.name.clone(),
                        retry_after: settings.open_timeout,
                    })
                } else {
                    state.half_open_probe_in_flight = true;
                    Ok(Admission::Probe)
                }
            }
        }
    }

    fn on_success(&self, circuit: &Mutex<CircuitState>, settings: &BreakerSettings, admission: Admission) {
        let mut state = Self::lock(circuit);
        match admission {
            Admission::Probe if state.state == CircuitStateKind::HalfOpen => {
                state.half_open_probe_in_flight = false;
                state.half_open_successes += 1;
                if state.half_open_successes >= settings.half_open_success_required {
                    state.state = CircuitStateKind::Closed;
                    state.consecutive_failures = 0;
                    state.consecutive_opens = 0;
                    state.half_open_successes = 0;
                    state.opened_at = None;
                    tracing::info!(dependency = %state.name, "Circuit closed, dependency recovered");
                    metrics::record_circuit_transition(&state.name, CircuitStateKind::Closed.as_str());
                }
            }
            Admission::Normal if state.state == CircuitStateKind::Closed => {
                state.consecutive_failures = 0;
            }
            _ => {}
        }
    }

    fn on_failure(
        &self,
        circuit: &Mutex<CircuitState>,
        settings: &BreakerSettings,
        admission: Admission,
        kind: FailureKind,
    ) {
        let mut state = Self::lock(circuit);
        if kind == FailureKind::Permanent {
            if admission == Admission::Probe {
                state.half_open_probe_in_flight = false;
            }
            tracing::debug!(dependency = %state.name, "Permanent failure not counted");
            return;
        }

        match admission {
            Admission::Probe if state.state == CircuitStateKind::HalfOpen => {
                state.state = CircuitStateKind::Open;
                state.opened_at = Some(self.clock.now());
                state.half_open_probe_in_flight = false;
                state.half_open_successes = 0;
                state.consecutive_opens = state.consecutive_opens.saturating_add(1);
                tracing::warn!(
                    dependency = %state.name,
                    reopens = state.consecutive_opens,
                    cooldown_ms = settings.open_timeout_after(state.consecutive_opens).as_millis() as u64,
                    "Probe failed, circuit re-opened"
                );
                metrics::record_circuit_transition(&state.name, CircuitStateKind::Open.as_str());
            }
            Admission::Normal if state.state == CircuitStateKind::Closed => {
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                if state.consecutive_failures >= settings.failure_threshold {
                    state.state = CircuitStateKind::Open;
                    state.opened_at = Some(self.clock.now());
                    state.consecutive_opens = 0;
                    tracing::warn!(
                        dependency = %state.name,
                        failures = state.consecutive_failures,
                        "Circuit opened"
                    );
                    metrics::record_circuit_transition(&state.name, CircuitStateKind::Open.as_str());
                }
            }
            _ => {}
        }
    }

    fn status_of(&self, state: &CircuitState) -> CircuitStatus {
        let settings = self.settings(&state.name);
        CircuitStatus {
            name: state.name.clone(),
            state: state.state,
            consecutive_failures: state.consecutive_failures,
            opened_at: state.opened_at,
            half_open_probe_in_flight: state.half_open_probe_in_flight,
            consecutive_opens: state.consecutive_opens,
            open_timeout_ms: settings.open_timeout_after(state.consecutive_opens).as_millis() as u64,
        }
    }

    /// State and counters for `name`, `None` if it was never used.
    pub fn status(&self, name: &str) -> Option<CircuitStatus> {
        let circuit = self.circuits.get(name).map(|c| Arc::clone(c.value()))?;
        let state = Self::lock(&circuit);
        Some(self.status_of(&state))
    }

    /// Status of every known circuit, sorted by name.
    pub fn statuses(&self) -> Vec<CircuitStatus> {
        let circuits: Vec<_> = self.circuits.iter().map(|c| Arc::clone(c.value())).collect();
        let mut statuses: Vec<_> = circuits
            .iter()
            .map(|circuit| self.status_of(&Self::lock(circuit)))
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Forget the state of one dependency. Returns whether it existed.
    pub fn reset(&self, name: &str) -> bool {
        self.circuits.remove(name).is_some()
    }

    /// Forget every circuit.
    pub fn reset_all(&self) {
        self.circuits.clear();
    }
}
