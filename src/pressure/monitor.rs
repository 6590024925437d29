//! Process-local resource pressure monitor.
//!
//! # Responsibilities
//! - Accumulate a 0-100 pressure score from exhaustion signals
//! - Decay the score over clock time
//! - Enter/leave emergency mode with hysteresis
//! - Refuse new work at the hard ceiling
//!
//! # State Transitions
//! ```text
//! Normal → Emergency: pressure >= high_watermark
//! Emergency → Normal: pressure <= low_watermark
//! ```
//! Between the two watermarks the current mode is kept.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::clock::{elapsed_between, SharedClock};
use crate::config::PressureConfig;
use crate::lifecycle::Cancellation;
use crate::observability::metrics;
use crate::pressure::signals::PressureSignal;

/// Mutable pressure state, one per process.
#[derive(Debug, Clone)]
struct ResourcePressure {
    pressure: f64,
    emergency_mode: bool,
    last_update_at: DateTime<Utc>,
    last_decay_at: DateTime<Utc>,
}

/// Read-only view for dashboards.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PressureStatus {
    pub pressure: f64,
    pub emergency_mode: bool,
}

/// Error from `ResourceMonitor::run_protected`.
#[derive(Debug, Error)]
pub enum ProtectedError<E> {
    /// Refused without running the operation.
    #[error("resource pressure {pressure:.1} is above the shedding ceiling")]
    Exhausted { pressure: f64 },

    /// The operation ran and failed.
    #[error("{0}")]
    Failed(E),
}

/// Tracks resource pressure and sheds load under exhaustion.
#[derive(Debug)]
pub struct ResourceMonitor {
    config: PressureConfig,
    clock: SharedClock,
    state: Mutex<ResourcePressure>,
}

impl ResourceMonitor {
    /// Create a monitor with zero pressure.
    pub fn new(config: PressureConfig, clock: SharedClock) -> Self {
        let now = clock.now();
        Self {
            config,
            clock,
            state: Mutex::new(ResourcePressure {
                pressure: 0.0,
                emergency_mode: false,
                last_update_at: now,
                last_decay_at: now,
            }),
        }
    }

    pub fn config(&self) -> &PressureConfig {
        &self.config
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ResourcePressure> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inspect an error and add its weight if it is a known exhaustion signal.
    pub fn report<E: Display + ?Sized>(&self, error: &E) -> Option<PressureSignal> {
        let signal = PressureSignal::classify(&error.to_string())?;
        self.report_signal(signal);
        Some(signal)
    }

    /// Apply a known signal directly.
    pub fn report_signal(&self, signal: PressureSignal) -> PressureStatus {
        let weight = signal.weight(&self.config);
        let mut state = self.lock_state();
        state.pressure = (state.pressure + weight).clamp(0.0, 100.0);
        state.last_update_at = self.clock.now();
        tracing::debug!(
            signal = signal.as_str(),
            weight,
            pressure = state.pressure,
            "Resource pressure signal reported"
        );
        self.apply_hysteresis(&mut state);
        Self::status_of(&state)
    }

    /// Remove `decay_per_sec * elapsed` points, floored at zero.
    pub fn decay(&self, elapsed: Duration) -> PressureStatus {
        let mut state = self.lock_state();
        self.decay_locked(&mut state, elapsed);
        state.last_decay_at = self.clock.now();
        Self::status_of(&state)
    }

    /// Decay by the clock time since the previous tick.
    pub fn tick(&self) -> PressureStatus {
        let now = self.clock.now();
        let mut state = self.lock_state();
        let elapsed = elapsed_between(state.last_decay_at, now);
        self.decay_locked(&mut state, elapsed);
        state.last_decay_at = now;
        Self::status_of(&state)
    }

    fn decay_locked(&self, state: &mut ResourcePressure, elapsed: Duration) {
        if state.pressure <= 0.0 {
            return;
        }
        let amount = self.config.decay_per_sec * elapsed.as_secs_f64();
        state.pressure = (state.pressure - amount).clamp(0.0, 100.0);
        self.apply_hysteresis(state);
    }

    fn apply_hysteresis(&self, state: &mut ResourcePressure) {
        if !state.emergency_mode && state.pressure >= self.config.high_watermark {
            state.emergency_mode = true;
            tracing::warn!(
                pressure = state.pressure,
                high_watermark = self.config.high_watermark,
                "Entering emergency mode"
            );
        } else if state.emergency_mode && state.pressure <= self.config.low_watermark {
            state.emergency_mode = false;
            tracing::info!(
                pressure = state.pressure,
                low_watermark = self.config.low_watermark,
                "Leaving emergency mode"
            );
        }
        metrics::record_pressure(state.pressure, state.emergency_mode);
    }

    fn status_of(state: &ResourcePressure) -> PressureStatus {
        PressureStatus {
            pressure: state.pressure,
            emergency_mode: state.emergency_mode,
        }
    }

    /// Current pressure and mode.
    pub fn status(&self) -> PressureStatus {
        Self::status_of(&self.lock_state())
    }

    /// Pressure value if new work must be refused right now.
    pub fn shedding_pressure(&self) -> Option<f64> {
        let state = self.lock_state();
        (state.emergency_mode && state.pressure >= self.config.hard_ceiling)
            .then_some(state.pressure)
    }

    /// Run `op` unless the process is at the hard ceiling.
    ///
    /// Failures are reported before the original error is returned.
    pub async fn run_protected<F, Fut, T, E>(&self, op: F) -> Result<T, ProtectedError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        if let Some(pressure) = self.shedding_pressure() {
            tracing::warn!(pressure, "Shedding load: refusing new work");
            metrics::record_load_shed();
            return Err(ProtectedError::Exhausted { pressure });
        }

        match op().await {
            Ok(value) => Ok(value),
            Err(e) => {
                self.report(&e);
                Err(ProtectedError::Failed(e))
            }
        }
    }

    /// Return to zero pressure and normal mode.
    pub fn reset(&self) {
        let now = self.clock.now();
        let mut state = self.lock_state();
        state.pressure = 0.0;
        state.emergency_mode = false;
        state.last_update_at = now;
        state.last_decay_at = now;
        metrics::record_pressure(0.0, false);
    }

    /// Spawn a loop that ticks the decay every `decay_interval_ms` until cancelled.
    pub fn spawn_decay_loop(self: &Arc<Self>, cancel: Cancellation) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        let interval = Duration::from_millis(monitor.config.decay_interval_ms);
        tokio::spawn(async move {
            tracing::debug!(interval_ms = interval.as_millis() as u64, "Pressure decay loop starting");
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        monitor.tick();
                    }
                    _ = cancel.cancelled() => {
                        tracing::debug!("Pressure decay loop stopping");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn monitor() -> (Arc<ManualClock>, ResourceMonitor) {
        let clock = ManualClock::starting_now();
        let monitor = ResourceMonitor::new(PressureConfig::default(), clock.clone());
        (clock, monitor)
    }

    fn set_pressure(monitor: &ResourceMonitor, value: f64) {
        let mut state = monitor.lock_state();
        state.pressure = value;
        monitor.apply_hysteresis(&mut state);
    }

    #[test]
    fn test_weights_accumulate() {
        let (_, monitor) = monitor();
        for _ in 0..3 {
            monitor.report_signal(PressureSignal::DynamicModuleLoad);
        }
        assert_eq!(monitor.status().pressure, 75.0);
        assert!(!monitor.status().emergency_mode);
    }

    #[test]
    fn test_pressure_is_clamped() {
        let (_, monitor) = monitor();
        for _ in 0..10 {
            monitor.report_signal(PressureSignal::DynamicModuleLoad);
        }
        assert_eq!(monitor.status().pressure, 100.0);
    }

    #[test]
    fn test_unrelated_errors_leave_pressure_alone() {
        let (_, monitor) = monitor();
        assert_eq!(monitor.report("connection refused"), None);
        assert_eq!(monitor.status().pressure, 0.0);
        assert_eq!(
            monitor.report("ERR_INSUFFICIENT_RESOURCES"),
            Some(PressureSignal::InsufficientResources)
        );
        assert_eq!(monitor.status().pressure, 15.0);
    }

    #[test]
    fn test_decay_with_clock() {
        let (clock, monitor) = monitor();
        for _ in 0..3 {
            monitor.report_signal(PressureSignal::DynamicModuleLoad);
        }

        clock.advance(Duration::from_secs(10));
        let after = monitor.tick().pressure;
        assert!(after < 75.0);
        assert_eq!(after, 70.0);

        clock.advance(Duration::from_secs(1_000));
        assert_eq!(monitor.tick().pressure, 0.0);
    }

    #[test]
    fn test_hysteresis_does_not_flap() {
        let (_, monitor) = monitor();

        set_pressure(&monitor, 78.0);
        assert!(!monitor.status().emergency_mode);

        set_pressure(&monitor, 82.0);
        assert!(monitor.status().emergency_mode);

        for _ in 0..5 {
            set_pressure(&monitor, 78.0);
            assert!(monitor.status().emergency_mode);
            set_pressure(&monitor, 82.0);
            assert!(monitor.status().emergency_mode);
        }

        set_pressure(&monitor, 41.0);
        assert!(monitor.status().emergency_mode);
        set_pressure(&monitor, 40.0);
        assert!(!monitor.status().emergency_mode);

        set_pressure(&monitor, 78.0);
        assert!(!monitor.status().emergency_mode);
    }

    #[test]
    fn test_decay_leaves_emergency_mode() {
        let (_, monitor) = monitor();
        set_pressure(&monitor, 90.0);
        assert!(monitor.status().emergency_mode);

        monitor.decay(Duration::from_secs(60));
        assert!(monitor.status().emergency_mode, "60 points left, still above 40");

        monitor.decay(Duration::from_secs(40));
        let status = monitor.status();
        assert_eq!(status.pressure, 40.0);
        assert!(!status.emergency_mode);
    }

    #[tokio::test]
    async fn test_run_protected_rejects_at_ceiling() {
        let (_, monitor) = monitor();
        set_pressure(&monitor, 96.0);

        let mut invoked = false;
        let result: Result<(), ProtectedError<String>> = monitor
            .run_protected(|| {
                invoked = true;
                async { Ok(()) }
            })
            .await;

        assert!(matches!(result, Err(ProtectedError::Exhausted { .. })));
        assert!(!invoked);
    }

    #[tokio::test]
    async fn test_run_protected_admits_below_ceiling_in_emergency() {
        let (_, monitor) = monitor();
        set_pressure(&monitor, 85.0);
        assert!(monitor.status().emergency_mode);

        let result: Result<u8, ProtectedError<String>> =
            monitor.run_protected(|| async { Ok(1) }).await;
        assert_eq!(result.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_run_protected_reports_failures() {
        let (_, monitor) = monitor();
        let result: Result<(), ProtectedError<String>> = monitor
            .run_protected(|| async { Err("Loading chunk 7 failed".to_string()) })
            .await;

        match result {
            Err(ProtectedError::Failed(message)) => assert!(message.contains("chunk")),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(monitor.status().pressure, 25.0);
    }

    #[test]
    fn test_reset() {
        let (_, monitor) = monitor();
        set_pressure(&monitor, 99.0);
        monitor.reset();
        assert_eq!(
            monitor.status(),
            PressureStatus {
                pressure: 0.0,
                emergency_mode: false
            }
        );
    }

    #[tokio::test]
    async fn test_decay_loop_ticks_until_cancelled() {
        let clock = ManualClock::starting_now();
        let config = PressureConfig {
            decay_per_sec: 10.0,
            decay_interval_ms: 10,
            ..PressureConfig::default()
        };
        let monitor = Arc::new(ResourceMonitor::new(config, clock.clone()));
        monitor.report_signal(PressureSignal::DynamicModuleLoad);

        let shutdown = crate::lifecycle::Shutdown::new();
        let handle = monitor.spawn_decay_loop(shutdown.token());

        clock.advance(Duration::from_secs(2));
        tokio::time::timeout(Duration::from_secs(5), async {
            while monitor.status().pressure > 5.0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("decay loop never ticked");
        assert_eq!(monitor.status().pressure, 5.0);

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("decay loop ignored cancellation")
            .unwrap();

        // No more ticks once stopped.
        clock.advance(Duration::from_secs(10));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(monitor.status().pressure, 5.0);
    }
}
