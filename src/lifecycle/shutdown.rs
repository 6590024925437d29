//! Shutdown and cancellation signals.
//!
//! A `Shutdown` owns the sending side; every long-running task or
//! caller-facing operation receives a `Cancellation` that fires when the
//! owner triggers or when the token's own deadline passes.

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Returned when work is abandoned because its cancellation fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Coordinator for cancelling a group of tasks.
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Get a token that fires when `trigger` is called.
    pub fn token(&self) -> Cancellation {
        Cancellation {
            rx: Some(self.tx.subscribe()),
            deadline: None,
        }
    }

    /// Fire every token handed out by this coordinator.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Caller-supplied cancellation signal with an optional deadline.
#[derive(Debug, Clone)]
pub struct Cancellation {
    rx: Option<watch::Receiver<bool>>,
    deadline: Option<Instant>,
}

impl Cancellation {
    /// A token that never fires on its own.
    pub fn never() -> Self {
        Self {
            rx: None,
            deadline: None,
        }
    }

    /// A token that fires after `timeout`.
    pub fn after(timeout: Duration) -> Self {
        Self::never().with_timeout(timeout)
    }

    /// Same signal, additionally bounded by `timeout` from now.
    ///
    /// An existing earlier deadline is kept.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) if existing <= candidate => existing,
            _ => candidate,
        };
        Self {
            rx: self.rx.clone(),
            deadline: Some(deadline),
        }
    }

    /// Whether the signal has already fired.
    pub fn is_cancelled(&self) -> bool {
        let triggered = self.rx.as_ref().is_some_and(|rx| *rx.borrow());
        let expired = self.deadline.is_some_and(|d| Instant::now() >= d);
        triggered || expired
    }

    /// Resolves once the signal fires. Pending forever for `never()`.
    pub async fn cancelled(&self) {
        let triggered = async {
            match self.rx.clone() {
                Some(mut rx) => {
                    // A dropped sender means nobody can cancel us any more.
                    if rx.wait_for(|fired| *fired).await.is_err() {
                        std::future::pending::<()>().await;
                    }
                }
                None => std::future::pending::<()>().await,
            }
        };
        let expired = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = triggered => {}
            _ = expired => {}
        }
    }

    /// Drive `fut` to completion unless the signal fires first.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, Cancelled> {
        if self.is_cancelled() {
            return Err(Cancelled);
        }
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(Cancelled),
            out = fut => Ok(out),
        }
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::never()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trigger_cancels_tokens() {
        let shutdown = Shutdown::new();
        let token = shutdown.token();
        assert!(!token.is_cancelled());

        shutdown.trigger();
        assert!(token.is_cancelled());
        assert_eq!(token.run(async { 1 }).await, Err(Cancelled));
    }

    #[tokio::test]
    async fn test_never_runs_to_completion() {
        let token = Cancellation::never();
        assert_eq!(token.run(async { 7 }).await, Ok(7));
    }

    #[tokio::test]
    async fn test_deadline_interrupts_slow_work() {
        let token = Cancellation::after(Duration::from_millis(20));
        let result = token
            .run(tokio::time::sleep(Duration::from_secs(5)))
            .await;
        assert_eq!(result, Err(Cancelled));
    }

    #[tokio::test]
    async fn test_trigger_while_waiting() {
        let shutdown = Shutdown::new();
        let token = shutdown.token();
        let waiter = tokio::spawn(async move { token.cancelled().await });
        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should observe trigger")
            .unwrap();
    }
}
