use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Per-backend failure-isolation state machine. All state lives under a
/// single mutex because concurrent requests to the same backend share one
/// breaker instance.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<BreakerInner>,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failure_count: u32,
    last_failure: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open { opened_at: Instant },
    /// A single trial call is in flight; everyone else is rejected.
    HalfOpen,
}

/// Coarse state label for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerStateKind {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerStateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerStateKind::Closed => "closed",
            BreakerStateKind::Open => "open",
            BreakerStateKind::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: BreakerStateKind,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, recovery_timeout: Duration) -> Self {
        let name = name.into();
        info!(
            "Creating circuit breaker '{}' with threshold {} and timeout {:?}",
            name, failure_threshold, recovery_timeout
        );

        Self {
            name,
            failure_threshold,
            recovery_timeout,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failure_count: 0,
                last_failure: None,
            }),
        }
    }

    /// Wraps a backend call. Rejects fast while open, admits exactly one
    /// trial while half-open, and updates failure bookkeeping before
    /// re-raising the callee's failure.
    pub async fn call<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        self.try_acquire()?;

        let result = operation().await;

        match result {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(error) => {
                self.on_failure();
                Err(error)
            }
        }
    }

    /// Checks whether a call may proceed, transitioning open -> half-open
    /// when the recovery timeout has elapsed.
    fn try_acquire(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::HalfOpen => {
                // Trial already in flight; reject until it decides.
                debug!(
                    "Circuit breaker '{}' is half-open with trial in flight, rejecting call",
                    self.name
                );
                Err(Error::CircuitOpen {
                    backend: self.name.clone(),
                })
            }
            BreakerState::Open { opened_at } => {
                if opened_at.elapsed() < self.recovery_timeout {
                    debug!("Circuit breaker '{}' is open, rejecting call", self.name);
                    return Err(Error::CircuitOpen {
                        backend: self.name.clone(),
                    });
                }
                inner.state = BreakerState::HalfOpen;
                inner.failure_count = 0;
                info!(
                    "Circuit breaker '{}' transitioning to half-open for trial call",
                    self.name
                );
                Ok(())
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Closed;
                inner.failure_count = 0;
                info!("Circuit breaker '{}' recovered, transitioning to closed", self.name);
            }
            BreakerState::Closed => {
                if inner.failure_count > 0 {
                    debug!(
                        "Circuit breaker '{}' reset failure count from {}",
                        self.name, inner.failure_count
                    );
                }
                inner.failure_count = 0;
            }
            BreakerState::Open { .. } => {
                inner.state = BreakerState::Closed;
                inner.failure_count = 0;
                warn!(
                    "Circuit breaker '{}' was open during success, forcing to closed",
                    self.name
                );
            }
        }
    }

    fn on_failure(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count += 1;
        inner.last_failure = Some(Instant::now());
        debug!(
            "Circuit breaker '{}' failure count: {}/{}",
            self.name, inner.failure_count, self.failure_threshold
        );

        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open {
                    opened_at: Instant::now(),
                };
                warn!("Circuit breaker '{}' re-opened during half-open trial", self.name);
            }
            BreakerState::Closed => {
                if inner.failure_count >= self.failure_threshold {
                    inner.state = BreakerState::Open {
                        opened_at: Instant::now(),
                    };
                    warn!(
                        "Circuit breaker '{}' opened after {} consecutive failures",
                        self.name, inner.failure_count
                    );
                }
            }
            BreakerState::Open { .. } => {
                inner.state = BreakerState::Open {
                    opened_at: Instant::now(),
                };
            }
        }
    }

    pub fn state(&self) -> BreakerStateKind {
        match self.inner.lock().state {
            BreakerState::Closed => BreakerStateKind::Closed,
            BreakerState::Open { .. } => BreakerStateKind::Open,
            BreakerState::HalfOpen => BreakerStateKind::HalfOpen,
        }
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    pub fn is_open(&self) -> bool {
        self.state() == BreakerStateKind::Open
    }

    pub fn is_closed(&self) -> bool {
        self.state() == BreakerStateKind::Closed
    }

    pub fn is_half_open(&self) -> bool {
        self.state() == BreakerStateKind::HalfOpen
    }

    /// True when a new call would be rejected right now, without consuming
    /// the half-open trial slot.
    pub fn would_reject(&self) -> bool {
        let inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => false,
            BreakerState::HalfOpen => true,
            BreakerState::Open { opened_at } => opened_at.elapsed() < self.recovery_timeout,
        }
    }

    pub fn force_open(&self) {
        let mut inner = self.inner.lock();
        inner.state = BreakerState::Open {
            opened_at: Instant::now(),
        };
        warn!("Circuit breaker '{}' manually opened", self.name);
    }

    pub fn force_close(&self) {
        let mut inner = self.inner.lock();
        inner.state = BreakerState::Closed;
        inner.failure_count = 0;
        info!("Circuit breaker '{}' manually closed and reset", self.name);
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        let state = match inner.state {
            BreakerState::Closed => BreakerStateKind::Closed,
            BreakerState::Open { .. } => BreakerStateKind::Open,
            BreakerState::HalfOpen => BreakerStateKind::HalfOpen,
        };

        BreakerSnapshot {
            name: self.name.clone(),
            state,
            failure_count: inner.failure_count,
            failure_threshold: self.failure_threshold,
            recovery_timeout: self.recovery_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::time::{sleep, Duration};

    #[tokio::test]
    async fn test_closed_to_open_at_threshold() {
        let cb = CircuitBreaker::new("test", 3, Duration::from_millis(100));

        assert!(cb.is_closed());

        for i in 0..3 {
            let result = cb
                .call(|| async { Err::<(), _>(Error::backend("connection refused")) })
                .await;
            assert!(result.is_err());

            if i < 2 {
                assert!(cb.is_closed());
            } else {
                assert!(cb.is_open());
            }
        }

        assert!(cb.is_open());
        assert_eq!(cb.failure_count(), 3);
    }

    #[tokio::test]
    async fn test_open_rejects_without_invoking_callee() {
        let cb = CircuitBreaker::new("test", 1, Duration::from_secs(60));

        let _ = cb
            .call(|| async { Err::<(), _>(Error::backend("boom")) })
            .await;
        assert!(cb.is_open());

        let mut invoked = false;
        let result = cb
            .call(|| {
                invoked = true;
                async { Ok::<(), Error>(()) }
            })
            .await;

        assert!(matches!(result, Err(Error::CircuitOpen { .. })));
        assert!(!invoked);
    }

    #[tokio::test]
    async fn test_recovery_closes_on_trial_success() {
        let cb = CircuitBreaker::new("test", 2, Duration::from_millis(50));

        for _ in 0..2 {
            let _ = cb
                .call(|| async { Err::<(), _>(Error::backend("boom")) })
                .await;
        }
        assert!(cb.is_open());

        sleep(Duration::from_millis(60)).await;

        let result = cb.call(|| async { Ok::<(), Error>(()) }).await;
        assert!(result.is_ok());
        assert!(cb.is_closed());
        assert_eq!(cb.failure_count(), 0);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let cb = CircuitBreaker::new("test", 1, Duration::from_millis(50));

        let _ = cb
            .call(|| async { Err::<(), _>(Error::backend("boom")) })
            .await;
        assert!(cb.is_open());

        sleep(Duration::from_millis(60)).await;

        let result = cb
            .call(|| async { Err::<(), _>(Error::backend("still broken")) })
            .await;
        assert!(result.is_err());
        assert!(cb.is_open());
    }

    #[tokio::test]
    async fn test_half_open_admits_exactly_one_trial() {
        let cb = Arc::new(CircuitBreaker::new("test", 1, Duration::from_millis(10)));

        let _ = cb
            .call(|| async { Err::<(), _>(Error::backend("boom")) })
            .await;
        sleep(Duration::from_millis(20)).await;

        // First caller takes the trial slot and parks inside the callee.
        let trial_cb = cb.clone();
        let trial = tokio::spawn(async move {
            trial_cb
                .call(|| async {
                    sleep(Duration::from_millis(100)).await;
                    Ok::<(), Error>(())
                })
                .await
        });

        sleep(Duration::from_millis(20)).await;
        assert!(cb.is_half_open());

        // A second caller racing the trial is rejected as open.
        let result = cb.call(|| async { Ok::<(), Error>(()) }).await;
        assert!(matches!(result, Err(Error::CircuitOpen { .. })));

        assert!(trial.await.unwrap().is_ok());
        assert!(cb.is_closed());
    }

    #[tokio::test]
    async fn test_force_open_and_close() {
        let cb = CircuitBreaker::new("test", 5, Duration::from_secs(60));

        cb.force_open();
        assert!(cb.is_open());

        cb.force_close();
        assert!(cb.is_closed());
        assert_eq!(cb.failure_count(), 0);
    }

    #[tokio::test]
    async fn test_snapshot() {
        let cb = CircuitBreaker::new("p1", 5, Duration::from_secs(30));
        let _ = cb
            .call(|| async { Err::<(), _>(Error::backend("boom")) })
            .await;

        let snap = cb.snapshot();
        assert_eq!(snap.name, "p1");
        assert_eq!(snap.state, BreakerStateKind::Closed);
        assert_eq!(snap.failure_count, 1);
        assert_eq!(snap.failure_threshold, 5);
    }
}
