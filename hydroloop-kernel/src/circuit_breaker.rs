/**
 * CIRCUIT BREAKER - Garde trois états autour d'un appel asynchrone
 *
 * RÔLE :
 * Protège la gateway des commandes contre les tempêtes de retries : après
 * `failure_threshold` échecs le circuit s'ouvre, puis teste la reprise avec
 * un nombre borné d'appels sonde.
 *
 * ÉTATS :
 * CLOSED ──[failure_count ≥ threshold]──▶ OPEN ──[timeout écoulé]──▶ HALF_OPEN
 *   ▲                                       ▲                          │
 *   │                                       └────[un échec sonde]──────┤
 *   └──────────[half_open_max_calls succès consécutifs]────────────────┘
 *
 * Les compteurs ne sont modifiés que depuis `call()` ; le verrou n'est
 * jamais tenu pendant l'appel protégé.
 */

use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Snapshot exposé pour le health et les tests
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerState {
    pub name: String,
    pub state: BreakerState,
    pub failure_count: u32,
    pub success_count: u32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_failure_time: Option<OffsetDateTime>,
    pub half_open_call_count: u32,
}

#[derive(Debug, Clone)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub timeout: Duration,
    pub half_open_max_calls: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(30),
            half_open_max_calls: 3,
        }
    }
}

impl From<&crate::config::BreakerConf> for BreakerSettings {
    fn from(conf: &crate::config::BreakerConf) -> Self {
        Self {
            failure_threshold: conf.failure_threshold,
            timeout: Duration::from_secs_f64(conf.timeout_secs.max(0.0)),
            half_open_max_calls: conf.half_open_max_calls,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    #[error("circuit breaker '{name}' is open")]
    Open { name: String },
    #[error(transparent)]
    Inner(E),
}

struct Counters {
    state: BreakerState,
    failure_count: u32,
    success_count: u32,
    half_open_call_count: u32,
    last_failure_at: Option<Instant>,
    last_failure_time: Option<OffsetDateTime>,
}

pub struct CircuitBreaker {
    name: String,
    settings: BreakerSettings,
    counters: Mutex<Counters>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, settings: BreakerSettings) -> Self {
        Self {
            name: name.into(),
            settings,
            counters: Mutex::new(Counters {
                state: BreakerState::Closed,
                failure_count: 0,
                success_count: 0,
                half_open_call_count: 0,
                last_failure_at: None,
                last_failure_time: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> BreakerState {
        self.counters.lock().state
    }

    pub fn snapshot(&self) -> CircuitBreakerState {
        let c = self.counters.lock();
        CircuitBreakerState {
            name: self.name.clone(),
            state: c.state,
            failure_count: c.failure_count,
            success_count: c.success_count,
            last_failure_time: c.last_failure_time,
            half_open_call_count: c.half_open_call_count,
        }
    }

    /// Force le retour à CLOSED (intervention opérateur)
    pub fn reset(&self) {
        let mut c = self.counters.lock();
        c.state = BreakerState::Closed;
        c.failure_count = 0;
        c.success_count = 0;
        c.half_open_call_count = 0;
        tracing::info!(breaker = %self.name, "circuit breaker reset");
    }

    /// Exécute `f` sous la protection du breaker.
    ///
    /// Quand le circuit est ouvert (ou que les sondes HALF_OPEN sont épuisées)
    /// `f` n'est pas appelé et `BreakerError::Open` est renvoyé.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.admit::<E>()?;
        match f().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(e) => {
                self.on_failure();
                Err(BreakerError::Inner(e))
            }
        }
    }

    fn admit<E>(&self) -> Result<(), BreakerError<E>> {
        let mut c = self.counters.lock();

        if c.state == BreakerState::Open {
            let elapsed_enough = c
                .last_failure_at
                .map(|at| at.elapsed() >= self.settings.timeout)
                .unwrap_or(true);
            if !elapsed_enough {
                return Err(self.open_error());
            }
            c.state = BreakerState::HalfOpen;
            c.half_open_call_count = 0;
            c.success_count = 0;
            tracing::info!(breaker = %self.name, "circuit breaker half-open, probing");
        }

        if c.state == BreakerState::HalfOpen {
            if c.half_open_call_count >= self.settings.half_open_max_calls.max(1) {
                return Err(self.open_error());
            }
            c.half_open_call_count += 1;
        }
        Ok(())
    }

    fn on_success(&self) {
        let mut c = self.counters.lock();
        match c.state {
            BreakerState::Closed => {
                c.failure_count = c.failure_count.saturating_sub(1);
            }
            BreakerState::HalfOpen => {
                c.success_count += 1;
                if c.success_count >= self.settings.half_open_max_calls.max(1) {
                    c.state = BreakerState::Closed;
                    c.failure_count = 0;
                    c.success_count = 0;
                    c.half_open_call_count = 0;
                    tracing::info!(breaker = %self.name, "circuit breaker closed");
                }
            }
            // call admitted before another one opened the circuit
            BreakerState::Open => {}
        }
    }

    fn on_failure(&self) {
        let mut c = self.counters.lock();
        c.last_failure_at = Some(Instant::now());
        c.last_failure_time = Some(OffsetDateTime::now_utc());
        c.failure_count = c.failure_count.saturating_add(1);

        match c.state {
            BreakerState::Closed => {
                if c.failure_count >= self.settings.failure_threshold.max(1) {
                    c.state = BreakerState::Open;
                    tracing::warn!(
                        breaker = %self.name,
                        failures = c.failure_count,
                        "circuit breaker opened"
                    );
                }
            }
            BreakerState::HalfOpen => {
                c.state = BreakerState::Open;
                c.success_count = 0;
                c.half_open_call_count = 0;
                tracing::warn!(breaker = %self.name, "probe failed, circuit breaker reopened");
            }
            BreakerState::Open => {}
        }
    }

    fn open_error<E>(&self) -> BreakerError<E> {
        BreakerError::Open { name: self.name.clone() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeliveryError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker(threshold: u32, timeout_secs: u64, probes: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "gateway",
            BreakerSettings {
                failure_threshold: threshold,
                timeout: Duration::from_secs(timeout_secs),
                half_open_max_calls: probes,
            },
        )
    }

    async fn fail(b: &CircuitBreaker) -> Result<(), BreakerError<DeliveryError>> {
        b.call(|| async { Err::<(), _>(DeliveryError::Transport("down".into())) }).await
    }

    async fn succeed(b: &CircuitBreaker) -> Result<u32, BreakerError<DeliveryError>> {
        b.call(|| async { Ok::<_, DeliveryError>(7) }).await
    }

    #[tokio::test]
    async fn opens_after_exactly_threshold_failures() {
        let b = breaker(3, 30, 2);
        for _ in 0..2 {
            assert!(matches!(fail(&b).await, Err(BreakerError::Inner(_))));
            assert_eq!(b.state(), BreakerState::Closed);
        }
        assert!(matches!(fail(&b).await, Err(BreakerError::Inner(_))));
        assert_eq!(b.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn open_circuit_does_not_invoke_call() {
        let b = breaker(1, 30, 1);
        let _ = fail(&b).await;

        let calls = AtomicU32::new(0);
        let res = b
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, DeliveryError>(())
            })
            .await;
        assert!(matches!(res, Err(BreakerError::Open { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn success_decays_failure_count() {
        let b = breaker(3, 30, 1);
        let _ = fail(&b).await;
        let _ = fail(&b).await;
        assert_eq!(b.snapshot().failure_count, 2);
        succeed(&b).await.unwrap();
        assert_eq!(b.snapshot().failure_count, 1);
        let _ = fail(&b).await;
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_through_half_open_after_consecutive_successes() {
        let b = breaker(2, 10, 2);
        let _ = fail(&b).await;
        let _ = fail(&b).await;
        assert_eq!(b.state(), BreakerState::Open);

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(matches!(succeed(&b).await, Err(BreakerError::Open { .. })));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(succeed(&b).await.unwrap(), 7);
        assert_eq!(b.state(), BreakerState::HalfOpen);
        assert_eq!(b.snapshot().half_open_call_count, 1);

        succeed(&b).await.unwrap();
        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.snapshot().failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens() {
        let b = breaker(1, 5, 3);
        let _ = fail(&b).await;
        tokio::time::advance(Duration::from_secs(5)).await;

        succeed(&b).await.unwrap();
        assert_eq!(b.state(), BreakerState::HalfOpen);
        let _ = fail(&b).await;
        assert_eq!(b.state(), BreakerState::Open);

        // the reopen restarts the timeout
        assert!(matches!(succeed(&b).await, Err(BreakerError::Open { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_limits_probe_calls() {
        let b = std::sync::Arc::new(breaker(1, 5, 1));
        let _ = fail(&b).await;
        tokio::time::advance(Duration::from_secs(5)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let probe = {
            let b = b.clone();
            tokio::spawn(async move {
                b.call(|| async move {
                    let _ = release_rx.await;
                    Ok::<_, DeliveryError>(())
                })
                .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(b.state(), BreakerState::HalfOpen);

        // second probe is refused while the first one is in flight
        assert!(matches!(succeed(&b).await, Err(BreakerError::Open { .. })));

        release_tx.send(()).unwrap();
        probe.await.unwrap().unwrap();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn reset_closes_circuit() {
        let b = breaker(1, 300, 1);
        let _ = fail(&b).await;
        assert_eq!(b.state(), BreakerState::Open);
        b.reset();
        assert_eq!(succeed(&b).await.unwrap(), 7);
    }
}
