/*!
 * # Circuit Breaker
 *
 * Guards outbound calls to the payment gateway. After `failure_threshold` consecutive
 * tripping failures the breaker opens and calls fail fast for `cooldown`. The first
 * call after the cooldown is a trial; `trial_successes` clean trials close it again,
 * a single failed trial reopens it.
 */

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Closed { failures: u32 },
    Open { reopens_at: Instant },
    Trial { successes: u32 },
}

impl Phase {
    fn state(self) -> CircuitState {
        match self {
            Phase::Closed { .. } => CircuitState::Closed,
            Phase::Open { .. } => CircuitState::Open,
            Phase::Trial { .. } => CircuitState::HalfOpen,
        }
    }
}

#[derive(Error, Debug)]
pub enum CircuitBreakerError<E> {
    #[error("circuit breaker is open")]
    CircuitOpen,
    #[error("{0}")]
    Inner(E),
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    trial_successes: u32,
    phase: Arc<Mutex<Phase>>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration, trial_successes: u32) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            cooldown,
            trial_successes: trial_successes.max(1),
            phase: Arc::new(Mutex::new(Phase::Closed { failures: 0 })),
        }
    }

    /// Runs `f` under breaker protection. Only errors for which `trips` returns true
    /// count as failures; other errors pass through without touching the phase.
    pub async fn call<F, Fut, R, E, P>(&self, f: F, trips: P) -> Result<R, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<R, E>>,
        P: Fn(&E) -> bool,
    {
        if !self.admit() {
            metrics::counter!("circuit_breaker_rejections_total", 1);
            return Err(CircuitBreakerError::CircuitOpen);
        }

        match f().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                if trips(&err) {
                    self.record_failure();
                }
                Err(CircuitBreakerError::Inner(err))
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        self.phase().state()
    }

    fn phase(&self) -> MutexGuard<'_, Phase> {
        match self.phase.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn admit(&self) -> bool {
        let mut phase = self.phase();
        match *phase {
            Phase::Open { reopens_at } if Instant::now() >= reopens_at => {
                *phase = Phase::Trial { successes: 0 };
                true
            }
            Phase::Open { .. } => false,
            _ => true,
        }
    }

    fn record_success(&self) {
        let mut phase = self.phase();
        *phase = match *phase {
            Phase::Trial { successes } if successes + 1 < self.trial_successes => Phase::Trial {
                successes: successes + 1,
            },
            _ => Phase::Closed { failures: 0 },
        };
    }

    fn record_failure(&self) {
        let mut phase = self.phase();
        let reopen = Phase::Open {
            reopens_at: Instant::now() + self.cooldown,
        };
        *phase = match *phase {
            Phase::Closed { failures } if failures + 1 >= self.failure_threshold => {
                tracing::warn!(failures = failures + 1, "payment gateway circuit opened");
                reopen
            }
            Phase::Closed { failures } => Phase::Closed {
                failures: failures + 1,
            },
            Phase::Trial { .. } => {
                tracing::warn!("payment gateway trial call failed, circuit reopened");
                reopen
            }
            open @ Phase::Open { .. } => open,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn always(_: &&str) -> bool {
        true
    }

    #[tokio::test]
    async fn success_keeps_circuit_closed() {
        let breaker = CircuitBreaker::new(3, Duration::from_millis(100), 1);
        let result = breaker.call(|| async { Ok::<i32, &str>(42) }, always).await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn consecutive_failures_open_and_fail_fast() {
        let breaker = CircuitBreaker::new(2, Duration::from_secs(60), 1);
        let _ = breaker.call(|| async { Err::<i32, &str>("reset") }, always).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
        let _ = breaker.call(|| async { Err::<i32, &str>("reset") }, always).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        let result = breaker.call(|| async { Ok::<i32, &str>(1) }, always).await;
        assert!(matches!(result, Err(CircuitBreakerError::CircuitOpen)));
    }

    #[tokio::test]
    async fn success_between_failures_resets_count() {
        let breaker = CircuitBreaker::new(2, Duration::from_secs(60), 1);
        let _ = breaker.call(|| async { Err::<i32, &str>("reset") }, always).await;
        let _ = breaker.call(|| async { Ok::<i32, &str>(1) }, always).await;
        let _ = breaker.call(|| async { Err::<i32, &str>("reset") }, always).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn declines_do_not_trip() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(60), 1);
        let _ = breaker
            .call(|| async { Err::<i32, &str>("declined") }, |_| false)
            .await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn trial_after_cooldown_closes_or_reopens() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(20), 1);
        let _ = breaker.call(|| async { Err::<i32, &str>("reset") }, always).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let _ = breaker.call(|| async { Err::<i32, &str>("reset") }, always).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let result = breaker.call(|| async { Ok::<i32, &str>(7) }, always).await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
