//! Process-local circuit breaker around the extraction service.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use crate::ExtractError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BreakerConfig {
    /// Failures within `window` that open the breaker.
    pub failure_threshold: u32,
    pub window: Duration,
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
enum State {
    Closed,
    Open { until: Instant },
    /// One trial call is out. A trial that never reports (its task was dropped) is
    /// considered lost after another cooldown and a new trial is handed out.
    HalfOpen { trial_started: Instant },
}

#[derive(Debug)]
struct Inner {
    state: State,
    failures: VecDeque<Instant>,
}

/// Admission ticket from [`CircuitBreaker::try_acquire`]; report the call's result with
/// [`CircuitBreaker::record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct BreakerPermit {
    pub trial: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: State::Closed,
                failures: VecDeque::new(),
            }),
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // State stays consistent even if a holder panicked; every update is a single assignment.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> BreakerState {
        match self.lock().state {
            State::Closed => BreakerState::Closed,
            State::Open { .. } => BreakerState::Open,
            State::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }

    pub fn try_acquire(&self) -> Result<BreakerPermit, ExtractError> {
        let mut inner = self.lock();
        let now = Instant::now();
        match inner.state {
            State::Closed => Ok(BreakerPermit { trial: false }),
            State::Open { until } if now >= until => {
                inner.state = State::HalfOpen { trial_started: now };
                info!("circuit breaker half-open, admitting trial call");
                Ok(BreakerPermit { trial: true })
            }
            State::Open { until } => Err(ExtractError::BreakerOpen(until - now)),
            State::HalfOpen { trial_started } => {
                let lost_after = trial_started + self.config.cooldown;
                if now >= lost_after {
                    inner.state = State::HalfOpen { trial_started: now };
                    warn!("previous trial call never reported, admitting a new one");
                    Ok(BreakerPermit { trial: true })
                } else {
                    Err(ExtractError::BreakerOpen(lost_after - now))
                }
            }
        }
    }

    /// Report a call admitted by `permit`. `healthy` is false for failures that indicate
    /// the service is down.
    pub fn record(&self, permit: BreakerPermit, healthy: bool) {
        let mut inner = self.lock();
        let now = Instant::now();
        match (inner.state, permit.trial) {
            (State::HalfOpen { .. }, true) => {
                inner.failures.clear();
                if healthy {
                    inner.state = State::Closed;
                    info!("circuit breaker closed after successful trial");
                } else {
                    inner.state = State::Open {
                        until: now + self.config.cooldown,
                    };
                    warn!(cooldown_secs = self.config.cooldown.as_secs(), "trial call failed, circuit breaker reopened");
                }
            }
            (State::Closed, _) if healthy => inner.failures.clear(),
            (State::Closed, _) => {
                inner.failures.push_back(now);
                while let Some(&oldest) = inner.failures.front() {
                    if now.duration_since(oldest) > self.config.window {
                        inner.failures.pop_front();
                    } else {
                        break;
                    }
                }
                let failures = inner.failures.len() as u32;
                if failures >= self.config.failure_threshold {
                    inner.failures.clear();
                    inner.state = State::Open {
                        until: now + self.config.cooldown,
                    };
                    warn!(failures, cooldown_secs = self.config.cooldown.as_secs(), "circuit breaker opened");
                }
            }
            // Late results from calls admitted before the breaker tripped.
            _ => {}
        }
    }

    /// Run `f` if the breaker admits it, classifying the outcome with
    /// [`ExtractError::trips_breaker`].
    pub async fn call<T, F, Fut>(&self, f: F) -> Result<T, ExtractError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ExtractError>>,
    {
        let permit = self.try_acquire()?;
        let result = f().await;
        let healthy = match &result {
            Ok(_) => true,
            Err(err) => !err.trips_breaker(),
        };
        self.record(permit, healthy);
        result
    }
}
