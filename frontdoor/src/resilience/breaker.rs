use crate::events::{EventBus, SystemEvent};
use chrono::{DateTime, Utc};
use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// A sliding-window budget for one operation class.
#[derive(Clone, Copy, Debug)]
pub struct RateLimit {
    pub max_calls: usize,
    pub window: Duration,
}

impl RateLimit {
    pub fn per_hour(max_calls: usize) -> Self {
        Self { max_calls, window: Duration::from_secs(3600) }
    }
}

#[derive(Clone, Debug)]
pub struct BreakerConfig {
    /// Consecutive failures before the breaker opens.
    pub failure_threshold: u32,

    /// How long the breaker stays open before probing with a half-open call.
    pub reset_timeout: Duration,

    /// Per-operation-class admission budgets, enforced independently of the
    /// state machine.
    pub rate_limits: HashMap<String, RateLimit>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, reset_timeout: Duration::from_secs(60), rate_limits: HashMap::new() }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BreakerError {
    #[error("circuit breaker '{name}' is open, retry in {retry_in:?}")]
    Open { name: String, retry_in: Duration },

    #[error("rate limit for operation class '{class}' exhausted")]
    RateLimited { class: String },
}

#[derive(Debug, thiserror::Error)]
pub enum BreakerCallError<E: std::error::Error + 'static> {
    /// The call was never admitted; does not count toward the failure threshold.
    #[error(transparent)]
    Rejected(#[from] BreakerError),

    #[error(transparent)]
    Inner(E),
}

#[derive(Clone, Debug)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_failure: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<DateTime<Utc>>,
    opened_at: Option<Instant>,
    windows: HashMap<String, VecDeque<Instant>>,
}

/// Three-state circuit breaker with per-operation-class rate limits.
///
/// Admission rejections (`Open`, `RateLimited`) are distinct from wrapped-call
/// failures and never move the state machine.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
    events: Option<EventBus>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        let inner =
            Inner { state: CircuitState::Closed, consecutive_failures: 0, last_failure: None, opened_at: None, windows: HashMap::new() };
        Self { name: name.into(), config, inner: Mutex::new(inner), events: None }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check whether a call may proceed. Moves OPEN to HALF_OPEN once the
    /// reset timeout has elapsed; enforces the class budget afterwards.
    pub fn admit(&self, class: Option<&str>) -> Result<(), BreakerError> {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        if inner.state == CircuitState::Open {
            let elapsed = inner.opened_at.map(|at| at.elapsed()).unwrap_or_default();
            if elapsed >= self.config.reset_timeout {
                self.transition(&mut inner, CircuitState::HalfOpen);
            } else {
                let retry_in = self.config.reset_timeout - elapsed;
                return Err(BreakerError::Open { name: self.name.clone(), retry_in });
            }
        }
        if let Some(class) = class {
            if let Some(limit) = self.config.rate_limits.get(class) {
                let now = Instant::now();
                let window = inner.windows.entry(class.to_string()).or_default();
                while window.front().is_some_and(|at| now.duration_since(*at) > limit.window) {
                    window.pop_front();
                }
                if window.len() >= limit.max_calls {
                    return Err(BreakerError::RateLimited { class: class.to_string() });
                }
                window.push_back(now);
            }
        }
        Ok(())
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.consecutive_failures = 0;
        if inner.state == CircuitState::HalfOpen {
            self.transition(&mut inner, CircuitState::Closed);
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.consecutive_failures += 1;
        inner.last_failure = Some(Utc::now());
        match inner.state {
            CircuitState::Closed if inner.consecutive_failures >= self.config.failure_threshold => {
                warn!("Breaker '{}' opening after {} consecutive failures", self.name, inner.consecutive_failures);
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::HalfOpen => {
                warn!("Breaker '{}' reopening after half-open failure", self.name);
                self.transition(&mut inner, CircuitState::Open);
            }
            _ => {}
        }
    }

    /// Admit, run, and record the outcome of one wrapped call.
    pub async fn call<T, E, Fut>(&self, class: Option<&str>, fut: Fut) -> Result<T, BreakerCallError<E>>
    where
        E: std::error::Error + 'static,
        Fut: Future<Output = Result<T, E>>,
    {
        self.admit(class)?;
        match fut.await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(BreakerCallError::Inner(e))
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().expect("breaker lock poisoned").state
    }

    /// Reset to CLOSED, clearing the failure counter. Used when an external
    /// recovery path has restored the protected resource.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.consecutive_failures = 0;
        if inner.state != CircuitState::Closed {
            self.transition(&mut inner, CircuitState::Closed);
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock().expect("breaker lock poisoned");
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            last_failure: inner.last_failure,
        }
    }

    fn force_half_open(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        if inner.state == CircuitState::Open {
            self.transition(&mut inner, CircuitState::HalfOpen);
        }
    }

    fn transition(&self, inner: &mut Inner, state: CircuitState) {
        debug!("Breaker '{}' transitioning {} -> {state}", self.name, inner.state);
        inner.state = state;
        inner.opened_at = match state {
            CircuitState::Open => Some(Instant::now()),
            _ => None,
        };
        if let Some(events) = &self.events {
            events.emit(SystemEvent::BreakerStateChanged { name: self.name.clone(), state: state.to_string() });
        }
    }
}

/// Periodically run `check` while the breaker is open; a passing check moves
/// it to half-open so the next caller probes the real resource.
pub fn spawn_health_probe<F, Fut>(breaker: Arc<CircuitBreaker>, interval: Duration, check: F)
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = bool> + Send,
{
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            if breaker.state() == CircuitState::Open && check().await {
                info!("Health check passed, moving breaker '{}' to half-open", breaker.name());
                breaker.force_half_open();
            }
        }
    });
}
