//! Circuit breakers around unreliable downstream calls.
//!
//! A breaker tracks call outcomes in a rolling time window. Once at least
//! `volume_threshold` calls have been seen and the failure percentage reaches
//! `error_threshold_pct`, it opens and fails fast with [`AppError::CircuitOpen`]
//! without invoking the call. After `reset_timeout` exactly one probe is let
//! through: success closes the breaker, failure reopens it.
//!
//! Only timeouts and transient downstream errors count as failures. A permanent
//! rejection means the dependency answered, so it counts as a success.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use herald_common::config::BreakerSettings;
use herald_common::error::AppError;

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls pass through.
    Closed,
    /// Calls fail fast.
    Open,
    /// One probe call is allowed through.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Permit {
    Normal,
    Probe,
}

struct Inner {
    state: CircuitState,
    /// (finished_at, succeeded) for calls inside the rolling window
    outcomes: VecDeque<(Instant, bool)>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl Inner {
    fn prune(&mut self, now: Instant, window: std::time::Duration) {
        while let Some((at, _)) = self.outcomes.front() {
            if now.duration_since(*at) > window {
                self.outcomes.pop_front();
            } else {
                break;
            }
        }
    }

    fn transition(&mut self, to: CircuitState, now: Instant) {
        self.state = to;
        match to {
            CircuitState::Open => {
                self.opened_at = Some(now);
                self.probe_in_flight = false;
            }
            CircuitState::Closed => {
                self.opened_at = None;
                self.probe_in_flight = false;
                self.outcomes.clear();
            }
            CircuitState::HalfOpen => self.probe_in_flight = false,
        }
    }
}

/// A single named circuit breaker.
pub struct CircuitBreaker {
    name: String,
    settings: BreakerSettings,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, settings: BreakerSettings) -> Self {
        Self {
            name: name.into(),
            settings,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                outcomes: VecDeque::new(),
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, applying the open → half-open transition if it is due.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.check_reset(&mut inner, Instant::now());
        inner.state
    }

    /// Run `call` under this breaker's policy and timeout.
    pub async fn call<T, F, Fut>(&self, call: F) -> Result<T, AppError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let permit = self.acquire()?;
        let mut guard = ProbeGuard {
            breaker: self,
            armed: permit == Permit::Probe,
        };

        let result = match tokio::time::timeout(self.settings.timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(AppError::DownstreamTimeout(format!(
                "{} timed out after {}ms",
                self.name,
                self.settings.timeout.as_millis()
            ))),
        };

        guard.armed = false;
        let failed = matches!(&result, Err(e) if e.trips_breaker());
        self.record(permit, !failed);
        result
    }

    fn check_reset(&self, inner: &mut Inner, now: Instant) {
        if inner.state == CircuitState::Open
            && let Some(opened_at) = inner.opened_at
            && now.duration_since(opened_at) >= self.settings.reset_timeout
        {
            inner.transition(CircuitState::HalfOpen, now);
            info!(breaker = %self.name, "Circuit breaker half-open");
        }
    }

    fn acquire(&self) -> Result<Permit, AppError> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        self.check_reset(&mut inner, now);

        match inner.state {
            CircuitState::Closed => Ok(Permit::Normal),
            CircuitState::HalfOpen if !inner.probe_in_flight => {
                inner.probe_in_flight = true;
                Ok(Permit::Probe)
            }
            CircuitState::HalfOpen | CircuitState::Open => Err(AppError::CircuitOpen(format!(
                "breaker '{}' is open",
                self.name
            ))),
        }
    }

    fn record(&self, permit: Permit, success: bool) {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        match permit {
            Permit::Probe => {
                if success {
                    inner.transition(CircuitState::Closed, now);
                    info!(breaker = %self.name, "Circuit breaker closed");
                } else {
                    inner.transition(CircuitState::Open, now);
                    warn!(breaker = %self.name, "Circuit breaker probe failed, reopened");
                }
            }
            Permit::Normal => {
                // A call that started while closed may finish after the breaker opened.
                if inner.state != CircuitState::Closed {
                    return;
                }
                inner.outcomes.push_back((now, success));
                inner.prune(now, self.settings.rolling_window);
                if success {
                    return;
                }

                let total = inner.outcomes.len() as u32;
                let failures = inner.outcomes.iter().filter(|(_, ok)| !ok).count() as u32;
                if total >= self.settings.volume_threshold.max(1)
                    && failures * 100 >= self.settings.error_threshold_pct * total
                {
                    inner.transition(CircuitState::Open, now);
                    warn!(
                        breaker = %self.name,
                        failures,
                        calls = total,
                        threshold_pct = self.settings.error_threshold_pct,
                        "Circuit breaker opened"
                    );
                }
            }
        }
    }
}

/// Hands the probe slot back if the caller is dropped before its call finishes.
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut inner = self.breaker.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.probe_in_flight = false;
            warn!(breaker = %self.breaker.name, "Circuit breaker probe abandoned");
        }
    }
}

/// Process-local set of breakers, one per downstream dependency.
pub struct BreakerRegistry {
    settings: BreakerSettings,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Get or create the breaker named `name`.
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        {
            let breakers = self.breakers.read();
            if let Some(breaker) = breakers.get(name) {
                return breaker.clone();
            }
        }

        let mut breakers = self.breakers.write();
        breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.settings.clone())))
            .clone()
    }

    /// Run `call` through the breaker named `name`.
    pub async fn fire<T, F, Fut>(&self, name: &str, call: F) -> Result<T, AppError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        self.get(name).call(call).await
    }

    pub fn state(&self, name: &str) -> CircuitState {
        self.get(name).state()
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerSettings::default())
    }
}
