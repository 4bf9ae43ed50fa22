//! Circuit breaker for external service calls
//!
//! One breaker per dependency name, created lazily by the [`BreakerRegistry`].
//! When a dependency fails repeatedly the circuit opens and calls fail fast
//! instead of piling up behind timeouts.
//!
//! # State machine
//!
//! ```text
//! Closed ──(failure_threshold failures)──► Open
//!   ▲                                        │
//!   └──(success_threshold successes)──── HalfOpen ◄─(cooldown elapsed)──┘
//! ```
//!
//! All transitions happen in [`CircuitBreaker::transition`], under the
//! breaker's own mutex. The mutex is never held across the wrapped call,
//! and every acquisition is bounded: a lock wait that expires surfaces as
//! [`Error::BreakerUnavailable`] rather than a hang.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

use crate::{Error, Result};

/// Observable state of a circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, calls are allowed
    Closed,
    /// Failing, calls are rejected without attempting the operation
    Open,
    /// Testing recovery, trial calls are allowed
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

/// Configuration for a [`CircuitBreaker`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,
    /// Consecutive half-open successes before the circuit closes
    pub success_threshold: u32,
    /// How long the circuit stays open before the next call may probe
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Bounded wait for the breaker's state lock
    #[serde(with = "humantime_serde")]
    pub lock_wait: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(60),
            lock_wait: Duration::from_secs(2),
        }
    }
}

/// Read-only view of a breaker's state for health reporting
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    /// Dependency the breaker guards
    pub service_name: String,
    /// Current state
    pub state: CircuitState,
    /// Consecutive failures recorded in the current state
    pub failure_count: u32,
    /// Consecutive half-open successes
    pub success_count: u32,
    /// Seconds since the last recorded failure, if any
    pub seconds_since_last_failure: Option<f64>,
    /// Seconds the breaker has been in its current state
    pub seconds_in_state: f64,
    /// Seconds until an open circuit admits a probe, if open
    pub seconds_until_retry: Option<f64>,
}

/// Mutable state guarded by the breaker's mutex
#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<Instant>,
    last_state_change: Instant,
    next_retry_time: Option<Instant>,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
            last_state_change: Instant::now(),
            next_retry_time: None,
        }
    }
}

/// Per-dependency circuit breaker.
///
/// Cheaply cloneable; all clones share state through `Arc`.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    config: BreakerConfig,
    inner: Arc<Mutex<BreakerInner>>,
}

impl CircuitBreaker {
    /// Create a breaker in the closed state
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: Arc::from(name.into().as_str()),
            config,
            inner: Arc::new(Mutex::new(BreakerInner::new())),
        }
    }

    /// The dependency name this breaker guards
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `op` through the breaker.
    ///
    /// Admission is evaluated under the state lock; a rejected call returns
    /// [`Error::BreakerOpen`] without invoking `op`. The operation itself
    /// runs with the lock released, and the outcome is recorded under a
    /// fresh bounded lock acquisition afterwards.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        {
            let mut inner = self.lock_bounded().await?;
            if !self.admit(&mut inner) {
                let retry_in = inner
                    .next_retry_time
                    .map(|t| t.saturating_duration_since(Instant::now()))
                    .unwrap_or(self.config.timeout);
                return Err(Error::BreakerOpen {
                    service: self.name.to_string(),
                    retry_in,
                });
            }
        }

        let result = op().await;

        let mut inner = self.lock_bounded().await?;
        match &result {
            Ok(_) => self.on_success(&mut inner),
            Err(_) => self.on_failure(&mut inner),
        }
        result
    }

    /// Current state snapshot for health reporting
    pub async fn snapshot(&self) -> Result<BreakerSnapshot> {
        let inner = self.lock_bounded().await?;
        let now = Instant::now();
        Ok(BreakerSnapshot {
            service_name: self.name.to_string(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            seconds_since_last_failure: inner
                .last_failure_time
                .map(|t| now.saturating_duration_since(t).as_secs_f64()),
            seconds_in_state: now
                .saturating_duration_since(inner.last_state_change)
                .as_secs_f64(),
            seconds_until_retry: inner
                .next_retry_time
                .filter(|_| inner.state == CircuitState::Open)
                .map(|t| t.saturating_duration_since(now).as_secs_f64()),
        })
    }

    /// Administrative reset to the closed state
    pub async fn reset(&self) -> Result<()> {
        let mut inner = self.lock_bounded().await?;
        if inner.state != CircuitState::Closed {
            info!(breaker = %self.name, "circuit breaker reset to closed");
        }
        self.transition(&mut inner, CircuitState::Closed);
        inner.last_failure_time = None;
        Ok(())
    }

    async fn lock_bounded(&self) -> Result<MutexGuard<'_, BreakerInner>> {
        tokio::time::timeout(self.config.lock_wait, self.inner.lock())
            .await
            .map_err(|_| Error::BreakerUnavailable {
                service: self.name.to_string(),
            })
    }

    /// Decide whether a call may proceed, performing the lazy
    /// open-to-half-open transition when the cooldown has elapsed.
    fn admit(&self, inner: &mut BreakerInner) -> bool {
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let due = inner
                    .next_retry_time
                    .map(|t| Instant::now() >= t)
                    .unwrap_or(true);
                if due {
                    info!(breaker = %self.name, "circuit breaker half-open, admitting probe");
                    self.transition(inner, CircuitState::HalfOpen);
                    true
                } else {
                    false
                }
            }
        }
    }

    fn on_success(&self, inner: &mut BreakerInner) {
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    info!(breaker = %self.name, "circuit breaker closed (recovered)");
                    self.transition(inner, CircuitState::Closed);
                    inner.last_failure_time = None;
                }
            }
            // No call should have been admitted while open.
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self, inner: &mut BreakerInner) {
        inner.last_failure_time = Some(Instant::now());
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    warn!(
                        breaker = %self.name,
                        failures = inner.failure_count,
                        "circuit breaker opened (threshold reached)"
                    );
                    self.transition(inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                warn!(breaker = %self.name, "circuit breaker reopened (probe failed)");
                self.transition(inner, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    /// The single place state changes; counters and timers reset here
    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        inner.state = to;
        inner.last_state_change = Instant::now();
        inner.success_count = 0;
        match to {
            CircuitState::Open => {
                inner.next_retry_time = Some(Instant::now() + self.config.timeout);
            }
            CircuitState::Closed => {
                inner.failure_count = 0;
                inner.next_retry_time = None;
            }
            CircuitState::HalfOpen => {
                inner.next_retry_time = None;
            }
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Lazily populated registry of per-dependency breakers.
///
/// Lives for the process lifetime; breakers are created exactly once per
/// service name under the registry lock and never torn down. State is reset
/// only through the administrative [`CircuitBreaker::reset`].
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

static GLOBAL_REGISTRY: LazyLock<Arc<BreakerRegistry>> =
    LazyLock::new(|| Arc::new(BreakerRegistry::new()));

impl BreakerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry shared by every engine in this process
    pub fn global() -> Arc<BreakerRegistry> {
        Arc::clone(&GLOBAL_REGISTRY)
    }

    /// Get or lazily create the breaker for a service.
    ///
    /// The configuration applies on first creation; later callers share the
    /// existing instance.
    pub async fn breaker(&self, service: &str, config: &BreakerConfig) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().await;
        Arc::clone(
            breakers
                .entry(service.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(service, config.clone()))),
        )
    }

    /// Snapshot every registered breaker
    pub async fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let breakers = self.breakers.lock().await;
        let mut out = Vec::with_capacity(breakers.len());
        for breaker in breakers.values() {
            if let Ok(snapshot) = breaker.snapshot().await {
                out.push(snapshot);
            }
        }
        out.sort_by(|a, b| a.service_name.cmp(&b.service_name));
        out
    }

    /// Reset one breaker to closed; returns false when it does not exist
    pub async fn reset(&self, service: &str) -> Result<bool> {
        let breaker = {
            let breakers = self.breakers.lock().await;
            breakers.get(service).cloned()
        };
        match breaker {
            Some(breaker) => {
                breaker.reset().await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
