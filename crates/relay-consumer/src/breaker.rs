//! Two-step circuit breaker
//!
//! The breaker gates a poll cycle in two steps: [`CircuitBreaker::admit`]
//! decides whether work may start, and every gated operation later resolves
//! its [`OutcomeReporter`] with success or failure.
//!
//! # State Machine
//!
//! ```text
//! ┌─────────┐  consecutive failures  ┌─────────┐  open duration  ┌──────────┐
//! │ Closed  │ ─────────────────────► │  Open   │ ──────────────► │ HalfOpen │
//! └─────────┘      >= threshold      └─────────┘                 └──────────┘
//!      ▲                                  ▲      probe failure         │
//!      │                                  └────────────────────────────┤
//!      │                probe success                                  │
//!      └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! Half-open admits a single probe. While the probe is in flight every other
//! admission is rejected with [`CircuitBreakerError::ProbeInFlight`].
//!
//! Each state change starts a new generation; outcomes reported for an older
//! generation are ignored, so a slow success from before the breaker opened
//! cannot close it again.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::duration_millis;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - all cycles admitted
    Closed,

    /// Failure threshold reached - all cycles rejected
    Open,

    /// Testing recovery - a single probe admitted
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures required to open the circuit
    pub failure_threshold: u32,

    /// Time to wait before moving from open to half-open
    #[serde(with = "duration_millis")]
    pub open_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(10),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_open_duration(mut self, duration: Duration) -> Self {
        self.open_duration = duration;
        self
    }
}

/// Why an admission was refused
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum CircuitBreakerError {
    /// Circuit is open, nothing may run
    #[error("circuit breaker is open")]
    Open,

    /// Circuit is half-open and its single probe is already running
    #[error("circuit breaker half-open, probe already in flight")]
    ProbeInFlight,
}

/// Outcome counters for the current generation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counts {
    pub total_successes: u64,
    pub total_failures: u64,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

impl Counts {
    fn on_success(&mut self) {
        self.total_successes += 1;
        self.consecutive_successes += 1;
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.total_failures += 1;
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    counts: Counts,
    generation: u64,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// In-process circuit breaker shared by every poll cycle of a run
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    transitions: Notify,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                counts: Counts::default(),
                generation: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
            transitions: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Ask whether gated work may start
    pub fn admit(self: &Arc<Self>) -> Result<Admission, CircuitBreakerError> {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, Instant::now());

        match inner.state {
            CircuitState::Closed => Ok(Admission::new(Arc::clone(self), inner.generation, false)),
            CircuitState::Open => Err(CircuitBreakerError::Open),
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    return Err(CircuitBreakerError::ProbeInFlight);
                }
                inner.probe_in_flight = true;
                debug!(breaker = %self.name, "Admitting half-open probe");
                Ok(Admission::new(Arc::clone(self), inner.generation, true))
            }
        }
    }

    /// Current state, applying the open-duration timer
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, Instant::now());
        inner.state
    }

    /// Time left before an open breaker admits a probe; `None` unless open
    pub fn retry_after(&self) -> Option<Duration> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, now);
        if inner.state != CircuitState::Open {
            return None;
        }
        let opened_at = inner.opened_at?;
        Some(
            self.config
                .open_duration
                .saturating_sub(now.saturating_duration_since(opened_at)),
        )
    }

    /// Counters of the current generation
    pub fn counts(&self) -> Counts {
        self.inner.lock().counts
    }

    fn record(&self, generation: u64, success: bool) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, now);

        if inner.generation != generation {
            debug!(
                breaker = %self.name,
                success,
                "Ignoring outcome from a previous breaker generation"
            );
            return;
        }

        match inner.state {
            CircuitState::Closed => {
                if success {
                    inner.counts.on_success();
                } else {
                    inner.counts.on_failure();
                    if inner.counts.consecutive_failures >= self.config.failure_threshold {
                        self.transition(&mut inner, CircuitState::Open, now);
                    }
                }
            }
            CircuitState::HalfOpen => {
                if success {
                    self.transition(&mut inner, CircuitState::Closed, now);
                } else {
                    self.transition(&mut inner, CircuitState::Open, now);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn is_generation(&self, generation: u64) -> bool {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner, Instant::now());
        inner.generation == generation
    }

    fn release_probe(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.generation == generation && inner.state == CircuitState::HalfOpen {
            inner.probe_in_flight = false;
        }
    }

    fn refresh(&self, inner: &mut Inner, now: Instant) {
        if inner.state != CircuitState::Open {
            return;
        }
        let elapsed = inner
            .opened_at
            .map(|at| now.saturating_duration_since(at))
            .unwrap_or(Duration::MAX);
        if elapsed >= self.config.open_duration {
            self.transition(inner, CircuitState::HalfOpen, now);
        }
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState, now: Instant) {
        let from = inner.state;
        if from == to {
            return;
        }

        let failures = inner.counts.consecutive_failures;
        inner.state = to;
        inner.generation += 1;
        inner.counts = Counts::default();
        inner.probe_in_flight = false;
        inner.opened_at = (to == CircuitState::Open).then_some(now);
        self.transitions.notify_waiters();

        match to {
            CircuitState::Open => warn!(
                breaker = %self.name,
                %from,
                consecutive_failures = failures,
                open_for_ms = self.config.open_duration.as_millis() as u64,
                "Circuit breaker opened"
            ),
            _ => info!(breaker = %self.name, %from, %to, "Circuit breaker state changed"),
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("inner", &*self.inner.lock())
            .finish()
    }
}

/// Permission for one poll cycle to start gated work
///
/// A probe admission (half-open) hands out one reporter at most. A probe
/// that never hands one out gives the probe slot back on drop.
pub struct Admission {
    breaker: Arc<CircuitBreaker>,
    generation: u64,
    probe: bool,
    issued: usize,
}

impl Admission {
    fn new(breaker: Arc<CircuitBreaker>, generation: u64, probe: bool) -> Self {
        Self {
            breaker,
            generation,
            probe,
            issued: 0,
        }
    }

    /// Whether this is the single half-open trial
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// Number of reporters handed out so far
    pub fn issued(&self) -> usize {
        self.issued
    }

    /// Whether the breaker is still in the state this admission was granted
    /// under. An admission outlives its generation once the breaker trips.
    pub fn is_current(&self) -> bool {
        self.breaker.is_generation(self.generation)
    }

    /// Resolves once the breaker leaves the state this admission was granted
    /// under
    pub async fn superseded(&self) {
        loop {
            let changed = self.breaker.transitions.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            if !self.is_current() {
                return;
            }
            changed.await;
        }
    }

    /// Reporter for one gated operation, `None` once a probe is used up
    pub fn reporter(&mut self) -> Option<OutcomeReporter> {
        if self.probe && self.issued > 0 {
            return None;
        }
        self.issued += 1;
        Some(OutcomeReporter {
            breaker: Arc::clone(&self.breaker),
            generation: self.generation,
            probe: self.probe,
            resolved: false,
        })
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        if self.probe && self.issued == 0 {
            self.breaker.release_probe(self.generation);
        }
    }
}

/// Report callback for one gated operation
///
/// Resolve exactly once. Dropping it unresolved records a failure.
#[must_use = "an unresolved reporter records a failure when dropped"]
pub struct OutcomeReporter {
    breaker: Arc<CircuitBreaker>,
    generation: u64,
    probe: bool,
    resolved: bool,
}

impl OutcomeReporter {
    pub fn report(mut self, success: bool) {
        self.resolved = true;
        self.breaker.record(self.generation, success);
    }

    /// Resolve without an outcome, e.g. when shutdown interrupted the work
    /// before it started
    pub fn discard(mut self) {
        self.resolved = true;
        if self.probe {
            self.breaker.release_probe(self.generation);
        }
    }
}

impl Drop for OutcomeReporter {
    fn drop(&mut self) {
        if !self.resolved {
            self.breaker.record(self.generation, false);
        }
    }
}
