//! Worker loop
//!
//! A [`Worker`] consumes one topic. [`Worker::run_until`] drives poll cycles
//! until its shutdown future resolves, then wraps up: no new pulls, a grace
//! window for in-flight invocations, cancellation, and a bounded drain.
//!
//! ```text
//!   Idle ──run──► Running ──shutdown──► WrappingUp ──grace──► Stopped
//!                    ▲                                            │
//!                    └──────────────────── run ───────────────────┘
//! ```

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::instrument::WithSubscriber;
use tracing::{debug, error, info, instrument, warn};

use crate::breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState};
use crate::config::{RunSettings, TopicConfig};
use crate::cycle::{CycleError, CycleOutcome, CycleStop, LazyReader, PollCycle};
use crate::gate::ConcurrencyGate;
use crate::invocation::{panic_message, Invocation, ProcessFn};
use crate::propagation::{default_propagator, SharedPropagator};
use crate::stats::{StatsSnapshot, WorkerStats};
use crate::transport::Client;

/// Upper bound on waiting for a half-open probe before re-checking the breaker
const PROBE_RECHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Pause before retrying a reader that failed to open
const READER_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Worker lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Created, never run
    Idle,
    Running,
    /// Shutdown requested: no new pulls, in-flight work finishing
    WrappingUp,
    Stopped,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::WrappingUp => write!(f, "wrapping_up"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Worker errors
#[derive(Debug, Error)]
pub enum WorkerError {
    /// `run` called while a run is in progress
    #[error("worker for topic {0} is already running")]
    AlreadyRunning(String),

    /// A panic escaped the supervised loop
    #[error("worker loop panicked: {0}")]
    LoopPanicked(String),
}

/// Snapshot of a worker, cheap enough to serve from a status endpoint
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub topic: String,
    pub state: WorkerState,
    /// Breaker of the current or last run
    pub breaker: Option<CircuitState>,
    pub in_flight: usize,
    pub capacity: usize,
    pub stats: StatsSnapshot,
}

/// What a finished run did
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub topic: String,
    pub stats: StatsSnapshot,
    /// Every invocation finished within the drain timeout
    pub drained: bool,
    /// Invocations still running when the drain gave up
    pub abandoned: usize,
}

/// Handles of the current run, kept for status reporting
struct RunHandles {
    breaker: Arc<CircuitBreaker>,
    gate: ConcurrencyGate,
    stats: Arc<WorkerStats>,
}

struct Lifecycle {
    state: RwLock<WorkerState>,
    run: RwLock<Option<RunHandles>>,
}

impl Lifecycle {
    fn new() -> Self {
        Self {
            state: RwLock::new(WorkerState::Idle),
            run: RwLock::new(None),
        }
    }

    fn state(&self) -> WorkerState {
        *self.state.read()
    }

    /// Move to running unless a run is already in progress
    fn begin(&self) -> bool {
        let mut state = self.state.write();
        if matches!(*state, WorkerState::Running | WorkerState::WrappingUp) {
            return false;
        }
        *state = WorkerState::Running;
        true
    }

    fn wrap_up(&self) {
        let mut state = self.state.write();
        if *state == WorkerState::Running {
            *state = WorkerState::WrappingUp;
        }
    }

    fn stop(&self) {
        *self.state.write() = WorkerState::Stopped;
    }
}

/// Stops the lifecycle and cancels in-flight work however the run ends,
/// including when the run future itself is dropped
struct RunGuard<'a> {
    lifecycle: &'a Lifecycle,
    cancel: CancellationToken,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.lifecycle.stop();
    }
}

/// What the loop waits for between cycles
enum Pause {
    None,
    /// Gate full: until a slot frees up
    SlotFree,
    /// Probe in flight: until some invocation finishes
    Release,
    For(Duration),
}

/// Consumes one topic
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use relay_consumer::{process_fn, InMemoryClient, RunSettings, TopicConfig, WorkerFactory};
///
/// # async fn example() -> Result<(), relay_consumer::WorkerError> {
/// let factory = WorkerFactory::new(Arc::new(InMemoryClient::new()));
/// let worker = factory.create(TopicConfig::new("orders"));
///
/// let summary = worker
///     .run(
///         process_fn(|_ctx, message| async move {
///             tracing::info!(key = %message.key, "order received");
///             Ok(())
///         }),
///         RunSettings::default().with_concurrency(4),
///     )
///     .await?;
/// println!("processed {}", summary.stats.succeeded);
/// # Ok(())
/// # }
/// ```
pub struct Worker {
    config: TopicConfig,
    readers: LazyReader,
    propagator: SharedPropagator,
    dispatch: Option<tracing::Dispatch>,
    lifecycle: Lifecycle,
}

impl Worker {
    pub fn new(client: Arc<dyn Client>, config: TopicConfig) -> Self {
        Self {
            readers: LazyReader::new(client, config.clone()),
            config,
            propagator: default_propagator(),
            dispatch: None,
            lifecycle: Lifecycle::new(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.config.topic
    }

    pub fn state(&self) -> WorkerState {
        self.lifecycle.state()
    }

    /// Current state, breaker, gate occupancy and counters
    pub fn status(&self) -> WorkerStatus {
        let state = self.lifecycle.state();
        match &*self.lifecycle.run.read() {
            Some(run) => WorkerStatus {
                topic: self.config.topic.clone(),
                state,
                breaker: Some(run.breaker.state()),
                in_flight: run.gate.in_flight(),
                capacity: run.gate.capacity(),
                stats: run.stats.snapshot(),
            },
            None => WorkerStatus {
                topic: self.config.topic.clone(),
                state,
                breaker: None,
                in_flight: 0,
                capacity: 0,
                stats: StatsSnapshot::default(),
            },
        }
    }

    /// Run until SIGINT or SIGTERM
    pub async fn run(
        &self,
        processor: ProcessFn,
        settings: RunSettings,
    ) -> Result<RunSummary, WorkerError> {
        self.run_until(processor, settings, shutdown_signal()).await
    }

    /// Run until `shutdown` resolves
    pub async fn run_until<F>(
        &self,
        processor: ProcessFn,
        settings: RunSettings,
        shutdown: F,
    ) -> Result<RunSummary, WorkerError>
    where
        F: Future<Output = ()> + Send,
    {
        let settings = settings.normalized();
        match settings.dispatch.clone().or_else(|| self.dispatch.clone()) {
            Some(dispatch) => {
                self.supervise(processor, settings, shutdown)
                    .with_subscriber(dispatch)
                    .await
            }
            None => self.supervise(processor, settings, shutdown).await,
        }
    }

    #[instrument(skip_all, fields(topic = %self.config.topic))]
    async fn supervise<F>(
        &self,
        processor: ProcessFn,
        settings: RunSettings,
        shutdown: F,
    ) -> Result<RunSummary, WorkerError>
    where
        F: Future<Output = ()> + Send,
    {
        if !self.lifecycle.begin() {
            return Err(WorkerError::AlreadyRunning(self.config.topic.clone()));
        }

        let cancel = CancellationToken::new();
        let wrap_up = CancellationToken::new();
        let _guard = RunGuard {
            lifecycle: &self.lifecycle,
            cancel: cancel.clone(),
        };

        let stats = Arc::new(WorkerStats::new());
        let breaker = Arc::new(CircuitBreaker::new(
            self.config.topic.clone(),
            CircuitBreakerConfig::new()
                .with_failure_threshold(settings.failure_threshold)
                .with_open_duration(settings.open_duration),
        ));
        let gate = ConcurrencyGate::new(settings.concurrency);
        let tracker = TaskTracker::new();

        *self.lifecycle.run.write() = Some(RunHandles {
            breaker: Arc::clone(&breaker),
            gate: gate.clone(),
            stats: Arc::clone(&stats),
        });

        info!(
            topic = %self.config.topic,
            concurrency = settings.concurrency,
            failure_threshold = settings.failure_threshold,
            open_duration_ms = settings.open_duration.as_millis() as u64,
            process_timeout_ms = settings.process_timeout.as_millis() as u64,
            "Starting worker"
        );

        let cycle = PollCycle {
            breaker,
            gate,
            tracker: tracker.clone(),
            invocation: Invocation {
                topic: Arc::from(self.config.topic.as_str()),
                processor,
                propagator: Arc::clone(&self.propagator),
                timeout: settings.process_timeout,
                cancel: cancel.clone(),
                stats: Arc::clone(&stats),
            },
            wrap_up: wrap_up.clone(),
            cancel: cancel.clone(),
            stats: Arc::clone(&stats),
        };

        let coordinator = async {
            shutdown.await;
            info!(
                topic = %self.config.topic,
                grace_ms = settings.wrap_up_duration.as_millis() as u64,
                "Shutdown requested, wrapping up"
            );
            self.lifecycle.wrap_up();
            wrap_up.cancel();
            tokio::time::sleep(settings.wrap_up_duration).await;
            cancel.cancel();
        };

        let looped = {
            let main = catch_loop_panic(self.main_loop(&cycle, settings.sleep_duration));
            tokio::pin!(main, coordinator);
            tokio::select! {
                result = &mut main => result,
                () = &mut coordinator => main.await,
            }
        };

        if let Err(err) = &looped {
            error!(topic = %self.config.topic, error = %err, "Worker loop stopped by panic");
        }

        // Loop may have ended without a shutdown request
        cancel.cancel();
        tracker.close();
        let drained = tokio::time::timeout(settings.drain_timeout, tracker.wait())
            .await
            .is_ok();
        let abandoned = tracker.len();
        if !drained {
            warn!(
                topic = %self.config.topic,
                abandoned,
                drain_timeout_ms = settings.drain_timeout.as_millis() as u64,
                "Drain timed out with invocations still running"
            );
        }

        let summary = RunSummary {
            topic: self.config.topic.clone(),
            stats: stats.snapshot(),
            drained,
            abandoned,
        };
        info!(
            topic = %self.config.topic,
            pulls = summary.stats.pulls,
            succeeded = summary.stats.succeeded,
            failed = summary.stats.completed() - summary.stats.succeeded,
            drained,
            "Worker stopped"
        );

        looped.map(|()| summary)
    }

    async fn main_loop(&self, cycle: &PollCycle, sleep: Duration) {
        while !cycle.cancel.is_cancelled() {
            if cycle.wrap_up.is_cancelled() {
                cycle.cancel.cancelled().await;
                break;
            }

            let outcome = AssertUnwindSafe(cycle.run_once(&self.readers))
                .catch_unwind()
                .await;

            let pause = match outcome {
                Ok(Ok(CycleOutcome::Completed { stop, dispatched })) => {
                    debug!(topic = %self.config.topic, dispatched, ?stop, "Cycle completed");
                    match stop {
                        CycleStop::GateFull => Pause::SlotFree,
                        _ => Pause::None,
                    }
                }
                Ok(Ok(CycleOutcome::Skipped(CircuitBreakerError::ProbeInFlight))) => Pause::Release,
                Ok(Ok(CycleOutcome::Skipped(CircuitBreakerError::Open))) => {
                    Pause::For(cycle.breaker.retry_after().unwrap_or_default())
                }
                Ok(Err(err @ CycleError::Reader(_))) => {
                    error!(topic = %self.config.topic, error = %err, "Reader unavailable");
                    Pause::For(READER_RETRY_DELAY)
                }
                Ok(Err(err)) => {
                    error!(topic = %self.config.topic, error = %err, "Poll cycle failed");
                    Pause::None
                }
                Err(payload) => {
                    error!(
                        topic = %self.config.topic,
                        panic = %panic_message(&*payload),
                        "Poll cycle panicked"
                    );
                    Pause::None
                }
            };

            let idle = async {
                match pause {
                    Pause::None => {}
                    Pause::SlotFree => cycle.gate.wait_available().await,
                    Pause::Release => {
                        let _ =
                            tokio::time::timeout(PROBE_RECHECK_INTERVAL, cycle.gate.wait_release())
                                .await;
                    }
                    Pause::For(delay) => tokio::time::sleep(delay).await,
                }
                if !sleep.is_zero() {
                    tokio::time::sleep(sleep).await;
                }
            };

            tokio::select! {
                _ = cycle.cancel.cancelled() => {}
                _ = cycle.wrap_up.cancelled() => {}
                () = idle => {}
            }
        }
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("config", &self.config)
            .field("state", &self.lifecycle.state())
            .finish()
    }
}

/// Run a loop future, turning an escaped panic into an error
async fn catch_loop_panic<F>(main: F) -> Result<(), WorkerError>
where
    F: Future<Output = ()>,
{
    AssertUnwindSafe(main)
        .catch_unwind()
        .await
        .map_err(|payload| WorkerError::LoopPanicked(panic_message(&*payload)))
}

/// Resolves on SIGINT, or SIGTERM on unix
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received SIGINT"),
        () = terminate => info!("Received SIGTERM"),
    }
}

/// Shared dependencies for the workers of one process
///
/// Holds the transport client, the trace propagator and an optional log
/// dispatch, and creates one [`Worker`] per topic.
pub struct WorkerFactory {
    client: Arc<dyn Client>,
    propagator: SharedPropagator,
    dispatch: Option<tracing::Dispatch>,
}

impl WorkerFactory {
    pub fn new(client: Arc<dyn Client>) -> Self {
        Self {
            client,
            propagator: default_propagator(),
            dispatch: None,
        }
    }

    pub fn with_propagator(mut self, propagator: SharedPropagator) -> Self {
        self.propagator = propagator;
        self
    }

    /// Default log dispatch for created workers; a run's own
    /// [`RunSettings::dispatch`] still wins
    pub fn with_dispatch(mut self, dispatch: tracing::Dispatch) -> Self {
        self.dispatch = Some(dispatch);
        self
    }

    pub fn client(&self) -> &Arc<dyn Client> {
        &self.client
    }

    pub fn create(&self, config: TopicConfig) -> Worker {
        debug!(topic = %config.topic, "Creating worker");
        Worker {
            propagator: Arc::clone(&self.propagator),
            dispatch: self.dispatch.clone(),
            ..Worker::new(Arc::clone(&self.client), config)
        }
    }
}

impl fmt::Debug for WorkerFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerFactory")
            .field("dispatch", &self.dispatch.is_some())
            .finish()
    }
}
