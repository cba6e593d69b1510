//! Poll cycle
//!
//! One iteration of the worker loop. A cycle asks the breaker for admission,
//! then keeps pulling while the gate has a free slot, handing each message to
//! a spawned [`Invocation`]. It never waits for invocations to finish.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;
use tracing::instrument::WithSubscriber;

use crate::breaker::{CircuitBreaker, CircuitBreakerError};
use crate::config::TopicConfig;
use crate::gate::ConcurrencyGate;
use crate::invocation::Invocation;
use crate::stats::WorkerStats;
use crate::transport::{Client, Reader, TransportError};

/// Cycle errors; logged by the loop, never fatal
#[derive(Debug, Error)]
pub enum CycleError {
    /// Reader could not be opened (bad topic config, transport down)
    #[error("failed to open reader: {0}")]
    Reader(#[source] TransportError),

    #[error("failed to pull message: {0}")]
    Pull(#[source] TransportError),
}

/// Why a cycle stopped pulling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleStop {
    /// Every gate slot is held
    GateFull,
    /// The half-open probe was dispatched
    ProbeDispatched,
    /// Breaker changed state mid-cycle
    BreakerTripped,
    ShuttingDown,
}

/// How a cycle ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Breaker refused admission; nothing was pulled
    Skipped(CircuitBreakerError),
    Completed { dispatched: usize, stop: CycleStop },
}

/// Reader opened on first use and kept for the worker's lifetime
pub(crate) struct LazyReader {
    client: Arc<dyn Client>,
    config: TopicConfig,
    reader: OnceCell<Arc<dyn Reader>>,
}

impl LazyReader {
    pub(crate) fn new(client: Arc<dyn Client>, config: TopicConfig) -> Self {
        Self {
            client,
            config,
            reader: OnceCell::new(),
        }
    }

    /// Open the reader unless already open. A failure leaves it unopened so
    /// the next cycle tries again.
    pub(crate) async fn ensure(&self) -> Result<Arc<dyn Reader>, CycleError> {
        self.reader
            .get_or_try_init(|| async {
                self.config.validate().map_err(TransportError::from)?;
                self.client.reader(&self.config).await
            })
            .await
            .map(Arc::clone)
            .map_err(CycleError::Reader)
    }
}

/// Per-run state shared by every cycle
pub(crate) struct PollCycle {
    pub breaker: Arc<CircuitBreaker>,
    pub gate: ConcurrencyGate,
    pub tracker: TaskTracker,
    pub invocation: Invocation,
    /// Fires when wrap-up starts: stop pulling
    pub wrap_up: CancellationToken,
    /// Fires when the run is cancelled
    pub cancel: CancellationToken,
    pub stats: Arc<WorkerStats>,
}

impl PollCycle {
    fn stopping(&self) -> bool {
        self.wrap_up.is_cancelled() || self.cancel.is_cancelled()
    }

    pub(crate) async fn run_once(&self, readers: &LazyReader) -> Result<CycleOutcome, CycleError> {
        self.stats.cycle_started();
        let reader = readers.ensure().await?;

        let mut admission = match self.breaker.admit() {
            Ok(admission) => admission,
            Err(reason) => {
                self.stats.cycle_skipped();
                debug!(topic = %self.invocation.topic, %reason, "Cycle skipped");
                return Ok(CycleOutcome::Skipped(reason));
            }
        };

        let mut dispatched = 0;
        let stop = loop {
            if self.stopping() {
                break CycleStop::ShuttingDown;
            }
            if !admission.is_current() {
                break CycleStop::BreakerTripped;
            }
            let Some(slot) = self.gate.try_acquire() else {
                break CycleStop::GateFull;
            };
            let Some(reporter) = admission.reporter() else {
                break CycleStop::ProbeDispatched;
            };

            // The transport read is cancel safe, so an abandoned pull loses nothing
            let pulled = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(CycleStop::ShuttingDown),
                _ = self.wrap_up.cancelled() => Err(CycleStop::ShuttingDown),
                _ = admission.superseded() => Err(CycleStop::BreakerTripped),
                result = reader.read() => Ok(result),
            };

            match pulled {
                Err(stop) => {
                    reporter.discard();
                    drop(slot);
                    break stop;
                }
                Ok(Err(err)) => {
                    self.stats.pull_failed();
                    reporter.report(false);
                    drop(slot);
                    return Err(CycleError::Pull(err));
                }
                Ok(Ok(message)) => {
                    self.stats.pulled();
                    dispatched += 1;
                    debug!(
                        topic = %self.invocation.topic,
                        partition = message.partition,
                        offset = message.offset,
                        in_flight = self.gate.in_flight(),
                        "Dispatching message"
                    );

                    let invocation = self.invocation.clone();
                    self.tracker.spawn(
                        async move {
                            // Outcome is logged and reported by the invocation itself
                            let _ = invocation.run(message, reporter, slot).await;
                        }
                        .with_current_subscriber(),
                    );
                }
            }
        };

        Ok(CycleOutcome::Completed { dispatched, stop })
    }
}
