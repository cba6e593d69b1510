//! Handler invocation
//!
//! Runs the user's processing function against one message. The function runs
//! in its own task under a deadline; panics, errors and timeouts all become an
//! [`InvocationError`]. Whatever the outcome, the message is acknowledged
//! exactly once, the outcome goes to the circuit breaker, and the gate slot is
//! released, in that order.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use opentelemetry::trace::TraceContextExt;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;
use tracing::{error, Instrument, Span};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::breaker::OutcomeReporter;
use crate::gate::GateSlot;
use crate::message::{Disposition, Message};
use crate::propagation::{extract_context, SharedPropagator};
use crate::stats::WorkerStats;

/// Result of one processing function call
pub type ProcessResult = anyhow::Result<()>;

/// User-supplied processing function
pub type ProcessFn =
    Arc<dyn Fn(ProcessContext, Arc<Message>) -> BoxFuture<'static, ProcessResult> + Send + Sync>;

/// Wrap an async closure as a [`ProcessFn`]
///
/// # Example
///
/// ```
/// use relay_consumer::process_fn;
///
/// let processor = process_fn(|ctx, message| async move {
///     tracing::info!(topic = ctx.topic(), key = %message.key, "processing");
///     Ok(())
/// });
/// ```
pub fn process_fn<F, Fut>(f: F) -> ProcessFn
where
    F: Fn(ProcessContext, Arc<Message>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ProcessResult> + Send + 'static,
{
    Arc::new(move |ctx, message| Box::pin(f(ctx, message)))
}

/// Context handed to each processing function call
#[derive(Debug, Clone)]
pub struct ProcessContext {
    topic: Arc<str>,
    deadline: Instant,
    cancel: CancellationToken,
}

impl ProcessContext {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// When the invocation times out
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the invocation is abandoned (timeout or shutdown)
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Why an invocation did not succeed
#[derive(Debug, Error)]
pub enum InvocationError {
    /// Processing function returned an error
    #[error("message processing failed: {0:#}")]
    Failed(anyhow::Error),

    #[error("message processing panicked: {0}")]
    Panicked(String),

    #[error("message processing timed out after {0:?}")]
    TimedOut(Duration),

    /// Run cancelled while processing
    #[error("message processing cancelled by shutdown")]
    Cancelled,
}

impl InvocationError {
    fn record(&self, stats: &WorkerStats) {
        match self {
            Self::Failed(_) => stats.failed(),
            Self::Panicked(_) => stats.panicked(),
            Self::TimedOut(_) => stats.timed_out(),
            Self::Cancelled => stats.cancelled(),
        }
    }
}

/// Everything one invocation needs, cloned per message from the run
#[derive(Clone)]
pub(crate) struct Invocation {
    pub topic: Arc<str>,
    pub processor: ProcessFn,
    pub propagator: SharedPropagator,
    pub timeout: Duration,
    /// Run-level cancellation
    pub cancel: CancellationToken,
    pub stats: Arc<WorkerStats>,
}

impl Invocation {
    /// Process `message`, then ack, report and release `slot`
    pub(crate) async fn run(
        self,
        message: Message,
        reporter: OutcomeReporter,
        slot: GateSlot,
    ) -> Result<(), InvocationError> {
        let message = Arc::new(message);
        let span = self.span_for(&message);

        let result = AssertUnwindSafe(self.execute(Arc::clone(&message)).instrument(span.clone()))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(InvocationError::Panicked(panic_message(&*payload))));

        match &result {
            Ok(()) => {
                self.stats.succeeded();
                message.done(Disposition::Consumed);
            }
            Err(err) => {
                err.record(&self.stats);
                if matches!(err, InvocationError::Panicked(_)) {
                    error!(
                        parent: &span,
                        topic = %self.topic,
                        partition = message.partition,
                        offset = message.offset,
                        key = %message.key,
                        error = %err,
                        "Message processing panicked"
                    );
                } else {
                    error!(
                        parent: &span,
                        topic = %self.topic,
                        partition = message.partition,
                        offset = message.offset,
                        key = %message.key,
                        error = %err,
                        "Message processing failed"
                    );
                }
                message.done(Disposition::Redeliver);
            }
        }

        reporter.report(result.is_ok());
        drop(slot);
        result
    }

    async fn execute(&self, message: Arc<Message>) -> Result<(), InvocationError> {
        let token = self.cancel.child_token();
        let ctx = ProcessContext {
            topic: Arc::clone(&self.topic),
            deadline: deadline_after(self.timeout),
            cancel: token.clone(),
        };
        let deadline = ctx.deadline;

        let processing = (self.processor)(ctx, message);
        let mut handle = tokio::spawn(processing.in_current_span().with_current_subscriber());

        let outcome = tokio::select! {
            joined = &mut handle => match joined {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(InvocationError::Failed(err)),
                Err(join) if join.is_panic() => {
                    Err(InvocationError::Panicked(panic_message(&*join.into_panic())))
                }
                Err(_) => Err(InvocationError::Cancelled),
            },
            _ = tokio::time::sleep_until(deadline) => Err(InvocationError::TimedOut(self.timeout)),
            _ = self.cancel.cancelled() => Err(InvocationError::Cancelled),
        };

        if outcome.is_err() {
            token.cancel();
            handle.abort();
        }
        outcome
    }

    fn span_for(&self, message: &Message) -> Span {
        let span = tracing::info_span!(
            "process_message",
            otel.name = %format!("relay.work.process.message.{}", self.topic),
            otel.kind = "consumer",
            topic = %self.topic,
            partition = message.partition,
            offset = message.offset,
            key = %message.key,
        );

        let parent = extract_context(self.propagator.as_ref(), &message.headers);
        if parent.span().span_context().is_valid() {
            span.set_parent(parent);
        }
        span
    }
}

/// Roughly 30 years; longer timeouts are capped so the deadline stays representable
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

fn deadline_after(timeout: Duration) -> Instant {
    Instant::now() + timeout.min(FAR_FUTURE)
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
    use crate::gate::ConcurrencyGate;
    use crate::message::Acknowledge;
    use crate::propagation::default_propagator;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct RecordingAck {
        calls: Mutex<Vec<Disposition>>,
    }

    impl Acknowledge for RecordingAck {
        fn done(&self, _message: &Message, disposition: Disposition) {
            self.calls.lock().push(disposition);
        }
    }

    struct Harness {
        breaker: Arc<CircuitBreaker>,
        gate: ConcurrencyGate,
        ack: Arc<RecordingAck>,
        stats: Arc<WorkerStats>,
        cancel: CancellationToken,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                breaker: Arc::new(CircuitBreaker::new(
                    "orders",
                    CircuitBreakerConfig::new().with_failure_threshold(1),
                )),
                gate: ConcurrencyGate::new(1),
                ack: Arc::new(RecordingAck::default()),
                stats: Arc::new(WorkerStats::new()),
                cancel: CancellationToken::new(),
            }
        }

        async fn invoke(
            &self,
            processor: ProcessFn,
            timeout: Duration,
        ) -> Result<(), InvocationError> {
            let invocation = Invocation {
                topic: Arc::from("orders"),
                processor,
                propagator: default_propagator(),
                timeout,
                cancel: self.cancel.clone(),
                stats: Arc::clone(&self.stats),
            };
            let mut admission = self.breaker.admit().unwrap();
            let reporter = admission.reporter().unwrap();
            let slot = self.gate.try_acquire().unwrap();
            let message = Message::new("k", "v").with_ack(self.ack.clone());

            invocation.run(message, reporter, slot).await
        }

        fn dispositions(&self) -> Vec<Disposition> {
            self.ack.calls.lock().clone()
        }
    }

    #[tokio::test]
    async fn test_success_consumes_message() {
        let harness = Harness::new();
        let result = harness
            .invoke(process_fn(|_, _| async { Ok(()) }), Duration::from_secs(1))
            .await;

        assert!(result.is_ok());
        assert_eq!(harness.dispositions(), vec![Disposition::Consumed]);
        assert_eq!(harness.breaker.counts().total_successes, 1);
        assert_eq!(harness.gate.in_flight(), 0);
        assert_eq!(harness.stats.snapshot().succeeded, 1);
    }

    #[tokio::test]
    async fn test_unbounded_timeout_still_consumes() {
        let harness = Harness::new();
        let result = harness
            .invoke(
                process_fn(|ctx, _| async move {
                    let day = Duration::from_secs(86400);
                    anyhow::ensure!(ctx.remaining() > day, "deadline too near");
                    Ok(())
                }),
                Duration::MAX,
            )
            .await;

        assert!(result.is_ok());
        assert_eq!(harness.dispositions(), vec![Disposition::Consumed]);
        assert_eq!(harness.stats.snapshot().panicked, 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_error_redelivers_and_reports_failure() {
        let harness = Harness::new();
        let result = harness
            .invoke(
                process_fn(|_, _| async { Err(anyhow::anyhow!("bad payload")) }),
                Duration::from_secs(1),
            )
            .await;

        assert!(matches!(result, Err(InvocationError::Failed(_))));
        assert_eq!(harness.dispositions(), vec![Disposition::Redeliver]);
        assert_eq!(harness.breaker.state(), CircuitState::Open);
        assert_eq!(harness.gate.in_flight(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_panic_is_contained() {
        let harness = Harness::new();
        let result = harness
            .invoke(
                process_fn(|_, message| async move {
                    if message.key == "k" {
                        panic!("handler exploded");
                    }
                    Ok(())
                }),
                Duration::from_secs(1),
            )
            .await;

        match result {
            Err(InvocationError::Panicked(msg)) => assert!(msg.contains("handler exploded")),
            other => panic!("expected panic error, got {other:?}"),
        }
        assert_eq!(harness.dispositions(), vec![Disposition::Redeliver]);
        assert_eq!(harness.stats.snapshot().panicked, 1);
        assert!(harness.gate.try_acquire().is_some());
    }

    #[tokio::test]
    async fn test_panic_before_future_is_contained() {
        let harness = Harness::new();
        let processor = process_fn(|_, _| -> futures::future::Ready<ProcessResult> {
            panic!("refused to build a future")
        });
        let result = harness.invoke(processor, Duration::from_secs(1)).await;

        assert!(matches!(result, Err(InvocationError::Panicked(_))));
        assert_eq!(harness.dispositions(), vec![Disposition::Redeliver]);
        assert_eq!(harness.breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_timeout_abandons_processing() {
        struct SetOnDrop(Arc<AtomicBool>);
        impl Drop for SetOnDrop {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let harness = Harness::new();
        let dropped = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&dropped);
        let processor = process_fn(move |_, _| {
            let guard = SetOnDrop(Arc::clone(&flag));
            async move {
                let _guard = guard;
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }
        });

        let result = harness.invoke(processor, Duration::from_millis(20)).await;
        assert!(matches!(result, Err(InvocationError::TimedOut(_))));
        assert_eq!(harness.dispositions(), vec![Disposition::Redeliver]);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(dropped.load(Ordering::SeqCst), "processing task still alive");
    }

    #[tokio::test]
    async fn test_run_cancellation_reaches_context() {
        let harness = Harness::new();
        let processor = process_fn(|ctx, _| async move {
            ctx.cancelled().await;
            // Ignore the cancellation so the invocation has to abandon us
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });

        let cancel = harness.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        let result = harness.invoke(processor, Duration::from_secs(5)).await;
        assert!(matches!(result, Err(InvocationError::Cancelled)));
        assert_eq!(harness.dispositions(), vec![Disposition::Redeliver]);
        assert_eq!(harness.stats.snapshot().cancelled, 1);
    }

    #[tokio::test]
    async fn test_context_exposes_topic_and_deadline() {
        let harness = Harness::new();
        let processor = process_fn(|ctx, message| async move {
            anyhow::ensure!(ctx.topic() == "orders", "wrong topic");
            anyhow::ensure!(message.key == "k", "wrong key");
            anyhow::ensure!(ctx.remaining() > Duration::ZERO, "deadline already passed");
            anyhow::ensure!(!ctx.is_cancelled(), "cancelled too early");
            Ok(())
        });

        assert!(harness.invoke(processor, Duration::from_secs(5)).await.is_ok());
    }

    #[test]
    fn test_panic_message_extraction() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&42_u32), "unknown panic");
    }
}
