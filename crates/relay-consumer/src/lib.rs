//! # Relay Consumer
//!
//! A supervised message-consumption worker: pulls messages from a topic,
//! runs them on a bounded pool of concurrent handlers, isolates per-message
//! failures, trips a circuit breaker under sustained failure, and shuts down
//! gracefully.
//!
//! ## Features
//!
//! - **Bounded concurrency**: a fixed-capacity gate; a full gate stops pulling
//! - **Failure isolation**: handler errors, panics and timeouts are contained
//!   per message and the message is left for redelivery
//! - **Circuit breaker**: consecutive failures pause pulling; a single probe
//!   tests recovery
//! - **Graceful shutdown**: wrap-up grace, cancellation, bounded drain
//! - **Trace propagation**: processing spans continue the producer's trace
//!   from message headers
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Worker                              │
//! │  (lifecycle, shutdown coordination, supervised loop)        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ every iteration
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        PollCycle                             │
//! │  (breaker admission → gate slot → pull → spawn)             │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ per message
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Invocation                            │
//! │  (timeout, panic containment, ack, report, release)         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use relay_consumer::prelude::*;
//!
//! # async fn example() -> Result<(), WorkerError> {
//! let client = Arc::new(InMemoryClient::new());
//! client.topic("orders").push("order-1", r#"{"id":1}"#, HashMap::new());
//!
//! let worker = WorkerFactory::new(client).create(TopicConfig::new("orders"));
//! let settings = RunSettings::default()
//!     .with_concurrency(4)
//!     .with_failure_threshold(3)
//!     .with_process_timeout(Duration::from_secs(5));
//!
//! worker
//!     .run(
//!         process_fn(|_ctx, message| async move {
//!             let order: serde_json::Value = serde_json::from_slice(&message.payload)?;
//!             tracing::info!(%order, "order received");
//!             Ok(())
//!         }),
//!         settings,
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod breaker;
pub mod config;
pub mod cycle;
pub mod gate;
pub mod invocation;
pub mod memory;
pub mod message;
pub mod propagation;
pub mod stats;
pub mod transport;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::breaker::{CircuitBreakerError, CircuitState};
    pub use crate::config::{ConfigError, RunSettings, TopicConfig};
    pub use crate::invocation::{process_fn, InvocationError, ProcessContext, ProcessFn};
    pub use crate::memory::{InMemoryClient, InMemoryTopic};
    pub use crate::message::{Acknowledge, Disposition, Message};
    pub use crate::transport::{Client, Reader, TransportError, Writer};
    pub use crate::worker::{RunSummary, Worker, WorkerError, WorkerFactory, WorkerStatus};
}

// Re-export key types at crate root
pub use breaker::{
    Admission, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState, Counts,
    OutcomeReporter,
};
pub use config::{ConfigError, RunSettings, TopicConfig};
pub use cycle::{CycleError, CycleOutcome, CycleStop};
pub use gate::{ConcurrencyGate, GateSlot};
pub use invocation::{process_fn, InvocationError, ProcessContext, ProcessFn, ProcessResult};
pub use memory::{AckRecord, InMemoryClient, InMemoryTopic};
pub use message::{Acknowledge, Disposition, Message};
pub use propagation::{default_propagator, SharedPropagator};
pub use stats::{StatsSnapshot, WorkerStats};
pub use transport::{Client, Delivery, Reader, TransportError, Writer};
pub use worker::{
    shutdown_signal, RunSummary, Worker, WorkerError, WorkerFactory, WorkerState, WorkerStatus,
};
