//! In-memory transport
//!
//! A topic backed by a queue, for tests, demos and local development. It
//! records every acknowledgment and read attempt so callers can assert on the
//! worker's behaviour.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;

use crate::config::TopicConfig;
use crate::message::{Acknowledge, Disposition, Message};
use crate::propagation::{default_propagator, inject_context, SharedPropagator};
use crate::transport::{Client, Delivery, Reader, TransportError, Writer};

/// One acknowledgment seen by the topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AckRecord {
    pub key: String,
    pub partition: i32,
    pub offset: i64,
    pub disposition: Disposition,
}

#[derive(Default)]
struct TopicState {
    queue: VecDeque<Message>,
    injected_failures: VecDeque<TransportError>,
    acks: Vec<AckRecord>,
    closed: bool,
}

/// Queue-backed topic
pub struct InMemoryTopic {
    name: String,
    state: Mutex<TopicState>,
    notify: Notify,
    next_offset: AtomicI64,
    read_calls: AtomicUsize,
    delivered: AtomicUsize,
    requeue_on_failure: bool,
    propagator: SharedPropagator,
    this: Weak<InMemoryTopic>,
}

impl InMemoryTopic {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Self::build(name.into(), false)
    }

    /// A topic that puts redelivered messages back at the end of the queue
    pub fn with_requeue(name: impl Into<String>) -> Arc<Self> {
        Self::build(name.into(), true)
    }

    fn build(name: String, requeue_on_failure: bool) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            name,
            state: Mutex::new(TopicState::default()),
            notify: Notify::new(),
            next_offset: AtomicI64::new(0),
            read_calls: AtomicUsize::new(0),
            delivered: AtomicUsize::new(0),
            requeue_on_failure,
            propagator: default_propagator(),
            this: this.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a message; returns its offset
    pub fn push(
        &self,
        key: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        headers: HashMap<String, String>,
    ) -> i64 {
        let offset = self.next_offset.fetch_add(1, Ordering::AcqRel);
        let message = Message::new(key, payload)
            .with_headers(headers)
            .with_position(0, offset);
        self.enqueue(message);
        offset
    }

    fn enqueue(&self, message: Message) {
        let message = message.with_ack(Arc::new(TopicAck(self.this.clone())));
        self.state.lock().queue.push_back(message);
        self.notify.notify_waiters();
    }

    /// Make the next read fail with `error`
    pub fn fail_next_read(&self, error: TransportError) {
        self.state.lock().injected_failures.push_back(error);
        self.notify.notify_waiters();
    }

    /// Close the topic; pending and future reads fail once the queue is empty
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn pending(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Every call to `read`, including ones still waiting
    pub fn read_calls(&self) -> usize {
        self.read_calls.load(Ordering::Acquire)
    }

    /// Reads that returned a message
    pub fn delivered(&self) -> usize {
        self.delivered.load(Ordering::Acquire)
    }

    pub fn acks(&self) -> Vec<AckRecord> {
        self.state.lock().acks.clone()
    }

    pub fn acks_with(&self, disposition: Disposition) -> usize {
        self.state
            .lock()
            .acks
            .iter()
            .filter(|a| a.disposition == disposition)
            .count()
    }

    fn try_take(&self) -> Option<Result<Message, TransportError>> {
        let mut state = self.state.lock();
        if let Some(error) = state.injected_failures.pop_front() {
            return Some(Err(error));
        }
        if let Some(message) = state.queue.pop_front() {
            self.delivered.fetch_add(1, Ordering::AcqRel);
            return Some(Ok(message));
        }
        if state.closed {
            return Some(Err(TransportError::Closed(self.name.clone())));
        }
        None
    }
}

/// Acknowledgment hook held by queued messages; weak so messages do not keep
/// their topic alive
struct TopicAck(Weak<InMemoryTopic>);

impl Acknowledge for TopicAck {
    fn done(&self, message: &Message, disposition: Disposition) {
        if let Some(topic) = self.0.upgrade() {
            topic.record_ack(message, disposition);
        }
    }
}

impl InMemoryTopic {
    fn record_ack(&self, message: &Message, disposition: Disposition) {
        self.state.lock().acks.push(AckRecord {
            key: message.key.clone(),
            partition: message.partition,
            offset: message.offset,
            disposition,
        });

        if disposition == Disposition::Redeliver && self.requeue_on_failure {
            let copy = Message::new(message.key.clone(), message.payload.clone())
                .with_headers(message.headers.clone())
                .with_position(message.partition, message.offset);
            self.enqueue(copy);
        }
    }
}

#[async_trait]
impl Reader for InMemoryTopic {
    async fn read(&self) -> Result<Message, TransportError> {
        self.read_calls.fetch_add(1, Ordering::AcqRel);
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(result) = self.try_take() {
                return result;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl Writer for InMemoryTopic {
    async fn write(
        &self,
        key: &str,
        payload: Vec<u8>,
        mut headers: HashMap<String, String>,
    ) -> Result<Delivery, TransportError> {
        if self.state.lock().closed {
            return Err(TransportError::Closed(self.name.clone()));
        }

        let cx = tracing_opentelemetry::OpenTelemetrySpanExt::context(&tracing::Span::current());
        inject_context(self.propagator.as_ref(), &cx, &mut headers);

        let offset = self.push(key, payload, headers);
        Ok(Delivery {
            partition: 0,
            offset,
        })
    }
}

/// Client over a set of in-memory topics
#[derive(Default)]
pub struct InMemoryClient {
    topics: Mutex<HashMap<String, Arc<InMemoryTopic>>>,
}

impl InMemoryClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create a topic
    pub fn topic(&self, name: &str) -> Arc<InMemoryTopic> {
        Arc::clone(
            self.topics
                .lock()
                .entry(name.to_string())
                .or_insert_with(|| InMemoryTopic::new(name)),
        )
    }

    /// Register a pre-built topic, replacing any existing one
    pub fn insert(&self, topic: Arc<InMemoryTopic>) {
        self.topics.lock().insert(topic.name().to_string(), topic);
    }
}

#[async_trait]
impl Client for InMemoryClient {
    async fn reader(&self, config: &TopicConfig) -> Result<Arc<dyn Reader>, TransportError> {
        config.validate()?;
        let reader: Arc<dyn Reader> = self.topic(&config.topic);
        Ok(reader)
    }

    async fn writer(&self, config: &TopicConfig) -> Result<Arc<dyn Writer>, TransportError> {
        config.validate()?;
        let writer: Arc<dyn Writer> = self.topic(&config.topic);
        Ok(writer)
    }
}
