//! Transport boundary
//!
//! The worker never talks to a broker directly. A [`Client`] opens a
//! [`Reader`] for a [`TopicConfig`]; the reader hands out [`Message`]s whose
//! acknowledgment hook commits (or not) on the transport side.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{ConfigError, TopicConfig};
use crate::message::Message;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// Topic configuration rejected
    #[error("invalid topic configuration: {0}")]
    Config(#[from] ConfigError),

    /// Topic closed, no more messages will arrive
    #[error("topic {0} is closed")]
    Closed(String),

    /// Connection-level failure
    #[error("transport connection error: {0}")]
    Connection(String),

    /// Any other read or write failure
    #[error("transport error: {0}")]
    Other(String),
}

/// Pulls messages from one topic
#[async_trait]
pub trait Reader: Send + Sync + 'static {
    /// Read the next message.
    ///
    /// May block until a message arrives. Must be cancel safe: the worker
    /// drops this future when shutdown starts, and no message may be lost
    /// because of that.
    async fn read(&self) -> Result<Message, TransportError>;
}

/// Where a written message landed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub partition: i32,
    pub offset: i64,
}

/// Produces messages to one topic
#[async_trait]
pub trait Writer: Send + Sync + 'static {
    async fn write(
        &self,
        key: &str,
        payload: Vec<u8>,
        headers: HashMap<String, String>,
    ) -> Result<Delivery, TransportError>;
}

/// Opens readers and writers for topics
#[async_trait]
pub trait Client: Send + Sync + 'static {
    async fn reader(&self, config: &TopicConfig) -> Result<Arc<dyn Reader>, TransportError>;

    async fn writer(&self, config: &TopicConfig) -> Result<Arc<dyn Writer>, TransportError>;
}
