//! Messages pulled from a transport
//!
//! A [`Message`] is created by a transport reader, handed to exactly one
//! handler invocation, and acknowledged exactly once through
//! [`Message::done`].

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// What the transport may do with a message once its handler finished
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Processing succeeded, the message may be committed
    Consumed,

    /// Processing failed, leave the message for redelivery or dead-lettering
    Redeliver,
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Consumed => write!(f, "consumed"),
            Self::Redeliver => write!(f, "redeliver"),
        }
    }
}

/// Transport-side acknowledgment hook
///
/// Called once per message, whatever the outcome, so the transport can free
/// resources. Only [`Disposition::Consumed`] means the offset may advance.
pub trait Acknowledge: Send + Sync + 'static {
    fn done(&self, message: &Message, disposition: Disposition);
}

/// A unit of work read from a topic
pub struct Message {
    pub key: String,
    pub payload: Vec<u8>,
    /// String headers; also the carrier for trace-context propagation
    pub headers: HashMap<String, String>,
    pub partition: i32,
    pub offset: i64,
    ack: Option<Arc<dyn Acknowledge>>,
    acknowledged: AtomicBool,
}

impl Message {
    /// Create a message without an acknowledgment hook
    pub fn new(key: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            payload: payload.into(),
            headers: HashMap::new(),
            partition: 0,
            offset: 0,
            ack: None,
            acknowledged: AtomicBool::new(false),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn with_position(mut self, partition: i32, offset: i64) -> Self {
        self.partition = partition;
        self.offset = offset;
        self
    }

    /// Attach the transport's acknowledgment hook
    pub fn with_ack(mut self, ack: Arc<dyn Acknowledge>) -> Self {
        self.ack = Some(ack);
        self
    }

    /// Payload as UTF-8, lossy
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    /// Acknowledge the message. Idempotent: only the first call reaches the
    /// transport hook.
    pub fn done(&self, disposition: Disposition) {
        if self.acknowledged.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(ack) = &self.ack {
            ack.done(self, disposition);
        }
    }

    pub fn is_done(&self) -> bool {
        self.acknowledged.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("key", &self.key)
            .field("payload_len", &self.payload.len())
            .field("headers", &self.headers)
            .field("partition", &self.partition)
            .field("offset", &self.offset)
            .field("done", &self.is_done())
            .finish()
    }
}
