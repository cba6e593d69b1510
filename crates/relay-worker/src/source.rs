// JSON-lines transport
// Decision: One line is one message; the line number is the offset
// Decision: Lines that are not a JSON envelope become the payload verbatim
//
// Envelope shape:
//   {"key": "order-1", "payload": {...}, "headers": {"traceparent": "..."}}
// `payload` may be any JSON value; a string is taken as raw bytes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use relay_consumer::{
    Acknowledge, Client, Disposition, Message, Reader, TopicConfig, TransportError, Writer,
};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    key: Option<String>,
    payload: serde_json::Value,
    #[serde(default)]
    headers: HashMap<String, String>,
}

/// Acknowledgment counters for a line source
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AckCounts {
    pub consumed: u64,
    pub redelivered: u64,
}

#[derive(Default)]
struct LineAck {
    consumed: AtomicU64,
    redelivered: AtomicU64,
}

impl Acknowledge for LineAck {
    fn done(&self, message: &Message, disposition: Disposition) {
        match disposition {
            Disposition::Consumed => {
                self.consumed.fetch_add(1, Ordering::Relaxed);
                debug!(key = %message.key, offset = message.offset, "Line consumed");
            }
            Disposition::Redeliver => {
                // A line source cannot rewind; the failure is left to the log
                self.redelivered.fetch_add(1, Ordering::Relaxed);
                warn!(
                    key = %message.key,
                    offset = message.offset,
                    "Line not consumed, no redelivery on a line source"
                );
            }
        }
    }
}

type LineStream = Lines<BufReader<Box<dyn AsyncRead + Send + Unpin>>>;

/// Reads messages from newline-delimited JSON
pub struct LineSource {
    name: String,
    lines: Mutex<LineStream>,
    offset: AtomicI64,
    ack: Arc<LineAck>,
    exhausted: CancellationToken,
}

impl LineSource {
    pub fn new(name: impl Into<String>, input: impl AsyncRead + Send + Unpin + 'static) -> Self {
        let input: Box<dyn AsyncRead + Send + Unpin> = Box::new(input);
        Self {
            name: name.into(),
            lines: Mutex::new(BufReader::new(input).lines()),
            offset: AtomicI64::new(0),
            ack: Arc::new(LineAck::default()),
            exhausted: CancellationToken::new(),
        }
    }

    pub fn stdin() -> Self {
        Self::new("stdin", tokio::io::stdin())
    }

    pub async fn open(path: &std::path::Path) -> std::io::Result<Self> {
        let file = tokio::fs::File::open(path).await?;
        Ok(Self::new(path.display().to_string(), file))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ack_counts(&self) -> AckCounts {
        AckCounts {
            consumed: self.ack.consumed.load(Ordering::Relaxed),
            redelivered: self.ack.redelivered.load(Ordering::Relaxed),
        }
    }

    /// Resolves once end of input has been read
    pub async fn exhausted(&self) {
        self.exhausted.cancelled().await
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted.is_cancelled()
    }

    fn parse(&self, line: &str, offset: i64) -> Message {
        let message = match serde_json::from_str::<Envelope>(line) {
            Ok(envelope) => {
                let payload = match envelope.payload {
                    serde_json::Value::String(s) => s.into_bytes(),
                    other => other.to_string().into_bytes(),
                };
                Message::new(
                    envelope.key.unwrap_or_else(|| Uuid::now_v7().to_string()),
                    payload,
                )
                .with_headers(envelope.headers)
            }
            Err(_) => Message::new(Uuid::now_v7().to_string(), line.as_bytes().to_vec()),
        };
        message
            .with_position(0, offset)
            .with_ack(self.ack.clone())
    }
}

#[async_trait]
impl Reader for LineSource {
    async fn read(&self) -> Result<Message, TransportError> {
        // Both the lock and next_line are cancel safe
        let mut lines = self.lines.lock().await;
        loop {
            let line = lines
                .next_line()
                .await
                .map_err(|e| TransportError::Other(e.to_string()))?;

            let Some(line) = line else {
                if !self.exhausted.is_cancelled() {
                    info!(source = %self.name, "End of input");
                    self.exhausted.cancel();
                }
                return Err(TransportError::Closed(self.name.clone()));
            };

            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let offset = self.offset.fetch_add(1, Ordering::Relaxed);
            return Ok(self.parse(line, offset));
        }
    }
}

/// Serves one line source to any topic
pub struct LineClient {
    source: Arc<LineSource>,
}

impl LineClient {
    pub fn new(source: Arc<LineSource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl Client for LineClient {
    async fn reader(&self, config: &TopicConfig) -> Result<Arc<dyn Reader>, TransportError> {
        config.validate()?;
        info!(topic = %config.topic, source = %self.source.name(), "Opening line reader");
        let reader: Arc<dyn Reader> = self.source.clone();
        Ok(reader)
    }

    async fn writer(&self, config: &TopicConfig) -> Result<Arc<dyn Writer>, TransportError> {
        config.validate()?;
        Err(TransportError::Other(format!(
            "line source {} is read-only",
            self.source.name()
        )))
    }
}
