//! Worker and run configuration
//!
//! [`TopicConfig`] identifies what a worker consumes and is fixed at
//! construction. [`RunSettings`] holds the tunables of a single
//! [`Worker::run`](crate::Worker::run) call.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Topic name missing
    #[error("topic name must not be empty")]
    EmptyTopic,

    /// Bootstrap server entry is blank
    #[error("bootstrap server entry {0} is blank")]
    BlankBootstrapServer(usize),
}

/// Topic identity and transport connection parameters
///
/// # Example
///
/// ```
/// use relay_consumer::TopicConfig;
///
/// let config = TopicConfig::new("orders").with_bootstrap_servers(["localhost:9092"]);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TopicConfig {
    /// Topic (queue) to consume
    pub topic: String,

    /// Transport bootstrap servers
    #[serde(default)]
    pub bootstrap_servers: Vec<String>,
}

impl TopicConfig {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            bootstrap_servers: vec![],
        }
    }

    pub fn with_bootstrap_servers<I, S>(mut self, servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.bootstrap_servers = servers.into_iter().map(Into::into).collect();
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.topic.trim().is_empty() {
            return Err(ConfigError::EmptyTopic);
        }
        if let Some(idx) = self
            .bootstrap_servers
            .iter()
            .position(|s| s.trim().is_empty())
        {
            return Err(ConfigError::BlankBootstrapServer(idx));
        }
        Ok(())
    }
}

/// Tunables for one run of a worker
///
/// # Example
///
/// ```
/// use relay_consumer::RunSettings;
/// use std::time::Duration;
///
/// let settings = RunSettings::default()
///     .with_concurrency(4)
///     .with_failure_threshold(3)
///     .with_open_duration(Duration::from_secs(5));
///
/// assert_eq!(settings.concurrency, 4);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSettings {
    /// Pause after every loop iteration
    #[serde(with = "duration_millis")]
    pub sleep_duration: Duration,

    /// Grace window between a shutdown signal and cancellation
    #[serde(with = "duration_millis")]
    pub wrap_up_duration: Duration,

    /// Maximum concurrent handler invocations (gate capacity)
    pub concurrency: usize,

    /// Consecutive failures that trip the circuit breaker
    pub failure_threshold: u32,

    /// How long the breaker stays open before allowing a probe
    #[serde(with = "duration_millis")]
    pub open_duration: Duration,

    /// Deadline for one processing function call
    #[serde(with = "duration_millis")]
    pub process_timeout: Duration,

    /// Upper bound on waiting for in-flight invocations after cancellation
    #[serde(with = "duration_millis")]
    pub drain_timeout: Duration,

    /// Log dispatch override; `None` uses the current default subscriber
    #[serde(skip)]
    pub dispatch: Option<tracing::Dispatch>,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            sleep_duration: Duration::ZERO,
            wrap_up_duration: Duration::from_secs(1),
            concurrency: 1,
            failure_threshold: 5,
            open_duration: Duration::from_secs(10),
            process_timeout: Duration::from_secs(60),
            drain_timeout: Duration::from_secs(5),
            dispatch: None,
        }
    }
}

impl RunSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Breathing room after each loop iteration
    pub fn with_sleep_duration(mut self, sleep: Duration) -> Self {
        self.sleep_duration = sleep;
        self
    }

    pub fn with_wrap_up_duration(mut self, grace: Duration) -> Self {
        self.wrap_up_duration = grace;
        self
    }

    /// Set the concurrency factor. Prefer more worker instances over a high
    /// factor.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_open_duration(mut self, duration: Duration) -> Self {
        self.open_duration = duration;
        self
    }

    pub fn with_process_timeout(mut self, timeout: Duration) -> Self {
        self.process_timeout = timeout;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Route this run's logs to a specific subscriber
    pub fn with_dispatch(mut self, dispatch: tracing::Dispatch) -> Self {
        self.dispatch = Some(dispatch);
        self
    }

    /// Clamp values that would make the run meaningless. Deserialized
    /// settings bypass the builder, so this runs at the start of every run.
    pub fn normalized(mut self) -> Self {
        self.concurrency = self.concurrency.max(1);
        self.failure_threshold = self.failure_threshold.max(1);
        if self.process_timeout.is_zero() {
            self.process_timeout = Self::default().process_timeout;
        }
        self
    }
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
