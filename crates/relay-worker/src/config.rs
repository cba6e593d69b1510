// Worker process configuration
// Decision: Environment only, a .env file is loaded by main before this runs
// Decision: Malformed numbers are an error, missing ones fall back to defaults

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use relay_consumer::{RunSettings, TopicConfig};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AppConfigError {
    #[error("{name} is required")]
    Missing { name: &'static str },

    #[error("{name} has invalid value {value:?}")]
    Invalid { name: &'static str, value: String },
}

/// Where the JSON-lines source reads from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSource {
    Stdin,
    File(PathBuf),
}

/// Configuration for the relay-worker process
#[derive(Debug, Clone)]
pub struct WorkerAppConfig {
    /// Unique identifier for this worker instance
    pub worker_id: String,
    pub topic: String,
    pub bootstrap_servers: Vec<String>,
    pub concurrency: usize,
    /// Consecutive failures before the breaker opens
    pub failure_threshold: u32,
    pub open_duration: Duration,
    pub sleep_duration: Duration,
    pub wrap_up_duration: Duration,
    pub process_timeout: Duration,
    /// Admin HTTP listener; `None` disables it
    pub admin_addr: Option<SocketAddr>,
    pub input: InputSource,
}

impl Default for WorkerAppConfig {
    fn default() -> Self {
        let settings = RunSettings::default();
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            topic: String::new(),
            bootstrap_servers: vec![],
            concurrency: settings.concurrency,
            failure_threshold: settings.failure_threshold,
            open_duration: settings.open_duration,
            sleep_duration: settings.sleep_duration,
            wrap_up_duration: settings.wrap_up_duration,
            process_timeout: settings.process_timeout,
            admin_addr: None,
            input: InputSource::Stdin,
        }
    }
}

impl WorkerAppConfig {
    /// Create configuration from environment variables
    ///
    /// - `RELAY_TOPIC` (required)
    /// - `RELAY_BOOTSTRAP_SERVERS`: comma-separated
    /// - `RELAY_CONCURRENCY`, `RELAY_CB_AFTER`
    /// - `RELAY_CB_FOR_MS`, `RELAY_SLEEP_MS`, `RELAY_WRAPUP_MS`, `RELAY_PROCESS_TIMEOUT_MS`
    /// - `RELAY_ADMIN_ADDR`: e.g. `127.0.0.1:9300`
    /// - `RELAY_INPUT`: file path, or `-` for stdin (default)
    /// - `WORKER_ID`
    pub fn from_env() -> Result<Self, AppConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, AppConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let topic = var("RELAY_TOPIC").ok_or(AppConfigError::Missing {
            name: "RELAY_TOPIC",
        })?;

        let bootstrap_servers = var("RELAY_BOOTSTRAP_SERVERS")
            .map(|servers| servers.split(',').map(|s| s.trim().to_string()).collect())
            .unwrap_or_default();

        let millis = |name: &'static str, default: Duration| -> Result<Duration, AppConfigError> {
            Ok(parse(name, var(name))?.map_or(default, Duration::from_millis))
        };

        let input = match var("RELAY_INPUT") {
            None => InputSource::Stdin,
            Some(path) if path == "-" => InputSource::Stdin,
            Some(path) => InputSource::File(PathBuf::from(path)),
        };

        Ok(Self {
            worker_id: var("WORKER_ID").unwrap_or(defaults.worker_id),
            topic,
            bootstrap_servers,
            concurrency: parse("RELAY_CONCURRENCY", var("RELAY_CONCURRENCY"))?
                .unwrap_or(defaults.concurrency),
            failure_threshold: parse("RELAY_CB_AFTER", var("RELAY_CB_AFTER"))?
                .unwrap_or(defaults.failure_threshold),
            open_duration: millis("RELAY_CB_FOR_MS", defaults.open_duration)?,
            sleep_duration: millis("RELAY_SLEEP_MS", defaults.sleep_duration)?,
            wrap_up_duration: millis("RELAY_WRAPUP_MS", defaults.wrap_up_duration)?,
            process_timeout: millis("RELAY_PROCESS_TIMEOUT_MS", defaults.process_timeout)?,
            admin_addr: parse("RELAY_ADMIN_ADDR", var("RELAY_ADMIN_ADDR"))?,
            input,
        })
    }

    pub fn topic_config(&self) -> TopicConfig {
        TopicConfig::new(&self.topic).with_bootstrap_servers(self.bootstrap_servers.clone())
    }

    pub fn run_settings(&self) -> RunSettings {
        RunSettings::default()
            .with_concurrency(self.concurrency)
            .with_failure_threshold(self.failure_threshold)
            .with_open_duration(self.open_duration)
            .with_sleep_duration(self.sleep_duration)
            .with_wrap_up_duration(self.wrap_up_duration)
            .with_process_timeout(self.process_timeout)
    }
}

fn parse<T: std::str::FromStr>(
    name: &'static str,
    value: Option<String>,
) -> Result<Option<T>, AppConfigError> {
    value
        .map(|v| {
            v.trim()
                .parse()
                .map_err(|_| AppConfigError::Invalid { name, value: v })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_topic_is_required() {
        let err = WorkerAppConfig::from_lookup(lookup(&[])).unwrap_err();
        assert_eq!(err, AppConfigError::Missing { name: "RELAY_TOPIC" });
    }

    #[test]
    fn test_defaults_follow_run_settings() {
        let config = WorkerAppConfig::from_lookup(lookup(&[("RELAY_TOPIC", "orders")])).unwrap();
        let defaults = RunSettings::default();

        assert_eq!(config.topic, "orders");
        assert!(config.worker_id.starts_with("worker-"));
        assert_eq!(config.concurrency, defaults.concurrency);
        assert_eq!(config.open_duration, defaults.open_duration);
        assert_eq!(config.input, InputSource::Stdin);
        assert!(config.admin_addr.is_none());
    }

    #[test]
    fn test_full_environment() {
        let config = WorkerAppConfig::from_lookup(lookup(&[
            ("WORKER_ID", "worker-a"),
            ("RELAY_TOPIC", "orders"),
            ("RELAY_BOOTSTRAP_SERVERS", "kafka-1:9092, kafka-2:9092"),
            ("RELAY_CONCURRENCY", "8"),
            ("RELAY_CB_AFTER", "3"),
            ("RELAY_CB_FOR_MS", "2500"),
            ("RELAY_SLEEP_MS", "10"),
            ("RELAY_WRAPUP_MS", "750"),
            ("RELAY_PROCESS_TIMEOUT_MS", "30000"),
            ("RELAY_ADMIN_ADDR", "127.0.0.1:9300"),
            ("RELAY_INPUT", "/tmp/orders.jsonl"),
        ]))
        .unwrap();

        assert_eq!(config.worker_id, "worker-a");
        assert_eq!(config.bootstrap_servers, vec!["kafka-1:9092", "kafka-2:9092"]);
        assert_eq!(config.input, InputSource::File(PathBuf::from("/tmp/orders.jsonl")));
        assert_eq!(config.admin_addr, Some("127.0.0.1:9300".parse().unwrap()));

        let settings = config.run_settings();
        assert_eq!(settings.concurrency, 8);
        assert_eq!(settings.failure_threshold, 3);
        assert_eq!(settings.open_duration, Duration::from_millis(2500));
        assert_eq!(settings.sleep_duration, Duration::from_millis(10));
        assert_eq!(settings.wrap_up_duration, Duration::from_millis(750));
        assert_eq!(settings.process_timeout, Duration::from_secs(30));

        let topic = config.topic_config();
        assert_eq!(topic.topic, "orders");
        assert!(topic.validate().is_ok());
    }

    #[test]
    fn test_malformed_number_is_rejected() {
        let err = WorkerAppConfig::from_lookup(lookup(&[
            ("RELAY_TOPIC", "orders"),
            ("RELAY_CONCURRENCY", "lots"),
        ]))
        .unwrap_err();

        assert_eq!(
            err,
            AppConfigError::Invalid {
                name: "RELAY_CONCURRENCY",
                value: "lots".to_string()
            }
        );
    }

    #[test]
    fn test_dash_means_stdin() {
        let config = WorkerAppConfig::from_lookup(lookup(&[
            ("RELAY_TOPIC", "orders"),
            ("RELAY_INPUT", "-"),
        ]))
        .unwrap();
        assert_eq!(config.input, InputSource::Stdin);
    }
}
