//! relay-worker: process wiring around `relay-consumer`
//!
//! Environment configuration, telemetry bootstrap, a JSON-lines transport and
//! an admin HTTP surface. The binary in `main.rs` ties them together.

pub mod admin;
pub mod config;
pub mod processor;
pub mod source;
pub mod telemetry;

pub use admin::{router, AdminState};
pub use config::{AppConfigError, InputSource, WorkerAppConfig};
pub use processor::log_processor;
pub use source::{AckCounts, LineClient, LineSource};
pub use telemetry::{init_telemetry, TelemetryConfig, TelemetryGuard};
