// Default processing function for the relay-worker binary
//
// Logs each message. A JSON object payload may steer the outcome, which makes
// breaker and timeout behavior easy to exercise from a file:
//   {"fail": true}       -> processing error
//   {"sleep_ms": 250}    -> simulated work, interrupted by cancellation

use std::time::Duration;

use anyhow::bail;
use relay_consumer::{process_fn, ProcessFn};
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Default, Deserialize)]
struct Directives {
    #[serde(default)]
    fail: bool,
    #[serde(default)]
    sleep_ms: Option<u64>,
}

pub fn log_processor() -> ProcessFn {
    process_fn(|ctx, message| async move {
        let directives: Directives = serde_json::from_slice(&message.payload).unwrap_or_default();

        if let Some(ms) = directives.sleep_ms {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
                _ = ctx.cancelled() => bail!("cancelled after {:?}", ctx.remaining()),
            }
        }

        if directives.fail {
            bail!("message {} requested failure", message.key);
        }

        info!(
            topic = %ctx.topic(),
            key = %message.key,
            offset = message.offset,
            payload = %message.payload_str(),
            "Message processed"
        );
        Ok(())
    })
}
