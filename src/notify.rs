//! Asynchronous delivery of enforcement decisions to subscriber URLs.
//!
//! Each subscriber gets an independent, bounded-time POST carrying the
//! JSON-serialized decision. Delivery is fire-and-forget: failures are
//! logged and counted, never retried, and never surfaced to the decision
//! path.

use crate::limiter::Decision;
use crate::metrics;
use std::time::Duration;
use tracing::debug;

/// Header identifying the event type on callback POSTs.
pub const EVENT_HEADER: &str = "X-Tower-Event";

/// Per-subscriber delivery timeout.
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// HTTP delivery client for subscriber callbacks.
#[derive(Debug, Clone)]
pub struct Notifier {
    client: reqwest::Client,
}

impl Notifier {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(DELIVERY_TIMEOUT)
            .user_agent("towerd/0.1")
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self { client }
    }

    /// Deliver `decision` to each URL on its own task.
    ///
    /// Returns immediately; ordering across subscribers is unspecified.
    /// Any 2xx response counts as delivered.
    pub fn dispatch(&self, urls: Vec<String>, decision: &Decision) {
        for url in urls {
            let client = self.client.clone();
            let decision = decision.clone();
            tokio::spawn(async move {
                let result = client
                    .post(&url)
                    .header(EVENT_HEADER, decision.action.as_str())
                    .json(&decision)
                    .send()
                    .await;

                match result {
                    Ok(response) if response.status().is_success() => {
                        metrics::record_callback("delivered");
                    }
                    Ok(response) => {
                        debug!(url = %url, status = %response.status(), "Callback rejected");
                        metrics::record_callback("rejected");
                    }
                    Err(e) => {
                        debug!(url = %url, error = %e, "Callback delivery failed");
                        metrics::record_callback("failed");
                    }
                }
            });
        }
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}
