//! HTTP publisher for the app-receiver gateway.
//!
//! When `appReceiverURL` is configured, scenario requests are POSTed to it
//! as JSON instead of being sent over the broker connection.

use async_trait::async_trait;
use duet_core::{CoreError, CoreResult, RequestPublisher};
use duet_env::EnvError;
use std::time::Duration;
use tracing::debug;

/// Upper bound on one gateway round trip.
const GATEWAY_TIMEOUT: Duration = Duration::from_secs(10);

pub struct HttpRequestPublisher {
    client: reqwest::Client,
}

impl HttpRequestPublisher {
    pub fn new() -> CoreResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(GATEWAY_TIMEOUT)
            .build()
            .map_err(|e| CoreError::config(format!("building gateway client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl RequestPublisher for HttpRequestPublisher {
    async fn publish(&self, destination: &str, body: &str) -> CoreResult<()> {
        let response = self
            .client
            .post(destination)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.to_string())
            .send()
            .await
            .map_err(|e| EnvError::network(format!("gateway {destination}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(EnvError::network(format!("gateway {destination} answered {status}")).into());
        }
        debug!(%destination, %status, "request accepted by gateway");
        Ok(())
    }
}
