//! Telemetry collectors

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info};
use url::Url;

use super::TelemetryCollector;
use crate::error::{DispatchError, Result};

/// A record together with the stream it was posted to
#[derive(Debug, Clone, Serialize)]
pub struct StreamRecord {
    pub stream: String,
    pub record: Value,
}

/// Fans records out to in-process subscribers
pub struct BroadcastCollector {
    sender: broadcast::Sender<StreamRecord>,
}

impl BroadcastCollector {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamRecord> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl TelemetryCollector for BroadcastCollector {
    async fn post(&self, stream: &str, record: &Value) -> Result<()> {
        let record = StreamRecord {
            stream: stream.to_string(),
            record: record.clone(),
        };
        // No subscribers is not a failure
        if self.sender.send(record).is_err() {
            debug!("No telemetry subscribers");
        }
        Ok(())
    }
}

/// POSTs each record as JSON to a collector endpoint
pub struct HttpCollector {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpCollector {
    pub fn new(endpoint: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            client,
            endpoint: Url::parse(endpoint)?,
        })
    }
}

#[derive(Serialize)]
struct Envelope<'a> {
    stream: &'a str,
    data: &'a Value,
}

#[async_trait]
impl TelemetryCollector for HttpCollector {
    async fn post(&self, stream: &str, record: &Value) -> Result<()> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&Envelope {
                stream,
                data: record,
            })
            .send()
            .await
            .map_err(|e| DispatchError::Telemetry(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DispatchError::Telemetry(format!(
                "collector responded with {}",
                status
            )));
        }
        Ok(())
    }
}

/// Writes records to the log instead of shipping them
#[derive(Debug, Default)]
pub struct TracingCollector;

#[async_trait]
impl TelemetryCollector for TracingCollector {
    async fn post(&self, stream: &str, record: &Value) -> Result<()> {
        info!(stream, record = %record, "Request record");
        Ok(())
    }
}
