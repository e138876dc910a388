//! Sampled request telemetry
//!
//! Every dispatch produces a [`RequestRecord`]. The sink decides whether to
//! keep it, then hands it to a collector on a detached task. Nothing the
//! collector does can reach the caller: failures are logged and dropped.

pub mod collector;

use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::TelemetryConfig;
use crate::error::Result;
use crate::models::RequestRecord;

pub use collector::{BroadcastCollector, HttpCollector, StreamRecord, TracingCollector};

/// Receives structured records tagged with a stream name
#[async_trait]
pub trait TelemetryCollector: Send + Sync {
    async fn post(&self, stream: &str, record: &Value) -> Result<()>;
}

/// Probability that a record is emitted
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sampler {
    rate: f64,
}

impl Sampler {
    pub fn always() -> Self {
        Self { rate: 1.0 }
    }

    pub fn never() -> Self {
        Self { rate: 0.0 }
    }

    /// Rates outside `[0, 1]` are clamped; NaN samples nothing
    pub fn with_rate(rate: f64) -> Self {
        let rate = if rate.is_nan() { 0.0 } else { rate.clamp(0.0, 1.0) };
        Self { rate }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn should_sample(&self) -> bool {
        if self.rate >= 1.0 {
            true
        } else if self.rate <= 0.0 {
            false
        } else {
            rand::thread_rng().gen_bool(self.rate)
        }
    }
}

impl Default for Sampler {
    fn default() -> Self {
        Self::with_rate(0.1)
    }
}

/// Fire-and-forget emitter in front of a collector
#[derive(Clone)]
pub struct TelemetrySink {
    collector: Arc<dyn TelemetryCollector>,
    sampler: Sampler,
    stream: Arc<str>,
}

impl TelemetrySink {
    pub fn new(collector: Arc<dyn TelemetryCollector>, sampler: Sampler, stream: &str) -> Self {
        Self {
            collector,
            sampler,
            stream: Arc::from(stream),
        }
    }

    pub fn from_config(collector: Arc<dyn TelemetryCollector>, config: &TelemetryConfig) -> Self {
        Self::new(collector, Sampler::with_rate(config.sample_rate), &config.stream)
    }

    pub fn sampler(&self) -> Sampler {
        self.sampler
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Emit `record` if it is sampled. Returns whether delivery was scheduled.
    ///
    /// Must be called from within a tokio runtime.
    pub fn emit(&self, record: RequestRecord) -> bool {
        if !self.sampler.should_sample() {
            return false;
        }

        let value = match serde_json::to_value(&record) {
            Ok(value) => value,
            Err(e) => {
                warn!(record_id = %record.id, "Failed to serialize request record: {}", e);
                return false;
            }
        };

        let collector = Arc::clone(&self.collector);
        let stream = Arc::clone(&self.stream);
        let record_id = record.id;
        tokio::spawn(async move {
            match collector.post(&stream, &value).await {
                Ok(()) => debug!(%record_id, stream = %stream, "Request record delivered"),
                Err(e) => warn!(%record_id, stream = %stream, "Failed to deliver request record: {}", e),
            }
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DispatchError;
    use std::time::Duration;
    use url::Url;

    struct FailingCollector;

    #[async_trait]
    impl TelemetryCollector for FailingCollector {
        async fn post(&self, _stream: &str, _record: &Value) -> Result<()> {
            Err(DispatchError::Telemetry("collector offline".to_string()))
        }
    }

    fn record() -> RequestRecord {
        let url = Url::parse("https://shop.example.com/products.json?page=2").unwrap();
        RequestRecord::begin(&url, "GET", Some("req-1")).complete(200, Duration::from_millis(12))
    }

    #[test]
    fn test_sampler_bounds() {
        assert!(Sampler::always().should_sample());
        assert!(!Sampler::never().should_sample());
        assert_eq!(Sampler::with_rate(4.0).rate(), 1.0);
        assert_eq!(Sampler::with_rate(-1.0).rate(), 0.0);
        assert_eq!(Sampler::with_rate(f64::NAN).rate(), 0.0);
        assert_eq!(Sampler::default().rate(), 0.1);
    }

    #[test]
    fn test_sampler_rate_is_roughly_honoured() {
        let sampler = Sampler::with_rate(0.1);
        let hits = (0..10_000).filter(|_| sampler.should_sample()).count();
        assert!((500..1_500).contains(&hits), "hits = {}", hits);
    }

    #[tokio::test]
    async fn test_sampled_record_reaches_collector() {
        let collector = Arc::new(BroadcastCollector::new(16));
        let mut rx = collector.subscribe();
        let sink = TelemetrySink::new(collector, Sampler::always(), "proxy_log");

        assert!(sink.emit(record()));

        let delivered = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivered.stream, "proxy_log");
        assert_eq!(delivered.record["status_code"], 200);
        assert_eq!(delivered.record["hostname"], "shop.example.com");
    }

    #[tokio::test]
    async fn test_unsampled_record_is_dropped() {
        let collector = Arc::new(BroadcastCollector::new(16));
        let mut rx = collector.subscribe();
        let sink = TelemetrySink::new(collector, Sampler::never(), "proxy_log");

        assert!(!sink.emit(record()));
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_collector_failure_is_swallowed() {
        let sink = TelemetrySink::new(Arc::new(FailingCollector), Sampler::always(), "proxy_log");
        assert!(sink.emit(record()));
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
