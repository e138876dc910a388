//! Request dispatcher
//!
//! One dispatch runs as a straight pipeline: take a concurrency permit,
//! compose headers, resolve a proxy and its rate-limit token, send under a
//! hard deadline, classify the outcome. The permit and the token are RAII
//! guards, so every early return gives them back. Each attempt produces
//! exactly one telemetry record, which is then sampled.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CACHE_CONTROL, USER_AGENT};
use http::{HeaderMap, Method, StatusCode};
use tracing::{debug, instrument, warn};
use url::Url;

use crate::config::{Config, DispatcherConfig};
use crate::error::{DispatchError, Result};
use crate::models::{Proxy, RequestRecord};
use crate::proxy::inventory::ProxyInventory;
use crate::proxy::pool::ConcurrencyPool;
use crate::proxy::rate_limit::{redact_endpoint, LeakyBucketLimiter, RateLease};
use crate::proxy::rotation::select_user_agent;
use crate::proxy::transport::{HttpTransport, OutboundRequest, TransportResponse};
use crate::telemetry::TelemetrySink;

/// Per-request options
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Merged over the defaults; these win on conflict
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    /// Overrides the dispatcher's request timeout
    pub timeout: Option<Duration>,
}

/// A request to dispatch
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub uri: String,
    pub method: Method,
    pub use_proxy: bool,
    pub options: RequestOptions,
    /// Stickiness key binding the caller to one proxy and user-agent
    pub key: Option<String>,
    pub correlation_id: Option<String>,
}

impl DispatchRequest {
    pub fn new(method: Method, uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            method,
            use_proxy: true,
            options: RequestOptions::default(),
            key: None,
            correlation_id: None,
        }
    }

    pub fn get(uri: impl Into<String>) -> Self {
        Self::new(Method::GET, uri)
    }

    /// Send without a proxy
    pub fn direct(mut self) -> Self {
        self.use_proxy = false;
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.options.headers.insert(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.options.body = Some(body.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = Some(timeout);
        self
    }
}

/// Upstream response handed back to the caller
#[derive(Debug, Clone)]
pub struct DispatchResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Proxy the request went through
    pub proxy: Option<Proxy>,
}

/// Point-in-time view of dispatcher resources
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherStats {
    pub permits_in_use: usize,
    pub permits_capacity: usize,
    pub waiting: usize,
    pub proxies: usize,
    pub rate_buckets: usize,
}

/// Outbound HTTP dispatcher
pub struct Dispatcher {
    pool: ConcurrencyPool,
    limiter: Arc<LeakyBucketLimiter>,
    inventory: ProxyInventory,
    transport: Arc<dyn HttpTransport>,
    telemetry: TelemetrySink,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        config: &Config,
        inventory: ProxyInventory,
        transport: Arc<dyn HttpTransport>,
        telemetry: TelemetrySink,
    ) -> Self {
        Self {
            pool: ConcurrencyPool::new(config.pool.clone()),
            limiter: Arc::new(LeakyBucketLimiter::new(config.rate_limit.clone())),
            inventory,
            transport,
            telemetry,
            config: config.dispatcher.clone(),
        }
    }

    pub fn inventory(&self) -> &ProxyInventory {
        &self.inventory
    }

    pub fn limiter(&self) -> &Arc<LeakyBucketLimiter> {
        &self.limiter
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            permits_in_use: self.pool.in_use(),
            permits_capacity: self.pool.capacity(),
            waiting: self.pool.waiting(),
            proxies: self.inventory.len(),
            rate_buckets: self.limiter.bucket_count(),
        }
    }

    /// Dispatch one request.
    ///
    /// Non-2xx responses are returned as `Ok`; only failures to get a
    /// response at all are errors.
    #[instrument(skip(self, request), fields(method = %request.method, uri = %request.uri, proxied = request.use_proxy))]
    pub async fn request(&self, request: DispatchRequest) -> Result<DispatchResponse> {
        let url = Url::parse(&request.uri)?;
        let started = Instant::now();
        let mut record = RequestRecord::begin(
            &url,
            request.method.as_str(),
            request.correlation_id.as_deref(),
        );

        let result = self.dispatch(request, url, &mut record).await;

        let record = match &result {
            Ok(response) => record.complete(i32::from(response.status.as_u16()), started.elapsed()),
            Err(e) => {
                debug!(status_marker = e.status_marker(), "Dispatch failed: {}", e);
                record.with_error(e);
                record.complete(e.status_marker(), started.elapsed())
            }
        };
        self.telemetry.emit(record);

        result
    }

    async fn dispatch(
        &self,
        request: DispatchRequest,
        url: Url,
        record: &mut RequestRecord,
    ) -> Result<DispatchResponse> {
        let DispatchRequest {
            method,
            use_proxy,
            options,
            key,
            ..
        } = request;

        let mut permit = self.pool.acquire().await?;

        let headers = compose_headers(key.as_deref(), options.headers);
        record.with_request_headers(&headers);

        let (proxy, mut lease) = if use_proxy {
            let proxy = self.resolve_proxy(key.as_deref()).await?;
            record.with_proxy(&proxy);
            let lease = self.admit(&proxy)?;
            (Some(proxy), Some(lease))
        } else {
            (None, None)
        };

        let timeout = options.timeout.unwrap_or(self.config.request_timeout);
        let outbound = OutboundRequest {
            url,
            method,
            headers,
            body: options.body,
            proxy: proxy.clone(),
        };
        let outcome = tokio::time::timeout(timeout, self.transport.send(outbound)).await;

        if let Some(lease) = lease.as_mut() {
            lease.release();
        }
        permit.release();

        let response = match outcome {
            Ok(result) => result?,
            Err(_) => {
                let after_ms = timeout.as_millis() as u64;
                warn!(after_ms, "Request has reached the max request time. Forcing abort");
                return Err(DispatchError::Timeout { after_ms });
            }
        };

        Ok(self.classify(response, proxy, record))
    }

    async fn resolve_proxy(&self, key: Option<&str>) -> Result<Proxy> {
        self.inventory.ensure_loaded().await?;
        self.inventory.select(key).ok_or(DispatchError::ProxyUnavailable)
    }

    /// Take the endpoint's token; anything short of an immediate token is a rejection
    fn admit(&self, proxy: &Proxy) -> Result<RateLease> {
        let endpoint = proxy.url();
        let lease = self.limiter.lease(&endpoint)?;
        if lease.delay().is_zero() {
            return Ok(lease);
        }

        let wait_ms = lease.delay().as_millis() as u64;
        // Dropping the lease cancels the reservation.
        drop(lease);
        Err(DispatchError::RateLimited {
            endpoint: redact_endpoint(&endpoint),
            wait_ms,
        })
    }

    fn classify(
        &self,
        response: TransportResponse,
        proxy: Option<Proxy>,
        record: &mut RequestRecord,
    ) -> DispatchResponse {
        record.with_response_headers(&response.headers);
        if !response.status.is_success() {
            debug!(status = response.status.as_u16(), "Upstream returned an error status");
            record.with_response_body(&response.body);
        }

        DispatchResponse {
            status: response.status,
            headers: response.headers,
            body: response.body,
            proxy,
        }
    }
}

/// Default headers with the caller's merged over them
fn compose_headers(key: Option<&str>, overrides: HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(select_user_agent(key)));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.extend(overrides);
    headers
}
