//! Per-endpoint leaky-bucket admission control
//!
//! Each upstream proxy endpoint gets its own bucket. A request either takes a
//! token immediately, reserves the next token that will accrue within the
//! configured maximum wait, or is rejected outright. Tokens are leased: the
//! dispatcher hands them back when the request finishes so concurrent
//! requests against one endpoint cannot collectively overrun its ceiling.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::config::RateLimitConfig;
use crate::error::{DispatchError, Result};

/// Leaky-bucket state for a single endpoint
#[derive(Debug, Clone)]
pub struct RateBucket {
    capacity: f64,
    tokens_per_sec: f64,
    tokens: f64,
    /// Tokens promised to callers that have not accrued yet
    reserved: u32,
    last_refill: Instant,
}

impl RateBucket {
    /// Full bucket
    pub fn new(config: &RateLimitConfig, now: Instant) -> Self {
        let capacity = config.burst.max(1) as f64;
        Self {
            capacity,
            tokens_per_sec: config.tokens_per_sec(),
            tokens: capacity,
            reserved: 0,
            last_refill: now,
        }
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    pub fn reserved(&self) -> u32 {
        self.reserved
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.last_refill = self.last_refill.max(now);
        self.tokens += elapsed.as_secs_f64() * self.tokens_per_sec;

        // Accrued tokens settle outstanding reservations first.
        while self.reserved > 0 && self.tokens >= 1.0 {
            self.tokens -= 1.0;
            self.reserved -= 1;
        }
        self.tokens = self.tokens.clamp(0.0, self.capacity);
    }

    /// Take a token. `Ok(delay)` means the token is ours once `delay` has
    /// passed; `Err(wait)` means it would take longer than `max_wait`.
    fn take(&mut self, now: Instant, max_wait: Duration) -> std::result::Result<Duration, Duration> {
        self.refill(now);

        if self.reserved == 0 && self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Ok(Duration::ZERO);
        }

        let deficit = self.reserved as f64 + 1.0 - self.tokens;
        let wait = Duration::from_secs_f64(deficit / self.tokens_per_sec);
        if wait > max_wait {
            return Err(wait);
        }

        self.reserved += 1;
        Ok(wait)
    }

    /// Give one unit back: cancel a reservation, else refund a token
    fn give_back(&mut self, now: Instant) {
        self.refill(now);
        if self.reserved > 0 {
            self.reserved -= 1;
        } else {
            self.tokens = (self.tokens + 1.0).min(self.capacity);
        }
    }
}

/// Leaky-bucket rate limiter keyed by endpoint string
#[derive(Debug)]
pub struct LeakyBucketLimiter {
    buckets: DashMap<String, RateBucket>,
    config: RateLimitConfig,
}

impl LeakyBucketLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            buckets: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// How long the caller must wait for its token on `endpoint`.
    ///
    /// Zero means a token was consumed right away. A positive delay means a
    /// future token has been reserved and must be handed back with
    /// [`return_token`](Self::return_token) if it is not used.
    pub fn get_delay(&self, endpoint: &str) -> Result<Duration> {
        self.get_delay_at(endpoint, Instant::now())
    }

    pub fn get_delay_at(&self, endpoint: &str, now: Instant) -> Result<Duration> {
        let mut bucket = self
            .buckets
            .entry(endpoint.to_string())
            .or_insert_with(|| RateBucket::new(&self.config, now));

        match bucket.take(now, self.config.max_wait) {
            Ok(delay) => {
                debug!(
                    endpoint = %redact_endpoint(endpoint),
                    delay_ms = delay.as_millis() as u64,
                    tokens = bucket.tokens(),
                    "Rate limit token taken"
                );
                Ok(delay)
            }
            Err(wait) => {
                let endpoint = redact_endpoint(endpoint);
                warn!(endpoint = %endpoint, wait_ms = wait.as_millis() as u64, "Endpoint saturated");
                Err(DispatchError::RateLimited {
                    endpoint,
                    wait_ms: wait.as_millis() as u64,
                })
            }
        }
    }

    /// Hand one unit of capacity back to `endpoint`
    pub fn return_token(&self, endpoint: &str) {
        self.return_token_at(endpoint, Instant::now());
    }

    pub fn return_token_at(&self, endpoint: &str, now: Instant) {
        if let Some(mut bucket) = self.buckets.get_mut(endpoint) {
            bucket.give_back(now);
        }
    }

    /// Take a token and wrap it in a lease that returns it on drop
    pub fn lease(self: &Arc<Self>, endpoint: &str) -> Result<RateLease> {
        let delay = self.get_delay(endpoint)?;
        Ok(RateLease {
            limiter: Arc::clone(self),
            endpoint: endpoint.to_string(),
            delay,
            returned: false,
        })
    }

    /// Snapshot of the bucket for `endpoint`
    pub fn bucket(&self, endpoint: &str) -> Option<RateBucket> {
        self.buckets.get(endpoint).map(|b| b.clone())
    }

    /// Number of endpoints with a bucket
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

/// A token taken from a bucket, returned exactly once
#[derive(Debug)]
pub struct RateLease {
    limiter: Arc<LeakyBucketLimiter>,
    endpoint: String,
    delay: Duration,
    returned: bool,
}

impl RateLease {
    /// Delay the limiter asked for when this token was taken
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Return the token now. Later calls and the drop are no-ops.
    pub fn release(&mut self) {
        if !self.returned {
            self.returned = true;
            self.limiter.return_token(&self.endpoint);
        }
    }
}

impl Drop for RateLease {
    fn drop(&mut self) {
        self.release();
    }
}

/// Strip credentials from an endpoint URL before it reaches logs or errors
pub fn redact_endpoint(endpoint: &str) -> String {
    match endpoint.rsplit_once('@') {
        Some((userinfo, host)) => match userinfo.split_once("://") {
            Some((scheme, _)) => format!("{}://{}", scheme, host),
            None => host.to_string(),
        },
        None => endpoint.to_string(),
    }
}
