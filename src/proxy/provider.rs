//! Proxy inventory providers
//!
//! A provider returns raw proxy records from some external source. Providers
//! never fail loudly on bad data: malformed records are skipped and an empty
//! body is simply an empty list.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use crate::config::ProviderConfig;
use crate::error::{DispatchError, Result};
use crate::models::Proxy;

/// Provider tag for Blazing Proxies records
pub const BLAZING_PROXIES: &str = "BP";

/// Provider tag for statically configured records
pub const STATIC_PROXIES: &str = "STATIC";

/// Source of proxy records
#[async_trait]
pub trait ProxyProvider: Send + Sync {
    /// Provider tag stamped onto every proxy it returns
    fn name(&self) -> &str;

    /// Fetch the current proxy list
    async fn fetch(&self) -> Result<Vec<Proxy>>;
}

/// Parse a newline- or comma-delimited list of `ip:port[:user:pass]` records
pub fn parse_proxy_list(body: &str, provider: &str) -> Vec<Proxy> {
    body.split(|c| c == '\n' || c == ',')
        .map(str::trim)
        .filter(|record| !record.is_empty())
        .filter_map(|record| match Proxy::parse(record, provider) {
            Ok(proxy) => Some(proxy),
            Err(e) => {
                debug!(provider, "Skipping proxy record: {}", e);
                None
            }
        })
        .collect()
}

/// Downloads the CSV export of a Blazing Proxies account
pub struct BlazingProxiesProvider {
    client: reqwest::Client,
    endpoint: Option<String>,
}

impl BlazingProxiesProvider {
    pub fn new(endpoint: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { client, endpoint })
    }

    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        Self::new(config.bp_endpoint())
    }
}

#[async_trait]
impl ProxyProvider for BlazingProxiesProvider {
    fn name(&self) -> &str {
        BLAZING_PROXIES
    }

    #[instrument(skip(self), fields(provider = BLAZING_PROXIES))]
    async fn fetch(&self) -> Result<Vec<Proxy>> {
        let Some(endpoint) = &self.endpoint else {
            info!("Blazing Proxies email or key were not provided. Not getting proxies from them.");
            return Ok(Vec::new());
        };

        let response = self
            .client
            .get(endpoint)
            .send()
            .await
            .map_err(|e| DispatchError::Provider(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DispatchError::Provider(format!(
                "unexpected status {}",
                status
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| DispatchError::Provider(format!("failed to read body: {}", e)))?;

        if body.trim().is_empty() {
            warn!("No data from Blazing Proxies endpoint");
            return Ok(Vec::new());
        }

        let proxies = parse_proxy_list(&body, BLAZING_PROXIES);
        info!(count = proxies.len(), "Fetched proxies from Blazing Proxies");
        Ok(proxies)
    }
}

/// Fixed proxy list, typically from configuration
pub struct StaticProvider {
    proxies: Vec<Proxy>,
}

impl StaticProvider {
    pub fn new(proxies: Vec<Proxy>) -> Self {
        Self { proxies }
    }

    pub fn from_records(records: &str) -> Self {
        Self::new(parse_proxy_list(records, STATIC_PROXIES))
    }
}

#[async_trait]
impl ProxyProvider for StaticProvider {
    fn name(&self) -> &str {
        STATIC_PROXIES
    }

    async fn fetch(&self) -> Result<Vec<Proxy>> {
        Ok(self.proxies.clone())
    }
}
