use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;
use uuid::Uuid;

use super::Proxy;

/// One telemetry row describing a single dispatch attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub hostname: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pathname: Option<String>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<i32>,
    /// Runtime in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_vendor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_ip_addr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub data: Map<String, Value>,
}

impl RequestRecord {
    /// Start a record for a request to `url`
    pub fn begin(url: &Url, method: &str, correlation_id: Option<&str>) -> Self {
        let mut data = Map::new();

        let query: BTreeMap<String, String> = url.query_pairs().into_owned().collect();
        if !query.is_empty() {
            data.insert("query".to_string(), serde_json::json!(query));
        }

        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            hostname: url.host_str().unwrap_or_default().to_string(),
            pathname: Some(url.path().to_string()),
            method: method.to_string(),
            status_code: None,
            runtime: None,
            proxy_vendor: None,
            proxy_ip_addr: None,
            correlation_id: correlation_id.map(str::to_string),
            data,
        }
    }

    pub fn with_proxy(&mut self, proxy: &Proxy) {
        self.proxy_ip_addr = Some(proxy.address());
        self.proxy_vendor = Some(proxy.provider.clone());
    }

    pub fn with_request_headers(&mut self, headers: &HeaderMap) {
        self.data
            .insert("requestHeaders".to_string(), headers_to_json(headers));
    }

    pub fn with_response_headers(&mut self, headers: &HeaderMap) {
        self.data
            .insert("responseHeaders".to_string(), headers_to_json(headers));
    }

    pub fn with_response_body(&mut self, body: &[u8]) {
        self.data.insert(
            "responseBody".to_string(),
            Value::String(String::from_utf8_lossy(body).into_owned()),
        );
    }

    pub fn with_error(&mut self, error: impl std::fmt::Display) {
        self.data
            .insert("error".to_string(), Value::String(error.to_string()));
    }

    /// Stamp the outcome. The first status wins; later calls are ignored.
    pub fn complete(mut self, status_code: i32, runtime: Duration) -> Self {
        if self.status_code.is_none() {
            self.status_code = Some(status_code);
            self.runtime = Some(runtime.as_millis() as u64);
        }
        self
    }

    pub fn is_complete(&self) -> bool {
        self.status_code.is_some()
    }
}

fn headers_to_json(headers: &HeaderMap) -> Value {
    let mut map = Map::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        match map.get_mut(name.as_str()) {
            Some(Value::String(existing)) => {
                existing.push_str(", ");
                existing.push_str(&value);
            }
            _ => {
                map.insert(name.as_str().to_string(), Value::String(value));
            }
        }
    }
    Value::Object(map)
}
