//! Outbound HTTP transport
//!
//! Sends a single request either directly or through an upstream proxy.
//! Timeouts are not enforced here; the dispatcher owns the deadline.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use http::{HeaderMap, Method, StatusCode};
use tracing::{debug, instrument};
use url::Url;

use crate::error::{DispatchError, Result};
use crate::models::Proxy;

const DIRECT: &str = "direct";
const MAX_REDIRECTS: usize = 10;

/// A fully prepared request
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    /// Upstream proxy to route through; `None` goes direct
    pub proxy: Option<Proxy>,
}

/// Upstream response with the body fully read
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Performs the actual network exchange
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: OutboundRequest) -> Result<TransportResponse>;
}

/// reqwest-backed transport. Keeps one connection-pooling client per
/// upstream proxy so connections are reused across requests.
pub struct ReqwestTransport {
    clients: DashMap<String, reqwest::Client>,
    connect_timeout: Duration,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self::with_connect_timeout(Duration::from_secs(10))
    }

    pub fn with_connect_timeout(connect_timeout: Duration) -> Self {
        Self {
            clients: DashMap::new(),
            connect_timeout,
        }
    }

    fn client_for(&self, proxy: Option<&Proxy>) -> Result<reqwest::Client> {
        let key = proxy.map(Proxy::url).unwrap_or_else(|| DIRECT.to_string());
        if let Some(client) = self.clients.get(&key) {
            return Ok(client.clone());
        }

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .connect_timeout(self.connect_timeout)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS));

        if let Some(proxy) = proxy {
            let mut upstream = reqwest::Proxy::all(format!("http://{}", proxy.address()))
                .map_err(|e| DispatchError::InvalidProxyAddress(e.to_string()))?;
            if let Some((username, password)) = proxy.credentials() {
                upstream = upstream.basic_auth(username, password);
            }
            builder = builder.proxy(upstream);
        } else {
            builder = builder.no_proxy();
        }

        let client = builder.build()?;
        debug!(proxy = proxy.map(|p| p.address()).as_deref().unwrap_or(DIRECT), "Built HTTP client");
        self.clients.insert(key, client.clone());
        Ok(client)
    }

    /// Number of cached clients
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    #[instrument(skip(self, request), fields(method = %request.method, host = request.url.host_str().unwrap_or_default()))]
    async fn send(&self, request: OutboundRequest) -> Result<TransportResponse> {
        let client = self.client_for(request.proxy.as_ref())?;

        let mut builder = client
            .request(request.method, request.url)
            .headers(request.headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;

        debug!(status = status.as_u16(), bytes = body.len(), "Upstream responded");
        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{HeaderValue, USER_AGENT};
    use wiremock::matchers::{body_string, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(url: &str) -> OutboundRequest {
        OutboundRequest {
            url: Url::parse(url).unwrap(),
            method: Method::GET,
            headers: HeaderMap::new(),
            body: None,
            proxy: None,
        }
    }

    #[tokio::test]
    async fn test_direct_request_returns_status_headers_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/products.json"))
            .and(header("user-agent", "test-agent"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("x-shop", "demo")
                    .set_body_string("{\"products\":[]}"),
            )
            .mount(&server)
            .await;

        let mut req = request(&format!("{}/products.json", server.uri()));
        req.headers
            .insert(USER_AGENT, HeaderValue::from_static("test-agent"));

        let transport = ReqwestTransport::new();
        let response = transport.send(req).await.unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.headers.get("x-shop").unwrap(), "demo");
        assert_eq!(&response.body[..], b"{\"products\":[]}");
    }

    #[tokio::test]
    async fn test_request_body_is_sent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string("payload"))
            .respond_with(ResponseTemplate::new(201))
            .mount(&server)
            .await;

        let mut req = request(&server.uri());
        req.method = Method::POST;
        req.body = Some(Bytes::from_static(b"payload"));

        let response = ReqwestTransport::new().send(req).await.unwrap();
        assert_eq!(response.status, StatusCode::CREATED);
    }

    #[tokio::test]
    async fn test_error_status_is_not_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_string("missing"))
            .mount(&server)
            .await;

        let response = ReqwestTransport::new()
            .send(request(&server.uri()))
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::NOT_FOUND);
        assert_eq!(&response.body[..], b"missing");
    }

    #[tokio::test]
    async fn test_proxied_request_carries_proxy_credentials() {
        let upstream = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("proxy-authorization", "Basic dXNlcjpwYXNz"))
            .respond_with(ResponseTemplate::new(200).set_body_string("via proxy"))
            .mount(&upstream)
            .await;

        let addr = upstream.address();
        let proxy = Proxy::new(addr.ip().to_string(), addr.port(), "BP").with_credentials("user", "pass");

        let mut req = request("http://shop.example.test/products.json");
        req.proxy = Some(proxy);

        let response = ReqwestTransport::new().send(req).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(&response.body[..], b"via proxy");
    }

    #[tokio::test]
    async fn test_clients_are_cached_per_proxy() {
        let transport = ReqwestTransport::new();
        let a = Proxy::new("1.2.3.4", 8080, "BP").with_credentials("user", "pass");
        let b = Proxy::new("5.6.7.8", 8080, "BP");

        transport.client_for(None).unwrap();
        transport.client_for(Some(&a)).unwrap();
        transport.client_for(Some(&a)).unwrap();
        transport.client_for(Some(&b)).unwrap();

        assert_eq!(transport.client_count(), 3);
    }

    #[tokio::test]
    async fn test_connection_failure_is_transport_error() {
        let transport = ReqwestTransport::with_connect_timeout(Duration::from_millis(200));
        let err = transport
            .send(request("http://127.0.0.1:1/"))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Transport(_)));
    }
}
