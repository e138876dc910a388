use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{DispatchError, Result};

/// Status value providers report for a usable proxy
pub const STATUS_ONLINE: &str = "online";

/// One upstream egress point.
///
/// The serialized form is the shape stored in the shared cache, so field names
/// and the string-encoded port must stay stable across releases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proxy {
    #[serde(rename = "proxy_ip")]
    pub host: String,
    #[serde(rename = "proxy_status")]
    pub status: String,
    #[serde(
        rename = "proxy_port",
        serialize_with = "port_as_string",
        deserialize_with = "port_from_string_or_number"
    )]
    pub port: u16,
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    password: Option<String>,
}

impl Proxy {
    /// Create an online proxy without credentials
    pub fn new(host: impl Into<String>, port: u16, provider: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            status: STATUS_ONLINE.to_string(),
            port,
            provider: provider.into(),
            username: None,
            password: None,
        }
    }

    /// Attach credentials. Both halves are required.
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Parse one `host:port[:username:password]` record
    pub fn parse(record: &str, provider: &str) -> Result<Self> {
        let record = record.trim();
        let mut parts = record.split(':');

        let host = parts
            .next()
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .ok_or_else(|| DispatchError::InvalidProxyAddress(format!("missing host in '{}'", record)))?;

        let port = parts
            .next()
            .map(str::trim)
            .ok_or_else(|| DispatchError::InvalidProxyAddress(format!("missing port in '{}'", record)))?
            .parse::<u16>()
            .map_err(|e| DispatchError::InvalidProxyAddress(format!("bad port in '{}': {}", record, e)))?;

        if port == 0 {
            return Err(DispatchError::InvalidProxyAddress(format!(
                "port must be non-zero in '{}'",
                record
            )));
        }

        let proxy = Proxy::new(host, port, provider);

        let username = parts.next().map(str::trim).filter(|s| !s.is_empty());
        let password = parts.next().map(str::trim).filter(|s| !s.is_empty());

        Ok(match (username, password) {
            (Some(user), Some(pass)) => proxy.with_credentials(user, pass),
            _ => proxy,
        })
    }

    /// `host:port`
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Credentials, only when both halves are present
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => Some((user.as_str(), pass.as_str())),
            _ => None,
        }
    }

    pub fn is_online(&self) -> bool {
        self.status.eq_ignore_ascii_case(STATUS_ONLINE)
    }

    /// Proxy URL with optional authentication. Also used as the rate-limit key.
    pub fn url(&self) -> String {
        match self.credentials() {
            Some((user, pass)) => format!("http://{}:{}@{}", user, pass, self.address()),
            None => format!("http://{}", self.address()),
        }
    }

    /// Drop half-present credentials after decoding untrusted data
    pub(crate) fn normalized(mut self) -> Self {
        if self.credentials().is_none() {
            self.username = None;
            self.password = None;
        }
        self
    }
}

impl std::fmt::Display for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.address(), self.provider)
    }
}

fn port_as_string<S: Serializer>(port: &u16, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&port.to_string())
}

fn port_from_string_or_number<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<u16, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawPort {
        Text(String),
        Number(u16),
    }

    match RawPort::deserialize(deserializer)? {
        RawPort::Number(port) => Ok(port),
        RawPort::Text(text) => text.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// Encode a proxy list into the cache wire format
pub fn encode_proxies(proxies: &[Proxy]) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(proxies)?)
}

/// Decode a proxy list from the cache wire format
pub fn decode_proxies(bytes: &[u8]) -> Result<Vec<Proxy>> {
    let proxies: Vec<Proxy> = serde_json::from_slice(bytes)?;
    Ok(proxies.into_iter().map(Proxy::normalized).collect())
}
