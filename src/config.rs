use crate::error::{DispatchError, Result};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Default export URL for the Blazing Proxies list
pub const DEFAULT_BP_ENDPOINT_TEMPLATE: &str =
    "https://blazingseollc.com/proxy/dashboard/api/export/4/all/{email}/{key}/list.csv";

/// Application configuration loaded from environment variables
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Dispatcher configuration
    pub dispatcher: DispatcherConfig,
    /// Concurrency pool configuration
    pub pool: PoolConfig,
    /// Per-endpoint rate limiting
    pub rate_limit: RateLimitConfig,
    /// Proxy inventory caching
    pub inventory: InventoryConfig,
    /// Proxy provider credentials
    pub provider: ProviderConfig,
    /// Telemetry sampling and delivery
    pub telemetry: TelemetryConfig,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Hard deadline for a single upstream request (default: 10s)
    pub request_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(10_000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum concurrent in-flight requests (default: 8)
    pub max_concurrency: usize,
    /// Maximum callers queued for a permit (default: 128)
    pub max_waiting: usize,
    /// How long a caller may wait for a permit (default: 10s)
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            max_waiting: 128,
            acquire_timeout: Duration::from_millis(10_000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Bucket capacity (default: 40)
    pub burst: u32,
    /// Tokens added per interval (default: 2)
    pub refill: u32,
    /// Refill interval (default: 1s)
    pub interval: Duration,
    /// Longest delay that is still admitted (default: 8s)
    pub max_wait: Duration,
}

impl RateLimitConfig {
    /// Sustained refill rate in tokens per second
    pub fn tokens_per_sec(&self) -> f64 {
        let interval = self.interval.as_secs_f64().max(0.001);
        self.refill.max(1) as f64 / interval
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            burst: 40,
            refill: 2,
            interval: Duration::from_secs(1),
            max_wait: Duration::from_millis(8_000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InventoryConfig {
    /// Key the proxy list is stored under in the shared cache
    pub cache_key: String,
    /// Expiry for the cached list and the local snapshot (default: 1h)
    pub cache_ttl: Duration,
    /// Background refresh interval, `None` disables the refresher
    pub refresh_interval: Option<Duration>,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            cache_key: "proxies".to_string(),
            cache_ttl: Duration::from_secs(3600),
            refresh_interval: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Blazing Proxies account email
    pub bp_email: Option<String>,
    /// Blazing Proxies API key
    pub bp_key: Option<String>,
    /// Export URL with `{email}` and `{key}` placeholders
    pub bp_endpoint_template: String,
    /// Static `ip:port[:user:pass]` records used instead of a remote provider
    pub static_proxies: Option<String>,
}

impl ProviderConfig {
    /// Export URL with credentials filled in, if both are configured
    pub fn bp_endpoint(&self) -> Option<String> {
        match (&self.bp_email, &self.bp_key) {
            (Some(email), Some(key)) => Some(
                self.bp_endpoint_template
                    .replace("{email}", email)
                    .replace("{key}", key),
            ),
            _ => None,
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            bp_email: None,
            bp_key: None,
            bp_endpoint_template: DEFAULT_BP_ENDPOINT_TEMPLATE.to_string(),
            static_proxies: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Stream name records are tagged with
    pub stream: String,
    /// Probability that a record is emitted (default: 0.1)
    pub sample_rate: f64,
    /// Collector URL; records are only logged when unset
    pub endpoint: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            stream: "proxy_log".to_string(),
            sample_rate: 0.1,
            endpoint: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let refresh_secs: u64 = parse_env("INVENTORY_REFRESH_INTERVAL_SECS", "0")?;
        let sample_rate: f64 = parse_env("TELEMETRY_SAMPLE_RATE", "0.1")?;
        if !(0.0..=1.0).contains(&sample_rate) {
            return Err(DispatchError::InvalidConfig(
                "TELEMETRY_SAMPLE_RATE must be between 0 and 1".into(),
            ));
        }

        let max_concurrency: usize = parse_env("DISPATCH_MAX_CONCURRENCY", "8")?;
        if max_concurrency == 0 {
            return Err(DispatchError::InvalidConfig(
                "DISPATCH_MAX_CONCURRENCY must be at least 1".into(),
            ));
        }

        Ok(Config {
            dispatcher: DispatcherConfig {
                request_timeout: Duration::from_millis(parse_env("MAX_FETCH_REQUEST_TIME", "10000")?),
            },
            pool: PoolConfig {
                max_concurrency,
                max_waiting: parse_env("DISPATCH_MAX_WAITING", "128")?,
                acquire_timeout: Duration::from_millis(parse_env(
                    "DISPATCH_ACQUIRE_TIMEOUT_MS",
                    "10000",
                )?),
            },
            rate_limit: RateLimitConfig {
                burst: parse_env("RATE_LIMIT_BURST", "40")?,
                refill: parse_env("RATE_LIMIT_REFILL", "2")?,
                interval: Duration::from_millis(parse_env("RATE_LIMIT_INTERVAL_MS", "1000")?),
                max_wait: Duration::from_millis(parse_env("RATE_LIMIT_MAX_WAIT_MS", "8000")?),
            },
            inventory: InventoryConfig {
                cache_key: get_env_or("PROXY_CACHE_KEY", "proxies"),
                cache_ttl: Duration::from_secs(parse_env("PROXY_CACHE_TTL_SECS", "3600")?),
                refresh_interval: (refresh_secs > 0).then(|| Duration::from_secs(refresh_secs)),
            },
            provider: ProviderConfig {
                bp_email: get_env_opt("BP_EMAIL"),
                bp_key: get_env_opt("BP_KEY"),
                bp_endpoint_template: get_env_or("BP_ENDPOINT_TEMPLATE", DEFAULT_BP_ENDPOINT_TEMPLATE),
                static_proxies: get_env_opt("PROXY_LIST"),
            },
            telemetry: TelemetryConfig {
                stream: get_env_or("TELEMETRY_STREAM", "proxy_log"),
                sample_rate,
                endpoint: get_env_opt("TELEMETRY_ENDPOINT"),
            },
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "json"),
            },
        })
    }
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Get a non-blank environment variable
fn get_env_opt(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_env<T: FromStr>(key: &str, default: &str) -> Result<T> {
    get_env_or(key, default)
        .trim()
        .parse()
        .map_err(|_| DispatchError::InvalidConfig(format!("{} must be a valid number", key)))
}
