use thiserror::Error;

/// Why the concurrency pool refused to hand out a permit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolRejection {
    /// The wait queue was already at its depth limit
    QueueFull,
    /// No permit became free within the acquisition timeout
    AcquireTimeout,
}

impl std::fmt::Display for PoolRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolRejection::QueueFull => write!(f, "wait queue is full"),
            PoolRejection::AcquireTimeout => write!(f, "timed out waiting for a permit"),
        }
    }
}

/// Unified error type for the dispatcher and its collaborators
#[derive(Error, Debug)]
pub enum DispatchError {
    // Dispatch outcomes
    #[error("Concurrency pool exhausted: {0}")]
    PoolExhausted(PoolRejection),

    #[error("No proxies available")]
    ProxyUnavailable,

    #[error("Rate limit exceeded for {endpoint} (next token in {wait_ms}ms)")]
    RateLimited { endpoint: String, wait_ms: u64 },

    #[error("Request has reached the max request time: {after_ms}ms. Forcing abort")]
    Timeout { after_ms: u64 },

    #[error("Transport error: {0}")]
    Transport(String),

    // Collaborator errors
    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Proxy provider error: {0}")]
    Provider(String),

    #[error("Telemetry error: {0}")]
    Telemetry(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Request errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid proxy address: {0}")]
    InvalidProxyAddress(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for dispatcher operations
pub type Result<T> = std::result::Result<T, DispatchError>;

impl DispatchError {
    /// Synthetic status code written into telemetry records for this failure
    pub fn status_marker(&self) -> i32 {
        match self {
            DispatchError::PoolExhausted(_) => -509,
            DispatchError::ProxyUnavailable => -412,
            DispatchError::RateLimited { .. } => -429,
            DispatchError::Timeout { .. } => -408,
            DispatchError::Transport(_) => -502,
            _ => -500,
        }
    }

    /// Whether a caller may reasonably try the same request again later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DispatchError::PoolExhausted(_)
                | DispatchError::ProxyUnavailable
                | DispatchError::RateLimited { .. }
                | DispatchError::Timeout { .. }
        )
    }
}

impl From<reqwest::Error> for DispatchError {
    fn from(err: reqwest::Error) -> Self {
        DispatchError::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_marker_mapping() {
        assert_eq!(
            DispatchError::PoolExhausted(PoolRejection::QueueFull).status_marker(),
            -509
        );
        assert_eq!(DispatchError::ProxyUnavailable.status_marker(), -412);
        assert_eq!(
            DispatchError::RateLimited {
                endpoint: "http://1.2.3.4:8080".to_string(),
                wait_ms: 500
            }
            .status_marker(),
            -429
        );
        assert_eq!(DispatchError::Timeout { after_ms: 10 }.status_marker(), -408);
        assert_eq!(
            DispatchError::Transport("reset".to_string()).status_marker(),
            -502
        );
        assert_eq!(
            DispatchError::InvalidConfig("bad".to_string()).status_marker(),
            -500
        );
    }

    #[test]
    fn test_retryable_helpers() {
        assert!(DispatchError::ProxyUnavailable.is_retryable());
        assert!(DispatchError::Timeout { after_ms: 10 }.is_retryable());
        assert!(!DispatchError::Transport("dns".to_string()).is_retryable());
        assert!(!DispatchError::InvalidRequest("bad".to_string()).is_retryable());
    }

    #[test]
    fn test_timeout_message_mentions_limit() {
        let err = DispatchError::Timeout { after_ms: 10000 };
        assert_eq!(
            err.to_string(),
            "Request has reached the max request time: 10000ms. Forcing abort"
        );
    }
}
