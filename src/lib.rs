//! Rota Fetch - proxied HTTP dispatcher
//!
//! Sends outbound HTTP requests through a rotating pool of upstream proxies.
//!
//! ## Features
//!
//! - Proxy inventory cached in a shared store and loaded from a provider
//! - Sticky proxy and user-agent selection by client key
//! - Per-proxy leaky-bucket rate limiting
//! - Bounded concurrency with a capped wait queue
//! - Hard request timeouts
//! - Sampled, fire-and-forget request telemetry

pub mod cache;
pub mod config;
pub mod error;
pub mod models;
pub mod proxy;
pub mod services;
pub mod telemetry;

pub use config::Config;
pub use error::{DispatchError, Result};
pub use proxy::{DispatchRequest, DispatchResponse, Dispatcher};
