//! Outbound request pipeline
//!
//! - Proxy inventory loaded from a shared cache or a provider
//! - Sticky and random proxy/user-agent rotation
//! - Per-endpoint leaky-bucket rate limiting
//! - Bounded concurrency pool
//! - Dispatcher tying the above together under a hard timeout

pub mod dispatcher;
pub mod inventory;
pub mod pool;
pub mod provider;
pub mod rate_limit;
pub mod rotation;
pub mod transport;

pub use dispatcher::{DispatchRequest, DispatchResponse, Dispatcher, DispatcherStats, RequestOptions};
pub use inventory::{InventorySnapshot, InventorySource, ProxyInventory};
pub use pool::{ConcurrencyPool, PoolPermit};
pub use provider::{parse_proxy_list, BlazingProxiesProvider, ProxyProvider, StaticProvider};
pub use rate_limit::{LeakyBucketLimiter, RateBucket, RateLease};
pub use rotation::{key_hash, select_user_agent, Rotation};
pub use transport::{HttpTransport, OutboundRequest, ReqwestTransport, TransportResponse};
