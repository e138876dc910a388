//! Inventory refresh service
//!
//! Periodically reloads the proxy inventory from its provider once the
//! snapshot has outlived the cache expiry.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::proxy::ProxyInventory;

/// Inventory refresher configuration
#[derive(Debug, Clone)]
pub struct InventoryRefresherConfig {
    /// How often to check the snapshot
    pub check_interval: Duration,
    /// Refresh even when the snapshot is still fresh
    pub force: bool,
}

impl Default for InventoryRefresherConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(300),
            force: false,
        }
    }
}

/// Background refresher for a [`ProxyInventory`]
pub struct InventoryRefresher {
    inventory: ProxyInventory,
    config: InventoryRefresherConfig,
}

impl InventoryRefresher {
    pub fn new(inventory: ProxyInventory, config: InventoryRefresherConfig) -> Self {
        Self { inventory, config }
    }

    /// Run until `shutdown` flips to `true`
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting inventory refresher (interval: {}s)",
            self.config.check_interval.as_secs()
        );

        let mut ticker = interval(self.config.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.refresh_if_needed().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Inventory refresher shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Refresh when stale (or always, if forced). Returns whether a reload ran.
    pub async fn refresh_if_needed(&self) -> bool {
        if !self.config.force && !self.inventory.is_stale() {
            debug!("Proxy inventory is fresh");
            return false;
        }

        match self.inventory.refresh().await {
            Ok(count) => info!(count, "Proxy inventory refreshed"),
            Err(e) => warn!("Proxy inventory refresh failed: {}", e),
        }
        true
    }
}

/// Handle for stopping the refresher
pub struct InventoryRefresherHandle {
    shutdown_tx: watch::Sender<bool>,
}

impl InventoryRefresherHandle {
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { shutdown_tx: tx }, rx)
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Default for InventoryRefresherHandle {
    fn default() -> Self {
        Self::new().0
    }
}
