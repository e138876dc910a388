//! Background services

pub mod inventory_refresh;

pub use inventory_refresh::{InventoryRefresher, InventoryRefresherConfig, InventoryRefresherHandle};
