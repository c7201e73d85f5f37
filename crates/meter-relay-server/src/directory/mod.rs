//! Device directory: which meters have a reachable agent right now.

pub mod inventory;
pub mod snapshot;

pub use inventory::{
    refresh_once, spawn_refresh, FileInventory, HttpInventory, InventorySource, StaticInventory,
};
pub use snapshot::DeviceDirectory;
