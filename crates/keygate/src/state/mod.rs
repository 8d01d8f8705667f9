//! Persistent state stores.
//!
//! A store gives get/put access to one network's [`NetState`], keyed by
//! network ID. `get` on an unseen network returns an empty state.

#[cfg(test)]
pub(crate) mod flaky;
mod json;
mod memory;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::StateConfig;
use crate::error::Result;
use crate::registry::Registry;
use crate::types::NetState;

pub use json::JsonStore;
pub use memory::MemoryStore;

/// Trait for network state storage backends.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads a network's state, creating an empty one if absent.
    async fn get(&self, network_id: &str) -> Result<NetState>;

    /// Stores a network's state, replacing what was there.
    async fn put(&self, network_id: &str, state: &NetState) -> Result<()>;
}

/// Constructs a store from its configuration section.
pub type StoreFactory = Box<dyn Fn(&StateConfig) -> Result<Arc<dyn StateStore>> + Send + Sync>;

/// Registers the built-in stores.
///
/// # Errors
///
/// Returns an error if a built-in name is already taken.
pub fn register_builtin(registry: &mut Registry<StoreFactory>) -> Result<()> {
    registry.register(
        "memory",
        Box::new(|_: &StateConfig| Ok(Arc::new(MemoryStore::new()) as Arc<dyn StateStore>)),
    )?;
    registry.register(
        "json",
        Box::new(|config: &StateConfig| {
            let store = JsonStore::from_config(config)?;
            Ok(Arc::new(store) as Arc<dyn StateStore>)
        }),
    )?;
    Ok(())
}
