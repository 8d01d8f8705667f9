//! Process-local state store.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::StateStore;
use crate::error::Result;
use crate::types::NetState;

/// In-memory store; state is lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryStore {
    networks: RwLock<HashMap<String, NetState>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of networks that have been written.
    #[must_use]
    pub fn len(&self) -> usize {
        self.networks.read().len()
    }

    /// Returns true if nothing has been written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.networks.read().is_empty()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, network_id: &str) -> Result<NetState> {
        Ok(self
            .networks
            .read()
            .get(network_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn put(&self, network_id: &str, state: &NetState) -> Result<()> {
        self.networks
            .write()
            .insert(network_id.to_string(), state.clone());
        Ok(())
    }
}
