//! A memory store whose writes can be made to fail, for tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use super::{MemoryStore, StateStore, StoreFactory};
use crate::config::StateConfig;
use crate::error::{NmError, Result};
use crate::types::NetState;

#[derive(Debug, Default)]
pub(crate) struct FlakyStore {
    inner: MemoryStore,
    fail_puts: AtomicBool,
}

impl FlakyStore {
    pub(crate) fn fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    /// A factory handing out this shared store.
    pub(crate) fn factory(store: &Arc<Self>) -> StoreFactory {
        let store = Arc::clone(store);
        Box::new(move |_: &StateConfig| Ok(Arc::clone(&store) as Arc<dyn StateStore>))
    }
}

#[async_trait]
impl StateStore for FlakyStore {
    async fn get(&self, network_id: &str) -> Result<NetState> {
        self.inner.get(network_id).await
    }

    async fn put(&self, network_id: &str, state: &NetState) -> Result<()> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(NmError::Internal(format!("write to {network_id} refused")));
        }
        self.inner.put(network_id, state).await
    }
}
