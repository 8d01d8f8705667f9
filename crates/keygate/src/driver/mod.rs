//! Interface-sync drivers.
//!
//! A driver reconciles a real interface to a network's full desired state.
//! It is always handed the complete state, never a diff, and must tolerate
//! repeated or stale calls.

mod fake;
mod log;
mod sync;
mod wg_file;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::DriverConfig;
use crate::error::Result;
use crate::registry::Registry;
use crate::types::NetState;

pub use fake::FakeDriver;
pub use log::LogDriver;
pub use sync::{SyncDispatcher, SyncReport, SyncStatus};
pub use wg_file::WgFileDriver;

/// Trait for interface-sync drivers.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Reconciles the interface named `network_id` to `state`.
    async fn configure(&self, network_id: &str, state: &NetState) -> Result<()>;
}

/// Constructs a driver from its configuration section.
pub type DriverFactory = Box<dyn Fn(&DriverConfig) -> Result<Arc<dyn Driver>> + Send + Sync>;

/// Registers the built-in drivers.
///
/// # Errors
///
/// Returns an error if a built-in name is already taken.
pub fn register_builtin(registry: &mut Registry<DriverFactory>) -> Result<()> {
    registry.register(
        "log",
        Box::new(|_: &DriverConfig| Ok(Arc::new(LogDriver) as Arc<dyn Driver>)),
    )?;
    registry.register(
        "wg-file",
        Box::new(|config: &DriverConfig| {
            let driver = WgFileDriver::from_config(config)?;
            Ok(Arc::new(driver) as Arc<dyn Driver>)
        }),
    )?;
    Ok(())
}
