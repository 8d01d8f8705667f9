//! Address allocators.
//!
//! An allocator hands out host addresses to approved peers. Networks name
//! the allocators they require; each configured allocator name maps to a
//! registered allocator kind and is built once at startup.

mod pool;

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;

use crate::config::AddresserConfig;
use crate::error::Result;
use crate::registry::Registry;

pub use pool::{AllocationError, CidrPool};

/// Trait for address allocators.
pub trait Addresser: Send + Sync + fmt::Debug {
    /// Assigns a fresh host address to a peer of a network.
    fn assign(&self, network_id: &str, pub_key: &str) -> Result<IpNet>;

    /// Marks an address as in use, e.g. one restored from persisted state.
    fn reserve(&self, address: IpAddr) -> Result<()>;

    /// Returns an address to the pool. Returns true if it was allocated.
    fn release(&self, address: IpAddr) -> bool;

    /// Whether the address belongs to this allocator's pool.
    fn contains(&self, address: IpAddr) -> bool;
}

/// Constructs an allocator from its name and configuration entry.
pub type AddresserFactory =
    Box<dyn Fn(&str, &AddresserConfig) -> Result<Arc<dyn Addresser>> + Send + Sync>;

/// Registers the built-in allocator kinds.
///
/// # Errors
///
/// Returns an error if a built-in name is already taken.
pub fn register_builtin(registry: &mut Registry<AddresserFactory>) -> Result<()> {
    registry.register(
        "cidr-pool",
        Box::new(|name: &str, config: &AddresserConfig| {
            let pool = CidrPool::from_cidr(name, &config.cidr)?;
            Ok(Arc::new(pool) as Arc<dyn Addresser>)
        }),
    )
}
