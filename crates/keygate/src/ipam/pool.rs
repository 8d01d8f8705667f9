//! Sequential IPv4 allocation inside a CIDR.
//!
//! Hosts are handed out in order starting after the network address,
//! skipping the broadcast address. Once the end is reached allocation
//! wraps around to reuse released addresses.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};

use ipnet::{IpNet, Ipv4Net};
use parking_lot::Mutex;
use tracing::debug;

use super::Addresser;
use crate::error::{NmError, Result};

/// Errors that can occur during address allocation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AllocationError {
    /// No more addresses available in the pool.
    #[error("no addresses available in pool {pool}")]
    PoolExhausted {
        /// The pool that ran out of addresses.
        pool: String,
    },
    /// The address is not in the managed pool.
    #[error("address {ip} is not in pool {pool}")]
    NotInPool {
        /// The pool that was asked.
        pool: String,
        /// The address that was not found.
        ip: IpAddr,
    },
    /// The address was already allocated.
    #[error("address {ip} is already allocated")]
    AlreadyAllocated {
        /// The address that was already allocated.
        ip: IpAddr,
    },
    /// Invalid CIDR configuration.
    #[error("invalid CIDR: {message}")]
    InvalidCidr {
        /// Description of the error.
        message: String,
    },
}

impl From<AllocationError> for NmError {
    fn from(err: AllocationError) -> Self {
        match err {
            AllocationError::PoolExhausted { pool } => Self::AddressExhausted(pool),
            AllocationError::InvalidCidr { message } => Self::Config(message),
            other => Self::Internal(other.to_string()),
        }
    }
}

#[derive(Debug)]
struct PoolState {
    /// Allocated addresses and who holds them.
    allocated: HashMap<Ipv4Addr, String>,
    /// Next address to try allocating.
    next_candidate: u32,
}

/// Allocator for host addresses from a single IPv4 CIDR.
#[derive(Debug)]
pub struct CidrPool {
    name: String,
    cidr: Ipv4Net,
    state: Mutex<PoolState>,
}

impl CidrPool {
    /// Creates a pool over `cidr`.
    ///
    /// # Errors
    ///
    /// Returns an error if the prefix leaves no usable host addresses.
    pub fn new(name: impl Into<String>, cidr: Ipv4Net) -> std::result::Result<Self, AllocationError> {
        if cidr.prefix_len() > 30 {
            return Err(AllocationError::InvalidCidr {
                message: format!("{cidr} has no usable host addresses"),
            });
        }
        let cidr = cidr.trunc();
        // Start after network address
        let start = u32::from(cidr.network()) + 1;
        Ok(Self {
            name: name.into(),
            cidr,
            state: Mutex::new(PoolState {
                allocated: HashMap::new(),
                next_candidate: start,
            }),
        })
    }

    /// Parses `cidr` and creates a pool over it.
    ///
    /// # Errors
    ///
    /// Returns an error if the CIDR is not a usable IPv4 network.
    pub fn from_cidr(name: &str, cidr: &str) -> std::result::Result<Self, AllocationError> {
        let net: Ipv4Net = cidr.parse().map_err(|e| AllocationError::InvalidCidr {
            message: format!("pool {name}: '{cidr}': {e}"),
        })?;
        Self::new(name, net)
    }

    /// The pool's network.
    #[must_use]
    pub fn cidr(&self) -> Ipv4Net {
        self.cidr
    }

    /// Number of addresses still available.
    #[must_use]
    pub fn available_count(&self) -> usize {
        let total = self.cidr.hosts().count();
        total.saturating_sub(self.state.lock().allocated.len())
    }

    fn allocate(&self, owner: String) -> Option<Ipv4Addr> {
        let network = u32::from(self.cidr.network());
        let broadcast = u32::from(self.cidr.broadcast());
        let mut state = self.state.lock();

        // Try from next_candidate to broadcast, then wrap around
        let first = state.next_candidate..broadcast;
        let second = network + 1..state.next_candidate;
        for candidate in first.chain(second) {
            let ip = Ipv4Addr::from(candidate);
            if !state.allocated.contains_key(&ip) {
                state.allocated.insert(ip, owner);
                state.next_candidate = candidate + 1;
                return Some(ip);
            }
        }

        None
    }

    fn host_in_pool(&self, address: IpAddr) -> Option<Ipv4Addr> {
        let IpAddr::V4(ip) = address else {
            return None;
        };
        let is_host = ip != self.cidr.network() && ip != self.cidr.broadcast();
        (self.cidr.contains(&ip) && is_host).then_some(ip)
    }
}

impl Addresser for CidrPool {
    fn assign(&self, network_id: &str, pub_key: &str) -> Result<IpNet> {
        let ip = self
            .allocate(format!("{network_id}/{pub_key}"))
            .ok_or_else(|| AllocationError::PoolExhausted {
                pool: self.name.clone(),
            })?;
        debug!(pool = %self.name, ip = %ip, network = network_id, "assigned address");
        Ok(IpNet::from(IpAddr::V4(ip)))
    }

    fn reserve(&self, address: IpAddr) -> Result<()> {
        let ip = self.host_in_pool(address).ok_or_else(|| AllocationError::NotInPool {
            pool: self.name.clone(),
            ip: address,
        })?;
        let mut state = self.state.lock();
        if state.allocated.contains_key(&ip) {
            return Err(AllocationError::AlreadyAllocated { ip: address }.into());
        }
        state.allocated.insert(ip, "reserved".to_string());
        Ok(())
    }

    fn release(&self, address: IpAddr) -> bool {
        let Some(ip) = self.host_in_pool(address) else {
            return false;
        };
        self.state.lock().allocated.remove(&ip).is_some()
    }

    fn contains(&self, address: IpAddr) -> bool {
        self.host_in_pool(address).is_some()
    }
}
