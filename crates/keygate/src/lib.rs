//! Peer admission for WireGuard overlays.
//!
//! Keygate decides which peers may be configured into each overlay network
//! and when. Peers register, pass the network's pre-approval hooks, are
//! staged, approved (manually or automatically) and activated; the active
//! set is handed to a pluggable interface driver. A background sweep drops
//! lapsed approval and activation schedules.
//!
//! Storage, address allocation, interface programming and pre-approval
//! checks are pluggable and selected by name through [`Registries`].

#![forbid(unsafe_code)]

pub mod config;
pub mod driver;
pub mod error;
pub mod expiry;
pub mod hooks;
pub mod ipam;
pub mod manager;
pub mod network;
pub mod registry;
pub mod state;
pub mod types;

pub use config::Config;
pub use error::{NmError, Result};
pub use expiry::{ExpiryHandle, ExpiryReport};
pub use manager::NetworkManager;
pub use network::Network;
pub use registry::{Registries, Registry};
pub use types::{Mode, NetConfig, NetState, Peer};
