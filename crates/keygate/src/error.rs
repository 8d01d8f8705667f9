//! Error types for keygate.

use thiserror::Error;

/// Errors returned by network manager operations and its collaborators.
#[derive(Debug, Error)]
pub enum NmError {
    /// A hook was requested by configuration but is not installed.
    #[error("no hook with that name is known: {0}")]
    UnknownHook(String),

    /// A network with an unknown ID was requested.
    #[error("no network with that ID exists: {0}")]
    UnknownNetwork(String),

    /// The peer is not present in the set the operation requires.
    #[error("no peer with key '{key}' is known in network '{network}'")]
    UnknownPeer {
        /// Network the lookup ran against.
        network: String,
        /// The public key that was not found.
        key: String,
    },

    /// The requested state store is not registered.
    #[error("no store with that name is known: {0}")]
    UnknownStore(String),

    /// The requested address allocator is not registered or not in service.
    #[error("no addresser with that name is known: {0}")]
    UnknownAddresser(String),

    /// The requested interface-sync driver is not registered.
    #[error("no driver with that name is known: {0}")]
    UnknownDriver(String),

    /// A name was registered twice in the same registry.
    #[error("{kind} '{name}' is already registered")]
    DuplicateName {
        /// Which registry rejected the name.
        kind: &'static str,
        /// The duplicate name.
        name: String,
    },

    /// A pre-approval hook rejected the peer.
    #[error("hook '{hook}' rejected peer: {reason}")]
    Rejected {
        /// Name of the rejecting hook.
        hook: String,
        /// Human-readable reason.
        reason: String,
    },

    /// The peer's key or metadata is malformed.
    #[error("invalid peer: {0}")]
    InvalidPeer(String),

    /// An address allocator has no addresses left.
    #[error("address pool '{0}' is exhausted")]
    AddressExhausted(String),

    /// Configuration is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// Something fundamentally unexpected happened.
    #[error("internal error: {0}")]
    Internal(String),
}

impl NmError {
    /// Convenience constructor for [`NmError::UnknownPeer`].
    pub fn unknown_peer(network: impl Into<String>, key: impl Into<String>) -> Self {
        Self::UnknownPeer {
            network: network.into(),
            key: key.into(),
        }
    }
}

impl From<std::io::Error> for NmError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(format!("io: {err}"))
    }
}

impl From<serde_json::Error> for NmError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("serialization: {err}"))
    }
}

/// Result type for keygate operations.
pub type Result<T> = std::result::Result<T, NmError>;
