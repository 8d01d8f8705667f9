//! Pre-approval hooks.
//!
//! Hooks run in the order a network lists them against every registration.
//! The first rejection aborts the registration.

use std::sync::Arc;

use crate::error::{NmError, Result};
use crate::registry::Registry;
use crate::types::Peer;

/// A check run against a candidate peer before it is staged.
pub trait PreApproveHook: Send + Sync {
    /// Accepts or rejects the peer for the given network.
    fn check(&self, network_id: &str, peer: &Peer) -> Result<()>;
}

/// Shared handle to a hook.
pub type HookRef = Arc<dyn PreApproveHook>;

/// Size of a WireGuard public key in bytes.
const WIREGUARD_KEY_LEN: usize = 32;

/// Rejects keys that are not base64-encoded 32-byte WireGuard keys.
#[derive(Debug, Clone, Copy, Default)]
pub struct WireGuardKeyHook;

impl PreApproveHook for WireGuardKeyHook {
    fn check(&self, _network_id: &str, peer: &Peer) -> Result<()> {
        use base64::Engine;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(&peer.pub_key)
            .map_err(|e| reject("wireguard-key", format!("invalid base64: {e}")))?;
        if decoded.len() != WIREGUARD_KEY_LEN {
            return Err(reject(
                "wireguard-key",
                format!("expected {WIREGUARD_KEY_LEN} bytes, got {}", decoded.len()),
            ));
        }
        Ok(())
    }
}

/// Requires a non-empty `owner` entry in the peer's metadata.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequireOwnerHook;

impl PreApproveHook for RequireOwnerHook {
    fn check(&self, _network_id: &str, peer: &Peer) -> Result<()> {
        match peer.info.get("owner") {
            Some(owner) if !owner.trim().is_empty() => Ok(()),
            _ => Err(reject("require-owner", "peer has no owner".to_string())),
        }
    }
}

fn reject(hook: &str, reason: String) -> NmError {
    NmError::Rejected {
        hook: hook.to_string(),
        reason,
    }
}

/// Registers the built-in hooks.
///
/// # Errors
///
/// Returns an error if a built-in name is already taken.
pub fn register_builtin(registry: &mut Registry<HookRef>) -> Result<()> {
    registry.register("wireguard-key", Arc::new(WireGuardKeyHook) as HookRef)?;
    registry.register("require-owner", Arc::new(RequireOwnerHook) as HookRef)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID_KEY: &str = "xTIBA5rboUvnH4htodjb6e697QjLERt1NAB4mZqp8Dg=";

    #[test]
    fn test_wireguard_key_accepts_valid_key() {
        WireGuardKeyHook
            .check("wg0", &Peer::new(VALID_KEY))
            .expect("valid key");
    }

    #[test]
    fn test_wireguard_key_rejects_garbage() {
        let err = WireGuardKeyHook
            .check("wg0", &Peer::new("not base64!"))
            .expect_err("garbage");
        assert!(matches!(err, NmError::Rejected { ref hook, .. } if hook == "wireguard-key"));
    }

    #[test]
    fn test_wireguard_key_rejects_short_key() {
        assert!(WireGuardKeyHook.check("wg0", &Peer::new("AAAA")).is_err());
    }

    #[test]
    fn test_require_owner() {
        assert!(RequireOwnerHook.check("wg0", &Peer::new("pk1")).is_err());
        assert!(
            RequireOwnerHook
                .check("wg0", &Peer::new("pk1").with_info("owner", " "))
                .is_err()
        );
        RequireOwnerHook
            .check("wg0", &Peer::new("pk1").with_info("owner", "alice"))
            .expect("owner present");
    }
}
