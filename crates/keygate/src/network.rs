//! The network aggregate: one network's static config joined with its state.
//!
//! `Network` is rebuilt from the state store on every access and is never
//! persisted itself. The transitions here only touch in-memory state; the
//! manager wraps them with hooks, address assignment, persistence and sync.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::{NmError, Result};
use crate::types::{NetConfig, NetState, Peer};

/// One network's config and freshly loaded state.
#[derive(Debug, Clone)]
pub struct Network {
    config: Arc<NetConfig>,
    /// The mutable state loaded from the store.
    pub state: NetState,
}

/// Keys whose expiration schedule lapsed during one sweep of a network.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Lapsed {
    /// Keys whose approval schedule lapsed.
    pub approvals: Vec<String>,
    /// Keys whose activation schedule lapsed.
    pub activations: Vec<String>,
    /// Peers moved back to staging (enforcing sweeps only).
    pub restaged: Vec<Peer>,
    /// Whether the active set changed (enforcing sweeps only).
    pub active_changed: bool,
}

impl Lapsed {
    /// Returns true if nothing lapsed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.approvals.is_empty() && self.activations.is_empty()
    }
}

impl Network {
    /// Joins a config with a state.
    #[must_use]
    pub fn new(config: Arc<NetConfig>, state: NetState) -> Self {
        Self { config, state }
    }

    /// The static configuration.
    #[must_use]
    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    /// Network ID.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.config.id
    }

    /// Human-readable name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Consumes the network, returning its state.
    #[must_use]
    pub fn into_state(self) -> NetState {
        self.state
    }

    /// Stages a peer. Any addresses offered by the registrant are dropped;
    /// addresses are only ever assigned on approval.
    pub fn stage(&mut self, mut peer: Peer) {
        peer.addresses.clear();
        self.state.staged_peers.insert(peer.pub_key.clone(), peer);
    }

    /// Returns the staged peer with this key.
    ///
    /// # Errors
    ///
    /// Returns [`NmError::UnknownPeer`] if the key is not staged.
    pub fn staged(&self, key: &str) -> Result<&Peer> {
        self.state
            .staged_peers
            .get(key)
            .ok_or_else(|| NmError::unknown_peer(self.id(), key))
    }

    /// Returns the approved peer with this key.
    ///
    /// # Errors
    ///
    /// Returns [`NmError::UnknownPeer`] if the key is not approved.
    pub fn approved(&self, key: &str) -> Result<&Peer> {
        self.state
            .approved_peers
            .get(key)
            .ok_or_else(|| NmError::unknown_peer(self.id(), key))
    }

    /// Moves a configured peer from staged to approved and schedules its
    /// approval expiry if the network has one.
    ///
    /// # Errors
    ///
    /// Returns an error, leaving the state untouched, if the expiry
    /// deadline cannot be represented.
    pub fn approve(&mut self, peer: Peer, now: DateTime<Utc>) -> Result<()> {
        let deadline = deadline(now, self.config.approve_expiry()?)?;
        let key = peer.pub_key.clone();
        self.state.staged_peers.remove(&key);
        if let Some(at) = deadline {
            self.state.approval_expirations.insert(key.clone(), at);
        }
        self.state.approved_peers.insert(key, peer);
        Ok(())
    }

    /// Adds an approved peer to the active set and schedules its
    /// activation expiry if the network has one.
    ///
    /// # Errors
    ///
    /// Returns [`NmError::UnknownPeer`] if the key is not approved.
    pub fn activate(&mut self, key: &str, now: DateTime<Utc>) -> Result<()> {
        let peer = self.approved(key)?.clone();
        if let Some(at) = deadline(now, self.config.activate_expiry()?)? {
            self.state
                .activation_expirations
                .insert(key.to_string(), at);
        }
        self.state.active_peers.insert(key.to_string(), peer);
        Ok(())
    }

    /// Removes a key from the active set and its activation schedule.
    ///
    /// Returns true if the active set changed membership.
    pub fn deactivate(&mut self, key: &str) -> bool {
        self.state.activation_expirations.remove(key);
        self.state.active_peers.remove(key).is_some()
    }

    /// Removes a key from the approved set and its approval schedule,
    /// returning the removed peer.
    ///
    /// # Errors
    ///
    /// Returns [`NmError::UnknownPeer`] if the key is not approved.
    pub fn disapprove(&mut self, key: &str) -> Result<Peer> {
        let peer = self
            .state
            .approved_peers
            .remove(key)
            .ok_or_else(|| NmError::unknown_peer(self.id(), key))?;
        self.state.approval_expirations.remove(key);
        Ok(peer)
    }

    /// Drops every schedule entry whose timestamp is strictly before `now`.
    ///
    /// When `enforce` is set, lapsed activations also leave the active set
    /// and lapsed approvals go back to staging without their addresses.
    pub fn expire(&mut self, now: DateTime<Utc>, enforce: bool) -> Lapsed {
        let mut lapsed = Lapsed {
            approvals: lapsed_keys(&self.state.approval_expirations, now),
            activations: lapsed_keys(&self.state.activation_expirations, now),
            ..Lapsed::default()
        };

        for key in &lapsed.activations {
            self.state.activation_expirations.remove(key);
            if enforce && self.state.active_peers.remove(key).is_some() {
                lapsed.active_changed = true;
            }
        }

        for key in &lapsed.approvals {
            self.state.approval_expirations.remove(key);
            if !enforce {
                continue;
            }
            if let Some(peer) = self.state.approved_peers.remove(key) {
                if self.deactivate(key) {
                    lapsed.active_changed = true;
                }
                let mut staged = peer.clone();
                staged.addresses.clear();
                self.state.staged_peers.insert(key.clone(), staged);
                lapsed.restaged.push(peer);
            }
        }

        lapsed
    }
}

fn deadline(
    now: DateTime<Utc>,
    expiry: Option<chrono::Duration>,
) -> Result<Option<DateTime<Utc>>> {
    expiry
        .map(|expiry| {
            now.checked_add_signed(expiry).ok_or_else(|| {
                NmError::Internal(format!("expiry deadline {now} + {expiry} is out of range"))
            })
        })
        .transpose()
}

fn lapsed_keys(
    schedule: &std::collections::HashMap<String, DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Vec<String> {
    let mut keys: Vec<String> = schedule
        .iter()
        .filter(|(_, at)| now > **at)
        .map(|(key, _)| key.clone())
        .collect();
    keys.sort();
    keys
}

impl Deref for Network {
    type Target = NetState;

    fn deref(&self) -> &Self::Target {
        &self.state
    }
}

impl DerefMut for Network {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.state
    }
}
