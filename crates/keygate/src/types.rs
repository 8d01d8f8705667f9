//! Core data model: peers, network configuration, and network state.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::NmError;

/// A peer seeking or holding access to a network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// The peer's public key. Case-sensitive and unique per peer set.
    pub pub_key: String,
    /// Addresses assigned by the network's allocators.
    #[serde(default)]
    pub addresses: Vec<IpNet>,
    /// Free-form descriptive metadata.
    #[serde(default)]
    pub info: BTreeMap<String, String>,
}

impl Peer {
    /// Creates a peer with the given public key.
    #[must_use]
    pub fn new(pub_key: impl Into<String>) -> Self {
        Self {
            pub_key: pub_key.into(),
            addresses: Vec::new(),
            info: BTreeMap::new(),
        }
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn with_info(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.info.insert(key.into(), value.into());
        self
    }

    /// Adds an assigned address.
    #[must_use]
    pub fn with_address(mut self, address: IpNet) -> Self {
        self.addresses.push(address);
        self
    }

    /// Checks that the key and metadata are single-line text.
    ///
    /// # Errors
    ///
    /// Returns [`NmError::InvalidPeer`] for an empty key, a key containing
    /// whitespace or control characters, or metadata containing control
    /// characters.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.pub_key.is_empty() {
            return Err(NmError::InvalidPeer("public key is empty".to_string()));
        }
        if self
            .pub_key
            .chars()
            .any(|c| c.is_whitespace() || c.is_control())
        {
            return Err(NmError::InvalidPeer(
                "public key contains whitespace or control characters".to_string(),
            ));
        }
        for (key, value) in &self.info {
            if key.is_empty() || key.chars().chain(value.chars()).any(char::is_control) {
                return Err(NmError::InvalidPeer(format!(
                    "metadata entry '{}' is empty or contains control characters",
                    key.escape_debug()
                )));
            }
        }
        Ok(())
    }
}

/// Policy for approval and activation transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Mode {
    /// Transition happens immediately.
    Auto,
    /// Transition waits for an explicit request.
    #[default]
    Manual,
}

impl Mode {
    /// Returns true for [`Mode::Auto`].
    #[must_use]
    pub fn is_auto(self) -> bool {
        self == Self::Auto
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

impl FromStr for Mode {
    type Err = NmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "manual" => Ok(Self::Manual),
            other => Err(NmError::Config(format!("unknown mode '{other}'"))),
        }
    }
}

impl Serialize for Mode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Mode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Static configuration for one network, loaded once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetConfig {
    /// Globally unique network identifier (also the interface name).
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Whether registered peers are approved automatically.
    #[serde(default)]
    pub approve_mode: Mode,
    /// Whether approved peers are activated automatically.
    #[serde(default)]
    pub activate_mode: Mode,
    /// Lifetime of an approval in seconds; zero never expires.
    #[serde(default)]
    pub approve_expiry_secs: u64,
    /// Lifetime of an activation in seconds; zero never expires.
    #[serde(default)]
    pub activate_expiry_secs: u64,
    /// Hooks run, in order, against every registration.
    #[serde(default)]
    pub pre_approve_hooks: Vec<String>,
    /// Address allocators that assign addresses to approved peers.
    #[serde(default)]
    pub addressers: Vec<String>,
}

impl NetConfig {
    /// Creates a network config with manual modes and no expiry.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            approve_mode: Mode::Manual,
            activate_mode: Mode::Manual,
            approve_expiry_secs: 0,
            activate_expiry_secs: 0,
            pre_approve_hooks: Vec::new(),
            addressers: Vec::new(),
        }
    }

    /// Sets the approval mode.
    #[must_use]
    pub fn with_approve_mode(mut self, mode: Mode) -> Self {
        self.approve_mode = mode;
        self
    }

    /// Sets the activation mode.
    #[must_use]
    pub fn with_activate_mode(mut self, mode: Mode) -> Self {
        self.activate_mode = mode;
        self
    }

    /// Sets the approval expiry in seconds.
    #[must_use]
    pub fn with_approve_expiry_secs(mut self, secs: u64) -> Self {
        self.approve_expiry_secs = secs;
        self
    }

    /// Sets the activation expiry in seconds.
    #[must_use]
    pub fn with_activate_expiry_secs(mut self, secs: u64) -> Self {
        self.activate_expiry_secs = secs;
        self
    }

    /// Appends a pre-approval hook.
    #[must_use]
    pub fn with_hook(mut self, hook: impl Into<String>) -> Self {
        self.pre_approve_hooks.push(hook.into());
        self
    }

    /// Appends a required address allocator.
    #[must_use]
    pub fn with_addresser(mut self, addresser: impl Into<String>) -> Self {
        self.addressers.push(addresser.into());
        self
    }

    /// Approval lifetime, or `None` if approvals never expire.
    ///
    /// # Errors
    ///
    /// Returns [`NmError::Config`] if the lifetime exceeds [`MAX_EXPIRY_SECS`].
    pub fn approve_expiry(&self) -> crate::error::Result<Option<chrono::Duration>> {
        secs_to_duration("approve_expiry_secs", self.approve_expiry_secs)
    }

    /// Activation lifetime, or `None` if activations never expire.
    ///
    /// # Errors
    ///
    /// Returns [`NmError::Config`] if the lifetime exceeds [`MAX_EXPIRY_SECS`].
    pub fn activate_expiry(&self) -> crate::error::Result<Option<chrono::Duration>> {
        secs_to_duration("activate_expiry_secs", self.activate_expiry_secs)
    }

    /// Whether this network needs the expiration sweep at all.
    #[must_use]
    pub fn uses_expiry(&self) -> bool {
        self.approve_expiry_secs != 0 || self.activate_expiry_secs != 0
    }
}

/// Whether a network ID can name a file inside a directory: non-empty, not
/// hidden, and free of path separators and control characters.
pub(crate) fn is_file_safe(network_id: &str) -> bool {
    !network_id.is_empty()
        && !network_id.starts_with('.')
        && !network_id.contains(['/', '\\'])
        && !network_id.chars().any(char::is_control)
}

/// Longest approval or activation lifetime accepted, one hundred years.
pub const MAX_EXPIRY_SECS: u64 = 100 * 365 * 24 * 60 * 60;

fn secs_to_duration(field: &str, secs: u64) -> crate::error::Result<Option<chrono::Duration>> {
    if secs == 0 {
        return Ok(None);
    }
    if secs > MAX_EXPIRY_SECS {
        return Err(NmError::Config(format!(
            "{field} must be at most {MAX_EXPIRY_SECS}, got {secs}"
        )));
    }
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .map(Some)
        .ok_or_else(|| NmError::Config(format!("{field} is out of range: {secs}")))
}

/// Mutable, persisted state of one network.
///
/// A key may sit in more than one peer set at once: an active peer is
/// also approved.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetState {
    /// Registered peers awaiting approval.
    #[serde(default)]
    pub staged_peers: HashMap<String, Peer>,
    /// Approved peers, active or not.
    #[serde(default)]
    pub approved_peers: HashMap<String, Peer>,
    /// Peers currently applied to the interface.
    #[serde(default)]
    pub active_peers: HashMap<String, Peer>,
    /// When each approval becomes subject to expiry.
    #[serde(default)]
    pub approval_expirations: HashMap<String, DateTime<Utc>>,
    /// When each activation becomes subject to expiry.
    #[serde(default)]
    pub activation_expirations: HashMap<String, DateTime<Utc>>,
}

impl NetState {
    /// Creates an empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the active peers sorted by public key.
    #[must_use]
    pub fn sorted_active_peers(&self) -> Vec<&Peer> {
        let mut peers: Vec<&Peer> = self.active_peers.values().collect();
        peers.sort_by(|a, b| a.pub_key.cmp(&b.pub_key));
        peers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("auto", Mode::Auto ; "lowercase auto")]
    #[test_case("AUTO", Mode::Auto ; "uppercase auto")]
    #[test_case("Manual", Mode::Manual ; "mixed case manual")]
    fn test_mode_parse(raw: &str, expected: Mode) {
        assert_eq!(raw.parse::<Mode>().expect("parse"), expected);
    }

    #[test]
    fn test_mode_parse_rejects_unknown() {
        assert!("sometimes".parse::<Mode>().is_err());
    }

    #[test]
    fn test_mode_serde() {
        let json = serde_json::to_string(&Mode::Auto).expect("serialize");
        assert_eq!(json, "\"auto\"");
        let mode: Mode = serde_json::from_str("\"MANUAL\"").expect("deserialize");
        assert_eq!(mode, Mode::Manual);
    }

    #[test]
    fn test_net_config_defaults_from_json() {
        let config: NetConfig =
            serde_json::from_str(r#"{"id": "wg0", "name": "office"}"#).expect("parse");
        assert_eq!(config.approve_mode, Mode::Manual);
        assert_eq!(config.activate_mode, Mode::Manual);
        assert_eq!(config.approve_expiry().expect("in range"), None);
        assert_eq!(config.activate_expiry().expect("in range"), None);
        assert!(!config.uses_expiry());
    }

    #[test]
    fn test_net_config_expiry() {
        let config = NetConfig::new("wg0", "office").with_activate_expiry_secs(60);
        assert!(config.uses_expiry());
        assert_eq!(
            config.activate_expiry().expect("in range"),
            Some(chrono::Duration::seconds(60))
        );
    }

    #[test_case(MAX_EXPIRY_SECS + 1 ; "just past the limit")]
    #[test_case(10_000_000_000_000 ; "past the calendar")]
    #[test_case(u64::MAX ; "u64 max")]
    fn test_net_config_expiry_out_of_range(secs: u64) {
        let config = NetConfig::new("wg0", "office")
            .with_approve_expiry_secs(secs)
            .with_activate_expiry_secs(secs);
        assert!(matches!(config.approve_expiry(), Err(NmError::Config(_))));
        assert!(matches!(config.activate_expiry(), Err(NmError::Config(_))));
    }

    #[test]
    fn test_peer_validate() {
        Peer::new("pk1").with_info("owner", "alice bob").validate().expect("valid");

        let injected = Peer::new("good=").with_info(
            "owner",
            "x\n\n[Peer]\nPublicKey = EVIL=\nAllowedIPs = 0.0.0.0/0",
        );
        assert!(matches!(injected.validate(), Err(NmError::InvalidPeer(_))));

        for key in ["", "pk 1", "pk1\r", "pk1\n[Peer]"] {
            assert!(Peer::new(key).validate().is_err(), "key {key:?}");
        }
        assert!(Peer::new("pk1").with_info("a\nb", "v").validate().is_err());
        assert!(Peer::new("pk1").with_info("", "v").validate().is_err());
    }

    #[test]
    fn test_sorted_active_peers() {
        let mut state = NetState::new();
        for key in ["c", "a", "b"] {
            state.active_peers.insert(key.to_string(), Peer::new(key));
        }
        let keys: Vec<&str> = state
            .sorted_active_peers()
            .iter()
            .map(|p| p.pub_key.as_str())
            .collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }
}
