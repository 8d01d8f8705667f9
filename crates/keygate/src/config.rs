//! Keygate configuration.
//!
//! Configuration for the network manager, including:
//! - State store selection
//! - Interface-sync driver selection and worker pool sizing
//! - Expiration sweep interval
//! - Address allocator definitions
//! - The set of managed networks
//!
//! Every section has a `Default`, so the assembly code builds one explicit
//! default object and overlays the file on top of it.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{NmError, Result};
use crate::types::{Mode, NetConfig, is_file_safe};

/// State store selection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StateConfig {
    /// Registered store implementation name.
    #[serde(rename = "impl")]
    pub implementation: String,
    /// Directory for file-backed stores.
    pub path: Option<PathBuf>,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            implementation: "memory".to_string(),
            path: None,
        }
    }
}

/// Interface-sync driver selection and worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DriverConfig {
    /// Registered driver implementation name.
    #[serde(rename = "impl")]
    pub implementation: String,
    /// Output directory for file-rendering drivers.
    pub path: Option<PathBuf>,
    /// Number of concurrent sync workers.
    pub workers: usize,
    /// Capacity of the pending-sync queue.
    pub queue_depth: usize,
    /// Retries after the first failed attempt.
    pub max_retries: u32,
    /// Initial retry backoff in milliseconds; doubles per retry.
    pub retry_backoff_ms: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            implementation: "log".to_string(),
            path: None,
            workers: 2,
            queue_depth: 64,
            max_retries: 3,
            retry_backoff_ms: 500,
        }
    }
}

impl DriverConfig {
    /// Initial retry backoff.
    #[must_use]
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Expiration sweep settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExpiryConfig {
    /// Seconds between sweeps.
    pub interval_secs: u64,
    /// Whether lapsed schedules also deactivate or re-stage peers.
    pub enforce: bool,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            enforce: false,
        }
    }
}

impl ExpiryConfig {
    /// Sweep interval.
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// One named address allocator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddresserConfig {
    /// Registered allocator kind.
    pub kind: String,
    /// Pool to allocate from, in CIDR notation.
    pub cidr: String,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    /// State store.
    #[serde(default)]
    pub state: StateConfig,
    /// Interface-sync driver.
    #[serde(default)]
    pub driver: DriverConfig,
    /// Expiration sweep.
    #[serde(default)]
    pub expiry: ExpiryConfig,
    /// Address allocators by name.
    #[serde(default)]
    pub addressers: BTreeMap<String, AddresserConfig>,
    /// Managed networks.
    #[serde(default)]
    pub networks: Vec<NetConfig>,
}

impl Config {
    /// Load configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            NmError::Config(format!(
                "failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::from_json(&content)
    }

    /// Parse configuration from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is invalid or fails validation.
    pub fn from_json(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content)
            .map_err(|e| NmError::Config(format!("invalid JSON: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for net in &self.networks {
            if net.id.is_empty() {
                return Err(NmError::Config("network id cannot be empty".to_string()));
            }
            if !is_file_safe(&net.id) {
                return Err(NmError::Config(format!(
                    "network id '{}' cannot be used as a file name",
                    net.id.escape_debug()
                )));
            }
            if !seen.insert(net.id.as_str()) {
                return Err(NmError::Config(format!(
                    "duplicate network id '{}'",
                    net.id
                )));
            }
            net.approve_expiry()
                .and(net.activate_expiry())
                .map_err(|e| match e {
                    NmError::Config(msg) => NmError::Config(format!("network '{}': {msg}", net.id)),
                    other => other,
                })?;
        }

        if self.expiry.interval_secs == 0 {
            return Err(NmError::Config(
                "expiry.interval_secs must be greater than 0".to_string(),
            ));
        }

        if self.driver.workers == 0 {
            return Err(NmError::Config(
                "driver.workers must be greater than 0".to_string(),
            ));
        }

        if self.driver.queue_depth == 0 {
            return Err(NmError::Config(
                "driver.queue_depth must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// A sample configuration suitable for a first install.
    #[must_use]
    pub fn sample() -> Self {
        let mut addressers = BTreeMap::new();
        addressers.insert(
            "office-v4".to_string(),
            AddresserConfig {
                kind: "cidr-pool".to_string(),
                cidr: "10.40.0.0/24".to_string(),
            },
        );

        Self {
            state: StateConfig {
                implementation: "json".to_string(),
                path: Some(PathBuf::from("/var/lib/keygate")),
            },
            driver: DriverConfig {
                implementation: "wg-file".to_string(),
                path: Some(PathBuf::from("/etc/keygate/peers")),
                ..DriverConfig::default()
            },
            expiry: ExpiryConfig::default(),
            addressers,
            networks: vec![
                NetConfig::new("wg0", "office")
                    .with_approve_mode(Mode::Manual)
                    .with_activate_mode(Mode::Auto)
                    .with_activate_expiry_secs(86_400)
                    .with_hook("wireguard-key")
                    .with_addresser("office-v4"),
            ],
        }
    }

    /// Whether any network needs the expiration sweep.
    #[must_use]
    pub fn uses_expiry(&self) -> bool {
        self.networks.iter().any(NetConfig::uses_expiry)
    }
}
