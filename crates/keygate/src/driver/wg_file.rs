//! Driver that renders the active peer set as WireGuard `[Peer]` sections.
//!
//! The output, `<dir>/<network_id>.conf`, is suitable for `wg syncconf`.
//! Every call rewrites the whole file from the given state, so repeated
//! and stale calls converge.

use std::fmt::Write as _;
use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{info, warn};

use super::Driver;
use crate::config::DriverConfig;
use crate::error::{NmError, Result};
use crate::types::{NetState, Peer, is_file_safe};

/// Writes one peer file per network.
#[derive(Debug, Clone)]
pub struct WgFileDriver {
    dir: PathBuf,
}

impl WgFileDriver {
    /// Creates a driver writing into `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Creates a driver from the `driver` configuration section.
    ///
    /// # Errors
    ///
    /// Returns [`NmError::Config`] if no path is configured.
    pub fn from_config(config: &DriverConfig) -> Result<Self> {
        let dir = config.path.as_ref().ok_or_else(|| {
            NmError::Config("driver.path is required for the wg-file driver".to_string())
        })?;
        Self::new(dir)
    }

    /// Path of the file rendered for a network.
    ///
    /// # Errors
    ///
    /// Returns an error if the network ID could escape the directory.
    pub fn file_for(&self, network_id: &str) -> Result<PathBuf> {
        if !is_file_safe(network_id) {
            return Err(NmError::Internal(format!(
                "network id '{}' cannot be used as a file name",
                network_id.escape_debug()
            )));
        }
        Ok(self.dir.join(format!("{network_id}.conf")))
    }
}

/// Renders the active peers of `state`, sorted by key.
#[must_use]
pub fn render(network_id: &str, state: &NetState) -> String {
    let mut out = format!("# Peers for {network_id}, generated by keygate.\n");
    for peer in state.sorted_active_peers() {
        out.push('\n');
        render_peer(&mut out, peer);
    }
    out
}

fn render_peer(out: &mut String, peer: &Peer) {
    if peer.pub_key.is_empty() || peer.pub_key.chars().any(|c| c.is_whitespace() || c.is_control()) {
        warn!(peer = %peer.pub_key.escape_debug(), "Skipping peer with a malformed key");
        return;
    }
    out.push_str("[Peer]\n");
    for (key, value) in &peer.info {
        let _ = writeln!(out, "# {} = {}", single_line(key), single_line(value));
    }
    let _ = writeln!(out, "PublicKey = {}", peer.pub_key);
    if !peer.addresses.is_empty() {
        let allowed: Vec<String> = peer.addresses.iter().map(ToString::to_string).collect();
        let _ = writeln!(out, "AllowedIPs = {}", allowed.join(", "));
    }
}

/// Folds control characters to spaces so a value stays inside its comment.
fn single_line(text: &str) -> String {
    text.chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect()
}

#[async_trait]
impl Driver for WgFileDriver {
    async fn configure(&self, network_id: &str, state: &NetState) -> Result<()> {
        let path = self.file_for(network_id)?;
        let tmp = path.with_extension("conf.tmp");
        tokio::fs::write(&tmp, render(network_id, state)).await?;
        tokio::fs::rename(&tmp, &path).await?;
        info!(
            network = network_id,
            path = %path.display(),
            peers = state.active_peers.len(),
            "Wrote peer configuration"
        );
        Ok(())
    }
}
