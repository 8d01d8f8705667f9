//! JSON file-backed state store.
//!
//! Each network is kept in `<dir>/<network_id>.json`. Writes go to a
//! temporary file first and are renamed into place.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use super::StateStore;
use crate::config::StateConfig;
use crate::error::{NmError, Result};
use crate::types::{NetState, is_file_safe};

/// Store that snapshots each network to its own JSON file.
#[derive(Debug, Clone)]
pub struct JsonStore {
    dir: PathBuf,
}

impl JsonStore {
    /// Creates a store rooted at `dir`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| {
            NmError::Internal(format!(
                "failed to create state directory '{}': {e}",
                dir.display()
            ))
        })?;
        Ok(Self { dir })
    }

    /// Creates a store from the `state` configuration section.
    ///
    /// # Errors
    ///
    /// Returns [`NmError::Config`] if no path is configured.
    pub fn from_config(config: &StateConfig) -> Result<Self> {
        let dir = config
            .path
            .as_ref()
            .ok_or_else(|| NmError::Config("state.path is required for the json store".to_string()))?;
        Self::new(dir)
    }

    /// The directory holding the snapshots.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_for(&self, network_id: &str) -> Result<PathBuf> {
        if !is_file_safe(network_id) {
            return Err(NmError::Internal(format!(
                "network id '{network_id}' cannot be used as a file name"
            )));
        }
        Ok(self.dir.join(format!("{network_id}.json")))
    }
}

#[async_trait]
impl StateStore for JsonStore {
    async fn get(&self, network_id: &str) -> Result<NetState> {
        let path = self.file_for(network_id)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(network = network_id, "no state on disk, starting empty");
                Ok(NetState::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, network_id: &str, state: &NetState) -> Result<()> {
        let path = self.file_for(network_id)?;
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(state)?;
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(network = network_id, path = %path.display(), "stored network state");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Peer;
    use chrono::Utc;

    #[tokio::test]
    async fn test_get_missing_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonStore::new(dir.path()).expect("store");
        assert_eq!(store.get("wg0").await.expect("get"), NetState::new());
    }

    #[tokio::test]
    async fn test_round_trip_across_instances() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut state = NetState::new();
        let peer = Peer::new("pk1")
            .with_info("owner", "alice")
            .with_address("10.0.0.2/32".parse().expect("cidr"));
        state.approved_peers.insert("pk1".to_string(), peer.clone());
        state.active_peers.insert("pk1".to_string(), peer);
        state.activation_expirations.insert("pk1".to_string(), Utc::now());

        JsonStore::new(dir.path())
            .expect("store")
            .put("wg0", &state)
            .await
            .expect("put");

        let reopened = JsonStore::new(dir.path()).expect("reopen");
        assert_eq!(reopened.get("wg0").await.expect("get"), state);
        assert!(!dir.path().join("wg0.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_rejects_path_like_ids() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonStore::new(dir.path()).expect("store");
        assert!(store.get("../etc").await.is_err());
        assert!(store.put("a/b", &NetState::new()).await.is_err());
    }

    #[test]
    fn test_from_config_requires_path() {
        let config = StateConfig {
            implementation: "json".to_string(),
            path: None,
        };
        assert!(matches!(
            JsonStore::from_config(&config),
            Err(NmError::Config(_))
        ));
    }
}
