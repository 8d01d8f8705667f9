//! Driver that only logs the desired peer set.

use async_trait::async_trait;
use tracing::info;

use super::Driver;
use crate::error::Result;
use crate::types::NetState;

/// Logs what would be configured. Useful for dry runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogDriver;

#[async_trait]
impl Driver for LogDriver {
    async fn configure(&self, network_id: &str, state: &NetState) -> Result<()> {
        let peers: Vec<&str> = state
            .sorted_active_peers()
            .iter()
            .map(|p| p.pub_key.as_str())
            .collect();
        info!(network = network_id, active = peers.len(), ?peers, "Configuring interface");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_log_driver_accepts_any_state() {
        LogDriver
            .configure("wg0", &NetState::new())
            .await
            .expect("configure");
    }
}
