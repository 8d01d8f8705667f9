//! A fake driver for testing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::Driver;
use crate::error::{NmError, Result};
use crate::types::NetState;

#[derive(Debug, Default)]
struct FakeDriverData {
    /// Every successful configure call, in order.
    applied: Vec<(String, NetState)>,
    /// Total configure calls, including failed ones.
    attempts: usize,
    /// Remaining calls that should fail.
    failures_left: usize,
    /// How long each configure call takes.
    delay: Duration,
}

/// Records every configure call; can be told to fail.
#[derive(Debug, Clone, Default)]
pub struct FakeDriver {
    data: Arc<Mutex<FakeDriverData>>,
}

impl FakeDriver {
    /// Creates a fake driver that always succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` configure calls fail.
    #[must_use]
    pub fn failing(self, count: usize) -> Self {
        self.data.lock().failures_left = count;
        self
    }

    /// Makes every configure call take `delay` before it resolves.
    #[must_use]
    pub fn with_delay(self, delay: Duration) -> Self {
        self.data.lock().delay = delay;
        self
    }

    /// Number of successful configure calls.
    #[must_use]
    pub fn applied_count(&self) -> usize {
        self.data.lock().applied.len()
    }

    /// Number of configure calls, successful or not.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.data.lock().attempts
    }

    /// The last state successfully applied to a network.
    #[must_use]
    pub fn last_applied(&self, network_id: &str) -> Option<NetState> {
        self.data
            .lock()
            .applied
            .iter()
            .rev()
            .find(|(id, _)| id == network_id)
            .map(|(_, state)| state.clone())
    }

    /// Successful configure calls per network.
    #[must_use]
    pub fn applied_per_network(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for (id, _) in &self.data.lock().applied {
            *counts.entry(id.clone()).or_insert(0) += 1;
        }
        counts
    }
}

#[async_trait]
impl Driver for FakeDriver {
    async fn configure(&self, network_id: &str, state: &NetState) -> Result<()> {
        let delay = self.data.lock().delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut data = self.data.lock();
        data.attempts += 1;
        if data.failures_left > 0 {
            data.failures_left -= 1;
            return Err(NmError::Internal(format!(
                "simulated failure configuring {network_id}"
            )));
        }
        data.applied.push((network_id.to_string(), state.clone()));
        Ok(())
    }
}
