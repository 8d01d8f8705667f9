//! Expiration sweep.
//!
//! A single background task wakes on a fixed interval and drops lapsed
//! approval and activation schedule entries from every network. Each
//! network is processed under its lock and persisted once per pass.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::error::Result;
use crate::manager::{ManagedNetwork, NetworkManager};
use crate::network::Lapsed;

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpiryReport {
    /// Lapsed entries per network; networks with nothing lapsed are absent.
    pub networks: BTreeMap<String, Lapsed>,
    /// Networks that could not be processed, with the error.
    pub errors: Vec<(String, String)>,
}

impl ExpiryReport {
    /// Total lapsed schedule entries across all networks.
    #[must_use]
    pub fn lapsed_count(&self) -> usize {
        self.networks
            .values()
            .map(|l| l.approvals.len() + l.activations.len())
            .sum()
    }
}

impl NetworkManager {
    /// Runs one sweep at the current time.
    pub async fn process_expirations(&self) -> ExpiryReport {
        self.process_expirations_at(Utc::now()).await
    }

    /// Runs one sweep as if the time were `now`.
    ///
    /// A failure on one network is logged and recorded; the sweep carries
    /// on with the next.
    pub async fn process_expirations_at(&self, now: DateTime<Utc>) -> ExpiryReport {
        let mut report = ExpiryReport::default();
        for (id, managed) in &self.networks {
            match self.expire_network(managed, now).await {
                Ok(lapsed) if lapsed.is_empty() => {}
                Ok(lapsed) => {
                    report.networks.insert(id.clone(), lapsed);
                }
                Err(e) => {
                    warn!(network = %id, error = %e, "Expiration sweep failed for network");
                    report.errors.push((id.clone(), e.to_string()));
                }
            }
        }
        report
    }

    /// Runs a sweep now, then hands the manager to the periodic task.
    ///
    /// Returns `None` without doing anything if no network uses expiry.
    pub async fn start_expiry(self: &Arc<Self>) -> Option<ExpiryHandle> {
        if !self.uses_expiry() {
            info!("No network uses expiry, not starting the expiration timer");
            return None;
        }
        self.process_expirations().await;
        Some(spawn_expiry_task(Arc::clone(self), self.expiry.interval()))
    }

    async fn expire_network(&self, managed: &ManagedNetwork, now: DateTime<Utc>) -> Result<Lapsed> {
        let _guard = managed.lock.lock().await;
        let mut net = self.load(managed).await?;
        let enforce = self.expiry.enforce;

        let lapsed = net.expire(now, enforce);
        for key in &lapsed.approvals {
            if enforce {
                info!(network = %net.name(), peer = %key, "Approval has expired, peer is being staged");
            } else {
                info!(network = %net.name(), peer = %key, "Approval has expired");
            }
        }
        for key in &lapsed.activations {
            if enforce {
                info!(network = %net.name(), peer = %key, "Activation has expired, peer is being deactivated");
            } else {
                info!(network = %net.name(), peer = %key, "Activation has expired");
            }
        }
        self.store_net(&net).await?;
        for peer in &lapsed.restaged {
            self.deconfigure_peer(peer);
        }

        if lapsed.active_changed {
            self.dispatch_sync(&net).await;
        }
        Ok(lapsed)
    }
}

/// Handle for controlling the expiration task.
#[derive(Debug)]
pub struct ExpiryHandle {
    running: Arc<AtomicBool>,
    passes: Arc<AtomicU64>,
    stop: Arc<Notify>,
}

impl ExpiryHandle {
    fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            passes: Arc::new(AtomicU64::new(0)),
            stop: Arc::new(Notify::new()),
        }
    }

    /// Check if the expiration task is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Periodic sweeps completed so far.
    #[must_use]
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::SeqCst)
    }

    /// Stop the expiration task.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.stop.notify_one();
    }
}

/// Start the periodic expiration task.
///
/// The first sweep happens one `interval` after the call.
pub fn spawn_expiry_task(manager: Arc<NetworkManager>, interval: Duration) -> ExpiryHandle {
    let handle = ExpiryHandle::new();
    handle.running.store(true, Ordering::SeqCst);

    let running = Arc::clone(&handle.running);
    let passes = Arc::clone(&handle.passes);
    let stop = Arc::clone(&handle.stop);

    info!(interval = ?interval, "Launching expiration timer");

    tokio::spawn(async move {
        let mut interval_timer = tokio::time::interval(interval);
        interval_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval_timer.tick().await;

        while running.load(Ordering::SeqCst) {
            tokio::select! {
                _ = interval_timer.tick() => {}
                () = stop.notified() => break,
            }

            if !running.load(Ordering::SeqCst) {
                break;
            }

            let report = manager.process_expirations().await;
            passes.fetch_add(1, Ordering::SeqCst);
            if report.lapsed_count() > 0 {
                info!(lapsed = report.lapsed_count(), "Expiration sweep finished");
            }
        }
        running.store(false, Ordering::SeqCst);
    });

    handle
}
