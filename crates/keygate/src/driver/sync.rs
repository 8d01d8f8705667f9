//! Bounded worker pool that applies network state through a driver.
//!
//! Callers hand over a network's full desired state and return at once.
//! The latest state per network is kept in a pending table and only the
//! network ID travels through the queue, so bursts collapse into a single
//! apply and an older state is never applied after a newer one. Applies for
//! one network are serialised; different networks proceed in parallel.
//!
//! Every finished job is folded into a per-network [`SyncStatus`] and
//! published as a [`SyncReport`] to subscribers.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::Driver;
use crate::config::DriverConfig;
use crate::types::NetState;

/// Capacity of the report broadcast channel.
const REPORT_CAPACITY: usize = 128;

/// Outcome of one sync job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    /// Network that was synced.
    pub network_id: String,
    /// Driver calls made, including retries.
    pub attempts: u32,
    /// Final error, if the job failed.
    pub error: Option<String>,
    /// The job was abandoned because a newer state for the same network
    /// arrived; that state is applied by a later job.
    pub superseded: bool,
    /// When the job finished.
    pub finished_at: DateTime<Utc>,
}

impl SyncReport {
    /// Whether the driver eventually accepted the state.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.error.is_none() && !self.superseded
    }
}

/// Running totals for one network.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStatus {
    /// Sync requests received.
    pub dispatched: u64,
    /// Jobs the driver accepted.
    pub applied: u64,
    /// Jobs that failed after all retries.
    pub failed: u64,
    /// Jobs abandoned in favour of a newer state.
    pub superseded: u64,
    /// Error of the most recent failed job; cleared by a success.
    pub last_error: Option<String>,
    /// When the most recent job finished.
    pub last_attempt: Option<DateTime<Utc>>,
}

/// How a job ended.
enum Outcome {
    Applied,
    Superseded,
    Failed(String),
}

struct Shared {
    driver: Arc<dyn Driver>,
    /// Latest undelivered state per network.
    pending: Mutex<HashMap<String, NetState>>,
    /// Serialises applies per network.
    apply_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    status: RwLock<HashMap<String, SyncStatus>>,
    reports: broadcast::Sender<SyncReport>,
    max_retries: u32,
    backoff: Duration,
}

impl Shared {
    fn apply_lock(&self, network_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(
            self.apply_locks
                .lock()
                .entry(network_id.to_string())
                .or_default(),
        )
    }

    async fn run_job(&self, network_id: &str) {
        let lock = self.apply_lock(network_id);
        let _guard = lock.lock().await;

        // Taken after the lock so a waiting job picks up the newest state.
        let Some(state) = self.pending.lock().remove(network_id) else {
            debug!(network = network_id, "sync already delivered by an earlier job");
            return;
        };

        let mut attempts = 0u32;
        let mut backoff = self.backoff;
        let outcome = loop {
            attempts += 1;
            match self.driver.configure(network_id, &state).await {
                Ok(()) => break Outcome::Applied,
                Err(e) if attempts <= self.max_retries => {
                    if self.pending.lock().contains_key(network_id) {
                        debug!(
                            network = network_id,
                            error = %e,
                            "Interface sync failed, newer state pending, not retrying"
                        );
                        break Outcome::Superseded;
                    }
                    warn!(
                        network = network_id,
                        attempt = attempts,
                        error = %e,
                        retry_in = ?backoff,
                        "Interface sync failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
                Err(e) => break Outcome::Failed(e.to_string()),
            }
        };

        self.finish(network_id, attempts, outcome);
    }

    fn finish(&self, network_id: &str, attempts: u32, outcome: Outcome) {
        let now = Utc::now();
        {
            let mut status = self.status.write();
            let entry = status.entry(network_id.to_string()).or_default();
            entry.last_attempt = Some(now);
            match &outcome {
                Outcome::Applied => {
                    entry.applied += 1;
                    entry.last_error = None;
                }
                Outcome::Superseded => entry.superseded += 1,
                Outcome::Failed(e) => {
                    entry.failed += 1;
                    entry.last_error = Some(e.clone());
                }
            }
        }

        match &outcome {
            Outcome::Applied => debug!(network = network_id, attempts, "Interface sync applied"),
            Outcome::Superseded => {
                debug!(network = network_id, attempts, "Interface sync superseded");
            }
            Outcome::Failed(e) => {
                warn!(network = network_id, attempts, error = %e, "Interface sync gave up");
            }
        }

        // No subscribers is fine.
        let _ = self.reports.send(SyncReport {
            network_id: network_id.to_string(),
            attempts,
            superseded: matches!(outcome, Outcome::Superseded),
            error: match outcome {
                Outcome::Failed(e) => Some(e),
                Outcome::Applied | Outcome::Superseded => None,
            },
            finished_at: now,
        });
    }
}

/// Dispatches interface syncs to a fixed pool of workers.
pub struct SyncDispatcher {
    shared: Arc<Shared>,
    queue: Mutex<Option<mpsc::Sender<String>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncDispatcher {
    /// Starts the worker pool. Must be called inside a tokio runtime.
    #[must_use]
    pub fn new(driver: Arc<dyn Driver>, config: &DriverConfig) -> Self {
        let (tx, rx) = mpsc::channel::<String>(config.queue_depth.max(1));
        let (reports, _) = broadcast::channel(REPORT_CAPACITY);
        let shared = Arc::new(Shared {
            driver,
            pending: Mutex::new(HashMap::new()),
            apply_locks: Mutex::new(HashMap::new()),
            status: RwLock::new(HashMap::new()),
            reports,
            max_retries: config.max_retries,
            backoff: config.retry_backoff(),
        });

        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let workers = (0..config.workers.max(1))
            .map(|worker| {
                let rx = Arc::clone(&rx);
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    loop {
                        let next = rx.lock().await.recv().await;
                        let Some(network_id) = next else {
                            break;
                        };
                        shared.run_job(&network_id).await;
                    }
                    debug!(worker, "sync worker stopped");
                })
            })
            .collect();

        info!(
            workers = config.workers,
            queue_depth = config.queue_depth,
            "Started interface sync workers"
        );

        Self {
            shared,
            queue: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        }
    }

    /// Hands a network's desired state to the pool.
    ///
    /// Waits only for queue capacity, never for the driver.
    pub async fn dispatch(&self, network_id: &str, state: NetState) {
        self.shared
            .status
            .write()
            .entry(network_id.to_string())
            .or_default()
            .dispatched += 1;

        // The queue stays locked while recording the state so shutdown
        // cannot slip in between and strand it in the pending table.
        let tx = {
            let queue = self.queue.lock();
            let Some(tx) = queue.as_ref() else {
                warn!(network = network_id, "sync dispatcher is shut down, dropping sync");
                return;
            };
            let newly_pending = self
                .shared
                .pending
                .lock()
                .insert(network_id.to_string(), state)
                .is_none();
            if !newly_pending {
                debug!(network = network_id, "sync coalesced into pending job");
                return;
            }
            tx.clone()
        };

        if tx.send(network_id.to_string()).await.is_err() {
            warn!(network = network_id, "sync workers are gone, dropping sync");
        }
    }

    /// Subscribes to job reports.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SyncReport> {
        self.shared.reports.subscribe()
    }

    /// Totals for one network, if it was ever dispatched.
    #[must_use]
    pub fn status(&self, network_id: &str) -> Option<SyncStatus> {
        self.shared.status.read().get(network_id).cloned()
    }

    /// Closes the queue and waits for the workers to drain it.
    pub async fn shutdown(&self) {
        drop(self.queue.lock().take());
        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "sync worker panicked");
            }
        }
    }
}

impl fmt::Debug for SyncDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncDispatcher")
            .field("pending", &self.shared.pending.lock().len())
            .field("workers", &self.workers.lock().len())
            .finish()
    }
}
