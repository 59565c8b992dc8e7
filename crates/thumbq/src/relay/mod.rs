//! Pushes job state to the owner's live connections.
//!
//! Queue events only say which job changed. The relay reads the job store
//! for every event so subscribers always see persisted state.

pub mod connection;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use tokio::sync::{broadcast, Notify};

use crate::error::JobError;
use crate::job::JobStore;
use crate::queue::{QueueEvent, QueueEventKind};

pub use connection::{ChannelConnection, Connection, DeliveryError, JobMessage};

type ConnectionId = u64;

#[derive(Default)]
struct Registry {
    next_id: AtomicU64,
    owners: Mutex<HashMap<String, HashMap<ConnectionId, Arc<dyn Connection>>>>,
}

impl Registry {
    fn owners(
        &self,
    ) -> MutexGuard<'_, HashMap<String, HashMap<ConnectionId, Arc<dyn Connection>>>> {
        // Entries are plain inserts and removes; a panic elsewhere cannot
        // leave the map half-updated.
        self.owners.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn insert(&self, owner_id: &str, connection: Arc<dyn Connection>) -> ConnectionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.owners()
            .entry(owner_id.to_string())
            .or_default()
            .insert(id, connection);
        id
    }

    fn remove(&self, owner_id: &str, id: ConnectionId) {
        let mut owners = self.owners();
        if let Some(connections) = owners.get_mut(owner_id) {
            connections.remove(&id);
            if connections.is_empty() {
                owners.remove(owner_id);
            }
        }
    }

    fn snapshot(&self, owner_id: &str) -> Vec<(ConnectionId, Arc<dyn Connection>)> {
        self.owners()
            .get(owner_id)
            .map(|c| c.iter().map(|(id, conn)| (*id, Arc::clone(conn))).collect())
            .unwrap_or_default()
    }

    fn count(&self, owner_id: &str) -> usize {
        self.owners().get(owner_id).map_or(0, HashMap::len)
    }
}

/// Registration of one connection. Dropping it unsubscribes.
pub struct Subscription {
    registry: Arc<Registry>,
    owner_id: String,
    id: ConnectionId,
}

impl Subscription {
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn cancel(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.remove(&self.owner_id, self.id);
        log::debug!("Connection {} of owner {} unsubscribed", self.id, self.owner_id);
    }
}

pub struct EventRelay {
    store: Arc<dyn JobStore>,
    registry: Arc<Registry>,
    shutdown: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl EventRelay {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            registry: Arc::new(Registry::default()),
            shutdown: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn subscribe(&self, owner_id: &str, connection: Arc<dyn Connection>) -> Subscription {
        let id = self.registry.insert(owner_id, connection);
        log::debug!("Connection {} subscribed for owner {}", id, owner_id);
        Subscription {
            registry: Arc::clone(&self.registry),
            owner_id: owner_id.to_string(),
            id,
        }
    }

    pub fn subscriber_count(&self, owner_id: &str) -> usize {
        self.registry.count(owner_id)
    }

    /// Reads the job and pushes it to its owner's connections. Returns the
    /// number of connections reached. Jobs missing from the store are
    /// skipped.
    pub fn publish(&self, job_id: &str) -> usize {
        publish_job(self.store.as_ref(), &self.registry, job_id)
    }

    /// Relays queue events on a dedicated thread until `stop` is called or
    /// the event source closes.
    pub fn start(
        &self,
        mut events: broadcast::Receiver<QueueEvent>,
    ) -> std::io::Result<JoinHandle<()>> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let store = Arc::clone(&self.store);
        let registry = Arc::clone(&self.registry);
        let shutdown = Arc::clone(&self.shutdown);
        let wake = Arc::clone(&self.wake);

        std::thread::Builder::new()
            .name("thumbq-relay".to_string())
            .spawn(move || {
                rt.block_on(async {
                    loop {
                        if shutdown.load(Ordering::Acquire) {
                            break;
                        }

                        tokio::select! {
                            _ = wake.notified() => {},
                            received = events.recv() => match received {
                                Ok(event) => handle_event(store.as_ref(), &registry, &event),
                                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                    log::warn!(
                                        "Event relay lagged, skipped {} queue events",
                                        skipped
                                    );
                                }
                                Err(broadcast::error::RecvError::Closed) => {
                                    log::debug!("Queue event source closed");
                                    break;
                                }
                            },
                        }
                    }
                });
                log::debug!("Event relay stopped");
            })
    }

    /// Signals the relay thread to exit.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.wake.notify_one();
    }
}

fn handle_event(store: &dyn JobStore, registry: &Registry, event: &QueueEvent) {
    let _span = tracing::info_span!(
        "relay.event",
        kind = %event.kind,
        job_id = %event.job_id,
        attempt = event.attempt
    )
    .entered();

    // A waiting task has not changed its job.
    if event.kind == QueueEventKind::Waiting {
        return;
    }
    publish_job(store, registry, &event.job_id);
}

fn publish_job(store: &dyn JobStore, registry: &Registry, job_id: &str) -> usize {
    let job = match store.get(job_id) {
        Ok(job) => job,
        Err(JobError::NotFound(_)) => {
            log::warn!("Not relaying job {}: it is not in the store", job_id);
            return 0;
        }
        Err(e) => {
            log::error!("Failed to read job {} for relay: {}", job_id, e);
            return 0;
        }
    };

    let message = JobMessage::from(&job);
    let mut delivered = 0;
    for (id, connection) in registry.snapshot(&job.owner_id) {
        match connection.send(&message) {
            Ok(()) => delivered += 1,
            Err(DeliveryError::Closed) => {
                log::debug!("Pruning closed connection {} of owner {}", id, job.owner_id);
                registry.remove(&job.owner_id, id);
            }
            Err(e) => log::warn!("Dropped update for job {}: {}", job.id, e),
        }
    }
    delivered
}
