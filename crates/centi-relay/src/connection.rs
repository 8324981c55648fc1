//! Connection manager: turns candidate addresses into registered peers.
//!
//! Every attempt walks the same path state machine:
//!
//! ```text
//! Unknown --has_path--> PathResolved --connect--> (peer registered)
//!    |
//!    +--request_path--> PathRequested{polls} --poll budget spent--> TimedOut
//! ```
//!
//! An address with an attempt in flight is "pending" and is skipped by
//! every other trigger until that attempt finishes. Failures never escape
//! the attempt: they are logged and recorded for health reporting, and the
//! address becomes eligible again.
//!
//! Path polling and the connect that follows are each bounded by the
//! attempt budget times the poll interval.

use crate::context::{jittered, RelayContext};
use crate::registry::Peer;
use crate::session::attach_peer;
use crate::tasks::{shutdown_signalled, TaskSet};
use centi_types::TransportError;
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Where an attempt stands on its way to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PathState {
    Unknown,
    PathRequested { polls: u32 },
    PathResolved,
    TimedOut,
}

/// Drives connection attempts for one relay session.
pub struct ConnectionManager {
    ctx: Arc<RelayContext>,
    max_attempts: u32,
    pending: Mutex<HashMap<String, PathState>>,
    /// Attempts spawned by announces and discovery.
    attempts: Arc<TaskSet>,
    /// Per-peer loops.
    peers: Arc<TaskSet>,
    shutdown: watch::Receiver<bool>,
}

impl ConnectionManager {
    /// Create a manager bound to one session's task sets and shutdown signal.
    pub fn new(
        ctx: Arc<RelayContext>,
        max_attempts: u32,
        attempts: Arc<TaskSet>,
        peers: Arc<TaskSet>,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            max_attempts: max_attempts.max(1),
            pending: Mutex::new(HashMap::new()),
            attempts,
            peers,
            shutdown,
        })
    }

    /// Addresses with an attempt in flight, sorted.
    pub fn pending(&self) -> Vec<String> {
        let pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let mut addresses: Vec<String> = pending.keys().cloned().collect();
        addresses.sort();
        addresses
    }

    /// Whether an attempt for `address` is in flight.
    pub fn is_pending(&self, address: &str) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(address)
    }

    /// Current state of an in-flight attempt.
    pub fn state(&self, address: &str) -> Option<PathState> {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(address)
            .copied()
    }

    /// Forget every in-flight attempt.
    pub fn clear_pending(&self) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    fn begin(&self, address: &str) -> bool {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if pending.contains_key(address) {
            return false;
        }
        pending.insert(address.to_string(), PathState::Unknown);
        true
    }

    fn set_state(&self, address: &str, state: PathState) {
        if let Some(s) = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(address)
        {
            *s = state;
        }
    }

    fn finish(&self, address: &str) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(address);
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// How long a single connect may take once the path is known.
    pub fn connect_deadline(&self) -> Duration {
        self.ctx.tuning.poll_interval * self.max_attempts
    }

    /// Try to connect to one address.
    ///
    /// Returns `Ok(None)` when the address is already connected or already
    /// being attempted. Errors are logged and recorded before returning.
    pub async fn connect_to(&self, raw: &str) -> Result<Option<Arc<Peer>>, TransportError> {
        let address = match self.ctx.transport.normalize_address(raw) {
            Ok(address) => address,
            Err(e) => {
                warn!(address = raw, error = %e, "Skipping invalid address");
                self.ctx.health.record(raw, &e);
                return Err(e);
            }
        };

        if self.ctx.registry.contains(&address) {
            debug!(address = %address, "Already connected");
            return Ok(None);
        }
        if !self.begin(&address) {
            debug!(address = %address, "Attempt already in flight");
            return Ok(None);
        }

        let result = self.attempt(&address).await;
        self.finish(&address);

        match result {
            Ok(peer) => Ok(Some(peer)),
            Err(e) => {
                warn!(address = %address, error = %e, "Connection attempt failed");
                self.ctx.health.record(&address, &e);
                Err(e)
            }
        }
    }

    async fn attempt(&self, address: &str) -> Result<Arc<Peer>, TransportError> {
        self.resolve_path(address).await?;
        self.set_state(address, PathState::PathResolved);

        let deadline = self.connect_deadline();
        let connect = tokio::time::timeout(deadline, self.ctx.transport.connect(address));
        let mut shutdown = self.shutdown.clone();
        let link = tokio::select! {
            link = connect => link.map_err(|_| TransportError::ConnectFailed {
                address: address.to_string(),
                reason: format!("timed out after {} ms", deadline.as_millis()),
            })??,
            _ = shutdown_signalled(&mut shutdown) => return Err(TransportError::Cancelled),
        };
        if self.is_shutting_down() {
            let _ = link.close().await;
            return Err(TransportError::Cancelled);
        }

        info!(address, "Connection established");
        let peer = attach_peer(&self.ctx, &self.peers, link).await;
        // Raced with session teardown; do not leave the peer behind.
        if self.is_shutting_down() {
            self.ctx.registry.remove_peer(&peer).await;
            return Err(TransportError::Cancelled);
        }
        Ok(peer)
    }

    async fn resolve_path(&self, address: &str) -> Result<(), TransportError> {
        let transport = &self.ctx.transport;
        if transport.has_path(address).await {
            return Ok(());
        }

        debug!(address, "No known path, requesting one");
        transport.request_path(address).await?;

        let mut shutdown = self.shutdown.clone();
        for poll in 1..=self.max_attempts {
            self.set_state(address, PathState::PathRequested { polls: poll });
            tokio::select! {
                _ = tokio::time::sleep(self.ctx.tuning.poll_interval) => {}
                _ = shutdown_signalled(&mut shutdown) => return Err(TransportError::Cancelled),
            }
            if transport.has_path(address).await {
                debug!(address, polls = poll, "Path resolved");
                return Ok(());
            }
        }

        self.set_state(address, PathState::TimedOut);
        Err(TransportError::PathTimeout {
            address: address.to_string(),
            attempts: self.max_attempts,
        })
    }

    /// Attempt every address concurrently and wait for all of them.
    ///
    /// Returns the number of new connections.
    pub async fn connect_all<I>(&self, addresses: I) -> usize
    where
        I: IntoIterator<Item = String>,
    {
        let attempts = addresses.into_iter().map(|address| async move {
            matches!(self.connect_to(&address).await, Ok(Some(_)))
        });
        join_all(attempts).await.into_iter().filter(|ok| *ok).count()
    }

    /// Gate for announce-driven discovery.
    ///
    /// An announce only turns into an attempt once this node has a local
    /// key to hand over and the remote is neither connected nor pending.
    pub fn offer_announced(self: &Arc<Self>, remote_id: String) -> bool {
        if self.is_shutting_down() {
            return false;
        }
        if !self.ctx.local_key.is_set() {
            debug!(peer = %remote_id, "Ignoring announce, no local key yet");
            return false;
        }
        if self.ctx.registry.contains(&remote_id) || self.is_pending(&remote_id) {
            return false;
        }

        info!(peer = %remote_id, "Announce received, connecting");
        self.spawn_attempt(remote_id);
        true
    }

    /// Run one attempt in the background so it cannot hold up its caller.
    fn spawn_attempt(self: &Arc<Self>, address: String) {
        let manager = Arc::clone(self);
        self.attempts.spawn(async move {
            let _ = manager.connect_to(&address).await;
        });
    }

    /// Scan for nearby nodes and connect to new ones until shutdown.
    pub async fn run_active_discovery(self: Arc<Self>) {
        let mut shutdown = self.shutdown.clone();
        info!(platform = self.ctx.platform(), "Active discovery started");
        loop {
            if self.is_shutting_down() {
                break;
            }
            match self.ctx.transport.discover_nearby().await {
                Ok(nearby) => {
                    for raw in nearby {
                        if self.is_shutting_down() {
                            break;
                        }
                        let Ok(address) = self.ctx.transport.normalize_address(&raw) else {
                            debug!(address = %raw, "Discovered address rejected");
                            continue;
                        };
                        if self.ctx.registry.contains(&address) || self.is_pending(&address) {
                            continue;
                        }
                        debug!(address = %address, "New candidate discovered");
                        self.spawn_attempt(address);
                    }
                }
                Err(e) => warn!(error = %e, "Discovery scan failed"),
            }

            let delay = jittered(self.ctx.tuning.discovery_interval);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_signalled(&mut shutdown) => break,
            }
        }
        debug!("Active discovery stopped");
    }
}
