//! Peer registry: tracks live peer connections.
//!
//! The [`PeerRegistry`] maps a remote identifier to the [`Peer`] owning that
//! connection. Entries are removed under the lock and closed after it is
//! released, so slow transport teardown never blocks other registry users.

use crate::transport::PeerLink;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// One established connection, exclusively owned by the registry once added.
pub struct Peer {
    remote_id: String,
    platform: &'static str,
    link: Arc<dyn PeerLink>,
    established_at: DateTime<Utc>,
    outbound: mpsc::UnboundedSender<Arc<Vec<u8>>>,
    closed: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

/// Receiving ends handed to the peer's own send/receive loops.
pub struct PeerChannels {
    /// Payloads queued for this peer by the fan-out pump.
    pub outbound: mpsc::UnboundedReceiver<Arc<Vec<u8>>>,
    /// Flips to `true` when the peer is closed.
    pub shutdown: watch::Receiver<bool>,
}

impl Peer {
    /// Wrap a freshly established link.
    pub fn new(link: Arc<dyn PeerLink>, platform: &'static str) -> (Arc<Self>, PeerChannels) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let peer = Arc::new(Self {
            remote_id: link.remote_id().to_string(),
            platform,
            link,
            established_at: Utc::now(),
            outbound: outbound_tx,
            closed: AtomicBool::new(false),
            shutdown_tx,
        });
        (
            peer,
            PeerChannels {
                outbound: outbound_rx,
                shutdown: shutdown_rx,
            },
        )
    }

    /// Identifier of the remote end.
    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    /// The underlying transport link.
    pub fn link(&self) -> &Arc<dyn PeerLink> {
        &self.link
    }

    /// When the connection was registered.
    pub fn established_at(&self) -> DateTime<Utc> {
        self.established_at
    }

    /// Queue a payload for this peer's send loop.
    ///
    /// Returns `false` once the peer is closed.
    pub fn enqueue(&self, payload: Arc<Vec<u8>>) -> bool {
        !self.is_closed() && self.outbound.send(payload).is_ok()
    }

    /// Whether [`Peer::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop the peer's loops and release the link. Idempotent: the link is
    /// closed at most once, and close errors are swallowed.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown_tx.send_replace(true);
        if let Err(e) = self.link.close().await {
            debug!(peer = %self.remote_id, error = %e, "Error while closing link");
        }
    }

    /// Snapshot for health reporting.
    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            remote_id: self.remote_id.clone(),
            platform: self.platform.to_string(),
            established_at: self.established_at,
        }
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("remote_id", &self.remote_id)
            .field("platform", &self.platform)
            .field("established_at", &self.established_at)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Serializable view of a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerInfo {
    pub remote_id: String,
    pub platform: String,
    pub established_at: DateTime<Utc>,
}

/// Thread-safe registry of live peers, keyed by remote identifier.
#[derive(Debug, Clone, Default)]
pub struct PeerRegistry {
    peers: Arc<RwLock<HashMap<String, Arc<Peer>>>>,
}

impl PeerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer. A previous connection with the same remote
    /// identifier is displaced and closed.
    pub async fn add(&self, peer: Arc<Peer>) {
        let displaced = {
            let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
            peers.insert(peer.remote_id().to_string(), peer)
        };
        if let Some(old) = displaced {
            debug!(peer = %old.remote_id(), "Replacing existing connection");
            old.close().await;
        }
    }

    /// Remove and close the peer registered under `remote_id`.
    pub async fn remove(&self, remote_id: &str) -> bool {
        let removed = {
            let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
            peers.remove(remote_id)
        };
        match removed {
            Some(peer) => {
                peer.close().await;
                true
            }
            None => false,
        }
    }

    /// Remove this exact connection, leaving a newer connection to the same
    /// remote untouched. The peer is closed either way.
    pub async fn remove_peer(&self, peer: &Arc<Peer>) -> bool {
        let removed = {
            let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
            match peers.get(peer.remote_id()) {
                Some(current) if Arc::ptr_eq(current, peer) => {
                    peers.remove(peer.remote_id());
                    true
                }
                _ => false,
            }
        };
        peer.close().await;
        removed
    }

    /// Remove and close every peer.
    pub async fn clear(&self) -> usize {
        let drained: Vec<Arc<Peer>> = {
            let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
            peers.drain().map(|(_, p)| p).collect()
        };
        let count = drained.len();
        for peer in drained {
            peer.close().await;
        }
        count
    }

    /// Point-in-time copy of all peers.
    pub fn list(&self) -> Vec<Arc<Peer>> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.values().cloned().collect()
    }

    /// Get a specific peer.
    pub fn get(&self, remote_id: &str) -> Option<Arc<Peer>> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.get(remote_id).cloned()
    }

    /// Whether a peer with this identifier is registered.
    pub fn contains(&self, remote_id: &str) -> bool {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.contains_key(remote_id)
    }

    /// Number of live peers.
    pub fn len(&self) -> usize {
        self.peers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether no peer is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
