//! Announce listener for passive discovery.
//!
//! Transports invoke [`AnnounceHandler::received_announce`] on their own
//! threads, so the listener only normalizes the destination and hands it
//! to an async forwarder over a channel. The forwarder applies the
//! connection manager's gate.

use crate::connection::ConnectionManager;
use crate::tasks::shutdown_signalled;
use crate::transport::AnnounceHandler;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

/// Application name announced and filtered on by the mesh backend.
pub const APP_NAME: &str = "centi";

/// Aspect filter for announces of this application.
pub fn announce_aspect() -> String {
    format!("{APP_NAME}.announce")
}

/// Canonical identifier of an announced destination.
pub fn destination_id(destination: &[u8]) -> String {
    hex::encode(destination)
}

/// Relays announce notifications into the async world.
pub struct AnnounceListener {
    aspect_filter: Option<String>,
    tx: mpsc::UnboundedSender<String>,
}

impl AnnounceListener {
    /// Create a listener and the receiver its announces are forwarded to.
    pub fn new(aspect_filter: Option<String>) -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { aspect_filter, tx }), rx)
    }
}

impl AnnounceHandler for AnnounceListener {
    fn aspect_filter(&self) -> Option<&str> {
        self.aspect_filter.as_deref()
    }

    fn received_announce(&self, destination: &[u8], app_data: Option<&[u8]>) {
        let id = destination_id(destination);
        trace!(peer = %id, app_data = app_data.map(|d| d.len()), "Announce");
        if self.tx.send(id).is_err() {
            debug!("Announce dropped, forwarder stopped");
        }
    }
}

/// Feed announced identifiers to the connection manager until shutdown.
pub async fn forward_announces(
    mut rx: mpsc::UnboundedReceiver<String>,
    manager: Arc<ConnectionManager>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            next = rx.recv() => match next {
                Some(id) => {
                    manager.offer_announced(id);
                }
                None => break,
            },
            _ = shutdown_signalled(&mut shutdown) => break,
        }
    }
}
