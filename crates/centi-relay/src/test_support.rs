//! In-memory links and transports for unit tests.

use crate::transport::{DiscoveryMode, PeerLink, Transport};
use async_trait::async_trait;
use centi_types::TransportError;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// One end of an in-memory link pair.
pub struct ChannelLink {
    id: String,
    tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl ChannelLink {
    /// Two connected ends. The first reports `a_remote` as its remote id.
    pub fn pair(a_remote: &str, b_remote: &str) -> (Arc<Self>, Arc<Self>) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        let a = Arc::new(Self {
            id: a_remote.to_string(),
            tx: Mutex::new(Some(a_tx)),
            rx: tokio::sync::Mutex::new(a_rx),
        });
        let b = Arc::new(Self {
            id: b_remote.to_string(),
            tx: Mutex::new(Some(b_tx)),
            rx: tokio::sync::Mutex::new(b_rx),
        });
        (a, b)
    }
}

#[async_trait]
impl PeerLink for ChannelLink {
    fn remote_id(&self) -> &str {
        &self.id
    }

    async fn send(&self, payload: &[u8]) -> Result<(), TransportError> {
        let tx = self.tx.lock().unwrap().clone();
        match tx {
            Some(tx) => tx.send(payload.to_vec()).map_err(|_| TransportError::Closed),
            None => Err(TransportError::Closed),
        }
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>, TransportError> {
        Ok(self.rx.lock().await.recv().await)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.tx.lock().unwrap().take();
        Ok(())
    }
}

/// A transport that never connects and never accepts.
pub struct NullTransport;

#[async_trait]
impl Transport for NullTransport {
    fn platform(&self) -> &'static str {
        "bluetooth"
    }

    fn discovery_mode(&self) -> DiscoveryMode {
        DiscoveryMode::Active
    }

    async fn connect(&self, address: &str) -> Result<Arc<dyn PeerLink>, TransportError> {
        Err(TransportError::ConnectFailed {
            address: address.to_string(),
            reason: "null transport".to_string(),
        })
    }

    async fn accept(&self) -> Result<Arc<dyn PeerLink>, TransportError> {
        std::future::pending().await
    }
}

/// Discovers a fixed list of addresses. Connecting to an address listed in
/// `hanging` never completes; every other address gets an in-memory link.
pub struct HangingTransport {
    nearby: Vec<String>,
    hanging: Vec<String>,
    connect_calls: Mutex<Vec<String>>,
    remote_ends: Mutex<Vec<Arc<ChannelLink>>>,
}

impl HangingTransport {
    pub fn new(nearby: &[&str], hanging: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            nearby: nearby.iter().map(|s| s.to_string()).collect(),
            hanging: hanging.iter().map(|s| s.to_string()).collect(),
            connect_calls: Mutex::new(Vec::new()),
            remote_ends: Mutex::new(Vec::new()),
        })
    }

    /// Addresses passed to `connect`, in call order.
    pub fn connect_calls(&self) -> Vec<String> {
        self.connect_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for HangingTransport {
    fn platform(&self) -> &'static str {
        "bluetooth"
    }

    fn discovery_mode(&self) -> DiscoveryMode {
        DiscoveryMode::Active
    }

    async fn discover_nearby(&self) -> Result<Vec<String>, TransportError> {
        Ok(self.nearby.clone())
    }

    async fn connect(&self, address: &str) -> Result<Arc<dyn PeerLink>, TransportError> {
        self.connect_calls.lock().unwrap().push(address.to_string());
        if self.hanging.iter().any(|h| h == address) {
            std::future::pending::<()>().await;
        }
        let (ours, theirs) = ChannelLink::pair(address, "local");
        self.remote_ends.lock().unwrap().push(theirs);
        Ok(ours)
    }

    async fn accept(&self) -> Result<Arc<dyn PeerLink>, TransportError> {
        std::future::pending().await
    }
}
