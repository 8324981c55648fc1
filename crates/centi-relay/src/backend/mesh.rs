//! Mesh backend: adapts a callback-driven overlay to [`Transport`].
//!
//! The overlay owns routing, identities and link cryptography. It reports
//! inbound links, packets, link closure and remote announces through
//! callbacks on its own threads; this adapter bridges those callbacks into
//! channels so the relay can consume them with async loops.
//!
//! Addresses are destination hashes written as 32 hex characters.

use crate::announce::announce_aspect;
use crate::transport::{AnnounceHandler, DiscoveryMode, PeerLink, Transport};
use async_trait::async_trait;
use centi_types::{MicroserviceConfig, TransportError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Platform tag of the mesh backend.
pub const PLATFORM: &str = "reticulum";

/// Default HTTP port of the mesh microservice.
pub const DEFAULT_API_PORT: u16 = 9000;

/// Length of a destination hash in bytes.
pub const DESTINATION_LEN: usize = 16;

pub type PacketCallback = Box<dyn Fn(Vec<u8>) + Send + Sync>;
pub type ClosedCallback = Box<dyn Fn() + Send + Sync>;
pub type LinkCallback = Arc<dyn Fn(Arc<dyn OverlayLink>) + Send + Sync>;
pub type AnnounceCallback = Arc<dyn Fn(&[u8], Option<&[u8]>) + Send + Sync>;

/// One overlay link, as handed out by [`Overlay::open_link`] or an inbound
/// link callback.
pub trait OverlayLink: Send + Sync {
    /// Overlay-assigned link identifier.
    fn link_id(&self) -> Vec<u8>;
    fn send(&self, payload: &[u8]) -> Result<(), TransportError>;
    /// Packets that arrive before a callback is installed must be buffered.
    fn set_packet_callback(&self, callback: PacketCallback);
    /// Invoked once when either side tears the link down. Installing it on
    /// an already closed link invokes it immediately.
    fn set_closed_callback(&self, callback: ClosedCallback);
    fn teardown(&self);
}

/// The mesh overlay collaborator.
pub trait Overlay: Send + Sync + 'static {
    /// Bring the overlay up. `config_path` is opaque to the relay.
    fn start(&self, config_path: Option<&str>) -> Result<(), TransportError>;
    /// Create a fresh local identity.
    fn generate_identity(&self) -> Vec<u8>;
    fn has_path(&self, destination: &[u8]) -> bool;
    fn request_path(&self, destination: &[u8]) -> Result<(), TransportError>;
    /// Identity behind a destination, if the overlay has seen it.
    fn recall_identity(&self, destination: &[u8]) -> Option<Vec<u8>>;
    fn open_link(&self, identity: &[u8], aspect: &str)
        -> Result<Arc<dyn OverlayLink>, TransportError>;
    /// Register an inbound destination; returns its hash.
    fn listen(
        &self,
        identity: &[u8],
        aspect: &str,
        on_link: LinkCallback,
    ) -> Result<Vec<u8>, TransportError>;
    fn stop_listening(&self, destination: &[u8]);
    fn announce(&self, destination: &[u8]) -> Result<(), TransportError>;
    fn register_announce_handler(&self, aspect_filter: Option<&str>, callback: AnnounceCallback);
}

/// An overlay link bridged to [`PeerLink`].
pub struct MeshLink {
    remote_id: String,
    link: Arc<dyn OverlayLink>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl MeshLink {
    /// Wrap an overlay link, routing its packet callbacks into a channel.
    pub fn bridge(remote_id: String, link: Arc<dyn OverlayLink>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        // Dropping the sender on close ends the receive side.
        let slot = Arc::new(Mutex::new(Some(tx)));

        let packets = slot.clone();
        link.set_packet_callback(Box::new(move |data: Vec<u8>| {
            let packets = packets.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(tx) = packets.as_ref() {
                let _ = tx.send(data);
            }
        }));
        let closed = slot;
        link.set_closed_callback(Box::new(move || {
            closed.lock().unwrap_or_else(|e| e.into_inner()).take();
        }));

        Arc::new(Self {
            remote_id,
            link,
            rx: tokio::sync::Mutex::new(rx),
        })
    }
}

#[async_trait]
impl PeerLink for MeshLink {
    fn remote_id(&self) -> &str {
        &self.remote_id
    }

    async fn send(&self, payload: &[u8]) -> Result<(), TransportError> {
        self.link.send(payload)
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>, TransportError> {
        Ok(self.rx.lock().await.recv().await)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.link.teardown();
        Ok(())
    }
}

/// Announce handler slot shared with the overlay callback. The overlay
/// callback is registered once; later registrations swap the slot.
type HandlerSlot = Arc<Mutex<Option<Arc<dyn AnnounceHandler>>>>;

/// [`Transport`] over an [`Overlay`].
pub struct MeshTransport {
    overlay: Arc<dyn Overlay>,
    identity: Mutex<Option<Vec<u8>>>,
    destination: Mutex<Option<Vec<u8>>>,
    incoming_tx: mpsc::UnboundedSender<Arc<dyn PeerLink>>,
    incoming_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Arc<dyn PeerLink>>>,
    handler: HandlerSlot,
    handler_registered: AtomicBool,
}

impl MeshTransport {
    /// Adapt `overlay`. Nothing is started until [`Transport::start`].
    pub fn new(overlay: Arc<dyn Overlay>) -> Self {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        Self {
            overlay,
            identity: Mutex::new(None),
            destination: Mutex::new(None),
            incoming_tx,
            incoming_rx: tokio::sync::Mutex::new(incoming_rx),
            handler: Arc::new(Mutex::new(None)),
            handler_registered: AtomicBool::new(false),
        }
    }

    /// Our inbound destination hash as hex, once serving.
    pub fn destination(&self) -> Option<String> {
        self.destination
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_deref()
            .map(hex::encode)
    }

    fn identity(&self) -> Vec<u8> {
        let mut identity = self.identity.lock().unwrap_or_else(|e| e.into_inner());
        identity
            .get_or_insert_with(|| self.overlay.generate_identity())
            .clone()
    }

    fn decode(&self, address: &str) -> Result<Vec<u8>, TransportError> {
        let normalized = self.normalize_address(address)?;
        hex::decode(&normalized).map_err(|e| TransportError::InvalidAddress {
            address: address.to_string(),
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl Transport for MeshTransport {
    fn platform(&self) -> &'static str {
        PLATFORM
    }

    fn discovery_mode(&self) -> DiscoveryMode {
        DiscoveryMode::Passive
    }

    fn normalize_address(&self, raw: &str) -> Result<String, TransportError> {
        let address = raw.trim().to_ascii_lowercase();
        let expected = DESTINATION_LEN * 2;
        if address.len() != expected {
            return Err(TransportError::InvalidAddress {
                address: raw.to_string(),
                reason: format!(
                    "must be {expected} hexadecimal characters ({DESTINATION_LEN} bytes)"
                ),
            });
        }
        if !address.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(TransportError::InvalidAddress {
                address: raw.to_string(),
                reason: "not hexadecimal".to_string(),
            });
        }
        Ok(address)
    }

    async fn start(&self, config: &MicroserviceConfig) -> Result<(), TransportError> {
        self.overlay.start(config.config_path.as_deref())?;
        let identity = self.identity();

        let previous = self
            .destination
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(previous) = previous {
            self.overlay.stop_listening(&previous);
        }
        if !config.run_as_server {
            return Ok(());
        }

        let incoming = self.incoming_tx.clone();
        let on_link: LinkCallback = Arc::new(move |link: Arc<dyn OverlayLink>| {
            let remote_id = format!("link:{}", hex::encode(link.link_id()));
            debug!(peer = %remote_id, "Inbound mesh link");
            let bridged: Arc<dyn PeerLink> = MeshLink::bridge(remote_id, link);
            let _ = incoming.send(bridged);
        });
        let destination = self
            .overlay
            .listen(&identity, &announce_aspect(), on_link)?;
        info!(destination = %hex::encode(&destination), "Mesh destination registered");
        *self.destination.lock().unwrap_or_else(|e| e.into_inner()) = Some(destination);
        Ok(())
    }

    async fn stop(&self) {
        let destination = self
            .destination
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(destination) = destination {
            self.overlay.stop_listening(&destination);
        }
    }

    async fn has_path(&self, address: &str) -> bool {
        match self.decode(address) {
            Ok(destination) => self.overlay.has_path(&destination),
            Err(_) => false,
        }
    }

    async fn request_path(&self, address: &str) -> Result<(), TransportError> {
        self.overlay.request_path(&self.decode(address)?)
    }

    async fn connect(&self, address: &str) -> Result<Arc<dyn PeerLink>, TransportError> {
        let destination = self.decode(address)?;
        let identity =
            self.overlay
                .recall_identity(&destination)
                .ok_or_else(|| TransportError::ConnectFailed {
                    address: address.to_string(),
                    reason: "identity unknown".to_string(),
                })?;
        let link = self.overlay.open_link(&identity, &announce_aspect())?;
        Ok(MeshLink::bridge(self.normalize_address(address)?, link))
    }

    async fn accept(&self) -> Result<Arc<dyn PeerLink>, TransportError> {
        self.incoming_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::Closed)
    }

    fn supports_announce(&self) -> bool {
        true
    }

    async fn announce(&self) -> Result<(), TransportError> {
        let destination = self
            .destination
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(TransportError::Unsupported("announce before listening"))?;
        self.overlay.announce(&destination)
    }

    fn announce_filter(&self) -> Option<String> {
        Some(announce_aspect())
    }

    fn register_announce_handler(
        &self,
        handler: Arc<dyn AnnounceHandler>,
    ) -> Result<(), TransportError> {
        let filter = handler.aspect_filter().map(str::to_string);
        *self.handler.lock().unwrap_or_else(|e| e.into_inner()) = Some(handler);
        if self.handler_registered.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let slot = self.handler.clone();
        self.overlay.register_announce_handler(
            filter.as_deref(),
            Arc::new(move |destination: &[u8], app_data: Option<&[u8]>| {
                let handler = slot.lock().unwrap_or_else(|e| e.into_inner()).clone();
                match handler {
                    Some(h) => h.received_announce(destination, app_data),
                    None => warn!("Announce received with no handler installed"),
                }
            }),
        );
        Ok(())
    }
}
