//! The seam between the relay core and a network transport.
//!
//! The core never touches sockets or overlay handles directly. A
//! [`Transport`] discovers and opens connections, and every established
//! connection is exposed as a [`PeerLink`] carrying opaque byte payloads.

use async_trait::async_trait;
use centi_types::{MicroserviceConfig, TransportError};
use std::sync::Arc;

/// How a transport learns about connection candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryMode {
    /// Remote nodes announce themselves; the announce listener feeds
    /// candidates to the connection manager.
    Passive,
    /// The connection manager polls the transport for nearby addresses.
    Active,
}

/// One established, bidirectional connection to a remote node.
///
/// Implementations must tolerate `send` and `recv` being called
/// concurrently from different tasks.
#[async_trait]
pub trait PeerLink: Send + Sync + 'static {
    /// Identifier of the remote end (address, destination hash, ...).
    fn remote_id(&self) -> &str;

    /// Send one payload.
    async fn send(&self, payload: &[u8]) -> Result<(), TransportError>;

    /// Wait for the next payload. `Ok(None)` means the link was closed.
    async fn recv(&self) -> Result<Option<Vec<u8>>, TransportError>;

    /// Release the underlying resource. Called at most once by the registry.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Receives "remote node announced" notifications from a transport.
///
/// Called on the transport's own thread; implementations must not block.
pub trait AnnounceHandler: Send + Sync + 'static {
    /// Only announces for this aspect are delivered. `None` means all.
    fn aspect_filter(&self) -> Option<&str>;

    /// A remote destination announced itself.
    fn received_announce(&self, destination: &[u8], app_data: Option<&[u8]>);
}

/// A network transport the relay can drive.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Platform tag attached to keys and messages (e.g. `"bluetooth"`).
    fn platform(&self) -> &'static str;

    /// Passive (announce-driven) or active (polling) discovery.
    fn discovery_mode(&self) -> DiscoveryMode;

    /// Validate and canonicalize a connection target.
    fn normalize_address(&self, raw: &str) -> Result<String, TransportError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(TransportError::InvalidAddress {
                address: raw.to_string(),
                reason: "empty address".to_string(),
            });
        }
        Ok(trimmed.to_string())
    }

    /// Apply a (re)initialization. Binds listeners when serving.
    async fn start(&self, _config: &MicroserviceConfig) -> Result<(), TransportError> {
        Ok(())
    }

    /// Release listeners. Established links are closed by the registry.
    async fn stop(&self) {}

    /// Whether a route to `address` is currently known.
    async fn has_path(&self, _address: &str) -> bool {
        true
    }

    /// Ask the network for a route to `address`.
    async fn request_path(&self, _address: &str) -> Result<(), TransportError> {
        Ok(())
    }

    /// Open a connection to `address`.
    async fn connect(&self, address: &str) -> Result<Arc<dyn PeerLink>, TransportError>;

    /// Addresses of nearby reachable nodes (active discovery only).
    async fn discover_nearby(&self) -> Result<Vec<String>, TransportError> {
        Ok(Vec::new())
    }

    /// Wait for the next inbound connection. Must be cancel-safe.
    async fn accept(&self) -> Result<Arc<dyn PeerLink>, TransportError>;

    /// Whether [`Transport::announce`] does anything.
    fn supports_announce(&self) -> bool {
        false
    }

    /// Broadcast our own reachability.
    async fn announce(&self) -> Result<(), TransportError> {
        Err(TransportError::Unsupported("announce"))
    }

    /// Aspect filter the announce listener should be registered with.
    fn announce_filter(&self) -> Option<String> {
        None
    }

    /// Install the handler that receives remote announces, replacing any
    /// previously installed one.
    fn register_announce_handler(
        &self,
        _handler: Arc<dyn AnnounceHandler>,
    ) -> Result<(), TransportError> {
        Err(TransportError::Unsupported("announce handlers"))
    }
}
