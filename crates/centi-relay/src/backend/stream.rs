//! Stream backend: length-prefixed frames over TCP.
//!
//! Addresses are `host:port`. When serving, the listener binds
//! `base_port + channel_no` so several instances on one host can pick
//! distinct channels; a base port of 0 binds an ephemeral port. Discovery
//! reports a configured neighbour list.

use crate::frame::{read_frame, write_frame};
use crate::transport::{DiscoveryMode, PeerLink, Transport};
use async_trait::async_trait;
use centi_types::{MicroserviceConfig, TransportError};
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Platform tag of the stream backend.
pub const PLATFORM: &str = "bluetooth";

/// Default HTTP port of the stream microservice.
pub const DEFAULT_API_PORT: u16 = 3333;

/// One TCP connection carrying framed payloads.
pub struct StreamLink {
    remote_id: String,
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
}

impl StreamLink {
    /// Wrap an established TCP stream.
    pub fn new(remote_id: String, stream: TcpStream) -> Self {
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        Self {
            remote_id,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        }
    }
}

#[async_trait]
impl PeerLink for StreamLink {
    fn remote_id(&self) -> &str {
        &self.remote_id
    }

    async fn send(&self, payload: &[u8]) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, payload).await
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>, TransportError> {
        let mut reader = self.reader.lock().await;
        read_frame(&mut *reader).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        writer.shutdown().await?;
        Ok(())
    }
}

/// TCP stand-in for the short-range wireless transport.
pub struct StreamTransport {
    bind_host: String,
    base_port: u16,
    neighbors: RwLock<Vec<String>>,
    listener: Mutex<Option<TcpListener>>,
    local_addr: RwLock<Option<SocketAddr>>,
}

impl StreamTransport {
    /// Create a transport listening on `bind_host` when serving.
    pub fn new(bind_host: impl Into<String>, base_port: u16) -> Self {
        Self {
            bind_host: bind_host.into(),
            base_port,
            neighbors: RwLock::new(Vec::new()),
            listener: Mutex::new(None),
            local_addr: RwLock::new(None),
        }
    }

    /// Builder-style neighbour list.
    pub fn with_neighbors<I, S>(self, neighbors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for n in neighbors {
            self.add_neighbor(n);
        }
        self
    }

    /// Make an address visible to the next discovery scan.
    pub fn add_neighbor(&self, address: impl Into<String>) {
        let address = address.into();
        let mut neighbors = self.neighbors.write().unwrap_or_else(|e| e.into_inner());
        if !neighbors.contains(&address) {
            neighbors.push(address);
        }
    }

    /// Address of the listener, once serving.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read().unwrap_or_else(|e| e.into_inner())
    }

    fn listen_port(&self, channel_no: u16) -> Result<u16, TransportError> {
        if self.base_port == 0 {
            return Ok(0);
        }
        self.base_port
            .checked_add(channel_no)
            .ok_or_else(|| TransportError::InvalidAddress {
                address: format!("{}:{}+{}", self.bind_host, self.base_port, channel_no),
                reason: "port out of range".to_string(),
            })
    }
}

#[async_trait]
impl Transport for StreamTransport {
    fn platform(&self) -> &'static str {
        PLATFORM
    }

    fn discovery_mode(&self) -> DiscoveryMode {
        DiscoveryMode::Active
    }

    fn normalize_address(&self, raw: &str) -> Result<String, TransportError> {
        let trimmed = raw.trim();
        let valid = trimmed
            .rsplit_once(':')
            .map(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
            .unwrap_or(false);
        if !valid {
            return Err(TransportError::InvalidAddress {
                address: raw.to_string(),
                reason: "expected host:port".to_string(),
            });
        }
        Ok(trimmed.to_string())
    }

    async fn start(&self, config: &MicroserviceConfig) -> Result<(), TransportError> {
        let mut listener = self.listener.lock().await;
        *listener = None;
        *self.local_addr.write().unwrap_or_else(|e| e.into_inner()) = None;
        if !config.run_as_server {
            return Ok(());
        }

        let port = self.listen_port(config.channel_no)?;
        let bound = TcpListener::bind((self.bind_host.as_str(), port)).await?;
        let addr = bound.local_addr()?;
        info!(%addr, channel = config.channel_no, "Stream listener bound");
        *self.local_addr.write().unwrap_or_else(|e| e.into_inner()) = Some(addr);
        *listener = Some(bound);
        Ok(())
    }

    async fn stop(&self) {
        if self.listener.lock().await.take().is_some() {
            debug!("Stream listener closed");
        }
        *self.local_addr.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    async fn connect(&self, address: &str) -> Result<Arc<dyn PeerLink>, TransportError> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| TransportError::ConnectFailed {
                address: address.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Arc::new(StreamLink::new(address.to_string(), stream)))
    }

    async fn discover_nearby(&self) -> Result<Vec<String>, TransportError> {
        Ok(self
            .neighbors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone())
    }

    async fn accept(&self) -> Result<Arc<dyn PeerLink>, TransportError> {
        let listener = self.listener.lock().await;
        let Some(listener) = listener.as_ref() else {
            return Err(TransportError::Closed);
        };
        let (stream, addr) = listener.accept().await?;
        Ok(Arc::new(StreamLink::new(addr.to_string(), stream)))
    }
}
