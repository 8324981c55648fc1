//! Relay lifecycle: sessions, background loops, and the command operations.
//!
//! A *session* is the set of background loops started by
//! `init_microservice` (or lazily by `init_channels`): the outbox pump, the
//! accept and announce loops when serving, and whichever discovery mode the
//! transport uses. `delete_channels` tears a session down completely; the
//! configuration, the key store and the local key survive it.

use crate::announce::{forward_announces, AnnounceListener};
use crate::connection::ConnectionManager;
use crate::context::{ErrorRecord, RelayContext, RelayTuning};
use crate::registry::PeerInfo;
use crate::session::{accept_loop, announce_loop, outbox_pump};
use crate::tasks::TaskSet;
use crate::transport::{DiscoveryMode, Transport};
use centi_types::{MessageRecord, MicroserviceConfig, PublicKeyRecord};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

/// Address under which transport-level failures not tied to a peer are
/// recorded (e.g. a listener that failed to bind).
pub const LOCAL_ENDPOINT: &str = "local";

struct Session {
    shutdown_tx: watch::Sender<bool>,
    control: Arc<TaskSet>,
    peers: Arc<TaskSet>,
    connections: Arc<ConnectionManager>,
}

/// Health snapshot returned by the `health` command.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub running: bool,
    pub peers: Vec<PeerInfo>,
    pub pending: Vec<String>,
    pub last_errors: BTreeMap<String, ErrorRecord>,
    pub public_keys: usize,
    pub inbox: usize,
    pub outbox: usize,
}

/// One relay instance bound to one transport.
pub struct Relay {
    ctx: Arc<RelayContext>,
    config: RwLock<MicroserviceConfig>,
    session: Mutex<Option<Session>>,
}

impl Relay {
    /// Create a relay with default tuning.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_tuning(transport, RelayTuning::default())
    }

    /// Create a relay with custom timing knobs.
    pub fn with_tuning(transport: Arc<dyn Transport>, tuning: RelayTuning) -> Self {
        Self {
            ctx: RelayContext::new(transport, tuning),
            config: RwLock::new(MicroserviceConfig::default()),
            session: Mutex::new(None),
        }
    }

    /// Shared state of this instance.
    pub fn context(&self) -> &Arc<RelayContext> {
        &self.ctx
    }

    /// Platform tag reported in keys and messages.
    pub fn platform(&self) -> &'static str {
        self.ctx.platform()
    }

    /// The configuration applied by the last `init_microservice`.
    pub fn config(&self) -> MicroserviceConfig {
        self.config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Whether a session is running.
    pub async fn is_running(&self) -> bool {
        self.session.lock().await.is_some()
    }

    /// Apply a configuration and (re)start the session.
    pub async fn init_microservice(&self, config: MicroserviceConfig) {
        info!(
            platform = self.platform(),
            autodiscovery = config.autodiscovery,
            run_as_server = config.run_as_server,
            channel = config.channel_no,
            max_attempts = config.max_attempts,
            "Initializing microservice"
        );
        let mut session = self.session.lock().await;
        if let Some(old) = session.take() {
            self.stop_session(old).await;
        }
        *self.config.write().unwrap_or_else(|e| e.into_inner()) = config.clone();
        *session = Some(self.start_session(&config).await);
    }

    async fn start_session(&self, config: &MicroserviceConfig) -> Session {
        let ctx = &self.ctx;
        let transport = &ctx.transport;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let control = Arc::new(TaskSet::new());
        let peers = Arc::new(TaskSet::new());
        let connections = ConnectionManager::new(
            ctx.clone(),
            config.max_attempts,
            control.clone(),
            peers.clone(),
            shutdown_rx.clone(),
        );

        let started = match transport.start(config).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Transport failed to start, continuing as client only");
                ctx.health.record(LOCAL_ENDPOINT, &e);
                false
            }
        };

        control.spawn(outbox_pump(ctx.clone(), shutdown_rx.clone()));

        if config.run_as_server && started {
            control.spawn(accept_loop(ctx.clone(), peers.clone(), shutdown_rx.clone()));
            if transport.supports_announce() {
                control.spawn(announce_loop(ctx.clone(), shutdown_rx.clone()));
            }
        }

        if config.autodiscovery {
            match transport.discovery_mode() {
                DiscoveryMode::Active => {
                    control.spawn(connections.clone().run_active_discovery());
                }
                DiscoveryMode::Passive => {
                    let (listener, rx) = AnnounceListener::new(transport.announce_filter());
                    match transport.register_announce_handler(listener) {
                        Ok(()) => control.spawn(forward_announces(
                            rx,
                            connections.clone(),
                            shutdown_rx.clone(),
                        )),
                        Err(e) => warn!(error = %e, "Cannot listen for announces"),
                    }
                }
            }
        }

        debug!(tasks = control.running(), "Session started");
        Session {
            shutdown_tx,
            control,
            peers,
            connections,
        }
    }

    async fn stop_session(&self, session: Session) {
        session.shutdown_tx.send_replace(true);
        session.control.join_all().await;
        self.ctx.transport.stop().await;
        let closed = self.ctx.registry.clear().await;
        session.peers.join_all().await;
        session.connections.clear_pending();
        info!(closed, "Session stopped");
    }

    /// Connect to every listed address. A no-op until a local key exists.
    ///
    /// Returns the number of new connections.
    pub async fn init_channels(&self, addresses: Vec<String>) -> usize {
        if !self.ctx.local_key.is_set() {
            info!("No local key yet, skipping channel initialization");
            return 0;
        }

        // Released before connecting so delete_channels can cancel us.
        let connections = {
            let mut session = self.session.lock().await;
            if session.is_none() {
                let config = self.config();
                *session = Some(self.start_session(&config).await);
            }
            match session.as_ref() {
                Some(s) => s.connections.clone(),
                None => return 0,
            }
        };

        let connected = connections.connect_all(addresses).await;
        info!(connected, total = self.ctx.registry.len(), "Channels initialized");
        connected
    }

    /// Stop all loops, close every peer and forget pending attempts.
    pub async fn delete_channels(&self) {
        let session = self.session.lock().await.take();
        match session {
            Some(session) => self.stop_session(session).await,
            None => {
                self.ctx.registry.clear().await;
            }
        }
    }

    /// Install (or replace) the local identity key.
    pub fn distribute_pk(&self, key: Vec<u8>) {
        info!(bytes = key.len(), "Local key updated");
        self.ctx.local_key.set(key);
    }

    /// Snapshot of every remote key received so far.
    pub fn collect_pks(&self) -> Vec<PublicKeyRecord> {
        self.ctx.keys.list()
    }

    /// Queue a payload for every connected peer.
    pub fn send(&self, payload: Vec<u8>) {
        debug!(bytes = payload.len(), "Message submitted");
        self.ctx.outbox.push(payload);
    }

    /// Take every message received since the last call.
    pub fn recv_messages(&self) -> Vec<MessageRecord> {
        self.ctx.inbox.drain()
    }

    /// Peers, pending attempts and recorded failures.
    pub async fn health(&self) -> HealthReport {
        let session = self.session.lock().await;
        let pending = session
            .as_ref()
            .map(|s| s.connections.pending())
            .unwrap_or_default();
        let mut peers: Vec<PeerInfo> = self
            .ctx
            .registry
            .list()
            .iter()
            .map(|p| p.info())
            .collect();
        peers.sort_by(|a, b| a.remote_id.cmp(&b.remote_id));
        HealthReport {
            running: session.is_some(),
            peers,
            pending,
            last_errors: self.ctx.health.snapshot(),
            public_keys: self.ctx.keys.len(),
            inbox: self.ctx.inbox.len(),
            outbox: self.ctx.outbox.len(),
        }
    }

    /// Cancel and join every background task.
    pub async fn shutdown(&self) {
        self.delete_channels().await;
        info!(platform = self.platform(), "Relay shut down");
    }
}
