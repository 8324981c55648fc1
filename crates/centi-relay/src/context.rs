//! The per-instance relay context.
//!
//! Every shared collection lives here behind its own lock. One context is
//! built per microservice instance and passed explicitly to every
//! component, so independent instances can coexist in one process.

use crate::classifier::KEY_SIZE_THRESHOLD;
use crate::keystore::{LocalKey, PublicKeyStore};
use crate::queue::{Inbox, Outbox};
use crate::registry::PeerRegistry;
use crate::transport::Transport;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Timing and sizing knobs. The defaults match the deployed services;
/// tests shrink the intervals.
#[derive(Debug, Clone)]
pub struct RelayTuning {
    /// Delay between path polls during a connection attempt.
    pub poll_interval: Duration,
    /// Sleep range between active discovery scans.
    pub discovery_interval: (Duration, Duration),
    /// Sleep range between self-announces when serving.
    pub announce_interval: (Duration, Duration),
    /// Back-off after a failed accept.
    pub accept_backoff: Duration,
    /// Inbound classification threshold.
    pub key_threshold: usize,
}

impl Default for RelayTuning {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            discovery_interval: (Duration::from_secs(1), Duration::from_secs(5)),
            announce_interval: (Duration::from_millis(100), Duration::from_millis(1000)),
            accept_backoff: Duration::from_secs(1),
            key_threshold: KEY_SIZE_THRESHOLD,
        }
    }
}

/// Pick a uniformly random duration in `[min, max]`.
pub fn jittered((min, max): (Duration, Duration)) -> Duration {
    if max <= min {
        return min;
    }
    let min_ms = min.as_millis() as u64;
    let max_ms = max.as_millis() as u64;
    Duration::from_millis(rand::thread_rng().gen_range(min_ms..=max_ms))
}

/// A transport error remembered for health reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Last transport error per address.
#[derive(Debug, Default)]
pub struct HealthState {
    last_errors: Mutex<BTreeMap<String, ErrorRecord>>,
}

impl HealthState {
    /// Remember `error` as the last failure for `address`.
    pub fn record(&self, address: &str, error: &impl std::fmt::Display) {
        self.last_errors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                address.to_string(),
                ErrorRecord {
                    message: error.to_string(),
                    at: Utc::now(),
                },
            );
    }

    /// Forget the last failure for `address`.
    pub fn clear(&self, address: &str) {
        self.last_errors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(address);
    }

    /// Copy of every remembered failure, keyed by address.
    pub fn snapshot(&self) -> BTreeMap<String, ErrorRecord> {
        self.last_errors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// Shared state of one relay instance.
pub struct RelayContext {
    pub transport: Arc<dyn Transport>,
    pub tuning: RelayTuning,
    pub keys: PublicKeyStore,
    pub local_key: LocalKey,
    pub registry: PeerRegistry,
    pub inbox: Inbox,
    pub outbox: Outbox,
    pub health: HealthState,
}

impl RelayContext {
    /// Build the context for one instance.
    pub fn new(transport: Arc<dyn Transport>, tuning: RelayTuning) -> Arc<Self> {
        let platform = transport.platform();
        Arc::new(Self {
            transport,
            tuning,
            keys: PublicKeyStore::new(platform),
            local_key: LocalKey::new(),
            registry: PeerRegistry::new(),
            inbox: Inbox::new(platform),
            outbox: Outbox::new(),
            health: HealthState::default(),
        })
    }

    /// Platform tag of the underlying transport.
    pub fn platform(&self) -> &'static str {
        self.transport.platform()
    }
}
