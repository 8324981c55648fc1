//! Public key store and the local identity key holder.
//!
//! The [`PublicKeyStore`] is an append-only set of remote identity keys,
//! deduplicated by content. Records are never removed or modified once
//! inserted.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use centi_types::protocol::encode_payload;
use centi_types::PublicKeyRecord;
use rand::RngCore;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::debug;

/// Thread-safe, append-only set of remote public keys.
#[derive(Debug)]
pub struct PublicKeyStore {
    platform: &'static str,
    records: Mutex<Vec<PublicKeyRecord>>,
}

impl PublicKeyStore {
    /// Create an empty store whose records carry `platform`.
    pub fn new(platform: &'static str) -> Self {
        Self {
            platform,
            records: Mutex::new(Vec::new()),
        }
    }

    /// Insert a raw key unless a record with the same content exists.
    ///
    /// Returns `true` if a new record was created.
    pub fn add(&self, raw: &[u8]) -> bool {
        let content = encode_payload(raw);
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        if records.iter().any(|r| r.content == content) {
            return false;
        }
        records.push(PublicKeyRecord {
            platform: self.platform.to_string(),
            alias: generate_alias(self.platform),
            content,
        });
        debug!(platform = self.platform, total = records.len(), "Stored new public key");
        true
    }

    /// Point-in-time copy of all records, in insertion order.
    pub fn list(&self) -> Vec<PublicKeyRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether no key has been stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `<platform>:<base64 of 16 random bytes>`
fn generate_alias(platform: &str) -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{platform}:{}", STANDARD.encode(bytes))
}

/// Holder for this node's own identity key.
///
/// Backed by a watch channel so per-peer send loops can wait for the key to
/// appear without polling.
#[derive(Debug)]
pub struct LocalKey {
    tx: watch::Sender<Option<Arc<Vec<u8>>>>,
}

impl LocalKey {
    /// Create a holder with no key.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Replace the local key. Wakes every waiter.
    pub fn set(&self, key: Vec<u8>) {
        self.tx.send_replace(Some(Arc::new(key)));
    }

    /// Current key, if one has been distributed.
    pub fn get(&self) -> Option<Arc<Vec<u8>>> {
        self.tx.borrow().clone()
    }

    /// Whether a local key has been distributed.
    pub fn is_set(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Subscribe to key changes.
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<Vec<u8>>>> {
        self.tx.subscribe()
    }
}

impl Default for LocalKey {
    fn default() -> Self {
        Self::new()
    }
}
