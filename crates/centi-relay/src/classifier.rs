//! Inbound payload classification.
//!
//! The transports carry no framing that distinguishes an identity key from
//! an application message, so classification is positional and size based:
//!
//! 1. The first payload on a fresh connection is the peer's identity key,
//!    whatever its size.
//! 2. Every later payload shorter than [`KEY_SIZE_THRESHOLD`] is a key; a
//!    payload of the threshold length or longer is a message.
//!
//! A large key or a tiny message is misclassified. That is a known
//! limitation of the protocol.

use crate::keystore::PublicKeyStore;
use crate::queue::Inbox;
use tracing::debug;

/// Payloads shorter than this are treated as identity keys.
pub const KEY_SIZE_THRESHOLD: usize = 2048;

/// Where a payload belongs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    IdentityKey,
    Message,
}

/// Per-connection classifier. Create one for every new connection.
#[derive(Debug, Clone)]
pub struct Classifier {
    threshold: usize,
    seen_first: bool,
}

impl Classifier {
    /// Create a classifier for a fresh connection.
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            seen_first: false,
        }
    }

    /// Classify the next payload received on this connection.
    pub fn classify(&mut self, payload: &[u8]) -> Classification {
        if !self.seen_first {
            self.seen_first = true;
            return Classification::IdentityKey;
        }
        if payload.len() < self.threshold {
            Classification::IdentityKey
        } else {
            Classification::Message
        }
    }

    /// Classify and store a payload in exactly one destination.
    pub fn route(
        &mut self,
        peer: &str,
        payload: &[u8],
        keys: &PublicKeyStore,
        inbox: &Inbox,
    ) -> Classification {
        let class = self.classify(payload);
        match class {
            Classification::IdentityKey => {
                let inserted = keys.add(payload);
                debug!(peer, bytes = payload.len(), inserted, "Received a public key");
            }
            Classification::Message => {
                inbox.push(payload);
                debug!(peer, bytes = payload.len(), "Received a message");
            }
        }
        class
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(KEY_SIZE_THRESHOLD)
    }
}
