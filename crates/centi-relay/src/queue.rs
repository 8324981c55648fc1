//! Directional message queues between the control plane and the transport.
//!
//! - [`Inbox`]: payloads received from peers, drained by `recv_messages`.
//! - [`Outbox`]: payloads submitted by `send`, drained by the fan-out pump.

use centi_types::protocol::encode_payload;
use centi_types::MessageRecord;
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Sender reported for every received message; the transports do not
/// authenticate payload origin.
pub const UNKNOWN_SENDER: &str = "";

/// Received messages, in receipt order. Consume-once.
#[derive(Debug)]
pub struct Inbox {
    platform: &'static str,
    messages: Mutex<Vec<MessageRecord>>,
}

impl Inbox {
    /// Create an empty inbox tagging messages with `platform`.
    pub fn new(platform: &'static str) -> Self {
        Self {
            platform,
            messages: Mutex::new(Vec::new()),
        }
    }

    /// Append a received payload.
    pub fn push(&self, payload: &[u8]) {
        let record = MessageRecord {
            platform: self.platform.to_string(),
            data: encode_payload(payload),
            sender: UNKNOWN_SENDER.to_string(),
            sent_by_us: false,
            args: Value::Object(Map::new()),
        };
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
    }

    /// Atomically take every pending message.
    pub fn drain(&self) -> Vec<MessageRecord> {
        std::mem::take(&mut *self.messages.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Number of queued entries.
    pub fn len(&self) -> usize {
        self.messages.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Payloads waiting to be broadcast, in submission order.
#[derive(Debug, Default)]
pub struct Outbox {
    queue: Mutex<VecDeque<Arc<Vec<u8>>>>,
    notify: Notify,
}

impl Outbox {
    /// Create an empty outbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a payload and wake the pump.
    pub fn push(&self, payload: Vec<u8>) {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Arc::new(payload));
        self.notify.notify_one();
    }

    /// Take the oldest pending payload.
    pub fn pop(&self) -> Option<Arc<Vec<u8>>> {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    /// Wait until something is pushed. A push that happened since the last
    /// wait completes this immediately.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    /// Drop everything still queued.
    pub fn clear(&self) {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Number of queued entries.
    pub fn len(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_inbox_drains_once() {
        let inbox = Inbox::new("reticulum");
        inbox.push(b"one");
        inbox.push(b"two");

        let first = inbox.drain();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].data, encode_payload(b"one"));
        assert_eq!(first[1].data, encode_payload(b"two"));
        assert_eq!(first[0].sender, UNKNOWN_SENDER);
        assert!(!first[0].sent_by_us);

        assert!(inbox.drain().is_empty());
    }

    #[test]
    fn test_outbox_fifo() {
        let outbox = Outbox::new();
        outbox.push(b"a".to_vec());
        outbox.push(b"b".to_vec());
        assert_eq!(outbox.pop().unwrap().as_slice(), b"a");
        assert_eq!(outbox.pop().unwrap().as_slice(), b"b");
        assert!(outbox.pop().is_none());
    }

    #[tokio::test]
    async fn test_push_before_wait_is_not_lost() {
        let outbox = Outbox::new();
        outbox.push(b"early".to_vec());
        tokio::time::timeout(Duration::from_secs(1), outbox.notified())
            .await
            .expect("stored permit should complete the wait");
        assert_eq!(outbox.len(), 1);
    }
}
