//! In-process mesh overlay.
//!
//! A [`LoopbackNetwork`] connects any number of [`LoopbackOverlay`] nodes
//! living in one process. Paths are learned from announces or resolved on
//! request; destinations can be marked unreachable so path requests never
//! resolve.

use super::mesh::{
    AnnounceCallback, ClosedCallback, LinkCallback, Overlay, OverlayLink, PacketCallback,
    DESTINATION_LEN,
};
use centi_types::TransportError;
use rand::RngCore;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

struct Destination {
    node: usize,
    identity: Vec<u8>,
    aspect: String,
    on_link: LinkCallback,
}

#[derive(Default)]
struct Node {
    paths: HashSet<Vec<u8>>,
    handlers: Vec<(Option<String>, AnnounceCallback)>,
}

#[derive(Default)]
struct NetworkState {
    nodes: Vec<Node>,
    destinations: HashMap<Vec<u8>, Destination>,
    unreachable: HashSet<Vec<u8>>,
}

#[derive(Default)]
struct Counters {
    links_opened: AtomicUsize,
    path_requests: AtomicUsize,
    announces: AtomicUsize,
}

/// Shared medium of a set of loopback nodes.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    state: Arc<Mutex<NetworkState>>,
    counters: Arc<Counters>,
}

impl LoopbackNetwork {
    /// Create an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new node.
    pub fn node(&self) -> LoopbackOverlay {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.nodes.push(Node::default());
        LoopbackOverlay {
            network: self.clone(),
            node: state.nodes.len() - 1,
        }
    }

    /// Make path requests for `destination` resolve (or never resolve).
    pub fn set_reachable(&self, destination: &[u8], reachable: bool) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if reachable {
            state.unreachable.remove(destination);
        } else {
            state.unreachable.insert(destination.to_vec());
        }
    }

    /// Number of links opened so far.
    pub fn links_opened(&self) -> usize {
        self.counters.links_opened.load(Ordering::SeqCst)
    }

    /// Number of path requests seen so far.
    pub fn path_requests(&self) -> usize {
        self.counters.path_requests.load(Ordering::SeqCst)
    }

    /// Number of announces sent so far.
    pub fn announces(&self) -> usize {
        self.counters.announces.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// One node on a [`LoopbackNetwork`].
pub struct LoopbackOverlay {
    network: LoopbackNetwork,
    node: usize,
}

fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

impl Overlay for LoopbackOverlay {
    fn start(&self, _config_path: Option<&str>) -> Result<(), TransportError> {
        Ok(())
    }

    fn generate_identity(&self) -> Vec<u8> {
        random_bytes(32)
    }

    fn has_path(&self, destination: &[u8]) -> bool {
        self.network.lock().nodes[self.node].paths.contains(destination)
    }

    fn request_path(&self, destination: &[u8]) -> Result<(), TransportError> {
        self.network
            .counters
            .path_requests
            .fetch_add(1, Ordering::SeqCst);
        let mut state = self.network.lock();
        if state.destinations.contains_key(destination) && !state.unreachable.contains(destination)
        {
            state.nodes[self.node].paths.insert(destination.to_vec());
        }
        Ok(())
    }

    fn recall_identity(&self, destination: &[u8]) -> Option<Vec<u8>> {
        let state = self.network.lock();
        if !state.nodes[self.node].paths.contains(destination) {
            return None;
        }
        state.destinations.get(destination).map(|d| d.identity.clone())
    }

    fn open_link(
        &self,
        identity: &[u8],
        aspect: &str,
    ) -> Result<Arc<dyn OverlayLink>, TransportError> {
        let on_link = {
            let state = self.network.lock();
            state
                .destinations
                .iter()
                .find(|(hash, d)| {
                    d.identity == identity
                        && d.aspect == aspect
                        && !state.unreachable.contains(*hash)
                })
                .map(|(_, d)| d.on_link.clone())
        };
        let on_link = on_link.ok_or_else(|| TransportError::ConnectFailed {
            address: hex::encode(identity),
            reason: "no such destination".to_string(),
        })?;

        let (initiator, responder) = LoopbackLink::pair();
        let initiator: Arc<dyn OverlayLink> = initiator;
        let responder: Arc<dyn OverlayLink> = responder;
        self.network
            .counters
            .links_opened
            .fetch_add(1, Ordering::SeqCst);
        on_link(responder);
        Ok(initiator)
    }

    fn listen(
        &self,
        identity: &[u8],
        aspect: &str,
        on_link: LinkCallback,
    ) -> Result<Vec<u8>, TransportError> {
        let hash = random_bytes(DESTINATION_LEN);
        self.network.lock().destinations.insert(
            hash.clone(),
            Destination {
                node: self.node,
                identity: identity.to_vec(),
                aspect: aspect.to_string(),
                on_link,
            },
        );
        Ok(hash)
    }

    fn stop_listening(&self, destination: &[u8]) {
        self.network.lock().destinations.remove(destination);
    }

    fn announce(&self, destination: &[u8]) -> Result<(), TransportError> {
        let handlers: Vec<AnnounceCallback> = {
            let mut state = self.network.lock();
            let aspect = match state.destinations.get(destination) {
                Some(d) if d.node == self.node => d.aspect.clone(),
                _ => {
                    return Err(TransportError::Backend(
                        "announcing a foreign destination".to_string(),
                    ))
                }
            };
            let mut handlers = Vec::new();
            for (index, node) in state.nodes.iter_mut().enumerate() {
                if index == self.node {
                    continue;
                }
                node.paths.insert(destination.to_vec());
                handlers.extend(
                    node.handlers
                        .iter()
                        .filter(|(filter, _)| filter.as_deref().map_or(true, |f| f == aspect))
                        .map(|(_, cb)| cb.clone()),
                );
            }
            handlers
        };
        self.network.counters.announces.fetch_add(1, Ordering::SeqCst);
        for handler in handlers {
            handler(destination, None);
        }
        Ok(())
    }

    fn register_announce_handler(&self, aspect_filter: Option<&str>, callback: AnnounceCallback) {
        self.network.lock().nodes[self.node]
            .handlers
            .push((aspect_filter.map(str::to_string), callback));
    }
}

#[derive(Default)]
struct EndState {
    on_packet: Option<PacketCallback>,
    on_closed: Option<ClosedCallback>,
    buffered: Vec<Vec<u8>>,
}

struct LinkShared {
    id: Vec<u8>,
    ends: [Mutex<EndState>; 2],
    closed: AtomicBool,
}

/// One end of an in-process link.
pub struct LoopbackLink {
    shared: Arc<LinkShared>,
    side: usize,
}

impl LoopbackLink {
    fn pair() -> (Arc<Self>, Arc<Self>) {
        let shared = Arc::new(LinkShared {
            id: random_bytes(DESTINATION_LEN),
            ends: [Mutex::default(), Mutex::default()],
            closed: AtomicBool::new(false),
        });
        (
            Arc::new(Self {
                shared: shared.clone(),
                side: 0,
            }),
            Arc::new(Self { shared, side: 1 }),
        )
    }

    fn end(&self, side: usize) -> std::sync::MutexGuard<'_, EndState> {
        self.shared.ends[side]
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}

impl OverlayLink for LoopbackLink {
    fn link_id(&self) -> Vec<u8> {
        self.shared.id.clone()
    }

    fn send(&self, payload: &[u8]) -> Result<(), TransportError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        // Delivered under the receiving end's lock to keep packet order.
        let mut remote = self.end(1 - self.side);
        match remote.on_packet.as_ref() {
            Some(deliver) => deliver(payload.to_vec()),
            None => remote.buffered.push(payload.to_vec()),
        }
        Ok(())
    }

    fn set_packet_callback(&self, callback: PacketCallback) {
        let mut local = self.end(self.side);
        for packet in std::mem::take(&mut local.buffered) {
            callback(packet);
        }
        local.on_packet = Some(callback);
    }

    fn set_closed_callback(&self, callback: ClosedCallback) {
        if self.shared.closed.load(Ordering::SeqCst) {
            callback();
            return;
        }
        self.end(self.side).on_closed = Some(callback);
    }

    fn teardown(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for side in 0..2 {
            let callback = self.end(side).on_closed.take();
            if let Some(callback) = callback {
                callback();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ignore_links() -> LinkCallback {
        Arc::new(|_link: Arc<dyn OverlayLink>| {})
    }

    #[test]
    fn test_announce_teaches_paths_and_filters() {
        let network = LoopbackNetwork::new();
        let a = network.node();
        let b = network.node();

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        b.register_announce_handler(
            Some("app.announce"),
            Arc::new(move |_dest: &[u8], _data: Option<&[u8]>| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        b.register_announce_handler(
            Some("other.announce"),
            Arc::new(|_dest: &[u8], _data: Option<&[u8]>| panic!("filtered out")),
        );

        let dest = a
            .listen(&a.generate_identity(), "app.announce", ignore_links())
            .unwrap();
        assert!(!b.has_path(&dest));
        a.announce(&dest).unwrap();
        assert!(b.has_path(&dest));
        assert!(!a.has_path(&dest));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unreachable_destination_never_resolves() {
        let network = LoopbackNetwork::new();
        let a = network.node();
        let b = network.node();
        let dest = a
            .listen(&a.generate_identity(), "app.announce", ignore_links())
            .unwrap();

        network.set_reachable(&dest, false);
        b.request_path(&dest).unwrap();
        assert!(!b.has_path(&dest));

        network.set_reachable(&dest, true);
        b.request_path(&dest).unwrap();
        assert!(b.has_path(&dest));
        assert_eq!(network.path_requests(), 2);
    }

    #[test]
    fn test_packets_before_callback_are_buffered() {
        let (a, b) = LoopbackLink::pair();
        a.send(b"early").unwrap();

        let got = Arc::new(Mutex::new(Vec::new()));
        let sink = got.clone();
        b.set_packet_callback(Box::new(move |p: Vec<u8>| sink.lock().unwrap().push(p)));
        a.send(b"late").unwrap();
        assert_eq!(*got.lock().unwrap(), vec![b"early".to_vec(), b"late".to_vec()]);
    }

    #[test]
    fn test_teardown_notifies_both_ends_once() {
        let (a, b) = LoopbackLink::pair();
        let closes = Arc::new(AtomicUsize::new(0));
        for end in [&a, &b] {
            let c = closes.clone();
            end.set_closed_callback(Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }));
        }
        b.teardown();
        a.teardown();
        assert_eq!(closes.load(Ordering::SeqCst), 2);
        assert!(matches!(a.send(b"x"), Err(TransportError::Closed)));
    }
}
