//! Centi relay core: a transport-agnostic peer and message relay.
//!
//! Bridges the JSON command protocol of the centi microservices to a
//! network transport: tracks live peers, deduplicates remote identity keys,
//! queues messages in both directions, and establishes connections with a
//! bounded path-polling retry.
//!
//! ## Architecture
//!
//! - **Relay**: one instance per microservice; owns the session loops
//! - **Dispatcher**: maps command envelopes to relay operations
//! - **ConnectionManager**: path state machine, active and passive discovery
//! - **PeerRegistry**: live connections, each closed exactly once
//! - **PublicKeyStore** / **Inbox** / **Outbox**: independently locked state
//! - **Transport** / **PeerLink**: the seam every backend implements

pub mod announce;
pub mod backend;
pub mod classifier;
pub mod connection;
pub mod context;
pub mod dispatch;
pub mod frame;
pub mod keystore;
pub mod queue;
pub mod registry;
pub mod relay;
pub mod session;
pub mod tasks;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use announce::AnnounceListener;
pub use classifier::{Classification, Classifier, KEY_SIZE_THRESHOLD};
pub use connection::{ConnectionManager, PathState};
pub use context::{RelayContext, RelayTuning};
pub use dispatch::{Command, Dispatcher};
pub use keystore::{LocalKey, PublicKeyStore};
pub use queue::{Inbox, Outbox};
pub use registry::{Peer, PeerInfo, PeerRegistry};
pub use relay::{HealthReport, Relay};
pub use transport::{AnnounceHandler, DiscoveryMode, PeerLink, Transport};
