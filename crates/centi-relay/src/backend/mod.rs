//! Transport backends.
//!
//! - [`stream`]: framed byte streams over TCP, standing in for the
//!   short-range wireless link. Active discovery.
//! - [`mesh`]: adapter over a callback-driven mesh [`mesh::Overlay`].
//!   Passive, announce-driven discovery.
//! - [`loopback`]: an in-process overlay connecting several mesh nodes.

pub mod loopback;
pub mod mesh;
pub mod stream;

pub use loopback::{LoopbackNetwork, LoopbackOverlay};
pub use mesh::{MeshTransport, Overlay, OverlayLink};
pub use stream::StreamTransport;
