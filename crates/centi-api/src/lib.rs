//! HTTP shell of the centi transport microservices.
//!
//! The control plane POSTs one JSON command envelope per request; the
//! response body is the JSON response envelope produced by the relay's
//! dispatcher.

pub mod server;

pub use server::{build_router, serve};
