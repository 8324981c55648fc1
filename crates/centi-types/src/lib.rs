//! Core types shared by the centi transport microservices.
//!
//! Both microservices speak the same JSON command protocol regardless of the
//! network transport they bridge to. This crate holds the protocol records,
//! the per-instance configuration, and the error taxonomy.

pub mod config;
pub mod error;
pub mod protocol;

pub use config::MicroserviceConfig;
pub use error::{
    ConfigError, DecodeError, ProtocolError, RelayError, RelayResult, TransportError,
};
pub use protocol::{Envelope, MessageRecord, PublicKeyRecord, Response, Status};
