//! Error taxonomy for the relay core.
//!
//! Only [`ProtocolError`] and [`DecodeError`] ever reach the command caller.
//! [`TransportError`]s stay inside the attempt or peer that produced them and
//! [`ConfigError`]s are replaced by defaults.

use thiserror::Error;

/// A configuration option was missing or malformed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The option was present but could not be interpreted.
    #[error("Invalid value for '{field}': {value}")]
    InvalidValue {
        /// Option name.
        field: &'static str,
        /// The raw value as received.
        value: String,
    },
}

/// The command envelope was well-formed JSON but not a valid command.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// `message_type` is not one of the recognized commands.
    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),

    /// A required argument was absent.
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    /// An argument was present but had the wrong shape.
    #[error("Invalid field '{field}': {reason}")]
    InvalidField {
        /// Argument name.
        field: &'static str,
        /// What was wrong with it.
        reason: String,
    },
}

/// The request body could not be decoded into an envelope at all.
#[derive(Error, Debug)]
pub enum DecodeError {
    /// Body was not valid JSON or lacked `message_type`.
    #[error("Malformed command body: {0}")]
    Json(#[from] serde_json::Error),

    /// Body was not UTF-8.
    #[error("Command body is not valid UTF-8")]
    NotUtf8,
}

/// A failure reported by (or while talking to) a transport collaborator.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Socket-level failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Opening a connection to the address failed.
    #[error("Connect to {address} failed: {reason}")]
    ConnectFailed {
        /// Target address.
        address: String,
        /// Collaborator-supplied reason.
        reason: String,
    },

    /// The reachability path never resolved within the attempt budget.
    #[error("No path to {address} after {attempts} polls")]
    PathTimeout {
        /// Target address.
        address: String,
        /// Number of polls performed.
        attempts: u32,
    },

    /// The address does not have the shape this transport expects.
    #[error("Invalid address '{address}': {reason}")]
    InvalidAddress {
        /// The rejected address.
        address: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The connection has been closed.
    #[error("Connection closed")]
    Closed,

    /// A received frame exceeded the size limit.
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Announced frame size.
        size: u32,
        /// Configured limit.
        max: u32,
    },

    /// The attempt was abandoned because the relay is shutting down.
    #[error("Cancelled by shutdown")]
    Cancelled,

    /// The transport does not offer this capability.
    #[error("Unsupported by this transport: {0}")]
    Unsupported(&'static str),

    /// Any other collaborator failure.
    #[error("Transport error: {0}")]
    Backend(String),
}

/// Umbrella error for the relay core.
#[derive(Error, Debug)]
pub enum RelayError {
    /// See [`ConfigError`].
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// See [`ProtocolError`].
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// See [`DecodeError`].
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// See [`TransportError`].
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A response could not be serialized.
    #[error("Failed to encode response: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Alias for Result with RelayError.
pub type RelayResult<T> = Result<T, RelayError>;
