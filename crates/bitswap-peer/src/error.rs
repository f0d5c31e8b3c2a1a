//! Error types for the BitSwap responder.

use libp2p_identity::PeerId;

use crate::protocol::{ProtocolVersion, WantType};

/// A specialized `Result` type for responder operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for responder operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A want entry carried bytes that do not parse as a CID.
    #[error("malformed content identifier: {0}")]
    MalformedIdentifier(#[from] cid::Error),

    /// The want type cannot be answered under the negotiated protocol.
    #[error("want type {want_type:?} is not supported by {protocol}")]
    UnsupportedWantKind {
        /// Requested want type.
        want_type: WantType,
        /// Negotiated protocol version.
        protocol: ProtocolVersion,
    },

    /// The fetch call for a whole batch failed.
    #[error("batch fetch failed: {0}")]
    BatchFetch(String),

    /// Dialing or reusing the connection to the peer failed.
    #[error("failed to acquire connection to {peer}: {reason}")]
    ConnectionAcquisition {
        /// Remote peer.
        peer: PeerId,
        /// Transport-level reason.
        reason: String,
    },

    /// A send on an established connection failed.
    #[error("send failed: {0}")]
    Send(String),

    /// An inbound payload could not be decoded into a wantlist.
    #[error("failed to decode wantlist: {0}")]
    Decode(String),

    /// A storage backend lookup failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// The sled database reported an error.
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    /// Metrics registration failed.
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// The configuration is invalid.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The session has already ended.
    #[error("session has ended")]
    SessionEnded,
}

impl Error {
    /// Helper for wrapping storage failures.
    pub fn storage(msg: impl Into<String>) -> Self {
        Error::Storage(msg.into())
    }

    /// Label used for the error counter in telemetry.
    pub fn category(&self) -> &'static str {
        match self {
            Error::MalformedIdentifier(_) => "malformed_cid",
            Error::UnsupportedWantKind { .. } => "unsupported_want",
            Error::BatchFetch(_) => "batch_fetch",
            Error::ConnectionAcquisition { .. } => "connection",
            Error::Send(_) => "send",
            Error::Decode(_) => "decode",
            Error::Storage(_) | Error::Sled(_) => "storage",
            Error::Metrics(_) | Error::Config(_) | Error::Io(_) => "internal",
            Error::SessionEnded => "session_ended",
        }
    }
}
