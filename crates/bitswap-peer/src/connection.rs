//! Transport seam: outbound connections to peers.
//!
//! Stream negotiation, encryption, multiplexing and message encoding live
//! behind these traits.

use std::sync::Arc;

use async_trait::async_trait;
use libp2p_identity::PeerId;

use crate::error::Result;
use crate::message::OutboundMessage;
use crate::protocol::ProtocolVersion;

/// An open stream to a peer that accepts encoded BitSwap messages.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Encodes and writes one message.
    async fn send(&self, message: &OutboundMessage) -> Result<()>;

    /// Closes the stream.
    async fn close(&self) -> Result<()>;

    /// Resolves once the peer has closed the stream. Never resolves by default.
    async fn closed(&self) {
        futures::future::pending::<()>().await
    }
}

/// Opens outbound connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, peer: &PeerId, protocol: ProtocolVersion)
        -> Result<Arc<dyn Connection>>;
}
