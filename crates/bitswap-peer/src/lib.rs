//! BitSwap responder.
//!
//! Answers peers' wantlists with blocks and block presences read from a
//! [`BlockStore`](store::BlockStore). A received wantlist is split into
//! batches; each batch is resolved against storage, packed into messages that
//! respect the message size limit and sent over a per-peer [`Session`]
//! connection. The session ends once every batch has been accounted for.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use bitswap_peer::{
//!     Connector, JsonWantlistCodec, MemoryBlockStore, ProtocolVersion, Responder,
//!     ResponderConfig, ResponderMetrics,
//! };
//! use libp2p_identity::PeerId;
//!
//! # async fn run(connector: Arc<dyn Connector>) -> bitswap_peer::Result<()> {
//! let store = Arc::new(MemoryBlockStore::new());
//! let cid = store.put(&b"hello"[..]);
//!
//! let metrics = ResponderMetrics::new(prometheus::default_registry())?;
//! let responder = Responder::with_store(
//!     ResponderConfig::from_env()?,
//!     store,
//!     connector,
//!     Arc::new(JsonWantlistCodec),
//!     metrics,
//! );
//!
//! let payload = format!(r#"{{"entries":[{{"cid":"{cid}"}}]}}"#);
//! if let Some(task) =
//!     responder.handle_payload(PeerId::random(), ProtocolVersion::V120, payload.as_bytes(), None)
//! {
//!     let summary = task.await.expect("responder task");
//!     assert_eq!(summary.entries_sent, 1);
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]

pub mod cache;
pub mod config;
pub mod connection;
pub mod error;
pub mod fetch;
pub mod message;
pub mod protocol;
pub mod scheduler;
pub mod service;
pub mod session;
pub mod store;
pub mod telemetry;

use std::path::PathBuf;

pub use cache::BlockInfoCache;
pub use config::ResponderConfig;
pub use connection::{Connection, Connector};
pub use error::{Error, Result};
pub use fetch::{BlockFetcher, FetchCoordinator, StoreFetcher};
pub use message::{pack, OutboundMessage};
pub use protocol::{
    Block, BlockKey, BlockPresence, PresenceKind, ProtocolVersion, ResolvedItem, WantEntry,
    WantType, Wantlist,
};
pub use scheduler::{RunSummary, WantlistScheduler};
pub use service::{JsonWantlistCodec, Responder, WantlistCodec};
pub use session::{SendOutcome, Session, SessionProgress, SessionState};
pub use store::{BlockStore, MemoryBlockStore, SledBlockStore};
pub use telemetry::ResponderMetrics;

pub use cid::Cid;
pub use libp2p_identity::PeerId;

/// Default location of the block store used by the command line tool.
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("bitswap-peer")
        .join("blocks")
}
