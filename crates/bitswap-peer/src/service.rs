//! Entry point for inbound wantlists.
//!
//! [`Responder`] wires a fetcher, a connector and the configuration together.
//! Each received wantlist gets its own [`Session`] and is answered on a
//! spawned task, so the caller's read loop never waits on storage or sends.

use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use cid::Cid;
use libp2p_identity::PeerId;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cache::BlockInfoCache;
use crate::config::ResponderConfig;
use crate::connection::{Connection, Connector};
use crate::error::{Error, Result};
use crate::fetch::{BlockFetcher, FetchCoordinator, StoreFetcher};
use crate::protocol::{ProtocolVersion, WantEntry, WantType, Wantlist};
use crate::scheduler::{RunSummary, WantlistScheduler};
use crate::session::Session;
use crate::store::BlockStore;
use crate::telemetry::ResponderMetrics;

/// Turns a raw inbound payload into a [`Wantlist`].
pub trait WantlistCodec: Send + Sync {
    fn decode(&self, payload: &[u8], protocol: ProtocolVersion) -> Result<Wantlist>;
}

/// Decodes wantlists written as JSON:
///
/// ```json
/// { "entries": [ { "cid": "bafk...", "type": "have", "send_dont_have": true } ] }
/// ```
///
/// `type` defaults to `block`; `send_dont_have` and `cancel` default to false.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonWantlistCodec;

#[derive(Deserialize)]
struct JsonWantlist {
    #[serde(default)]
    entries: Vec<JsonEntry>,
}

#[derive(Deserialize)]
struct JsonEntry {
    cid: String,
    #[serde(rename = "type", default = "default_want_type")]
    want_type: WantType,
    #[serde(default)]
    send_dont_have: bool,
    #[serde(default)]
    cancel: bool,
}

fn default_want_type() -> WantType {
    WantType::Block
}

impl WantlistCodec for JsonWantlistCodec {
    fn decode(&self, payload: &[u8], _protocol: ProtocolVersion) -> Result<Wantlist> {
        let decoded: JsonWantlist =
            serde_json::from_slice(payload).map_err(|e| Error::Decode(e.to_string()))?;

        let entries = decoded
            .entries
            .into_iter()
            .map(|entry| {
                // unparsable identifiers are kept so the entry is rejected on its own
                let cid = match Cid::from_str(&entry.cid) {
                    Ok(cid) => Bytes::from(cid.to_bytes()),
                    Err(_) => Bytes::from(entry.cid.into_bytes()),
                };
                WantEntry {
                    cid,
                    want_type: entry.want_type,
                    send_dont_have: entry.send_dont_have,
                    cancel: entry.cancel,
                }
            })
            .collect();
        Ok(Wantlist::new(entries))
    }
}

/// Answers wantlists from peers.
#[derive(Clone)]
pub struct Responder {
    config: Arc<ResponderConfig>,
    scheduler: WantlistScheduler,
    connector: Arc<dyn Connector>,
    codec: Arc<dyn WantlistCodec>,
    metrics: ResponderMetrics,
}

impl Responder {
    pub fn new(
        config: ResponderConfig,
        fetcher: Arc<dyn BlockFetcher>,
        connector: Arc<dyn Connector>,
        codec: Arc<dyn WantlistCodec>,
        metrics: ResponderMetrics,
    ) -> Self {
        let coordinator = FetchCoordinator::new(fetcher, metrics.clone());
        let scheduler =
            WantlistScheduler::new(coordinator, config.max_message_size, metrics.clone());
        Self {
            config: Arc::new(config),
            scheduler,
            connector,
            codec,
            metrics,
        }
    }

    /// Builds a responder reading from `store`, with the block info cache
    /// enabled when the configuration asks for it.
    pub fn with_store<S: BlockStore>(
        config: ResponderConfig,
        store: Arc<S>,
        connector: Arc<dyn Connector>,
        codec: Arc<dyn WantlistCodec>,
        metrics: ResponderMetrics,
    ) -> Self {
        let mut fetcher = StoreFetcher::new(
            store,
            config.fetch_concurrency,
            config.max_block_size,
            metrics.clone(),
        );
        if config.cache_blocks_info {
            fetcher = fetcher.with_cache(Arc::new(BlockInfoCache::new(config.cache_capacity)));
        }
        Self::new(config, Arc::new(fetcher), connector, codec, metrics)
    }

    pub fn config(&self) -> &ResponderConfig {
        &self.config
    }

    pub fn metrics(&self) -> &ResponderMetrics {
        &self.metrics
    }

    /// Decodes `payload` and starts answering it.
    ///
    /// Returns `None` when the payload cannot be decoded; no session is
    /// created in that case.
    pub fn handle_payload(
        &self,
        peer: PeerId,
        protocol: ProtocolVersion,
        payload: &[u8],
        inbound: Option<Arc<dyn Connection>>,
    ) -> Option<JoinHandle<RunSummary>> {
        match self.codec.decode(payload, protocol) {
            Ok(wantlist) => Some(self.handle_wantlist(peer, protocol, wantlist, inbound)),
            Err(err) => {
                warn!(
                    target: "bitswap",
                    %peer,
                    %protocol,
                    error = %err,
                    "cannot decode received data"
                );
                self.metrics.record_error(&err);
                None
            }
        }
    }

    /// Starts answering `wantlist` on a new task.
    pub fn handle_wantlist(
        &self,
        peer: PeerId,
        protocol: ProtocolVersion,
        wantlist: Wantlist,
        inbound: Option<Arc<dyn Connection>>,
    ) -> JoinHandle<RunSummary> {
        let responder = self.clone();
        tokio::spawn(async move { responder.respond(peer, protocol, wantlist, inbound).await })
    }

    /// Answers `wantlist` and waits for the session to finish.
    ///
    /// With an `inbound` connection the answers go back over it; otherwise the
    /// session dials the peer on its first send.
    pub async fn respond(
        &self,
        peer: PeerId,
        protocol: ProtocolVersion,
        wantlist: Wantlist,
        inbound: Option<Arc<dyn Connection>>,
    ) -> RunSummary {
        let session = match inbound {
            Some(connection) => Session::with_connection(
                peer,
                protocol,
                self.connector.clone(),
                connection,
                self.metrics.clone(),
            ),
            None => Session::new(peer, protocol, self.connector.clone(), self.metrics.clone()),
        };
        debug!(target: "bitswap", %peer, %protocol, entries = wantlist.len(), "received wantlist");

        let summary = self
            .scheduler
            .run(wantlist, self.config.batch_size, session.clone())
            .await;

        // an empty wantlist plans nothing, so nothing else ends the session
        if !session.is_ended() {
            session.end().await;
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::OutboundMessage;
    use crate::store::MemoryBlockStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use prometheus::Registry;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Inbound {
        sent: Mutex<Vec<OutboundMessage>>,
        closes: AtomicUsize,
    }

    #[async_trait]
    impl Connection for Inbound {
        async fn send(&self, message: &OutboundMessage) -> Result<()> {
            self.sent.lock().push(message.clone());
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct NoDial {
        dials: AtomicUsize,
    }

    #[async_trait]
    impl Connector for NoDial {
        async fn connect(
            &self,
            peer: &PeerId,
            _protocol: ProtocolVersion,
        ) -> Result<Arc<dyn Connection>> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            Err(Error::ConnectionAcquisition {
                peer: *peer,
                reason: "unexpected dial".into(),
            })
        }
    }

    fn responder(store: Arc<MemoryBlockStore>, connector: Arc<NoDial>) -> Responder {
        let metrics =
            ResponderMetrics::new(&Registry::new()).expect("Failed to create test metrics");
        Responder::with_store(
            ResponderConfig::default().cache_blocks_info(true).cache_capacity(16),
            store,
            connector,
            Arc::new(JsonWantlistCodec),
            metrics,
        )
    }

    #[test]
    fn test_json_codec_defaults() {
        let cid = crate::store::raw_cid(b"json");
        let payload = format!(
            r#"{{"entries":[
                {{"cid":"{cid}"}},
                {{"cid":"not-a-cid","type":"have","send_dont_have":true}}
            ]}}"#
        );
        let wantlist = JsonWantlistCodec
            .decode(payload.as_bytes(), ProtocolVersion::V120)
            .expect("decodes");

        assert_eq!(wantlist.entries[0], WantEntry::block(&cid));
        assert_eq!(wantlist.entries[1].want_type, WantType::Have);
        assert!(wantlist.entries[1].canonicalize().is_err());
    }

    #[tokio::test]
    async fn test_undecodable_payload_creates_no_session() {
        let connector = Arc::new(NoDial::default());
        let responder = responder(Arc::new(MemoryBlockStore::new()), connector.clone());

        let handle = responder.handle_payload(
            PeerId::random(),
            ProtocolVersion::V120,
            b"\x00\x01garbage",
            None,
        );

        assert!(handle.is_none());
        assert_eq!(responder.metrics().error_count("decode"), 1);
        assert_eq!(responder.metrics().active_requests(), 0);
        assert_eq!(connector.dials.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_answers_over_inbound_connection() {
        let store = Arc::new(MemoryBlockStore::new());
        let cid = store.put(&b"inbound"[..]);
        let connector = Arc::new(NoDial::default());
        let responder = responder(store, connector.clone());
        let inbound = Arc::new(Inbound::default());

        let payload = format!(r#"{{"entries":[{{"cid":"{cid}","type":"have"}}]}}"#);
        let summary = responder
            .handle_payload(
                PeerId::random(),
                ProtocolVersion::V120,
                payload.as_bytes(),
                Some(inbound.clone()),
            )
            .expect("payload decodes")
            .await
            .expect("task joins");

        assert_eq!(summary.entries_sent, 1);
        assert_eq!(inbound.sent.lock().len(), 1);
        assert_eq!(inbound.closes.load(Ordering::SeqCst), 1);
        assert_eq!(connector.dials.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_wantlist_still_releases_connection() {
        let connector = Arc::new(NoDial::default());
        let responder = responder(Arc::new(MemoryBlockStore::new()), connector);
        let inbound = Arc::new(Inbound::default());

        let summary = responder
            .respond(
                PeerId::random(),
                ProtocolVersion::V120,
                Wantlist::default(),
                Some(inbound.clone()),
            )
            .await;

        assert_eq!(summary.batches, 0);
        assert!(inbound.sent.lock().is_empty());
        assert_eq!(inbound.closes.load(Ordering::SeqCst), 1);
        assert_eq!(responder.metrics().active_connections(), 0);
    }
}
