use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bitswap_peer::{
    Cid, Connection, Connector, Error, FetchCoordinator, JsonWantlistCodec, MemoryBlockStore,
    OutboundMessage, PeerId, PresenceKind, ProtocolVersion, ResolvedItem, Responder,
    ResponderConfig, ResponderMetrics, Session, SessionState, SledBlockStore, StoreFetcher,
    WantEntry, Wantlist, WantlistScheduler,
};
use parking_lot::Mutex;
use prometheus::Registry;
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

/// Connection that records what it is asked to send.
#[derive(Default)]
struct MockConnection {
    sent: Mutex<Vec<OutboundMessage>>,
    closes: AtomicUsize,
    fail_sends: AtomicBool,
    /// Cancelled when the simulated peer hangs up.
    peer_closed: CancellationToken,
    /// Hang up after this many successful sends.
    close_after: Option<usize>,
}

impl MockConnection {
    fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().clone()
    }

    fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn send(&self, message: &OutboundMessage) -> bitswap_peer::Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(Error::Send("stream reset by peer".into()));
        }
        let count = {
            let mut sent = self.sent.lock();
            sent.push(message.clone());
            sent.len()
        };
        if self.close_after == Some(count) {
            self.peer_closed.cancel();
        }
        Ok(())
    }

    async fn close(&self) -> bitswap_peer::Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn closed(&self) {
        self.peer_closed.cancelled().await
    }
}

struct MockConnector {
    connection: Arc<MockConnection>,
    dials: AtomicUsize,
    refuse: bool,
}

impl MockConnector {
    fn new(connection: MockConnection) -> Arc<Self> {
        Arc::new(Self {
            connection: Arc::new(connection),
            dials: AtomicUsize::new(0),
            refuse: false,
        })
    }

    fn refusing() -> Arc<Self> {
        Arc::new(Self {
            connection: Arc::new(MockConnection::default()),
            dials: AtomicUsize::new(0),
            refuse: true,
        })
    }

    fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        peer: &PeerId,
        _protocol: ProtocolVersion,
    ) -> bitswap_peer::Result<Arc<dyn Connection>> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        // leave room for concurrent batches to pile up on the dial
        tokio::time::sleep(Duration::from_millis(20)).await;
        if self.refuse {
            return Err(Error::ConnectionAcquisition {
                peer: *peer,
                reason: "connection refused".into(),
            });
        }
        Ok(self.connection.clone())
    }
}

fn create_test_metrics() -> ResponderMetrics {
    ResponderMetrics::new(&Registry::new()).expect("Failed to create test metrics")
}

fn create_responder(
    config: ResponderConfig,
    store: Arc<MemoryBlockStore>,
    connector: Arc<MockConnector>,
) -> Responder {
    Responder::with_store(
        config,
        store,
        connector,
        Arc::new(JsonWantlistCodec),
        create_test_metrics(),
    )
}

fn store_blocks(store: &MemoryBlockStore, count: u8) -> Vec<Cid> {
    (0..count)
        .map(|n| store.put(format!("block number {n}").into_bytes()))
        .collect()
}

fn sent_blocks(messages: &[OutboundMessage]) -> Vec<Cid> {
    messages
        .iter()
        .flat_map(|message| message.blocks().map(|block| block.cid))
        .collect()
}

#[tokio::test]
async fn test_five_entries_in_batches_of_two() -> Result<()> {
    let store = Arc::new(MemoryBlockStore::new());
    let cids = store_blocks(&store, 5);
    let connector = MockConnector::new(MockConnection::default());
    let responder = create_responder(
        ResponderConfig::default().batch_size(2),
        store,
        connector.clone(),
    );

    let wantlist = Wantlist::new(cids.iter().map(WantEntry::block).collect());
    let summary = responder
        .respond(PeerId::random(), ProtocolVersion::V120, wantlist, None)
        .await;

    assert_eq!(summary.batches, 3);
    assert_eq!(summary.entries_planned, 5);
    assert_eq!(summary.entries_sent, 5);
    assert_eq!(summary.state, SessionState::Ended);

    let mut received = sent_blocks(&connector.connection.sent());
    let mut expected = cids.clone();
    received.sort();
    expected.sort();
    assert_eq!(received, expected);

    assert_eq!(connector.dials(), 1);
    assert_eq!(connector.connection.closes(), 1);
    assert_eq!(responder.metrics().pending_entries(), 0);
    assert_eq!(responder.metrics().active_requests(), 0);
    assert_eq!(responder.metrics().active_connections(), 0);
    Ok(())
}

#[tokio::test]
async fn test_oversized_block_is_sent_alone() -> Result<()> {
    let store = Arc::new(MemoryBlockStore::new());
    let cid = store.put(vec![9u8; 10]);
    let connector = MockConnector::new(MockConnection::default());
    let responder = create_responder(
        ResponderConfig::default().max_message_size(4),
        store,
        connector.clone(),
    );

    let summary = responder
        .respond(
            PeerId::random(),
            ProtocolVersion::V120,
            Wantlist::new(vec![WantEntry::block(&cid)]),
            None,
        )
        .await;

    let sent = connector.connection.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].size(), 10);
    assert_eq!(sent_blocks(&sent), vec![cid]);
    assert_eq!(summary.entries_sent, 1);
    Ok(())
}

#[tokio::test]
async fn test_connection_failure_drains_remaining_batches() -> Result<()> {
    let store = Arc::new(MemoryBlockStore::new());
    let cids = store_blocks(&store, 5);
    let connector = MockConnector::refusing();
    let responder = create_responder(
        ResponderConfig::default().batch_size(1),
        store,
        connector.clone(),
    );

    let wantlist = Wantlist::new(cids.iter().map(WantEntry::block).collect());
    let summary = responder
        .respond(PeerId::random(), ProtocolVersion::V120, wantlist, None)
        .await;

    assert_eq!(summary.batches, 5);
    assert_eq!(summary.entries_sent, 0);
    assert_eq!(summary.state, SessionState::Ended);
    assert_eq!(connector.dials(), 1);
    assert!(connector.connection.sent().is_empty());
    assert_eq!(responder.metrics().error_count("connection"), 1);
    assert_eq!(responder.metrics().pending_entries(), 0);
    Ok(())
}

#[tokio::test]
async fn test_have_without_presence_support_is_dropped() -> Result<()> {
    let store = Arc::new(MemoryBlockStore::new());
    let cid = store.put(&b"present"[..]);
    let connector = MockConnector::new(MockConnection::default());
    let responder = create_responder(ResponderConfig::default(), store, connector.clone());

    let summary = responder
        .respond(
            PeerId::random(),
            ProtocolVersion::V110,
            Wantlist::new(vec![WantEntry::have(&cid).with_send_dont_have(true)]),
            None,
        )
        .await;

    assert_eq!(summary.state, SessionState::Ended);
    assert!(connector.connection.sent().is_empty());
    assert_eq!(connector.dials(), 0);
    assert_eq!(responder.metrics().error_count("unsupported_want"), 1);
    Ok(())
}

#[tokio::test]
async fn test_empty_wantlist_schedules_nothing() -> Result<()> {
    let metrics = create_test_metrics();
    let fetcher = StoreFetcher::new(Arc::new(MemoryBlockStore::new()), 4, 1024, metrics.clone());
    let scheduler = WantlistScheduler::new(
        FetchCoordinator::new(Arc::new(fetcher), metrics.clone()),
        1024,
        metrics.clone(),
    );
    let connector = MockConnector::new(MockConnection::default());
    let session = Session::new(
        PeerId::random(),
        ProtocolVersion::V120,
        connector.clone(),
        metrics.clone(),
    );

    let summary = scheduler
        .run(Wantlist::default(), 16, session.clone())
        .await;

    assert_eq!(summary.batches, 0);
    assert_eq!(summary.state, SessionState::Active);
    assert_eq!(session.progress().batches_planned, 0);
    assert_eq!(connector.dials(), 0);
    assert_eq!(metrics.active_requests(), 0);
    Ok(())
}

#[tokio::test]
async fn test_presences_and_dont_have() -> Result<()> {
    let store = Arc::new(MemoryBlockStore::new());
    let stored = store.put(&b"stored"[..]);
    let missing = bitswap_peer::store::raw_cid(b"missing");
    let connector = MockConnector::new(MockConnection::default());
    let responder = create_responder(ResponderConfig::default(), store, connector.clone());

    let wantlist = Wantlist::new(vec![
        WantEntry::have(&stored),
        WantEntry::have(&missing).with_send_dont_have(true),
        // no DontHave requested
        WantEntry::block(&missing),
        WantEntry::block(&stored).with_cancel(true),
    ]);
    let summary = responder
        .respond(PeerId::random(), ProtocolVersion::V120, wantlist, None)
        .await;

    let sent = connector.connection.sent();
    let items: Vec<ResolvedItem> = sent.iter().flat_map(|m| m.items().to_vec()).collect();
    assert_eq!(items.len(), 2);
    assert!(matches!(
        &items[0],
        ResolvedItem::Presence(p) if p.cid == stored && p.kind == PresenceKind::Have
    ));
    assert!(matches!(
        &items[1],
        ResolvedItem::Presence(p) if p.cid == missing && p.kind == PresenceKind::DontHave
    ));
    assert_eq!(summary.entries_sent, 4);
    Ok(())
}

#[tokio::test]
async fn test_messages_respect_size_limit() -> Result<()> {
    let store = Arc::new(MemoryBlockStore::new());
    let mut entries = Vec::new();
    for n in 0..40u8 {
        let cid = store.put(vec![n; 10 + usize::from(n) * 3]);
        entries.push(WantEntry::block(&cid));
    }
    // duplicates are answered twice
    entries.push(entries[0].clone());
    let connector = MockConnector::new(MockConnection::default());
    let responder = create_responder(
        ResponderConfig::default().batch_size(7).max_message_size(100),
        store,
        connector.clone(),
    );

    let summary = responder
        .respond(PeerId::random(), ProtocolVersion::V120, Wantlist::new(entries), None)
        .await;

    let sent = connector.connection.sent();
    for message in &sent {
        assert!(message.size() <= 100 || message.len() == 1);
    }
    assert_eq!(sent_blocks(&sent).len(), 41);
    assert_eq!(summary.batches, 6);
    assert_eq!(summary.entries_sent, 41);
    Ok(())
}

#[tokio::test]
async fn test_send_failure_is_not_retried() -> Result<()> {
    let store = Arc::new(MemoryBlockStore::new());
    let cids = store_blocks(&store, 4);
    let connection = MockConnection::default();
    connection.fail_sends.store(true, Ordering::SeqCst);
    let connector = MockConnector::new(connection);
    let responder = create_responder(
        ResponderConfig::default().batch_size(2),
        store,
        connector.clone(),
    );

    let summary = responder
        .respond(
            PeerId::random(),
            ProtocolVersion::V120,
            Wantlist::new(cids.iter().map(WantEntry::block).collect()),
            None,
        )
        .await;

    assert_eq!(summary.state, SessionState::Ended);
    assert_eq!(summary.entries_sent, 0);
    assert_eq!(responder.metrics().error_count("send"), 2);
    assert_eq!(connector.dials(), 1);
    assert_eq!(connector.connection.closes(), 1);
    Ok(())
}

#[tokio::test]
async fn test_peer_close_ends_session() -> Result<()> {
    let store = Arc::new(MemoryBlockStore::new());
    let cids = store_blocks(&store, 20);
    let connector = MockConnector::new(MockConnection {
        close_after: Some(1),
        ..MockConnection::default()
    });
    let responder = create_responder(
        ResponderConfig::default().batch_size(1),
        store,
        connector.clone(),
    );

    let summary = responder
        .respond(
            PeerId::random(),
            ProtocolVersion::V120,
            Wantlist::new(cids.iter().map(WantEntry::block).collect()),
            None,
        )
        .await;

    assert_eq!(summary.state, SessionState::Ended);
    assert_eq!(summary.batches, 20);
    assert!(summary.entries_sent <= summary.entries_planned);
    assert_eq!(connector.connection.closes(), 1);
    assert_eq!(responder.metrics().pending_entries(), 0);
    assert_eq!(responder.metrics().active_requests(), 0);
    Ok(())
}

#[tokio::test]
async fn test_serves_from_sled_store() -> Result<()> {
    let dir = tempdir()?;
    let store = Arc::new(SledBlockStore::new(dir.path())?);
    let cid = store.put(b"persisted block")?;
    let v0 = Cid::new_v0(*cid.hash())?;

    let connector = MockConnector::new(MockConnection::default());
    let responder = Responder::with_store(
        ResponderConfig::default().cache_blocks_info(true),
        store,
        connector.clone(),
        Arc::new(JsonWantlistCodec),
        create_test_metrics(),
    );

    let summary = responder
        .respond(
            PeerId::random(),
            ProtocolVersion::V100,
            Wantlist::new(vec![WantEntry::block(&v0)]),
            None,
        )
        .await;

    let sent = connector.connection.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].protocol(), ProtocolVersion::V100);
    let block = sent[0].blocks().next().expect("block sent");
    assert_eq!(block.cid, v0);
    assert_eq!(&block.data[..], b"persisted block");
    assert_eq!(summary.entries_sent, 1);
    Ok(())
}
