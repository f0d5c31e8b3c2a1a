//! Per-peer response session: connection ownership and lifecycle.
//!
//! A session moves `Active → Erroring → Ended` or `Active → Ended`. It is the
//! only writer of its own state; the scheduler and batches read it and ask for
//! transitions through [`Session::complete_batch`] and [`Session::end`].

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use libp2p_identity::PeerId;
use tokio::sync::{Mutex, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::{Connection, Connector};
use crate::error::{Error, Result};
use crate::message::OutboundMessage;
use crate::protocol::{ProtocolVersion, ResolvedItem};
use crate::telemetry::ResponderMetrics;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Active = 0,
    /// Connection acquisition failed; remaining work is skipped.
    Erroring = 1,
    /// Terminal.
    Ended = 2,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Active,
            1 => SessionState::Erroring,
            _ => SessionState::Ended,
        }
    }
}

/// What happened to a message handed to [`Session::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// The session was no longer active; nothing was written.
    Discarded,
}

/// Snapshot of the batch and entry counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionProgress {
    pub batches_planned: usize,
    pub batches_completed: usize,
    pub entries_planned: usize,
    pub entries_sent: usize,
}

pub struct Session {
    peer: PeerId,
    protocol: ProtocolVersion,
    connector: Arc<dyn Connector>,
    connection: OnceCell<Arc<dyn Connection>>,
    connection_released: AtomicBool,
    /// Serializes writes on the shared connection.
    send_lock: Mutex<()>,
    state: AtomicU8,
    planned: AtomicBool,
    counters_released: AtomicBool,
    batches_planned: AtomicUsize,
    batches_completed: AtomicUsize,
    entries_planned: AtomicUsize,
    entries_sent: AtomicUsize,
    close_watcher: parking_lot::Mutex<Option<JoinHandle<()>>>,
    metrics: ResponderMetrics,
}

impl Session {
    /// Creates a session that dials `peer` on first send.
    pub fn new(
        peer: PeerId,
        protocol: ProtocolVersion,
        connector: Arc<dyn Connector>,
        metrics: ResponderMetrics,
    ) -> Arc<Self> {
        Arc::new(Self {
            peer,
            protocol,
            connector,
            connection: OnceCell::new(),
            connection_released: AtomicBool::new(false),
            send_lock: Mutex::new(()),
            state: AtomicU8::new(SessionState::Active as u8),
            planned: AtomicBool::new(false),
            counters_released: AtomicBool::new(false),
            batches_planned: AtomicUsize::new(0),
            batches_completed: AtomicUsize::new(0),
            entries_planned: AtomicUsize::new(0),
            entries_sent: AtomicUsize::new(0),
            close_watcher: parking_lot::Mutex::new(None),
            metrics,
        })
    }

    /// Creates a session that answers over an already open connection.
    ///
    /// Must be called within a Tokio runtime: the session starts watching the
    /// connection for a peer-initiated close.
    pub fn with_connection(
        peer: PeerId,
        protocol: ProtocolVersion,
        connector: Arc<dyn Connector>,
        connection: Arc<dyn Connection>,
        metrics: ResponderMetrics,
    ) -> Arc<Self> {
        let session = Self::new(peer, protocol, connector, metrics);
        if session.connection.set(connection.clone()).is_ok() {
            session.metrics.connections_total.inc();
            session.metrics.active_connections.inc();
            session.watch_close(connection);
        }
        session
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn protocol(&self) -> ProtocolVersion {
        self.protocol
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_ended(&self) -> bool {
        self.state() == SessionState::Ended
    }

    pub fn progress(&self) -> SessionProgress {
        SessionProgress {
            batches_planned: self.batches_planned.load(Ordering::SeqCst),
            batches_completed: self.batches_completed.load(Ordering::SeqCst),
            entries_planned: self.entries_planned.load(Ordering::SeqCst),
            entries_sent: self.entries_sent.load(Ordering::SeqCst),
        }
    }

    /// Records the work planned for this session before any batch runs.
    pub(crate) fn plan(&self, entries: usize, batches: usize) {
        self.entries_planned.store(entries, Ordering::SeqCst);
        self.batches_planned.store(batches, Ordering::SeqCst);
        self.planned.store(true, Ordering::SeqCst);

        self.metrics.entries_total.inc_by(entries as u64);
        self.metrics.pending_entries.add(entries as i64);
        self.metrics.active_requests.inc();

        // planned after the session already ended
        if self.is_ended() {
            self.release_counters();
        }
    }

    fn release_counters(&self) {
        if self.counters_released.swap(true, Ordering::SeqCst) {
            return;
        }
        let entries = self.entries_planned.load(Ordering::SeqCst);
        self.metrics.pending_entries.sub(entries as i64);
        self.metrics.active_requests.dec();
    }

    /// Counts `entries` as answered, never beyond the planned count.
    pub(crate) fn record_sent(&self, entries: usize) {
        let planned = self.entries_planned.load(Ordering::SeqCst);
        let _ = self
            .entries_sent
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |sent| {
                Some((sent + entries).min(planned))
            });
    }

    /// Marks one batch as accounted for. The batch that completes the plan
    /// ends the session and gets `true` back.
    pub async fn complete_batch(&self) -> bool {
        let planned = self.batches_planned.load(Ordering::SeqCst);
        let previous = self
            .batches_completed
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |done| {
                (done < planned).then_some(done + 1)
            });

        match previous {
            Ok(done) if done + 1 == planned => {
                self.end().await;
                true
            }
            Ok(_) => false,
            Err(_) => {
                warn!(target: "bitswap", peer = %self.peer, "batch completed beyond plan");
                false
            }
        }
    }

    /// `Active → Erroring`. Returns whether this call made the transition.
    pub fn mark_erroring(&self) -> bool {
        let changed = self
            .state
            .compare_exchange(
                SessionState::Active as u8,
                SessionState::Erroring as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        if changed {
            warn!(
                target: "bitswap",
                peer = %self.peer,
                "session is erroring, skipping remaining batches"
            );
        }
        changed
    }

    /// Ends the session. Only the first call has an effect: it closes the
    /// connection, stops watching it and releases the session's counters.
    pub async fn end(&self) -> bool {
        let previous = self
            .state
            .swap(SessionState::Ended as u8, Ordering::SeqCst);
        if previous == SessionState::Ended as u8 {
            return false;
        }

        self.release_connection().await;

        // the watcher may be the caller; nothing is awaited past this point
        let watcher = self.close_watcher.lock().take();
        if let Some(watcher) = watcher {
            watcher.abort();
        }

        if self.planned.load(Ordering::SeqCst) {
            self.release_counters();
        }

        let progress = self.progress();
        info!(
            target: "bitswap",
            peer = %self.peer,
            previous = ?SessionState::from_u8(previous),
            batches = progress.batches_completed,
            entries_sent = progress.entries_sent,
            entries_planned = progress.entries_planned,
            "session ended"
        );
        true
    }

    /// Sends `message` over the session's connection, dialing it if needed.
    ///
    /// Returns [`SendOutcome::Discarded`] when the session is not active.
    /// Acquisition failures move the session to `Erroring`.
    pub async fn send(self: &Arc<Self>, message: &OutboundMessage) -> Result<SendOutcome> {
        if self.state() != SessionState::Active {
            return Ok(SendOutcome::Discarded);
        }

        let connection = match self.connection().await {
            Ok(connection) => connection,
            Err(Error::SessionEnded) => return Ok(SendOutcome::Discarded),
            Err(err) => return Err(err),
        };
        if self.is_ended() {
            // end() may have run before the connection was stored
            self.release_connection().await;
            return Ok(SendOutcome::Discarded);
        }

        let _guard = self.send_lock.lock().await;
        if self.state() != SessionState::Active {
            return Ok(SendOutcome::Discarded);
        }

        if let Err(err) = connection.send(message).await {
            let err = match err {
                Error::Send(_) => err,
                other => Error::Send(other.to_string()),
            };
            self.metrics.record_error(&err);
            return Err(err);
        }

        self.metrics.messages_sent.inc();
        for item in message.items() {
            let size = item.encoded_size(self.protocol) as u64;
            match item {
                ResolvedItem::Block(_) => self.metrics.sent_data_bytes.inc_by(size),
                ResolvedItem::Presence(_) => self.metrics.sent_info_bytes.inc_by(size),
            }
        }
        debug!(
            target: "bitswap",
            peer = %self.peer,
            items = message.len(),
            size = message.size(),
            "message sent"
        );
        Ok(SendOutcome::Sent)
    }

    /// The session's connection; the first caller dials, concurrent callers
    /// wait for the same attempt.
    async fn connection(self: &Arc<Self>) -> Result<Arc<dyn Connection>> {
        let connection = self
            .connection
            .get_or_try_init(|| async {
                if self.state() != SessionState::Active {
                    return Err(Error::SessionEnded);
                }

                match self.connector.connect(&self.peer, self.protocol).await {
                    Ok(connection) => {
                        debug!(
                            target: "bitswap",
                            peer = %self.peer,
                            protocol = %self.protocol,
                            "connected to peer"
                        );
                        self.metrics.connections_total.inc();
                        self.metrics.active_connections.inc();
                        self.watch_close(connection.clone());
                        Ok(connection)
                    }
                    Err(err) => {
                        let err = match err {
                            Error::ConnectionAcquisition { .. } => err,
                            other => Error::ConnectionAcquisition {
                                peer: self.peer,
                                reason: other.to_string(),
                            },
                        };
                        warn!(target: "bitswap", error = %err, "cannot connect to peer");
                        self.metrics.record_error(&err);
                        // before returning, so waiting callers do not dial again
                        self.mark_erroring();
                        Err(err)
                    }
                }
            })
            .await?;
        Ok(connection.clone())
    }

    /// Closes the connection once, if there is one.
    async fn release_connection(&self) {
        let Some(connection) = self.connection.get() else {
            return;
        };
        if self.connection_released.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Err(err) = connection.close().await {
            warn!(target: "bitswap", peer = %self.peer, error = %err, "error on close connection");
            self.metrics.record_error(&err);
        }
        self.metrics.active_connections.dec();
    }

    fn watch_close(self: &Arc<Self>, connection: Arc<dyn Connection>) {
        let session: Weak<Session> = Arc::downgrade(self);
        let watcher = tokio::spawn(async move {
            connection.closed().await;
            if let Some(session) = session.upgrade() {
                debug!(target: "bitswap", peer = %session.peer, "peer closed connection");
                session.end().await;
            }
        });

        *self.close_watcher.lock() = Some(watcher);
        if self.is_ended() {
            if let Some(watcher) = self.close_watcher.lock().take() {
                watcher.abort();
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("peer", &self.peer)
            .field("protocol", &self.protocol)
            .field("state", &self.state())
            .field("progress", &self.progress())
            .finish()
    }
}
