//! Splits a wantlist into batches and answers them concurrently.

use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::fetch::FetchCoordinator;
use crate::message::{pack, OutboundMessage};
use crate::protocol::{WantEntry, Wantlist};
use crate::session::{SendOutcome, Session, SessionState};
use crate::telemetry::ResponderMetrics;

/// Outcome of answering one wantlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub batches: usize,
    pub entries_planned: usize,
    pub entries_sent: usize,
    pub state: SessionState,
}

/// Runs the fetch, pack and send pipeline for each batch of a wantlist.
#[derive(Clone)]
pub struct WantlistScheduler {
    coordinator: FetchCoordinator,
    max_message_size: usize,
    metrics: ResponderMetrics,
}

impl WantlistScheduler {
    pub fn new(
        coordinator: FetchCoordinator,
        max_message_size: usize,
        metrics: ResponderMetrics,
    ) -> Self {
        Self {
            coordinator,
            max_message_size,
            metrics,
        }
    }

    /// Answers `wantlist` over `session` in batches of `batch_size` entries.
    ///
    /// Every batch runs as its own task. The batch that completes the plan
    /// ends the session, so the session is `Ended` when this returns unless
    /// the wantlist was empty.
    pub async fn run(
        &self,
        wantlist: Wantlist,
        batch_size: usize,
        session: Arc<Session>,
    ) -> RunSummary {
        let entries = wantlist.entries;
        if entries.is_empty() {
            debug!(target: "bitswap", peer = %session.peer(), "empty wantlist");
            return summary(&session, 0);
        }

        let batch_size = batch_size.max(1);
        let batches: Vec<Vec<WantEntry>> = entries
            .chunks(batch_size)
            .map(<[WantEntry]>::to_vec)
            .collect();
        let planned = batches.len();

        session.plan(entries.len(), planned);
        info!(
            target: "bitswap",
            peer = %session.peer(),
            protocol = %session.protocol(),
            entries = entries.len(),
            batches = planned,
            "answering wantlist"
        );

        let mut tasks = JoinSet::new();
        for (index, batch) in batches.into_iter().enumerate() {
            let scheduler = self.clone();
            let session = session.clone();
            tasks.spawn(async move { scheduler.run_batch(index, batch, session).await });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                warn!(target: "bitswap", peer = %session.peer(), error = %err, "batch task failed");
                // the task never reached its own completion
                session.complete_batch().await;
            }
        }

        summary(&session, planned)
    }

    async fn run_batch(&self, index: usize, entries: Vec<WantEntry>, session: Arc<Session>) {
        if session.state() == SessionState::Active {
            match self.coordinator.resolve(&entries, session.protocol()).await {
                Ok(items) => {
                    let messages = pack(items, session.protocol(), self.max_message_size);
                    if send_all(&session, &messages).await {
                        session.record_sent(entries.len());
                    }
                }
                Err(err) => {
                    warn!(
                        target: "bitswap",
                        peer = %session.peer(),
                        batch = index,
                        error = %err,
                        "cannot fetch blocks"
                    );
                    self.metrics.record_error(&err);
                }
            }
        } else {
            debug!(
                target: "bitswap",
                peer = %session.peer(),
                batch = index,
                state = ?session.state(),
                "skipping batch"
            );
        }

        session.complete_batch().await;
    }
}

/// Sends `messages` in order; stops at the first one not sent.
async fn send_all(session: &Arc<Session>, messages: &[OutboundMessage]) -> bool {
    for message in messages {
        match session.send(message).await {
            Ok(SendOutcome::Sent) => {}
            Ok(SendOutcome::Discarded) => return false,
            Err(err) => {
                warn!(
                    target: "bitswap",
                    peer = %session.peer(),
                    error = %err,
                    "cannot send response"
                );
                return false;
            }
        }
    }
    true
}

fn summary(session: &Session, batches: usize) -> RunSummary {
    let progress = session.progress();
    RunSummary {
        batches,
        entries_planned: progress.entries_planned,
        entries_sent: progress.entries_sent,
        state: session.state(),
    }
}
