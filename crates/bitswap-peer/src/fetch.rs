//! Resolution of want entries against storage.
//!
//! [`BlockFetcher`] is the batch lookup capability the engine consumes;
//! [`StoreFetcher`] implements it on top of a [`BlockStore`] with bounded
//! per-item concurrency and an optional [`BlockInfoCache`].
//! [`FetchCoordinator`] turns a batch of [`WantEntry`] values into the ordered
//! [`ResolvedItem`] list the packer consumes.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use cid::Cid;
use futures::stream::{self, StreamExt};
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, warn};

use crate::cache::BlockInfoCache;
use crate::error::{Error, Result};
use crate::protocol::{
    Block, BlockKey, BlockPresence, PresenceKind, ProtocolVersion, ResolvedItem, WantEntry,
    WantType,
};
use crate::store::{BlockInfo, BlockStore};
use crate::telemetry::ResponderMetrics;

/// Batch lookup capability.
///
/// A key missing from a returned map means its individual lookup failed;
/// the whole call only fails when the batch as a unit could not be served.
#[async_trait]
pub trait BlockFetcher: Send + Sync {
    /// Block bytes per key, `None` when the block is not stored.
    async fn fetch_blocks(&self, keys: &[BlockKey]) -> Result<HashMap<BlockKey, Option<Bytes>>>;

    /// Whether each key is stored.
    async fn fetch_presence(&self, keys: &[BlockKey]) -> Result<HashMap<BlockKey, bool>>;
}

/// [`BlockFetcher`] over a [`BlockStore`].
///
/// Block and presence lookups share one limit of `concurrency` lookups in
/// flight, also when both kinds run at the same time.
pub struct StoreFetcher<S> {
    store: Arc<S>,
    cache: Option<Arc<BlockInfoCache>>,
    concurrency: usize,
    lookups: Semaphore,
    max_block_size: usize,
    metrics: ResponderMetrics,
}

impl<S: BlockStore> StoreFetcher<S> {
    pub fn new(
        store: Arc<S>,
        concurrency: usize,
        max_block_size: usize,
        metrics: ResponderMetrics,
    ) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            store,
            cache: None,
            concurrency,
            lookups: Semaphore::new(concurrency),
            max_block_size,
            metrics,
        }
    }

    /// Serve block info lookups through `cache`.
    pub fn with_cache(mut self, cache: Arc<BlockInfoCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    async fn block_info(&self, key: &BlockKey) -> Result<Option<BlockInfo>> {
        if let Some(cache) = &self.cache {
            if let Some(info) = cache.get(key) {
                self.metrics.cache_hits.inc();
                return Ok(Some(info));
            }
        }

        let info = self.store.block_info(key).await?;
        if let (Some(cache), Some(info)) = (&self.cache, &info) {
            cache.insert(key.clone(), info.clone());
        }
        Ok(info)
    }

    async fn permit(&self) -> Result<SemaphorePermit<'_>> {
        self.lookups
            .acquire()
            .await
            .map_err(|_| Error::storage("lookup limiter closed"))
    }

    async fn fetch_block(&self, key: &BlockKey) -> Result<Option<Bytes>> {
        let _permit = self.permit().await?;
        let Some(info) = self.block_info(key).await? else {
            return Ok(None);
        };
        match info.length() {
            Some(length) if length as usize <= self.max_block_size => {
                self.store.read_block(key, &info).await
            }
            Some(length) => {
                debug!(target: "bitswap", %key, length, "block exceeds max block size");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn has_block(&self, key: &BlockKey) -> Result<bool> {
        let _permit = self.permit().await?;
        Ok(self.block_info(key).await?.is_some())
    }
}

#[async_trait]
impl<S: BlockStore> BlockFetcher for StoreFetcher<S> {
    async fn fetch_blocks(&self, keys: &[BlockKey]) -> Result<HashMap<BlockKey, Option<Bytes>>> {
        let results: Vec<_> = stream::iter(keys.iter().cloned())
            .map(move |key| async move {
                let result = self.fetch_block(&key).await;
                (key, result)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut found = HashMap::with_capacity(results.len());
        for (key, result) in results {
            match result {
                Ok(data) => {
                    found.insert(key, data);
                }
                Err(err) => {
                    warn!(target: "bitswap", %key, error = %err, "block lookup failed");
                    self.metrics.errors.with_label_values(&["lookup"]).inc();
                }
            }
        }
        Ok(found)
    }

    async fn fetch_presence(&self, keys: &[BlockKey]) -> Result<HashMap<BlockKey, bool>> {
        let results: Vec<_> = stream::iter(keys.iter().cloned())
            .map(move |key| async move {
                let result = self.has_block(&key).await;
                (key, result)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut found = HashMap::with_capacity(results.len());
        for (key, result) in results {
            match result {
                Ok(present) => {
                    found.insert(key, present);
                }
                Err(err) => {
                    warn!(target: "bitswap", %key, error = %err, "block info lookup failed");
                    self.metrics.errors.with_label_values(&["lookup"]).inc();
                }
            }
        }
        Ok(found)
    }
}

/// A batch entry that passed classification.
struct Classified {
    cid: Cid,
    key: BlockKey,
    want_type: WantType,
    send_dont_have: bool,
}

/// Resolves batches of want entries into ordered response items.
#[derive(Clone)]
pub struct FetchCoordinator {
    fetcher: Arc<dyn BlockFetcher>,
    metrics: ResponderMetrics,
}

impl FetchCoordinator {
    pub fn new(fetcher: Arc<dyn BlockFetcher>, metrics: ResponderMetrics) -> Self {
        Self { fetcher, metrics }
    }

    /// Resolves `entries` under `protocol`.
    ///
    /// Returns at most one item per entry, in entry order. Malformed
    /// identifiers, unsupported want types and cancellations produce no item.
    /// An error means the batch as a whole could not be resolved.
    pub async fn resolve(
        &self,
        entries: &[WantEntry],
        protocol: ProtocolVersion,
    ) -> Result<Vec<ResolvedItem>> {
        let wanted = self.classify(entries, protocol);

        let mut block_keys = Vec::new();
        let mut have_keys = Vec::new();
        for entry in &wanted {
            match entry.want_type {
                WantType::Block => block_keys.push(entry.key.clone()),
                WantType::Have => have_keys.push(entry.key.clone()),
            }
        }

        let (blocks, presence) = futures::try_join!(
            self.fetch_blocks(&block_keys),
            self.fetch_presence(&have_keys)
        )
        .map_err(|err| match err {
            Error::BatchFetch(_) => err,
            other => Error::BatchFetch(other.to_string()),
        })?;

        let mut items = Vec::with_capacity(wanted.len());
        for entry in wanted {
            if let Some(item) = self.respond(entry, protocol, &blocks, &presence) {
                items.push(item);
            }
        }
        Ok(items)
    }

    async fn fetch_blocks(&self, keys: &[BlockKey]) -> Result<HashMap<BlockKey, Option<Bytes>>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        self.fetcher.fetch_blocks(keys).await
    }

    async fn fetch_presence(&self, keys: &[BlockKey]) -> Result<HashMap<BlockKey, bool>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        self.fetcher.fetch_presence(keys).await
    }

    fn classify(&self, entries: &[WantEntry], protocol: ProtocolVersion) -> Vec<Classified> {
        let mut wanted = Vec::with_capacity(entries.len());
        for entry in entries {
            // cancellations are accepted but there is no wantlist state to update
            if entry.cancel {
                continue;
            }

            let (cid, key) = match entry.canonicalize() {
                Ok(parsed) => parsed,
                Err(err) => {
                    warn!(target: "bitswap", error = %err, "invalid block cid");
                    self.metrics.record_error(&err);
                    continue;
                }
            };

            if entry.want_type == WantType::Have && !protocol.supports_presence() {
                let err = Error::UnsupportedWantKind {
                    want_type: entry.want_type,
                    protocol,
                };
                debug!(target: "bitswap", %cid, error = %err, "unsupported want type");
                self.metrics.record_error(&err);
                continue;
            }

            wanted.push(Classified {
                cid,
                key,
                want_type: entry.want_type,
                send_dont_have: entry.send_dont_have,
            });
        }
        wanted
    }

    fn respond(
        &self,
        entry: Classified,
        protocol: ProtocolVersion,
        blocks: &HashMap<BlockKey, Option<Bytes>>,
        presence: &HashMap<BlockKey, bool>,
    ) -> Option<ResolvedItem> {
        let found = match entry.want_type {
            WantType::Block => match blocks.get(&entry.key)? {
                Some(data) => {
                    self.metrics.block_hits.inc();
                    return Some(ResolvedItem::Block(Block::new(entry.cid, data.clone())));
                }
                None => false,
            },
            WantType::Have => *presence.get(&entry.key)?,
        };

        if found {
            self.metrics.block_hits.inc();
            return Some(ResolvedItem::Presence(BlockPresence {
                cid: entry.cid,
                kind: PresenceKind::Have,
            }));
        }

        self.metrics.block_misses.inc();
        (entry.send_dont_have && protocol.supports_presence()).then(|| {
            ResolvedItem::Presence(BlockPresence {
                cid: entry.cid,
                kind: PresenceKind::DontHave,
            })
        })
    }
}
