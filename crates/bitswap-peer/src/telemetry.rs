//! Prometheus metrics for the responder.

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

use crate::error::{Error, Result};

/// Metrics for the BitSwap responder
#[derive(Clone)]
pub struct ResponderMetrics {
    pub(crate) entries_total: IntCounter,
    pub(crate) pending_entries: IntGauge,
    pub(crate) active_requests: IntGauge,
    pub(crate) block_hits: IntCounter,
    pub(crate) block_misses: IntCounter,
    pub(crate) cache_hits: IntCounter,
    pub(crate) sent_data_bytes: IntCounter,
    pub(crate) sent_info_bytes: IntCounter,
    pub(crate) messages_sent: IntCounter,
    pub(crate) connections_total: IntCounter,
    pub(crate) active_connections: IntGauge,
    pub(crate) errors: IntCounterVec,
}

impl ResponderMetrics {
    pub fn new(registry: &Registry) -> Result<Self> {
        let entries_total = IntCounter::new(
            "bitswap_entries_total",
            "Total number of wantlist entries received",
        )?;

        let pending_entries = IntGauge::new(
            "bitswap_pending_entries",
            "Wantlist entries belonging to sessions that have not ended",
        )?;

        let active_requests = IntGauge::new(
            "bitswap_active_requests",
            "Current number of wantlists being answered",
        )?;

        let block_hits = IntCounter::new(
            "bitswap_block_hits_total",
            "Entries resolved to a block or a HAVE presence",
        )?;

        let block_misses = IntCounter::new(
            "bitswap_block_misses_total",
            "Entries for blocks that are not in storage",
        )?;

        let cache_hits = IntCounter::new(
            "bitswap_block_info_cache_hits_total",
            "Block info lookups answered by the cache",
        )?;

        let sent_data_bytes = IntCounter::new(
            "bitswap_sent_data_bytes_total",
            "Block bytes sent to peers",
        )?;

        let sent_info_bytes = IntCounter::new(
            "bitswap_sent_info_bytes_total",
            "Block presence bytes sent to peers",
        )?;

        let messages_sent = IntCounter::new(
            "bitswap_messages_sent_total",
            "Total number of messages sent to peers",
        )?;

        let connections_total = IntCounter::new(
            "bitswap_connections_total",
            "Total number of outbound connections opened",
        )?;

        let active_connections = IntGauge::new(
            "bitswap_active_connections",
            "Current number of open outbound connections",
        )?;

        let errors = IntCounterVec::new(
            Opts::new("bitswap_errors_total", "Errors by category"),
            &["category"],
        )?;

        registry.register(Box::new(entries_total.clone()))?;
        registry.register(Box::new(pending_entries.clone()))?;
        registry.register(Box::new(active_requests.clone()))?;
        registry.register(Box::new(block_hits.clone()))?;
        registry.register(Box::new(block_misses.clone()))?;
        registry.register(Box::new(cache_hits.clone()))?;
        registry.register(Box::new(sent_data_bytes.clone()))?;
        registry.register(Box::new(sent_info_bytes.clone()))?;
        registry.register(Box::new(messages_sent.clone()))?;
        registry.register(Box::new(connections_total.clone()))?;
        registry.register(Box::new(active_connections.clone()))?;
        registry.register(Box::new(errors.clone()))?;

        Ok(Self {
            entries_total,
            pending_entries,
            active_requests,
            block_hits,
            block_misses,
            cache_hits,
            sent_data_bytes,
            sent_info_bytes,
            messages_sent,
            connections_total,
            active_connections,
            errors,
        })
    }

    /// Counts an error under its category label.
    pub fn record_error(&self, error: &Error) {
        self.errors.with_label_values(&[error.category()]).inc();
    }

    /// Number of errors recorded under `category`.
    pub fn error_count(&self, category: &str) -> u64 {
        self.errors.with_label_values(&[category]).get()
    }

    pub fn pending_entries(&self) -> i64 {
        self.pending_entries.get()
    }

    pub fn active_requests(&self) -> i64 {
        self.active_requests.get()
    }

    pub fn active_connections(&self) -> i64 {
        self.active_connections.get()
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.get()
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.get()
    }
}
