//! Configuration for the responder.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const DEFAULT_BATCH_SIZE: usize = 16;
const DEFAULT_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;
const DEFAULT_FETCH_CONCURRENCY: usize = 128;
const DEFAULT_MAX_BLOCK_SIZE: usize = 2 * 1024 * 1024;
const DEFAULT_CACHE_CAPACITY: usize = 1_000_000;

/// Configuration for the wantlist exchange engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponderConfig {
    /// Wantlist entries processed per batch
    pub batch_size: usize,
    /// Packing threshold for a single outbound message, in bytes
    pub max_message_size: usize,
    /// Bound on concurrent per-item storage lookups
    pub fetch_concurrency: usize,
    /// Stored blocks larger than this are answered as missing
    pub max_block_size: usize,
    /// Enable the block info read-through cache
    pub cache_blocks_info: bool,
    /// Capacity of the block info cache
    pub cache_capacity: usize,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            fetch_concurrency: DEFAULT_FETCH_CONCURRENCY,
            max_block_size: DEFAULT_MAX_BLOCK_SIZE,
            cache_blocks_info: false,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

impl ResponderConfig {
    /// Defaults overlaid with `BLOCKS_BATCH_SIZE`, `MAX_MESSAGE_SIZE`,
    /// `CONCURRENCY`, `MAX_BLOCK_SIZE`, `CACHE_BLOCKS_INFO` and
    /// `CACHE_BLOCKS_CAPACITY` from the environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(v) = lookup("BLOCKS_BATCH_SIZE") {
            config.batch_size = parse_usize("BLOCKS_BATCH_SIZE", &v)?;
        }
        if let Some(v) = lookup("MAX_MESSAGE_SIZE") {
            config.max_message_size = parse_usize("MAX_MESSAGE_SIZE", &v)?;
        }
        if let Some(v) = lookup("CONCURRENCY") {
            config.fetch_concurrency = parse_usize("CONCURRENCY", &v)?;
        }
        if let Some(v) = lookup("MAX_BLOCK_SIZE") {
            config.max_block_size = parse_usize("MAX_BLOCK_SIZE", &v)?;
        }
        if let Some(v) = lookup("CACHE_BLOCKS_INFO") {
            config.cache_blocks_info = matches!(v.trim(), "true" | "1" | "yes");
        }
        if let Some(v) = lookup("CACHE_BLOCKS_CAPACITY") {
            config.cache_capacity = parse_usize("CACHE_BLOCKS_CAPACITY", &v)?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be greater than zero".into()));
        }
        if self.max_message_size == 0 {
            return Err(Error::Config(
                "max_message_size must be greater than zero".into(),
            ));
        }
        if self.fetch_concurrency == 0 {
            return Err(Error::Config(
                "fetch_concurrency must be greater than zero".into(),
            ));
        }
        if self.cache_blocks_info && self.cache_capacity == 0 {
            return Err(Error::Config(
                "cache_capacity must be greater than zero when caching is enabled".into(),
            ));
        }
        Ok(())
    }

    /// Set the batch size
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the packing threshold
    pub fn max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    /// Set the lookup concurrency
    pub fn fetch_concurrency(mut self, fetch_concurrency: usize) -> Self {
        self.fetch_concurrency = fetch_concurrency;
        self
    }

    /// Set the largest block that will be served
    pub fn max_block_size(mut self, max_block_size: usize) -> Self {
        self.max_block_size = max_block_size;
        self
    }

    /// Enable/disable the block info cache
    pub fn cache_blocks_info(mut self, enabled: bool) -> Self {
        self.cache_blocks_info = enabled;
        self
    }

    /// Set the block info cache capacity
    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }
}

fn parse_usize(name: &str, value: &str) -> Result<usize> {
    value
        .trim()
        .parse()
        .map_err(|e| Error::Config(format!("{name}={value:?}: {e}")))
}
