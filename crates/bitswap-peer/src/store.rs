//! Block storage backends.
//!
//! A backend answers two questions for a canonical [`BlockKey`]: where does
//! the block live ([`BlockStore::block_info`]) and what are its bytes
//! ([`BlockStore::read_block`]). The split mirrors deployments where a
//! metadata index points into large archive objects, and lets the fetch layer
//! cache the cheap-to-keep location metadata.
//!
//! Two backends ship with the crate: [`MemoryBlockStore`] and
//! [`SledBlockStore`], a persistent store backed by
//! [Sled](https://github.com/spacejam/sled).
//!
//! # Examples
//!
//! ```no_run
//! use bitswap_peer::store::SledBlockStore;
//!
//! # fn main() -> bitswap_peer::Result<()> {
//! let store = SledBlockStore::new("./data/blocks")?;
//! let cid = store.put(b"hello world")?;
//! if let Some(data) = store.get(&cid)? {
//!     assert_eq!(&data[..], b"hello world");
//! }
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use cid::Cid;
use multihash_codetable::{Code, MultihashDigest};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::protocol::BlockKey;

/// Multicodec for raw binary blocks.
const RAW_CODEC: u64 = 0x55;

/// Where a block's bytes live inside an archive object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockLocation {
    pub archive: String,
    pub offset: u64,
    pub length: u64,
}

/// Location metadata for a stored block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub locations: Vec<BlockLocation>,
}

impl BlockInfo {
    pub fn single(location: BlockLocation) -> Self {
        Self {
            locations: vec![location],
        }
    }

    /// The location reads are served from.
    pub fn primary(&self) -> Option<&BlockLocation> {
        self.locations.first()
    }

    /// Stored length of the block, if any location is known.
    pub fn length(&self) -> Option<u64> {
        self.primary().map(|location| location.length)
    }
}

/// Trait for backends that can locate and read blocks
#[async_trait]
pub trait BlockStore: Send + Sync + 'static {
    /// Look up the location metadata of a block
    async fn block_info(&self, key: &BlockKey) -> Result<Option<BlockInfo>>;

    /// Read the block bytes at `info`'s primary location
    async fn read_block(&self, key: &BlockKey, info: &BlockInfo) -> Result<Option<Bytes>>;
}

/// Hashes `data` into a CIDv1 with the raw codec and SHA2-256.
pub fn raw_cid(data: &[u8]) -> Cid {
    Cid::new_v1(RAW_CODEC, Code::Sha2_256.digest(data))
}

/// In-memory block store.
#[derive(Debug, Default)]
pub struct MemoryBlockStore {
    blocks: RwLock<HashMap<BlockKey, Bytes>>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `data` under its raw CID and returns the CID.
    pub fn put(&self, data: impl Into<Bytes>) -> Cid {
        let data = data.into();
        let cid = raw_cid(&data);
        self.insert(&cid, data);
        cid
    }

    /// Stores `data` under `cid` without verifying the hash.
    pub fn insert(&self, cid: &Cid, data: impl Into<Bytes>) {
        self.blocks.write().insert(BlockKey::from_cid(cid), data.into());
    }

    pub fn remove(&self, cid: &Cid) -> Option<Bytes> {
        self.blocks.write().remove(&BlockKey::from_cid(cid))
    }

    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlockStore for MemoryBlockStore {
    async fn block_info(&self, key: &BlockKey) -> Result<Option<BlockInfo>> {
        Ok(self.blocks.read().get(key).map(|data| {
            BlockInfo::single(BlockLocation {
                archive: "memory".into(),
                offset: 0,
                length: data.len() as u64,
            })
        }))
    }

    async fn read_block(&self, key: &BlockKey, info: &BlockInfo) -> Result<Option<Bytes>> {
        let location = info
            .primary()
            .ok_or_else(|| Error::storage(format!("no location for block {key}")))?;
        let blocks = self.blocks.read();
        let Some(data) = blocks.get(key) else {
            return Ok(None);
        };
        let start = location.offset as usize;
        let end = start + location.length as usize;
        if end > data.len() {
            return Err(Error::storage(format!(
                "location {start}..{end} out of bounds for block {key}"
            )));
        }
        Ok(Some(data.slice(start..end)))
    }
}

/// A persistent block storage implementation using Sled.
///
/// This store maps canonical block keys (multihash bytes) to raw block data.
/// Because keys are multihashes, a block stored through a CIDv1 is also found
/// through the matching CIDv0.
#[derive(Debug, Clone)]
pub struct SledBlockStore {
    /// The underlying Sled database instance
    db: sled::Db,
}

impl SledBlockStore {
    /// Creates a new SledBlockStore at the specified path.
    ///
    /// The directory will be created if it doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or created at the specified path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// Stores a block of data and returns its CID.
    ///
    /// The data is hashed using SHA2-256 and stored with a CID v1 in raw
    /// binary format (codec 0x55).
    ///
    /// # Errors
    ///
    /// Returns an error if the data cannot be stored in the database.
    pub fn put(&self, data: &[u8]) -> Result<Cid> {
        let cid = raw_cid(data);
        self.insert(&cid, data)?;

        // Ensure the data is flushed to disk
        self.db.flush()?;

        Ok(cid)
    }

    /// Inserts a block into the store under the given `cid`.
    ///
    /// # Errors
    ///
    /// Returns an error if writing to the underlying database fails.
    pub fn insert(&self, cid: &Cid, data: &[u8]) -> Result<()> {
        self.db.insert(cid.hash().to_bytes(), data)?;
        Ok(())
    }

    /// Retrieves a block of data by its CID.
    ///
    /// Returns `None` if no data exists for the given CID.
    pub fn get(&self, cid: &Cid) -> Result<Option<Bytes>> {
        Ok(self
            .db
            .get(cid.hash().to_bytes())?
            .map(|data| Bytes::copy_from_slice(&data)))
    }

    /// Removes a block identified by `cid` from the store.
    pub fn remove(&self, cid: &Cid) -> Result<()> {
        self.db.remove(cid.hash().to_bytes())?;
        Ok(())
    }

    /// Checks whether a block identified by `cid` exists in the store.
    pub fn contains(&self, cid: &Cid) -> Result<bool> {
        Ok(self.db.contains_key(cid.hash().to_bytes())?)
    }
}

#[async_trait]
impl BlockStore for SledBlockStore {
    async fn block_info(&self, key: &BlockKey) -> Result<Option<BlockInfo>> {
        Ok(self.db.get(key.as_bytes())?.map(|data| {
            BlockInfo::single(BlockLocation {
                archive: "sled".into(),
                offset: 0,
                length: data.len() as u64,
            })
        }))
    }

    async fn read_block(&self, key: &BlockKey, info: &BlockInfo) -> Result<Option<Bytes>> {
        let Some(data) = self.db.get(key.as_bytes())? else {
            return Ok(None);
        };
        let location = info
            .primary()
            .ok_or_else(|| Error::storage(format!("no location for block {key}")))?;
        let start = location.offset as usize;
        let end = start + location.length as usize;
        if end > data.len() {
            return Err(Error::storage(format!(
                "location {start}..{end} out of bounds for block {key}"
            )));
        }
        Ok(Some(Bytes::copy_from_slice(&data[start..end])))
    }
}
