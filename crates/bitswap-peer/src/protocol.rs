//! BitSwap protocol data model: protocol versions, wantlist entries and the
//! items a responder sends back.
//!
//! Wire encoding is handled outside this crate; the types here only carry what
//! the exchange engine needs to resolve, size and route each item.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use cid::Cid;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Protocol version constants
pub const BITSWAP_120: &str = "/ipfs/bitswap/1.2.0";
pub const BITSWAP_110: &str = "/ipfs/bitswap/1.1.0";
pub const BITSWAP_100: &str = "/ipfs/bitswap/1.0.0";

/// Serialized overhead of one block presence record besides its CID bytes:
/// field tags and length prefixes for the CID and the presence type.
const PRESENCE_OVERHEAD: usize = 6;

/// Negotiated BitSwap protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolVersion {
    V100,
    V110,
    V120,
}

impl ProtocolVersion {
    /// All versions, newest first.
    pub const ALL: [ProtocolVersion; 3] = [Self::V120, Self::V110, Self::V100];

    /// The multistream protocol id.
    pub fn protocol_id(&self) -> &'static str {
        match self {
            ProtocolVersion::V100 => BITSWAP_100,
            ProtocolVersion::V110 => BITSWAP_110,
            ProtocolVersion::V120 => BITSWAP_120,
        }
    }

    /// Looks a version up by its protocol id.
    pub fn from_protocol_id(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|v| v.protocol_id() == id)
    }

    /// Whether `Have`/`DontHave` presence records exist in this version.
    pub fn supports_presence(&self) -> bool {
        matches!(self, ProtocolVersion::V120)
    }

    /// Serialized contribution of a presence record for `cid`.
    pub fn presence_size(&self, cid: &Cid) -> usize {
        cid.encoded_len() + PRESENCE_OVERHEAD
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.protocol_id())
    }
}

impl FromStr for ProtocolVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_protocol_id(s)
            .ok_or_else(|| Error::Decode(format!("unknown bitswap protocol {s}")))
    }
}

/// What the peer wants for an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WantType {
    /// The full block content.
    Block,
    /// Only whether we hold the block.
    Have,
}

/// One entry of a received wantlist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WantEntry {
    /// Raw CID bytes as received; may be malformed.
    pub cid: Bytes,
    pub want_type: WantType,
    /// Reply with `DontHave` when the block is missing.
    pub send_dont_have: bool,
    pub cancel: bool,
}

impl WantEntry {
    /// Creates a `Block` want for `cid`.
    pub fn block(cid: &Cid) -> Self {
        Self {
            cid: Bytes::from(cid.to_bytes()),
            want_type: WantType::Block,
            send_dont_have: false,
            cancel: false,
        }
    }

    /// Creates a `Have` want for `cid`.
    pub fn have(cid: &Cid) -> Self {
        Self {
            want_type: WantType::Have,
            ..Self::block(cid)
        }
    }

    /// Asks for an explicit `DontHave` when the block is missing.
    pub fn with_send_dont_have(mut self, send_dont_have: bool) -> Self {
        self.send_dont_have = send_dont_have;
        self
    }

    /// Marks the entry as a cancellation.
    pub fn with_cancel(mut self, cancel: bool) -> Self {
        self.cancel = cancel;
        self
    }

    /// Parses the entry's identifier into a CID and its canonical key.
    pub fn canonicalize(&self) -> Result<(Cid, BlockKey)> {
        let cid = Cid::try_from(self.cid.as_ref())?;
        let key = BlockKey::from_cid(&cid);
        Ok((cid, key))
    }
}

/// A decoded wantlist.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Wantlist {
    pub entries: Vec<WantEntry>,
}

impl Wantlist {
    pub fn new(entries: Vec<WantEntry>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Canonical storage key of a block: the multihash of its CID, shown as hex.
///
/// CIDv0 and CIDv1 of the same content map to the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockKey {
    hex: String,
    multihash: Bytes,
}

impl BlockKey {
    pub fn from_cid(cid: &Cid) -> Self {
        let multihash = cid.hash().to_bytes();
        Self {
            hex: hex::encode(&multihash),
            multihash: Bytes::from(multihash),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.hex
    }

    /// The raw multihash bytes behind the key.
    pub fn as_bytes(&self) -> &[u8] {
        &self.multihash
    }
}

impl fmt::Display for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex)
    }
}

/// A block of data with an associated CID
#[derive(Clone, PartialEq, Eq)]
pub struct Block {
    pub cid: Cid,
    pub data: Bytes,
}

impl Block {
    pub fn new(cid: Cid, data: impl Into<Bytes>) -> Self {
        Self {
            cid,
            data: data.into(),
        }
    }

    /// Get the size of the block's data in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("cid", &self.cid)
            .field("size", &self.size())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PresenceKind {
    Have,
    DontHave,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockPresence {
    pub cid: Cid,
    pub kind: PresenceKind,
}

/// The outcome of resolving one want entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedItem {
    Block(Block),
    Presence(BlockPresence),
}

impl ResolvedItem {
    pub fn cid(&self) -> &Cid {
        match self {
            ResolvedItem::Block(block) => &block.cid,
            ResolvedItem::Presence(presence) => &presence.cid,
        }
    }

    /// Serialized contribution of this item to an outbound message.
    pub fn encoded_size(&self, protocol: ProtocolVersion) -> usize {
        match self {
            ResolvedItem::Block(block) => block.size(),
            ResolvedItem::Presence(presence) => protocol.presence_size(&presence.cid),
        }
    }
}
