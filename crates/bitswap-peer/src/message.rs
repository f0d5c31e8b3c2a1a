//! Size-bounded packing of resolved items into outbound messages.

use crate::protocol::{Block, BlockPresence, ProtocolVersion, ResolvedItem};

/// An outbound BitSwap message under construction or ready to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    protocol: ProtocolVersion,
    items: Vec<ResolvedItem>,
    size: usize,
}

impl OutboundMessage {
    pub fn new(protocol: ProtocolVersion) -> Self {
        Self {
            protocol,
            items: Vec::new(),
            size: 0,
        }
    }

    /// Appends an item, accounting `size` bytes for it.
    pub fn push(&mut self, item: ResolvedItem, size: usize) {
        self.items.push(item);
        self.size += size;
    }

    pub fn protocol(&self) -> ProtocolVersion {
        self.protocol
    }

    /// Running serialized size of the items.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[ResolvedItem] {
        &self.items
    }

    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.items.iter().filter_map(|item| match item {
            ResolvedItem::Block(block) => Some(block),
            ResolvedItem::Presence(_) => None,
        })
    }

    pub fn presences(&self) -> impl Iterator<Item = &BlockPresence> {
        self.items.iter().filter_map(|item| match item {
            ResolvedItem::Presence(presence) => Some(presence),
            ResolvedItem::Block(_) => None,
        })
    }
}

/// Packs `items`, in order, into messages of at most `max_message_size`
/// bytes.
///
/// A single item larger than the limit is still emitted, alone in its own
/// message. Empty input yields no messages.
pub fn pack(
    items: Vec<ResolvedItem>,
    protocol: ProtocolVersion,
    max_message_size: usize,
) -> Vec<OutboundMessage> {
    let mut sealed = Vec::new();
    let mut message = OutboundMessage::new(protocol);

    for item in items {
        let size = item.encoded_size(protocol);
        if !message.is_empty() && message.size() + size > max_message_size {
            sealed.push(std::mem::replace(
                &mut message,
                OutboundMessage::new(protocol),
            ));
        }
        message.push(item, size);
    }

    if !message.is_empty() {
        sealed.push(message);
    }
    sealed
}
