use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::core::{Block, BlockKey, Contact, Priority};

/// One want-list change carried on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEntry {
    pub key: BlockKey,
    pub priority: Priority,
    /// True when this entry withdraws a want instead of announcing one.
    pub cancel: bool,
}

/// A single exchange message: a want-list change set plus any blocks the
/// sender is pushing.
///
/// `full` marks the entry set as a replacement for everything the receiver
/// knows about the sender's wants; otherwise the entries are a delta.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeMessage {
    pub full: bool,
    pub entries: Vec<MessageEntry>,
    pub blocks: Vec<Block>,
}

impl ExchangeMessage {
    pub fn new() -> Self {
        Self::default()
    }

    /// A message whose entries replace the receiver's view of our wants.
    pub fn full() -> Self {
        Self {
            full: true,
            ..Self::default()
        }
    }

    pub fn want_block(&mut self, key: BlockKey, priority: Priority) {
        self.entries.push(MessageEntry {
            key,
            priority,
            cancel: false,
        });
    }

    pub fn cancel_block(&mut self, key: BlockKey) {
        self.entries.push(MessageEntry {
            key,
            priority: 0,
            cancel: true,
        });
    }

    pub fn add_block(&mut self, block: Block) {
        self.blocks.push(block);
    }

    pub fn is_empty(&self) -> bool {
        !self.full && self.entries.is_empty() && self.blocks.is_empty()
    }
}

/// The framed unit of transport: who sent it, and what they said.
///
/// Carrying the sender's contact lets the accept side route replies without
/// a reverse-lookup from the QUIC session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Delivery {
    pub from: Contact,
    pub message: ExchangeMessage,
}

/// Encode a delivery for one frame.
pub fn encode_delivery(delivery: &Delivery) -> Result<Vec<u8>> {
    Ok(bincode::serialize(delivery)?)
}

/// Decode one frame's payload.
pub fn decode_delivery(bytes: &[u8]) -> Result<Delivery> {
    Ok(bincode::deserialize(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_builders_accumulate_entries() {
        let mut msg = ExchangeMessage::new();
        assert!(msg.is_empty());

        msg.want_block(BlockKey::hash(b"a"), 5);
        msg.cancel_block(BlockKey::hash(b"b"));
        msg.add_block(Block::new(b"c".to_vec()));

        assert!(!msg.is_empty());
        assert_eq!(msg.entries.len(), 2);
        assert!(!msg.entries[0].cancel);
        assert!(msg.entries[1].cancel);
        assert_eq!(msg.blocks.len(), 1);
    }

    #[test]
    fn full_message_is_never_empty() {
        let msg = ExchangeMessage::full();
        assert!(
            !msg.is_empty(),
            "a full snapshot clears remote state even without entries"
        );
    }

    #[test]
    fn delivery_survives_the_codec() {
        let mut message = ExchangeMessage::full();
        message.want_block(BlockKey::hash(b"wanted"), 3);
        message.add_block(Block::new(b"payload".to_vec()));
        let delivery = Delivery {
            from: Contact {
                id: [7u8; 32],
                addr: "peer-7".to_string(),
            },
            message,
        };

        let bytes = encode_delivery(&delivery).unwrap();
        let decoded = decode_delivery(&bytes).unwrap();
        assert_eq!(decoded.from, delivery.from);
        assert_eq!(decoded.message, delivery.message);

        assert!(decode_delivery(&bytes[..bytes.len() / 2]).is_err());
    }
}
