//! Chat messages exchanged over secure streams.

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::wire::Frame;

/// Bytes of randomness behind a message id.
pub const MESSAGE_ID_LEN: usize = 32;

/// Message type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
}

/// Who a message came from or went to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRef {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    /// Unix milliseconds at creation on the sending side.
    pub timestamp: u64,
    pub kind: MessageKind,
    pub text: String,
    pub from: PeerRef,
    pub to: PeerRef,
}

impl Message {
    /// A new text message with a fresh random id, stamped now.
    pub fn text<R: RngCore + ?Sized>(rng: &mut R, from: PeerRef, to: PeerRef, text: impl Into<String>) -> Self {
        let mut id = [0u8; MESSAGE_ID_LEN];
        rng.fill_bytes(&mut id);

        Self {
            id: hex::encode(id),
            timestamp: now_millis(),
            kind: MessageKind::Text,
            text: text.into(),
            from,
            to,
        }
    }

    /// The stream frame carrying this message. Sender and recipient are
    /// implied by the connection.
    pub fn to_frame(&self) -> Frame {
        Frame::Chat {
            id: self.id.clone(),
            timestamp: self.timestamp,
            kind: self.kind,
            text: self.text.clone(),
        }
    }

    /// Rebuild a message from a received chat frame. Returns `None` for
    /// any other frame.
    pub fn from_frame(frame: Frame, from: PeerRef, to: PeerRef) -> Option<Self> {
        match frame {
            Frame::Chat { id, timestamp, kind, text } => Some(Self {
                id,
                timestamp,
                kind,
                text,
                from,
                to,
            }),
            Frame::Hello { .. } => None,
        }
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
