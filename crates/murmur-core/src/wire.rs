//! murmur wire format: JSON bodies for every payload that crosses the network.
//!
//! Three shapes:
//!   - `PeerPayload`: multicast datagrams and the /healthcheck body
//!   - `GreetPeer`:   the unauthenticated greet request and reply
//!   - `Frame`:       length-delimited frames on secure streams
//!
//! Addresses are never trusted from a `PeerPayload`; the receiver
//! attaches the address it observed. Unknown fields are ignored so older
//! peers can read newer payloads.

use std::net::IpAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message::MessageKind;
use crate::peer::{PeerRecord, PeerRegistry, Ports};

/// Largest UDP payload that fits in one IPv4 datagram.
pub const MAX_DATAGRAM: usize = 65_507;

/// Largest length-delimited frame accepted on greet and secure streams.
pub const MAX_FRAME: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload is {len} bytes, limit is {max}")]
    TooLarge { len: usize, max: usize },

    #[error("payload has an empty peer id")]
    MissingId,
}

// ── Discovery payload ─────────────────────────────────────────────────────────

/// A peer's public identity, without addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerPayload {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub ports: Ports,
    #[serde(default)]
    pub public_key: String,
}

impl From<&PeerRecord> for PeerPayload {
    fn from(peer: &PeerRecord) -> Self {
        Self {
            id: peer.id.clone(),
            name: peer.name.clone(),
            ports: peer.ports,
            public_key: peer.public_cert.clone(),
        }
    }
}

impl PeerPayload {
    /// A fresh record with an empty address set.
    pub fn into_record(self) -> PeerRecord {
        PeerRecord::new(self.id, self.name, self.ports, self.public_key)
    }
}

/// Serialize `peer` for a datagram or HTTP body.
pub fn encode_peer(peer: &PeerRecord) -> Result<Vec<u8>, WireError> {
    Ok(serde_json::to_vec(&PeerPayload::from(peer))?)
}

/// Decode a payload into a record with no addresses.
pub fn decode_peer(bytes: &[u8]) -> Result<PeerRecord, WireError> {
    let payload: PeerPayload = serde_json::from_slice(bytes)?;
    if payload.id.is_empty() {
        return Err(WireError::MissingId);
    }
    Ok(payload.into_record())
}

// ── Greet payload ─────────────────────────────────────────────────────────────

/// Identity exchanged during the greet handshake.
///
/// Unlike `PeerPayload` this carries addresses and the sender's known
/// peers. Known peers are flattened to one level: their own
/// `known_peers` are always sent empty and ignored on receipt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GreetPeer {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub ports: Ports,
    #[serde(default)]
    pub public_key: String,
    #[serde(default)]
    pub addrs: Vec<IpAddr>,
    #[serde(default)]
    pub known_peers: Vec<GreetPeer>,
}

impl GreetPeer {
    fn leaf(peer: &PeerRecord) -> Self {
        Self {
            id: peer.id.clone(),
            name: peer.name.clone(),
            ports: peer.ports,
            public_key: peer.public_cert.clone(),
            addrs: peer.addresses.list(),
            known_peers: Vec::new(),
        }
    }

    /// Describe `me` together with everything `known` holds.
    pub fn describe(me: &PeerRecord, known: &PeerRegistry) -> Self {
        let mut greet = Self::leaf(me);
        greet.known_peers = known
            .list()
            .iter()
            .filter(|p| p.id != me.id)
            .map(|p| Self::leaf(p))
            .collect();
        greet
    }

    fn to_record(&self) -> PeerRecord {
        let peer = PeerRecord::new(
            self.id.clone(),
            self.name.clone(),
            self.ports,
            self.public_key.clone(),
        );
        for addr in &self.addrs {
            peer.addresses.add(*addr);
        }
        peer
    }

    /// The sender's record and one record per listed known peer.
    /// Entries with an empty id are dropped.
    pub fn into_records(self) -> Result<(Arc<PeerRecord>, Vec<Arc<PeerRecord>>), WireError> {
        if self.id.is_empty() {
            return Err(WireError::MissingId);
        }
        let sender = Arc::new(self.to_record());
        let known = self
            .known_peers
            .iter()
            .filter(|p| !p.id.is_empty())
            .map(|p| Arc::new(p.to_record()))
            .collect();
        Ok((sender, known))
    }
}

// ── Stream frames ─────────────────────────────────────────────────────────────

/// One frame on a secure stream.
///
/// `Hello` is sent exactly once, first, by the dialing side and names the
/// caller. Every later frame is a `Chat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum Frame {
    Hello {
        peer_id: String,
    },
    Chat {
        id: String,
        timestamp: u64,
        kind: MessageKind,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        text: String,
    },
}

pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, WireError> {
    let bytes = serde_json::to_vec(frame)?;
    if bytes.len() > MAX_FRAME {
        return Err(WireError::TooLarge {
            len: bytes.len(),
            max: MAX_FRAME,
        });
    }
    Ok(bytes)
}

pub fn decode_frame(bytes: &[u8]) -> Result<Frame, WireError> {
    Ok(serde_json::from_slice(bytes)?)
}
