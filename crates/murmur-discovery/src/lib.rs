//! Peer discovery.
//!
//! Every source implements [`Discovery`]: hand it a cancellation token and
//! it returns a [`Sightings`] stream of freshly decoded peer records, each
//! carrying the address it was observed at. Sources never filter out the
//! local peer; deciding what a sighting means is the caller's job.
//!
//! Sources:
//!   - [`MulticastDiscovery`]: UDP multicast broadcast/listen, IPv4 or IPv6
//!   - [`CatalogDiscovery`]:   Consul agent catalog
//!   - [`MergeDiscovery`]:     fan-in over any number of other sources
//!   - [`StaticDiscovery`]:    a fixed list, for tests and seeding

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use murmur_core::PeerRecord;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub mod catalog;
pub mod merge;
pub mod multicast;
pub mod netif;

pub use catalog::CatalogDiscovery;
pub use merge::MergeDiscovery;
pub use multicast::{Family, MulticastDiscovery};

/// Sightings buffered per source before producers wait on the consumer.
const SIGHTING_BUFFER: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("invalid multicast group {0:?}")]
    BadGroup(String),

    #[error("{group} is not an {family} multicast address")]
    NotMulticast { group: String, family: Family },

    #[error("announcement payload is {len} bytes, datagram limit is {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("cannot encode announcement: {0}")]
    Encode(#[from] murmur_core::wire::WireError),

    #[error("catalog client: {0}")]
    Client(#[from] reqwest::Error),
}

/// A source of peer sightings.
pub trait Discovery: Send + Sync {
    /// Start producing sightings. Must be called inside a Tokio runtime.
    ///
    /// The stream is infinite for live sources and ends once `cancel`
    /// fires and every producer task has exited.
    fn discover(&self, cancel: CancellationToken) -> Sightings;
}

// ── Sightings ─────────────────────────────────────────────────────────────────

/// Receiving half of a discovery source.
#[derive(Debug)]
pub struct Sightings {
    rx: mpsc::Receiver<PeerRecord>,
}

/// Producing half, cloned into each producer task.
#[derive(Debug, Clone)]
pub struct SightingSender {
    tx: mpsc::Sender<PeerRecord>,
}

impl Sightings {
    pub fn channel() -> (SightingSender, Sightings) {
        let (tx, rx) = mpsc::channel(SIGHTING_BUFFER);
        (SightingSender { tx }, Sightings { rx })
    }

    /// The next sighting, or `None` once every producer is gone.
    pub async fn next(&mut self) -> Option<PeerRecord> {
        self.rx.recv().await
    }
}

impl Stream for Sightings {
    type Item = PeerRecord;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl SightingSender {
    /// Deliver one sighting. Returns false when the consumer is gone or
    /// `cancel` fired while waiting for room; producers should stop.
    pub async fn emit(&self, peer: PeerRecord, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            sent = self.tx.send(peer) => sent.is_ok(),
        }
    }
}

// ── Static ────────────────────────────────────────────────────────────────────

/// Emits a fixed set of records once, then ends.
#[derive(Debug, Default)]
pub struct StaticDiscovery {
    peers: Vec<murmur_core::wire::PeerPayload>,
    addrs: Vec<Vec<std::net::IpAddr>>,
}

impl StaticDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a record to emit. Each `discover` call yields a fresh copy.
    pub fn with_peer(mut self, peer: &PeerRecord) -> Self {
        self.peers.push(murmur_core::wire::PeerPayload::from(peer));
        self.addrs.push(peer.addresses.list());
        self
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

impl Discovery for StaticDiscovery {
    fn discover(&self, cancel: CancellationToken) -> Sightings {
        let (tx, rx) = Sightings::channel();
        let items: Vec<PeerRecord> = self
            .peers
            .iter()
            .zip(&self.addrs)
            .map(|(payload, addrs)| {
                let peer = payload.clone().into_record();
                for addr in addrs {
                    peer.addresses.add(*addr);
                }
                peer
            })
            .collect();

        tokio::spawn(async move {
            for peer in items {
                if !tx.emit(peer, &cancel).await {
                    break;
                }
            }
        });
        rx
    }
}
