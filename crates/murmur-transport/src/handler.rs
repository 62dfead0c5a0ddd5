//! Transport handler: owns every secure stream to other peers.
//!
//! Per remote peer a stream is either absent or open. `send_text` opens
//! one on demand (greet → pinned mutual TLS → hello frame), caches it by
//! peer id and spawns a reader that forwards incoming chat frames to the
//! `received` channel. Inbound streams accepted by the server side land in
//! the same cache, so either side's connection serves both directions.
//!
//! A failed write or a closed reader evicts the stream; the next send
//! dials again. Nothing here retries on its own.
//!
//! Every dial greets first, even when the registry already holds the
//! peer's certificate: the accepting side only trusts a hello from a peer
//! it has recorded, and the greet is how it records us. A peer whose greet
//! port is unreachable therefore cannot be dialled at all.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use rand::rngs::StdRng;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::timeout;
use tokio_rustls::{TlsConnector, TlsStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use murmur_core::crypto::{self, CryptoError};
use murmur_core::wire::{self, Frame, GreetPeer};
use murmur_core::{LocalPeer, Message, PeerRecord, PeerRef, PeerRegistry};

use crate::framing::{framed, write_json, FrameError};
use crate::greet;
use crate::resolver::{AddressResolver, Resolve, Scheme};

/// Bound on TCP connect plus TLS handshake for one address.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on a single frame write.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) type SecureConn = Framed<TlsStream<TcpStream>, LengthDelimitedCodec>;
type FrameSink = SplitSink<SecureConn, Bytes>;
type FrameSource = SplitStream<SecureConn>;

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("unknown peer {0}")]
    UnknownPeer(String),

    #[error("invalid certificate for peer {peer}: {source}")]
    Certificate {
        peer: String,
        #[source]
        source: CryptoError,
    },

    #[error("delivery to {peer} failed: {reason}")]
    Delivery { peer: String, reason: String },
}

impl SendError {
    fn delivery(peer: &str, reason: impl std::fmt::Display) -> Self {
        SendError::Delivery {
            peer: peer.to_string(),
            reason: reason.to_string(),
        }
    }
}

// ── Streams ───────────────────────────────────────────────────────────────────

/// Receivers handed out once, at construction.
pub struct MessageStreams {
    /// Every chat message arriving from any peer.
    pub received: mpsc::UnboundedReceiver<Message>,
    /// Every message this instance wrote successfully.
    pub sent: mpsc::UnboundedReceiver<Message>,
}

/// Counters for connection establishment, mainly for tests and status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandlerStats {
    pub dialed: u64,
    pub accepted: u64,
    pub greeted: u64,
}

/// The write half of one open secure stream.
pub(crate) struct PeerStream {
    pub(crate) peer: PeerRef,
    sink: Mutex<FrameSink>,
}

// ── Handler ───────────────────────────────────────────────────────────────────

pub struct Handler {
    pub(crate) me: Arc<LocalPeer>,
    pub(crate) registry: Arc<PeerRegistry>,
    secure_resolver: AddressResolver,
    greet_resolver: AddressResolver,
    pub(crate) server_config: Arc<rustls::ServerConfig>,
    streams: RwLock<HashMap<String, Arc<PeerStream>>>,
    /// Per-peer dial locks: at most one establishment in flight per peer.
    dials: DashMap<String, Arc<Mutex<()>>>,
    rng: parking_lot::Mutex<StdRng>,
    received_tx: mpsc::UnboundedSender<Message>,
    sent_tx: mpsc::UnboundedSender<Message>,
    pub(crate) tasks: TaskTracker,
    pub(crate) cancel: CancellationToken,
    dialed: AtomicU64,
    pub(crate) accepted: AtomicU64,
    pub(crate) greeted: AtomicU64,
}

impl Handler {
    /// Build a handler for `me`. `rng` supplies message ids; `cancel`
    /// stops every connection task this handler spawns.
    pub fn new(
        me: Arc<LocalPeer>,
        registry: Arc<PeerRegistry>,
        rng: StdRng,
        cancel: CancellationToken,
    ) -> Result<(Arc<Self>, MessageStreams), CryptoError> {
        let server_config = Arc::new(crypto::server_config(me.identity())?);
        let (received_tx, received) = mpsc::unbounded_channel();
        let (sent_tx, sent) = mpsc::unbounded_channel();

        let handler = Arc::new(Self {
            me,
            registry,
            secure_resolver: AddressResolver::new(Scheme::Secure),
            greet_resolver: AddressResolver::new(Scheme::Greet),
            server_config,
            streams: RwLock::new(HashMap::new()),
            dials: DashMap::new(),
            rng: parking_lot::Mutex::new(rng),
            received_tx,
            sent_tx,
            tasks: TaskTracker::new(),
            cancel,
            dialed: AtomicU64::new(0),
            accepted: AtomicU64::new(0),
            greeted: AtomicU64::new(0),
        });

        Ok((handler, MessageStreams { received, sent }))
    }

    pub fn me(&self) -> &Arc<LocalPeer> {
        &self.me
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> HandlerStats {
        HandlerStats {
            dialed: self.dialed.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            greeted: self.greeted.load(Ordering::Relaxed),
        }
    }

    /// Addresses the secure scheme currently resolves `peer_id` to.
    pub fn resolve_display(&self, peer_id: &str) -> Vec<String> {
        self.secure_resolver.resolve_display(peer_id)
    }

    /// Is a stream to `peer_id` currently open?
    pub async fn is_connected(&self, peer_id: &str) -> bool {
        self.streams.read().await.contains_key(peer_id)
    }

    /// The record for `id`: ourselves or a known peer.
    pub(crate) fn lookup(&self, id: &str) -> Option<Arc<PeerRecord>> {
        if id == self.me.id() {
            return Some(self.me.record().clone());
        }
        self.registry.get(id)
    }

    /// Send `text` to `peer_id`, connecting first if needed.
    ///
    /// The returned message is also published on `sent`.
    pub async fn send_text(self: &Arc<Self>, peer_id: &str, text: &str) -> Result<Message, SendError> {
        let peer = self
            .lookup(peer_id)
            .ok_or_else(|| SendError::UnknownPeer(peer_id.to_string()))?;

        let stream = self.stream_for(&peer).await?;

        let message = {
            let mut rng = self.rng.lock();
            Message::text(&mut *rng, self.me_ref(), stream.peer.clone(), text)
        };

        let body = wire::encode_frame(&message.to_frame()).map_err(|e| SendError::delivery(peer_id, e))?;
        let written = {
            let mut sink = stream.sink.lock().await;
            timeout(WRITE_TIMEOUT, sink.send(Bytes::from(body)))
                .await
                .map_err(|_| FrameError::TimedOut)
                .and_then(|r| r.map_err(FrameError::from))
        };

        if let Err(e) = written {
            if e.is_disconnect() {
                tracing::warn!(peer = %peer_id, error = %e, "stream terminated during send");
            } else {
                tracing::error!(peer = %peer_id, error = %e, "send failed");
            }
            self.evict(peer_id, &stream).await;
            return Err(SendError::delivery(peer_id, e));
        }

        tracing::debug!(peer = %peer_id, message = %message.id, "message sent");
        let _ = self.sent_tx.send(message.clone());
        Ok(message)
    }

    pub(crate) fn me_ref(&self) -> PeerRef {
        let record = self.me.record();
        PeerRef {
            id: record.id.clone(),
            name: record.name.clone(),
        }
    }

    async fn cached(&self, peer_id: &str) -> Option<Arc<PeerStream>> {
        self.streams.read().await.get(peer_id).cloned()
    }

    /// The open stream to `peer`, establishing one if none exists.
    /// Concurrent callers for the same peer share one establishment.
    async fn stream_for(self: &Arc<Self>, peer: &Arc<PeerRecord>) -> Result<Arc<PeerStream>, SendError> {
        if let Some(stream) = self.cached(&peer.id).await {
            return Ok(stream);
        }

        let lock = self.dials.entry(peer.id.clone()).or_default().clone();
        let result = {
            let _guard = lock.lock().await;
            // Another caller may have finished while we waited.
            match self.cached(&peer.id).await {
                Some(stream) => Ok(stream),
                None => self.establish(peer).await,
            }
        };

        // The map and `lock` hold two references; any more are waiters
        // still queued on this establishment.
        self.dials.remove_if(&peer.id, |_, l| Arc::strong_count(l) <= 2);
        result
    }

    async fn establish(self: &Arc<Self>, peer: &Arc<PeerRecord>) -> Result<Arc<PeerStream>, SendError> {
        let id = peer.id.as_str();
        self.secure_resolver.add(peer);
        self.greet_resolver.add(peer);

        let hello = GreetPeer::describe(self.me.record(), &self.registry);
        let reply = greet::initiate(&self.greet_resolver.resolve(id), &hello)
            .await
            .map_err(|e| SendError::delivery(id, format!("{e:#}")))?;
        let greeted = greet::record(reply, &self.me, &self.registry)
            .map_err(|e| SendError::delivery(id, format!("{e:#}")))?;
        self.greeted.fetch_add(1, Ordering::Relaxed);

        // The stored record is authoritative; the greet only fills gaps.
        let current = self.lookup(id).unwrap_or(greeted.clone());
        let cert = if current.has_certificate() {
            current.public_cert.clone()
        } else {
            greeted.public_cert.clone()
        };
        self.secure_resolver.add(&current);

        let client_config = crypto::client_config(self.me.identity(), &cert).map_err(|source| {
            SendError::Certificate {
                peer: id.to_string(),
                source,
            }
        })?;
        let connector = TlsConnector::from(Arc::new(client_config));
        let server_name = crypto::peer_server_name().map_err(|source| SendError::Certificate {
            peer: id.to_string(),
            source,
        })?;

        let addrs = self.secure_resolver.resolve(id);
        if addrs.is_empty() {
            return Err(SendError::delivery(id, "no known address"));
        }

        let mut last_err = String::new();
        for addr in addrs {
            let attempt = async {
                let tcp = TcpStream::connect(addr).await?;
                tcp.set_nodelay(true)?;
                connector.connect(server_name.clone(), tcp).await
            };
            match timeout(CONNECT_TIMEOUT, attempt).await {
                Ok(Ok(tls)) => {
                    self.dialed.fetch_add(1, Ordering::Relaxed);
                    tracing::info!(peer = %id, addr = %addr, cert = %current.cert_fingerprint(), "secure stream opened");

                    let mut conn = framed(TlsStream::Client(tls));
                    let hello = Frame::Hello {
                        peer_id: self.me.id().to_string(),
                    };
                    write_json(&mut conn, &hello)
                        .await
                        .map_err(|e| SendError::delivery(id, e))?;

                    let remote = PeerRef {
                        id: current.id.clone(),
                        name: current.name.clone(),
                    };
                    let (stream, source) = self.open(remote, conn).await;
                    self.tasks
                        .spawn(self.clone().read_frames(stream.clone(), source));
                    return Ok(stream);
                }
                Ok(Err(e)) => {
                    tracing::debug!(peer = %id, addr = %addr, error = %e, "secure connect failed");
                    last_err = e.to_string();
                }
                Err(_) => {
                    tracing::debug!(peer = %id, addr = %addr, "secure connect timed out");
                    last_err = "timed out".into();
                }
            }
        }
        Err(SendError::delivery(id, last_err))
    }

    /// Cache a freshly opened connection. Returns the read half for the
    /// caller to drive with [`Handler::read_frames`].
    pub(crate) async fn open(&self, remote: PeerRef, conn: SecureConn) -> (Arc<PeerStream>, FrameSource) {
        let (sink, source) = conn.split();
        let stream = Arc::new(PeerStream {
            peer: remote,
            sink: Mutex::new(sink),
        });

        // Last writer wins: both connections are equally valid.
        self.streams
            .write()
            .await
            .insert(stream.peer.id.clone(), stream.clone());

        (stream, source)
    }

    /// Forward every chat frame on `source` to `received` until the
    /// connection ends or the handler shuts down, then evict the stream.
    pub(crate) async fn read_frames(self: Arc<Self>, stream: Arc<PeerStream>, mut source: FrameSource) {
        let peer_id = stream.peer.id.clone();

        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = source.next() => next,
            };

            let bytes: BytesMut = match next {
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) => {
                    let e = FrameError::from(e);
                    if e.is_disconnect() {
                        tracing::debug!(peer = %peer_id, error = %e, "stream terminated");
                    } else {
                        tracing::warn!(peer = %peer_id, error = %e, "stream read failed");
                    }
                    break;
                }
                None => {
                    tracing::debug!(peer = %peer_id, "stream closed by peer");
                    break;
                }
            };

            let frame = match wire::decode_frame(&bytes) {
                Ok(f) => f,
                Err(e) => {
                    tracing::warn!(peer = %peer_id, error = %e, "dropping malformed frame");
                    continue;
                }
            };

            match Message::from_frame(frame, stream.peer.clone(), self.me_ref()) {
                Some(message) => {
                    tracing::debug!(peer = %peer_id, message = %message.id, "message received");
                    let _ = self.received_tx.send(message);
                }
                None => tracing::debug!(peer = %peer_id, "ignoring repeated hello"),
            }
        }

        self.evict(&peer_id, &stream).await;
    }

    /// Take `stream` out of the cache if it is still the cached entry.
    pub(crate) async fn evict(&self, peer_id: &str, stream: &Arc<PeerStream>) {
        let mut streams = self.streams.write().await;
        if streams.get(peer_id).is_some_and(|s| Arc::ptr_eq(s, stream)) {
            streams.remove(peer_id);
            tracing::debug!(peer = %peer_id, "stream evicted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_core::Ports;
    use rand::SeedableRng;

    #[tokio::test]
    async fn unknown_peer_is_rejected_without_network() {
        let mut rng = StdRng::seed_from_u64(11);
        let me = Arc::new(LocalPeer::generate(&mut rng, Ports::default()).unwrap());
        let (handler, mut streams) =
            Handler::new(me, Arc::new(PeerRegistry::new()), rng, CancellationToken::new()).unwrap();

        let err = handler.send_text("nobody", "hi").await.unwrap_err();
        assert!(matches!(err, SendError::UnknownPeer(ref id) if id == "nobody"));
        assert_eq!(handler.stats(), HandlerStats::default());
        assert!(streams.sent.try_recv().is_err());
    }

    #[tokio::test]
    async fn known_peer_without_addresses_fails_delivery() {
        let mut rng = StdRng::seed_from_u64(12);
        let me = Arc::new(LocalPeer::generate(&mut rng, Ports::default()).unwrap());
        let registry = Arc::new(PeerRegistry::new());
        registry.add(Arc::new(PeerRecord::new("ghost".into(), "g".into(), Ports::default(), String::new())));
        let (handler, _streams) = Handler::new(me, registry, rng, CancellationToken::new()).unwrap();

        let err = handler.send_text("ghost", "hi").await.unwrap_err();
        assert!(matches!(err, SendError::Delivery { .. }));
        assert!(!handler.is_connected("ghost").await);
    }

    #[tokio::test]
    async fn dial_locks_are_released_after_each_attempt() {
        let mut rng = StdRng::seed_from_u64(13);
        let me = Arc::new(LocalPeer::generate(&mut rng, Ports::default()).unwrap());
        let registry = Arc::new(PeerRegistry::new());
        for id in ["ghost-1", "ghost-2", "ghost-3"] {
            registry.add(Arc::new(PeerRecord::new(id.into(), "g".into(), Ports::default(), String::new())));
        }
        let (handler, _streams) = Handler::new(me, registry, rng, CancellationToken::new()).unwrap();

        let (a, b, c) = tokio::join!(
            handler.send_text("ghost-1", "hi"),
            handler.send_text("ghost-1", "hi again"),
            handler.send_text("ghost-2", "hi"),
        );
        assert!(a.is_err() && b.is_err() && c.is_err());
        assert!(handler.send_text("ghost-3", "hi").await.is_err());

        assert!(handler.dials.is_empty(), "{} dial locks left behind", handler.dials.len());
    }
}
