//! Peer id → socket address resolution for outbound connections.

use std::net::SocketAddr;

use dashmap::DashMap;
use murmur_core::PeerRecord;

/// Which listener of a peer an address points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// Mutual-TLS message streams.
    Secure,
    /// Unauthenticated greet handshake.
    Greet,
}

pub trait Resolve: Send + Sync {
    /// Every address to try for `peer_id`, in preference order.
    /// Empty if the peer was never published.
    fn resolve(&self, peer_id: &str) -> Vec<SocketAddr>;
}

/// Resolver fed from peer records. One instance per scheme.
#[derive(Debug)]
pub struct AddressResolver {
    scheme: Scheme,
    table: DashMap<String, Vec<SocketAddr>>,
}

impl AddressResolver {
    pub fn new(scheme: Scheme) -> Self {
        Self {
            scheme,
            table: DashMap::new(),
        }
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// Publish or refresh the addresses for `peer`, pairing each of its
    /// IPs with the port for this resolver's scheme.
    pub fn add(&self, peer: &PeerRecord) {
        let port = match self.scheme {
            Scheme::Secure => peer.ports.secure,
            Scheme::Greet => peer.ports.greet,
        };
        let addrs: Vec<SocketAddr> = peer
            .addresses
            .list()
            .into_iter()
            .map(|ip| SocketAddr::new(ip, port))
            .collect();

        tracing::trace!(peer = %peer.id, scheme = ?self.scheme, count = addrs.len(), "resolver updated");
        self.table.insert(peer.id.clone(), addrs);
    }

    /// `host:port` strings, IPv6 hosts in brackets.
    pub fn resolve_display(&self, peer_id: &str) -> Vec<String> {
        self.resolve(peer_id).iter().map(|a| a.to_string()).collect()
    }
}

impl Resolve for AddressResolver {
    fn resolve(&self, peer_id: &str) -> Vec<SocketAddr> {
        self.table
            .get(peer_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }
}
