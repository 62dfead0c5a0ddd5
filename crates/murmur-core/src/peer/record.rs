use std::sync::Arc;

use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};

use super::{random_name, AddressSet};
use crate::crypto::{CryptoError, Identity};

/// Length in bytes of the random material behind a peer id.
pub const ID_LEN: usize = 32;

/// Ports a peer listens on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ports {
    /// Mutual-TLS message streams.
    pub secure: u16,
    /// Unauthenticated greet handshake.
    pub greet: u16,
    /// HTTP health check, also used by catalog discovery.
    pub health: u16,
}

/// A peer as this instance knows it.
///
/// `id`, `name`, `ports` and `public_cert` are fixed at creation; only
/// the address set grows afterwards. Two records describe the same peer
/// iff their ids match.
#[derive(Debug)]
pub struct PeerRecord {
    pub id: String,
    pub name: String,
    pub ports: Ports,
    pub addresses: AddressSet,
    /// PEM-encoded self-signed certificate. Empty when unknown.
    pub public_cert: String,
}

impl PeerRecord {
    pub fn new(id: String, name: String, ports: Ports, public_cert: String) -> Self {
        Self {
            id,
            name,
            ports,
            addresses: AddressSet::new(),
            public_cert,
        }
    }

    /// Short BLAKE3 fingerprint of the certificate, for logs.
    pub fn cert_fingerprint(&self) -> String {
        crate::crypto::fingerprint(self.public_cert.as_bytes())
    }

    pub fn has_certificate(&self) -> bool {
        !self.public_cert.is_empty()
    }
}

/// This process's own peer: the public record plus the private key.
///
/// The key never leaves this struct except as in-memory TLS
/// configuration.
pub struct LocalPeer {
    record: Arc<PeerRecord>,
    identity: Identity,
}

impl LocalPeer {
    /// Create a fresh identity. Id, display name and certificate serial
    /// are drawn from `rng`.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R, ports: Ports) -> Result<Self, CryptoError> {
        let mut id_bytes = [0u8; ID_LEN];
        rng.fill_bytes(&mut id_bytes);
        let id = hex::encode(id_bytes);
        let name = random_name(rng);

        let identity = Identity::generate(rng, &id)?;
        let record = PeerRecord::new(id, name, ports, identity.cert_pem().to_string());

        tracing::info!(
            peer = %record.id,
            name = %record.name,
            cert = %record.cert_fingerprint(),
            "local peer ready"
        );

        Ok(Self {
            record: Arc::new(record),
            identity,
        })
    }

    pub fn record(&self) -> &Arc<PeerRecord> {
        &self.record
    }

    pub fn id(&self) -> &str {
        &self.record.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }
}
