//! Peer identity and the directory of known peers.

mod addrs;
mod names;
mod record;
mod registry;

pub use addrs::AddressSet;
pub use names::random_name;
pub use record::{LocalPeer, PeerRecord, Ports, ID_LEN};
pub use registry::{ChangeSignal, PeerRegistry};
