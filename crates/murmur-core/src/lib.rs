pub mod config;
pub mod crypto;
pub mod message;
pub mod peer;
pub mod wire;

pub use message::{Message, MessageKind, PeerRef};
pub use peer::{AddressSet, ChangeSignal, LocalPeer, PeerRecord, PeerRegistry, Ports};
