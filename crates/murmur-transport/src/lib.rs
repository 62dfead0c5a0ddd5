//! Peer-to-peer message transport.
//!
//! Two listeners per peer:
//!   - greet:  plain TCP, one JSON request/response exchanging identities
//!   - secure: mutual TLS with pinned self-signed certificates, carrying a
//!             long-lived stream of length-delimited chat frames
//!
//! [`Handler`] ties them together: `send_text` resolves, greets, dials and
//! writes; [`Handler::run`] accepts both kinds of inbound connection.

pub mod framing;
pub mod greet;
pub mod handler;
pub mod resolver;
mod server;

pub use handler::{Handler, HandlerStats, MessageStreams, SendError};
pub use resolver::{AddressResolver, Resolve, Scheme};
