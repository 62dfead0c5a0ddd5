//! Greet handshake: the unauthenticated identity exchange that precedes a
//! secure stream.
//!
//! One request/response per TCP connection. The initiator sends its
//! `GreetPeer`, the responder records it and answers with its own. Nothing
//! here is authenticated; the certificates learned are only trusted as far
//! as the TLS layer later proves key possession.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::net::TcpStream;
use tokio::time::timeout;

use murmur_core::wire::GreetPeer;
use murmur_core::{LocalPeer, PeerRecord, PeerRegistry};

use crate::framing::{framed, read_json, write_json, FrameError};

/// Bound on connect, write and read for one greet exchange.
pub const GREET_TIMEOUT: Duration = Duration::from_secs(5);

/// Greet the peer at each of `addrs` in turn and return the first reply.
pub async fn initiate(addrs: &[SocketAddr], hello: &GreetPeer) -> Result<GreetPeer> {
    if addrs.is_empty() {
        bail!("no known address");
    }

    let mut last_err = None;
    for addr in addrs {
        match exchange(*addr, hello).await {
            Ok(reply) => return Ok(reply),
            Err(e) => {
                tracing::debug!(addr = %addr, error = %e, "greet attempt failed");
                last_err = Some(e);
            }
        }
    }
    Err(last_err
        .unwrap_or_else(|| anyhow::anyhow!("no address answered"))
        .context(format!("greet failed on {} address(es)", addrs.len())))
}

async fn exchange(addr: SocketAddr, hello: &GreetPeer) -> Result<GreetPeer> {
    let tcp = timeout(GREET_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| FrameError::TimedOut)?
        .with_context(|| format!("connect {addr}"))?;
    let mut conn = framed(tcp);

    timeout(GREET_TIMEOUT, write_json(&mut conn, hello))
        .await
        .map_err(|_| FrameError::TimedOut)??;
    let reply = timeout(GREET_TIMEOUT, read_json::<_, GreetPeer>(&mut conn))
        .await
        .map_err(|_| FrameError::TimedOut)??;
    Ok(reply)
}

/// Record everything a greet payload describes. The local peer is never
/// added to its own registry.
pub fn record(greet: GreetPeer, me: &LocalPeer, registry: &PeerRegistry) -> Result<Arc<PeerRecord>> {
    let (sender, known) = greet.into_records()?;
    for peer in known {
        if peer.id != me.id() {
            registry.add(peer);
        }
    }
    if sender.id != me.id() {
        registry.add(sender.clone());
    }
    Ok(sender)
}

/// Serve one inbound greet connection.
pub async fn respond(
    tcp: TcpStream,
    remote: SocketAddr,
    me: &LocalPeer,
    registry: &PeerRegistry,
) -> Result<()> {
    let mut conn = framed(tcp);

    let mut request = timeout(GREET_TIMEOUT, read_json::<_, GreetPeer>(&mut conn))
        .await
        .map_err(|_| FrameError::TimedOut)?
        .context("reading greet")?;

    // The sender is reachable at the address the greet arrived from.
    if !request.addrs.contains(&remote.ip()) {
        request.addrs.push(remote.ip());
    }
    let sender = record(request, me, registry)?;
    tracing::debug!(peer = %sender.id, addr = %remote, "greeted by peer");

    let reply = GreetPeer::describe(me.record(), registry);
    timeout(GREET_TIMEOUT, write_json(&mut conn, &reply))
        .await
        .map_err(|_| FrameError::TimedOut)?
        .context("writing greet reply")?;
    Ok(())
}
