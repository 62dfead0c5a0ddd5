//! UDP multicast discovery.
//!
//! Each source runs two tasks:
//!   - broadcast: every interval, for every multicast-capable interface,
//!     join the group, select the interface, send our announcement, leave
//!   - listen: one socket bound to the group port, joined on every
//!     interface, decoding each datagram into a sighting
//!
//! Interface failures are logged and skipped; the loops keep running.

use std::collections::HashSet;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::time;
use tokio_util::sync::CancellationToken;

use murmur_core::wire::{self, MAX_DATAGRAM};
use murmur_core::PeerRecord;

use crate::netif::{self, Interface};
use crate::{Discovery, DiscoveryError, SightingSender, Sightings};

/// Multicast TTL / hop limit. Crosses at most one router.
const MULTICAST_HOPS: u32 = 2;

/// Pause after a failed receive before trying again.
const RECV_BACKOFF: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::V4 => f.write_str("IPv4"),
            Family::V6 => f.write_str("IPv6"),
        }
    }
}

pub struct MulticastDiscovery {
    family: Family,
    group: IpAddr,
    port: u16,
    payload: Arc<Vec<u8>>,
    interval: Duration,
}

impl MulticastDiscovery {
    /// Validate `group` and serialize `me` into the announcement.
    pub fn new(
        family: Family,
        group: &str,
        port: u16,
        me: &PeerRecord,
        interval: Duration,
    ) -> Result<Self, DiscoveryError> {
        let group: IpAddr = group
            .parse()
            .map_err(|_| DiscoveryError::BadGroup(group.to_string()))?;

        let family_ok = match (family, group) {
            (Family::V4, IpAddr::V4(ip)) => ip.is_multicast(),
            (Family::V6, IpAddr::V6(ip)) => ip.is_multicast(),
            _ => false,
        };
        if !family_ok {
            return Err(DiscoveryError::NotMulticast {
                group: group.to_string(),
                family,
            });
        }

        let payload = wire::encode_peer(me)?;
        if payload.len() > MAX_DATAGRAM {
            return Err(DiscoveryError::PayloadTooLarge {
                len: payload.len(),
                max: MAX_DATAGRAM,
            });
        }

        Ok(Self {
            family,
            group,
            port,
            payload: Arc::new(payload),
            interval,
        })
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn group(&self) -> SocketAddr {
        SocketAddr::new(self.group, self.port)
    }
}

impl Discovery for MulticastDiscovery {
    fn discover(&self, cancel: CancellationToken) -> Sightings {
        let (tx, rx) = Sightings::channel();

        tracing::info!(
            family = %self.family,
            group = %self.group(),
            interval_ms = self.interval.as_millis() as u64,
            "multicast discovery starting"
        );

        tokio::spawn(broadcast_loop(
            self.family,
            self.group,
            self.port,
            self.payload.clone(),
            self.interval,
            tx.clone(),
            cancel.clone(),
        ));
        tokio::spawn(listen_loop(
            self.family,
            self.group,
            self.port,
            self.interval,
            tx,
            cancel,
        ));

        rx
    }
}

// ── Broadcast ─────────────────────────────────────────────────────────────────

async fn broadcast_loop(
    family: Family,
    group: IpAddr,
    port: u16,
    payload: Arc<Vec<u8>>,
    interval: Duration,
    // Held so the stream only closes once both loops have exited.
    _tx: SightingSender,
    cancel: CancellationToken,
) {
    let socket = match make_sender_socket(family) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(family = %family, error = %e, "multicast broadcast socket failed");
            return;
        }
    };

    let mut ticker = time::interval(interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let ifaces = match netif::multicast_interfaces() {
            Ok(i) => i,
            Err(e) => {
                tracing::warn!(error = %e, "interface enumeration failed");
                continue;
            }
        };

        for iface in &ifaces {
            match send_on(&socket, group, port, iface, &payload) {
                Ok(true) => tracing::trace!(iface = %iface.name, "announcement sent"),
                Ok(false) => {}
                Err(e) => tracing::debug!(iface = %iface.name, error = %e, "announcement failed"),
            }
        }
    }

    tracing::debug!(family = %family, "multicast broadcast stopped");
}

fn make_sender_socket(family: Family) -> Result<Socket> {
    let domain = match family {
        Family::V4 => Domain::IPV4,
        Family::V6 => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("socket()")?;
    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    Ok(socket)
}

/// Announce once on `iface`. Returns false if the interface has no
/// address of the group's family.
fn send_on(
    socket: &Socket,
    group: IpAddr,
    port: u16,
    iface: &Interface,
    payload: &[u8],
) -> std::io::Result<bool> {
    match group {
        IpAddr::V4(group) => {
            let Some(local) = iface.primary_v4() else {
                return Ok(false);
            };
            socket.join_multicast_v4(&group, &local)?;
            let dest = SocketAddrV4::new(group, port);
            let sent = socket
                .set_multicast_if_v4(&local)
                .and_then(|_| socket.set_multicast_ttl_v4(MULTICAST_HOPS))
                .and_then(|_| socket.send_to(payload, &dest.into()));
            let _ = socket.leave_multicast_v4(&group, &local);
            sent.map(|_| true)
        }
        IpAddr::V6(group) => {
            if !iface.has_ipv6 {
                return Ok(false);
            }
            socket.join_multicast_v6(&group, iface.index)?;
            let dest = SocketAddrV6::new(group, port, 0, iface.index);
            let sent = socket
                .set_multicast_if_v6(iface.index)
                .and_then(|_| socket.set_multicast_hops_v6(MULTICAST_HOPS))
                .and_then(|_| socket.send_to(payload, &dest.into()));
            let _ = socket.leave_multicast_v6(&group, iface.index);
            sent.map(|_| true)
        }
    }
}

// ── Listen ────────────────────────────────────────────────────────────────────

async fn listen_loop(
    family: Family,
    group: IpAddr,
    port: u16,
    rejoin_every: Duration,
    tx: SightingSender,
    cancel: CancellationToken,
) {
    let socket = match make_listener_socket(family, port) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(family = %family, port, error = %e, "multicast listener socket failed");
            return;
        }
    };

    let mut joined: HashSet<Membership> = HashSet::new();
    let mut rejoin = time::interval(rejoin_every);
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        // Interfaces come and go, and a re-created one loses its
        // membership; rejoin everything on every tick.
        let (len, src) = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = rejoin.tick() => {
                join_all(&socket, group, &mut joined);
                continue;
            }
            r = socket.recv_from(&mut buf) => match r {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(error = %e, "multicast recv_from failed");
                    if !back_off(&cancel).await {
                        break;
                    }
                    continue;
                }
            },
        };

        let peer = match wire::decode_peer(&buf[..len]) {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!(src = %src, error = %e, "ignoring malformed announcement");
                continue;
            }
        };
        peer.addresses.add(src.ip());
        tracing::debug!(peer = %peer.id, addr = %src.ip(), "multicast sighting");

        if !tx.emit(peer, &cancel).await {
            break;
        }
    }

    tracing::debug!(family = %family, "multicast listener stopped");
}

/// Wait out a failed receive. Returns false if `cancel` fired meanwhile.
async fn back_off(cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = time::sleep(RECV_BACKOFF) => true,
    }
}

fn make_listener_socket(family: Family, port: u16) -> Result<UdpSocket> {
    let (domain, bind): (Domain, SocketAddr) = match family {
        Family::V4 => (Domain::IPV4, (Ipv4Addr::UNSPECIFIED, port).into()),
        Family::V6 => (Domain::IPV6, (Ipv6Addr::UNSPECIFIED, port).into()),
    };

    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("socket()")?;
    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    #[cfg(unix)]
    socket.set_reuse_port(true).context("SO_REUSEPORT")?;
    if family == Family::V6 {
        socket.set_only_v6(true).context("IPV6_V6ONLY")?;
    }
    socket.set_nonblocking(true).context("set_nonblocking")?;
    socket.bind(&bind.into()).context("bind()")?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).context("failed to convert to tokio UdpSocket")
}

/// One group membership on one interface instance.
///
/// Keyed by interface index and local address, not by name: an interface
/// deleted and re-created under the same name gets a new index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Membership {
    V4 { group: Ipv4Addr, index: u32, local: Ipv4Addr },
    V6 { group: Ipv6Addr, index: u32 },
}

impl Membership {
    /// The membership `group` needs on `iface`, if the interface has an
    /// address of the group's family.
    fn on(iface: &Interface, group: IpAddr) -> Option<Self> {
        match group {
            IpAddr::V4(group) => iface.primary_v4().map(|local| Membership::V4 {
                group,
                index: iface.index,
                local,
            }),
            IpAddr::V6(group) => iface.has_ipv6.then_some(Membership::V6 {
                group,
                index: iface.index,
            }),
        }
    }

    fn join(&self, socket: &UdpSocket) -> io::Result<()> {
        match *self {
            Membership::V4 { group, local, .. } => socket.join_multicast_v4(group, local),
            Membership::V6 { group, index } => socket.join_multicast_v6(&group, index),
        }
    }
}

/// Join `group` on every interface present now.
fn join_all(socket: &UdpSocket, group: IpAddr, joined: &mut HashSet<Membership>) {
    let ifaces = match netif::multicast_interfaces() {
        Ok(i) => i,
        Err(e) => {
            tracing::warn!(error = %e, "interface enumeration failed");
            return;
        }
    };
    refresh_memberships(joined, &ifaces, group, |m| m.join(socket));
}

/// Rebuild `joined` from `ifaces`, joining on every one of them.
///
/// "Already a member" counts as joined. Interfaces that vanished are
/// forgotten; the kernel dropped their memberships with them. Failed
/// joins are left out so the next pass tries again.
fn refresh_memberships(
    joined: &mut HashSet<Membership>,
    ifaces: &[Interface],
    group: IpAddr,
    mut join: impl FnMut(&Membership) -> io::Result<()>,
) {
    let mut current = HashSet::with_capacity(ifaces.len());

    for iface in ifaces {
        let Some(membership) = Membership::on(iface, group) else {
            continue;
        };
        match join(&membership) {
            Ok(()) => {
                if !joined.contains(&membership) {
                    tracing::debug!(iface = %iface.name, index = iface.index, group = %group, "joined multicast group");
                }
                current.insert(membership);
            }
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                current.insert(membership);
            }
            Err(e) => tracing::debug!(iface = %iface.name, error = %e, "multicast join failed"),
        }
    }

    for gone in joined.difference(&current) {
        tracing::debug!(membership = ?gone, "multicast membership dropped");
    }
    *joined = current;
}
