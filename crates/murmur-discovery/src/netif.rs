//! Local network interface enumeration for multicast.

use std::net::{Ipv4Addr, SocketAddrV4};

use anyhow::{Context, Result};
use nix::ifaddrs::getifaddrs;
use nix::net::if_::{if_nametoindex, InterfaceFlags};

/// One interface that is up and multicast-capable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub name: String,
    /// OS interface index, as used by IPv6 multicast calls.
    pub index: u32,
    pub ipv4: Vec<Ipv4Addr>,
    pub has_ipv6: bool,
}

impl Interface {
    /// First IPv4 address, used to select the interface for IPv4 multicast.
    pub fn primary_v4(&self) -> Option<Ipv4Addr> {
        self.ipv4.first().copied()
    }
}

/// Every interface that is up and multicast-capable, in OS order.
pub fn multicast_interfaces() -> Result<Vec<Interface>> {
    let wanted = InterfaceFlags::IFF_UP | InterfaceFlags::IFF_MULTICAST;
    let mut out: Vec<Interface> = Vec::new();

    for ifaddr in getifaddrs().context("getifaddrs")? {
        if !ifaddr.flags.contains(wanted) {
            continue;
        }

        let pos = match out.iter().position(|i| i.name == ifaddr.interface_name) {
            Some(pos) => pos,
            None => {
                let index = match if_nametoindex(ifaddr.interface_name.as_str()) {
                    Ok(index) => index,
                    Err(e) => {
                        tracing::debug!(iface = %ifaddr.interface_name, error = %e, "no interface index");
                        continue;
                    }
                };
                out.push(Interface {
                    name: ifaddr.interface_name.clone(),
                    index,
                    ipv4: Vec::new(),
                    has_ipv6: false,
                });
                out.len() - 1
            }
        };

        let Some(addr) = ifaddr.address else { continue };
        if let Some(sin) = addr.as_sockaddr_in() {
            out[pos].ipv4.push(*SocketAddrV4::from(*sin).ip());
        } else if addr.as_sockaddr_in6().is_some() {
            out[pos].has_ipv6 = true;
        }
    }

    Ok(out)
}

/// First non-loopback IPv4 address on any interface that is up.
pub fn first_external_v4() -> Option<Ipv4Addr> {
    let ifaddrs = getifaddrs().ok()?;
    for ifaddr in ifaddrs {
        if !ifaddr.flags.contains(InterfaceFlags::IFF_UP)
            || ifaddr.flags.contains(InterfaceFlags::IFF_LOOPBACK)
        {
            continue;
        }
        if let Some(sin) = ifaddr.address.as_ref().and_then(|a| a.as_sockaddr_in()) {
            let ip = *SocketAddrV4::from(*sin).ip();
            if !ip.is_loopback() {
                return Some(ip);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enumerated_interfaces_are_unique_and_indexed() {
        let ifaces = multicast_interfaces().unwrap();
        for (i, iface) in ifaces.iter().enumerate() {
            assert!(iface.index > 0);
            assert!(ifaces[i + 1..].iter().all(|o| o.name != iface.name));
        }
    }
}
