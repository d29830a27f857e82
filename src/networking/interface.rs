use if_addrs::{get_if_addrs, IfAddr};
use local_ip_address::local_ip;
use log::{debug, warn};
use std::net::{IpAddr, Ipv4Addr, UdpSocket};

use super::error::DiscoveryError;

/// Address used only to pick a route; nothing is sent to it
const ROUTE_ANCHOR: &str = "8.8.8.8:80";

/// An IPv4 interface the discovery listener can join the group on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MulticastInterface {
    pub name: String,
    pub ip: Ipv4Addr,
}

/// List usable non-loopback IPv4 interfaces, one entry per interface name
pub fn multicast_interfaces() -> Result<Vec<MulticastInterface>, DiscoveryError> {
    let mut interfaces: Vec<MulticastInterface> = Vec::new();

    for iface in get_if_addrs()? {
        if iface.is_loopback() {
            continue;
        }
        let ip = match iface.addr {
            IfAddr::V4(ref addr) => addr.ip,
            IfAddr::V6(_) => continue,
        };
        if ip.is_unspecified() || ip.is_multicast() {
            continue;
        }
        if interfaces.iter().any(|known| known.name == iface.name) {
            continue;
        }

        debug!("Candidate multicast interface: {} ({})", iface.name, ip);
        interfaces.push(MulticastInterface {
            name: iface.name.clone(),
            ip,
        });
    }

    if interfaces.is_empty() {
        warn!("No usable network interfaces found!");
    }

    Ok(interfaces)
}

/// Determine the local address the OS would use for outbound traffic.
///
/// Associates a throwaway UDP socket with a public anchor and reads back the
/// local endpoint. Falls back to asking the OS for its primary address; if
/// both fail the caller should use loopback.
pub fn outbound_address() -> Result<IpAddr, DiscoveryError> {
    match route_probe() {
        Ok(ip) => return Ok(ip),
        Err(e) => debug!("Route probe failed: {}", e),
    }

    match local_ip() {
        Ok(ip) if !ip.is_loopback() && !ip.is_unspecified() => Ok(ip),
        Ok(ip) => Err(DiscoveryError::AddressResolution(format!(
            "only found unusable address {}",
            ip
        ))),
        Err(err) => Err(DiscoveryError::AddressResolution(err.to_string())),
    }
}

/// `outbound_address`, falling back to loopback when no address can be found
pub fn outbound_address_or_loopback() -> IpAddr {
    or_loopback(outbound_address())
}

fn or_loopback(resolved: Result<IpAddr, DiscoveryError>) -> IpAddr {
    resolved.unwrap_or_else(|e| {
        warn!("Could not determine local address ({}), using loopback", e);
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    })
}

fn route_probe() -> std::io::Result<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.connect(ROUTE_ANCHOR)?;
    let ip = socket.local_addr()?.ip();
    if ip.is_unspecified() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            "no route to anchor",
        ));
    }
    Ok(ip)
}
