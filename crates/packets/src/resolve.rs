//! Local-address checks and capture device selection.

use if_addrs::get_if_addrs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use tracing::debug;

/// True when `addr` is loopback or assigned to one of this host's
/// interfaces.
pub fn is_local(addr: Ipv4Addr) -> bool {
    if addr.is_loopback() {
        return true;
    }
    match get_if_addrs() {
        Ok(interfaces) => interfaces.iter().any(|iface| iface.ip() == IpAddr::V4(addr)),
        Err(err) => {
            debug!("interface enumeration failed: {err}");
            false
        }
    }
}

/// The local IPv4 address the OS would source packets to `dest` from.
/// Connecting a UDP socket runs the route lookup without sending
/// anything.
pub fn route_source_addr(dest: Ipv4Addr) -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], 0))).ok()?;
    socket.connect(SocketAddr::from((dest, 80))).ok()?;
    match socket.local_addr().ok()? {
        SocketAddr::V4(addr) => Some(*addr.ip()),
        SocketAddr::V6(_) => None,
    }
}

/// Picks the capture device for probes toward `dest`.
///
/// An explicit `hint` matches by name substring and wins outright. After
/// that: a loopback device for local destinations, the interface owning
/// the route source address, the first non-loopback device, any device.
pub fn pick_capture_device(dest: Option<Ipv4Addr>, hint: Option<&str>) -> Option<String> {
    let interfaces = match get_if_addrs() {
        Ok(interfaces) => interfaces,
        Err(err) => {
            debug!("interface enumeration failed: {err}");
            return None;
        }
    };
    if let Some(hint) = hint {
        return interfaces
            .iter()
            .find(|iface| iface.name.contains(hint))
            .map(|iface| iface.name.clone());
    }
    if let Some(dest) = dest {
        if is_local(dest) {
            if let Some(device) = interfaces.iter().find(|iface| iface.is_loopback()) {
                return Some(device.name.clone());
            }
        }
        if let Some(source) = route_source_addr(dest) {
            if let Some(device) = interfaces
                .iter()
                .find(|iface| iface.ip() == IpAddr::V4(source))
            {
                return Some(device.name.clone());
            }
        }
    }
    interfaces
        .iter()
        .find(|iface| !iface.is_loopback())
        .or_else(|| interfaces.first())
        .map(|iface| iface.name.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_is_local() {
        assert!(is_local(Ipv4Addr::new(127, 0, 0, 1)));
        assert!(is_local(Ipv4Addr::new(127, 1, 2, 3)));
    }

    #[test]
    fn documentation_address_is_not_local() {
        // TEST-NET-3, never assigned to a real interface.
        assert!(!is_local(Ipv4Addr::new(203, 0, 113, 1)));
    }

    #[test]
    fn unmatched_hint_yields_no_device() {
        assert_eq!(
            pick_capture_device(None, Some("no-such-interface-zz")),
            None
        );
    }

    #[test]
    fn local_destination_prefers_loopback() {
        let Some(device) = pick_capture_device(Some(Ipv4Addr::new(127, 0, 0, 1)), None) else {
            return;
        };
        let interfaces = get_if_addrs().unwrap();
        let picked = interfaces.iter().find(|iface| iface.name == device).unwrap();
        if interfaces.iter().any(|iface| iface.is_loopback()) {
            assert!(picked.is_loopback());
        }
    }
}
