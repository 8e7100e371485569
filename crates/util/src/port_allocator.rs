//! Finding free TCP ports for node bindings.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};

/// How many ports to probe before giving up.
const MAX_PROBES: u16 = 1000;

/// Check if a port is available on `ip` by attempting to bind to it
#[must_use]
pub fn is_port_available(ip: IpAddr, port: u16) -> bool {
    TcpListener::bind(SocketAddr::new(ip, port)).is_ok()
}

/// Find the first port at or above `start` that is free on every interface.
///
/// Management ports listen on all interfaces, so the probe binds the
/// unspecified address. Returns `None` if nothing within range is free.
#[must_use]
pub fn next_available_port(start: u16) -> Option<u16> {
    let any = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

    (0..MAX_PROBES)
        .map_while(|offset| start.checked_add(offset))
        .find(|port| is_port_available(any, *port))
}

/// Loopback address for the node with the given 1-based index: `127.0.0.<index>`.
///
/// Linux answers on the whole `127.0.0.0/8` range, which lets every node keep
/// the default storage and client ports.
#[must_use]
pub fn loopback_address(index: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, index))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bound_port_is_not_available() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        assert!(!is_port_available(IpAddr::V4(Ipv4Addr::LOCALHOST), port));
    }

    #[test]
    fn test_next_available_port_skips_taken_port() {
        let listener = TcpListener::bind("0.0.0.0:0").unwrap();
        let taken = listener.local_addr().unwrap().port();

        let port = next_available_port(taken).unwrap();
        assert!(port > taken);
    }

    #[test]
    fn test_loopback_address() {
        assert_eq!(loopback_address(3).to_string(), "127.0.0.3");
    }
}
