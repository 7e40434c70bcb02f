//! The remote/local address type CRUX runs over. The teacher's `net` crate
//! builds its own `SocketAddr`; CRUX has no need for a custom IP stack, so
//! this is a thin wrapper around the standard library's.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

pub type Endpoint = SocketAddr;

/// Substitute an unspecified address (`0.0.0.0` / `::`) with the
/// corresponding loopback address, as `Connection::connect` requires.
pub fn substitute_unspecified(endpoint: Endpoint) -> Endpoint {
	let addr = match endpoint.ip() {
		IpAddr::V4(v4) if v4.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
		IpAddr::V6(v6) if v6.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
		other => other,
	};

	SocketAddr::new(addr, endpoint.port())
}
