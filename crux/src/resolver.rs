//! Host/service name resolution, backing `Connection::connect_host`.
//! Grounded in `resolver.hpp`, which is itself a
//! thin wrapper over `boost::asio::ip::udp::resolver` — here the standard
//! library's `ToSocketAddrs` plays the same role.

use std::net::ToSocketAddrs;

use crate::endpoint::Endpoint;
use crate::error::{Error, Result};

/// Resolve `host:service` to the list of candidate endpoints a connect
/// attempt should try in order (first candidate that
/// passes synchronous validation wins; the rest are left unused).
///
/// `std::net::ToSocketAddrs` only resolves a service given as a numeric
/// port, not a `/etc/services` name the way `boost::asio`'s resolver does;
/// CRUX has no services database, so `service` must already be a port
/// number.
pub fn resolve(host: &str, service: &str) -> Result<Vec<Endpoint>> {
	let port: u16 = service.parse().map_err(|_| Error::InvalidArgument)?;
	(host, port).to_socket_addrs().map(|it| it.collect()).map_err(|_| Error::InvalidArgument)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn resolves_localhost() {
		let endpoints = resolve("localhost", "0").expect("localhost should resolve");
		assert!(!endpoints.is_empty());
	}
}
