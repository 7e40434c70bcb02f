//! The public error taxonomy. This is the richer, `Display`-able
//! counterpart to `utils::error::Result<T, E = ()>`: internal plumbing logs
//! and returns `Err(())`, but anything crossing the `Connection`/`Acceptor`
//! API boundary is reported as one of these kinds instead, matching the
//! minimal, hand-rolled `std::error::Error` style `utils::error` already
//! uses rather than reaching for `thiserror`.

use std::fmt;
use std::io;

#[derive(Debug)]
pub enum Error {
	/// The operation required a bound local endpoint or a valid state.
	InvalidArgument,
	/// Send/receive attempted on a connection that never connected.
	NotConnected,
	/// `connect` called on a connection that is already `established`.
	AlreadyConnected,
	/// `connect`/`accept` called on a connection that is mid-handshake, or
	/// a transmit-queue entry collided with a sequence already in flight.
	AlreadyStarted,
	/// The operation was cancelled by closing or dropping its owner.
	OperationAborted,
	/// The keepalive window elapsed with no inbound traffic.
	Timeout,
	/// The underlying UDP layer reported an error.
	TransportError(io::Error),
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Error::InvalidArgument => write!(f, "invalid argument"),
			Error::NotConnected => write!(f, "not connected"),
			Error::AlreadyConnected => write!(f, "already connected"),
			Error::AlreadyStarted => write!(f, "already started"),
			Error::OperationAborted => write!(f, "operation aborted"),
			Error::Timeout => write!(f, "timed out"),
			Error::TransportError(err) => write!(f, "transport error: {err}"),
		}
	}
}

impl std::error::Error for Error {
	fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
		match self {
			Error::TransportError(err) => Some(err),
			_ => None,
		}
	}
}

impl From<io::Error> for Error {
	fn from(err: io::Error) -> Self {
		Error::TransportError(err)
	}
}

pub type Result<T = ()> = std::result::Result<T, Error>;
