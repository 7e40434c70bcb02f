//! CRUX: a connection-oriented, message-based transport layered over UDP
//! grounded on `maidsafe::crux`. Three public types cover the
//! whole surface: [`service::IoContext`] is the per-thread driver (the
//! in-process stand-in for an `io_service` plus the original's process-wide
//! service record, see `service` module docs), [`connection::Connection`]
//! is a client or accepted socket, and [`acceptor::Acceptor`] listens for
//! inbound handshakes.
//!
//! Everything under `detail` is wire format and internal state-machine
//! plumbing; none of it is meant to be used directly by callers.

pub mod acceptor;
pub mod connection;
pub mod detail;
pub mod endpoint;
pub mod error;
pub mod resolver;
pub mod service;

pub use acceptor::Acceptor;
pub use connection::Connection;
pub use endpoint::Endpoint;
pub use error::{Error, Result};
pub use service::IoContext;
