//! The listening side of CRUX, grounded on
//! `acceptor.hpp`. The original binds a multiplexer at construction and
//! wires each accepted `socket` onto it one `async_accept` at a time; here
//! an `Acceptor` tracks every connection handed to `accept` so `close` can
//! cancel all of them, something `acceptor.hpp` has no equivalent for (it
//! only ever cancels the single outstanding accept a caller happens to be
//! holding).

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use log::debug;

use crate::connection::Connection;
use crate::detail::multiplexer::{AcceptToken, Multiplexer};
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::service::IoContext;

/// A listening endpoint shared by every connection `accept` wires onto it.
/// Mirrors `acceptor` 1:1, plus the bookkeeping needed to cancel its own
/// outstanding accepts on `close`.
pub struct Acceptor {
	io: Rc<IoContext>,
	multiplexer: Rc<Multiplexer>,
	outstanding: RefCell<Vec<(Weak<Connection>, AcceptToken)>>,
}

impl Acceptor {
	/// Bind (or reuse) the multiplexer at `local_endpoint` (acceptors and
	/// connections sharing a local endpoint share one multiplexer).
	pub fn new(io: &Rc<IoContext>, local_endpoint: Endpoint) -> Result<Rc<Self>> {
		let multiplexer = io.multiplexer_for(local_endpoint)?;
		Ok(Rc::new(Self { io: io.clone(), multiplexer, outstanding: RefCell::new(Vec::new()) }))
	}

	pub fn local_endpoint(&self) -> Endpoint {
		self.multiplexer.local_endpoint()
	}

	/// Wire `target` onto this acceptor's multiplexer and queue it to
	/// receive the next unmatched handshake. `target` must be freshly
	/// constructed (state `closed`); `completion` fires once it reaches
	/// `established`, or with `Error::OperationAborted` if `close` cancels
	/// it first.
	pub fn accept(self: &Rc<Self>, target: &Rc<Connection>, completion: Box<dyn FnOnce(Result<()>)>) {
		if let Err(err) = target.begin_listening(self.multiplexer.clone()) {
			self.io.post(move || completion(Err(err)));
			return;
		}

		let token: AcceptToken = Rc::new(std::cell::Cell::new(false));
		self.outstanding.borrow_mut().push((Rc::downgrade(target), token.clone()));

		let peer = target.clone() as Rc<dyn crate::detail::multiplexer::Peer>;
		self.multiplexer.queue_accept(peer, token, completion);
	}

	/// Cancel every accept this acceptor has queued or matched, and close
	/// each still-alive target connection.
	pub fn close(&self) {
		let entries = std::mem::take(&mut *self.outstanding.borrow_mut());
		debug!("closing acceptor on {}, cancelling {} outstanding accept(s)", self.local_endpoint(), entries.len());
		for (weak, token) in entries {
			self.multiplexer.cancel_accepts(&token);
			if let Some(connection) = weak.upgrade() {
				connection.close();
			}
		}
	}
}

impl Drop for Acceptor {
	fn drop(&mut self) {
		self.close();
	}
}
