//! The per-peer state machine and user-facing connect/send/receive API
//! grounded on `socket.hpp`. The
//! original's `socket` is a `boost::asio::basic_io_object` whose completions
//! are threaded through `async_result`; here a `Connection` is a plain
//! `Rc`-shared object (built with `Rc::new_cyclic`, the same self-reference
//! idiom `detail::transmit_queue` already uses) and completions are boxed
//! `FnOnce` closures posted onto the owning `IoContext`'s timer wheel —
//! `IoContext::post` plays the role `ios.post(...)` does in the original for
//! both real completions and the synchronous argument-error paths of §7.
//!
//! One deliberate departure from `socket.hpp`: `receive` does not accept a
//! caller-supplied mutable buffer to fill in place — that would need a raw
//! pointer captured across an async boundary with nothing to guarantee its
//! lifetime. Instead a completed receive hands back an owned `Vec<u8>`, the
//! same shape an `mpsc::Receiver` or async `Stream` item takes. See
//! `DESIGN.md`.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr};
use std::rc::{Rc, Weak};
use std::time::Duration;

use log::{debug, trace, warn};
use rand::Rng;

use crate::detail::cumulative::CumulativeSet;
use crate::detail::multiplexer::{ConnectivityState, Multiplexer, Peer};
use crate::detail::sequence::Sequence;
use crate::detail::timer::Timer;
use crate::detail::transmit_queue::{self, TransmitQueue};
use crate::endpoint::{substitute_unspecified, Endpoint};
use crate::error::{Error, Result};
use crate::resolver;
use crate::service::IoContext;

/// Keepalive timeout: 5x the retransmission period. Each established
/// connection arms a timer for this long that resets on any inbound
/// packet; expiry tears the connection down and fails any pending
/// receive with `Error::Timeout`.
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(15);

pub type ConnectCompletion = Box<dyn FnOnce(Result<()>)>;
pub type SendCompletion = Box<dyn FnOnce(Result<usize>)>;
pub type ReceiveCompletion = Box<dyn FnOnce(Result<Vec<u8>>)>;

fn unbound_endpoint() -> Endpoint {
	Endpoint::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
}

/// One CRUX connection endpoint: a client socket before/after `connect`, or
/// an accept-side socket wired in by an `Acceptor`. Always held behind an
/// `Rc`, since the multiplexer keeps a `Weak<dyn Peer>` back-reference into
/// it.
pub struct Connection {
	io: Rc<IoContext>,
	multiplexer: RefCell<Option<Rc<Multiplexer>>>,
	remote: Cell<Endpoint>,
	state: Cell<ConnectivityState>,
	next_sequence: Cell<Sequence>,
	received: RefCell<CumulativeSet>,
	transmit_queue: TransmitQueue<Sequence>,
	connect_completion: RefCell<Option<ConnectCompletion>>,
	receive_requests: RefCell<VecDeque<ReceiveCompletion>>,
	buffered_deliveries: RefCell<VecDeque<Vec<u8>>>,
	keepalive: RefCell<Option<Timer>>,
	keepalive_timeout: Cell<Duration>,
	self_weak: Weak<Connection>,
}

impl Connection {
	/// A connection with no local endpoint bound yet. `connect`/`send` fail
	/// with `Error::InvalidArgument`/`NotConnected` until it is bound — the
	/// Rust counterpart of `socket::socket(io_service&)`, only made usable
	/// later by `bind` or by `Acceptor::accept` wiring in a multiplexer.
	pub fn new(io: &Rc<IoContext>) -> Rc<Self> {
		Rc::new_cyclic(|weak| Connection {
			io: io.clone(),
			multiplexer: RefCell::new(None),
			remote: Cell::new(unbound_endpoint()),
			state: Cell::new(ConnectivityState::Closed),
			next_sequence: Cell::new(Sequence::new(rand::thread_rng().gen())),
			received: RefCell::new(CumulativeSet::new()),
			transmit_queue: TransmitQueue::new(io.wheel()),
			connect_completion: RefCell::new(None),
			receive_requests: RefCell::new(VecDeque::new()),
			buffered_deliveries: RefCell::new(VecDeque::new()),
			keepalive: RefCell::new(None),
			keepalive_timeout: Cell::new(KEEPALIVE_TIMEOUT),
			self_weak: weak.clone(),
		})
	}

	/// A connection bound to `local_endpoint` at construction, matching
	/// `socket::socket(io_service&, const endpoint_type&)`.
	pub fn bind(io: &Rc<IoContext>, local_endpoint: Endpoint) -> Result<Rc<Self>> {
		let multiplexer = io.multiplexer_for(local_endpoint)?;
		let connection = Self::new(io);
		*connection.multiplexer.borrow_mut() = Some(multiplexer);
		Ok(connection)
	}

	/// Override the keepalive window. Useful
	/// for tests and examples that would otherwise wait the full 15 seconds
	/// of §6 (must be set before the connection reaches `established`).
	pub fn set_keepalive_timeout(&self, timeout: Duration) {
		self.keepalive_timeout.set(timeout);
	}

	pub fn local_endpoint(&self) -> Option<Endpoint> {
		self.multiplexer.borrow().as_ref().map(|m| m.local_endpoint())
	}

	pub fn remote_endpoint(&self) -> Endpoint {
		self.remote.get()
	}

	/// Start an asynchronous connect to `remote`. Requires a
	/// bound multiplexer and state `closed`.
	pub fn connect(self: &Rc<Self>, remote: Endpoint, completion: ConnectCompletion) {
		if self.multiplexer.borrow().is_none() {
			self.io.post(move || completion(Err(Error::InvalidArgument)));
			return;
		}

		match self.state() {
			ConnectivityState::Closed => {}
			ConnectivityState::Established => {
				self.io.post(move || completion(Err(Error::AlreadyConnected)));
				return;
			}
			_ => {
				self.io.post(move || completion(Err(Error::AlreadyStarted)));
				return;
			}
		}

		let remote = substitute_unspecified(remote);
		self.remote.set(remote);
		self.state.set(ConnectivityState::Connecting);
		*self.connect_completion.borrow_mut() = Some(completion);

		let multiplexer = self.multiplexer.borrow().clone().expect("checked above");
		let peer: Rc<dyn Peer> = self.clone() as Rc<dyn Peer>;
		multiplexer.add_peer(remote, &peer);

		self.send_retransmitted(remote);
	}

	/// Resolve `host:service` and connect to the first candidate endpoint
	/// (the first candidate wins, remaining candidates are
	/// simply unused — mirroring `resolver.hpp`'s linear endpoint-list
	/// walk, which in practice never gets past the first address for a
	/// connectionless protocol that cannot fail synchronously).
	pub fn connect_host(self: &Rc<Self>, host: &str, service: &str, completion: ConnectCompletion) {
		match resolver::resolve(host, service) {
			Ok(mut endpoints) if !endpoints.is_empty() => self.connect(endpoints.remove(0), completion),
			Ok(_) => self.io.post(move || completion(Err(Error::InvalidArgument))),
			Err(err) => self.io.post(move || completion(Err(err))),
		}
	}

	/// Send `payload` as one DATA packet, retransmitted at a fixed period
	/// until the peer acks it.
	pub fn send(self: &Rc<Self>, payload: Vec<u8>, completion: SendCompletion) {
		let multiplexer = match self.multiplexer.borrow().clone() {
			Some(multiplexer) => multiplexer,
			None => {
				self.io.post(move || completion(Err(Error::NotConnected)));
				return;
			}
		};

		let remote = self.remote.get();
		let sequence = self.next_sequence.get();
		self.next_sequence.set(sequence.next());
		let ack = self.received.borrow().front().map(|(seq, _)| seq);
		let size = payload.len();

		let step: transmit_queue::Step = Box::new(move |step_completion| match multiplexer.send_data(remote, sequence, ack, 0, &payload) {
			Ok(sent) => step_completion(Ok(()), sent),
			Err(err) => step_completion(Err(err), 0),
		});

		let handler: transmit_queue::Handler = Box::new(move |result, _bytes| match result {
			Ok(()) => completion(Ok(size)),
			Err(err) => completion(Err(err)),
		});

		self.transmit_queue.push(sequence, size, step, handler);
	}

	/// Receive the next message: completes immediately from a
	/// buffered delivery if one is already waiting, otherwise queues the
	/// request until `process_data` delivers one.
	pub fn receive(self: &Rc<Self>, completion: ReceiveCompletion) {
		if self.multiplexer.borrow().is_none() {
			self.io.post(move || completion(Err(Error::NotConnected)));
			return;
		}

		if let Some(payload) = self.buffered_deliveries.borrow_mut().pop_front() {
			self.io.post(move || completion(Ok(payload)));
		} else {
			self.receive_requests.borrow_mut().push_back(completion);
		}
	}

	/// Tear the connection down: unregister from the multiplexer, cancel
	/// any pending transmit-queue entries and the keepalive timer, and
	/// complete every pending receive with `Error::OperationAborted`
	/// A no-op if already closed.
	pub fn close(&self) {
		self.teardown(|| Error::OperationAborted);
	}

	pub fn state(&self) -> ConnectivityState {
		self.state.get()
	}

	/// Send the retransmitted HANDSHAKE leg (initial connect, or a
	/// listener's reply) and track it in the transmit queue until the peer's
	/// ack clears it. The handshake-completing KEEPALIVE leg is sent as a
	/// one-shot instead (see `process_handshake`'s `Connecting` arm) since
	/// nothing ever acks it by sequence.
	fn send_retransmitted(self: &Rc<Self>, remote: Endpoint) {
		let multiplexer = self.multiplexer.borrow().clone().expect("bound before any retransmitted send is queued");
		let sequence = self.next_sequence.get();
		self.next_sequence.set(sequence.next());
		let ack = self.received.borrow().front().map(|(seq, _)| seq);
		let weak = self.self_weak.clone();

		let step: transmit_queue::Step = Box::new(move |completion| {
			match multiplexer.send_handshake(remote, sequence, ack, 0) {
				Ok(sent) => completion(Ok(()), sent),
				Err(err) => completion(Err(err), 0),
			}
		});

		let handler: transmit_queue::Handler = Box::new(move |result, _bytes| {
			if let Err(err) = result {
				if let Some(connection) = weak.upgrade() {
					connection.fail_connect(err);
				}
			}
		});

		self.transmit_queue.push(sequence, 0, step, handler);
	}

	fn fail_connect(&self, err: Error) {
		self.state.set(ConnectivityState::Closed);
		if let Some(multiplexer) = self.multiplexer.borrow_mut().take() {
			multiplexer.remove_peer(&self.remote.get());
		}
		self.transmit_queue.cancel_all();
		if let Some(completion) = self.connect_completion.borrow_mut().take() {
			self.io.post(move || completion(Err(err)));
		}
	}

	fn teardown(&self, make_error: impl Fn() -> Error) {
		if let Some(multiplexer) = self.multiplexer.borrow_mut().take() {
			multiplexer.remove_peer(&self.remote.get());
		}
		self.state.set(ConnectivityState::Closed);
		self.transmit_queue.cancel_all();
		self.keepalive.borrow_mut().take();

		if let Some(completion) = self.connect_completion.borrow_mut().take() {
			let err = make_error();
			self.io.post(move || completion(Err(err)));
		}

		let pending: Vec<ReceiveCompletion> = self.receive_requests.borrow_mut().drain(..).collect();
		for completion in pending {
			let err = make_error();
			self.io.post(move || completion(Err(err)));
		}
	}

	fn is_expected(&self, sequence: Sequence) -> bool {
		match self.received.borrow().front() {
			None => true,
			Some((last, _)) => last.next() == sequence,
		}
	}

	fn deliver(&self, payload: Vec<u8>) {
		if let Some(completion) = self.receive_requests.borrow_mut().pop_front() {
			self.io.post(move || completion(Ok(payload)));
		} else {
			self.buffered_deliveries.borrow_mut().push_back(payload);
		}
	}

	fn reset_keepalive(&self) {
		if let Some(timer) = self.keepalive.borrow().as_ref() {
			timer.start();
		}
	}

	fn arm_keepalive(&self) {
		let timer = Timer::new(self.io.wheel());
		timer.set_period(self.keepalive_timeout.get());

		let weak = self.self_weak.clone();
		timer.set_handler(move || {
			if let Some(connection) = weak.upgrade() {
				warn!("keepalive timeout against {}, tearing down", connection.remote.get());
				connection.teardown(|| Error::Timeout);
			}
		});
		timer.start();

		*self.keepalive.borrow_mut() = Some(timer);
	}

	/// Wired in by `Acceptor::accept`: transitions `closed` → `listening`
	/// and binds the multiplexer the acceptor is already bound to.
	pub(crate) fn begin_listening(&self, multiplexer: Rc<Multiplexer>) -> Result<()> {
		if self.state() != ConnectivityState::Closed {
			return Err(Error::AlreadyStarted);
		}

		*self.multiplexer.borrow_mut() = Some(multiplexer);
		self.state.set(ConnectivityState::Listening);
		Ok(())
	}
}

impl Peer for Connection {
	fn process_handshake(&self, initial: Sequence, remote: Endpoint) {
		self.received.borrow_mut().insert(initial);
		self.reset_keepalive();

		match self.state() {
			ConnectivityState::Listening => {
				self.remote.set(remote);
				self.state.set(ConnectivityState::Handshaking);
				if let Some(connection) = self.self_weak.upgrade() {
					connection.send_retransmitted(remote);
				}
			}
			ConnectivityState::Connecting => {
				self.remote.set(remote);
				self.state.set(ConnectivityState::Handshaking);
				if let Some(multiplexer) = self.multiplexer.borrow().clone() {
					let sequence = self.next_sequence.get();
					self.next_sequence.set(sequence.next());
					let ack = self.received.borrow().front().map(|(seq, _)| seq);
					// A one-shot send, not tracked by the transmit queue:
					// process_keepalive never answers a plain KEEPALIVE with an
					// ack of its own, so a tracked entry here would sit unacked
					// at the front of the queue forever and head-of-line-block
					// every later send. Losing this one is recoverable the same
					// way process_data's keepalive-ack is: any later send carries
					// a fresh ack past this point.
					let _ = multiplexer.send_keepalive(remote, sequence, ack, 0);
				}
			}
			state => {
				// Established/handshaking/closed: an illegal or repeated
				// handshake. The original asserts; production drops it
				// silently.
				debug!("dropping handshake from {remote} while in {state:?}");
			}
		}
	}

	fn process_keepalive(&self, sequence: Sequence) {
		if self.is_expected(sequence) {
			self.received.borrow_mut().insert(sequence);
		}
		self.reset_keepalive();
	}

	fn process_acknowledgement(&self, ack: Sequence) {
		self.transmit_queue.apply_ack(ack);
		self.reset_keepalive();

		if self.state() == ConnectivityState::Handshaking {
			self.state.set(ConnectivityState::Established);
			self.arm_keepalive();

			if let Some(completion) = self.connect_completion.borrow_mut().take() {
				self.io.post(move || completion(Ok(())));
			}
		}
	}

	fn process_data(&self, payload: Vec<u8>, sequence: Sequence) {
		if !self.is_expected(sequence) {
			// Conservative reordering policy:
			// anything but the immediate successor is silently dropped.
			trace!("dropping out-of-order data packet (sequence {sequence:?}) from {}", self.remote.get());
			return;
		}

		self.received.borrow_mut().insert(sequence);
		self.reset_keepalive();
		self.deliver(payload);

		if let Some(multiplexer) = self.multiplexer.borrow().clone() {
			let remote = self.remote.get();
			let sequence = self.next_sequence.get();
			self.next_sequence.set(sequence.next());
			let ack = self.received.borrow().front().map(|(seq, _)| seq);
			// A one-shot notification, not tracked by the transmit queue:
			// losing it is harmless, since the peer's own retransmissions
			// will eventually carry a fresh ack past this point.
			let _ = multiplexer.send_keepalive(remote, sequence, ack, 0);
		}
	}

	fn state(&self) -> ConnectivityState {
		self.state.get()
	}
}

impl Drop for Connection {
	fn drop(&mut self) {
		self.teardown(|| Error::OperationAborted);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::cell::Cell as StdCell;
	use std::time::Duration;

	fn io() -> Rc<IoContext> {
		IoContext::new()
	}

	#[test]
	fn unbound_connect_reports_invalid_argument() {
		let io = io();
		let connection = Connection::new(&io);
		let result = Rc::new(RefCell::new(None));
		let result_clone = result.clone();

		connection.connect("127.0.0.1:1".parse().unwrap(), Box::new(move |r| *result_clone.borrow_mut() = Some(r)));
		assert!(result.borrow().is_none(), "must not complete synchronously");

		io.poll_once(Duration::from_millis(1));
		assert!(matches!(result.borrow().as_ref().unwrap(), Err(Error::InvalidArgument)));
	}

	#[test]
	fn full_handshake_reaches_established_on_both_sides_and_exchanges_data() {
		let client_io = io();
		let server_io = io();

		let server = Connection::new(&server_io);
		let multiplexer = server_io.multiplexer_for("127.0.0.1:0".parse().unwrap()).unwrap();
		server.begin_listening(multiplexer.clone()).unwrap();

		let accepted = Rc::new(StdCell::new(false));
		let accepted_clone = accepted.clone();
		let peer = server.clone() as Rc<dyn Peer>;
		multiplexer.queue_accept(peer, Rc::new(Cell::new(false)), Box::new(move |r| accepted_clone.set(r.is_ok())));

		let client = Connection::bind(&client_io, "127.0.0.1:0".parse().unwrap()).unwrap();

		let client_connected = Rc::new(StdCell::new(false));
		let client_connected_clone = client_connected.clone();
		client.connect(server.local_endpoint().unwrap(), Box::new(move |r| client_connected_clone.set(r.is_ok())));

		let deadline = std::time::Instant::now() + Duration::from_secs(5);
		while std::time::Instant::now() < deadline && (!client_connected.get() || server.state() != ConnectivityState::Established) {
			client_io.poll_once(Duration::from_millis(10));
			server_io.poll_once(Duration::from_millis(10));
		}

		assert!(client_connected.get());
		assert!(accepted.get());
		assert_eq!(server.state(), ConnectivityState::Established);
		assert_eq!(client.state(), ConnectivityState::Established);

		let received = Rc::new(RefCell::new(None));
		let received_clone = received.clone();
		server.receive(Box::new(move |r| *received_clone.borrow_mut() = Some(r)));

		let sent = Rc::new(StdCell::new(false));
		let sent_clone = sent.clone();
		client.send(b"TEST_MESSAGE".to_vec(), Box::new(move |r| sent_clone.set(r.is_ok())));

		let deadline = std::time::Instant::now() + Duration::from_secs(5);
		while std::time::Instant::now() < deadline && received.borrow().is_none() {
			client_io.poll_once(Duration::from_millis(10));
			server_io.poll_once(Duration::from_millis(10));
		}

		let payload = received.borrow_mut().take().unwrap().unwrap();
		assert_eq!(payload, b"TEST_MESSAGE");
	}
}
