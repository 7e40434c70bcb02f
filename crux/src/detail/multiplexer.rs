//! One UDP socket shared by every connection bound to the same local
//! endpoint, grounded on `detail/multiplexer.hpp`. The original demultiplexes
//! with `async_receive_from(..., message_peek)` followed by an
//! `io_control(bytes_readable)` to size the real read; the stable
//! `UdpSocket::peek_from` gives us both the remote address and (via its
//! return value into a max-size scratch buffer) the exact datagram size in
//! one call, so there's no need for a raw `ioctl`.
//!
//! `establish_connection`'s accept path in the original only ever reaches
//! `handshaking`, never completing the accept future — a gap the class's own
//! FIXME comments call out. Here, completion is driven off every dispatched
//! packet: whichever peer a just-accepted remote endpoint resolves to gets
//! checked for `Established` after each packet, and the parked accept
//! completion fires the moment it gets there.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::net::UdpSocket;
use std::rc::{Rc, Weak};
use std::time::Duration;

use log::{debug, trace, warn};

use crate::detail::header::{AckPresence, Header, Kind};
use crate::detail::sequence::Sequence;
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};

/// Largest possible UDP payload (the max IPv4/IPv6 datagram body); used only
/// to size the scratch buffer `peek_from` reads into.
const MAX_DATAGRAM: usize = 65_536;

/// Connectivity states shared by client and accept-side connections (spec
/// §4.6/§4.7), grounded on `socket_base::connectivity`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ConnectivityState {
	Closed,
	Listening,
	Connecting,
	Handshaking,
	Established,
}

/// What a multiplexer dispatches decoded packets to. Implemented by
/// `crux::connection::Connection`; kept as a trait so the multiplexer
/// doesn't need to know about connections' retransmission or receive-queue
/// machinery.
pub trait Peer {
	fn process_handshake(&self, initial: Sequence, remote: Endpoint);
	fn process_keepalive(&self, sequence: Sequence);
	fn process_acknowledgement(&self, ack: Sequence);
	fn process_data(&self, payload: Vec<u8>, sequence: Sequence);
	fn state(&self) -> ConnectivityState;
}

pub type AcceptCompletion = Box<dyn FnOnce(Result<()>)>;

/// Shared between an `Acceptor` and every accept-queue/pending-accept entry
/// it pushed into a multiplexer, so `Acceptor::close` can cancel exactly its
/// own outstanding accepts without touching another acceptor's.
pub type AcceptToken = Rc<Cell<bool>>;

pub struct Multiplexer {
	socket: UdpSocket,
	local_endpoint: Endpoint,
	peers: RefCell<HashMap<Endpoint, Weak<dyn Peer>>>,
	accept_queue: RefCell<VecDeque<(Rc<dyn Peer>, AcceptToken, AcceptCompletion)>>,
	pending_accepts: RefCell<HashMap<Endpoint, (AcceptToken, AcceptCompletion)>>,
}

impl Multiplexer {
	pub fn bind(local_endpoint: Endpoint) -> Result<Rc<Self>> {
		let socket = UdpSocket::bind(local_endpoint)?;
		let local_endpoint = socket.local_endpoint_or(local_endpoint)?;

		Ok(Rc::new(Self {
			socket,
			local_endpoint,
			peers: RefCell::new(HashMap::new()),
			accept_queue: RefCell::new(VecDeque::new()),
			pending_accepts: RefCell::new(HashMap::new()),
		}))
	}

	pub fn local_endpoint(&self) -> Endpoint {
		self.local_endpoint
	}

	pub fn add_peer(&self, remote: Endpoint, peer: &Rc<dyn Peer>) {
		self.peers.borrow_mut().insert(remote, Rc::downgrade(peer));
	}

	pub fn remove_peer(&self, remote: &Endpoint) {
		self.peers.borrow_mut().remove(remote);
	}

	pub fn queue_accept(&self, peer: Rc<dyn Peer>, token: AcceptToken, completion: AcceptCompletion) {
		self.accept_queue.borrow_mut().push_back((peer, token, completion));
	}

	/// Cancel every queued or in-flight accept entry carrying `token`,
	/// firing each completion with `OperationAborted`.
	pub fn cancel_accepts(&self, token: &AcceptToken) {
		token.set(true);

		let mut queue = self.accept_queue.borrow_mut();
		let mut remaining = VecDeque::new();
		let mut cancelled = Vec::new();
		for entry in queue.drain(..) {
			if Rc::ptr_eq(&entry.1, token) {
				cancelled.push(entry.2);
			} else {
				remaining.push_back(entry);
			}
		}
		*queue = remaining;
		drop(queue);

		for completion in cancelled {
			completion(Err(Error::OperationAborted));
		}

		let matches: Vec<Endpoint> = self.pending_accepts.borrow().iter().filter(|(_, (t, _))| Rc::ptr_eq(t, token)).map(|(remote, _)| *remote).collect();
		for remote in matches {
			if let Some((_, completion)) = self.pending_accepts.borrow_mut().remove(&remote) {
				self.peers.borrow_mut().remove(&remote);
				completion(Err(Error::OperationAborted));
			}
		}
	}

	pub fn send_handshake(&self, remote: Endpoint, sequence: Sequence, ack: Option<Sequence>, retransmission_count: u8) -> Result<usize> {
		self.send(remote, Kind::Handshake, sequence, ack, retransmission_count, &[])
	}

	pub fn send_keepalive(&self, remote: Endpoint, sequence: Sequence, ack: Option<Sequence>, retransmission_count: u8) -> Result<usize> {
		self.send(remote, Kind::Keepalive, sequence, ack, retransmission_count, &[])
	}

	pub fn send_data(&self, remote: Endpoint, sequence: Sequence, ack: Option<Sequence>, retransmission_count: u8, payload: &[u8]) -> Result<usize> {
		self.send(remote, Kind::Data, sequence, ack, retransmission_count, payload)
	}

	fn send(&self, remote: Endpoint, kind: Kind, sequence: Sequence, ack: Option<Sequence>, retransmission_count: u8, payload: &[u8]) -> Result<usize> {
		let header = Header {
			kind,
			retransmission_count,
			ack_presence: if ack.is_some() { AckPresence::Cumulative } else { AckPresence::None },
			secondary: crate::detail::header::VERSION,
			sequence: sequence.value(),
			ack_sequence: ack.unwrap_or(Sequence::new(0)).value(),
		};

		let mut datagram = Vec::with_capacity(crate::detail::header::SIZE + payload.len());
		datagram.extend_from_slice(&header.encode());
		datagram.extend_from_slice(payload);

		let sent = self.socket.send_to(&datagram, remote)?;
		Ok(sent.saturating_sub(crate::detail::header::SIZE))
	}

	/// Block for up to `timeout` waiting for one datagram; dispatch it if one
	/// arrives. Returns `Ok(true)` if a datagram was processed, `Ok(false)`
	/// on timeout.
	pub fn poll_once(&self, timeout: Duration) -> Result<bool> {
		self.socket.set_read_timeout(Some(timeout))?;

		let mut scratch = vec![0u8; MAX_DATAGRAM];
		let (size, remote) = match self.socket.peek_from(&mut scratch) {
			Ok(result) => result,
			Err(err) if matches!(err.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => return Ok(false),
			Err(err) => return Err(err.into()),
		};

		if size < crate::detail::header::SIZE {
			// Corrupted packet; consume and drop it.
			warn!("dropping {size}-byte datagram from {remote}, shorter than the header");
			let _ = self.socket.recv_from(&mut scratch);
			return Ok(false);
		}

		let (_, _) = self.socket.recv_from(&mut scratch[..size])?;
		self.dispatch(&scratch[..size], remote);

		Ok(true)
	}

	fn dispatch(&self, datagram: &[u8], remote: Endpoint) {
		let Ok(header) = Header::decode(datagram) else {
			warn!("dropping datagram from {remote} with an unrecognized header");
			return;
		};
		let payload = &datagram[crate::detail::header::SIZE..];

		let known = self.peers.borrow().get(&remote).and_then(Weak::upgrade);
		let peer = match known {
			Some(peer) => peer,
			None => {
				if !matches!(header.kind, Kind::Handshake | Kind::Keepalive) {
					trace!("dropping {:?} from unknown peer {remote}", header.kind);
					return;
				}
				match self.accept_next(remote) {
					Some(peer) => peer,
					None => {
						debug!("no pending accept for handshake from {remote}");
						return;
					}
				}
			}
		};

		match header.kind {
			Kind::Handshake => {
				peer.process_handshake(Sequence::new(header.sequence), remote);
				if header.ack_presence == AckPresence::Cumulative {
					peer.process_acknowledgement(Sequence::new(header.ack_sequence));
				}
			}
			Kind::Keepalive => {
				peer.process_keepalive(Sequence::new(header.sequence));
				if header.ack_presence == AckPresence::Cumulative {
					peer.process_acknowledgement(Sequence::new(header.ack_sequence));
				}
			}
			Kind::Data => {
				peer.process_data(payload.to_vec(), Sequence::new(header.sequence));
				if header.ack_presence == AckPresence::Cumulative {
					peer.process_acknowledgement(Sequence::new(header.ack_sequence));
				}
			}
			Kind::Shutdown => {}
		}

		self.settle_pending_accept(remote, &peer);
	}

	fn accept_next(&self, remote: Endpoint) -> Option<Rc<dyn Peer>> {
		loop {
			let (peer, token, completion) = self.accept_queue.borrow_mut().pop_front()?;
			if token.get() {
				completion(Err(Error::OperationAborted));
				continue;
			}
			self.peers.borrow_mut().insert(remote, Rc::downgrade(&peer));
			self.pending_accepts.borrow_mut().insert(remote, (token, completion));
			return Some(peer);
		}
	}

	fn settle_pending_accept(&self, remote: Endpoint, peer: &Rc<dyn Peer>) {
		if peer.state() != ConnectivityState::Established {
			return;
		}
		if let Some((_, completion)) = self.pending_accepts.borrow_mut().remove(&remote) {
			debug!("accept from {remote} reached established");
			completion(Ok(()));
		}
	}
}

trait BindExt {
	fn local_endpoint_or(&self, requested: Endpoint) -> Result<Endpoint>;
}

impl BindExt for UdpSocket {
	fn local_endpoint_or(&self, requested: Endpoint) -> Result<Endpoint> {
		self.local_addr().map_err(Error::from).or(Ok(requested))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::cell::Cell;

	struct RecordingPeer {
		handshakes: RefCell<Vec<(Sequence, Endpoint)>>,
		acks: RefCell<Vec<Sequence>>,
		data: RefCell<Vec<(Vec<u8>, Sequence)>>,
		state: Cell<ConnectivityState>,
	}

	impl RecordingPeer {
		fn new(state: ConnectivityState) -> Rc<Self> {
			Rc::new(Self { handshakes: RefCell::new(Vec::new()), acks: RefCell::new(Vec::new()), data: RefCell::new(Vec::new()), state: Cell::new(state) })
		}
	}

	impl Peer for RecordingPeer {
		fn process_handshake(&self, initial: Sequence, remote: Endpoint) {
			self.handshakes.borrow_mut().push((initial, remote));
		}
		fn process_keepalive(&self, _sequence: Sequence) {}
		fn process_acknowledgement(&self, ack: Sequence) {
			self.acks.borrow_mut().push(ack);
		}
		fn process_data(&self, payload: Vec<u8>, sequence: Sequence) {
			self.data.borrow_mut().push((payload, sequence));
		}
		fn state(&self) -> ConnectivityState {
			self.state.get()
		}
	}

	#[test]
	fn handshake_and_data_round_trip_between_two_multiplexers() {
		let a = Multiplexer::bind("127.0.0.1:0".parse().unwrap()).unwrap();
		let b = Multiplexer::bind("127.0.0.1:0".parse().unwrap()).unwrap();

		let peer_a = RecordingPeer::new(ConnectivityState::Established);
		a.add_peer(b.local_endpoint(), &(peer_a.clone() as Rc<dyn Peer>));

		let peer_b = RecordingPeer::new(ConnectivityState::Established);
		b.add_peer(a.local_endpoint(), &(peer_b.clone() as Rc<dyn Peer>));

		a.send_handshake(b.local_endpoint(), Sequence::new(1), None, 0).unwrap();
		assert!(b.poll_once(Duration::from_millis(200)).unwrap());
		assert_eq!(peer_b.handshakes.borrow().as_slice(), &[(Sequence::new(1), a.local_endpoint())]);

		b.send_data(a.local_endpoint(), Sequence::new(1), Some(Sequence::new(1)), 0, b"hi").unwrap();
		assert!(a.poll_once(Duration::from_millis(200)).unwrap());
		assert_eq!(peer_a.data.borrow().as_slice(), &[(b"hi".to_vec(), Sequence::new(1))]);
		assert_eq!(peer_a.acks.borrow().as_slice(), &[Sequence::new(1)]);
	}

	#[test]
	fn unknown_handshake_is_consumed_by_the_accept_queue() {
		let server = Multiplexer::bind("127.0.0.1:0".parse().unwrap()).unwrap();
		let client = Multiplexer::bind("127.0.0.1:0".parse().unwrap()).unwrap();

		let pending_peer = RecordingPeer::new(ConnectivityState::Handshaking);
		let completed = Rc::new(Cell::new(false));
		let completed_clone = completed.clone();
		server.queue_accept(pending_peer.clone(), Rc::new(Cell::new(false)), Box::new(move |result| completed_clone.set(result.is_ok())));

		client.send_handshake(server.local_endpoint(), Sequence::new(41), None, 0).unwrap();
		assert!(server.poll_once(Duration::from_millis(200)).unwrap());

		assert_eq!(pending_peer.handshakes.borrow().len(), 1);
		assert!(!completed.get(), "accept should not complete before the peer reaches Established");

		pending_peer.state.set(ConnectivityState::Established);
		client.send_keepalive(server.local_endpoint(), Sequence::new(42), Some(Sequence::new(41)), 0).unwrap();
		assert!(server.poll_once(Duration::from_millis(200)).unwrap());

		assert!(completed.get());
	}

	#[test]
	fn unknown_data_packet_without_a_pending_accept_is_ignored() {
		let server = Multiplexer::bind("127.0.0.1:0".parse().unwrap()).unwrap();
		let client = Multiplexer::bind("127.0.0.1:0".parse().unwrap()).unwrap();

		client.send_data(server.local_endpoint(), Sequence::new(1), None, 0, b"hello").unwrap();
		assert!(server.poll_once(Duration::from_millis(200)).unwrap());
		assert!(server.peers.borrow().is_empty());
	}

	#[test]
	fn poll_once_times_out_with_no_traffic() {
		let server = Multiplexer::bind("127.0.0.1:0".parse().unwrap()).unwrap();
		assert!(!server.poll_once(Duration::from_millis(20)).unwrap());
	}

	#[test]
	fn cancelled_accept_token_aborts_a_still_queued_entry() {
		let server = Multiplexer::bind("127.0.0.1:0".parse().unwrap()).unwrap();
		let pending_peer = RecordingPeer::new(ConnectivityState::Listening);
		let token = Rc::new(Cell::new(false));
		let aborted = Rc::new(Cell::new(None));
		let aborted_clone = aborted.clone();

		server.queue_accept(pending_peer, token.clone(), Box::new(move |result| aborted_clone.set(Some(result.is_err()))));
		server.cancel_accepts(&token);

		assert_eq!(aborted.get(), Some(true));
		assert!(server.accept_queue.borrow().is_empty());
	}

	#[test]
	fn cancelled_accept_token_aborts_a_matched_but_unestablished_entry() {
		let server = Multiplexer::bind("127.0.0.1:0".parse().unwrap()).unwrap();
		let client = Multiplexer::bind("127.0.0.1:0".parse().unwrap()).unwrap();

		let pending_peer = RecordingPeer::new(ConnectivityState::Handshaking);
		let token = Rc::new(Cell::new(false));
		let aborted = Rc::new(Cell::new(None));
		let aborted_clone = aborted.clone();
		server.queue_accept(pending_peer, token.clone(), Box::new(move |result| aborted_clone.set(Some(result.is_err()))));

		client.send_handshake(server.local_endpoint(), Sequence::new(1), None, 0).unwrap();
		assert!(server.poll_once(Duration::from_millis(200)).unwrap());
		assert!(aborted.get().is_none(), "not established yet, so not completed");

		server.cancel_accepts(&token);
		assert_eq!(aborted.get(), Some(true));
		assert!(server.peers.borrow().is_empty());
	}
}
