//! The process-wide local-endpoint → multiplexer map, grounded on `detail/service.hpp`.
//! The original is a `boost::asio::io_service::service` singleton reached via
//! `boost::asio::use_service`, sharing one process-wide, mutex-guarded map
//! across every `io_service` in the process. This is resolved the other
//! way deliberately: keep the map, but parameterise it by an `IoContext`
//! handle so that tests can construct isolated services — so there is no
//! global singleton here, just a plain `IoContext` object
//! tests and binaries construct explicitly. Since each `IoContext` is used
//! from exactly one thread for its lifetime (a single-threaded cooperative
//! model), its map needs no internal lock; the only thing the
//! original's mutex protected — sharing *one* map across independent
//! `io_service`s on different threads — simply doesn't arise when each
//! thread owns its own `IoContext`.
//!
//! This also plays the role of the original's reactor: there is no
//! `io_service::run()` here, just `poll_once`/`run_while`, since `crux`
//! drives its sockets with blocking-with-timeout reads rather than a
//! completion-port reactor (see `runtime::lib` and `detail::multiplexer`).

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use runtime::TimerWheel;

use crate::detail::multiplexer::Multiplexer;
use crate::endpoint::Endpoint;
use crate::error::Result;

/// How long a single `Multiplexer::poll_once` call is allowed to block
/// before `IoContext::poll_once` moves on to the next bound multiplexer
/// (or returns, if there is only one). Keeps a multi-endpoint `IoContext`
/// (e.g. a test running client and server in the same process) responsive
/// to both sockets without a real async reactor.
const DEFAULT_POLL_SLICE: Duration = Duration::from_millis(20);

pub struct IoContext {
	wheel: Rc<RefCell<TimerWheel>>,
	multiplexers: RefCell<HashMap<Endpoint, Weak<Multiplexer>>>,
}

impl IoContext {
	pub fn new() -> Rc<Self> {
		Rc::new(Self { wheel: Rc::new(RefCell::new(TimerWheel::new())), multiplexers: RefCell::new(HashMap::new()) })
	}

	pub(crate) fn wheel(&self) -> Rc<RefCell<TimerWheel>> {
		self.wheel.clone()
	}

	/// Schedule `f` to run on the next `poll_once`, never synchronously
	/// within the caller's frame — the same role `ios.post(...)` plays in
	/// the original for both completions and the argument-error paths of
	/// the error completion paths below.
	pub(crate) fn post(&self, f: impl FnOnce() + 'static) {
		self.wheel.borrow_mut().schedule(Instant::now(), Box::new(f));
	}

	/// The multiplexer already bound to `local`, or a freshly bound one —
	/// "a multiplexer is created on first bind to a local endpoint, shared
	/// by all connections and acceptors on that endpoint".
	pub(crate) fn multiplexer_for(&self, local: Endpoint) -> Result<Rc<Multiplexer>> {
		if let Some(existing) = self.multiplexers.borrow().get(&local).and_then(Weak::upgrade) {
			return Ok(existing);
		}

		let multiplexer = Multiplexer::bind(local)?;
		// Key by the socket's actual bound address, not the caller's request:
		// an unspecified port (0) resolves to a fresh ephemeral port on every
		// bind, so keying by the literal request would wrongly hand out the
		// same multiplexer to unrelated callers that all pass port 0.
		self.multiplexers.borrow_mut().insert(multiplexer.local_endpoint(), Rc::downgrade(&multiplexer));
		Ok(multiplexer)
	}

	fn live_multiplexers(&self) -> Vec<Rc<Multiplexer>> {
		let mut map = self.multiplexers.borrow_mut();
		map.retain(|_, weak| weak.strong_count() > 0);
		map.values().filter_map(Weak::upgrade).collect()
	}

	/// Fire every due timer, then poll each bound multiplexer once for up
	/// to `slice`. One turn of what would be `io_service::poll_one()` in
	/// the original.
	pub fn poll_once(&self, slice: Duration) {
		TimerWheel::dispatch_due(&self.wheel, Instant::now());
		for multiplexer in self.live_multiplexers() {
			let _ = multiplexer.poll_once(slice);
		}
		TimerWheel::dispatch_due(&self.wheel, Instant::now());
	}

	/// Repeatedly `poll_once` (with `DEFAULT_POLL_SLICE` per multiplexer)
	/// until `done` returns true or `timeout` elapses. Test/example
	/// support for driving the cooperative loop to a specific outcome,
	/// analogous to `io_service::run()` bounded by a deadline.
	pub fn run_while(&self, timeout: Duration, mut done: impl FnMut() -> bool) {
		let deadline = Instant::now() + timeout;
		while !done() && Instant::now() < deadline {
			self.poll_once(DEFAULT_POLL_SLICE);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn multiplexer_for_is_idempotent_per_local_endpoint() {
		let io = IoContext::new();
		let local: Endpoint = "127.0.0.1:0".parse().unwrap();

		let first = io.multiplexer_for(local).unwrap();
		let second = io.multiplexer_for(first.local_endpoint()).unwrap();

		assert!(Rc::ptr_eq(&first, &second));
	}

	#[test]
	fn post_runs_on_the_next_poll_not_synchronously() {
		let io = IoContext::new();
		let ran = Rc::new(RefCell::new(false));
		let ran_clone = ran.clone();

		io.post(move || *ran_clone.borrow_mut() = true);
		assert!(!*ran.borrow(), "post must not run synchronously");

		io.poll_once(Duration::from_millis(1));
		assert!(*ran.borrow());
	}

	#[test]
	fn dropping_every_strong_multiplexer_reference_lets_it_be_recreated() {
		let io = IoContext::new();
		let local: Endpoint = "127.0.0.1:0".parse().unwrap();

		let first = io.multiplexer_for(local).unwrap();
		let bound = first.local_endpoint();
		drop(first);

		let second = io.multiplexer_for(bound);
		assert!(second.is_ok());
	}
}
