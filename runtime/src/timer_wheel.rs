//! A monotonic one-shot timer wheel.
//!
//! This is the primitive `crux::detail::timer` is built on: a flat list of
//! `(deadline, callback)` pairs, ordered by insertion and scanned for
//! expiry each time the owning event loop comes up for air. It makes no
//! attempt to be a real hierarchical timer wheel — connection counts in
//! scope for CRUX are small enough that a linear scan per tick is cheap,
//! and simplicity here matters more than asymptotics.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;

/// A handle to a scheduled callback, used to cancel it before it fires.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TimerToken(u64);

struct Entry {
	token: TimerToken,
	deadline: Instant,
	callback: Box<dyn FnOnce()>,
}

/// Holds every pending one-shot callback for a single event loop.
#[derive(Default)]
pub struct TimerWheel {
	entries: Vec<Entry>,
	next_token: u64,
}

impl TimerWheel {
	pub fn new() -> Self {
		Self { entries: Vec::new(), next_token: 0 }
	}

	/// Schedule `callback` to run at `deadline`. Returns a token that can be
	/// passed to `cancel` before the deadline to suppress it.
	pub fn schedule(&mut self, deadline: Instant, callback: Box<dyn FnOnce()>) -> TimerToken {
		let token = TimerToken(self.next_token);
		self.next_token += 1;
		self.entries.push(Entry { token, deadline, callback });
		token
	}

	/// Cancel a previously scheduled callback. A no-op if it already fired
	/// or was never scheduled (or already cancelled).
	pub fn cancel(&mut self, token: TimerToken) {
		self.entries.retain(|e| e.token != token);
	}

	/// The earliest deadline still pending, if any. The event loop uses
	/// this to bound how long it blocks on socket I/O.
	pub fn next_deadline(&self) -> Option<Instant> {
		self.entries.iter().map(|e| e.deadline).min()
	}

	/// Remove every entry whose deadline has passed, in deadline order, and
	/// hand back their callbacks instead of invoking them.
	///
	/// Splitting this out from dispatch is what lets a caller sharing the
	/// wheel behind a `RefCell` (every consumer here does — see
	/// `detail::timer`, `detail::transmit_queue`, `service::IoContext`) drop
	/// its borrow before running a single callback: callbacks routinely
	/// reschedule further timers on this same wheel (a retransmit re-arming
	/// itself, a keepalive timeout posting a completion), and invoking them
	/// while still borrowed would double-borrow the `RefCell` and panic.
	/// Newly scheduled entries are not considered due on this pass even if
	/// their deadline is already in the past.
	pub fn take_due(&mut self, now: Instant) -> Vec<Box<dyn FnOnce()>> {
		let cutoff = self.entries.len();
		let mut due: Vec<Entry> = Vec::new();
		let mut i = 0;
		while i < cutoff {
			if self.entries[i].deadline <= now {
				due.push(self.entries.remove(i));
			} else {
				i += 1;
			}
		}
		due.sort_by_key(|e| e.deadline);
		due.into_iter().map(|e| e.callback).collect()
	}

	/// Run every callback whose deadline has passed, in deadline order.
	///
	/// Only safe to call on a bare, unshared `TimerWheel` — it holds `&mut
	/// self` for the whole dispatch loop. Anything reaching this wheel
	/// through a `Rc<RefCell<TimerWheel>>` (i.e. everything in `crux`) must
	/// call `take_due` instead and invoke the returned callbacks only after
	/// the borrow is dropped.
	pub fn fire_due(&mut self, now: Instant) {
		for callback in self.take_due(now) {
			callback();
		}
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	/// The `Rc<RefCell<TimerWheel>>`-safe counterpart of `fire_due`: borrows
	/// just long enough to drain the due callbacks, drops the borrow, then
	/// invokes them. Every `crux` call site sharing a wheel this way should
	/// go through this instead of `fire_due`.
	pub fn dispatch_due(wheel: &Rc<RefCell<Self>>, now: Instant) {
		let due = wheel.borrow_mut().take_due(now);
		for callback in due {
			callback();
		}
	}
}

#[cfg(test)]
mod tests {
	use std::cell::RefCell;
	use std::rc::Rc;
	use std::time::Duration;

	use super::*;

	#[test]
	fn fires_in_deadline_order() {
		let now = Instant::now();
		let mut wheel = TimerWheel::new();
		let order = Rc::new(RefCell::new(Vec::new()));

		let o = order.clone();
		wheel.schedule(now + Duration::from_millis(20), Box::new(move || o.borrow_mut().push(2)));
		let o = order.clone();
		wheel.schedule(now + Duration::from_millis(5), Box::new(move || o.borrow_mut().push(1)));

		wheel.fire_due(now + Duration::from_millis(30));

		assert_eq!(*order.borrow(), vec![1, 2]);
		assert!(wheel.is_empty());
	}

	#[test]
	fn cancel_suppresses_callback() {
		let now = Instant::now();
		let mut wheel = TimerWheel::new();
		let fired = Rc::new(RefCell::new(false));

		let f = fired.clone();
		let token = wheel.schedule(now + Duration::from_millis(1), Box::new(move || *f.borrow_mut() = true));
		wheel.cancel(token);

		wheel.fire_due(now + Duration::from_secs(1));

		assert!(!*fired.borrow());
	}

	#[test]
	fn not_yet_due_entries_stay_pending() {
		let now = Instant::now();
		let mut wheel = TimerWheel::new();
		wheel.schedule(now + Duration::from_secs(10), Box::new(|| {}));

		wheel.fire_due(now);

		assert!(!wheel.is_empty());
		assert_eq!(wheel.next_deadline(), Some(now + Duration::from_secs(10)));
	}
}
