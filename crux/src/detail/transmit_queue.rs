//! A map of in-flight, individually-retransmitted items driven by one
//! shared timer, grounded on
//! `detail/transmit_queue.hpp`. The original is a class template over the
//! index type and keeps exactly one `periodic_timer` pointed at whichever
//! entry is `entries.begin()`; pushing a fresh entry when the queue was
//! empty, or acking the current front, both re-arm that one timer at the
//! new front. Same shape here, with `BTreeMap` standing in for
//! `std::map` and `Rc<RefCell<Inner>>` (built via `Rc::new_cyclic`) standing
//! in for the timer's capture of `this`.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use log::warn;
use runtime::TimerWheel;

use crate::detail::timer::Timer;
use crate::error::{Error, Result};

/// Fixed retransmission period; CRUX does no congestion control.
pub const RETRANSMISSION_PERIOD: Duration = Duration::from_secs(3);

pub type Completion = Box<dyn FnOnce(Result<()>, usize)>;
pub type Step = Box<dyn FnMut(Completion)>;
pub type Handler = Box<dyn FnOnce(Result<()>, usize)>;

struct Entry {
	buffer_size: usize,
	period: Duration,
	step: Step,
	handler: Handler,
}

struct Inner<Index: Ord + Copy> {
	entries: BTreeMap<Index, Entry>,
	timer: Timer,
	wheel: Rc<RefCell<TimerWheel>>,
}

pub struct TransmitQueue<Index: Ord + Copy + 'static> {
	inner: Rc<RefCell<Inner<Index>>>,
}

impl<Index: Ord + Copy + 'static> TransmitQueue<Index> {
	pub fn new(wheel: Rc<RefCell<TimerWheel>>) -> Self {
		let inner = Rc::new_cyclic(|weak: &Weak<RefCell<Inner<Index>>>| {
			let timer = Timer::new(wheel.clone());
			let weak_for_timer = weak.clone();
			timer.set_handler(move || {
				if let Some(strong) = weak_for_timer.upgrade() {
					Self::on_timer_tick(&strong);
				}
			});
			RefCell::new(Inner { entries: BTreeMap::new(), timer, wheel })
		});
		Self { inner }
	}

	pub fn is_empty(&self) -> bool {
		self.inner.borrow().entries.is_empty()
	}

	pub fn size(&self) -> usize {
		self.inner.borrow().entries.len()
	}

	/// Begin tracking `index`. If an entry already exists for `index`,
	/// `handler` is invoked (on the next wheel pump, never synchronously)
	/// with `Error::AlreadyStarted`.
	pub fn push(&self, index: Index, buffer_size: usize, step: Step, handler: Handler) {
		let mut inner = self.inner.borrow_mut();

		if inner.entries.contains_key(&index) {
			let wheel = inner.wheel.clone();
			drop(inner);
			wheel.borrow_mut().schedule(Instant::now(), Box::new(move || handler(Err(Error::AlreadyStarted), 0)));
			return;
		}

		let was_empty = inner.entries.is_empty();
		inner.entries.insert(index, Entry { buffer_size, period: RETRANSMISSION_PERIOD, step, handler });
		drop(inner);

		if was_empty {
			Self::start_step(&self.inner, index);
		}
	}

	/// Remove the entry for `index`, if any, and invoke its handler with a
	/// success result. If it was the active (front) entry, restart the
	/// timer at the new front.
	pub fn apply_ack(&self, index: Index) {
		let mut inner = self.inner.borrow_mut();

		let is_active = inner.entries.keys().next() == Some(&index);
		let Some(entry) = inner.entries.remove(&index) else { return };

		let next_front = if is_active {
			inner.timer.stop();
			inner.entries.keys().next().copied()
		} else {
			None
		};
		drop(inner);

		if let Some(next_index) = next_front {
			Self::start_step(&self.inner, next_index);
		}

		(entry.handler)(Ok(()), entry.buffer_size);
	}

	/// Stop the timer and evict every entry, firing each handler with
	/// `Error::OperationAborted` (destroying a connection cancels its
	/// pending transmit-queue entries).
	pub fn cancel_all(&self) {
		let mut inner = self.inner.borrow_mut();
		inner.timer.stop();
		let entries = std::mem::take(&mut inner.entries);
		drop(inner);

		for (_, entry) in entries {
			(entry.handler)(Err(Error::OperationAborted), entry.buffer_size);
		}
	}

	fn on_timer_tick(inner_rc: &Rc<RefCell<Inner<Index>>>) {
		let front = inner_rc.borrow().entries.keys().next().copied();
		if let Some(index) = front {
			Self::start_step(inner_rc, index);
		}
	}

	/// Run one iteration of `index`'s step, with a completion callback that
	/// re-arms the queue timer on success or evicts the entry on error.
	/// The step closure is swapped out of the map for the duration of the
	/// call so a synchronous completion (our sockets are blocking) never
	/// re-borrows `Inner` while it's already borrowed here.
	fn start_step(inner_rc: &Rc<RefCell<Inner<Index>>>, index: Index) {
		let mut step = {
			let mut inner = inner_rc.borrow_mut();
			let Some(entry) = inner.entries.get_mut(&index) else { return };
			std::mem::replace(&mut entry.step, Box::new(|_: Completion| {}))
		};

		let inner_for_completion = inner_rc.clone();
		let completion: Completion = Box::new(move |result, bytes| {
			Self::on_step_complete(&inner_for_completion, index, result, bytes);
		});

		step(completion);

		let mut inner = inner_rc.borrow_mut();
		if let Some(entry) = inner.entries.get_mut(&index) {
			entry.step = step;
		}
	}

	fn on_step_complete(inner_rc: &Rc<RefCell<Inner<Index>>>, index: Index, result: Result<()>, bytes: usize) {
		match result {
			Err(err) => {
				warn!("send step failed, evicting its transmit-queue entry: {err}");
				let removed = inner_rc.borrow_mut().entries.remove(&index);
				if let Some(entry) = removed {
					(entry.handler)(Err(err), bytes);
				}
			}
			Ok(()) => {
				let mut inner = inner_rc.borrow_mut();
				if let Some(entry) = inner.entries.get(&index) {
					let period = entry.period;
					inner.timer.set_period(period);
					inner.timer.start();
				}
			}
		}
	}
}
