//! The re-entrant one-shot/periodic timer, grounded
//! on `detail/timer.hpp`. The original drives a `boost::asio::steady_timer`
//! and survives handler-triggered destruction with a `shared_ptr<bool>
//! was_destroyed` flag checked inside the completion handler; the `asio`
//! timer's `cancel()` doesn't actually suppress the completion handler, it
//! just expedites it to run on the next event-loop turn with an
//! `operation_aborted` code that the handler ignores. This is reproduced
//! here with `runtime::TimerWheel` by never removing a scheduled callback
//! outright: "canceling" reschedules it to fire immediately, and the
//! state machine below decides what that firing actually does. Destruction
//! safety is `Rc<RefCell<Inner>>` plus a `Weak` captured by the wheel
//! callback, upgraded at fire time, instead of the boolean flag.

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use runtime::{TimerToken, TimerWheel};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum State {
	Stopped,
	Running,
	Executing,
	CancelingToStop,
	CancelingToStart,
	CancelingToFf,
}

struct Inner {
	state: State,
	period: Duration,
	handler: Option<Box<dyn FnMut()>>,
	wheel: Rc<RefCell<TimerWheel>>,
	pending: Option<TimerToken>,
}

/// A handle to a scheduled, possibly-periodic callback. Not `Clone`; owned
/// by whatever protocol object drives it (a connection's keepalive timer, a
/// transmit queue's retransmission timer).
pub struct Timer {
	inner: Rc<RefCell<Inner>>,
}

impl Timer {
	pub fn new(wheel: Rc<RefCell<TimerWheel>>) -> Self {
		Self { inner: Rc::new(RefCell::new(Inner { state: State::Stopped, period: Duration::ZERO, handler: None, wheel, pending: None })) }
	}

	pub fn set_period(&self, period: Duration) {
		self.inner.borrow_mut().period = period;
	}

	pub fn set_handler<F: FnMut() + 'static>(&self, handler: F) {
		self.inner.borrow_mut().handler = Some(Box::new(handler));
	}

	/// The next handler invocation will be `period` from now.
	pub fn start(&self) {
		Self::start_inner(&self.inner);
	}

	/// The handler will not run again unless `start` or `fast_forward` is
	/// called.
	pub fn stop(&self) {
		Self::stop_inner(&self.inner);
	}

	/// The next handler invocation happens as soon as the event loop next
	/// comes up for air, but never synchronously inside this call.
	pub fn fast_forward(&self) {
		Self::start_inner(&self.inner);
		Self::stop_inner(&self.inner);
		self.inner.borrow_mut().state = State::CancelingToFf;
	}

	fn reschedule(inner: &Rc<RefCell<Inner>>, deadline: Instant) {
		let weak = Rc::downgrade(inner);
		let wheel = inner.borrow().wheel.clone();

		if let Some(token) = inner.borrow_mut().pending.take() {
			wheel.borrow_mut().cancel(token);
		}

		let token = wheel.borrow_mut().schedule(
			deadline,
			Box::new(move || {
				if let Some(strong) = Weak::upgrade(&weak) {
					Self::do_handle_tick(&strong);
				}
			}),
		);
		inner.borrow_mut().pending = Some(token);
	}

	fn do_start(inner: &Rc<RefCell<Inner>>) {
		inner.borrow_mut().state = State::Running;
		let deadline = Instant::now() + inner.borrow().period;
		Self::reschedule(inner, deadline);
	}

	fn start_inner(inner: &Rc<RefCell<Inner>>) {
		let state = inner.borrow().state;
		match state {
			State::Stopped => Self::do_start(inner),
			State::Running => {
				Self::stop_inner(inner);
				Self::start_inner(inner);
			}
			State::Executing => Self::do_start(inner),
			State::CancelingToStop => inner.borrow_mut().state = State::CancelingToStart,
			State::CancelingToStart => {}
			State::CancelingToFf => inner.borrow_mut().state = State::CancelingToStart,
		}
	}

	fn stop_inner(inner: &Rc<RefCell<Inner>>) {
		let state = inner.borrow().state;
		match state {
			State::Stopped => {}
			State::Running => {
				inner.borrow_mut().state = State::CancelingToStop;
				Self::reschedule(inner, Instant::now());
			}
			State::Executing => inner.borrow_mut().state = State::Stopped,
			State::CancelingToStop => {}
			State::CancelingToStart => inner.borrow_mut().state = State::CancelingToStop,
			State::CancelingToFf => inner.borrow_mut().state = State::CancelingToStop,
		}
	}

	fn do_handle_tick(inner: &Rc<RefCell<Inner>>) {
		let state = inner.borrow().state;
		match state {
			State::Stopped => return,
			State::Running => {}
			State::Executing => return,
			State::CancelingToStop => {
				let mut inner_mut = inner.borrow_mut();
				inner_mut.state = State::Stopped;
				inner_mut.pending = None;
				return;
			}
			State::CancelingToStart => {
				Self::do_start(inner);
				return;
			}
			State::CancelingToFf => {}
		}

		inner.borrow_mut().pending = None;
		inner.borrow_mut().state = State::Executing;

		let local_handler = inner.borrow_mut().handler.take();
		if let Some(mut local_handler) = local_handler {
			local_handler();

			let mut inner_mut = inner.borrow_mut();
			if inner_mut.handler.is_none() {
				inner_mut.handler = Some(local_handler);
			}
		}

		if inner.borrow().state == State::Executing {
			inner.borrow_mut().state = State::Stopped;
		}
	}

	#[cfg(test)]
	fn state(&self) -> State {
		self.inner.borrow().state
	}
}

impl Drop for Timer {
	fn drop(&mut self) {
		Self::stop_inner(&self.inner);
	}
}
