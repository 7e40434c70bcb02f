//! Ambient concerns shared by everything built on top of CRUX: structured
//! logging, wall-clock helpers and a monotonic timer wheel. Unlike the
//! networking-stack flavor of this crate, nothing here owns a raw socket or
//! polls file descriptors directly — `crux` drives its own UDP sockets with
//! a blocking-with-timeout loop (`UdpSocket::set_read_timeout`) and only
//! borrows the timer wheel and logger from here. See `DESIGN.md` for why the
//! raw `poll()` reactor was dropped.

pub mod logger;
pub mod shutdown;
pub mod time;
pub mod timer_wheel;

pub use timer_wheel::{TimerToken, TimerWheel};
