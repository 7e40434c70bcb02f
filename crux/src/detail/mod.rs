//! Protocol internals. Nothing in here is part of the public API; `crux`'s
//! public surface (`connection`, `acceptor`, `service`) is built entirely on
//! top of these pieces, mirroring how `maidsafe::crux::detail` sits beneath
//! `maidsafe::crux::{socket,acceptor,service}`.

pub mod cumulative;
pub mod header;
pub mod multiplexer;
pub mod sequence;
pub mod timer;
pub mod transmit_queue;
