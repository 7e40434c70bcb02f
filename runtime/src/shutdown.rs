//! Graceful Ctrl+C handling for example binaries.
//!
//! A single `ctrlc` handler
//! installed process-wide, flipping an `AtomicBool` that the event loop
//! polls once per iteration instead of being torn down from signal context.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use utils::error::Result;

/// Install a Ctrl+C handler and return the flag it sets. Only the first
/// call in a process actually installs the handler; callers that race for
/// it will get an error from the underlying `ctrlc` crate.
pub fn install() -> Result<Arc<AtomicBool>> {
	let flag = Arc::new(AtomicBool::new(false));

	let set = flag.clone();
	ctrlc::set_handler(move || set.store(true, Ordering::Relaxed)).map_err(|err| log::error!("failed to install Ctrl+C handler: {err}"))?;

	Ok(flag)
}
