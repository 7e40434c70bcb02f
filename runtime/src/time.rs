//! Wall-clock helpers.
//!
//! CRUX's protocol state (timers, retransmission periods) is driven entirely
//! off `std::time::Instant`, which is monotonic but not meaningful outside
//! the process. These helpers translate to/from wall-clock time for logging
//! and diagnostics only.

use std::time::{SystemTime, UNIX_EPOCH};

/// The current wall-clock time.
pub fn system() -> SystemTime {
	SystemTime::now()
}

/// The current UNIX time in seconds.
pub fn unix() -> u64 {
	system().duration_since(UNIX_EPOCH).expect("the current time should be after the UNIX epoch").as_secs()
}
