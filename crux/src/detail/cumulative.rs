//! The cumulative-ack / NACK bitmap set, grounded on
//! `detail/cumulative_set.hpp`. Test vectors are taken verbatim from
//! `examples/original_source/test/cumulative_set_suite.cpp`, which is the
//! authoritative edge-case oracle.

use std::collections::BTreeSet;

use crate::detail::sequence::Sequence;

/// Width of the NACK bitmap in bits. Spec §6 says 16 bits suffices; this is
/// also what the original test suite's `uint16_t` field type assumes.
const NACK_BITS: u32 = 16;

/// Tracks received sequence numbers and collapses them to a cumulative
/// point plus a bounded NACK bitmap of the gaps just past it.
#[derive(Default)]
pub struct CumulativeSet {
	items: BTreeSet<u32>,
}

impl CumulativeSet {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn is_empty(&self) -> bool {
		self.items.is_empty()
	}

	/// Insert a newly received sequence number, then prune everything
	/// strictly before the new cumulative point.
	pub fn insert(&mut self, seq: Sequence) {
		self.items.insert(seq.value());
		self.prune();
	}

	/// Erase every element before the last element of the longest
	/// contiguous run starting at the smallest element. Mirrors
	/// `cumulative_set::prune` exactly, including its "always take the
	/// last tie" behavior (a plain `adjacent_find` would stop at the
	/// first, not the last, contiguous element).
	fn prune(&mut self) {
		let mut iter = self.items.iter().copied();
		let Some(first) = iter.next() else { return };

		let mut boundary = first;
		let mut current = first;
		for next in iter {
			if next.wrapping_sub(current) > 1 {
				break;
			}
			boundary = next;
			current = next;
		}

		if boundary != first {
			self.items = self.items.split_off(&boundary);
		}
	}

	/// The cumulative point and its NACK bitmap, or `None` if nothing has
	/// been received yet.
	pub fn front(&self) -> Option<(Sequence, u16)> {
		let mut iter = self.items.iter().copied();
		let cumulative = iter.next()?;

		let mut nack: u32 = 0;
		let mut prev = cumulative;
		for next in iter {
			let gap = next.wrapping_sub(prev);
			if gap > 1 {
				let lo = prev.wrapping_sub(cumulative);
				if lo < NACK_BITS {
					let available = NACK_BITS - lo;
					let width = (gap - 1).min(available);
					nack |= ((1u32 << width) - 1) << lo;
				}
			}
			prev = next;
		}

		Some((Sequence::new(cumulative), nack as u16))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn front(set: &CumulativeSet) -> (u32, u16) {
		let (seq, nack) = set.front().unwrap();
		(seq.value(), nack)
	}

	#[test]
	fn empty_has_no_front() {
		let set = CumulativeSet::new();
		assert!(set.is_empty());
		assert!(set.front().is_none());
	}

	#[test]
	fn single_element() {
		let mut set = CumulativeSet::new();
		set.insert(Sequence::new(41));
		assert_eq!(front(&set), (41, 0));
	}

	#[test]
	fn contiguous_pair_collapses() {
		let mut set = CumulativeSet::new();
		set.insert(Sequence::new(41));
		set.insert(Sequence::new(42));
		assert_eq!(front(&set), (42, 0));
		assert!(!set.is_empty());
	}

	#[test]
	fn out_of_sequence_then_filled() {
		let mut set = CumulativeSet::new();
		set.insert(Sequence::new(41));
		set.insert(Sequence::new(42));
		set.insert(Sequence::new(44));
		assert_eq!(front(&set), (42, 0x0001));

		set.insert(Sequence::new(43));
		assert_eq!(front(&set), (44, 0));
	}

	#[test]
	fn nack_vectors_from_original_suite() {
		let cases: &[(&[u32], u32, u16)] = &[
			(&[1, 2], 2, 0x0000),
			(&[1, 3], 1, 0x0001),
			(&[1, 4], 1, 0x0003),
			(&[1, 5], 1, 0x0007),
			(&[1, 99], 1, 0xFFFF),
			(&[1, 3, 5, 7, 9, 11, 13, 15], 1, 0x1555),
			(&[1, 3, 5, 7, 9, 11, 13, 15, 17], 1, 0x5555),
		];

		for &(inserts, expected_seq, expected_nack) in cases {
			let mut set = CumulativeSet::new();
			for &v in inserts {
				set.insert(Sequence::new(v));
			}
			assert_eq!(front(&set), (expected_seq, expected_nack), "inserts = {inserts:?}");
		}
	}
}
