//! The 12-byte wire header, grounded on
//! `detail/header_constants.hpp`, `detail/encoder.hpp` and
//! `detail/decoder.hpp`. The C++ encoder/decoder are generic byte-pushers;
//! since CRUX only ever encodes this one fixed layout, the Rust version
//! folds straight to a single `encode`/`decode` pair on `Header` instead of
//! carrying the generic cursor type across the crate.

use crate::error::{Error, Result};

pub const SIZE: usize = 12;
pub const VERSION: u16 = 0;

const MASK_TYPE: u16 = 0xF800;
const MASK_ACK: u16 = 0x000C;
const MASK_RTX: u16 = 0x0003;

const ACK_PRESENCE_SHIFT: u16 = 2;

/// Packet kind, the high 5 bits of the type/flags field.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Kind {
	Handshake,
	Data,
	Keepalive,
	/// Reserved for a future use; recognized on decode but never sent.
	Shutdown,
}

impl Kind {
	const HANDSHAKE_RAW: u16 = 0xC800;
	const DATA_RAW: u16 = 0xC000;
	const KEEPALIVE_RAW: u16 = 0xD800;
	const SHUTDOWN_RAW: u16 = 0xD000;

	fn raw(self) -> u16 {
		match self {
			Kind::Handshake => Self::HANDSHAKE_RAW,
			Kind::Data => Self::DATA_RAW,
			Kind::Keepalive => Self::KEEPALIVE_RAW,
			Kind::Shutdown => Self::SHUTDOWN_RAW,
		}
	}

	fn from_raw(raw: u16) -> Option<Self> {
		match raw {
			Self::HANDSHAKE_RAW => Some(Kind::Handshake),
			Self::DATA_RAW => Some(Kind::Data),
			Self::KEEPALIVE_RAW => Some(Kind::Keepalive),
			Self::SHUTDOWN_RAW => Some(Kind::Shutdown),
			_ => None,
		}
	}
}

/// Whether the acknowledgement-sequence field is meaningful.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AckPresence {
	None,
	Cumulative,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Header {
	pub kind: Kind,
	/// Sender's local retry counter, saturating at 3 on encode.
	pub retransmission_count: u8,
	pub ack_presence: AckPresence,
	/// Protocol version for handshake packets, zero otherwise.
	pub secondary: u16,
	pub sequence: u32,
	/// Only meaningful when `ack_presence != None`; zero on the wire
	/// otherwise.
	pub ack_sequence: u32,
}

impl Header {
	pub fn encode(&self) -> [u8; SIZE] {
		let mut buf = [0u8; SIZE];

		let ack_bits = match self.ack_presence {
			AckPresence::None => 0,
			AckPresence::Cumulative => 1,
		};
		let type_field = self.kind.raw() | (ack_bits << ACK_PRESENCE_SHIFT) | u16::from(self.retransmission_count.min(3));

		let ack_sequence = match self.ack_presence {
			AckPresence::None => 0,
			AckPresence::Cumulative => self.ack_sequence,
		};

		buf[0..2].copy_from_slice(&type_field.to_be_bytes());
		buf[2..4].copy_from_slice(&self.secondary.to_be_bytes());
		buf[4..8].copy_from_slice(&self.sequence.to_be_bytes());
		buf[8..12].copy_from_slice(&ack_sequence.to_be_bytes());

		buf
	}

	pub fn decode(buf: &[u8]) -> Result<Self> {
		if buf.len() < SIZE {
			return Err(Error::InvalidArgument);
		}

		let type_field = u16::from_be_bytes([buf[0], buf[1]]);
		let kind = Kind::from_raw(type_field & MASK_TYPE).ok_or(Error::InvalidArgument)?;
		let ack_presence = if type_field & MASK_ACK != 0 { AckPresence::Cumulative } else { AckPresence::None };
		let retransmission_count = (type_field & MASK_RTX) as u8;
		let secondary = u16::from_be_bytes([buf[2], buf[3]]);
		let sequence = u32::from_be_bytes(buf[4..8].try_into().unwrap());
		let ack_sequence = u32::from_be_bytes(buf[8..12].try_into().unwrap());

		Ok(Header { kind, retransmission_count, ack_presence, secondary, sequence, ack_sequence })
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn roundtrip(h: Header) {
		let encoded = h.encode();
		assert_eq!(Header::decode(&encoded).unwrap(), h);
	}

	#[test]
	fn roundtrips_every_kind() {
		for kind in [Kind::Handshake, Kind::Data, Kind::Keepalive, Kind::Shutdown] {
			roundtrip(Header { kind, retransmission_count: 0, ack_presence: AckPresence::None, secondary: 0, sequence: 7, ack_sequence: 0 });
			roundtrip(Header { kind, retransmission_count: 2, ack_presence: AckPresence::Cumulative, secondary: VERSION, sequence: 123_456, ack_sequence: 7 });
		}
	}

	#[test]
	fn retransmission_count_saturates_at_three() {
		let h = Header { kind: Kind::Data, retransmission_count: 250, ack_presence: AckPresence::None, secondary: 0, sequence: 0, ack_sequence: 0 };
		let decoded = Header::decode(&h.encode()).unwrap();
		assert_eq!(decoded.retransmission_count, 3);
	}

	#[test]
	fn ack_absent_zeroes_the_wire_field_on_decode_path() {
		// Absent ack is encoded with ack_sequence = 0 regardless of the struct's value.
		let h = Header { kind: Kind::Keepalive, retransmission_count: 0, ack_presence: AckPresence::None, secondary: 0, sequence: 9, ack_sequence: 555 };
		let encoded = h.encode();
		let decoded = Header::decode(&encoded).unwrap();
		assert_eq!(decoded.ack_presence, AckPresence::None);
		assert_eq!(decoded.ack_sequence, 0);
	}

	#[test]
	fn rejects_short_buffers() {
		assert!(Header::decode(&[0u8; 4]).is_err());
	}

	#[test]
	fn rejects_unknown_kind() {
		let mut buf = [0u8; SIZE];
		buf[0..2].copy_from_slice(&0x0000u16.to_be_bytes());
		assert!(Header::decode(&buf).is_err());
	}
}
