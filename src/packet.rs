//! Mailbox packet framing.
//!
//! A packet is a fixed 40-byte header followed by an opaque payload. All
//! header words are little-endian on the wire. The toolkit never interprets
//! payloads; only the command word's low bits (request/confirmation,
//! indication/response) and the size fields matter here.

use crate::error::{Error, Result};

/// Size of the packet header in bytes.
pub const HEADER_LEN: usize = 40;

/// Command word bit distinguishing confirmations from requests.
pub const MSK_CMD_CONFIRMATION: u32 = 0x0000_0001;
/// Command word bit marking unsolicited traffic (indication/response pair).
pub const MSK_CMD_UNSOLICITED: u32 = 0x0000_0002;

/// The ten little-endian header words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketHeader {
	pub dest: u32,
	pub src: u32,
	pub dest_id: u32,
	/// Chosen by the sender, echoed verbatim in the confirmation.
	pub src_id: u32,
	/// Payload length in bytes.
	pub len: u32,
	/// Correlator, echoed in the confirmation.
	pub id: u32,
	/// Zero on requests; result status on confirmations.
	pub state: u32,
	pub cmd: u32,
	pub ext: u32,
	pub rout: u32,
}

impl PacketHeader {
	pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
		let mut buf = [0u8; HEADER_LEN];
		let words = [
			self.dest, self.src, self.dest_id, self.src_id, self.len, self.id, self.state,
			self.cmd, self.ext, self.rout,
		];
		for (chunk, word) in buf.chunks_exact_mut(4).zip(words) {
			chunk.copy_from_slice(&word.to_le_bytes());
		}
		buf
	}

	pub fn from_bytes(buf: &[u8]) -> Result<Self> {
		if buf.len() < HEADER_LEN {
			return Err(Error::Protocol("truncated packet header"));
		}
		let word = |i: usize| u32::from_le_bytes(buf[4 * i..4 * i + 4].try_into().unwrap());
		Ok(Self {
			dest: word(0),
			src: word(1),
			dest_id: word(2),
			src_id: word(3),
			len: word(4),
			id: word(5),
			state: word(6),
			cmd: word(7),
			ext: word(8),
			rout: word(9),
		})
	}

	pub fn is_confirmation(&self) -> bool {
		self.cmd & MSK_CMD_CONFIRMATION != 0
	}

	pub fn is_request(&self) -> bool {
		!self.is_confirmation()
	}

	pub fn is_indication(&self) -> bool {
		self.cmd & MSK_CMD_UNSOLICITED != 0 && !self.is_confirmation()
	}

	/// Command word of the confirmation answering this request.
	pub fn confirmation_cmd(&self) -> u32 {
		self.cmd | MSK_CMD_CONFIRMATION
	}

	/// Rejects packets that cannot fit a mailbox whose data area holds
	/// `mailbox_data_len` bytes (header included).
	pub fn check_bounds(&self, mailbox_data_len: usize) -> Result<()> {
		let total = (self.len as usize)
			.checked_add(HEADER_LEN)
			.ok_or(Error::PacketTooLarge)?;
		if total > mailbox_data_len {
			return Err(Error::PacketTooLarge);
		}
		Ok(())
	}
}

/// A framed mailbox message: header plus payload bytes.
#[derive(Debug, Clone, Default)]
pub struct Packet {
	pub header: PacketHeader,
	pub payload: Vec<u8>,
}

impl Packet {
	/// A request packet; the header length field tracks the payload.
	pub fn request(cmd: u32, src_id: u32, payload: Vec<u8>) -> Self {
		Self {
			header: PacketHeader {
				src_id,
				len: payload.len() as u32,
				cmd,
				..Default::default()
			},
			payload,
		}
	}

	/// Total on-wire length (header + payload).
	pub fn wire_len(&self) -> usize {
		HEADER_LEN + self.payload.len()
	}
}
