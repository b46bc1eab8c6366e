//! The handshake-cell protocol engine.
//!
//! A cell is one 32-bit word holding the device's flags and the host's flags.
//! For any bit position the *signal* is asserted iff the two sides' bits
//! differ; either side changes the signal by XOR-toggling its own bit and
//! never writes the peer's half. Observation is a single 32-bit read, so any
//! two observers see the same signal state.
//!
//! Cells come in two widths: 16/16 (the regular channel cells) and 8/8 where
//! the low half of the word carries unrelated data (ROM-loader mailbox
//! cells).

use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::error::Result;
use crate::transport::{DpmAccess, Transport};

// System channel host flag bits.
pub const SYS_RESET_BIT: u8 = 0;
pub const SYS_BOOTSTART_BIT: u8 = 1;
// System channel device flag bits (absolute, not toggles).
pub const SYS_READY_BIT: u8 = 0;
pub const SYS_ERROR_BIT: u8 = 1;

// Shared command/acknowledge bit pairs (system and communication cells).
pub const HOST_COS_BIT: u8 = 2;
pub const NETX_COS_BIT: u8 = 3;
pub const SEND_MBX_BIT: u8 = 4;
pub const RECV_MBX_BIT: u8 = 5;
// Communication channel process-data bits.
pub const PD0_OUT_BIT: u8 = 6;
pub const PD0_IN_BIT: u8 = 7;
pub const PD1_OUT_BIT: u8 = 8;
pub const PD1_IN_BIT: u8 = 9;

bitflags! {
	/// Host flags of the system cell.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct HostSysFlags: u16 {
		const RESET = 1 << SYS_RESET_BIT;
		const BOOTSTART = 1 << SYS_BOOTSTART_BIT;
		const HOST_COS = 1 << HOST_COS_BIT;
		const NETX_COS_ACK = 1 << NETX_COS_BIT;
		const SEND_MBX = 1 << SEND_MBX_BIT;
		const RECV_MBX_ACK = 1 << RECV_MBX_BIT;
	}
}

bitflags! {
	/// Device flags of the system cell.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct NetxSysFlags: u16 {
		const READY = 1 << SYS_READY_BIT;
		const ERROR = 1 << SYS_ERROR_BIT;
		const HOST_COS_ACK = 1 << HOST_COS_BIT;
		const NETX_COS = 1 << NETX_COS_BIT;
		const SEND_MBX_ACK = 1 << SEND_MBX_BIT;
		const RECV_MBX = 1 << RECV_MBX_BIT;
	}
}

bitflags! {
	/// Device flags of a communication channel cell.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct NetxComFlags: u16 {
		const COMMUNICATING = 1 << 0;
		const ERROR = 1 << 1;
		const HOST_COS_ACK = 1 << HOST_COS_BIT;
		const NETX_COS = 1 << NETX_COS_BIT;
		const SEND_MBX_ACK = 1 << SEND_MBX_BIT;
		const RECV_MBX = 1 << RECV_MBX_BIT;
		const PD0_OUT_ACK = 1 << PD0_OUT_BIT;
		const PD0_IN = 1 << PD0_IN_BIT;
		const PD1_OUT_ACK = 1 << PD1_OUT_BIT;
		const PD1_IN = 1 << PD1_IN_BIT;
	}
}

/// Width/position variant of a handshake cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellWidth {
	/// `{data[2], netx_flags, host_flags}` byte layout.
	Bits8,
	/// `{netx_flags: u16, host_flags: u16}` layout.
	Bits16,
}

/// Where a cell lives and how wide its flag halves are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellLocation {
	/// Absolute, 4-byte-aligned DPM offset of the cell word.
	pub offset: u32,
	pub width: CellWidth,
}

impl CellLocation {
	pub fn host_flags_offset(&self) -> u32 {
		match self.width {
			CellWidth::Bits8 => self.offset + 3,
			CellWidth::Bits16 => self.offset + 2,
		}
	}
}

/// Atomically observed cell value, split into the two flag halves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CellSnapshot {
	pub netx: u16,
	pub host: u16,
}

impl CellSnapshot {
	pub fn from_raw(raw: u32, width: CellWidth) -> Self {
		match width {
			CellWidth::Bits16 => Self {
				netx: raw as u16,
				host: (raw >> 16) as u16,
			},
			CellWidth::Bits8 => Self {
				netx: (raw >> 16) as u8 as u16,
				host: (raw >> 24) as u16,
			},
		}
	}

	/// Signal for `bit`: asserted iff the sides disagree.
	pub fn signal(&self, bit: u8) -> bool {
		((self.netx ^ self.host) >> bit) & 1 == 1
	}

	pub fn netx_bit(&self, bit: u8) -> bool {
		(self.netx >> bit) & 1 == 1
	}

	/// Bits whose signal state differs between two snapshots.
	pub fn changed_signals(&self, prior: CellSnapshot) -> u16 {
		(self.netx ^ self.host) ^ (prior.netx ^ prior.host)
	}
}

/// Target of a wait on a handshake cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalState {
	/// Host bit equals device bit: signal clear, acknowledge received.
	Equal,
	/// Host bit differs from device bit: signal asserted, request pending.
	NotEqual,
	/// Device bit is 1 (absolute flags such as READY).
	Set,
	/// Device bit is 0.
	Clear,
}

impl SignalState {
	pub fn matches(self, snapshot: CellSnapshot, bit: u8) -> bool {
		match self {
			SignalState::Equal => !snapshot.signal(bit),
			SignalState::NotEqual => snapshot.signal(bit),
			SignalState::Set => snapshot.netx_bit(bit),
			SignalState::Clear => !snapshot.netx_bit(bit),
		}
	}
}

/// One atomic read of a cell.
pub fn read_cell(transport: &mut Transport, cell: CellLocation) -> Result<CellSnapshot> {
	let raw = transport.read_u32(cell.offset)?;
	Ok(CellSnapshot::from_raw(raw, cell.width))
}

/// XOR-toggles bits in the host half of a cell. Only the host half is
/// written, so a device-side update racing this write is never lost.
pub fn toggle_host_flags(
	transport: &mut Transport,
	cell: CellLocation,
	mask: u16,
) -> Result<CellSnapshot> {
	let mut snapshot = read_cell(transport, cell)?;
	snapshot.host ^= mask;
	match cell.width {
		CellWidth::Bits16 => transport.write_u16(cell.host_flags_offset(), snapshot.host)?,
		CellWidth::Bits8 => transport.write_u8(cell.host_flags_offset(), snapshot.host as u8)?,
	}
	Ok(snapshot)
}

/// Writes an absolute value into the host half (used once at channel init).
pub fn write_host_flags(
	transport: &mut Transport,
	cell: CellLocation,
	value: u16,
) -> Result<()> {
	match cell.width {
		CellWidth::Bits16 => transport.write_u16(cell.host_flags_offset(), value)?,
		CellWidth::Bits8 => transport.write_u8(cell.host_flags_offset(), value as u8)?,
	}
	Ok(())
}

/// An edge-triggered notification: waiters observe a generation counter and
/// sleep until it moves. The interrupt (or poll) path bumps it after
/// re-reading a cell and seeing a toggle; forced device removal bumps every
/// event to kick waiters out.
#[derive(Debug, Default)]
pub struct Event {
	generation: Mutex<u64>,
	cond: Condvar,
}

impl Event {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn generation(&self) -> u64 {
		*self.generation.lock().unwrap()
	}

	pub fn signal(&self) {
		let mut generation = self.generation.lock().unwrap();
		*generation += 1;
		self.cond.notify_all();
	}

	/// Sleeps until the generation moves past `seen` or `timeout` elapses.
	/// Returns the current generation either way.
	pub fn wait_newer(&self, seen: u64, timeout: Duration) -> u64 {
		let generation = self.generation.lock().unwrap();
		if *generation != seen {
			return *generation;
		}
		let (generation, _) = self
			.cond
			.wait_timeout_while(generation, timeout, |generation| *generation == seen)
			.unwrap();
		*generation
	}
}
