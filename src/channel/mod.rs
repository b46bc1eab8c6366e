//! Per-channel state.
//!
//! A channel is a fixed-index slice of the DPM owned by its device instance;
//! nothing here holds a pointer back to the device. The blocking operations
//! (`put_packet`, `io_read`, ...) live on [`crate::device::DeviceInstance`],
//! which owns the transport and the wait machinery; this module keeps the
//! channel-local bookkeeping: reference count, handshake-cell location,
//! notification events, mailbox correlation and the extended status parser.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use hashbrown::HashMap;
use num_enum::TryFromPrimitive;
use smallvec::SmallVec;

use crate::config::CORRELATION_TABLE_SIZE;
use crate::dpm::handshake::{self, CellLocation, Event};
use crate::dpm::{self, ChannelInfo, ChannelLayout, IoMode};
use crate::error::{Error, Result};

/// The four cyclic process-data areas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoArea {
	Pd0Input,
	Pd0Output,
	Pd1Input,
	Pd1Output,
}

impl IoArea {
	pub fn is_input(self) -> bool {
		matches!(self, IoArea::Pd0Input | IoArea::Pd1Input)
	}

	/// Handshake bit carrying this area's signal.
	pub fn bit(self) -> u8 {
		match self {
			IoArea::Pd0Input => handshake::PD0_IN_BIT,
			IoArea::Pd0Output => handshake::PD0_OUT_BIT,
			IoArea::Pd1Input => handshake::PD1_IN_BIT,
			IoArea::Pd1Output => handshake::PD1_OUT_BIT,
		}
	}

	pub(crate) fn lock_index(self) -> usize {
		match self {
			IoArea::Pd0Input => 0,
			IoArea::Pd0Output => 1,
			IoArea::Pd1Input => 2,
			IoArea::Pd1Output => 3,
		}
	}
}

/// Per-condition notification events of one channel.
#[derive(Debug, Default)]
pub struct ChannelEvents {
	pub send_mbx: Event,
	pub recv_mbx: Event,
	pub pd0_in: Event,
	pub pd0_out: Event,
	pub pd1_in: Event,
	pub pd1_out: Event,
	pub cos: Event,
	pub sync: Event,
	pub dma: Event,
}

impl ChannelEvents {
	/// Event observing a handshake bit of the channel cell.
	pub fn for_bit(&self, bit: u8) -> Option<&Event> {
		match bit {
			handshake::HOST_COS_BIT => Some(&self.cos),
			handshake::SEND_MBX_BIT => Some(&self.send_mbx),
			handshake::RECV_MBX_BIT => Some(&self.recv_mbx),
			handshake::PD0_IN_BIT => Some(&self.pd0_in),
			handshake::PD0_OUT_BIT => Some(&self.pd0_out),
			handshake::PD1_IN_BIT => Some(&self.pd1_in),
			handshake::PD1_OUT_BIT => Some(&self.pd1_out),
			handshake::NETX_COS_BIT => Some(&self.cos),
			_ => None,
		}
	}

	/// Kicks every waiter (forced device removal).
	pub fn signal_all(&self) {
		for event in [
			&self.send_mbx,
			&self.recv_mbx,
			&self.pd0_in,
			&self.pd0_out,
			&self.pd1_in,
			&self.pd1_out,
			&self.cos,
			&self.sync,
			&self.dma,
		] {
			event.signal();
		}
	}
}

/// Send-side bookkeeping: the correlation table maps the `src_id` of every
/// unconfirmed request to its command word.
#[derive(Debug, Default)]
pub struct SendState {
	pub correlation: HashMap<u32, u32>,
}

impl SendState {
	pub fn track(&mut self, src_id: u32, cmd: u32) -> Result<()> {
		if self.correlation.len() >= CORRELATION_TABLE_SIZE {
			return Err(Error::PendingLimit);
		}
		self.correlation.insert(src_id, cmd);
		Ok(())
	}

	pub fn confirm(&mut self, src_id: u32) -> Option<u32> {
		self.correlation.remove(&src_id)
	}
}

/// Configured cyclic I/O discipline of the channel.
#[derive(Debug, Clone, Copy, Default)]
pub struct IoConfig {
	pub input_mode: IoMode,
	pub output_mode: IoMode,
}

/// One communication (or application) channel of a device.
pub struct Channel {
	/// Communication-channel index (0-based, as the application sees it).
	pub index: u8,
	pub info: ChannelInfo,
	pub layout: ChannelLayout,
	/// Handshake cell of this channel.
	pub cell: CellLocation,
	/// DMA ownership cell (second word of the reserved handshake block).
	pub dma_cell: CellLocation,
	pub events: ChannelEvents,

	refcount: AtomicU32,
	/// Raw value of the last serviced cell read, for toggle detection.
	pub(crate) last_cell: AtomicU32,
	/// Raw value of the last serviced DMA cell read.
	pub(crate) last_dma_cell: AtomicU32,
	/// Communication COS word as of the last service pass.
	pub(crate) last_cos: AtomicU32,

	pub(crate) send: Mutex<SendState>,
	pub(crate) recv: Mutex<()>,
	/// Serializes control-block command cycles (app COS, watchdog).
	pub(crate) control: Mutex<()>,
	pub(crate) io_config: Mutex<IoConfig>,
	pub(crate) io_locks: [Mutex<()>; 4],
	pub(crate) dma: Mutex<crate::dma::DmaPool>,
}

impl Channel {
	pub fn new(index: u8, info: ChannelInfo, layout: ChannelLayout, cell: CellLocation) -> Self {
		let dma_cell = CellLocation {
			offset: layout.base + 4,
			width: handshake::CellWidth::Bits16,
		};
		Self {
			index,
			info,
			layout,
			cell,
			dma_cell,
			events: ChannelEvents::default(),
			refcount: AtomicU32::new(0),
			last_cell: AtomicU32::new(0),
			last_dma_cell: AtomicU32::new(0),
			last_cos: AtomicU32::new(0),
			send: Mutex::new(SendState::default()),
			recv: Mutex::new(()),
			control: Mutex::new(()),
			io_config: Mutex::new(IoConfig::default()),
			io_locks: [const { Mutex::new(()) }; 4],
			dma: Mutex::new(crate::dma::DmaPool::new()),
		}
	}

	pub fn open_count(&self) -> u32 {
		self.refcount.load(Ordering::Acquire)
	}

	pub(crate) fn acquire(&self) -> u32 {
		self.refcount.fetch_add(1, Ordering::AcqRel) + 1
	}

	pub(crate) fn release(&self) -> u32 {
		let prior = self.refcount.fetch_sub(1, Ordering::AcqRel);
		debug_assert!(prior > 0);
		let now = prior - 1;
		if now == 0 {
			// Last close drops per-channel state.
			self.send.lock().unwrap().correlation.clear();
		}
		now
	}

	/// Absolute DPM offset and size of a process-data area.
	pub fn io_area(&self, area: IoArea) -> (u32, u32) {
		let layout = &self.layout;
		match area {
			IoArea::Pd0Input => (layout.base + layout.pd0_input, layout.pd0_size),
			IoArea::Pd0Output => (layout.base + layout.pd0_output(), layout.pd0_size),
			IoArea::Pd1Input => (layout.base + dpm::chan::PD1_INPUT, dpm::HIGH_PRIO_IO_SIZE),
			IoArea::Pd1Output => (layout.base + dpm::chan::PD1_OUTPUT, dpm::HIGH_PRIO_IO_SIZE),
		}
	}

	pub fn io_mode(&self, area: IoArea) -> IoMode {
		let config = self.io_config.lock().unwrap();
		if area.is_input() { config.input_mode } else { config.output_mode }
	}

	pub fn set_io_config(&self, config: IoConfig) {
		*self.io_config.lock().unwrap() = config;
	}
}

/// Where an extended state field points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum StateFieldArea {
	StandardInput = 0,
	HighPrioInput = 1,
	StandardOutput = 8,
	HighPrioOutput = 9,
}

/// Diagnostic bitmap types announced in the extended status block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum StateFieldKind {
	SlaveConfigured = 1,
	SlaveActive = 2,
	SlaveDiagnostic = 3,
	Commands = 4,
	IoChanged = 5,
	ProviderStateBytewise = 6,
	ProviderStateBitwise = 7,
	ConsumerStateBytewise = 8,
	ConsumerStateBitwise = 9,
	AssemblyState = 10,
	PdoCounter = 11,
}

/// One record of the extended state field list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateField {
	pub area: StateFieldArea,
	pub kind: StateFieldKind,
	pub entries: u16,
	/// Byte offset inside the referenced I/O area.
	pub offset: u32,
}

pub const MAX_STATE_FIELDS: usize = 24;
pub type StateFields = SmallVec<[StateField; MAX_STATE_FIELDS]>;
/// The state field list sits at the tail of the 432-byte extended status
/// block, after the protocol-specific area.
pub(crate) const STATE_FIELD_OFFSET: usize =
	dpm::EXT_STATUS_SIZE - 4 - MAX_STATE_FIELDS * 8;

/// Parses the state-field list out of a raw extended status block. Records
/// with unknown area or type ids are skipped (firmware-specific extensions).
pub fn parse_state_fields(block: &[u8]) -> Result<StateFields> {
	if block.len() < dpm::EXT_STATUS_SIZE {
		return Err(Error::InvalidArgument("extended status block too short"));
	}
	let field = &block[STATE_FIELD_OFFSET..];
	let count = field[3] as usize;
	if count > MAX_STATE_FIELDS {
		return Err(Error::Protocol("extended status record count out of range"));
	}
	let mut records = SmallVec::new();
	for i in 0..count {
		let record = &field[4 + i * 8..4 + (i + 1) * 8];
		let area = StateFieldArea::try_from(record[0]);
		let kind = StateFieldKind::try_from(record[1]);
		let (Ok(area), Ok(kind)) = (area, kind) else {
			continue;
		};
		records.push(StateField {
			area,
			kind,
			entries: u16::from_le_bytes(record[2..4].try_into().unwrap()),
			offset: u32::from_le_bytes(record[4..8].try_into().unwrap()),
		});
	}
	Ok(records)
}
