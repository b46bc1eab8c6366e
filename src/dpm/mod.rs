//! Dual-port memory layout: fixed offsets, decoded blocks and flag words.
//!
//! Everything here mirrors the on-wire layout the firmware presents: a
//! 512-byte system channel at offset 0, followed by up to seven further
//! channels whose geometry is announced in the system channel's channel-info
//! blocks. All multi-byte fields are little-endian; decoding is explicit,
//! there is no struct overlay.

pub mod handshake;

use num_enum::TryFromPrimitive;

use crate::error::{Error, Result};

/// ASCII cookie at DPM offset 0 once a firmware is running.
pub const COOKIE: [u8; 4] = *b"netX";
/// The cookie as the little-endian word read at offset 0.
pub const COOKIE_WORD: u32 = u32::from_le_bytes(COOKIE);

/// Magic written to the system control block to request a reset.
pub const RESET_COOKIE: u32 = 0x55AA_55AA;

pub const MAX_CHANNELS: usize = 8;
/// Communication channels start at this channel-info index.
pub const FIRST_COM_CHANNEL: usize = 2;
/// At most six addressable communication/application channels.
pub const MAX_COM_CHANNELS: usize = 6;

pub const SYSTEM_CHANNEL_SIZE: u32 = 512;
pub const HANDSHAKE_CHANNEL_SIZE: u32 = 256;
pub const HANDSHAKE_PAIRS: usize = 16;

/// Data area of one system mailbox (the block itself is 128 bytes).
pub const SYSTEM_MAILBOX_DATA_SIZE: usize = 124;
/// Data area of one channel mailbox (the block itself is 1600 bytes).
pub const CHANNEL_MAILBOX_DATA_SIZE: usize = 1596;

pub const HIGH_PRIO_IO_SIZE: u32 = 64;
pub const IO_DATA_SIZE: u32 = 5760;
pub const IO_DATA_SIZE_8K: u32 = 1536;
pub const EXT_STATUS_SIZE: usize = 432;

/// Offsets within the system channel.
pub mod sys {
	/// System information block (48 bytes) starts the channel.
	pub const INFO_BLOCK: u32 = 0x000;
	pub const COOKIE: u32 = 0x000;
	pub const DPM_TOTAL_SIZE: u32 = 0x004;
	pub const DEVICE_NUMBER: u32 = 0x008;
	pub const SERIAL_NUMBER: u32 = 0x00C;
	/// Eight 16-byte channel information blocks.
	pub const CHANNEL_INFO: u32 = 0x030;
	pub const CHANNEL_INFO_LEN: u32 = 16;
	/// System handshake cell (used when no handshake channel exists).
	pub const HANDSHAKE_CELL: u32 = 0x0B0;
	/// System control block: change-of-state command word (reset cookie).
	pub const CONTROL_COMMAND: u32 = 0x0B8;
	/// System control word (reset mode, netX90/4000 only).
	pub const CONTROL_RESET_MODE: u32 = 0x0BC;
	/// System status block (64 bytes).
	pub const STATUS_BLOCK: u32 = 0x0C0;
	pub const SEND_MAILBOX: u32 = 0x100;
	pub const RECV_MAILBOX: u32 = 0x180;
	/// Packet data starts this far into a mailbox block, after the
	/// packages-accepted/packages-waiting counter.
	pub const MAILBOX_DATA: u32 = 4;
}

/// Offsets within a communication channel (relative to the channel base).
pub mod chan {
	/// Reserved handshake block heading the channel (8 bytes).
	pub const HANDSHAKE_BLOCK: u32 = 0x000;
	/// Control block: application change-of-state word.
	pub const APPLICATION_COS: u32 = 0x008;
	/// Control block: host-written watchdog cell.
	pub const WATCHDOG: u32 = 0x00C;
	/// Common status block (64 bytes).
	pub const COMMON_STATUS: u32 = 0x010;
	pub const COMMUNICATION_COS: u32 = 0x010;
	/// Extended status block (432 bytes).
	pub const EXT_STATUS: u32 = 0x050;
	pub const SEND_MAILBOX: u32 = 0x200;
	pub const RECV_MAILBOX: u32 = 0x840;
	pub const PD1_OUTPUT: u32 = 0xE80;
	pub const PD1_INPUT: u32 = 0xEC0;
	pub const PD0_OUTPUT: u32 = 0x1000;
	pub const MAILBOX_DATA: u32 = 4;
}

/// Geometry of one communication channel inside the DPM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelLayout {
	/// Absolute DPM offset of the channel.
	pub base: u32,
	/// Total channel size in bytes.
	pub size: u32,
	/// Size of the standard process-data areas.
	pub pd0_size: u32,
	/// Channel-relative offset of the standard input area.
	pub pd0_input: u32,
}

impl ChannelLayout {
	/// Default layout for 16-KiB-class DPMs (15616-byte channels).
	pub fn standard(base: u32) -> Self {
		Self {
			base,
			size: 0x3D00,
			pd0_size: IO_DATA_SIZE,
			pd0_input: chan::PD0_OUTPUT + IO_DATA_SIZE,
		}
	}

	/// Layout for 8-KiB DPM hardware with shrunken process-data areas.
	pub fn small(base: u32) -> Self {
		Self {
			base,
			size: 0x1D00,
			pd0_size: IO_DATA_SIZE_8K,
			pd0_input: chan::PD0_OUTPUT + IO_DATA_SIZE_8K,
		}
	}

	pub fn pd0_output(&self) -> u32 {
		chan::PD0_OUTPUT
	}
}

/// Channel classification from the channel-info block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum ChannelKind {
	Undefined = 0,
	NotAvailable = 1,
	Reserved = 2,
	System = 3,
	Handshake = 4,
	Communication = 5,
	Application = 6,
}

/// Handshake cell geometry announced per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePosition {
	/// Cells live at the start of each channel.
	ChannelStart,
	/// Cells live in a dedicated handshake channel.
	DedicatedChannel,
}

/// One decoded 16-byte channel information block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
	pub kind: ChannelKind,
	pub id: u8,
	pub handshake_width: Option<handshake::CellWidth>,
	pub handshake_position: HandshakePosition,
	pub block_count: u8,
	pub size: u32,
	/// Mailbox geometry (communication channels announce it explicitly).
	pub mailbox_size: u16,
	pub mailbox_offset: u16,
	pub communication_class: u16,
	pub protocol_class: u16,
}

impl ChannelInfo {
	pub fn from_bytes(raw: &[u8; 16]) -> Result<Self> {
		let kind = ChannelKind::try_from(raw[0])
			.map_err(|_| Error::Protocol("unknown channel type in channel info block"))?;
		let hsk = raw[2];
		let handshake_width = match hsk & 0x0F {
			0x00 => None,
			0x01 => Some(handshake::CellWidth::Bits8),
			0x02 => Some(handshake::CellWidth::Bits16),
			_ => return Err(Error::Protocol("unknown handshake cell width")),
		};
		let handshake_position = if hsk & 0xF0 == 0x10 {
			HandshakePosition::DedicatedChannel
		} else {
			HandshakePosition::ChannelStart
		};
		Ok(Self {
			kind,
			id: raw[1],
			handshake_width,
			handshake_position,
			block_count: raw[3],
			size: u32::from_le_bytes(raw[4..8].try_into().unwrap()),
			mailbox_size: u16::from_le_bytes(raw[8..10].try_into().unwrap()),
			mailbox_offset: u16::from_le_bytes(raw[10..12].try_into().unwrap()),
			communication_class: u16::from_le_bytes(raw[8..10].try_into().unwrap()),
			protocol_class: u16::from_le_bytes(raw[10..12].try_into().unwrap()),
		})
	}
}

/// Decoded system information block (48 bytes at DPM offset 0).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SystemInfoBlock {
	pub cookie: [u8; 4],
	pub dpm_total_size: u32,
	pub device_number: u32,
	pub serial_number: u32,
	pub hw_options: [u16; 4],
	pub manufacturer: u16,
	pub production_date: u16,
	pub license_flags1: u32,
	pub license_flags2: u32,
	pub license_id: u16,
	pub license_flags: u16,
	pub device_class: u16,
	pub hw_revision: u8,
	pub hw_compatibility: u8,
	pub slot_id: u8,
}

impl SystemInfoBlock {
	pub const LEN: usize = 48;

	pub fn from_bytes(raw: &[u8; Self::LEN]) -> Self {
		let u16_at = |o: usize| u16::from_le_bytes(raw[o..o + 2].try_into().unwrap());
		let u32_at = |o: usize| u32::from_le_bytes(raw[o..o + 4].try_into().unwrap());
		Self {
			cookie: raw[0..4].try_into().unwrap(),
			dpm_total_size: u32_at(4),
			device_number: u32_at(8),
			serial_number: u32_at(12),
			hw_options: [u16_at(16), u16_at(18), u16_at(20), u16_at(22)],
			manufacturer: u16_at(24),
			production_date: u16_at(26),
			license_flags1: u32_at(28),
			license_flags2: u32_at(32),
			license_id: u16_at(36),
			license_flags: u16_at(38),
			device_class: u16_at(40),
			hw_revision: raw[42],
			hw_compatibility: raw[43],
			slot_id: raw[44],
		}
	}

	pub fn cookie_valid(&self) -> bool {
		self.cookie == COOKIE
	}
}

bitflags! {
	/// System status word of the system status block.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct SystemStatus: u32 {
		const OK = 0x0000_0001;
		const BOOTMEDIUM_SERFLASH = 0x0100_0000;
		const BOOTMEDIUM_PARFLASH = 0x0200_0000;
		const NO_SYSVOLUME = 0x2000_0000;
		const NXO_SUPPORTED = 0x8000_0000;
	}
}

/// Decoded system status block (64 bytes, leading fields).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SystemStatusBlock {
	pub system_cos: u32,
	pub system_status: u32,
	pub system_error: u32,
	pub boot_error: u32,
	pub time_since_start: u32,
	/// CPU load in 0.01 % units (10000 = 100 %).
	pub cpu_load: u16,
	pub hw_features: u32,
}

impl SystemStatusBlock {
	pub const LEN: usize = 64;

	pub fn from_bytes(raw: &[u8; Self::LEN]) -> Self {
		let u32_at = |o: usize| u32::from_le_bytes(raw[o..o + 4].try_into().unwrap());
		Self {
			system_cos: u32_at(0),
			system_status: u32_at(4),
			system_error: u32_at(8),
			boot_error: u32_at(12),
			time_since_start: u32_at(16),
			cpu_load: u16::from_le_bytes(raw[20..22].try_into().unwrap()),
			hw_features: u32_at(24),
		}
	}
}

/// Cyclic I/O handshake discipline of one data direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, TryFromPrimitive)]
#[repr(u8)]
pub enum IoMode {
	/// Compatibility alias for buffered host-controlled.
	#[default]
	Default = 0x00,
	BufferedDeviceControlled = 0x02,
	Uncontrolled = 0x03,
	BufferedHostControlled = 0x04,
}

impl IoMode {
	pub fn is_handshaked(self) -> bool {
		self != IoMode::Uncontrolled
	}
}

bitflags! {
	/// Application change-of-state word (channel control block).
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
	pub struct AppCos: u32 {
		const APPLICATION_READY = 0x0000_0001;
		const BUS_ON = 0x0000_0002;
		const BUS_ON_ENABLE = 0x0000_0004;
		const INITIALIZATION = 0x0000_0008;
		const INITIALIZATION_ENABLE = 0x0000_0010;
		const LOCK_CONFIGURATION = 0x0000_0020;
		const LOCK_CONFIGURATION_ENABLE = 0x0000_0040;
		const DMA = 0x0000_0080;
		const DMA_ENABLE = 0x0000_0100;
	}
}

bitflags! {
	/// Communication change-of-state word (common status block).
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
	pub struct CommCos: u32 {
		const READY = 0x0000_0001;
		const RUN = 0x0000_0002;
		const BUS_ON = 0x0000_0004;
		const CONFIG_LOCKED = 0x0000_0008;
		const CONFIG_NEW = 0x0000_0010;
		const RESTART_REQUIRED = 0x0000_0020;
		const RESTART_REQUIRED_ENABLE = 0x0000_0040;
	}
}

/// Decoded common status block of a communication channel (64 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommonStatusBlock {
	pub communication_cos: u32,
	pub communication_state: u32,
	pub communication_error: u32,
	pub version: u16,
	pub watchdog_time: u16,
	pub pd_in_mode: IoMode,
	pub pd_out_mode: IoMode,
	pub host_watchdog: u32,
	pub error_count: u32,
	pub error_log_count: u8,
	pub error_pd_in_count: u8,
	pub error_pd_out_count: u8,
	pub error_sync_count: u8,
	pub sync_mode: u8,
	pub sync_source: u8,
}

impl CommonStatusBlock {
	pub const LEN: usize = 64;

	pub fn from_bytes(raw: &[u8; Self::LEN]) -> Self {
		let u16_at = |o: usize| u16::from_le_bytes(raw[o..o + 2].try_into().unwrap());
		let u32_at = |o: usize| u32::from_le_bytes(raw[o..o + 4].try_into().unwrap());
		Self {
			communication_cos: u32_at(0),
			communication_state: u32_at(4),
			communication_error: u32_at(8),
			version: u16_at(12),
			watchdog_time: u16_at(14),
			pd_in_mode: IoMode::try_from(raw[16]).unwrap_or_default(),
			pd_out_mode: IoMode::try_from(raw[18]).unwrap_or_default(),
			host_watchdog: u32_at(20),
			error_count: u32_at(24),
			error_log_count: raw[28],
			error_pd_in_count: raw[29],
			error_pd_out_count: raw[30],
			error_sync_count: raw[31],
			sync_mode: raw[32],
			sync_source: raw[33],
		}
	}
}
