//! Chip classification from DPM cookies.
//!
//! A freshly reset chip presents its ROM loader, which identifies itself
//! with the `NXBL` word at offset 0x100 and a chip version word in the DPM
//! configuration area. A flash-booted chip comes up with running firmware
//! instead, recognisable by the `netX` cookie at offset 0. The exact
//! placement of the version word and which step bits to ignore differ per
//! chip step, so both stay configurable.

use crate::dpm;
use crate::error::Result;
use crate::transport::{DpmAccess, Transport};

/// `NXBL` — ROM loader DPM identifier.
pub const ROM_COOKIE: u32 = 0x4C42_584E;
/// DPM offset of the ROM loader identifier.
pub const ROM_COOKIE_OFFSET: u32 = 0x100;

/// Chip version cookies in the DPM configuration area.
pub const NETX90_VERSION_COOKIE: u32 = 0x0900_000D;
pub const NETX4000_VERSION_COOKIE: u32 = 0x8452_4C0B;
pub const NETX4100_VERSION_COOKIE: u32 = 0x9361_5B0B;

/// netX90 version word bits that vary with chip variant and ROM step.
pub const MSK_NETX90_TYPE: u32 = 0x00FF_0000;
pub const MSK_NETX90_ROMSTEP: u32 = 0x0000_FF00;

/// Default offset of the version word in the ROM loader's DPM configuration
/// area.
pub const VERSION_WORD_OFFSET: u32 = 0xFC;

/// Concrete chip variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChipType {
	Netx100,
	Netx50,
	Netx51,
	Netx52,
	Netx90,
	Netx4000,
	Netx4100,
}

/// The four major families, which drive bootloader selection and signal
/// layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChipFamily {
	/// netX100/500: second-stage bootloader downloaded through the DPM.
	Netx100,
	/// netX50/51/52: ROM loader (hboot) mailbox protocol.
	Netx50,
	/// netX90: flash-resident firmware.
	Netx90,
	/// netX4000/4100: flash-resident firmware.
	Netx4000,
}

impl ChipType {
	pub fn family(self) -> ChipFamily {
		match self {
			ChipType::Netx100 => ChipFamily::Netx100,
			ChipType::Netx50 | ChipType::Netx51 | ChipType::Netx52 => ChipFamily::Netx50,
			ChipType::Netx90 => ChipFamily::Netx90,
			ChipType::Netx4000 | ChipType::Netx4100 => ChipFamily::Netx4000,
		}
	}

	/// Flash-based families keep their firmware across resets; the download
	/// stage is skipped when an image is already resident.
	pub fn is_flash_based(self) -> bool {
		matches!(self.family(), ChipFamily::Netx90 | ChipFamily::Netx4000)
	}
}

/// Tunables for chip-step differences.
#[derive(Debug, Clone, Copy)]
pub struct DetectConfig {
	/// Bits of the netX90 version word to ignore when comparing cookies.
	pub step_mask: u32,
	/// Offset of the chip version word in the DPM configuration area.
	pub version_offset: u32,
}

impl Default for DetectConfig {
	fn default() -> Self {
		Self {
			step_mask: MSK_NETX90_TYPE | MSK_NETX90_ROMSTEP,
			version_offset: VERSION_WORD_OFFSET,
		}
	}
}

/// What the DPM currently presents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detection {
	/// A firmware is up (`netX` cookie at offset 0).
	RunningFirmware,
	/// The ROM loader answered and identified the chip.
	RomLoader(ChipType),
	/// Nothing recognisable; the chip may still be starting up.
	Unknown,
}

/// Single classification pass over the DPM.
pub fn probe(transport: &mut Transport, config: &DetectConfig) -> Result<Detection> {
	let first = transport.read_u32(0)?;
	if first == dpm::COOKIE_WORD {
		return Ok(Detection::RunningFirmware);
	}

	if transport.read_u32(ROM_COOKIE_OFFSET)? == ROM_COOKIE {
		let version = transport.read_u32(config.version_offset)?;
		let masked = version & !config.step_mask;
		let chip = if masked == NETX90_VERSION_COOKIE & !config.step_mask {
			Some(ChipType::Netx90)
		} else if version == NETX4000_VERSION_COOKIE {
			Some(ChipType::Netx4000)
		} else if version == NETX4100_VERSION_COOKIE {
			Some(ChipType::Netx4100)
		} else {
			// ROM loader without a known version word: a netX50-class chip
			// waiting for its bootloader.
			None
		};
		return Ok(Detection::RomLoader(chip.unwrap_or(ChipType::Netx50)));
	}

	Ok(Detection::Unknown)
}
