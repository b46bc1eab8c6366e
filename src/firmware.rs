//! Firmware image containers and boot-time parameter files.
//!
//! All downloadable files share one header family: a 64-byte boot header
//! (magic cookie first) followed by a 64-byte common header carrying the
//! data region geometry, an MD5 of the whole file, the optional tag list and
//! a CRC32 over both headers. The magic cookie distinguishes firmware,
//! module, option and database files; the toolkit validates the CRC before
//! anything is pushed to a device.

use num_enum::TryFromPrimitive;

use crate::error::{Error, FirmwareError, Result};
use crate::packet::{HEADER_LEN, Packet, PacketHeader};

pub const BOOT_HEADER_LEN: usize = 64;
pub const COMMON_HEADER_LEN: usize = 64;
/// Byte range covered by the common header's CRC32 (both headers, minus the
/// CRC word itself).
const HEADER_CRC_RANGE: usize = BOOT_HEADER_LEN + COMMON_HEADER_LEN - 4;

/// "NETX" signature inside bootable boot headers.
pub const BOOT_SIGNATURE: u32 = 0x5854_454E;
const BOOT_SIGNATURE_OFFSET: usize = 24;

/// Cookie of warmstart parameter files.
pub const WARMSTART_COOKIE: u32 = 0x5741_5253;

/// Magic cookies of the container family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum Cookie {
	/// `.NXF` firmware (plus its parallel-flash width variants).
	Firmware = 0xF8BE_AF00,
	Firmware8 = 0xF8BE_AF08,
	Firmware16 = 0xF8BE_AF16,
	Firmware32 = 0xF8BE_AF32,
	/// `.NXI` communication firmware.
	FirmwareNxi = 0x4958_4E2E,
	/// `.NXE` communication firmware extension.
	FirmwareNxe = 0x4558_4E2E,
	/// `.MXF` maintenance firmware.
	Maintenance = 0x4658_4D2E,
	/// `.NAI` application firmware.
	FirmwareNai = 0x4941_4E2E,
	/// `.NAE` application firmware extension.
	FirmwareNae = 0x4541_4E2E,
	/// `.NXM` module.
	Module = 0x4D58_4E2E,
	/// `.NXO` option module.
	Option = 0x4F58_4E2E,
	/// `.NXD` configuration database.
	Database = 0x4458_4E2E,
}

/// What a container holds, as far as download handling is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
	/// Bootable firmware, downloaded through the system mailbox.
	Firmware,
	/// Loadable module/option, downloaded through a channel mailbox.
	Module,
	/// Configuration database.
	Database,
}

impl Cookie {
	pub fn kind(self) -> ImageKind {
		match self {
			Cookie::Firmware
			| Cookie::Firmware8
			| Cookie::Firmware16
			| Cookie::Firmware32
			| Cookie::FirmwareNxi
			| Cookie::FirmwareNxe
			| Cookie::Maintenance
			| Cookie::FirmwareNai
			| Cookie::FirmwareNae => ImageKind::Firmware,
			Cookie::Module | Cookie::Option => ImageKind::Module,
			Cookie::Database => ImageKind::Database,
		}
	}

	/// Whether the boot header is a real ROM-loader boot block (signature +
	/// additive checksum) rather than reserved space.
	pub fn has_boot_block(self) -> bool {
		matches!(
			self,
			Cookie::Firmware | Cookie::Firmware8 | Cookie::Firmware16 | Cookie::Firmware32
		)
	}
}

/// Decoded common header (V3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommonHeader {
	pub header_version: u32,
	pub header_length: u32,
	pub data_size: u32,
	pub data_start_offset: u32,
	pub module_info_count: u8,
	pub md5: [u8; 16],
	pub tag_list_size: u32,
	pub tag_list_offset: u32,
	pub tag_list_size_max: u32,
	pub common_crc32: u32,
	pub header_crc32: u32,
}

impl CommonHeader {
	fn from_bytes(raw: &[u8; COMMON_HEADER_LEN]) -> Self {
		let u32_at = |o: usize| u32::from_le_bytes(raw[o..o + 4].try_into().unwrap());
		Self {
			header_version: u32_at(0),
			header_length: u32_at(4),
			data_size: u32_at(8),
			data_start_offset: u32_at(12),
			module_info_count: raw[16],
			md5: raw[20..36].try_into().unwrap(),
			tag_list_size: u32_at(36),
			tag_list_offset: u32_at(40),
			tag_list_size_max: u32_at(44),
			common_crc32: u32_at(48),
			header_crc32: u32_at(60),
		}
	}
}

/// A parsed, validated firmware container borrowed from its file bytes.
#[derive(Debug, Clone, Copy)]
pub struct Image<'a> {
	data: &'a [u8],
	pub cookie: Cookie,
	pub common: CommonHeader,
}

impl<'a> Image<'a> {
	/// Parses the headers and validates the header CRC32. The boot block of
	/// bootable `.NXF`-family images is additionally checked for its "NETX"
	/// signature and additive checksum.
	pub fn parse(data: &'a [u8]) -> Result<Self> {
		if data.len() < BOOT_HEADER_LEN + COMMON_HEADER_LEN {
			return Err(FirmwareError::Truncated.into());
		}
		let magic = u32::from_le_bytes(data[0..4].try_into().unwrap());
		let cookie =
			Cookie::try_from(magic).map_err(|_| FirmwareError::UnknownCookie(magic))?;

		let common = CommonHeader::from_bytes(
			data[BOOT_HEADER_LEN..BOOT_HEADER_LEN + COMMON_HEADER_LEN]
				.try_into()
				.unwrap(),
		);
		if crc32fast::hash(&data[..HEADER_CRC_RANGE]) != common.header_crc32 {
			return Err(FirmwareError::HeaderCrc.into());
		}
		if cookie.has_boot_block() {
			validate_boot_block(&data[..BOOT_HEADER_LEN])?;
		}

		let end = common
			.data_start_offset
			.checked_add(common.data_size)
			.map(|end| end as usize);
		if end.is_none_or(|end| end > data.len()) {
			return Err(FirmwareError::Truncated.into());
		}
		Ok(Self { data, cookie, common })
	}

	/// The whole container as pushed to the device.
	pub fn bytes(&self) -> &'a [u8] {
		self.data
	}

	/// The binary data region described by the common header.
	pub fn payload(&self) -> &'a [u8] {
		let start = self.common.data_start_offset as usize;
		&self.data[start..start + self.common.data_size as usize]
	}

	pub fn tag_list(&self) -> Option<&'a [u8]> {
		if self.common.tag_list_size == 0 {
			return None;
		}
		let start = self.common.tag_list_offset as usize;
		let end = start.checked_add(self.common.tag_list_size as usize)?;
		self.data.get(start..end)
	}

	/// Download-cache test: two containers are the same build iff their
	/// embedded MD5 digests agree.
	pub fn same_build(&self, other: &Image<'_>) -> bool {
		self.common.md5 == other.common.md5
	}
}

/// Boot block check for `.NXF`-family images: "NETX" signature plus the
/// additive checksum (the 16 words of the block sum to zero).
fn validate_boot_block(block: &[u8]) -> Result<()> {
	debug_assert_eq!(block.len(), BOOT_HEADER_LEN);
	let signature = u32::from_le_bytes(
		block[BOOT_SIGNATURE_OFFSET..BOOT_SIGNATURE_OFFSET + 4].try_into().unwrap(),
	);
	if signature != BOOT_SIGNATURE {
		return Err(FirmwareError::BootBlockSignature.into());
	}
	let sum = block
		.chunks_exact(4)
		.map(|chunk| u32::from_le_bytes(chunk.try_into().unwrap()))
		.fold(0u32, |acc, word| acc.wrapping_add(word));
	if sum != 0 {
		return Err(FirmwareError::BootBlockChecksum.into());
	}
	Ok(())
}

/// Parses a warmstart parameter file: `{cookie, data_len}` followed by one
/// raw packet that is sent to the device right after boot.
pub fn parse_warmstart(data: &[u8]) -> Result<Packet> {
	if data.len() < 8 + HEADER_LEN {
		return Err(FirmwareError::Warmstart.into());
	}
	let cookie = u32::from_le_bytes(data[0..4].try_into().unwrap());
	if cookie != WARMSTART_COOKIE {
		return Err(FirmwareError::Warmstart.into());
	}
	let data_len = u32::from_le_bytes(data[4..8].try_into().unwrap()) as usize;
	let packet_bytes = data
		.get(8..8 + data_len)
		.ok_or(Error::from(FirmwareError::Warmstart))?;
	let header = PacketHeader::from_bytes(packet_bytes)?;
	let payload = packet_bytes
		.get(HEADER_LEN..HEADER_LEN + header.len as usize)
		.ok_or(Error::from(FirmwareError::Warmstart))?;
	Ok(Packet { header, payload: payload.to_vec() })
}
