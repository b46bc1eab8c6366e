//! Toolkit error taxonomy.
//!
//! Every fallible toolkit operation returns [`Result`]. The application
//! boundary speaks signed 32-bit codes, partitioned into driver-generic
//! (`0x800A_xxxx`), device-access (`0x800C_xxxx`) and firmware-download
//! (`0x800D_xxxx`) groups; [`Error::code`] performs that mapping. Status
//! words reported by the firmware itself pass through verbatim.

use thiserror::Error;

pub type Result<T> = core::result::Result<T, Error>;

/// Failures of the physical DPM access path.
#[derive(Debug, Error)]
pub enum TransportError {
	/// The underlying byte stream (e.g. a spidev ioctl) failed.
	#[error("serial bus: {0}")]
	Bus(#[from] std::io::Error),
	/// The serial DPM status byte was not `0x11` (enabled, unlocked).
	#[error("serial device status {0:#04x} (expected 0x11)")]
	BadStatus(u8),
	/// A transaction returned fewer bytes than requested.
	#[error("short transfer: {got} of {want} bytes")]
	ShortTransfer { want: usize, got: usize },
	/// Offset/length outside the mapped DPM window.
	#[error("access outside the dpm window")]
	OutOfWindow,
}

/// Firmware/bootloader image validation failures.
#[derive(Debug, Error)]
pub enum FirmwareError {
	#[error("unknown magic cookie {0:#010x}")]
	UnknownCookie(u32),
	#[error("file shorter than its header claims")]
	Truncated,
	#[error("common header CRC32 mismatch")]
	HeaderCrc,
	#[error("boot block checksum mismatch")]
	BootBlockChecksum,
	#[error("boot block signature missing")]
	BootBlockSignature,
	#[error("warmstart file malformed")]
	Warmstart,
}

#[derive(Debug, Error)]
pub enum Error {
	#[error("invalid argument: {0}")]
	InvalidArgument(&'static str),
	#[error("unknown or stale handle")]
	InvalidHandle,
	#[error("no such device: {0}")]
	NoSuchDevice(String),
	#[error("no such channel: {0}")]
	NoSuchChannel(u8),
	#[error("device still has open channel handles")]
	DeviceInUse,
	#[error("driver handles still open")]
	DriverInUse,
	#[error("device is not in the running state")]
	NotReady,
	#[error("operation timed out")]
	Timeout,
	#[error(transparent)]
	Transport(#[from] TransportError),
	#[error("protocol violation: {0}")]
	Protocol(&'static str),
	#[error("packet exceeds mailbox capacity")]
	PacketTooLarge,
	#[error("supplied buffer is too small")]
	BufferTooSmall,
	#[error("no packet pending")]
	NoPacket,
	#[error("offset/length outside the process-data area")]
	OutOfBounds,
	#[error("device was removed while waiting")]
	DeviceRemoved,
	#[error("too many unconfirmed request packets")]
	PendingLimit,
	#[error("device boot failed: {0}")]
	BootFailed(&'static str),
	#[error(transparent)]
	Firmware(#[from] FirmwareError),
	#[error("file access: {0}")]
	File(#[from] std::io::Error),
	/// Status from a confirmation packet's `state` field, passed through.
	#[error("device reported status {0:#010x}")]
	DeviceReported(u32),
}

impl Error {
	/// Signed 32-bit code for the application boundary.
	pub fn code(&self) -> i32 {
		let code: u32 = match self {
			Error::InvalidArgument(_) => 0x800A_0001,
			Error::InvalidHandle => 0x800A_0002,
			Error::NoSuchDevice(_) => 0x800A_0003,
			Error::NoSuchChannel(_) => 0x800A_0004,
			Error::BufferTooSmall => 0x800A_0005,
			Error::PendingLimit => 0x800A_0006,
			Error::DeviceInUse => 0x800A_0007,
			Error::DriverInUse => 0x800A_0008,
			Error::NotReady => 0x800C_0001,
			Error::Timeout => 0x800C_0002,
			Error::NoPacket => 0x800C_0003,
			Error::PacketTooLarge => 0x800C_0004,
			Error::Transport(_) => 0x800C_0005,
			Error::Protocol(_) => 0x800C_0006,
			Error::OutOfBounds => 0x800C_0007,
			Error::DeviceRemoved => 0x800C_0008,
			Error::File(_) => 0x800D_0001,
			Error::Firmware(_) => 0x800D_0002,
			Error::BootFailed(_) => 0x800D_0003,
			Error::DeviceReported(state) => *state,
		};
		code as i32
	}
}
