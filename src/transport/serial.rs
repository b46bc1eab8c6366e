//! Serial (SPI-framed) DPM attachment.
//!
//! Every DPM access becomes a command-framed transaction on a full-duplex
//! byte stream: a read is a 4-byte header `{0x80 | addr[19:16], addr[15:8],
//! addr[7:0], 0}` clocked out while the device answers with its status byte
//! followed by the requested data; a write is a 3-byte header without the
//! trailing pad, followed by the payload. The first byte the device returns
//! must read `0x11` (serial DPM enabled and unlocked) for the transaction to
//! count.
//!
//! After a chip reset the serial DPM returns garbage until a dummy-read
//! sequence of two transactions has run; [`SerialTransport::resync`] performs
//! it and must succeed before any other access is trusted.

use std::io;

use crate::config::SERIAL_CHUNK_SIZE;
use crate::error::{Error, Result, TransportError};
use crate::transport::{AccessFlags, DpmAccess};

/// Serial DPM status byte meaning "enabled, unlocked".
const STATUS_OK: u8 = 0x11;

/// Address of the dummy-read target (top of the serial address space).
const DUMMY_READ_ADDR: u32 = 0x0F_FFFC;

const READ_HEADER_LEN: usize = 4;
const WRITE_HEADER_LEN: usize = 3;

/// A full-duplex byte stream to a serially attached device, e.g. a spidev
/// ioctl wrapper. Implementations must clock out `buf` and overwrite it with
/// the bytes received during the same transaction, and must bound each call
/// (kernel transfer timeouts).
pub trait SerialBus: Send {
	fn transfer(&mut self, buf: &mut [u8]) -> io::Result<()>;
}

/// DPM access through a [`SerialBus`], with transparent chunking.
pub struct SerialTransport {
	bus: Box<dyn SerialBus>,
	dpm_len: usize,
	chunk_size: usize,
	scratch: Vec<u8>,
	synced: bool,
}

impl SerialTransport {
	pub fn new(bus: Box<dyn SerialBus>, dpm_len: usize) -> Self {
		Self::with_chunk_size(bus, dpm_len, SERIAL_CHUNK_SIZE)
	}

	pub fn with_chunk_size(bus: Box<dyn SerialBus>, dpm_len: usize, chunk_size: usize) -> Self {
		assert!(chunk_size > 0);
		Self {
			bus,
			dpm_len,
			chunk_size,
			scratch: Vec::new(),
			synced: false,
		}
	}

	/// Dummy-read bring-up: two transactions against the top of the address
	/// space. The first answer is undefined and discarded, the second must
	/// carry the `0x11` status byte.
	pub fn resync(&mut self) -> Result<()> {
		self.synced = false;
		for attempt in 0..2 {
			let mut buf = [0u8; 8];
			buf[0] = 0x80 | ((DUMMY_READ_ADDR >> 16) as u8 & 0x0F);
			buf[1] = (DUMMY_READ_ADDR >> 8) as u8;
			buf[2] = DUMMY_READ_ADDR as u8;
			self.bus.transfer(&mut buf).map_err(TransportError::Bus)?;
			if attempt == 0 {
				// First result after reset is not valid.
				continue;
			}
			if buf[0] != STATUS_OK {
				warn!("serial DPM not ready, status byte {:#04x}", buf[0]);
				return Err(TransportError::BadStatus(buf[0]).into());
			}
		}
		debug!("serial DPM synchronised");
		self.synced = true;
		Ok(())
	}

	fn check(&self, offset: u32, len: usize) -> Result<()> {
		if !self.synced {
			return Err(Error::Protocol("serial DPM accessed before resync"));
		}
		match (offset as usize).checked_add(len) {
			Some(end) if end <= self.dpm_len => Ok(()),
			_ => Err(TransportError::OutOfWindow.into()),
		}
	}

	fn read_chunk(&mut self, addr: u32, dst: &mut [u8]) -> Result<()> {
		let total = READ_HEADER_LEN + dst.len();
		self.scratch.clear();
		self.scratch.resize(total, 0);
		self.scratch[0] = 0x80 | ((addr >> 16) as u8 & 0x0F);
		self.scratch[1] = (addr >> 8) as u8;
		self.scratch[2] = addr as u8;
		self.scratch[3] = 0;
		self.bus.transfer(&mut self.scratch).map_err(TransportError::Bus)?;
		if self.scratch[0] != STATUS_OK {
			self.synced = false;
			return Err(TransportError::BadStatus(self.scratch[0]).into());
		}
		dst.copy_from_slice(&self.scratch[READ_HEADER_LEN..]);
		Ok(())
	}

	fn write_chunk(&mut self, addr: u32, src: &[u8]) -> Result<()> {
		let total = WRITE_HEADER_LEN + src.len();
		self.scratch.clear();
		self.scratch.resize(total, 0);
		self.scratch[0] = (addr >> 16) as u8 & 0x0F;
		self.scratch[1] = (addr >> 8) as u8;
		self.scratch[2] = addr as u8;
		self.scratch[WRITE_HEADER_LEN..].copy_from_slice(src);
		self.bus.transfer(&mut self.scratch).map_err(TransportError::Bus)?;
		if self.scratch[0] != STATUS_OK {
			self.synced = false;
			return Err(TransportError::BadStatus(self.scratch[0]).into());
		}
		Ok(())
	}
}

impl DpmAccess for SerialTransport {
	fn read(&mut self, offset: u32, dst: &mut [u8], _flags: AccessFlags) -> Result<()> {
		self.check(offset, dst.len())?;
		let chunk = self.chunk_size;
		let mut pos = 0usize;
		// A failure mid-chunk fails the whole operation.
		while pos < dst.len() {
			let take = chunk.min(dst.len() - pos);
			let addr = offset + pos as u32;
			self.read_chunk(addr, &mut dst[pos..pos + take])?;
			pos += take;
		}
		Ok(())
	}

	fn write(&mut self, offset: u32, src: &[u8], _flags: AccessFlags) -> Result<()> {
		self.check(offset, src.len())?;
		let chunk = self.chunk_size;
		let mut pos = 0usize;
		while pos < src.len() {
			let take = chunk.min(src.len() - pos);
			let addr = offset + pos as u32;
			self.write_chunk(addr, &src[pos..pos + take])?;
			pos += take;
		}
		Ok(())
	}

	fn read_u8(&mut self, offset: u32) -> Result<u8> {
		let mut buf = [0u8; 1];
		self.read(offset, &mut buf, AccessFlags::empty())?;
		Ok(buf[0])
	}

	fn write_u8(&mut self, offset: u32, value: u8) -> Result<()> {
		self.write(offset, &[value], AccessFlags::empty())
	}

	fn read_u16(&mut self, offset: u32) -> Result<u16> {
		let mut buf = [0u8; 2];
		self.read(offset, &mut buf, AccessFlags::empty())?;
		Ok(u16::from_le_bytes(buf))
	}

	fn write_u16(&mut self, offset: u32, value: u16) -> Result<()> {
		self.write(offset, &value.to_le_bytes(), AccessFlags::empty())
	}

	fn read_u32(&mut self, offset: u32) -> Result<u32> {
		let mut buf = [0u8; 4];
		self.read(offset, &mut buf, AccessFlags::empty())?;
		Ok(u32::from_le_bytes(buf))
	}

	fn write_u32(&mut self, offset: u32, value: u32) -> Result<()> {
		self.write(offset, &value.to_le_bytes(), AccessFlags::empty())
	}

	fn window_len(&self) -> usize {
		self.dpm_len
	}
}
