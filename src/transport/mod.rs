//! Uniform access to the dual-port memory, independent of the physical path.
//!
//! Three access methods exist: plain memory-mapped windows, memory-mapped
//! windows that only tolerate aligned 32-bit bus cycles, and serial
//! (SPI-framed) attachment where every access becomes a command-framed
//! transaction on a byte stream. All of them present the same byte-window
//! interface; higher layers never know which one they are talking through.
//!
//! Concurrent operations against one device are serialized by the device's
//! transport lock; no locking happens here.

mod serial;

pub use self::serial::{SerialBus, SerialTransport};

use enum_dispatch::enum_dispatch;

use crate::error::{Result, TransportError};
use crate::mem::DpmWindow;

bitflags! {
	/// Access annotations for future use (prefetch hints, cache behaviour).
	/// Transports are free to ignore them.
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
	pub struct AccessFlags: u32 {
		const PREFETCH = 0b0000_0001;
		const UNCACHED = 0b0000_0010;
	}
}

/// The uniform DPM access interface.
///
/// Multi-byte accessors convert from the little-endian wire format to host
/// order. `read_u32`/`write_u32` are single bus accesses on memory-mapped
/// transports; the handshake engine depends on that for cell atomicity.
#[enum_dispatch]
pub trait DpmAccess {
	fn read(&mut self, offset: u32, dst: &mut [u8], flags: AccessFlags) -> Result<()>;
	fn write(&mut self, offset: u32, src: &[u8], flags: AccessFlags) -> Result<()>;
	fn read_u8(&mut self, offset: u32) -> Result<u8>;
	fn write_u8(&mut self, offset: u32, value: u8) -> Result<()>;
	fn read_u16(&mut self, offset: u32) -> Result<u16>;
	fn write_u16(&mut self, offset: u32, value: u16) -> Result<()>;
	fn read_u32(&mut self, offset: u32) -> Result<u32>;
	fn write_u32(&mut self, offset: u32, value: u32) -> Result<()>;
	/// Length of the reachable DPM window in bytes.
	fn window_len(&self) -> usize;
}

/// Tagged sum over the physical access methods.
#[enum_dispatch(DpmAccess)]
pub enum Transport {
	Mmio(MmioTransport),
	MmioAligned(AlignedMmioTransport),
	Serial(SerialTransport),
}

impl Transport {
	pub fn mmio(window: DpmWindow) -> Self {
		Transport::Mmio(MmioTransport { window })
	}

	pub fn mmio_aligned(window: DpmWindow) -> Self {
		Transport::MmioAligned(AlignedMmioTransport { window })
	}

	pub fn serial(bus: Box<dyn SerialBus>, dpm_len: usize) -> Self {
		Transport::Serial(SerialTransport::new(bus, dpm_len))
	}

	/// Post-reset resynchronisation, a no-op except on serial transports
	/// (which need their dummy-read sequence before the DPM is trusted).
	pub fn resync(&mut self) -> Result<()> {
		match self {
			Transport::Serial(serial) => serial.resync(),
			_ => Ok(()),
		}
	}
}

/// Plain memory-mapped DPM. Reads and writes are volatile memory copies,
/// coalesced into aligned words where possible.
pub struct MmioTransport {
	window: DpmWindow,
}

impl DpmAccess for MmioTransport {
	fn read(&mut self, offset: u32, dst: &mut [u8], _flags: AccessFlags) -> Result<()> {
		Ok(self.window.read(offset, dst)?)
	}

	fn write(&mut self, offset: u32, src: &[u8], _flags: AccessFlags) -> Result<()> {
		Ok(self.window.write(offset, src)?)
	}

	fn read_u8(&mut self, offset: u32) -> Result<u8> {
		Ok(self.window.read_u8(offset)?)
	}

	fn write_u8(&mut self, offset: u32, value: u8) -> Result<()> {
		Ok(self.window.write_u8(offset, value)?)
	}

	fn read_u16(&mut self, offset: u32) -> Result<u16> {
		Ok(self.window.read_u16(offset)?)
	}

	fn write_u16(&mut self, offset: u32, value: u16) -> Result<()> {
		Ok(self.window.write_u16(offset, value)?)
	}

	fn read_u32(&mut self, offset: u32) -> Result<u32> {
		Ok(self.window.read_u32(offset)?)
	}

	fn write_u32(&mut self, offset: u32, value: u32) -> Result<()> {
		Ok(self.window.write_u32(offset, value)?)
	}

	fn window_len(&self) -> usize {
		self.window.len()
	}
}

/// Memory-mapped DPM behind a bridge that only supports aligned 32-bit bus
/// cycles. Narrow reads extract from the containing word, narrow writes
/// read-modify-write it.
pub struct AlignedMmioTransport {
	window: DpmWindow,
}

impl AlignedMmioTransport {
	fn word_of(&self, offset: u32) -> Result<(u32, u32)> {
		let word_offset = offset & !3;
		let word = self.window.read_u32(word_offset)?;
		Ok((word_offset, word))
	}
}

impl DpmAccess for AlignedMmioTransport {
	fn read(&mut self, offset: u32, dst: &mut [u8], _flags: AccessFlags) -> Result<()> {
		if (offset as usize).checked_add(dst.len()).is_none_or(|end| end > self.window.len()) {
			return Err(TransportError::OutOfWindow.into());
		}
		let mut pos = 0usize;
		while pos < dst.len() {
			let addr = offset + pos as u32;
			let (word_offset, word) = self.word_of(addr)?;
			let in_word = (addr - word_offset) as usize;
			let take = (4 - in_word).min(dst.len() - pos);
			dst[pos..pos + take]
				.copy_from_slice(&word.to_le_bytes()[in_word..in_word + take]);
			pos += take;
		}
		Ok(())
	}

	fn write(&mut self, offset: u32, src: &[u8], _flags: AccessFlags) -> Result<()> {
		if (offset as usize).checked_add(src.len()).is_none_or(|end| end > self.window.len()) {
			return Err(TransportError::OutOfWindow.into());
		}
		let mut pos = 0usize;
		while pos < src.len() {
			let addr = offset + pos as u32;
			let word_offset = addr & !3;
			let in_word = (addr - word_offset) as usize;
			let take = (4 - in_word).min(src.len() - pos);
			let mut bytes = if in_word == 0 && take == 4 {
				[0u8; 4]
			} else {
				self.window.read_u32(word_offset)?.to_le_bytes()
			};
			bytes[in_word..in_word + take].copy_from_slice(&src[pos..pos + take]);
			self.window.write_u32(word_offset, u32::from_le_bytes(bytes))?;
			pos += take;
		}
		Ok(())
	}

	fn read_u8(&mut self, offset: u32) -> Result<u8> {
		let (word_offset, word) = self.word_of(offset)?;
		Ok(word.to_le_bytes()[(offset - word_offset) as usize])
	}

	fn write_u8(&mut self, offset: u32, value: u8) -> Result<()> {
		self.write(offset, &[value], AccessFlags::empty())
	}

	fn read_u16(&mut self, offset: u32) -> Result<u16> {
		debug_assert_eq!(offset % 2, 0);
		let (word_offset, word) = self.word_of(offset)?;
		let bytes = word.to_le_bytes();
		let in_word = (offset - word_offset) as usize;
		Ok(u16::from_le_bytes([bytes[in_word], bytes[in_word + 1]]))
	}

	fn write_u16(&mut self, offset: u32, value: u16) -> Result<()> {
		debug_assert_eq!(offset % 2, 0);
		self.write(offset, &value.to_le_bytes(), AccessFlags::empty())
	}

	fn read_u32(&mut self, offset: u32) -> Result<u32> {
		Ok(self.window.read_u32(offset)?)
	}

	fn write_u32(&mut self, offset: u32, value: u32) -> Result<()> {
		Ok(self.window.write_u32(offset, value)?)
	}

	fn window_len(&self) -> usize {
		self.window.len()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::mem::tests::leaked_window;

	#[test]
	fn aligned_transport_narrow_writes_preserve_neighbours() {
		let mut t = Transport::mmio_aligned(leaked_window(32));
		t.write_u32(0, 0xAABB_CCDD).unwrap();
		t.write_u8(1, 0x11).unwrap();
		assert_eq!(t.read_u32(0).unwrap(), 0xAABB_11DD);
		t.write_u16(2, 0x2233).unwrap();
		assert_eq!(t.read_u32(0).unwrap(), 0x2233_11DD);
	}

	#[test]
	fn aligned_transport_unaligned_bulk_roundtrip() {
		let mut t = Transport::mmio_aligned(leaked_window(64));
		let pattern: Vec<u8> = (0u8..31).collect();
		t.write(5, &pattern, AccessFlags::empty()).unwrap();
		let mut back = vec![0u8; 31];
		t.read(5, &mut back, AccessFlags::empty()).unwrap();
		assert_eq!(back, pattern);
	}

	#[test]
	fn mmio_and_aligned_agree() {
		let win_a = leaked_window(64);
		let win_b = leaked_window(64);
		let mut a = Transport::mmio(win_a);
		let mut b = Transport::mmio_aligned(win_b);
		let data = *b"handshake cell payload";
		a.write(7, &data, AccessFlags::empty()).unwrap();
		b.write(7, &data, AccessFlags::empty()).unwrap();
		let mut out_a = [0u8; 22];
		let mut out_b = [0u8; 22];
		a.read(7, &mut out_a, AccessFlags::empty()).unwrap();
		b.read(7, &mut out_b, AccessFlags::empty()).unwrap();
		assert_eq!(out_a, out_b);
	}
}
