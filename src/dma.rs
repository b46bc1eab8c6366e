//! DMA buffer pool.
//!
//! Up to eight physically contiguous buffers per device, pinned for the
//! device-instance lifetime. Ownership of a slot is carried by its bit in
//! the DMA handshake cell, never by a host lock: the host owns a slot while
//! its host and device bits agree, the device owns it while they differ.
//! A rotation counter keeps `next_ready` fair under saturation.
//!
//! The blocking `claim`/`release` entry points live on the channel handle,
//! which owns the wait machinery; this module keeps the pool bookkeeping and
//! the ownership arithmetic.

use core::ptr::NonNull;

use smallvec::SmallVec;

use crate::config::DMA_SLOTS;
use crate::dpm::handshake::CellSnapshot;
use crate::error::{Error, Result};

/// Purpose a slot was configured for during channel setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DmaMode {
	#[default]
	Unused,
	Input,
	Output,
	Command,
}

/// One pinned, physically contiguous buffer.
pub struct DmaBuffer {
	mode: DmaMode,
	size: u32,
	phys: u64,
	virt: NonNull<u8>,
}

// Pinned device-shared memory; access rights are granted by the handshake
// bit, which the channel operations enforce.
unsafe impl Send for DmaBuffer {}
unsafe impl Sync for DmaBuffer {}

impl DmaBuffer {
	/// # Safety
	///
	/// `virt..virt + size` must be a pinned mapping whose physical range
	/// starts at `phys` and stays valid for the device-instance lifetime.
	pub unsafe fn new(mode: DmaMode, size: u32, phys: u64, virt: NonNull<u8>) -> Self {
		Self { mode, size, phys, virt }
	}

	pub fn mode(&self) -> DmaMode {
		self.mode
	}

	pub fn size(&self) -> u32 {
		self.size
	}

	/// Physical address, as programmed into the device.
	pub fn phys_addr(&self) -> u64 {
		self.phys
	}

	/// Host-side pointer. Only dereference while the host owns the slot.
	pub fn as_ptr(&self) -> *mut u8 {
		self.virt.as_ptr()
	}
}

/// Fixed-capacity pool; the slot index is the only identifier clients see.
#[derive(Default)]
pub struct DmaPool {
	slots: SmallVec<[DmaBuffer; DMA_SLOTS]>,
	rotation: usize,
}

impl DmaPool {
	pub fn new() -> Self {
		Self::default()
	}

	/// Installs the buffers. Slot sizes are fixed from here on; changing
	/// them requires tearing the device down.
	pub fn configure(&mut self, buffers: impl IntoIterator<Item = DmaBuffer>) -> Result<()> {
		let slots: SmallVec<[DmaBuffer; DMA_SLOTS]> = buffers.into_iter().collect();
		if slots.len() > DMA_SLOTS {
			return Err(Error::InvalidArgument("more DMA buffers than slots"));
		}
		self.slots = slots;
		self.rotation = 0;
		Ok(())
	}

	pub fn len(&self) -> usize {
		self.slots.len()
	}

	pub fn is_empty(&self) -> bool {
		self.slots.is_empty()
	}

	pub fn slot(&self, index: usize) -> Result<&DmaBuffer> {
		self.slots.get(index).ok_or(Error::InvalidArgument("DMA slot index"))
	}

	/// Ownership test against an atomically observed cell.
	pub fn host_owns(snapshot: CellSnapshot, index: usize) -> bool {
		!snapshot.signal(index as u8)
	}

	/// Non-blocking probe: the next configured, host-owned slot in rotation
	/// order, advancing the rotation counter past it.
	pub fn next_ready(&mut self, snapshot: CellSnapshot) -> Option<usize> {
		if self.slots.is_empty() {
			return None;
		}
		for step in 0..self.slots.len() {
			let index = (self.rotation + step) % self.slots.len();
			if self.slots[index].mode() != DmaMode::Unused && Self::host_owns(snapshot, index) {
				self.rotation = (index + 1) % self.slots.len();
				return Some(index);
			}
		}
		None
	}
}
