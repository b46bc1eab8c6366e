//! Boot orchestration: reset, ROM-loader downloads, ready handshake.
//!
//! The ROM loader exposes a minimal 128-byte mailbox with an 8-bit
//! handshake cell, distinct from the channel mailboxes: the host puts a
//! chunk, toggles its bit, the loader consumes and counter-toggles. After
//! the last chunk the loader answers with a one-byte result through the
//! to-host mailbox.

use std::time::{Duration, Instant};

use super::detect::{self, ChipFamily, Detection};
use super::{BootImages, DeviceInstance, LifecycleEvent, LifecycleState, ResetMode};
use crate::config::{DOWNLOAD_CHUNK_TIMEOUT, MAILBOX_TIMEOUT, POLL_STEP, STARTUP_TIMEOUT};
use crate::dpm::handshake::{self, CellLocation, CellWidth, Event, SignalState};
use crate::dpm::{self, RESET_COOKIE};
use crate::error::{Error, Result};
use crate::firmware::{Image, ImageKind};
use crate::packet::HEADER_LEN;
use crate::transport::{AccessFlags, DpmAccess};

/// ROM-loader mailbox geometry, public so test benches can emulate the
/// loader side. The handshake bits mirror the loader's send/receive command
/// bits; the data areas sit clear of the `NXBL` identifier and the version
/// word.
pub const ROM_CELL: CellLocation = CellLocation { offset: 0x08, width: CellWidth::Bits8 };
pub const ROM_TO_NETX_BIT: u8 = 0;
pub const ROM_TO_HOST_BIT: u8 = 1;
pub const ROM_TO_NETX_LEN: u32 = 0x200;
pub const ROM_TO_NETX_DATA: u32 = 0x204;
pub const ROM_TO_HOST_LEN: u32 = 0x300;
pub const ROM_TO_HOST_DATA: u32 = 0x304;
pub const ROM_MAILBOX_SIZE: usize = 128;

impl DeviceInstance {
	/// Full bring-up: reset, chip detection, staged download, ready
	/// handshake, identity harvest, channel enumeration.
	pub fn start(&self, images: &BootImages) -> Result<()> {
		if self.is_removed() {
			return Err(Error::DeviceRemoved);
		}
		self.set_state(LifecycleState::Detecting);
		// Serial transports need their bring-up sequence before the first
		// access; memory-mapped ones ignore this.
		self.transport().resync()?;

		self.notify_event(LifecycleEvent::PreReset);
		self.raw_reset(ResetMode::ColdStart)?;
		self.notify_event(LifecycleEvent::PostReset);
		self.transport().resync()?;

		let detection = self.await_detection(STARTUP_TIMEOUT)?;
		match detection {
			Detection::RunningFirmware => {
				// Flash-resident firmware came straight back up; the
				// download cache treats a same-build image as satisfied.
				debug!("device {}: firmware resident, skipping download", self.name());
				if let Ok(image) = select_firmware(&images.firmware) {
					let mut resident = self.resident_firmware.lock().unwrap();
					if resident.is_none() || *resident == Some(image.common.md5) {
						*resident = Some(image.common.md5);
					} else {
						warn!(
							"device {}: supplied firmware differs from the resident build",
							self.name()
						);
					}
				}
			}
			Detection::RomLoader(chip) => {
				*self.chip.lock().unwrap() = Some(chip);
				info!("device {}: {chip:?} ROM loader answered", self.name());
				self.stage_images(chip.family(), images)?;
			}
			Detection::Unknown => {
				self.set_state(LifecycleState::Faulted);
				return Err(Error::BootFailed("no bootloader identifier after reset"));
			}
		}

		self.set_state(LifecycleState::FirmwareStaging);
		self.await_ready(STARTUP_TIMEOUT)?;
		self.finish_startup()?;

		if let Some(warmstart) = &images.warmstart {
			self.send_warmstart(warmstart)?;
		}
		Ok(())
	}

	/// Reset from `Running`: pulse the reset cookie and re-run the ready
	/// handshake. Interrupts are masked for the duration.
	pub fn reset(&self, mode: ResetMode) -> Result<()> {
		if self.is_removed() {
			return Err(Error::DeviceRemoved);
		}
		let serial_before = self.identity().map(|identity| identity.serial_number);

		self.notify_event(LifecycleEvent::PreReset);
		self.raw_reset(mode)?;
		self.notify_event(LifecycleEvent::PostReset);
		self.transport().resync()?;

		self.await_ready(STARTUP_TIMEOUT)?;
		self.finish_startup()?;

		if let (Some(before), Some(after)) =
			(serial_before, self.identity().map(|identity| identity.serial_number))
			&& before != after
		{
			warn!(
				"device {}: serial number changed across reset ({before} -> {after})",
				self.name()
			);
		}
		Ok(())
	}

	/// Restart without the firmware staging stage (used by the registry's
	/// `restart_device`).
	pub fn restart(&self) -> Result<()> {
		self.reset(ResetMode::ColdStart)
	}

	fn raw_reset(&self, mode: ResetMode) -> Result<()> {
		self.irq_masked.store(true, std::sync::atomic::Ordering::Release);
		self.set_state(LifecycleState::Resetting);
		let sys_cell = self.sys_cell();
		{
			let mut transport = self.transport();
			transport.write_u32(dpm::sys::CONTROL_RESET_MODE, mode as u32)?;
			transport.write_u32(dpm::sys::CONTROL_COMMAND, RESET_COOKIE)?;
			handshake::toggle_host_flags(
				&mut transport,
				sys_cell,
				1 << handshake::SYS_RESET_BIT,
			)?;
		}
		// Cell contents are void across the reset.
		self.sys_last_cell.store(0, std::sync::atomic::Ordering::Release);
		debug!("device {}: reset pulsed ({mode:?})", self.name());
		Ok(())
	}

	/// Polls the DPM until the chip shows either its ROM loader or a
	/// running firmware.
	fn await_detection(&self, timeout: Duration) -> Result<Detection> {
		let deadline = Instant::now() + timeout;
		loop {
			let detection = detect::probe(&mut self.transport(), &self.detect_config)?;
			if detection != Detection::Unknown {
				return Ok(detection);
			}
			if Instant::now() >= deadline {
				return Ok(Detection::Unknown);
			}
			if self.is_removed() {
				return Err(Error::DeviceRemoved);
			}
			std::thread::sleep(POLL_STEP * 10);
		}
	}

	/// Downloads bootloader and firmware as the chip family requires. The
	/// reset wiped any RAM-resident image, so this always transfers; the
	/// download cache only applies to firmware that survived in flash.
	fn stage_images(&self, family: ChipFamily, images: &BootImages) -> Result<()> {
		let firmware = select_firmware(&images.firmware)?;

		match family {
			ChipFamily::Netx50 | ChipFamily::Netx100 => {
				self.set_state(LifecycleState::BootloaderStaging);
				let bootloader = images
					.bootloader
					.as_deref()
					.ok_or(Error::BootFailed("chip requires a bootloader image"))?;
				let bootloader = Image::parse(bootloader)?;
				self.notify_event(LifecycleEvent::PreBootloader);
				self.rom_download(bootloader.bytes())?;
				self.notify_event(LifecycleEvent::PostBootloader);
			}
			ChipFamily::Netx90 | ChipFamily::Netx4000 => {
				// Flash-based chips either boot from flash or take the
				// firmware directly through the loader mailbox.
			}
		}

		self.set_state(LifecycleState::FirmwareStaging);
		self.rom_download(firmware.bytes())?;
		*self.resident_firmware.lock().unwrap() = Some(firmware.common.md5);
		Ok(())
	}

	/// Chunked transfer through the ROM-loader mailbox.
	fn rom_download(&self, image: &[u8]) -> Result<()> {
		let event = Event::new();
		info!("device {}: downloading {} bytes", self.name(), image.len());
		for chunk in image.chunks(ROM_MAILBOX_SIZE) {
			self.wait_cell(
				ROM_CELL,
				ROM_TO_NETX_BIT,
				SignalState::Equal,
				DOWNLOAD_CHUNK_TIMEOUT,
				&event,
			)
			.map_err(|err| match err {
				Error::Timeout => Error::BootFailed("loader stopped taking chunks"),
				other => other,
			})?;
			{
				let mut transport = self.transport();
				transport.write(ROM_TO_NETX_DATA, chunk, AccessFlags::empty())?;
				transport.write_u32(ROM_TO_NETX_LEN, chunk.len() as u32)?;
				handshake::toggle_host_flags(&mut transport, ROM_CELL, 1 << ROM_TO_NETX_BIT)?;
			}
		}

		// The loader reports a one-byte result through the to-host mailbox.
		self.wait_cell(
			ROM_CELL,
			ROM_TO_HOST_BIT,
			SignalState::NotEqual,
			DOWNLOAD_CHUNK_TIMEOUT,
			&event,
		)
		.map_err(|err| match err {
			Error::Timeout => Error::BootFailed("loader sent no download result"),
			other => other,
		})?;
		let result = {
			let mut transport = self.transport();
			let len = transport.read_u32(ROM_TO_HOST_LEN)?;
			let byte = transport.read_u8(ROM_TO_HOST_DATA)?;
			handshake::toggle_host_flags(&mut transport, ROM_CELL, 1 << ROM_TO_HOST_BIT)?;
			if len != 1 {
				return Err(Error::Protocol("loader result length must be one byte"));
			}
			byte
		};
		if result != 0 {
			return Err(Error::BootFailed("loader rejected the image"));
		}
		Ok(())
	}

	/// Waits for the firmware's READY flag; a raised ERROR flag or a bare
	/// timeout both fail the boot.
	pub(crate) fn await_ready(&self, timeout: Duration) -> Result<()> {
		let sys_cell = self.sys_cell();
		let deadline = Instant::now() + timeout;
		loop {
			if self.is_removed() {
				return Err(Error::DeviceRemoved);
			}
			let seen = self.sys_events.ready.generation();
			let snapshot = handshake::read_cell(&mut self.transport(), sys_cell)?;
			if snapshot.netx_bit(handshake::SYS_ERROR_BIT) {
				let status = self.system_status()?;
				error!(
					"device {}: boot error {:#010x} (system error {:#010x})",
					self.name(),
					status.boot_error,
					status.system_error
				);
				self.set_state(LifecycleState::Faulted);
				return Err(Error::BootFailed("firmware raised the error flag"));
			}
			if snapshot.netx_bit(handshake::SYS_READY_BIT) {
				return Ok(());
			}
			let now = Instant::now();
			if now >= deadline {
				self.set_state(LifecycleState::Faulted);
				return Err(Error::BootFailed("ready flag never rose"));
			}
			self.sys_events.ready.wait_newer(seen, (deadline - now).min(POLL_STEP));
		}
	}

	/// Post-ready steps shared by boot and reset: harvest identity,
	/// enumerate channels, unmask interrupts, enter `Running`.
	fn finish_startup(&self) -> Result<()> {
		let info = self.read_system_info()?;
		if !info.cookie_valid() {
			self.set_state(LifecycleState::Faulted);
			return Err(Error::Protocol("system channel cookie missing after boot"));
		}
		info!(
			"device {}: up (device {:#010x}, serial {})",
			self.name(),
			info.device_number,
			info.serial_number
		);
		*self.identity.lock().unwrap() = Some(info);
		self.enumerate_channels()?;

		// Seed the service snapshots so the first pass only reports real
		// toggles.
		{
			let mut transport = self.transport();
			let raw = transport.read_u32(self.sys_cell().offset)?;
			self.sys_last_cell.store(raw, std::sync::atomic::Ordering::Release);
			for channel in self.channels.read().unwrap().iter() {
				let raw = transport.read_u32(channel.cell.offset)?;
				channel.last_cell.store(raw, std::sync::atomic::Ordering::Release);
				let dma_raw = transport.read_u32(channel.dma_cell.offset)?;
				channel.last_dma_cell.store(dma_raw, std::sync::atomic::Ordering::Release);
			}
		}

		self.irq_masked.store(false, std::sync::atomic::Ordering::Release);
		self.set_state(LifecycleState::Running);
		Ok(())
	}

	/// Sends the warmstart packet right after boot and checks its
	/// confirmation.
	fn send_warmstart(&self, packet: &crate::packet::Packet) -> Result<()> {
		let confirmation = if self.channel_count() > 0 {
			self.put_packet(0, packet, MAILBOX_TIMEOUT)?;
			self.get_packet(0, HEADER_LEN + dpm::CHANNEL_MAILBOX_DATA_SIZE, MAILBOX_TIMEOUT)?
		} else {
			self.sys_put_packet(packet, MAILBOX_TIMEOUT)?;
			self.sys_get_packet(HEADER_LEN + dpm::SYSTEM_MAILBOX_DATA_SIZE, MAILBOX_TIMEOUT)?
		};
		if confirmation.header.state != 0 {
			return Err(Error::DeviceReported(confirmation.header.state));
		}
		debug!("device {}: warmstart parameters accepted", self.name());
		Ok(())
	}
}

/// Picks the first image with a usable container header; later entries are
/// fallbacks for mismatched cookies.
fn select_firmware<'a>(candidates: &'a [Vec<u8>]) -> Result<Image<'a>> {
	let mut last_err = Error::BootFailed("no firmware image supplied");
	for candidate in candidates {
		match Image::parse(candidate) {
			Ok(image) if image.cookie.kind() == ImageKind::Firmware => return Ok(image),
			Ok(_) => last_err = Error::BootFailed("image is not a firmware container"),
			Err(err) => {
				debug!("skipping firmware candidate: {err}");
				last_err = err;
			}
		}
	}
	Err(last_err)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::firmware::Cookie;
	use crate::firmware::tests::build_image;

	#[test]
	fn firmware_selection_skips_bad_candidates() {
		let bad = vec![0u8; 256];
		let module = build_image(Cookie::Option, b"module");
		let good = build_image(Cookie::FirmwareNxi, b"fw");
		let list = vec![bad, module, good.clone()];
		let image = select_firmware(&list).unwrap();
		assert_eq!(image.bytes(), good.as_slice());
	}

	#[test]
	fn firmware_selection_reports_the_last_failure() {
		let module = build_image(Cookie::Option, b"module");
		let err = select_firmware(&[module]).unwrap_err();
		assert!(matches!(err, Error::BootFailed(_)));
		assert!(select_firmware(&[]).is_err());
	}
}
