//! Per-device configuration environment.
//!
//! A configurable base directory holds one subdirectory per device, keyed by
//! device and serial number (`<base>/<device>_<serial>`) or by slot
//! (`<base>/Slot_<n>`). Inside, a `device.conf` key=value file configures
//! alias, interrupt usage and DMA, per-channel subdirectories
//! (`channel0`...) hold firmware and configuration files, and an optional
//! `warmstart.dat` carries the packet to send right after boot.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::firmware;
use crate::packet::Packet;

/// Recognised firmware file extensions, in download preference order.
const FIRMWARE_EXTENSIONS: &[&str] = &["nxi", "nxf", "nxe", "mxf", "nai", "nae"];

const DEVICE_CONF: &str = "device.conf";
const WARMSTART_FILE: &str = "warmstart.dat";

/// Keys understood in `device.conf`.
const KEY_ALIAS: &str = "alias";
const KEY_IRQ: &str = "irq";
const KEY_IRQ_PRIO: &str = "irqprio";
const KEY_IRQ_SCHED: &str = "irqsched";
const KEY_DMA: &str = "dma";

/// Parsed `device.conf` contents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceConfig {
	pub alias: Option<String>,
	pub irq: bool,
	pub irq_priority: Option<i32>,
	pub irq_scheduler: Option<String>,
	pub dma: bool,
}

impl DeviceConfig {
	/// Parses `key=value` lines; `#` starts a comment line, keys are
	/// case-insensitive, values keep their case (minus trailing
	/// whitespace).
	pub fn parse(text: &str) -> Self {
		let mut config = Self::default();
		for line in text.lines() {
			let line = line.trim_end();
			if line.starts_with('#') || line.is_empty() {
				continue;
			}
			let Some((key, value)) = line.split_once('=') else {
				continue;
			};
			let key = key.trim().to_ascii_lowercase();
			let value = value.trim();
			match key.as_str() {
				KEY_ALIAS if !value.is_empty() => config.alias = Some(value.to_string()),
				KEY_IRQ => config.irq = value.eq_ignore_ascii_case("yes"),
				KEY_IRQ_PRIO => config.irq_priority = value.parse().ok(),
				KEY_IRQ_SCHED => config.irq_scheduler = Some(value.to_ascii_lowercase()),
				KEY_DMA => config.dma = value.eq_ignore_ascii_case("yes"),
				_ => debug!("device.conf: ignoring unknown key {key}"),
			}
		}
		config
	}
}

/// The driver's configuration directory tree.
#[derive(Debug, Clone)]
pub struct DriverEnvironment {
	base: PathBuf,
}

impl DriverEnvironment {
	pub fn new(base: impl Into<PathBuf>) -> Self {
		Self { base: base.into() }
	}

	pub fn base(&self) -> &Path {
		&self.base
	}

	/// Directory of a device keyed by device and serial number.
	pub fn device_dir(&self, device_number: u32, serial_number: u32) -> PathBuf {
		self.base.join(format!("{device_number}_{serial_number}"))
	}

	/// Directory of a device keyed by its slot id (rotary switch).
	pub fn slot_dir(&self, slot: u8) -> PathBuf {
		self.base.join(format!("Slot_{slot}"))
	}

	pub fn channel_dir(device_dir: &Path, channel: u8) -> PathBuf {
		device_dir.join(format!("channel{channel}"))
	}

	/// Loads `device.conf`; a missing file yields the defaults.
	pub fn device_config(&self, device_dir: &Path) -> Result<DeviceConfig> {
		let path = device_dir.join(DEVICE_CONF);
		match fs::read_to_string(&path) {
			Ok(text) => Ok(DeviceConfig::parse(&text)),
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
				Ok(DeviceConfig::default())
			}
			Err(err) => Err(err.into()),
		}
	}

	/// Collects firmware images from a channel directory, best extension
	/// first. Unreadable or unrecognised files are skipped; the boot code
	/// falls through the returned list anyway.
	pub fn firmware_images(&self, device_dir: &Path, channel: u8) -> Result<Vec<Vec<u8>>> {
		let dir = Self::channel_dir(device_dir, channel);
		let mut found: Vec<(usize, PathBuf)> = Vec::new();
		let entries = match fs::read_dir(&dir) {
			Ok(entries) => entries,
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
			Err(err) => return Err(err.into()),
		};
		for entry in entries {
			let path = entry?.path();
			let Some(ext) = path.extension().and_then(|ext| ext.to_str()) else {
				continue;
			};
			let ext = ext.to_ascii_lowercase();
			if let Some(rank) = FIRMWARE_EXTENSIONS.iter().position(|&known| known == ext) {
				found.push((rank, path));
			}
		}
		found.sort();
		let mut images = Vec::with_capacity(found.len());
		for (_, path) in found {
			match fs::read(&path) {
				Ok(bytes) => images.push(bytes),
				Err(err) => warn!("skipping unreadable firmware file {path:?}: {err}"),
			}
		}
		Ok(images)
	}

	/// Loads and parses `warmstart.dat` if present.
	pub fn warmstart(&self, device_dir: &Path, channel: u8) -> Result<Option<Packet>> {
		let path = Self::channel_dir(device_dir, channel).join(WARMSTART_FILE);
		match fs::read(&path) {
			Ok(bytes) => Ok(Some(firmware::parse_warmstart(&bytes)?)),
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
			Err(err) => Err(err.into()),
		}
	}
}
