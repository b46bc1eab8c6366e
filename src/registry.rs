//! The process-wide device registry.
//!
//! One lazily initialised table owns every device instance. Applications
//! obtain a [`DriverHandle`], resolve channels by device name (or alias) and
//! index into [`ChannelHandle`]s, and go through those for all data-plane
//! operations. Handle resolution takes the global lock only for the lookup;
//! data operations then run under per-device and per-channel locks (lock
//! order: registry, device, channel, transport — never upward).

use std::sync::{Arc, LazyLock, Mutex, RwLock};
use std::time::Duration;

use hashbrown::HashMap;

use crate::channel::{Channel, IoArea, IoConfig, StateFields};
use crate::config::CYCLIC_INTERVAL;
use crate::device::{DeviceId, DeviceInstance};
use crate::dpm::{AppCos, CommonStatusBlock};
use crate::error::{Error, Result};
use crate::interrupt::CyclicTimer;
use crate::packet::Packet;

static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// The process-wide registry.
pub fn registry() -> &'static Registry {
	&REGISTRY
}

/// Opens the driver (convenience for [`Registry::open_driver`]).
pub fn open_driver() -> DriverHandle {
	registry().open_driver()
}

#[derive(Default)]
struct Inner {
	devices: HashMap<String, Arc<DeviceInstance>>,
	open_drivers: usize,
	next_id: u32,
}

pub struct Registry {
	inner: RwLock<Inner>,
	cyclic: Mutex<Option<CyclicTimer>>,
	cyclic_interval: Mutex<Option<Duration>>,
}

impl Registry {
	fn new() -> Self {
		Self {
			inner: RwLock::new(Inner::default()),
			cyclic: Mutex::new(None),
			cyclic_interval: Mutex::new(Some(CYCLIC_INTERVAL)),
		}
	}

	pub fn open_driver(&self) -> DriverHandle {
		self.inner.write().unwrap().open_drivers += 1;
		DriverHandle { closed: false }
	}

	pub(crate) fn driver_closed(&self) {
		let mut inner = self.inner.write().unwrap();
		debug_assert!(inner.open_drivers > 0);
		inner.open_drivers = inner.open_drivers.saturating_sub(1);
	}

	pub fn open_driver_count(&self) -> usize {
		self.inner.read().unwrap().open_drivers
	}

	/// Registers a device. Its name and alias must be unique; the shared
	/// cyclic timer starts with the first registered device.
	pub fn add_device(&self, device: Arc<DeviceInstance>) -> Result<DeviceId> {
		let id = {
			let mut inner = self.inner.write().unwrap();
			let name = device.name().to_string();
			if inner.devices.contains_key(&name) {
				return Err(Error::InvalidArgument("device name already registered"));
			}
			if let Some(alias) = device.alias()
				&& inner
					.devices
					.values()
					.any(|other| other.alias() == Some(alias) || other.name() == alias)
			{
				return Err(Error::InvalidArgument("device alias already registered"));
			}
			inner.next_id += 1;
			let id = DeviceId(inner.next_id);
			*device.id.lock().unwrap() = Some(id);
			inner.devices.insert(name, device);
			id
		};
		self.ensure_cyclic_timer();
		Ok(id)
	}

	/// Deregisters a device. Without `force` the call refuses while channel
	/// handles are open; with `force` every blocked caller is failed with
	/// `DeviceRemoved`, drained, and the device is released.
	pub fn remove_device(&self, name: &str, force: bool) -> Result<()> {
		let device = {
			let mut inner = self.inner.write().unwrap();
			let Some(device) = inner.devices.get(name) else {
				return Err(Error::NoSuchDevice(name.into()));
			};
			if !force && device.open_handles() > 0 {
				return Err(Error::DeviceInUse);
			}
			inner.devices.remove(name).unwrap()
		};
		info!("removing device {} (force={force})", device.name());
		// Outside the registry lock: draining waiters must not block lookups.
		device.mark_removed();

		if self.inner.read().unwrap().devices.is_empty() {
			let timer = self.cyclic.lock().unwrap().take();
			if let Some(timer) = timer {
				timer.stop();
			}
		}
		Ok(())
	}

	/// Resets a registered device back into `Running`.
	pub fn restart_device(&self, name: &str) -> Result<()> {
		self.device(name)?.restart()
	}

	pub fn device(&self, name_or_alias: &str) -> Result<Arc<DeviceInstance>> {
		let inner = self.inner.read().unwrap();
		inner
			.devices
			.get(name_or_alias)
			.or_else(|| {
				inner
					.devices
					.values()
					.find(|device| device.alias() == Some(name_or_alias))
			})
			.cloned()
			.ok_or_else(|| Error::NoSuchDevice(name_or_alias.into()))
	}

	pub fn device_count(&self) -> usize {
		self.inner.read().unwrap().devices.len()
	}

	pub fn device_names(&self) -> Vec<String> {
		self.inner
			.read()
			.unwrap()
			.devices
			.keys()
			.cloned()
			.collect()
	}

	/// Opens a communication channel by device name or alias.
	pub fn find_channel(&self, name_or_alias: &str, index: u8) -> Result<ChannelHandle> {
		let device = self.device(name_or_alias)?;
		device.ensure_running()?;
		let channel = device.channel(index)?;
		channel.acquire();
		Ok(ChannelHandle { device, channel, closed: false })
	}

	/// Reconfigures (or disables, with `None`) the shared poll interval.
	/// Takes effect the next time the timer is (re)started.
	pub fn set_cyclic_interval(&self, interval: Option<Duration>) {
		*self.cyclic_interval.lock().unwrap() = interval;
	}

	fn ensure_cyclic_timer(&self) {
		let Some(interval) = *self.cyclic_interval.lock().unwrap() else {
			return;
		};
		let mut cyclic = self.cyclic.lock().unwrap();
		if cyclic.is_none() {
			*cyclic = Some(CyclicTimer::spawn(interval, || {
				let devices: Vec<Arc<DeviceInstance>> = REGISTRY
					.inner
					.read()
					.unwrap()
					.devices
					.values()
					.cloned()
					.collect();
				for device in devices {
					device.poll();
				}
			}));
		}
	}
}

/// An open driver session. Dropping it (or calling [`close`](Self::close))
/// gives the open count back.
pub struct DriverHandle {
	closed: bool,
}

impl DriverHandle {
	pub fn close(mut self) {
		self.closed = true;
		registry().driver_closed();
	}
}

impl Drop for DriverHandle {
	fn drop(&mut self) {
		if !self.closed {
			registry().driver_closed();
		}
	}
}

/// A reference-counted handle to one communication channel. All data-plane
/// operations of the toolkit are reachable from here.
pub struct ChannelHandle {
	device: Arc<DeviceInstance>,
	channel: Arc<Channel>,
	closed: bool,
}

impl ChannelHandle {
	pub fn device(&self) -> &Arc<DeviceInstance> {
		&self.device
	}

	pub fn index(&self) -> u8 {
		self.channel.index
	}

	pub fn info(&self) -> &crate::dpm::ChannelInfo {
		&self.channel.info
	}

	/// Last close releases the per-channel state.
	pub fn close(mut self) {
		self.closed = true;
		self.channel.release();
	}

	pub fn put_packet(&self, packet: &Packet, timeout: Duration) -> Result<()> {
		self.device.put_packet(self.channel.index, packet, timeout)
	}

	pub fn get_packet(&self, max_len: usize, timeout: Duration) -> Result<Packet> {
		self.device.get_packet(self.channel.index, max_len, timeout)
	}

	pub fn io_read(
		&self,
		area: IoArea,
		offset: u32,
		dst: &mut [u8],
		timeout: Duration,
	) -> Result<()> {
		self.device.io_read(self.channel.index, area, offset, dst, timeout)
	}

	pub fn io_write(
		&self,
		area: IoArea,
		offset: u32,
		src: &[u8],
		timeout: Duration,
	) -> Result<()> {
		self.device.io_write(self.channel.index, area, offset, src, timeout)
	}

	pub fn common_status(&self) -> Result<CommonStatusBlock> {
		self.device.common_status(self.channel.index)
	}

	pub fn extended_status(&self) -> Result<Vec<u8>> {
		self.device.extended_status(self.channel.index)
	}

	pub fn state_fields(&self) -> Result<StateFields> {
		self.device.state_fields(self.channel.index)
	}

	pub fn state_fields_of_kind(
		&self,
		kind: crate::channel::StateFieldKind,
	) -> Result<StateFields> {
		self.device.state_fields_of_kind(self.channel.index, kind)
	}

	pub fn mailbox_counters(&self) -> Result<(u16, u16)> {
		self.device.mailbox_counters(self.channel.index)
	}

	pub fn wait_cos(&self, mask: u32, timeout: Duration) -> Result<u32> {
		self.device.wait_cos(self.channel.index, mask, timeout)
	}

	pub fn update_app_cos(&self, set: AppCos, clear: AppCos, timeout: Duration) -> Result<()> {
		self.device.update_app_cos(self.channel.index, set, clear, timeout)
	}

	pub fn set_host_ready(&self, ready: bool, timeout: Duration) -> Result<()> {
		self.device.set_host_ready(self.channel.index, ready, timeout)
	}

	pub fn trigger_watchdog(&self) -> Result<u32> {
		self.device.trigger_watchdog(self.channel.index)
	}

	pub fn set_io_config(&self, config: IoConfig) -> Result<()> {
		self.device.set_io_config(self.channel.index, config)
	}

	pub fn dma_claim(&self, slot: usize, timeout: Duration) -> Result<()> {
		self.device.dma_claim(self.channel.index, slot, timeout)
	}

	pub fn dma_release(&self, slot: usize) -> Result<()> {
		self.device.dma_release(self.channel.index, slot)
	}

	pub fn dma_next_ready(&self) -> Result<Option<usize>> {
		self.device.dma_next_ready(self.channel.index)
	}
}

impl Drop for ChannelHandle {
	fn drop(&mut self) {
		if !self.closed {
			self.channel.release();
		}
	}
}
