//! Device instances and their lifecycle.
//!
//! A [`DeviceInstance`] owns the transport to one controller, the decoded
//! DPM geometry, the channels and the DMA pool. It also hosts the wait
//! engine every blocking operation goes through: one loop that observes a
//! handshake cell, parks on the matching notification event (signalled by
//! the interrupt thread or the cyclic poll pass) and enforces the caller's
//! timeout and forced-removal wakeups.
//!
//! Lifecycle:
//!
//! ```text
//! Uninitialized -> Detecting -> BootloaderStaging -> FirmwareStaging ->
//! Running -> (Resetting | Faulted) -> ...
//! ```
//!
//! Transitions happen only here; channel operations require `Running`.

pub mod boot;
pub mod detect;

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use crossbeam_utils::Backoff;

pub use self::detect::{ChipFamily, ChipType, DetectConfig, Detection};
use crate::channel::{Channel, IoArea, IoConfig};
use crate::config::{MAILBOX_TIMEOUT, POLL_STEP};
use crate::dpm::handshake::{
	self, CellLocation, CellSnapshot, CellWidth, Event, SignalState,
};
use crate::dpm::{
	self, AppCos, ChannelInfo, ChannelKind, ChannelLayout, CommonStatusBlock,
	HandshakePosition, SystemInfoBlock, SystemStatusBlock,
};
use crate::error::{Error, Result};
use crate::interrupt::{IrqSource, IrqThread};
use crate::packet::{HEADER_LEN, Packet, PacketHeader};
use crate::transport::{AccessFlags, DpmAccess, Transport};

/// Registry-scoped token identifying a device instance. Callbacks receive
/// this instead of a reference; the registry resolves it back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(pub(crate) u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
	Uninitialized,
	Detecting,
	BootloaderStaging,
	FirmwareStaging,
	Running,
	Resetting,
	Faulted,
}

/// Points during bring-up at which integrators get a callback (e.g. to tear
/// down and rebuild a bridge device).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
	PreReset,
	PostReset,
	PreBootloader,
	PostBootloader,
}

pub type LifecycleHook = Box<dyn Fn(DeviceId, LifecycleEvent) + Send + Sync>;

/// Reset variants of the system control word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum ResetMode {
	#[default]
	ColdStart = 0,
	WarmStart = 1,
	BootStart = 2,
	UpdateStart = 3,
}

/// Images handed to [`DeviceInstance::start`]. Where the firmware comes
/// from (files, flash, a test bench) is the integrator's business.
#[derive(Default)]
pub struct BootImages {
	/// Chip-appropriate second-stage bootloader, required for chips whose
	/// ROM loader cannot start a firmware directly.
	pub bootloader: Option<Vec<u8>>,
	/// Candidate firmware images; the first one with a valid container
	/// header is used, later entries are fallbacks.
	pub firmware: Vec<Vec<u8>>,
	/// Packet to send right after the firmware is up.
	pub warmstart: Option<Packet>,
}

/// System-channel notification events.
#[derive(Debug, Default)]
pub(crate) struct SysEvents {
	pub send_mbx: Event,
	pub recv_mbx: Event,
	pub cos: Event,
	/// READY/ERROR flag movement.
	pub ready: Event,
}

impl SysEvents {
	fn for_bit(&self, bit: u8) -> Option<&Event> {
		match bit {
			handshake::SYS_READY_BIT | handshake::SYS_ERROR_BIT => Some(&self.ready),
			handshake::NETX_COS_BIT => Some(&self.cos),
			handshake::SEND_MBX_BIT => Some(&self.send_mbx),
			handshake::RECV_MBX_BIT => Some(&self.recv_mbx),
			_ => None,
		}
	}

	fn signal_all(&self) {
		for event in [&self.send_mbx, &self.recv_mbx, &self.cos, &self.ready] {
			event.signal();
		}
	}
}

/// Decrements the device waiter count on scope exit.
struct WaiterGuard<'a>(&'a AtomicUsize);

impl<'a> WaiterGuard<'a> {
	fn enter(counter: &'a AtomicUsize) -> Self {
		counter.fetch_add(1, Ordering::AcqRel);
		Self(counter)
	}
}

impl Drop for WaiterGuard<'_> {
	fn drop(&mut self) {
		self.0.fetch_sub(1, Ordering::AcqRel);
	}
}

/// One controller: transport, geometry, channels, DMA pool, lifecycle.
pub struct DeviceInstance {
	pub(crate) id: Mutex<Option<DeviceId>>,
	name: String,
	alias: Option<String>,
	transport: Mutex<Transport>,
	dpm_len: usize,
	detect_config: DetectConfig,

	/// Optional extended memory window (e.g. MRAM) next to the DPM.
	extended: Mutex<Option<Transport>>,

	state: Mutex<LifecycleState>,
	chip: Mutex<Option<ChipType>>,
	identity: Mutex<Option<SystemInfoBlock>>,
	channels: RwLock<Vec<Arc<Channel>>>,
	/// MD5 of the firmware known to be resident (download cache).
	resident_firmware: Mutex<Option<[u8; 16]>>,

	sys_cell: Mutex<CellLocation>,
	sys_events: SysEvents,
	sys_last_cell: AtomicU32,
	sys_send: Mutex<()>,
	sys_recv: Mutex<()>,

	removed: AtomicBool,
	waiters: AtomicUsize,
	irq: Mutex<Option<IrqThread>>,
	irq_enabled: AtomicBool,
	irq_masked: AtomicBool,
	notify: Mutex<Option<LifecycleHook>>,
}

impl DeviceInstance {
	pub fn new(name: impl Into<String>, transport: Transport) -> Arc<Self> {
		Self::with_options(name, transport, None, DetectConfig::default())
	}

	pub fn with_options(
		name: impl Into<String>,
		transport: Transport,
		alias: Option<String>,
		detect_config: DetectConfig,
	) -> Arc<Self> {
		let dpm_len = transport.window_len();
		Arc::new(Self {
			id: Mutex::new(None),
			name: name.into(),
			alias,
			transport: Mutex::new(transport),
			dpm_len,
			detect_config,
			extended: Mutex::new(None),
			state: Mutex::new(LifecycleState::Uninitialized),
			chip: Mutex::new(None),
			identity: Mutex::new(None),
			channels: RwLock::new(Vec::new()),
			resident_firmware: Mutex::new(None),
			sys_cell: Mutex::new(CellLocation {
				offset: dpm::sys::HANDSHAKE_CELL,
				width: CellWidth::Bits16,
			}),
			sys_events: SysEvents::default(),
			sys_last_cell: AtomicU32::new(0),
			sys_send: Mutex::new(()),
			sys_recv: Mutex::new(()),
			removed: AtomicBool::new(false),
			waiters: AtomicUsize::new(0),
			irq: Mutex::new(None),
			irq_enabled: AtomicBool::new(false),
			irq_masked: AtomicBool::new(false),
			notify: Mutex::new(None),
		})
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn alias(&self) -> Option<&str> {
		self.alias.as_deref()
	}

	pub fn id(&self) -> Option<DeviceId> {
		*self.id.lock().unwrap()
	}

	pub fn dpm_len(&self) -> usize {
		self.dpm_len
	}

	pub fn lifecycle(&self) -> LifecycleState {
		*self.state.lock().unwrap()
	}

	pub fn chip(&self) -> Option<ChipType> {
		*self.chip.lock().unwrap()
	}

	/// Identity harvested from the system info block after boot.
	pub fn identity(&self) -> Option<SystemInfoBlock> {
		self.identity.lock().unwrap().clone()
	}

	pub fn set_lifecycle_hook(&self, hook: Option<LifecycleHook>) {
		*self.notify.lock().unwrap() = hook;
	}

	/// Attaches the extended memory window (availability is advertised in
	/// the system status block's hardware-features word).
	pub fn set_extended_memory(&self, transport: Option<Transport>) {
		*self.extended.lock().unwrap() = transport;
	}

	pub fn has_extended_memory(&self) -> bool {
		self.extended.lock().unwrap().is_some()
	}

	pub fn extended_read(&self, offset: u32, dst: &mut [u8]) -> Result<()> {
		let mut extended = self.extended.lock().unwrap();
		let transport = extended
			.as_mut()
			.ok_or(Error::InvalidArgument("device has no extended memory"))?;
		transport.read(offset, dst, AccessFlags::empty())
	}

	pub fn extended_write(&self, offset: u32, src: &[u8]) -> Result<()> {
		let mut extended = self.extended.lock().unwrap();
		let transport = extended
			.as_mut()
			.ok_or(Error::InvalidArgument("device has no extended memory"))?;
		transport.write(offset, src, AccessFlags::empty())
	}

	pub fn channel_count(&self) -> usize {
		self.channels.read().unwrap().len()
	}

	pub fn channel(&self, index: u8) -> Result<Arc<Channel>> {
		self.channels
			.read()
			.unwrap()
			.get(index as usize)
			.cloned()
			.ok_or(Error::NoSuchChannel(index))
	}

	pub(crate) fn set_state(&self, state: LifecycleState) {
		debug!("device {}: lifecycle -> {state:?}", self.name);
		*self.state.lock().unwrap() = state;
	}

	pub(crate) fn ensure_running(&self) -> Result<()> {
		if self.removed.load(Ordering::Acquire) {
			return Err(Error::DeviceRemoved);
		}
		match self.lifecycle() {
			LifecycleState::Running => Ok(()),
			_ => Err(Error::NotReady),
		}
	}

	pub(crate) fn notify_event(&self, event: LifecycleEvent) {
		let hook = self.notify.lock().unwrap();
		if let (Some(hook), Some(id)) = (hook.as_ref(), self.id()) {
			hook(id, event);
		}
	}

	pub(crate) fn transport(&self) -> MutexGuard<'_, Transport> {
		self.transport.lock().unwrap()
	}

	pub(crate) fn sys_cell(&self) -> CellLocation {
		*self.sys_cell.lock().unwrap()
	}

	// ------------------------------------------------------------------
	// Wait engine
	// ------------------------------------------------------------------

	/// Waits until `cell` reaches `target` for `bit`.
	///
	/// `Duration::ZERO` polls exactly once. Interrupt-driven devices park on
	/// `event` for the full remaining budget; polled devices re-read the
	/// cell every [`POLL_STEP`]. Forced removal aborts with `DeviceRemoved`.
	pub(crate) fn wait_cell(
		&self,
		cell: CellLocation,
		bit: u8,
		target: SignalState,
		timeout: Duration,
		event: &Event,
	) -> Result<CellSnapshot> {
		let _waiter = WaiterGuard::enter(&self.waiters);
		let deadline = Instant::now().checked_add(timeout);
		let backoff = Backoff::new();
		loop {
			if self.removed.load(Ordering::Acquire) {
				return Err(Error::DeviceRemoved);
			}
			let seen = event.generation();
			let snapshot = handshake::read_cell(&mut self.transport(), cell)?;
			if target.matches(snapshot, bit) {
				return Ok(snapshot);
			}
			if timeout.is_zero() {
				return Err(Error::Timeout);
			}
			let budget = match deadline {
				Some(deadline) => {
					let now = Instant::now();
					if now >= deadline {
						return Err(Error::Timeout);
					}
					deadline - now
				}
				// Effectively unbounded; removal or the device unblock us.
				None => Duration::from_secs(3600),
			};
			// Spin briefly for sub-millisecond acknowledge turnaround, then
			// park on the event.
			if !backoff.is_completed() {
				backoff.snooze();
				continue;
			}
			// Interrupt delivery is suspended during resets, so fall back to
			// poll stepping whenever the line is masked.
			let step = if self.irq_enabled.load(Ordering::Acquire) && !self.irq_masked() {
				budget
			} else {
				budget.min(POLL_STEP)
			};
			event.wait_newer(seen, step);
		}
	}

	/// Toggle a host flag under the transport lock.
	pub(crate) fn toggle_host(&self, cell: CellLocation, bit: u8) -> Result<CellSnapshot> {
		handshake::toggle_host_flags(&mut self.transport(), cell, 1 << bit)
	}

	// ------------------------------------------------------------------
	// System channel access
	// ------------------------------------------------------------------

	pub fn system_status(&self) -> Result<SystemStatusBlock> {
		let mut raw = [0u8; SystemStatusBlock::LEN];
		self.transport()
			.read(dpm::sys::STATUS_BLOCK, &mut raw, AccessFlags::empty())?;
		Ok(SystemStatusBlock::from_bytes(&raw))
	}

	pub(crate) fn read_system_info(&self) -> Result<SystemInfoBlock> {
		let mut raw = [0u8; SystemInfoBlock::LEN];
		self.transport()
			.read(dpm::sys::INFO_BLOCK, &mut raw, AccessFlags::empty())?;
		Ok(SystemInfoBlock::from_bytes(&raw))
	}

	/// Sends a packet through the system mailbox.
	pub fn sys_put_packet(&self, packet: &Packet, timeout: Duration) -> Result<()> {
		packet.header.check_bounds(dpm::SYSTEM_MAILBOX_DATA_SIZE)?;
		let _send = self.sys_send.lock().unwrap();
		let cell = self.sys_cell();
		self.wait_cell(
			cell,
			handshake::SEND_MBX_BIT,
			SignalState::Equal,
			timeout,
			&self.sys_events.send_mbx,
		)?;
		self.write_mailbox(dpm::sys::SEND_MAILBOX, packet)?;
		self.toggle_host(cell, handshake::SEND_MBX_BIT)?;
		Ok(())
	}

	/// Receives a packet from the system mailbox.
	pub fn sys_get_packet(&self, max_len: usize, timeout: Duration) -> Result<Packet> {
		let _recv = self.sys_recv.lock().unwrap();
		let cell = self.sys_cell();
		let wait = self.wait_cell(
			cell,
			handshake::RECV_MBX_BIT,
			SignalState::NotEqual,
			timeout,
			&self.sys_events.recv_mbx,
		);
		match wait {
			Err(Error::Timeout) if timeout.is_zero() => return Err(Error::NoPacket),
			Err(err) => return Err(err),
			Ok(_) => {}
		}
		let packet =
			self.read_mailbox(dpm::sys::RECV_MAILBOX, dpm::SYSTEM_MAILBOX_DATA_SIZE, max_len)?;
		self.toggle_host(cell, handshake::RECV_MBX_BIT)?;
		Ok(packet)
	}

	fn write_mailbox(&self, mailbox: u32, packet: &Packet) -> Result<()> {
		let mut transport = self.transport();
		let data = mailbox + dpm::sys::MAILBOX_DATA;
		transport.write(data, &packet.header.to_bytes(), AccessFlags::empty())?;
		if !packet.payload.is_empty() {
			transport.write(
				data + HEADER_LEN as u32,
				&packet.payload,
				AccessFlags::empty(),
			)?;
		}
		Ok(())
	}

	fn read_mailbox(&self, mailbox: u32, data_len: usize, max_len: usize) -> Result<Packet> {
		let mut transport = self.transport();
		let data = mailbox + dpm::sys::MAILBOX_DATA;
		let mut raw = [0u8; HEADER_LEN];
		transport.read(data, &mut raw, AccessFlags::empty())?;
		let header = PacketHeader::from_bytes(&raw)?;
		let payload_len = header.len as usize;
		if HEADER_LEN + payload_len > data_len {
			return Err(Error::Protocol("oversized packet in receive mailbox"));
		}
		if HEADER_LEN + payload_len > max_len {
			return Err(Error::BufferTooSmall);
		}
		let mut payload = vec![0u8; payload_len];
		if payload_len > 0 {
			transport.read(data + HEADER_LEN as u32, &mut payload, AccessFlags::empty())?;
		}
		Ok(Packet { header, payload })
	}

	// ------------------------------------------------------------------
	// Channel mailbox operations
	// ------------------------------------------------------------------

	/// Puts a packet into a channel's send mailbox. Synchronous with the
	/// handshake: at most one packet is unacknowledged per channel.
	pub fn put_packet(&self, index: u8, packet: &Packet, timeout: Duration) -> Result<()> {
		self.ensure_running()?;
		packet.header.check_bounds(dpm::CHANNEL_MAILBOX_DATA_SIZE)?;
		let channel = self.channel(index)?;
		let mut send = channel.send.lock().unwrap();
		if packet.header.is_request() {
			send.track(packet.header.src_id, packet.header.cmd)?;
		}
		let result: Result<()> = (|| {
			self.wait_cell(
				channel.cell,
				handshake::SEND_MBX_BIT,
				SignalState::Equal,
				timeout,
				&channel.events.send_mbx,
			)?;
			self.write_mailbox(channel.layout.base + dpm::chan::SEND_MAILBOX, packet)?;
			self.toggle_host(channel.cell, handshake::SEND_MBX_BIT)?;
			Ok(())
		})();
		if result.is_err() && packet.header.is_request() {
			send.confirm(packet.header.src_id);
		}
		result
	}

	/// Takes the next packet from a channel's receive mailbox, in device
	/// emission order.
	pub fn get_packet(&self, index: u8, max_len: usize, timeout: Duration) -> Result<Packet> {
		self.ensure_running()?;
		let channel = self.channel(index)?;
		let _recv = channel.recv.lock().unwrap();
		let wait = self.wait_cell(
			channel.cell,
			handshake::RECV_MBX_BIT,
			SignalState::NotEqual,
			timeout,
			&channel.events.recv_mbx,
		);
		match wait {
			Err(Error::Timeout) if timeout.is_zero() => return Err(Error::NoPacket),
			Err(err) => return Err(err),
			Ok(_) => {}
		}
		let packet = self.read_mailbox(
			channel.layout.base + dpm::chan::RECV_MAILBOX,
			dpm::CHANNEL_MAILBOX_DATA_SIZE,
			max_len,
		)?;
		self.toggle_host(channel.cell, handshake::RECV_MBX_BIT)?;
		if packet.header.is_confirmation() {
			channel.send.lock().unwrap().confirm(packet.header.src_id);
		}
		Ok(packet)
	}

	// ------------------------------------------------------------------
	// Cyclic I/O
	// ------------------------------------------------------------------

	/// Reads from an input process-data area with the channel's configured
	/// discipline.
	pub fn io_read(
		&self,
		index: u8,
		area: IoArea,
		offset: u32,
		dst: &mut [u8],
		timeout: Duration,
	) -> Result<()> {
		if !area.is_input() {
			return Err(Error::InvalidArgument("io_read on an output area"));
		}
		self.ensure_running()?;
		let channel = self.channel(index)?;
		let (base, size) = channel.io_area(area);
		check_io_bounds(offset, dst.len(), size)?;
		let mode = channel.io_mode(area);
		if !mode.is_handshaked() {
			return Ok(self
				.transport()
				.read(base + offset, dst, AccessFlags::empty())?);
		}
		let _area = channel.io_locks[area.lock_index()].lock().unwrap();
		let event = channel.events.for_bit(area.bit()).unwrap();
		self.wait_cell(channel.cell, area.bit(), SignalState::NotEqual, timeout, event)?;
		self.transport().read(base + offset, dst, AccessFlags::empty())?;
		self.toggle_host(channel.cell, area.bit())?;
		Ok(())
	}

	/// Writes to an output process-data area with the channel's configured
	/// discipline.
	pub fn io_write(
		&self,
		index: u8,
		area: IoArea,
		offset: u32,
		src: &[u8],
		timeout: Duration,
	) -> Result<()> {
		if area.is_input() {
			return Err(Error::InvalidArgument("io_write on an input area"));
		}
		self.ensure_running()?;
		let channel = self.channel(index)?;
		let (base, size) = channel.io_area(area);
		check_io_bounds(offset, src.len(), size)?;
		let mode = channel.io_mode(area);
		if !mode.is_handshaked() {
			return Ok(self
				.transport()
				.write(base + offset, src, AccessFlags::empty())?);
		}
		let target = match mode {
			dpm::IoMode::BufferedDeviceControlled => SignalState::NotEqual,
			_ => SignalState::Equal,
		};
		let _area = channel.io_locks[area.lock_index()].lock().unwrap();
		let event = channel.events.for_bit(area.bit()).unwrap();
		self.wait_cell(channel.cell, area.bit(), target, timeout, event)?;
		self.transport().write(base + offset, src, AccessFlags::empty())?;
		self.toggle_host(channel.cell, area.bit())?;
		Ok(())
	}

	// ------------------------------------------------------------------
	// Status, COS, watchdog
	// ------------------------------------------------------------------

	pub fn common_status(&self, index: u8) -> Result<CommonStatusBlock> {
		let channel = self.channel(index)?;
		let mut raw = [0u8; CommonStatusBlock::LEN];
		self.transport().read(
			channel.layout.base + dpm::chan::COMMON_STATUS,
			&mut raw,
			AccessFlags::empty(),
		)?;
		Ok(CommonStatusBlock::from_bytes(&raw))
	}

	/// Raw extended status block of a channel.
	pub fn extended_status(&self, index: u8) -> Result<Vec<u8>> {
		let channel = self.channel(index)?;
		let mut raw = vec![0u8; dpm::EXT_STATUS_SIZE];
		self.transport().read(
			channel.layout.base + dpm::chan::EXT_STATUS,
			&mut raw,
			AccessFlags::empty(),
		)?;
		Ok(raw)
	}

	/// Parsed state-field records of a channel's extended status block.
	pub fn state_fields(&self, index: u8) -> Result<crate::channel::StateFields> {
		let raw = self.extended_status(index)?;
		crate::channel::parse_state_fields(&raw)
	}

	/// State-field records of one diagnostic type.
	pub fn state_fields_of_kind(
		&self,
		index: u8,
		kind: crate::channel::StateFieldKind,
	) -> Result<crate::channel::StateFields> {
		let mut records = self.state_fields(index)?;
		records.retain(|record| record.kind == kind);
		Ok(records)
	}

	/// The mailbox fill counters (packages accepted on the send side,
	/// packages waiting on the receive side). Read-only hints; backpressure
	/// is carried by the handshake bits.
	pub fn mailbox_counters(&self, index: u8) -> Result<(u16, u16)> {
		let channel = self.channel(index)?;
		let mut transport = self.transport();
		let accepted = transport.read_u16(channel.layout.base + dpm::chan::SEND_MAILBOX)?;
		let waiting = transport.read_u16(channel.layout.base + dpm::chan::RECV_MAILBOX)?;
		Ok((accepted, waiting))
	}

	/// Blocks until any bit in `mask` toggles in the channel's
	/// communication-COS word, returning the new word.
	pub fn wait_cos(&self, index: u8, mask: u32, timeout: Duration) -> Result<u32> {
		self.ensure_running()?;
		let channel = self.channel(index)?;
		let cos_offset = channel.layout.base + dpm::chan::COMMUNICATION_COS;
		let baseline = self.transport().read_u32(cos_offset)?;
		let _waiter = WaiterGuard::enter(&self.waiters);
		let deadline = Instant::now().checked_add(timeout);
		loop {
			if self.removed.load(Ordering::Acquire) {
				return Err(Error::DeviceRemoved);
			}
			let seen = channel.events.cos.generation();
			let cos = self.transport().read_u32(cos_offset)?;
			if (cos ^ baseline) & mask != 0 {
				return Ok(cos);
			}
			let budget = match deadline {
				Some(deadline) => {
					let now = Instant::now();
					if now >= deadline {
						return Err(Error::Timeout);
					}
					deadline - now
				}
				None => Duration::from_secs(3600),
			};
			let step = if self.irq_enabled.load(Ordering::Acquire) {
				budget
			} else {
				budget.min(POLL_STEP)
			};
			channel.events.cos.wait_newer(seen, step);
		}
	}

	/// Updates the application COS word and signals the change to the
	/// device. Waits for the acknowledge when `timeout` is non-zero.
	pub fn update_app_cos(
		&self,
		index: u8,
		set: AppCos,
		clear: AppCos,
		timeout: Duration,
	) -> Result<()> {
		self.ensure_running()?;
		let channel = self.channel(index)?;
		let _control = channel.control.lock().unwrap();
		// The previous command cycle must have completed.
		self.wait_cell(
			channel.cell,
			handshake::HOST_COS_BIT,
			SignalState::Equal,
			MAILBOX_TIMEOUT,
			&channel.events.cos,
		)?;
		let cos_offset = channel.layout.base + dpm::chan::APPLICATION_COS;
		{
			let mut transport = self.transport();
			let word = transport.read_u32(cos_offset)?;
			let word = (word | set.bits()) & !clear.bits();
			transport.write_u32(cos_offset, word)?;
			handshake::toggle_host_flags(
				&mut transport,
				channel.cell,
				1 << handshake::HOST_COS_BIT,
			)?;
		}
		if !timeout.is_zero() {
			self.wait_cell(
				channel.cell,
				handshake::HOST_COS_BIT,
				SignalState::Equal,
				timeout,
				&channel.events.cos,
			)?;
		}
		Ok(())
	}

	/// Announces host readiness on a channel (HOST_READY flag plus the
	/// application-ready COS bit).
	pub fn set_host_ready(&self, index: u8, ready: bool, timeout: Duration) -> Result<()> {
		let channel = self.channel(index)?;
		let snapshot = handshake::read_cell(&mut self.transport(), channel.cell)?;
		let is_ready = snapshot.host & 1 != 0;
		if is_ready != ready {
			// HOST_READY is an absolute flag, bit 0 of the host half.
			handshake::write_host_flags(
				&mut self.transport(),
				channel.cell,
				snapshot.host ^ 1,
			)?;
		}
		let (set, clear) = if ready {
			(AppCos::APPLICATION_READY, AppCos::empty())
		} else {
			(AppCos::empty(), AppCos::APPLICATION_READY)
		};
		self.update_app_cos(index, set, clear, timeout)
	}

	/// Watchdog trigger: copies the device watchdog value back through the
	/// control block and returns it.
	pub fn trigger_watchdog(&self, index: u8) -> Result<u32> {
		self.ensure_running()?;
		let channel = self.channel(index)?;
		let mut transport = self.transport();
		let value = transport
			.read_u32(channel.layout.base + dpm::chan::COMMON_STATUS + 20)?;
		transport.write_u32(channel.layout.base + dpm::chan::WATCHDOG, value)?;
		Ok(value)
	}

	pub fn set_io_config(&self, index: u8, config: IoConfig) -> Result<()> {
		self.channel(index)?.set_io_config(config);
		Ok(())
	}

	// ------------------------------------------------------------------
	// DMA
	// ------------------------------------------------------------------

	/// Installs the DMA buffers of a channel (device-instance lifetime).
	pub fn configure_dma(
		&self,
		index: u8,
		buffers: impl IntoIterator<Item = crate::dma::DmaBuffer>,
	) -> Result<()> {
		let channel = self.channel(index)?;
		channel.dma.lock().unwrap().configure(buffers)
	}

	/// Blocks until the host owns DMA slot `slot`.
	pub fn dma_claim(&self, index: u8, slot: usize, timeout: Duration) -> Result<()> {
		self.ensure_running()?;
		let channel = self.channel(index)?;
		let dma = channel.dma.lock().unwrap();
		dma.slot(slot)?;
		self.wait_cell(
			channel.dma_cell,
			slot as u8,
			SignalState::Equal,
			timeout,
			&channel.events.dma,
		)?;
		Ok(())
	}

	/// Hands DMA slot `slot` to the device.
	pub fn dma_release(&self, index: u8, slot: usize) -> Result<()> {
		self.ensure_running()?;
		let channel = self.channel(index)?;
		let dma = channel.dma.lock().unwrap();
		dma.slot(slot)?;
		let snapshot = handshake::read_cell(&mut self.transport(), channel.dma_cell)?;
		if snapshot.signal(slot as u8) {
			return Err(Error::InvalidArgument("releasing a device-owned DMA slot"));
		}
		self.toggle_host(channel.dma_cell, slot as u8)?;
		Ok(())
	}

	/// Non-blocking probe for the next host-owned DMA slot.
	pub fn dma_next_ready(&self, index: u8) -> Result<Option<usize>> {
		self.ensure_running()?;
		let channel = self.channel(index)?;
		let snapshot = handshake::read_cell(&mut self.transport(), channel.dma_cell)?;
		Ok(channel.dma.lock().unwrap().next_ready(snapshot))
	}

	// ------------------------------------------------------------------
	// Interrupts & cell service
	// ------------------------------------------------------------------

	/// Spawns the interrupt thread; blocking waits park on events from here
	/// on instead of polling.
	pub fn enable_interrupts(self: &Arc<Self>, source: Box<dyn IrqSource>) -> Result<()> {
		let mut irq = self.irq.lock().unwrap();
		if irq.is_some() {
			return Err(Error::InvalidArgument("interrupts already enabled"));
		}
		*irq = Some(IrqThread::spawn(self.clone(), source));
		self.irq_enabled.store(true, Ordering::Release);
		info!("device {}: interrupt delivery enabled", self.name);
		Ok(())
	}

	/// Joins the interrupt thread and falls back to polling.
	pub fn disable_interrupts(&self) {
		let thread = self.irq.lock().unwrap().take();
		if let Some(thread) = thread {
			self.irq_enabled.store(false, Ordering::Release);
			thread.stop();
			info!("device {}: interrupt delivery disabled", self.name);
		}
	}

	pub fn interrupts_enabled(&self) -> bool {
		self.irq_enabled.load(Ordering::Acquire)
	}

	pub(crate) fn irq_masked(&self) -> bool {
		self.irq_masked.load(Ordering::Acquire)
	}

	/// Poll-path entry: called by the shared cyclic timer for devices
	/// without interrupt support.
	pub fn poll(&self) {
		if !self.interrupts_enabled() {
			self.service_cells();
		}
	}

	/// Re-reads every cell, signals events whose bits toggled and
	/// acknowledges device change-of-state commands. Sole toggler of
	/// notification events (the callers only wait on them).
	pub(crate) fn service_cells(&self) {
		if self.irq_masked() {
			return;
		}
		if let Err(err) = self.service_cells_inner() {
			debug!("device {}: cell service failed: {err}", self.name);
		}
	}

	fn service_cells_inner(&self) -> Result<()> {
		let sys_cell = self.sys_cell();
		let channels = self.channels.read().unwrap().clone();
		let mut sys_changed;
		let mut channel_changed = vec![0u32; channels.len()];
		let mut dma_changed = vec![false; channels.len()];
		{
			let mut transport = self.transport();
			let raw = transport.read_u32(sys_cell.offset)?;
			let prior = self.sys_last_cell.swap(raw, Ordering::AcqRel);
			sys_changed = raw ^ prior;

			// Acknowledge a pending system change-of-state command.
			let snapshot = CellSnapshot::from_raw(raw, sys_cell.width);
			if snapshot.signal(handshake::NETX_COS_BIT) {
				handshake::toggle_host_flags(
					&mut transport,
					sys_cell,
					1 << handshake::NETX_COS_BIT,
				)?;
				sys_changed |= 1 << handshake::NETX_COS_BIT;
			}

			for (i, channel) in channels.iter().enumerate() {
				let raw = transport.read_u32(channel.cell.offset)?;
				let prior = channel.last_cell.swap(raw, Ordering::AcqRel);
				let mut changed = raw ^ prior;
				let snapshot = CellSnapshot::from_raw(raw, channel.cell.width);
				if snapshot.signal(handshake::NETX_COS_BIT) {
					let cos = transport
						.read_u32(channel.layout.base + dpm::chan::COMMUNICATION_COS)?;
					channel.last_cos.store(cos, Ordering::Release);
					handshake::toggle_host_flags(
						&mut transport,
						channel.cell,
						1 << handshake::NETX_COS_BIT,
					)?;
					changed |= 1 << handshake::NETX_COS_BIT;
				}
				channel_changed[i] = changed;

				// DMA completion indications share the channel service pass.
				let dma_raw = transport.read_u32(channel.dma_cell.offset)?;
				let dma_prior = channel.last_dma_cell.swap(dma_raw, Ordering::AcqRel);
				dma_changed[i] = dma_raw != dma_prior;
			}
		}

		// Signal outside the transport lock.
		let sys_snapshot_bits = sys_changed & 0xFFFF | (sys_changed >> 16);
		for bit in 0..16u8 {
			if sys_snapshot_bits & (1 << bit) != 0
				&& let Some(event) = self.sys_events.for_bit(bit)
			{
				event.signal();
			}
		}
		for (i, channel) in channels.iter().enumerate() {
			let changed = channel_changed[i];
			let bits = changed & 0xFFFF | (changed >> 16);
			for bit in 0..16u8 {
				if bits & (1 << bit) != 0
					&& let Some(event) = channel.events.for_bit(bit)
				{
					event.signal();
				}
			}
			if dma_changed[i] {
				channel.events.dma.signal();
			}
		}

		// A rising system ERROR flag faults the device.
		let sys_raw = self.sys_last_cell.load(Ordering::Acquire);
		let snapshot = CellSnapshot::from_raw(sys_raw, sys_cell.width);
		if snapshot.netx_bit(handshake::SYS_ERROR_BIT)
			&& self.lifecycle() == LifecycleState::Running
		{
			let status = self.system_status().ok();
			error!(
				"device {}: firmware raised the ERROR flag (system error {:#010x})",
				self.name,
				status.map(|status| status.system_error).unwrap_or(0)
			);
			self.set_state(LifecycleState::Faulted);
		}
		Ok(())
	}

	// ------------------------------------------------------------------
	// Removal support
	// ------------------------------------------------------------------

	pub(crate) fn open_handles(&self) -> u32 {
		self.channels
			.read()
			.unwrap()
			.iter()
			.map(|channel| channel.open_count())
			.sum()
	}

	/// Forced-removal path: fail all current and future waiters with
	/// `DeviceRemoved` and wait for them to drain.
	pub(crate) fn mark_removed(&self) {
		self.removed.store(true, Ordering::Release);
		self.sys_events.signal_all();
		for channel in self.channels.read().unwrap().iter() {
			channel.events.signal_all();
		}
		while self.waiters.load(Ordering::Acquire) > 0 {
			std::thread::sleep(POLL_STEP);
		}
		self.disable_interrupts();
	}

	pub(crate) fn is_removed(&self) -> bool {
		self.removed.load(Ordering::Acquire)
	}

	// ------------------------------------------------------------------
	// Channel enumeration (after boot)
	// ------------------------------------------------------------------

	pub(crate) fn enumerate_channels(&self) -> Result<()> {
		let mut infos = Vec::with_capacity(dpm::MAX_CHANNELS);
		{
			let mut transport = self.transport();
			for i in 0..dpm::MAX_CHANNELS as u32 {
				let mut raw = [0u8; 16];
				transport.read(
					dpm::sys::CHANNEL_INFO + i * dpm::sys::CHANNEL_INFO_LEN,
					&mut raw,
					AccessFlags::empty(),
				)?;
				infos.push(ChannelInfo::from_bytes(&raw)?);
			}
		}

		let mut base = 0u32;
		let mut handshake_base = None;
		let mut channels = Vec::new();
		for info in infos {
			match info.kind {
				ChannelKind::System => {
					let size = if info.size != 0 { info.size } else { dpm::SYSTEM_CHANNEL_SIZE };
					base += size;
				}
				ChannelKind::Handshake => {
					handshake_base = Some(base);
					let size =
						if info.size != 0 { info.size } else { dpm::HANDSHAKE_CHANNEL_SIZE };
					base += size;
				}
				ChannelKind::Communication | ChannelKind::Application => {
					if channels.len() >= dpm::MAX_COM_CHANNELS {
						return Err(Error::Protocol("too many communication channels"));
					}
					let size = if info.size != 0 { info.size } else { 0x3D00 };
					let layout = if size <= 0x1D00 {
						ChannelLayout::small(base)
					} else {
						ChannelLayout::standard(base)
					};
					let width = info.handshake_width.unwrap_or(CellWidth::Bits16);
					let index = channels.len() as u8;
					let cell = match (info.handshake_position, handshake_base) {
						(HandshakePosition::DedicatedChannel, Some(hsk)) => CellLocation {
							offset: hsk
								+ 4 * (dpm::FIRST_COM_CHANNEL as u32 + index as u32),
							width,
						},
						_ => CellLocation { offset: base, width },
					};
					if (cell.offset as usize) >= self.dpm_len
						|| (base + size) as usize > self.dpm_len
					{
						return Err(Error::Protocol("channel outside the DPM window"));
					}
					channels.push(Arc::new(Channel::new(index, info, layout, cell)));
					base += size;
				}
				ChannelKind::Undefined | ChannelKind::NotAvailable | ChannelKind::Reserved => {}
			}
		}

		// With a dedicated handshake channel the system cell moves there.
		if let Some(hsk) = handshake_base {
			*self.sys_cell.lock().unwrap() =
				CellLocation { offset: hsk, width: CellWidth::Bits16 };
		}

		info!(
			"device {}: {} communication channel(s), handshake {}",
			self.name,
			channels.len(),
			if handshake_base.is_some() { "channel" } else { "inline" }
		);
		*self.channels.write().unwrap() = channels;
		Ok(())
	}
}

fn check_io_bounds(offset: u32, len: usize, area_size: u32) -> Result<()> {
	let end = (offset as usize).checked_add(len);
	match end {
		Some(end) if end <= area_size as usize => Ok(()),
		_ => Err(Error::OutOfBounds),
	}
}
