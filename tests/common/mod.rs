//! A behavioural model of a netX-style device behind the serial transport.
//!
//! Every DPM access of the toolkit becomes one framed transaction on the
//! simulated bus, so the model sees each read and write, runs one firmware
//! step in between and answers with the serial status byte — the same
//! observation point a real serially attached device has. The model boots
//! on a reset pulse (either straight from "flash" or via the ROM-loader
//! download mailbox), echoes mailbox requests as confirmations, loops
//! process data back, completes DMA handoffs and can be muted or faulted by
//! the test.

#![allow(dead_code)]

use std::io;
use std::sync::{Arc, Mutex};

use netx_toolkit::device::boot::{
	ROM_CELL, ROM_MAILBOX_SIZE, ROM_TO_HOST_BIT, ROM_TO_HOST_DATA, ROM_TO_HOST_LEN,
	ROM_TO_NETX_BIT, ROM_TO_NETX_DATA, ROM_TO_NETX_LEN,
};
use netx_toolkit::transport::SerialBus;

pub const DPM_LEN: usize = 0x4000;
pub const DEVICE_NUMBER: u32 = 0x0013_0FA4;
pub const SERIAL_NUMBER: u32 = 20004;

// System channel offsets.
const SYS_CELL: usize = 0x0B0;
const SYS_CONTROL_COMMAND: usize = 0x0B8;
const SYS_STATUS: usize = 0x0C0;

// The single communication channel starts after the system channel.
pub const CHANNEL_BASE: usize = 512;
const CHAN_CELL: usize = CHANNEL_BASE;
const CHAN_DMA_CELL: usize = CHANNEL_BASE + 4;
const CHAN_APP_COS: usize = CHANNEL_BASE + 8;
const CHAN_WATCHDOG: usize = CHANNEL_BASE + 12;
const CHAN_STATUS: usize = CHANNEL_BASE + 16;
const CHAN_EXT_STATUS: usize = CHANNEL_BASE + 80;
const CHAN_SEND_MBX: usize = CHANNEL_BASE + 512;
const CHAN_RECV_MBX: usize = CHANNEL_BASE + 2112;
const CHAN_PD1_OUT: usize = CHANNEL_BASE + 3712;
const CHAN_PD1_IN: usize = CHANNEL_BASE + 3776;
const CHAN_PD0_OUT: usize = CHANNEL_BASE + 4096;
const CHAN_PD0_IN: usize = CHANNEL_BASE + 9856;
const PD0_SIZE: usize = 5760;
const PD1_SIZE: usize = 64;
const MAILBOX_DATA: usize = 1596;

// Handshake bits (host/netx pairs).
const BIT_RESET: u8 = 0;
const BIT_READY: u8 = 0;
const BIT_ERROR: u8 = 1;
const BIT_HOST_COS: u8 = 2;
const BIT_NETX_COS: u8 = 3;
const BIT_SEND_MBX: u8 = 4;
const BIT_RECV_MBX: u8 = 5;
const BIT_PD0_OUT: u8 = 6;
const BIT_PD0_IN: u8 = 7;
const BIT_PD1_OUT: u8 = 8;
const BIT_PD1_IN: u8 = 9;

const RESET_COOKIE: u32 = 0x55AA_55AA;
const ROM_ID: u32 = 0x4C42_584E;
/// netX90 version cookie with arbitrary type/step bits set.
const NETX90_VERSION: u32 = 0x0912_340D;

/// How the model comes up after a reset pulse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootBehaviour {
	/// Firmware in flash: present the running DPM right away.
	Flash,
	/// Present the ROM loader and require a download first.
	RomLoader,
}

struct SimState {
	dpm: Vec<u8>,
	boot: BootBehaviour,
	/// Transactions until the post-reset image appears.
	countdown: Option<u32>,
	/// ROM loader protocol state.
	rom_active: bool,
	boot_after_rom_ack: bool,
	download: Vec<u8>,
	download_expected: Option<usize>,
	/// When set, the next boot raises ERROR instead of READY.
	boot_error: Option<u32>,
	muted: bool,
	transactions: usize,
}

impl SimState {
	fn read_u32(&self, offset: usize) -> u32 {
		u32::from_le_bytes(self.dpm[offset..offset + 4].try_into().unwrap())
	}

	fn write_u32(&mut self, offset: usize, value: u32) {
		self.dpm[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
	}

	fn host_flags(&self, cell: usize) -> u16 {
		u16::from_le_bytes(self.dpm[cell + 2..cell + 4].try_into().unwrap())
	}

	fn netx_flags(&self, cell: usize) -> u16 {
		u16::from_le_bytes(self.dpm[cell..cell + 2].try_into().unwrap())
	}

	fn set_netx_flags(&mut self, cell: usize, flags: u16) {
		self.dpm[cell..cell + 2].copy_from_slice(&flags.to_le_bytes());
	}

	fn signal(&self, cell: usize, bit: u8) -> bool {
		((self.host_flags(cell) ^ self.netx_flags(cell)) >> bit) & 1 == 1
	}

	/// Device-side toggle.
	fn toggle(&mut self, cell: usize, bit: u8) {
		let flags = self.netx_flags(cell) ^ (1 << bit);
		self.set_netx_flags(cell, flags);
	}

	fn set_netx_bit(&mut self, cell: usize, bit: u8, value: bool) {
		let mut flags = self.netx_flags(cell);
		if value {
			flags |= 1 << bit;
		} else {
			flags &= !(1 << bit);
		}
		self.set_netx_flags(cell, flags);
	}

	// 8-bit ROM cell accessors ({data[2], netx, host}).
	fn rom_host_flags(&self) -> u8 {
		self.dpm[ROM_CELL.offset as usize + 3]
	}

	fn rom_netx_flags(&self) -> u8 {
		self.dpm[ROM_CELL.offset as usize + 2]
	}

	fn rom_signal(&self, bit: u8) -> bool {
		((self.rom_host_flags() ^ self.rom_netx_flags()) >> bit) & 1 == 1
	}

	fn rom_toggle(&mut self, bit: u8) {
		self.dpm[ROM_CELL.offset as usize + 2] ^= 1 << bit;
	}

	/// One firmware step; runs on every bus transaction.
	fn step(&mut self) {
		self.check_reset_pulse();
		if let Some(left) = self.countdown {
			if left > 0 {
				self.countdown = Some(left - 1);
				return;
			}
			self.countdown = None;
			match self.boot {
				BootBehaviour::Flash => self.present_running(),
				BootBehaviour::RomLoader => self.present_rom_loader(),
			}
		}
		if self.muted {
			return;
		}
		if self.rom_active {
			self.serve_rom_mailbox();
		} else {
			self.serve_channel();
		}
	}

	fn check_reset_pulse(&mut self) {
		let reset_requested = self.signal(SYS_CELL, BIT_RESET);
		if reset_requested && self.read_u32(SYS_CONTROL_COMMAND) == RESET_COOKIE {
			self.dpm.fill(0);
			self.rom_active = false;
			self.boot_after_rom_ack = false;
			self.download.clear();
			self.download_expected = None;
			self.countdown = Some(2);
		}
	}

	fn present_rom_loader(&mut self) {
		self.write_u32(0x100, ROM_ID);
		self.write_u32(0xFC, NETX90_VERSION);
		self.rom_active = true;
	}

	fn serve_rom_mailbox(&mut self) {
		// Boot the downloaded image once the host mirrored the result ack.
		if self.boot_after_rom_ack {
			if !self.rom_signal(ROM_TO_HOST_BIT) {
				self.boot_after_rom_ack = false;
				self.rom_active = false;
				self.present_running();
			}
			return;
		}

		// Host pushed a chunk.
		if self.rom_signal(ROM_TO_NETX_BIT) {
			let len = self.read_u32(ROM_TO_NETX_LEN as usize) as usize;
			let data = ROM_TO_NETX_DATA as usize;
			let chunk = self.dpm[data..data + len.min(ROM_MAILBOX_SIZE)].to_vec();
			self.download.extend_from_slice(&chunk);
			self.rom_toggle(ROM_TO_NETX_BIT);

			// The common header carries the expected total length.
			if self.download_expected.is_none() && self.download.len() >= 128 {
				let data_size =
					u32::from_le_bytes(self.download[72..76].try_into().unwrap()) as usize;
				let data_start =
					u32::from_le_bytes(self.download[76..80].try_into().unwrap()) as usize;
				self.download_expected = Some(data_start + data_size);
			}
			if let Some(expected) = self.download_expected
				&& self.download.len() >= expected
			{
				// Image complete: report success, boot after the ack.
				self.write_u32(ROM_TO_HOST_LEN as usize, 1);
				self.dpm[ROM_TO_HOST_DATA as usize] = 0;
				self.rom_toggle(ROM_TO_HOST_BIT);
				self.boot_after_rom_ack = true;
			}
		}
	}

	/// Builds the running-firmware DPM image from scratch and raises READY.
	fn present_running(&mut self) {
		self.dpm.fill(0);

		// System info block.
		self.dpm[0..4].copy_from_slice(b"netX");
		self.write_u32(4, DPM_LEN as u32);
		self.write_u32(8, DEVICE_NUMBER);
		self.write_u32(12, SERIAL_NUMBER);
		self.dpm[40..42].copy_from_slice(&20u16.to_le_bytes()); // device class
		self.dpm[42] = 2; // hardware revision

		// Channel info: system + one communication channel.
		let info = 0x30;
		self.dpm[info] = 3; // system
		self.dpm[info + 2] = 0x02; // 16-bit cells at the channel start
		self.dpm[info + 4..info + 8].copy_from_slice(&512u32.to_le_bytes());
		let info = 0x40;
		self.dpm[info] = 5; // communication
		self.dpm[info + 2] = 0x02;
		self.dpm[info + 3] = 7;
		self.dpm[info + 4..info + 8].copy_from_slice(&0x3D00u32.to_le_bytes());
		for i in 2..8 {
			self.dpm[0x30 + i * 16] = 1; // not available
		}

		// System status block.
		self.write_u32(SYS_STATUS + 4, 1); // system status OK
		self.write_u32(SYS_STATUS + 16, 1); // time since start

		// Channel common status: READY|RUN, default handshake modes.
		self.write_u32(CHAN_STATUS, 0x0000_0003);
		self.write_u32(CHAN_STATUS + 20, 0xAFFE_0001); // device watchdog value

		// Extended status: two state-field records at the block tail.
		let field = CHAN_EXT_STATUS + 236;
		self.dpm[field + 3] = 2;
		self.dpm[field + 4] = 0; // standard input
		self.dpm[field + 5] = 3; // slave diagnostic
		self.dpm[field + 6..field + 8].copy_from_slice(&125u16.to_le_bytes());
		self.dpm[field + 8..field + 12].copy_from_slice(&0x40u32.to_le_bytes());
		self.dpm[field + 12] = 8; // standard output
		self.dpm[field + 13] = 4; // command table
		self.dpm[field + 14..field + 16].copy_from_slice(&8u16.to_le_bytes());

		// Firmware is up (or failed to come up).
		if let Some(code) = self.boot_error {
			self.write_u32(SYS_STATUS + 8, code);
			self.write_u32(SYS_STATUS + 12, code);
			self.set_netx_bit(SYS_CELL, BIT_ERROR, true);
		} else {
			self.set_netx_bit(SYS_CELL, BIT_READY, true);
		}
	}

	fn serve_channel(&mut self) {
		if self.netx_flags(SYS_CELL) & (1 << BIT_READY) == 0 {
			return;
		}

		// Acknowledge host change-of-state commands.
		if self.signal(CHAN_CELL, BIT_HOST_COS) {
			self.toggle(CHAN_CELL, BIT_HOST_COS);
		}

		// Mailbox: consume a request, acknowledge, answer with the echo
		// confirmation once the receive mailbox is free.
		if self.signal(CHAN_CELL, BIT_SEND_MBX) && !self.signal(CHAN_CELL, BIT_RECV_MBX) {
			let data = CHAN_SEND_MBX + 4;
			let mut header = [0u8; 40];
			header.copy_from_slice(&self.dpm[data..data + 40]);
			let len = u32::from_le_bytes(header[16..20].try_into().unwrap()) as usize;
			let payload = self.dpm[data + 40..data + 40 + len.min(MAILBOX_DATA - 40)].to_vec();
			self.toggle(CHAN_CELL, BIT_SEND_MBX);

			// Confirmation: command | 1, state 0, src_id/id/payload echoed.
			let cmd = u32::from_le_bytes(header[28..32].try_into().unwrap());
			header[28..32].copy_from_slice(&(cmd | 1).to_le_bytes());
			header[24..28].copy_from_slice(&0u32.to_le_bytes());
			let out = CHAN_RECV_MBX + 4;
			self.dpm[out..out + 40].copy_from_slice(&header);
			self.dpm[out + 40..out + 40 + payload.len()].copy_from_slice(&payload);
			self.toggle(CHAN_CELL, BIT_RECV_MBX);
		}

		// Process data: on an output toggle, loop the data back into the
		// input area, acknowledge and signal an input update.
		if self.signal(CHAN_CELL, BIT_PD0_OUT) {
			let output = self.dpm[CHAN_PD0_OUT..CHAN_PD0_OUT + PD0_SIZE].to_vec();
			self.dpm[CHAN_PD0_IN..CHAN_PD0_IN + PD0_SIZE].copy_from_slice(&output);
			self.toggle(CHAN_CELL, BIT_PD0_OUT);
			if !self.signal(CHAN_CELL, BIT_PD0_IN) {
				self.toggle(CHAN_CELL, BIT_PD0_IN);
			}
		}
		if self.signal(CHAN_CELL, BIT_PD1_OUT) {
			let output = self.dpm[CHAN_PD1_OUT..CHAN_PD1_OUT + PD1_SIZE].to_vec();
			self.dpm[CHAN_PD1_IN..CHAN_PD1_IN + PD1_SIZE].copy_from_slice(&output);
			self.toggle(CHAN_CELL, BIT_PD1_OUT);
			if !self.signal(CHAN_CELL, BIT_PD1_IN) {
				self.toggle(CHAN_CELL, BIT_PD1_IN);
			}
		}

		// DMA: complete every slot the host released.
		for bit in 0..8u8 {
			if self.signal(CHAN_DMA_CELL, bit) {
				self.toggle(CHAN_DMA_CELL, bit);
			}
		}
	}
}

/// The bus half handed to `Transport::serial`.
pub struct SimBus {
	state: Arc<Mutex<SimState>>,
}

impl SerialBus for SimBus {
	fn transfer(&mut self, buf: &mut [u8]) -> io::Result<()> {
		let mut state = self.state.lock().unwrap();
		state.transactions += 1;
		let is_read = buf[0] & 0x80 != 0;
		let addr =
			((buf[0] as usize & 0x0F) << 16) | ((buf[1] as usize) << 8) | buf[2] as usize;
		if is_read {
			state.step();
			for (i, byte) in buf[4..].iter_mut().enumerate() {
				*byte = state.dpm.get(addr + i).copied().unwrap_or(0);
			}
		} else {
			let payload = buf[3..].to_vec();
			let end = (addr + payload.len()).min(state.dpm.len());
			if addr < end {
				let n = end - addr;
				state.dpm[addr..end].copy_from_slice(&payload[..n]);
			}
			state.step();
		}
		buf[0] = 0x11;
		Ok(())
	}
}

/// Test-side control of the model.
#[derive(Clone)]
pub struct SimHandle {
	state: Arc<Mutex<SimState>>,
}

impl SimHandle {
	/// Stops all firmware reactions (acks, echoes, completions).
	pub fn set_muted(&self, muted: bool) {
		self.state.lock().unwrap().muted = muted;
	}

	/// Makes the next boot raise the ERROR flag instead of READY.
	pub fn fail_next_boot(&self, code: u32) {
		self.state.lock().unwrap().boot_error = Some(code);
	}

	/// Raises the fatal ERROR flag with the given system error code.
	pub fn raise_error(&self, code: u32) {
		let mut state = self.state.lock().unwrap();
		state.write_u32(SYS_STATUS + 8, code);
		state.set_netx_bit(SYS_CELL, BIT_ERROR, true);
	}

	/// Publishes a new communication-COS word and signals the change.
	pub fn pulse_cos(&self, cos: u32) {
		let mut state = self.state.lock().unwrap();
		state.write_u32(CHAN_STATUS, cos);
		state.toggle(CHAN_CELL, BIT_NETX_COS);
	}

	pub fn transactions(&self) -> usize {
		self.state.lock().unwrap().transactions
	}

	/// Raw DPM word, for assertions on host-written state.
	pub fn peek_u32(&self, offset: usize) -> u32 {
		self.state.lock().unwrap().read_u32(offset)
	}

	/// Value the host last wrote into the channel watchdog cell.
	pub fn watchdog_cell(&self) -> u32 {
		self.peek_u32(CHAN_WATCHDOG)
	}

	pub fn app_cos(&self) -> u32 {
		self.peek_u32(CHAN_APP_COS)
	}

	/// Bytes accepted through the ROM-loader mailbox.
	pub fn downloaded(&self) -> Vec<u8> {
		self.state.lock().unwrap().download.clone()
	}
}

/// Builds a simulated device. It comes up blank; the first reset pulse
/// makes it present either flash firmware or the ROM loader.
pub fn sim_device(boot: BootBehaviour) -> (SimBus, SimHandle) {
	let state = Arc::new(Mutex::new(SimState {
		dpm: vec![0u8; DPM_LEN],
		boot,
		countdown: None,
		rom_active: false,
		boot_after_rom_ack: false,
		download: Vec::new(),
		download_expected: None,
		boot_error: None,
		muted: false,
		transactions: 0,
	}));
	(SimBus { state: state.clone() }, SimHandle { state })
}

/// A minimal valid `.NXI`-style firmware container (same layout the crate's
/// unit tests build).
pub fn build_firmware(payload: &[u8]) -> Vec<u8> {
	let mut file = vec![0u8; 128];
	file[0..4].copy_from_slice(&0x4958_4E2Eu32.to_le_bytes()); // ".NXI"
	file[64..68].copy_from_slice(&0x0003_0000u32.to_le_bytes());
	file[72..76].copy_from_slice(&(payload.len() as u32).to_le_bytes());
	file[76..80].copy_from_slice(&128u32.to_le_bytes());
	let digest = crc32fast::hash(payload);
	file[84..88].copy_from_slice(&digest.to_le_bytes());
	let crc = crc32fast::hash(&file[..124]);
	file[124..128].copy_from_slice(&crc.to_le_bytes());
	file.extend_from_slice(payload);
	file
}
