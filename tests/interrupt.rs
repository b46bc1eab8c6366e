//! Interrupt-driven operation: waiters park on notification events and the
//! delivery thread's cell service wakes them.

mod common;

use std::io;
use std::time::Duration;

use common::{BootBehaviour, DPM_LEN, sim_device};
use netx_toolkit::device::{BootImages, DeviceInstance};
use netx_toolkit::interrupt::IrqSource;
use netx_toolkit::packet::{HEADER_LEN, Packet};
use netx_toolkit::transport::Transport;

const RECV_MAX: usize = HEADER_LEN + 1596;

/// A free-running interrupt line, modelling a level-triggered device that
/// always has something to report.
struct TickingIrq;

impl IrqSource for TickingIrq {
	fn wait(&mut self, timeout: Duration) -> io::Result<bool> {
		std::thread::sleep(timeout.min(Duration::from_millis(1)));
		Ok(true)
	}
}

#[test]
fn mailbox_echo_under_interrupts() {
	let (bus, _handle) = sim_device(BootBehaviour::Flash);
	let device = DeviceInstance::new("irq0", Transport::serial(Box::new(bus), DPM_LEN));
	device.start(&BootImages::default()).unwrap();
	device.enable_interrupts(Box::new(TickingIrq)).unwrap();
	assert!(device.interrupts_enabled());

	for round in 0..4u32 {
		let request = Packet::request(0x0000_0086, round, vec![round as u8; 16]);
		device.put_packet(0, &request, Duration::from_millis(500)).unwrap();
		let confirmation =
			device.get_packet(0, RECV_MAX, Duration::from_millis(500)).unwrap();
		assert_eq!(confirmation.header.src_id, round);
	}

	device.disable_interrupts();
	assert!(!device.interrupts_enabled());
}

#[test]
fn cos_waiters_are_woken_by_the_service_pass() {
	let (bus, handle) = sim_device(BootBehaviour::Flash);
	let device = DeviceInstance::new("irq1", Transport::serial(Box::new(bus), DPM_LEN));
	device.start(&BootImages::default()).unwrap();
	device.enable_interrupts(Box::new(TickingIrq)).unwrap();

	let waiter = {
		let device = device.clone();
		std::thread::spawn(move || device.wait_cos(0, 0x2, Duration::from_secs(2)))
	};
	std::thread::sleep(Duration::from_millis(50));
	handle.pulse_cos(0x0000_0001); // RUN bit cleared relative to READY|RUN
	let cos = waiter.join().unwrap().unwrap();
	assert_eq!(cos, 1);
	device.disable_interrupts();
}

#[test]
fn double_enable_is_rejected() {
	let (bus, _handle) = sim_device(BootBehaviour::Flash);
	let device = DeviceInstance::new("irq2", Transport::serial(Box::new(bus), DPM_LEN));
	device.start(&BootImages::default()).unwrap();
	device.enable_interrupts(Box::new(TickingIrq)).unwrap();
	assert!(device.enable_interrupts(Box::new(TickingIrq)).is_err());
	device.disable_interrupts();
}
