//! Cyclic process data, change-of-state, DMA rotation and diagnostics
//! against the simulated device (which loops output data back to input).

mod common;

use std::time::Duration;

use common::{BootBehaviour, DPM_LEN, sim_device};
use netx_toolkit::channel::{IoArea, IoConfig, StateFieldKind};
use netx_toolkit::device::{BootImages, DeviceInstance};
use netx_toolkit::dma::{DmaBuffer, DmaMode};
use netx_toolkit::dpm::{AppCos, IoMode};
use netx_toolkit::error::Error;
use netx_toolkit::transport::Transport;

const TIMEOUT: Duration = Duration::from_millis(200);

fn running_device() -> (std::sync::Arc<DeviceInstance>, common::SimHandle) {
	let (bus, handle) = sim_device(BootBehaviour::Flash);
	let device = DeviceInstance::new("cifX0", Transport::serial(Box::new(bus), DPM_LEN));
	device.start(&BootImages::default()).unwrap();
	(device, handle)
}

#[test]
fn process_data_loops_back() {
	let (device, _handle) = running_device();
	let pattern: Vec<u8> = (0u8..32).collect();
	device.io_write(0, IoArea::Pd0Output, 0, &pattern, TIMEOUT).unwrap();

	let mut input = vec![0u8; 32];
	device.io_read(0, IoArea::Pd0Input, 0, &mut input, TIMEOUT).unwrap();
	assert_eq!(input, pattern);
}

#[test]
fn high_prio_area_is_independent() {
	let (device, _handle) = running_device();
	device.io_write(0, IoArea::Pd1Output, 8, &[0x42; 8], TIMEOUT).unwrap();
	let mut input = vec![0u8; 8];
	device.io_read(0, IoArea::Pd1Input, 8, &mut input, TIMEOUT).unwrap();
	assert_eq!(input, [0x42; 8]);
}

#[test]
fn io_bounds_are_enforced() {
	let (device, _handle) = running_device();
	let mut buf = [0u8; 16];
	// 5760-byte standard area, 64-byte high-prio area.
	assert!(matches!(
		device.io_read(0, IoArea::Pd0Input, 5760, &mut buf, TIMEOUT),
		Err(Error::OutOfBounds)
	));
	assert!(matches!(
		device.io_write(0, IoArea::Pd1Output, 60, &[0; 8], TIMEOUT),
		Err(Error::OutOfBounds)
	));
	// Direction mismatches are caller bugs.
	assert!(matches!(
		device.io_read(0, IoArea::Pd0Output, 0, &mut buf, TIMEOUT),
		Err(Error::InvalidArgument(_))
	));
}

#[test]
fn uncontrolled_mode_skips_the_handshake() {
	let (device, handle) = running_device();
	device
		.set_io_config(
			0,
			IoConfig {
				input_mode: IoMode::Uncontrolled,
				output_mode: IoMode::Uncontrolled,
			},
		)
		.unwrap();
	// The device is muted: nothing acknowledges, yet accesses complete.
	handle.set_muted(true);
	device.io_write(0, IoArea::Pd0Output, 0, &[0x77; 4], TIMEOUT).unwrap();
	let mut buf = [0u8; 4];
	device.io_read(0, IoArea::Pd0Input, 0, &mut buf, TIMEOUT).unwrap();
	// No loopback happened; the input area is untouched.
	assert_eq!(buf, [0; 4]);
}

#[test]
fn wait_cos_sees_toggled_bits() {
	let (device, handle) = running_device();
	let waiter = {
		let device = device.clone();
		std::thread::spawn(move || device.wait_cos(0, 0x4, Duration::from_secs(2)))
	};
	std::thread::sleep(Duration::from_millis(30));
	handle.pulse_cos(0x0000_0007); // READY|RUN|BUS_ON
	let cos = waiter.join().unwrap().unwrap();
	assert_eq!(cos, 7);
}

#[test]
fn wait_cos_times_out_without_changes() {
	let (device, _handle) = running_device();
	assert!(matches!(
		device.wait_cos(0, 0xFFFF_FFFF, Duration::from_millis(50)),
		Err(Error::Timeout)
	));
}

#[test]
fn watchdog_copies_the_device_value() {
	let (device, handle) = running_device();
	let value = device.trigger_watchdog(0).unwrap();
	assert_eq!(value, 0xAFFE_0001);
	assert_eq!(handle.watchdog_cell(), 0xAFFE_0001);
}

#[test]
fn host_ready_updates_the_application_cos() {
	let (device, handle) = running_device();
	device.set_host_ready(0, true, Duration::ZERO).unwrap();
	assert_ne!(handle.app_cos() & AppCos::APPLICATION_READY.bits(), 0);
	device.set_host_ready(0, false, Duration::ZERO).unwrap();
	assert_eq!(handle.app_cos() & AppCos::APPLICATION_READY.bits(), 0);
}

#[test]
fn state_fields_are_parsed_from_the_extended_block() {
	let (device, _handle) = running_device();
	let fields = device.state_fields(0).unwrap();
	assert_eq!(fields.len(), 2);
	assert_eq!(fields[0].kind, StateFieldKind::SlaveDiagnostic);
	assert_eq!(fields[0].entries, 125);
	assert_eq!(fields[0].offset, 0x40);
	assert_eq!(fields[1].kind, StateFieldKind::Commands);
}

#[test]
fn dma_single_slot_strictly_alternates() {
	let (device, _handle) = running_device();
	let backing: &'static mut [u8] = Box::leak(vec![0u8; 4096].into_boxed_slice());
	let buffer = unsafe {
		DmaBuffer::new(
			DmaMode::Output,
			4096,
			0x3000_0000,
			std::ptr::NonNull::new(backing.as_mut_ptr()).unwrap(),
		)
	};
	device.configure_dma(0, [buffer]).unwrap();

	for _ in 0..4 {
		device.dma_claim(0, 0, TIMEOUT).unwrap();
		// Claiming again without releasing still sees a host-owned slot.
		device.dma_claim(0, 0, Duration::ZERO).unwrap();
		device.dma_release(0, 0).unwrap();
		// The model completes the slot on the next bus transaction, so the
		// following claim observes a full device round trip.
		device.dma_claim(0, 0, TIMEOUT).unwrap();
		device.dma_release(0, 0).unwrap();
	}
	assert_eq!(device.dma_next_ready(0).unwrap(), Some(0));
}

#[test]
fn dma_next_ready_skips_device_owned_slots() {
	let (device, _handle) = running_device();
	let buffers: Vec<DmaBuffer> = (0..2)
		.map(|_| {
			let backing: &'static mut [u8] = Box::leak(vec![0u8; 1024].into_boxed_slice());
			unsafe {
				DmaBuffer::new(
					DmaMode::Input,
					1024,
					0x3100_0000,
					std::ptr::NonNull::new(backing.as_mut_ptr()).unwrap(),
				)
			}
		})
		.collect();
	device.configure_dma(0, buffers).unwrap();
	assert_eq!(device.dma_next_ready(0).unwrap(), Some(0));
	assert_eq!(device.dma_next_ready(0).unwrap(), Some(1));
}
