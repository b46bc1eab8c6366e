//! Mailbox traffic against the simulated device: request/confirmation
//! echo, ordering, size limits and timeout behaviour.

mod common;

use std::time::{Duration, Instant};

use common::{BootBehaviour, DPM_LEN, sim_device};
use netx_toolkit::device::{BootImages, DeviceInstance};
use netx_toolkit::error::Error;
use netx_toolkit::packet::{HEADER_LEN, Packet};
use netx_toolkit::transport::Transport;

const RECV_MAX: usize = HEADER_LEN + 1596;

fn running_device() -> (std::sync::Arc<DeviceInstance>, common::SimHandle) {
	let (bus, handle) = sim_device(BootBehaviour::Flash);
	let device = DeviceInstance::new("cifX0", Transport::serial(Box::new(bus), DPM_LEN));
	device.start(&BootImages::default()).unwrap();
	(device, handle)
}

#[test]
fn request_is_echoed_as_confirmation() {
	let (device, _handle) = running_device();
	let request = Packet::request(0x0000_0086, 0xDEAD_BEEF, Vec::new());
	device.put_packet(0, &request, Duration::from_millis(100)).unwrap();

	let confirmation = device.get_packet(0, RECV_MAX, Duration::from_millis(100)).unwrap();
	assert_eq!(confirmation.header.cmd, 0x0000_0087);
	assert_eq!(confirmation.header.state, 0);
	assert_eq!(confirmation.header.src_id, 0xDEAD_BEEF);
	assert_eq!(confirmation.header.len, 0);
	assert!(confirmation.header.is_confirmation());
}

#[test]
fn confirmations_arrive_in_submission_order() {
	let (device, _handle) = running_device();
	for src_id in [0x1111u32, 0x2222] {
		let request = Packet::request(0x0000_0086, src_id, vec![src_id as u8]);
		device.put_packet(0, &request, Duration::from_millis(100)).unwrap();
		// The model holds one confirmation at a time, so drain in between.
		let confirmation =
			device.get_packet(0, RECV_MAX, Duration::from_millis(100)).unwrap();
		assert_eq!(confirmation.header.src_id, src_id);
		assert_eq!(confirmation.payload, vec![src_id as u8]);
	}
}

#[test]
fn payload_roundtrips_bit_exact() {
	let (device, _handle) = running_device();
	let payload: Vec<u8> = (0..=255u8).cycle().take(1400).collect();
	let request = Packet::request(0x0000_2F00, 9, payload.clone());
	device.put_packet(0, &request, Duration::from_millis(100)).unwrap();
	let confirmation = device.get_packet(0, RECV_MAX, Duration::from_millis(100)).unwrap();
	assert_eq!(confirmation.payload, payload);
}

#[test]
fn oversized_packets_are_rejected() {
	let (device, _handle) = running_device();
	// Largest packet that still fits the 1596-byte mailbox data area.
	let fits = Packet::request(0x0000_0086, 1, vec![0; 1596 - HEADER_LEN]);
	device.put_packet(0, &fits, Duration::from_millis(100)).unwrap();
	device.get_packet(0, RECV_MAX, Duration::from_millis(100)).unwrap();

	let too_big = Packet::request(0x0000_0086, 2, vec![0; 1596 - HEADER_LEN + 1]);
	let err = device.put_packet(0, &too_big, Duration::from_millis(100)).unwrap_err();
	assert!(matches!(err, Error::PacketTooLarge));
}

#[test]
fn small_receive_buffers_are_detected() {
	let (device, _handle) = running_device();
	let request = Packet::request(0x0000_0086, 3, vec![0xAB; 100]);
	device.put_packet(0, &request, Duration::from_millis(100)).unwrap();
	let err = device.get_packet(0, 64, Duration::from_millis(100)).unwrap_err();
	assert!(matches!(err, Error::BufferTooSmall));
	// The packet is still there and readable with a big enough buffer.
	let confirmation = device.get_packet(0, RECV_MAX, Duration::from_millis(100)).unwrap();
	assert_eq!(confirmation.payload.len(), 100);
}

#[test]
fn get_packet_timeout_is_observed() {
	let (device, _handle) = running_device();
	let started = Instant::now();
	let err = device.get_packet(0, RECV_MAX, Duration::from_millis(250)).unwrap_err();
	let elapsed = started.elapsed();
	assert!(matches!(err, Error::Timeout));
	assert!(elapsed >= Duration::from_millis(250), "returned early: {elapsed:?}");
	assert!(elapsed < Duration::from_millis(350), "returned late: {elapsed:?}");
}

#[test]
fn put_packet_timeout_against_a_dead_device() {
	let (device, handle) = running_device();
	// First put occupies the mailbox; with the device muted it is never
	// acknowledged.
	handle.set_muted(true);
	let request = Packet::request(0x0000_0086, 4, Vec::new());
	device.put_packet(0, &request, Duration::from_millis(100)).unwrap();

	let started = Instant::now();
	let err = device.put_packet(0, &request, Duration::from_millis(1)).unwrap_err();
	let elapsed = started.elapsed();
	assert!(matches!(err, Error::Timeout));
	assert!(elapsed >= Duration::from_millis(1));
	assert!(elapsed < Duration::from_millis(50), "took {elapsed:?}");
}

#[test]
fn zero_timeout_probe_reports_no_packet() {
	let (device, _handle) = running_device();
	let err = device.get_packet(0, RECV_MAX, Duration::ZERO).unwrap_err();
	assert!(matches!(err, Error::NoPacket));
}
