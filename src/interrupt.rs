//! Interrupt delivery and the shared cyclic poll timer.
//!
//! Interrupt-capable devices get one delivery thread each. The thread
//! blocks in the integrator's [`IrqSource`] (typically a read on a
//! userspace-IRQ file descriptor or an IOMMU event descriptor), re-reads the
//! handshake cells on every interrupt and signals the notification events;
//! caller threads only ever wait on those events. Devices without an
//! interrupt line are serviced by one process-wide cyclic timer instead.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::device::DeviceInstance;

/// Wake-up interval of the delivery thread to notice a stop request even on
/// a silent line.
const STOP_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// A blocking interrupt line.
///
/// `wait` returns `Ok(true)` when the device raised an interrupt within the
/// timeout and `Ok(false)` on a bare timeout. `rearm` re-enables the line
/// after handling (e.g. writing `1` to a uio descriptor).
pub trait IrqSource: Send + 'static {
	fn wait(&mut self, timeout: Duration) -> io::Result<bool>;

	fn rearm(&mut self) -> io::Result<()> {
		Ok(())
	}
}

/// Per-device interrupt delivery thread, joined on stop.
pub(crate) struct IrqThread {
	stop: Arc<AtomicBool>,
	handle: Option<JoinHandle<()>>,
}

impl IrqThread {
	pub(crate) fn spawn(device: Arc<DeviceInstance>, mut source: Box<dyn IrqSource>) -> Self {
		let stop = Arc::new(AtomicBool::new(false));
		let thread_stop = stop.clone();
		let name = format!("netx-irq-{}", device.name());
		let handle = std::thread::Builder::new()
			.name(name)
			.spawn(move || {
				while !thread_stop.load(Ordering::Acquire) {
					match source.wait(STOP_CHECK_INTERVAL) {
						Ok(true) => {
							device.service_cells();
							if let Err(err) = source.rearm() {
								warn!(
									"device {}: interrupt rearm failed: {err}",
									device.name()
								);
							}
						}
						Ok(false) => {}
						Err(err) => {
							warn!("device {}: interrupt wait failed: {err}", device.name());
							std::thread::sleep(STOP_CHECK_INTERVAL);
						}
					}
				}
			})
			.expect("spawning the interrupt thread");
		Self { stop, handle: Some(handle) }
	}

	pub(crate) fn stop(mut self) {
		self.join();
	}

	fn join(&mut self) {
		self.stop.store(true, Ordering::Release);
		if let Some(handle) = self.handle.take() {
			let _ = handle.join();
		}
	}
}

impl Drop for IrqThread {
	fn drop(&mut self) {
		self.join();
	}
}

/// The shared poll thread servicing every device without interrupt support.
pub(crate) struct CyclicTimer {
	stop: Arc<AtomicBool>,
	handle: Option<JoinHandle<()>>,
}

impl CyclicTimer {
	pub(crate) fn spawn(interval: Duration, tick: impl Fn() + Send + 'static) -> Self {
		let stop = Arc::new(AtomicBool::new(false));
		let thread_stop = stop.clone();
		let handle = std::thread::Builder::new()
			.name("netx-cyclic".into())
			.spawn(move || {
				while !thread_stop.load(Ordering::Acquire) {
					tick();
					std::thread::sleep(interval);
				}
			})
			.expect("spawning the cyclic timer thread");
		Self { stop, handle: Some(handle) }
	}

	pub(crate) fn stop(mut self) {
		self.join();
	}

	fn join(&mut self) {
		self.stop.store(true, Ordering::Release);
		if let Some(handle) = self.handle.take() {
			let _ = handle.join();
		}
	}
}

impl Drop for CyclicTimer {
	fn drop(&mut self) {
		self.join();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::AtomicUsize;

	#[test]
	fn cyclic_timer_ticks_and_stops() {
		let ticks = Arc::new(AtomicUsize::new(0));
		let counted = ticks.clone();
		let timer = CyclicTimer::spawn(Duration::from_millis(1), move || {
			counted.fetch_add(1, Ordering::Relaxed);
		});
		std::thread::sleep(Duration::from_millis(20));
		timer.stop();
		let after_stop = ticks.load(Ordering::Relaxed);
		assert!(after_stop > 0);
		std::thread::sleep(Duration::from_millis(10));
		assert_eq!(ticks.load(Ordering::Relaxed), after_stop);
	}
}
