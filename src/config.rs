use core::time::Duration;

/// Poll step used by blocking waits when no interrupt line is available.
pub const POLL_STEP: Duration = Duration::from_millis(1);

/// Interval of the shared cyclic timer that services non-interrupt devices.
pub const CYCLIC_INTERVAL: Duration = Duration::from_millis(500);

/// Time the firmware is granted to raise the READY flag after a reset.
pub const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Mailbox timeout for a single bootloader/firmware download chunk.
pub const DOWNLOAD_CHUNK_TIMEOUT: Duration = Duration::from_millis(5000);

/// Default timeout for mailbox transfers issued by the toolkit itself.
pub const MAILBOX_TIMEOUT: Duration = Duration::from_millis(1000);

/// Maximum outstanding request packets tracked per channel.
pub const CORRELATION_TABLE_SIZE: usize = 128;

/// Default transaction size limit of the serial (SPI-framed) transport.
pub const SERIAL_CHUNK_SIZE: usize = 1024;

/// Number of DMA buffer slots per device.
pub const DMA_SLOTS: usize = 8;
