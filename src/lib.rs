//! Userspace host toolkit for netX fieldbus communication controllers.
//!
//! The toolkit mediates between an application and a family of intelligent
//! fieldbus controllers that expose a dual-port memory window (DPM). It
//! covers device bring-up (chip detection, bootloader and firmware download,
//! reset), the handshake-cell protocol engine, per-channel mailboxes and
//! cyclic process data, DMA buffer rotation and the process-wide device
//! registry.
//!
//! Host-OS specifics stay outside: integrators hand the toolkit a mapped DPM
//! window (or a [`transport::SerialBus`] implementation for SPI-attached
//! devices) and firmware images, and receive [`registry::ChannelHandle`]s in
//! return.

#![warn(rust_2018_idioms)]

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate log;

pub mod channel;
pub mod config;
pub mod device;
pub mod dma;
pub mod dpm;
pub mod env;
pub mod error;
pub mod firmware;
pub mod interrupt;
mod mem;
pub mod packet;
pub mod registry;
pub mod transport;

pub use crate::error::{Error, Result};
pub use crate::mem::DpmWindow;
pub use crate::registry::{ChannelHandle, DriverHandle};
