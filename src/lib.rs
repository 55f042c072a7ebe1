#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
//!
//! DFU bootloader engine for a `usb-device` device that keeps its firmware
//! in SPI NOR flash.
//!
//! ## About
//!
//! The device exposes one DFU interface in DFU mode, with one alternate
//! setting per flash zone (bitstreams, secondary bootloaders, user data, a
//! small RTC area on a second chip). The host selects a zone with
//! `SET_INTERFACE` and streams an image with `DFU_DNLOAD`, or reads a zone
//! back with `DFU_UPLOAD`.
//!
//! Received data goes to a RAM double buffer of two 4 KiB windows. Flash is
//! only written from [`DfuClass::tick()`], one non-blocking SPI command per
//! call, so the USB stack keeps being serviced while a sector erase is in
//! progress.
//!
//! Flash wear is kept low by comparing every window with the flash contents
//! first:
//!
//! * equal: nothing is written;
//! * only `1 -> 0` bit changes: the window is programmed without erasing;
//! * otherwise: the sector is erased, then programmed.
//!
//! Each window is verified again after programming. A window that can't be
//! written after [`DfuFlash::MAX_RETRY`] attempts is abandoned and the device
//! is rebooted through [`Reboot`].
//!
//! ### Limitations
//!
//! * Maximum USB transfer size is limited to what `usb-device` supports
//! for control endpoint transfers, which is `128` bytes by default.
//!
//! * iString field in `DFU_GETSTATUS` is always `0`.
//!
//! * Zones and erase size are fixed at compile time.
//!
//! ## Example
//!
//! ```ignore
//! use spiflash_dfu::*;
//! use usb_device::prelude::*;
//!
//! struct Board { /* SPI controller, chip selects */ }
//!
//! impl DfuFlash for Board {
//!     fn select(&mut self, chip: FlashChip) { /* ... */ }
//!     fn read(&mut self, addr: u32, dst: &mut [u8]) -> Result<(), FlashError> { /* 0x03 */ }
//!     fn page_program(&mut self, addr: u32, src: &[u8]) -> Result<(), FlashError> { /* 0x02 */ }
//!     fn erase(&mut self, addr: u32, size: EraseSize) -> Result<(), FlashError> { /* 0x20 */ }
//!     fn read_status(&mut self) -> Result<u8, FlashError> { /* 0x05 */ }
//!     fn write_enable(&mut self) -> Result<(), FlashError> { /* 0x06 */ }
//! }
//!
//! struct Watchdog;
//!
//! impl Reboot for Watchdog {
//!     fn reboot(&mut self) {
//!         cortex_m::peripheral::SCB::sys_reset();
//!     }
//! }
//!
//! let mut dfu = DfuClass::new(&usb_bus_alloc, Board::new(spi), Watchdog);
//! let mut usb_dev = UsbDeviceBuilder::new(&usb_bus_alloc, UsbVidPid(0x1d50, 0x614b))
//!     .strings(&[StringDescriptors::default().product("Bootloader")])
//!     .unwrap()
//!     .build();
//!
//! loop {
//!     usb_dev.poll(&mut [&mut dfu]);
//!     dfu.tick();
//! }
//! ```

/// USB class glue.
pub mod class;
pub mod buffer;
pub mod engine;
/// Session errors.
pub mod error;
pub mod flash;
pub mod session;
pub mod verify;
pub mod zone;

#[cfg(test)]
mod sim;

#[doc(inline)]
pub use crate::class::DfuClass;
#[doc(inline)]
pub use crate::engine::{Op, Tick};
#[doc(inline)]
pub use crate::error::DfuError;
#[doc(inline)]
pub use crate::flash::{DfuFlash, EraseSize, FlashError, ManifestPolicy, Reboot};
#[doc(inline)]
pub use crate::session::{DfuRequest, DfuSession, DfuState, DfuStatusCode};
#[doc(inline)]
pub use crate::verify::VerifyOutcome;
#[doc(inline)]
pub use crate::zone::{FlashChip, Zone, ZoneTable};
