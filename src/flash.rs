//! Board-side capabilities the bootloader engine relies on.

use crate::verify::{Verdict, VerifyOutcome};
use crate::zone::{FlashChip, ZoneTable};

/// Busy bit of the flash status register.
pub const STATUS_BUSY: u8 = 0x01;

/// Largest amount of data one page program command may carry.
pub const PAGE_SIZE: usize = 256;

/// Failure reported by a flash primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum FlashError {
    /// SPI transfer failed.
    Bus,
    /// Address is outside of the selected device.
    Address,
}

/// Smallest region one erase command wipes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum EraseSize {
    /// 4 KiB sector erase.
    Sector4K,
    /// 32 KiB block erase.
    Block32K,
    /// 64 KiB block erase.
    Block64K,
}

impl EraseSize {
    /// Size in bytes.
    pub const fn bytes(self) -> u32 {
        match self {
            EraseSize::Sector4K => 4 * 1024,
            EraseSize::Block32K => 32 * 1024,
            EraseSize::Block64K => 64 * 1024,
        }
    }

    /// Start of the erase region containing `addr`.
    pub const fn align_down(self, addr: u32) -> u32 {
        addr & !(self.bytes() - 1)
    }
}

/// How `DFU_GETSTATUS` behaves once the host has sent the last block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum ManifestPolicy {
    /// Finish all queued programming before replying, then report `dfuIDLE`.
    ///
    /// dfu-util waits a fixed second after the last block unless the device
    /// answers `dfuIDLE` straight away, this avoids the delay.
    Drain,
    /// Report `dfuMANIFEST` until the queue is empty, then `dfuIDLE`.
    Report,
}

/// Platform reset, invoked when the session cannot continue.
///
/// Called on `DFU_DETACH`, on a USB reset in the middle of a session and when
/// a flash window fails verification too many times. An implementation would
/// normally not return.
pub trait Reboot {
    /// Restart the device.
    fn reboot(&mut self);
}

/// SPI NOR flash as seen by the DFU engine, plus compile-time tuning.
///
/// Implementations wrap the SPI controller of the board. Every operation acts
/// on the chip selected by the last [`select()`](DfuFlash::select) call.
/// Apart from a short, bounded completion wait intrinsic to one bus
/// transaction, no method may block: erase and program are only started, and
/// completion is observed through [`read_status()`](DfuFlash::read_status).
pub trait DfuFlash {
    /// Zones selectable with the interface alternate setting.
    const ZONES: ZoneTable = ZoneTable::DEFAULT;

    /// Erase command the engine uses. Default: 4 KiB sector erase.
    ///
    /// A larger block is only erased for the window at its start, and only
    /// when the block ends inside the zone. Every other window falls back to
    /// a 4 KiB sector erase, so the chip must support both.
    const ERASE_SIZE: EraseSize = EraseSize::Sector4K;

    /// Erase/program attempts allowed on one window before giving up and
    /// rebooting. Default: `4`.
    const MAX_RETRY: u8 = 4;

    /// `bwPollTimeout` reported in every `DFU_GETSTATUS` reply. Default: `5` ms.
    const POLL_TIMEOUT_MS: u32 = 5;

    /// See [`ManifestPolicy`]. Default: [`ManifestPolicy::Drain`].
    const MANIFEST_POLICY: ManifestPolicy = ManifestPolicy::Drain;

    /// Calls to `tick()` skipped between two engine steps. Default: `0`, every
    /// call does work.
    const TICK_DIVIDER: u8 = 0;

    /// wDetachTimeOut field in DFU descriptor. Default value: `250` ms.
    const DETACH_TIMEOUT: u16 = 250;

    /// wTransferSize field in DFU descriptor. Default value: `128` bytes.
    ///
    /// A `DFU_DNLOAD` shorter than this is treated as the last block of the
    /// image: the current flash window is padded and queued right away.
    ///
    /// **Warning**: must be less or equal of `usb-device`'s control endpoint
    /// buffer size (`128` bytes, or `256` with its `control-buffer-256`
    /// feature).
    const TRANSFER_SIZE: u16 = 128;

    /// Route the following operations to `chip`.
    fn select(&mut self, chip: FlashChip);

    /// Read `dst.len()` bytes starting at `addr`.
    fn read(&mut self, addr: u32, dst: &mut [u8]) -> Result<(), FlashError>;

    /// Start programming `src` (at most [`PAGE_SIZE`] bytes, not crossing a
    /// page boundary) at `addr`.
    fn page_program(&mut self, addr: u32, src: &[u8]) -> Result<(), FlashError>;

    /// Start erasing the `size` region starting at `addr`.
    fn erase(&mut self, addr: u32, size: EraseSize) -> Result<(), FlashError>;

    /// First status register, bit 0 is [`STATUS_BUSY`].
    fn read_status(&mut self) -> Result<u8, FlashError>;

    /// Set the write enable latch. Needed before each erase and program.
    fn write_enable(&mut self) -> Result<(), FlashError>;

    /// Compare `candidate` with the flash contents at `addr`.
    ///
    /// The default reads the window back in small chunks. Controllers that can
    /// compare while shifting data in should override this and fold every
    /// received byte into a [`Verdict`] within a single read transaction.
    fn verify(&mut self, addr: u32, candidate: &[u8]) -> Result<VerifyOutcome, FlashError> {
        let mut verdict = Verdict::new();
        let mut chunk = [0u8; 64];
        let mut offset = 0;

        for want in candidate.chunks(chunk.len()) {
            let have = &mut chunk[..want.len()];
            self.read(addr + offset, have)?;
            verdict.update(want, have);
            offset += want.len() as u32;
        }

        Ok(verdict.outcome())
    }

    /// Vendor-specific device-to-host request on the DFU interface.
    ///
    /// Return the number of bytes written to `buf`, or `None` to stall.
    #[allow(unused_variables)]
    fn vendor_in(&mut self, request: u8, value: u16, buf: &mut [u8]) -> Option<usize> {
        None
    }

    /// Vendor-specific host-to-device request on the DFU interface.
    ///
    /// Return `false` to stall.
    #[allow(unused_variables)]
    fn vendor_out(&mut self, request: u8, value: u16, data: &[u8]) -> bool {
        false
    }
}
