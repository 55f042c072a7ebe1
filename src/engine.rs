//! Tick-driven erase/program/verify of buffered flash windows.
//!
//! Every call to [`ProgramState::tick()`] performs at most one flash command
//! (a verify read, one sector erase or one page program) and never waits for
//! the flash to finish. Completion is observed on the next tick through the
//! status register busy bit.

use core::cmp::min;

use crate::buffer::{DoubleBuffer, BLOCK_SIZE};
use crate::flash::{DfuFlash, EraseSize, FlashError, Reboot, PAGE_SIZE, STATUS_BUSY};
use crate::verify::VerifyOutcome;
use crate::zone::{FlashChip, Zone};

/// Flash operation in progress for the current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum Op {
    /// Waiting for a buffered window.
    Idle,
    /// Verifying, and erasing if the window can't be reached by programming.
    Erasing,
    /// Programming the window page by page.
    Programming,
}

/// What a single tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum Tick {
    /// Skipped by the rate limiter.
    Throttled,
    /// Nothing queued.
    Idle,
    /// Flash still busy with the previous command.
    Busy,
    /// Verified, erased or programmed, more to do on this window.
    Progress,
    /// Window verified equal to the buffer and released.
    Committed,
    /// A flash primitive failed, counted as a failed attempt.
    Failed,
    /// Retries exhausted: window dropped and reboot requested.
    Abandoned,
}

/// Cursors and progress of the flash side of a DFU session.
#[derive(Debug, Clone)]
pub struct ProgramState {
    pub(crate) addr_recv: u32,
    pub(crate) addr_read: u32,
    pub(crate) addr_prog: u32,
    pub(crate) addr_erase: u32,
    pub(crate) addr_start: u32,
    pub(crate) addr_end: u32,
    pub(crate) chip: FlashChip,
    op: Op,
    op_offset: usize,
    op_len: usize,
    retry: u8,
    last: VerifyOutcome,
}

impl ProgramState {
    /// Cursors pointing nowhere: every download is out of range until a zone
    /// is loaded.
    pub const fn new(max_retry: u8) -> Self {
        Self {
            addr_recv: 0,
            addr_read: 0,
            addr_prog: 0,
            addr_erase: 0,
            addr_start: 0,
            addr_end: 0,
            chip: FlashChip::Internal,
            op: Op::Idle,
            op_offset: 0,
            op_len: 0,
            retry: max_retry,
            last: VerifyOutcome::Match,
        }
    }

    /// Point every cursor at the start of `zone` and drop any operation.
    pub fn load(&mut self, zone: &Zone, max_retry: u8) {
        *self = Self::new(max_retry);
        self.addr_recv = zone.start;
        self.addr_read = zone.start;
        self.addr_prog = zone.start;
        self.addr_erase = zone.start;
        self.addr_start = zone.start;
        self.addr_end = zone.end;
        self.chip = zone.chip;
    }

    /// Next address expected from the host.
    pub fn addr_recv(&self) -> u32 {
        self.addr_recv
    }

    /// Next address returned by `DFU_UPLOAD`.
    pub fn addr_read(&self) -> u32 {
        self.addr_read
    }

    /// Start of the window being committed.
    pub fn addr_prog(&self) -> u32 {
        self.addr_prog
    }

    /// End of the region erased so far for the current window.
    pub fn addr_erase(&self) -> u32 {
        self.addr_erase
    }

    /// Zone upper bound.
    pub fn addr_end(&self) -> u32 {
        self.addr_end
    }

    /// Chip of the selected zone.
    pub fn chip(&self) -> FlashChip {
        self.chip
    }

    /// Operation in progress.
    pub fn op(&self) -> Op {
        self.op
    }

    /// Attempts left on the current window.
    pub fn retry(&self) -> u8 {
        self.retry
    }

    /// Round the receive cursor up to the next window boundary, after a
    /// partially filled window has been queued.
    pub(crate) fn skip_to_window_end(&mut self) {
        let block = BLOCK_SIZE as u32;
        let offset = self.addr_recv - self.addr_start;
        let rounded = offset.div_ceil(block).saturating_mul(block);
        self.addr_recv = min(self.addr_start.saturating_add(rounded), self.addr_end);
    }

    /// Advance the engine by one step.
    pub fn tick<F: DfuFlash, R: Reboot>(
        &mut self,
        flash: &mut F,
        buf: &mut DoubleBuffer,
        reboot: &mut R,
    ) -> Tick {
        if self.op == Op::Idle {
            if buf.try_consume_ready().is_none() {
                return Tick::Idle;
            }
            // new window
            self.op = Op::Erasing;
            self.op_len = min(BLOCK_SIZE as u32, self.addr_end.saturating_sub(self.addr_prog)) as usize;
            self.op_offset = 0;
        }

        // checked before touching the bus, a failing status read is an attempt too
        if self.retry == 0 {
            #[cfg(feature = "defmt-03")]
            defmt::warn!("verify failed at {=u32:#010x}, giving up", self.addr_prog);
            self.op = Op::Idle;
            self.op_offset = 0;
            self.retry = F::MAX_RETRY;
            buf.release();
            reboot.reboot();
            return Tick::Abandoned;
        }

        // several chips share the bus
        flash.select(self.chip);

        match flash.read_status() {
            Ok(sr) if sr & STATUS_BUSY != 0 => return Tick::Busy,
            Ok(_) => {}
            Err(e) => return self.failed(e),
        }

        match self.step(flash, buf) {
            Ok(t) => t,
            Err(e) => self.failed(e),
        }
    }

    fn step<F: DfuFlash>(&mut self, flash: &mut F, buf: &mut DoubleBuffer) -> Result<Tick, FlashError> {
        if self.op == Op::Erasing {
            let window = match buf.try_consume_ready() {
                Some(block) => &block[..self.op_len],
                None => {
                    self.op = Op::Idle;
                    return Ok(Tick::Idle);
                }
            };
            self.last = flash.verify(self.addr_prog, window)?;

            #[cfg(feature = "defmt-03")]
            defmt::debug!("verify {=u32:#010x}: {}", self.addr_prog, self.last);

            if self.last.needs_erase() {
                let size = self.erase_size::<F>();
                self.addr_erase = size.align_down(self.addr_prog);
                flash.write_enable()?;
                flash.erase(self.addr_erase, size)?;
                self.addr_erase += size.bytes();
                self.retry = self.retry.saturating_sub(1);

                #[cfg(feature = "defmt-03")]
                defmt::debug!("erase started, {} retries left", self.retry);

                // verify again once the erase is done
                return Ok(Tick::Progress);
            }

            self.addr_erase = self.addr_prog + BLOCK_SIZE as u32;
            self.op = Op::Programming;
        }

        if !self.last.needs_program() {
            self.retry = F::MAX_RETRY;
            self.addr_prog += self.op_len as u32;
            self.op = Op::Idle;
            buf.release();

            #[cfg(feature = "defmt-03")]
            defmt::debug!("window done, next {=u32:#010x}", self.addr_prog);

            return Ok(Tick::Committed);
        }

        if self.op_offset == self.op_len {
            // whole window written, go back and verify it
            self.retry = self.retry.saturating_sub(1);
            self.op_offset = 0;
            self.op = Op::Idle;
            return Ok(Tick::Progress);
        }

        let block = match buf.try_consume_ready() {
            Some(block) => block,
            None => {
                self.op = Op::Idle;
                return Ok(Tick::Idle);
            }
        };

        let addr = self.addr_prog + self.op_offset as u32;
        let page_left = PAGE_SIZE - (addr as usize % PAGE_SIZE);
        let len = min(self.op_len - self.op_offset, page_left);

        flash.write_enable()?;
        flash.page_program(addr, &block[self.op_offset..self.op_offset + len])?;
        self.op_offset += len;

        Ok(Tick::Progress)
    }

    /// [`DfuFlash::ERASE_SIZE`] when its block starts at the current window
    /// and ends inside the zone, a 4 KiB sector otherwise.
    ///
    /// A larger block would take committed windows or the next zone with it.
    fn erase_size<F: DfuFlash>(&self) -> EraseSize {
        let size = F::ERASE_SIZE;
        let base = size.align_down(self.addr_prog);
        if base == self.addr_prog && base.saturating_add(size.bytes()) <= self.addr_end {
            size
        } else {
            EraseSize::Sector4K
        }
    }

    fn failed(&mut self, _e: FlashError) -> Tick {
        #[cfg(feature = "defmt-03")]
        defmt::warn!("flash error {} at {=u32:#010x}", _e, self.addr_prog);
        self.retry = self.retry.saturating_sub(1);
        self.op_offset = 0;
        self.op = Op::Idle;
        Tick::Failed
    }
}
