//! Two-slot queue between USB reception and flash programming.

use core::cmp::min;

use crate::verify::ERASED;

/// Size of one slot, and of the window the engine commits at a time.
pub const BLOCK_SIZE: usize = 4096;

/// Ping-pong buffer of two [`BLOCK_SIZE`] slots.
///
/// The USB side fills the slot at `write_slot`, the flash side drains the slot
/// at `read_slot`. `used` counts committed slots. A slot may be filled by
/// several [`append()`](DoubleBuffer::append) calls before it is committed.
pub struct DoubleBuffer {
    data: [[u8; BLOCK_SIZE]; 2],
    used: u8,
    write_slot: u8,
    read_slot: u8,
    fill: usize,
}

impl Default for DoubleBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl DoubleBuffer {
    /// Empty buffer.
    pub const fn new() -> Self {
        Self {
            data: [[ERASED; BLOCK_SIZE]; 2],
            used: 0,
            write_slot: 0,
            read_slot: 0,
            fill: 0,
        }
    }

    /// Number of committed slots, `0..=2`.
    pub fn used(&self) -> u8 {
        self.used
    }

    /// Bytes accumulated in the write slot that are not committed yet.
    pub fn pending(&self) -> usize {
        self.fill
    }

    /// Nothing committed and nothing pending.
    pub fn is_empty(&self) -> bool {
        self.used == 0 && self.fill == 0
    }

    /// Bytes that can still be accepted without overwriting queued data.
    pub fn free(&self) -> usize {
        if self.used >= 2 {
            0
        } else {
            (2 - self.used as usize) * BLOCK_SIZE - self.fill
        }
    }

    /// Copy a whole block into the write slot and commit it, padding a short
    /// block with `0xff`.
    ///
    /// Fails without side effects if both slots are in use, a partial slot is
    /// pending, or `bytes` is longer than a block.
    pub fn try_produce(&mut self, bytes: &[u8]) -> bool {
        if self.used >= 2 || self.fill != 0 || bytes.len() > BLOCK_SIZE {
            return false;
        }
        if !self.append(bytes) {
            return false;
        }
        if bytes.len() < BLOCK_SIZE {
            self.commit();
        }
        true
    }

    /// Append bytes to the write slot(s), committing every slot that becomes
    /// full.
    ///
    /// Fails without side effects if `bytes` does not fit in [`free()`](DoubleBuffer::free).
    pub fn append(&mut self, mut bytes: &[u8]) -> bool {
        if bytes.len() > self.free() {
            return false;
        }
        while !bytes.is_empty() {
            let n = min(BLOCK_SIZE - self.fill, bytes.len());
            let slot = &mut self.data[self.write_slot as usize];
            slot[self.fill..self.fill + n].copy_from_slice(&bytes[..n]);
            self.fill += n;
            bytes = &bytes[n..];
            if self.fill == BLOCK_SIZE {
                self.commit();
            }
        }
        true
    }

    /// Commit the write slot, padding the unwritten tail with `0xff` so it
    /// never triggers programming.
    ///
    /// Fails if both slots are already committed.
    pub fn commit(&mut self) -> bool {
        if self.used >= 2 {
            return false;
        }
        let slot = &mut self.data[self.write_slot as usize];
        slot[self.fill..].fill(ERASED);
        self.fill = 0;
        self.write_slot ^= 1;
        self.used += 1;
        true
    }

    /// Oldest committed slot, if any.
    ///
    /// The slot stays queued until [`release()`](DoubleBuffer::release).
    pub fn try_consume_ready(&self) -> Option<&[u8; BLOCK_SIZE]> {
        if self.used == 0 {
            None
        } else {
            Some(&self.data[self.read_slot as usize])
        }
    }

    /// Drop the oldest committed slot. No-op when nothing is committed.
    pub fn release(&mut self) {
        if self.used > 0 {
            self.read_slot ^= 1;
            self.used -= 1;
        }
    }

    /// Forget all queued and pending data.
    pub fn clear(&mut self) {
        self.used = 0;
        self.fill = 0;
        self.write_slot = 0;
        self.read_slot = 0;
    }
}
