// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Push buffer: the ring of command slots a channel's DMA engine fetches.
//!
//! Layout in DMA memory:
//!
//! ```text
//! iova                                  iova + size
//! | slot 0 | slot 1 | ... | slot N-1 |  RESTART(iova) |
//! ```
//!
//! `cur` is where software writes next, `fence` is the first byte software may
//! not write. Both are byte offsets into the ring. One slot always separates
//! them, so `cur == fence` means full and never empty.

use std::sync::Arc;

use nvhost_common::{Host1xError, Host1xResult, Iova, SLOT_BYTES};

use crate::memory::{DmaPool, MemHandle};
use crate::opcodes::{self, Slot, NOOP, PAD_SLOT};

pub struct PushBuffer {
    pool: Arc<DmaPool>,
    mem: MemHandle,
    iova: Iova,
    /// Ring size in bytes, excluding the restart slot.
    size: u32,
    fence: u32,
    cur: u32,
}

impl PushBuffer {
    /// Allocate a ring of `slots` slots. `slots` must be a power of two.
    pub fn new(pool: Arc<DmaPool>, slots: u32) -> Host1xResult<Self> {
        if !slots.is_power_of_two() || slots < 16 {
            return Err(Host1xError::InvalidArgument("push buffer slots must be a power of two >= 16"));
        }
        let size = slots * SLOT_BYTES;
        let mem = pool.alloc((slots + 1) * 2)?;
        let iova = match pool.pin(mem) {
            Ok(iova) => iova,
            Err(e) => {
                let _ = pool.free(mem);
                return Err(e);
            }
        };
        pool.write(mem, size, &[opcodes::restart(iova), NOOP])?;

        let mut pb = Self { pool, mem, iova, size, fence: 0, cur: 0 };
        pb.reset();
        log::debug!("push_buffer: {} slots at iova 0x{:08X}", slots, iova);
        Ok(pb)
    }

    /// Empty the ring.
    pub fn reset(&mut self) {
        self.cur = 0;
        self.fence = self.size - SLOT_BYTES;
    }

    /// Ring capacity in slots.
    pub fn capacity(&self) -> u32 {
        self.size / SLOT_BYTES
    }

    pub fn cur(&self) -> u32 {
        self.cur
    }

    pub fn fence(&self) -> u32 {
        self.fence
    }

    /// Free slots.
    pub fn space(&self) -> u32 {
        (self.fence.wrapping_sub(self.cur) & (self.size - 1)) / SLOT_BYTES
    }

    pub fn push(&mut self, op: u32, data: u32) -> Host1xResult<()> {
        if self.cur == self.fence {
            return Err(Host1xError::PushBufferFull { needed: 1, available: 0 });
        }
        self.pool.write(self.mem, self.cur, &[op, data])?;
        self.cur = (self.cur + SLOT_BYTES) & (self.size - 1);
        Ok(())
    }

    pub fn push_slot(&mut self, slot: Slot) -> Host1xResult<()> {
        self.push(slot.0, slot.1)
    }

    /// Return `slots` slots to the free space once the hardware is past them.
    pub fn pop_from(&mut self, slots: u32) {
        self.fence = (self.fence + slots * SLOT_BYTES) & (self.size - 1);
    }

    /// Drop everything pushed since `cur` was at `offset`. Only valid before
    /// the hardware has been kicked past it.
    pub(crate) fn rewind(&mut self, offset: u32) {
        self.cur = offset & (self.size - 1);
    }

    /// Byte offset `slots` slots after `first`, wrapped.
    pub fn offset_after(&self, first: u32, slots: u32) -> u32 {
        (first + slots * SLOT_BYTES) & (self.size - 1)
    }

    /// Pad slots [`make_adjacent_space`](Self::make_adjacent_space) would
    /// insert before a reservation of `slots`.
    pub fn padding_for(&self, slots: u32) -> u32 {
        let to_wrap = (self.size - self.cur) / SLOT_BYTES;
        if to_wrap < slots {
            to_wrap
        } else {
            0
        }
    }

    /// Largest reservation accepted by `make_adjacent_space`, exclusive.
    pub fn reservation_limit(&self) -> u32 {
        self.capacity() / 2
    }

    /// Make the next `slots` pushes land contiguously, padding with NOOPs up
    /// to the wrap point if needed. Returns the number of pad slots.
    ///
    /// The caller must have checked that `slots + padding_for(slots)` slots
    /// are free.
    pub fn make_adjacent_space(&mut self, slots: u32) -> Host1xResult<u32> {
        let limit = self.reservation_limit();
        if slots >= limit {
            return Err(Host1xError::ReservationTooLarge { slots, limit });
        }
        let pad = self.padding_for(slots);
        if self.space() < slots + pad {
            return Err(Host1xError::PushBufferFull { needed: slots + pad, available: self.space() });
        }
        for _ in 0..pad {
            self.push_slot(PAD_SLOT)?;
        }
        Ok(pad)
    }

    /// Overwrite `slots` slots from byte offset `first` with NOOPs.
    pub fn nop_slots(&self, first: u32, slots: u32) -> Host1xResult<()> {
        for i in 0..slots {
            let offset = (first + i * SLOT_BYTES) & (self.size - 1);
            self.pool.write(self.mem, offset, &[NOOP, NOOP])?;
        }
        Ok(())
    }

    pub fn read_slot(&self, offset: u32) -> Host1xResult<Slot> {
        let words = self.pool.read(self.mem, offset & (self.size - 1), 2)?;
        Ok((words[0], words[1]))
    }

    pub fn dma_start(&self) -> Iova {
        self.iova
    }

    /// End of the fetchable range, past the restart slot.
    pub fn dma_end(&self) -> Iova {
        self.iova + self.size + SLOT_BYTES
    }

    /// Hardware address of `cur`, the value written to DMAPUT.
    pub fn put_ptr(&self) -> Iova {
        self.iova + self.cur
    }

    /// Ring offset of a DMAGET address.
    pub fn get_to_offset(&self, addr: Iova) -> Host1xResult<u32> {
        match addr.checked_sub(self.iova) {
            Some(off) if off < self.size => Ok(off),
            Some(off) if off == self.size => Ok(0),
            _ => Err(Host1xError::InvalidArgument("DMAGET outside the push buffer")),
        }
    }
}

impl Drop for PushBuffer {
    fn drop(&mut self) {
        if let Err(e) = self.pool.unpin(self.mem).and_then(|_| self.pool.free(self.mem)) {
            log::warn!("push_buffer: failed to release backing memory: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcodes::Opcode;

    fn pb(slots: u32) -> (PushBuffer, Arc<DmaPool>) {
        let pool = Arc::new(DmaPool::new());
        (PushBuffer::new(pool.clone(), slots).unwrap(), pool)
    }

    #[test]
    fn test_reset_state() {
        let (pb, _) = pb(64);
        assert_eq!(pb.cur(), 0);
        assert_eq!(pb.fence(), 64 * 8 - 8);
        assert_eq!(pb.space(), 63);
    }

    #[test]
    fn test_rejects_bad_sizes() {
        let pool = Arc::new(DmaPool::new());
        assert!(PushBuffer::new(pool.clone(), 100).is_err());
        assert!(PushBuffer::new(pool, 8).is_err());
    }

    #[test]
    fn test_restart_slot_points_home() {
        let (pb, pool) = pb(16);
        let tail = pool.read_word_iova(pb.dma_start() + 16 * 8).unwrap();
        assert_eq!(Opcode::decode(tail), Opcode::Restart { address: pb.dma_start() });
        assert_eq!(pb.dma_end(), pb.dma_start() + 17 * 8);
    }

    #[test]
    fn test_fill_to_full_boundary() {
        let (mut pb, _) = pb(32);
        for _ in 0..pb.capacity() - 2 {
            pb.push(NOOP, NOOP).unwrap();
        }
        // One slot before fence, no wrap yet.
        assert_eq!(pb.cur() + 8, pb.fence());
        assert_eq!(pb.space(), 1);
        pb.push(NOOP, NOOP).unwrap();
        assert_eq!(pb.cur(), pb.fence());
        assert_eq!(pb.space(), 0);
        assert_eq!(
            pb.push(NOOP, NOOP),
            Err(Host1xError::PushBufferFull { needed: 1, available: 0 })
        );
        pb.pop_from(4);
        assert_eq!(pb.space(), 4);
    }

    #[test]
    fn test_adjacent_space_never_splits() {
        let cap = 32;
        for start in 0..cap {
            for n in 1..cap / 2 {
                let (mut pb, _) = pb(cap);
                for _ in 0..start {
                    pb.push(NOOP, NOOP).unwrap();
                    pb.pop_from(1);
                }
                if pb.space() < n + pb.padding_for(n) {
                    continue;
                }
                pb.make_adjacent_space(n).unwrap();
                let first = pb.cur();
                for i in 0..n {
                    assert_eq!(pb.cur(), first + i * 8, "start {} n {}", start, n);
                    pb.push(1, 2).unwrap();
                }
            }
        }
    }

    #[test]
    fn test_reservation_limit() {
        let (mut pb, _) = pb(32);
        assert_eq!(
            pb.make_adjacent_space(16),
            Err(Host1xError::ReservationTooLarge { slots: 16, limit: 16 })
        );
        assert_eq!(pb.make_adjacent_space(15), Ok(0));
    }

    #[test]
    fn test_nop_slots_and_offsets() {
        let (mut pb, _) = pb(16);
        pb.push(0x1234, 0x5678).unwrap();
        pb.push(0x1111, 0x2222).unwrap();
        pb.nop_slots(0, 2).unwrap();
        assert_eq!(pb.read_slot(0).unwrap(), PAD_SLOT);
        assert_eq!(pb.read_slot(8).unwrap(), PAD_SLOT);
        assert_eq!(pb.put_ptr(), pb.dma_start() + 16);
        assert_eq!(pb.get_to_offset(pb.dma_start() + 24).unwrap(), 24);
        assert_eq!(pb.get_to_offset(pb.dma_start() + 16 * 8).unwrap(), 0);
        assert!(pb.get_to_offset(pb.dma_start() - 8).is_err());
        assert_eq!(pb.offset_after(15 * 8, 3), 16);
    }

    #[test]
    fn test_rewind_discards_unkicked_slots() {
        let (mut pb, _) = pb(16);
        pb.push(NOOP, NOOP).unwrap();
        let mark = pb.cur();
        pb.push(1, 2).unwrap();
        pb.push(3, 4).unwrap();
        pb.rewind(mark);
        assert_eq!(pb.cur(), 8);
        assert_eq!(pb.space(), 14);
    }

    #[test]
    fn test_drop_releases_memory() {
        let pool = Arc::new(DmaPool::new());
        drop(PushBuffer::new(pool.clone(), 16).unwrap());
        assert_eq!(pool.num_buffers(), 0);
    }
}
