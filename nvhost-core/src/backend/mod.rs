// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Chip back-ends.
//!
//! Provides capability traits for the syncpoint and command DMA halves of the
//! hardware, and one implementation per chip generation. The generation is
//! picked once, when the device is probed.

pub mod host1x01;
pub mod host1x04;

use std::sync::Arc;

use nvhost_common::settings::ChipGeneration;
use nvhost_common::{ChannelId, SyncptId};

use crate::regs::*;

pub use host1x01::Host1x01;
pub use host1x04::Host1x04;

/// Who currently holds a module mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MlockState {
    Free,
    Cpu,
    Channel(ChannelId),
}

/// Syncpoint, interrupt and module mutex registers.
pub trait SyncptBackend: Send + Sync {
    fn syncpt_read(&self, id: SyncptId) -> u32;
    fn syncpt_cpu_incr(&self, id: SyncptId);
    /// Load `val` into the syncpoint register.
    fn syncpt_load(&self, id: SyncptId, val: u32);
    fn syncpt_set_thresh(&self, id: SyncptId, thresh: u32);
    fn syncpt_intr_enable(&self, id: SyncptId);
    fn syncpt_intr_disable(&self, id: SyncptId);
    /// Syncpoints whose threshold interrupt is pending.
    fn syncpt_intr_status(&self) -> Vec<SyncptId>;
    fn syncpt_intr_ack(&self, id: SyncptId);

    /// Try to take module mutex `idx` for the CPU. Returns true on success.
    fn mlock_try_lock(&self, idx: u32) -> bool;
    /// Release module mutex `idx`, whoever owns it.
    fn mlock_unlock(&self, idx: u32);
    fn mlock_owner(&self, idx: u32) -> MlockState;
}

/// Channel DMA and command processor registers.
pub trait CdmaBackend: Send + Sync {
    /// Program the DMA window, load DMAGET from `start` and let it run.
    fn cdma_start(&self, ch: ChannelId, start: u32, end: u32, put: u32);
    fn cdma_stop(&self, ch: ChannelId);
    fn cdma_kick(&self, ch: ChannelId, put: u32);
    fn cdma_get(&self, ch: ChannelId) -> u32;
    fn cdma_put(&self, ch: ChannelId) -> u32;
    /// Reload DMAGET with `get` while the channel is stopped.
    fn cdma_set_get(&self, ch: ChannelId, get: u32);
    fn cmdproc_stop(&self, ch: ChannelId, stop: bool);
    fn channel_teardown(&self, ch: ChannelId);
    /// Reset the engine serving `class_id`. Returns false if the reset failed.
    fn module_reset(&self, class_id: u32) -> bool;
}

/// A complete chip back-end.
pub trait ChipBackend: SyncptBackend + CdmaBackend {
    fn name(&self) -> &str;
    fn info(&self) -> &ChipInfo;
}

/// Build the back-end for `chip` on top of the platform registers.
pub fn create(chip: ChipGeneration, regs: Arc<dyn RegisterAccess>) -> Arc<dyn ChipBackend> {
    match chip {
        ChipGeneration::Host1x01 => Arc::new(Host1x01::new(regs)),
        ChipGeneration::Host1x04 => Arc::new(Host1x04::new(regs)),
    }
}

/// Register sequences shared by every generation.
///
/// `C` reaches the channel block and `S` the sync block; generations differ in
/// how each one is reached.
pub struct Host1xRegs<C: RegisterAccess, S: RegisterAccess> {
    chan: C,
    sync: S,
    info: ChipInfo,
}

impl<C: RegisterAccess, S: RegisterAccess> Host1xRegs<C, S> {
    pub fn with_access(chan: C, sync: S, info: ChipInfo) -> Self {
        Self { chan, sync, info }
    }

    fn sync_read(&self, reg: u32) -> u32 {
        self.sync.read(self.info.sync_reg(reg))
    }

    fn sync_write(&self, reg: u32, val: u32) {
        self.sync.write(self.info.sync_reg(reg), val)
    }

    fn chan_read(&self, ch: ChannelId, reg: u32) -> u32 {
        self.chan.read(self.info.channel_reg(ch, reg))
    }

    fn chan_write(&self, ch: ChannelId, reg: u32, val: u32) {
        self.chan.write(self.info.channel_reg(ch, reg), val)
    }

    fn bitmap_write(&self, bank: u32, id: SyncptId) {
        let (reg, bit) = bitmap_reg(bank, id);
        self.sync_write(reg, bit);
    }

    fn stop_mask(&self, ch: ChannelId) -> u32 {
        1 << (ch % 32)
    }
}

impl<C: RegisterAccess, S: RegisterAccess> SyncptBackend for Host1xRegs<C, S> {
    fn syncpt_read(&self, id: SyncptId) -> u32 {
        self.sync_read(syncpt_reg(id))
    }

    fn syncpt_cpu_incr(&self, id: SyncptId) {
        self.bitmap_write(SYNC_SYNCPT_CPU_INCR, id);
    }

    fn syncpt_load(&self, id: SyncptId, val: u32) {
        self.sync_write(syncpt_reg(id), val);
    }

    fn syncpt_set_thresh(&self, id: SyncptId, thresh: u32) {
        self.sync_write(syncpt_thresh_reg(id), thresh);
    }

    fn syncpt_intr_enable(&self, id: SyncptId) {
        self.bitmap_write(SYNC_SYNCPT_INT_ENABLE, id);
    }

    fn syncpt_intr_disable(&self, id: SyncptId) {
        self.bitmap_write(SYNC_SYNCPT_INT_DISABLE, id);
    }

    fn syncpt_intr_status(&self) -> Vec<SyncptId> {
        let mut pending = Vec::new();
        for word in 0..self.info.bitmap_words() {
            let mut bits = self.sync_read(SYNC_SYNCPT_INT_STATUS + word * 4);
            while bits != 0 {
                let bit = bits.trailing_zeros();
                pending.push(word * 32 + bit);
                bits &= bits - 1;
            }
        }
        pending
    }

    fn syncpt_intr_ack(&self, id: SyncptId) {
        self.bitmap_write(SYNC_SYNCPT_INT_STATUS, id);
    }

    fn mlock_try_lock(&self, idx: u32) -> bool {
        self.sync_read(mlock_reg(idx)) == 0
    }

    fn mlock_unlock(&self, idx: u32) {
        self.sync_write(mlock_reg(idx), 0);
    }

    fn mlock_owner(&self, idx: u32) -> MlockState {
        let raw = self.sync_read(mlock_owner_reg(idx));
        let owner = MlockOwner::from_bits_truncate(raw);
        if owner.contains(MlockOwner::CH_OWNS) {
            MlockState::Channel((raw >> MLOCK_OWNER_CHID_SHIFT) & MLOCK_OWNER_CHID_MASK)
        } else if owner.contains(MlockOwner::CPU_OWNS) {
            MlockState::Cpu
        } else {
            MlockState::Free
        }
    }
}

impl<C: RegisterAccess, S: RegisterAccess> CdmaBackend for Host1xRegs<C, S> {
    fn cdma_start(&self, ch: ChannelId, start: u32, end: u32, put: u32) {
        let hold = DmaCtrl::DMASTOP | DmaCtrl::DMAGETRST | DmaCtrl::DMAINITGET;
        self.chan_write(ch, CHANNEL_DMACTRL, hold.bits());
        self.chan_write(ch, CHANNEL_DMASTART, start);
        self.chan_write(ch, CHANNEL_DMAPUT, put);
        self.chan_write(ch, CHANNEL_DMAEND, end);
        // Leaving GETRST with INITGET set loads DMAGET from DMASTART.
        self.chan_write(ch, CHANNEL_DMACTRL, DmaCtrl::DMASTOP.bits());
        self.chan_write(ch, CHANNEL_DMACTRL, 0);
    }

    fn cdma_stop(&self, ch: ChannelId) {
        self.chan_write(ch, CHANNEL_DMACTRL, DmaCtrl::DMASTOP.bits());
    }

    fn cdma_kick(&self, ch: ChannelId, put: u32) {
        self.chan_write(ch, CHANNEL_DMAPUT, put);
    }

    fn cdma_get(&self, ch: ChannelId) -> u32 {
        self.chan_read(ch, CHANNEL_DMAGET)
    }

    fn cdma_put(&self, ch: ChannelId) -> u32 {
        self.chan_read(ch, CHANNEL_DMAPUT)
    }

    fn cdma_set_get(&self, ch: ChannelId, get: u32) {
        let hold = DmaCtrl::DMASTOP | DmaCtrl::DMAGETRST;
        self.chan_write(ch, CHANNEL_DMACTRL, hold.bits());
        self.chan_write(ch, CHANNEL_DMAGET, get);
        self.chan_write(ch, CHANNEL_DMACTRL, 0);
    }

    fn cmdproc_stop(&self, ch: ChannelId, stop: bool) {
        let cur = self.sync_read(SYNC_CMDPROC_STOP);
        let next = if stop { cur | self.stop_mask(ch) } else { cur & !self.stop_mask(ch) };
        self.sync_write(SYNC_CMDPROC_STOP, next);
    }

    fn channel_teardown(&self, ch: ChannelId) {
        self.sync_write(SYNC_CH_TEARDOWN, self.stop_mask(ch));
    }

    fn module_reset(&self, class_id: u32) -> bool {
        self.sync_write(SYNC_MODULE_RESET, class_id);
        self.sync_read(SYNC_MODULE_RESET_STATUS) == 0
    }
}

impl<C: RegisterAccess, S: RegisterAccess> ChipBackend for Host1xRegs<C, S> {
    fn name(&self) -> &str {
        self.info.name
    }

    fn info(&self) -> &ChipInfo {
        &self.info
    }
}
