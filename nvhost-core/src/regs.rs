// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Host1x register map and register access capabilities.
//!
//! The host1x aperture has two halves:
//!
//! - a channel block per hardware channel (`channel_base + ch * channel_stride`)
//!   with the DMA pointers of that channel's command FIFO;
//! - one sync block (`sync_base`) with syncpoints, threshold interrupts,
//!   module mutexes and the command processor controls.
//!
//! Register offsets within a block are chip independent; the block placement
//! is described by [`ChipInfo`].

use std::sync::Arc;

use bitflags::bitflags;

use nvhost_common::SyncptId;

/// 32-bit register read/write capability.
///
/// Real deployments back this with MMIO; tests and the simulator back it with
/// an in-memory register file.
pub trait RegisterAccess: Send + Sync {
    fn read(&self, reg: u32) -> u32;
    fn write(&self, reg: u32, val: u32);
}

impl<T: RegisterAccess + ?Sized> RegisterAccess for Arc<T> {
    fn read(&self, reg: u32) -> u32 {
        (**self).read(reg)
    }

    fn write(&self, reg: u32, val: u32) {
        (**self).write(reg, val)
    }
}

/// Interrupt handler invoked when the syncpoint threshold line fires.
pub type IrqHandler = Arc<dyn Fn() + Send + Sync>;

/// The platform interrupt line carrying syncpoint threshold interrupts.
pub trait IrqLine: Send + Sync {
    fn request(&self, handler: IrqHandler);
    fn free(&self);
}

/// Per-generation layout and resource counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChipInfo {
    pub name: &'static str,
    pub nb_channels: u32,
    pub nb_pts: u32,
    pub nb_mlocks: u32,
    pub channel_base: u32,
    pub channel_stride: u32,
    pub sync_base: u32,
    /// Sync block is reachable only through the hypervisor window.
    pub hypervisor_sync: bool,
}

impl ChipInfo {
    pub const fn channel_reg(&self, ch: u32, reg: u32) -> u32 {
        self.channel_base + ch * self.channel_stride + reg
    }

    pub const fn sync_reg(&self, reg: u32) -> u32 {
        self.sync_base + reg
    }

    /// Number of 32-bit words in a per-syncpoint bitmap register bank.
    pub const fn bitmap_words(&self) -> u32 {
        (self.nb_pts + 31) / 32
    }
}

pub const HOST1X01_INFO: ChipInfo = ChipInfo {
    name: "host1x01",
    nb_channels: 8,
    nb_pts: 192,
    nb_mlocks: 16,
    channel_base: 0x0000,
    channel_stride: 0x4000,
    sync_base: 0x3000,
    hypervisor_sync: false,
};

pub const HOST1X04_INFO: ChipInfo = ChipInfo {
    name: "host1x04",
    nb_channels: 16,
    nb_pts: 192,
    nb_mlocks: 24,
    channel_base: 0x1_0000,
    channel_stride: 0x100,
    sync_base: 0x0000,
    hypervisor_sync: true,
};

// ── Channel block ───────────────────────────────────────────────────────────

pub const CHANNEL_DMASTART: u32 = 0x14;
pub const CHANNEL_DMAPUT: u32 = 0x18;
pub const CHANNEL_DMAGET: u32 = 0x1c;
pub const CHANNEL_DMAEND: u32 = 0x20;
pub const CHANNEL_DMACTRL: u32 = 0x24;

bitflags! {
    /// CHANNEL_DMACTRL bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DmaCtrl: u32 {
        /// Stop fetching from the push buffer.
        const DMASTOP = 1 << 0;
        /// Hold DMAGET in reset.
        const DMAGETRST = 1 << 1;
        /// Load DMAGET from DMASTART when leaving reset.
        const DMAINITGET = 1 << 2;
    }
}

// ── Sync block ──────────────────────────────────────────────────────────────

/// Threshold interrupt status bitmap (write one to clear).
pub const SYNC_SYNCPT_INT_STATUS: u32 = 0x040;
/// Threshold interrupt disable bitmap (write one to disable).
pub const SYNC_SYNCPT_INT_DISABLE: u32 = 0x060;
/// Threshold interrupt enable bitmap (write one to enable).
pub const SYNC_SYNCPT_INT_ENABLE: u32 = 0x080;
/// One bit per channel: stop the command processor.
pub const SYNC_CMDPROC_STOP: u32 = 0x0ac;
/// One bit per channel: reset the channel's command processor state.
pub const SYNC_CH_TEARDOWN: u32 = 0x0b0;
/// Write a class id to reset the engine behind it.
pub const SYNC_MODULE_RESET: u32 = 0x0b4;
/// Nonzero after a failed module reset.
pub const SYNC_MODULE_RESET_STATUS: u32 = 0x0b8;
/// Module mutexes: reads return nonzero when already held, writing 0 releases.
pub const SYNC_MLOCK: u32 = 0x200;
pub const SYNC_MLOCK_OWNER: u32 = 0x280;
/// CPU increment bitmap (write one to increment).
pub const SYNC_SYNCPT_CPU_INCR: u32 = 0x300;
pub const SYNC_SYNCPT: u32 = 0x400;
pub const SYNC_SYNCPT_INT_THRESH: u32 = 0x700;
/// Extent of the sync block.
pub const SYNC_BLOCK_SIZE: u32 = 0x1000;

bitflags! {
    /// SYNC_MLOCK_OWNER bits; the owning channel lives in bits [15:8].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MlockOwner: u32 {
        const CH_OWNS = 1 << 0;
        const CPU_OWNS = 1 << 1;
    }
}

pub const MLOCK_OWNER_CHID_SHIFT: u32 = 8;
pub const MLOCK_OWNER_CHID_MASK: u32 = 0xff;

pub const fn syncpt_reg(id: SyncptId) -> u32 {
    SYNC_SYNCPT + id * 4
}

pub const fn syncpt_thresh_reg(id: SyncptId) -> u32 {
    SYNC_SYNCPT_INT_THRESH + id * 4
}

pub const fn mlock_reg(idx: u32) -> u32 {
    SYNC_MLOCK + idx * 4
}

pub const fn mlock_owner_reg(idx: u32) -> u32 {
    SYNC_MLOCK_OWNER + idx * 4
}

/// Bitmap register for `id` in the bank starting at `bank`, and its bit.
pub const fn bitmap_reg(bank: u32, id: SyncptId) -> (u32, u32) {
    (bank + (id / 32) * 4, 1 << (id % 32))
}

// ── Hypervisor window ───────────────────────────────────────────────────────

/// Register access mediated by a hypervisor.
///
/// A guest running behind the hypervisor may only touch the sync block; any
/// access outside it is dropped (reads return 0).
pub struct HypervisorRegisters<R: RegisterAccess> {
    inner: R,
    base: u32,
}

impl<R: RegisterAccess> HypervisorRegisters<R> {
    pub fn new(inner: R, base: u32) -> Self {
        Self { inner, base }
    }

    fn allowed(&self, reg: u32) -> bool {
        reg >= self.base && reg < self.base + SYNC_BLOCK_SIZE && reg % 4 == 0
    }
}

impl<R: RegisterAccess> RegisterAccess for HypervisorRegisters<R> {
    fn read(&self, reg: u32) -> u32 {
        if !self.allowed(reg) {
            log::warn!("hypervisor: refused read of 0x{:05X}", reg);
            return 0;
        }
        self.inner.read(reg)
    }

    fn write(&self, reg: u32, val: u32) {
        if !self.allowed(reg) {
            log::warn!("hypervisor: refused write 0x{:08X} to 0x{:05X}", val, reg);
            return;
        }
        self.inner.write(reg, val);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Default)]
    struct RegFile(Mutex<HashMap<u32, u32>>);

    impl RegisterAccess for RegFile {
        fn read(&self, reg: u32) -> u32 {
            self.0.lock().get(&reg).copied().unwrap_or(0)
        }
        fn write(&self, reg: u32, val: u32) {
            self.0.lock().insert(reg, val);
        }
    }

    #[test]
    fn test_channel_reg_layout() {
        assert_eq!(HOST1X01_INFO.channel_reg(2, CHANNEL_DMAPUT), 0x8018);
        assert_eq!(HOST1X04_INFO.channel_reg(2, CHANNEL_DMAPUT), 0x1_0218);
        assert_eq!(HOST1X01_INFO.sync_reg(syncpt_reg(3)), 0x340c);
    }

    #[test]
    fn test_bitmap_reg() {
        assert_eq!(bitmap_reg(SYNC_SYNCPT_CPU_INCR, 0), (0x300, 1));
        assert_eq!(bitmap_reg(SYNC_SYNCPT_CPU_INCR, 33), (0x304, 2));
        assert_eq!(HOST1X01_INFO.bitmap_words(), 6);
    }

    #[test]
    fn test_hypervisor_window() {
        let regs = Arc::new(RegFile::default());
        let hv = HypervisorRegisters::new(regs.clone(), 0);

        hv.write(syncpt_reg(4), 7);
        assert_eq!(hv.read(syncpt_reg(4)), 7);

        // Channel registers live outside the window.
        hv.write(HOST1X04_INFO.channel_reg(0, CHANNEL_DMAPUT), 0x40);
        assert_eq!(regs.read(HOST1X04_INFO.channel_reg(0, CHANNEL_DMAPUT)), 0);
        assert_eq!(hv.read(HOST1X04_INFO.channel_reg(0, CHANNEL_DMAPUT)), 0);
    }
}
