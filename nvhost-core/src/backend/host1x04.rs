// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Host1x04 (T186 class).
//!
//! Channel registers are mapped directly into the guest, the sync block is
//! owned by the hypervisor and only reachable through its register window.

use std::sync::Arc;

use super::Host1xRegs;
use crate::regs::{HypervisorRegisters, RegisterAccess, HOST1X04_INFO};

pub type Host1x04 =
    Host1xRegs<Arc<dyn RegisterAccess>, HypervisorRegisters<Arc<dyn RegisterAccess>>>;

impl Host1x04 {
    pub fn new(regs: Arc<dyn RegisterAccess>) -> Self {
        log::debug!("host1x04: sync registers through hypervisor window");
        let sync = HypervisorRegisters::new(regs.clone(), HOST1X04_INFO.sync_base);
        Self::with_access(regs, sync, HOST1X04_INFO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::tests::RegFile;
    use crate::backend::{CdmaBackend, ChipBackend, SyncptBackend};
    use crate::regs::*;

    #[test]
    fn test_sync_goes_through_window() {
        let file = Arc::new(RegFile::default());
        let hw = Host1x04::new(file.clone());
        assert_eq!(hw.name(), "host1x04");

        hw.syncpt_set_thresh(9, 100);
        assert_eq!(file.read(HOST1X04_INFO.sync_reg(syncpt_thresh_reg(9))), 100);
        hw.module_reset(0x5d);
        assert_eq!(file.read(HOST1X04_INFO.sync_reg(SYNC_MODULE_RESET)), 0x5d);
    }

    #[test]
    fn test_channel_registers_direct() {
        let file = Arc::new(RegFile::default());
        let hw = Host1x04::new(file.clone());
        hw.cdma_kick(3, 0x1000_0040);
        assert_eq!(file.read(HOST1X04_INFO.channel_reg(3, CHANNEL_DMAPUT)), 0x1000_0040);
        assert_eq!(hw.cdma_put(3), 0x1000_0040);
    }
}
