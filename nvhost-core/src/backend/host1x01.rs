// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Host1x01 (T124 class): every register block is plain MMIO.

use std::sync::Arc;

use super::Host1xRegs;
use crate::regs::{RegisterAccess, HOST1X01_INFO};

pub type Host1x01 = Host1xRegs<Arc<dyn RegisterAccess>, Arc<dyn RegisterAccess>>;

impl Host1x01 {
    pub fn new(regs: Arc<dyn RegisterAccess>) -> Self {
        log::debug!("host1x01: direct register access");
        Self::with_access(regs.clone(), regs, HOST1X01_INFO)
    }
}
