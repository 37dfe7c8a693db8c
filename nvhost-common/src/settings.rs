// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::time::Duration;

/// Device settings, populated from the config INI.
#[derive(Debug, Clone)]
pub struct Host1xSettings {
    // Hardware
    pub chip: ChipGeneration,
    pub push_buffer_slots: u32,

    // Submission
    pub cdma_timeout_ms: u32,
    pub submit_wait_ms: u32,

    // Interrupts
    pub intr_mode: IntrMode,
    pub poll_period_ms: u32,
    pub max_waiters: usize,

    // Waits
    pub syncpt_check_period_ms: u32,
    pub max_stuck_checks: u32,

    // Debug
    pub debug_dump: bool,
}

impl Default for Host1xSettings {
    fn default() -> Self {
        Self {
            chip: ChipGeneration::Host1x01,
            push_buffer_slots: 512,
            cdma_timeout_ms: 2000,
            submit_wait_ms: 500,
            intr_mode: IntrMode::Interrupt,
            poll_period_ms: 1,
            max_waiters: 4096,
            syncpt_check_period_ms: 2000,
            max_stuck_checks: 2,
            debug_dump: false,
        }
    }
}

impl Host1xSettings {
    /// Default per-job watchdog, `None` when disabled.
    pub fn cdma_timeout(&self) -> Option<Duration> {
        match self.cdma_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms as u64)),
        }
    }

    pub fn submit_wait(&self) -> Duration {
        Duration::from_millis(self.submit_wait_ms as u64)
    }

    pub fn poll_period(&self) -> Duration {
        Duration::from_millis(self.poll_period_ms.max(1) as u64)
    }

    pub fn syncpt_check_period(&self) -> Duration {
        Duration::from_millis(self.syncpt_check_period_ms.max(1) as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChipGeneration {
    /// Direct MMIO access to every register block.
    Host1x01,
    /// Sync registers reachable only through the hypervisor window.
    Host1x04,
}

impl ChipGeneration {
    pub fn from_str_or_default(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "1" | "host1x01" | "t124" => Self::Host1x01,
            "4" | "host1x04" | "t186" => Self::Host1x04,
            _ => Self::Host1x01,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntrMode {
    /// Threshold interrupts delivered through the platform IRQ line.
    Interrupt,
    /// A kernel-thread style poller samples syncpoints periodically.
    Polling,
}

impl IntrMode {
    pub fn from_str_or_default(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "poll" | "polling" => Self::Polling,
            "irq" | "interrupt" => Self::Interrupt,
            _ => Self::Interrupt,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chip_parse() {
        assert_eq!(ChipGeneration::from_str_or_default("T186"), ChipGeneration::Host1x04);
        assert_eq!(ChipGeneration::from_str_or_default(" host1x01 "), ChipGeneration::Host1x01);
        assert_eq!(ChipGeneration::from_str_or_default("bogus"), ChipGeneration::Host1x01);
    }

    #[test]
    fn test_timeout_zero_disables() {
        let mut s = Host1xSettings::default();
        assert_eq!(s.cdma_timeout(), Some(Duration::from_millis(2000)));
        s.cdma_timeout_ms = 0;
        assert_eq!(s.cdma_timeout(), None);
    }

    #[test]
    fn test_intr_mode_parse() {
        assert_eq!(IntrMode::from_str_or_default("poll"), IntrMode::Polling);
        assert_eq!(IntrMode::from_str_or_default("irq"), IntrMode::Interrupt);
    }
}
