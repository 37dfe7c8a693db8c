// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

/// Hardware syncpoint index.
pub type SyncptId = u32;

/// Hardware channel index.
pub type ChannelId = u32;

/// Identifies the submitting context (one per open channel node).
pub type ClientId = u32;

/// Device-visible 32-bit I/O virtual address.
pub type Iova = u32;

/// Bytes per push buffer slot (opcode word + operand word).
pub const SLOT_BYTES: u32 = 8;

/// Words per push buffer slot.
pub const SLOT_WORDS: usize = 2;

/// Syncpoint reserved for the host itself. Never handed out to clients,
/// its value is never incremented, so a wait on `(0, 0)` is always satisfied.
pub const HOST_RESERVED_SYNCPT: SyncptId = 0;

/// Page size used for DMA allocations.
pub const PAGE_SIZE: u32 = 0x1000;

/// A syncpoint threshold: the work guarded by the fence is complete once
/// syncpoint `id` reaches `value`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fence {
    pub id: SyncptId,
    pub value: u32,
}

impl Fence {
    pub const fn new(id: SyncptId, value: u32) -> Self {
        Self { id, value }
    }
}

impl std::fmt::Display for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "syncpt {}@{}", self.id, self.value)
    }
}

/// Round `value` up to the next multiple of `align` (power of two).
#[inline]
pub const fn align_up(value: u32, align: u32) -> u32 {
    (value + align - 1) & !(align - 1)
}
