// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Host1x command stream opcodes.
//!
//! Every command word carries its opcode in bits [31:28]:
//!
//! | Opcode | Name      | Layout                                            |
//! |--------|-----------|---------------------------------------------------|
//! | 0      | SETCLASS  | offset [27:16], class [15:6], mask [5:0]          |
//! | 1      | INCR      | offset [27:16], count [15:0]                      |
//! | 2      | NONINCR   | offset [27:16], count [15:0]                      |
//! | 3      | MASK      | offset [27:16], mask [15:0]                       |
//! | 4      | IMM       | offset [27:16], data [15:0]                       |
//! | 5      | RESTART   | address >> 4 [27:0]                               |
//! | 6      | GATHER    | offset [27:16], insert [15], incr [14], count [13:0] |
//! | 14     | MLOCK     | release [24], mlock id [7:0]                      |
//!
//! The push buffer itself is a sequence of two-word slots. The helpers at the
//! bottom of this file build the canonical slots used by channel submission.

/// Class id of the host itself.
pub const HOST1X_CLASS_ID: u32 = 0x01;

/// Host class register: increment a syncpoint, value = `(cond << 8) | id`.
/// Method 0 of every client class has the same meaning.
pub const UCLASS_INCR_SYNCPT: u32 = 0x00;
/// Host class register: 32-bit payload for the next `WAIT_SYNCPT_32`.
pub const UCLASS_LOAD_SYNCPT_PAYLOAD_32: u32 = 0x4e;
/// Host class register: wait until syncpoint (data) reaches the payload.
pub const UCLASS_WAIT_SYNCPT_32: u32 = 0x50;

/// Increment once the method is accepted.
pub const COND_IMMEDIATE: u32 = 0;
/// Increment once the engine has finished all preceding work.
pub const COND_OP_DONE: u32 = 1;
pub const COND_RD_DONE: u32 = 2;
pub const COND_REG_WR_SAFE: u32 = 3;

/// Non-incrementing write of zero words to register 0.
pub const NOOP: u32 = nonincr(0, 0);

pub const fn setclass(class_id: u32, offset: u32, mask: u32) -> u32 {
    ((offset & 0xfff) << 16) | ((class_id & 0x3ff) << 6) | (mask & 0x3f)
}

pub const fn incr(offset: u32, count: u32) -> u32 {
    (1 << 28) | ((offset & 0xfff) << 16) | (count & 0xffff)
}

pub const fn nonincr(offset: u32, count: u32) -> u32 {
    (2 << 28) | ((offset & 0xfff) << 16) | (count & 0xffff)
}

pub const fn mask(offset: u32, mask: u32) -> u32 {
    (3 << 28) | ((offset & 0xfff) << 16) | (mask & 0xffff)
}

pub const fn imm(offset: u32, value: u32) -> u32 {
    (4 << 28) | ((offset & 0xfff) << 16) | (value & 0xffff)
}

pub const fn restart(address: u32) -> u32 {
    (5 << 28) | (address >> 4)
}

pub const fn gather(count: u32) -> u32 {
    (6 << 28) | (count & 0x3fff)
}

pub const fn acquire_mlock(id: u32) -> u32 {
    (14 << 28) | (id & 0xff)
}

pub const fn release_mlock(id: u32) -> u32 {
    (14 << 28) | (1 << 24) | (id & 0xff)
}

/// Data word for an `INCR_SYNCPT` write.
pub const fn incr_syncpt(cond: u32, id: u32) -> u32 {
    ((cond & 0xff) << 8) | (id & 0xff)
}

/// Decoded command word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    SetClass { class_id: u32, offset: u32, mask: u32 },
    Incr { offset: u32, count: u32 },
    NonIncr { offset: u32, count: u32 },
    Mask { offset: u32, mask: u32 },
    Imm { offset: u32, value: u32 },
    Restart { address: u32 },
    Gather { offset: u32, insert: bool, incr: bool, count: u32 },
    AcquireMlock { id: u32 },
    ReleaseMlock { id: u32 },
    Unknown(u32),
}

impl Opcode {
    pub fn decode(word: u32) -> Self {
        let offset = (word >> 16) & 0xfff;
        match word >> 28 {
            0 => Self::SetClass {
                class_id: (word >> 6) & 0x3ff,
                offset,
                mask: word & 0x3f,
            },
            1 => Self::Incr { offset, count: word & 0xffff },
            2 => Self::NonIncr { offset, count: word & 0xffff },
            3 => Self::Mask { offset, mask: word & 0xffff },
            4 => Self::Imm { offset, value: word & 0xffff },
            5 => Self::Restart { address: (word & 0x0fff_ffff) << 4 },
            6 => Self::Gather {
                offset,
                insert: word & (1 << 15) != 0,
                incr: word & (1 << 14) != 0,
                count: word & 0x3fff,
            },
            14 if word & (1 << 24) != 0 => Self::ReleaseMlock { id: word & 0xff },
            14 => Self::AcquireMlock { id: word & 0xff },
            _ => Self::Unknown(word),
        }
    }

    /// Number of data words that follow this command word in the stream.
    /// A gather's data word is its address.
    pub fn data_words(&self) -> u32 {
        match *self {
            Self::SetClass { mask, .. } | Self::Mask { mask, .. } => mask.count_ones(),
            Self::Incr { count, .. } | Self::NonIncr { count, .. } => count,
            Self::Gather { .. } => 1,
            _ => 0,
        }
    }
}

// ── Canonical push buffer slots ─────────────────────────────────────────────

pub type Slot = (u32, u32);

pub const PAD_SLOT: Slot = (NOOP, NOOP);

pub const fn class_slot(class_id: u32) -> Slot {
    (setclass(class_id, 0, 0), NOOP)
}

pub const fn gather_slot(words: u32, iova: u32) -> Slot {
    (gather(words), iova)
}

/// Two slots waiting for `id` to reach `thresh` (full 32-bit compare).
pub const fn wait_slots(id: u32, thresh: u32) -> [Slot; 2] {
    [
        (setclass(HOST1X_CLASS_ID, UCLASS_LOAD_SYNCPT_PAYLOAD_32, 1), thresh),
        (nonincr(UCLASS_WAIT_SYNCPT_32, 1), id),
    ]
}

pub const fn acquire_mlock_slot(id: u32) -> Slot {
    (acquire_mlock(id), NOOP)
}

pub const fn release_mlock_slot(id: u32) -> Slot {
    (release_mlock(id), NOOP)
}

/// The last slot of a job: the engine increments `id` once everything before
/// it has retired.
pub const fn final_incr_slot(class_id: u32, id: u32) -> Slot {
    (setclass(class_id, UCLASS_INCR_SYNCPT, 1), incr_syncpt(COND_OP_DONE, id))
}
