// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Host1x command DMA, syncpoint and channel engine.
//!
//! Clients build [`job::Job`]s out of command buffers in the [`memory`] pool
//! and submit them to a [`channel::Channel`]. Each channel streams its jobs
//! through a push buffer ([`push_buffer`]) consumed by the hardware's
//! command DMA ([`cdma`]); completion is tracked with syncpoint fences
//! ([`syncpoint`], [`intr`]) and stuck jobs are recovered by [`timeout`].
//! [`sim`] models the hardware for tests and the CLI.

pub mod backend;
pub mod cdma;
pub mod channel;
pub mod debug;
pub mod device;
pub mod intr;
pub mod job;
pub mod memory;
pub mod opcodes;
pub mod push_buffer;
pub mod regs;
pub mod sim;
pub mod syncpoint;
pub mod timeout;

pub use channel::{Channel, ChannelPool, EngineDesc, ResourcePolicy};
pub use device::{Host1xDevice, Platform};
pub use job::{Job, JobHandle, JobOutcome};
