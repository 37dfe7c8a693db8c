// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use thiserror::Error;

use crate::types::{ChannelId, ClientId, SyncptId};

/// Errors returned by host1x operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Host1xError {
    #[error("syncpoint {0} is out of range")]
    InvalidSyncpt(SyncptId),

    #[error("syncpoint {0} is not assigned")]
    SyncptNotAssigned(SyncptId),

    #[error("no free syncpoint")]
    NoFreeSyncpt,

    #[error("module mutex {0} is out of range")]
    InvalidMlock(u32),

    #[error("module mutex {0} is held")]
    MlockBusy(u32),

    #[error("push buffer full (needed {needed} slots, {available} free)")]
    PushBufferFull { needed: u32, available: u32 },

    #[error("reservation of {slots} slots exceeds the limit of {limit}")]
    ReservationTooLarge { slots: u32, limit: u32 },

    #[error("pushed more than the {reserved} reserved slots")]
    SlotOverrun { reserved: u32 },

    #[error("memory handle {0} is not valid")]
    InvalidHandle(u32),

    #[error("range [{offset}..+{words}) is outside memory handle {handle}")]
    InvalidRange { handle: u32, offset: u32, words: u32 },

    #[error("memory handle {0} is still pinned")]
    HandlePinned(u32),

    #[error("interrupt waiter budget exhausted")]
    WaiterLimit,

    #[error("timed out")]
    Timeout,

    #[error("no free channel")]
    NoChannel,

    #[error("channel {0} is faulted")]
    ChannelFaulted(ChannelId),

    #[error("client {0} has a timed out submit on this channel")]
    ClientTimedOut(ClientId),

    #[error("module reset failed for {0}")]
    ModuleResetFailed(String),

    #[error("channel {0} is closed")]
    ChannelClosed(ChannelId),

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

/// Result alias for host1x operations.
pub type Host1xResult<T> = Result<T, Host1xError>;

/// POSIX error numbers used by the ioctl layer.
pub mod errno {
    pub const EIO: i32 = 5;
    pub const EBADF: i32 = 9;
    pub const EAGAIN: i32 = 11;
    pub const ENOMEM: i32 = 12;
    pub const EBUSY: i32 = 16;
    pub const ENODEV: i32 = 19;
    pub const EINVAL: i32 = 22;
    pub const ENOSPC: i32 = 28;
    pub const ENOTTY: i32 = 25;
    pub const ETIMEDOUT: i32 = 110;
}

impl Host1xError {
    /// Positive errno for this error.
    pub fn errno(&self) -> i32 {
        match self {
            Self::InvalidSyncpt(_)
            | Self::SyncptNotAssigned(_)
            | Self::InvalidMlock(_)
            | Self::InvalidHandle(_)
            | Self::InvalidRange { .. }
            | Self::ReservationTooLarge { .. }
            | Self::SlotOverrun { .. }
            | Self::InvalidArgument(_) => errno::EINVAL,
            Self::NoFreeSyncpt | Self::WaiterLimit => errno::ENOMEM,
            Self::PushBufferFull { .. } => errno::ENOSPC,
            Self::Timeout => errno::EAGAIN,
            Self::MlockBusy(_) | Self::HandlePinned(_) | Self::NoChannel => errno::EBUSY,
            Self::ClientTimedOut(_) => errno::ETIMEDOUT,
            Self::ChannelFaulted(_) | Self::ModuleResetFailed(_) => errno::EIO,
            Self::ChannelClosed(_) => errno::ENODEV,
        }
    }

    /// True for failures the caller may retry once resources free up.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::PushBufferFull { .. } | Self::WaiterLimit | Self::NoChannel | Self::Timeout
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(Host1xError::InvalidSyncpt(999).errno(), errno::EINVAL);
        assert_eq!(Host1xError::Timeout.errno(), errno::EAGAIN);
        assert_eq!(Host1xError::ClientTimedOut(1).errno(), errno::ETIMEDOUT);
        assert_eq!(Host1xError::ChannelFaulted(2).errno(), errno::EIO);
        assert_eq!(
            Host1xError::PushBufferFull { needed: 4, available: 1 }.errno(),
            errno::ENOSPC
        );
    }

    #[test]
    fn test_transient() {
        assert!(Host1xError::WaiterLimit.is_transient());
        assert!(!Host1xError::InvalidSyncpt(0).is_transient());
    }

    #[test]
    fn test_display() {
        let e = Host1xError::PushBufferFull { needed: 8, available: 3 };
        assert_eq!(e.to_string(), "push buffer full (needed 8 slots, 3 free)");
    }
}
