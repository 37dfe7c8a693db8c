// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! `/dev/nvhost-ctrl`: syncpoint access and module mutexes.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use nvhost_common::Host1xError;
use nvhost_core::Host1xDevice;

use crate::node::{put_u32, Args, IoctlError, IoctlResult, NvhostNode};

pub const SYNCPT_READ: u32 = 1;
pub const SYNCPT_INCR: u32 = 2;
pub const SYNCPT_WAIT: u32 = 3;
pub const MODULE_MUTEX: u32 = 4;
pub const GET_VERSION: u32 = 5;
pub const SYNCPT_READ_MAX: u32 = 6;
pub const GET_CHARACTERISTICS: u32 = 7;

/// Wait timeout meaning "forever".
pub const NO_TIMEOUT: u32 = u32::MAX;

pub const CTRL_VERSION: u32 = 1;

pub fn wait_timeout(ms: u32) -> Option<Duration> {
    match ms {
        NO_TIMEOUT => None,
        ms => Some(Duration::from_millis(ms as u64)),
    }
}

pub struct CtrlNode {
    dev: Arc<Host1xDevice>,
    /// Module mutexes taken through this file.
    held: HashSet<u32>,
}

impl CtrlNode {
    pub fn new(dev: Arc<Host1xDevice>) -> Self {
        Self { dev, held: HashSet::new() }
    }

    fn module_mutex(&mut self, id: u32, lock: bool) -> IoctlResult {
        let sp = self.dev.syncpt();
        if id >= sp.nb_mlocks() {
            return Err(Host1xError::InvalidMlock(id).into());
        }
        if lock {
            if !self.held.contains(&id) {
                sp.mutex_try_lock(id)?;
                self.held.insert(id);
            }
        } else if self.held.remove(&id) {
            sp.mutex_unlock(id)?;
        }
        log::debug!("nvhost-ctrl: module mutex {} {}", id, if lock { "locked" } else { "unlocked" });
        Ok(())
    }
}

impl NvhostNode for CtrlNode {
    fn name(&self) -> &str {
        "/dev/nvhost-ctrl"
    }

    fn ioctl(&mut self, nr: u32, input: &[u8], output: &mut Vec<u8>) -> IoctlResult {
        let mut args = Args::new(input);
        let sp = self.dev.syncpt().clone();
        match nr {
            // {id} -> {value}
            SYNCPT_READ => {
                let id = args.u32()?;
                put_u32(output, sp.update_min(id)?);
            }

            // {id}
            SYNCPT_INCR => {
                let id = args.u32()?;
                if id == 0 || !sp.is_valid(id) {
                    return Err(Host1xError::InvalidSyncpt(id).into());
                }
                if !sp.is_client_managed(id) {
                    sp.incr_max(id, 1)?;
                }
                sp.cpu_incr(id)?;
                log::trace!("nvhost-ctrl: incr {}", id);
            }

            // {id, thresh, timeout_ms} -> {value}
            SYNCPT_WAIT => {
                let id = args.u32()?;
                let thresh = args.u32()?;
                let timeout = wait_timeout(args.u32()?);
                put_u32(output, self.dev.wait(id, thresh, timeout)?);
            }

            // {id, lock}
            MODULE_MUTEX => {
                let id = args.u32()?;
                let lock = args.u32()? != 0;
                self.module_mutex(id, lock)?;
            }

            // -> {version}
            GET_VERSION => put_u32(output, CTRL_VERSION),

            // {id} -> {max}
            SYNCPT_READ_MAX => {
                let id = args.u32()?;
                put_u32(output, sp.read_max(id)?);
            }

            // -> {nb_syncpts, nb_mlocks, nb_channels}
            GET_CHARACTERISTICS => {
                let info = self.dev.info();
                put_u32(output, info.nb_pts);
                put_u32(output, info.nb_mlocks);
                put_u32(output, info.nb_channels);
            }

            _ => {
                log::warn!("nvhost-ctrl: unknown ioctl {}", nr);
                return Err(IoctlError::UnknownIoctl(nr));
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        for id in self.held.drain() {
            log::debug!("nvhost-ctrl: releasing module mutex {} on close", id);
            let _ = self.dev.syncpt().mutex_unlock(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{from_words, to_words};
    use nvhost_common::settings::Host1xSettings;
    use nvhost_core::backend::MlockState;
    use nvhost_core::memory::DmaPool;
    use nvhost_core::sim::SimHost1x;
    use nvhost_core::Platform;

    fn ctrl() -> (CtrlNode, Arc<Host1xDevice>) {
        let settings = Host1xSettings::default();
        let memory = Arc::new(DmaPool::new());
        let sim = SimHost1x::new(settings.chip, memory.clone());
        let dev = Arc::new(Host1xDevice::probe(Platform::simulated(&sim, memory), &settings).unwrap());
        (CtrlNode::new(dev.clone()), dev)
    }

    fn call(node: &mut CtrlNode, nr: u32, words: &[u32]) -> Result<Vec<u32>, IoctlError> {
        let mut out = Vec::new();
        node.ioctl(nr, &from_words(words), &mut out)?;
        Ok(to_words(&out))
    }

    #[test]
    fn test_incr_read_and_wait() {
        let (mut node, dev) = ctrl();
        let id = dev.syncpt().alloc_client_managed("user").unwrap();
        call(&mut node, SYNCPT_INCR, &[id]).unwrap();
        call(&mut node, SYNCPT_INCR, &[id]).unwrap();
        assert_eq!(call(&mut node, SYNCPT_READ, &[id]).unwrap(), vec![2]);
        assert_eq!(call(&mut node, SYNCPT_READ_MAX, &[id]).unwrap(), vec![2]);
        assert_eq!(call(&mut node, SYNCPT_WAIT, &[id, 2, NO_TIMEOUT]).unwrap(), vec![2]);
        assert_eq!(
            call(&mut node, SYNCPT_WAIT, &[id, 3, 0]),
            Err(IoctlError::Host(Host1xError::Timeout))
        );
    }

    #[test]
    fn test_incr_reserved_and_host_managed() {
        let (mut node, dev) = ctrl();
        assert!(call(&mut node, SYNCPT_INCR, &[0]).is_err());
        let id = dev.syncpt().alloc_host_managed("host").unwrap();
        call(&mut node, SYNCPT_INCR, &[id]).unwrap();
        assert_eq!(call(&mut node, SYNCPT_READ_MAX, &[id]).unwrap(), vec![1]);
        assert_eq!(call(&mut node, SYNCPT_WAIT, &[id, 1, 1000]).unwrap(), vec![1]);
        // Nothing reserved past max: the wait is pending, not satisfied.
        assert_eq!(
            call(&mut node, SYNCPT_WAIT, &[id, 2, 0]),
            Err(IoctlError::Host(Host1xError::Timeout))
        );
    }

    #[test]
    fn test_module_mutex_released_on_close() {
        let (mut node, dev) = ctrl();
        let mut other = CtrlNode::new(dev.clone());
        call(&mut node, MODULE_MUTEX, &[2, 1]).unwrap();
        assert_eq!(
            call(&mut other, MODULE_MUTEX, &[2, 1]),
            Err(IoctlError::Host(Host1xError::MlockBusy(2)))
        );
        // Unlocking a mutex this file does not hold is a no-op.
        call(&mut other, MODULE_MUTEX, &[2, 0]).unwrap();
        assert_eq!(dev.syncpt().backend().mlock_owner(2), MlockState::Cpu);

        node.close();
        assert_eq!(dev.syncpt().backend().mlock_owner(2), MlockState::Free);
        call(&mut other, MODULE_MUTEX, &[2, 1]).unwrap();
        let nb = dev.syncpt().nb_mlocks();
        assert_eq!(
            call(&mut other, MODULE_MUTEX, &[nb, 1]),
            Err(IoctlError::Host(Host1xError::InvalidMlock(nb)))
        );
    }

    #[test]
    fn test_version_and_characteristics() {
        let (mut node, dev) = ctrl();
        assert_eq!(call(&mut node, GET_VERSION, &[]).unwrap(), vec![CTRL_VERSION]);
        let info = *dev.info();
        assert_eq!(
            call(&mut node, GET_CHARACTERISTICS, &[]).unwrap(),
            vec![info.nb_pts, info.nb_mlocks, info.nb_channels]
        );
        assert_eq!(call(&mut node, 99, &[]), Err(IoctlError::UnknownIoctl(99)));
        assert_eq!(call(&mut node, SYNCPT_READ, &[]), Err(IoctlError::Truncated));
    }
}
