// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! File descriptor table for the device nodes.
//!
//! Routes `open`, `ioctl` and `close` to the node behind each descriptor.
//! Return values follow the kernel convention: a descriptor or zero on
//! success, a negative errno on failure.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use nvhost_common::error::errno;
use nvhost_core::{EngineDesc, Host1xDevice};

use crate::channel::ChannelNode;
use crate::ctrl::CtrlNode;
use crate::node::NvhostNode;
use crate::nvmap::NvmapNode;

pub const CTRL_PATH: &str = "/dev/nvhost-ctrl";
pub const NVMAP_PATH: &str = "/dev/nvmap";
const ENGINE_PREFIX: &str = "/dev/nvhost-";

type File = Arc<Mutex<Box<dyn NvhostNode>>>;

pub struct NvhostNodes {
    dev: Arc<Host1xDevice>,
    engines: Vec<EngineDesc>,
    files: Mutex<HashMap<i32, File>>,
    next_fd: AtomicI32,
    next_client: AtomicU32,
}

impl NvhostNodes {
    pub fn new(dev: Arc<Host1xDevice>, engines: Vec<EngineDesc>) -> Self {
        Self {
            dev,
            engines,
            files: Mutex::new(HashMap::new()),
            next_fd: AtomicI32::new(3),
            next_client: AtomicU32::new(1),
        }
    }

    pub fn device(&self) -> &Arc<Host1xDevice> {
        &self.dev
    }

    /// Node paths served, engines last.
    pub fn paths(&self) -> Vec<String> {
        let mut paths = vec![CTRL_PATH.to_string(), NVMAP_PATH.to_string()];
        paths.extend(self.engines.iter().map(|e| format!("{}{}", ENGINE_PREFIX, e.name)));
        paths
    }

    fn create(&self, path: &str) -> Result<Box<dyn NvhostNode>, i32> {
        match path {
            CTRL_PATH => Ok(Box::new(CtrlNode::new(self.dev.clone()))),
            NVMAP_PATH => Ok(Box::new(NvmapNode::new(self.dev.memory().clone()))),
            _ => {
                let engine = path
                    .strip_prefix(ENGINE_PREFIX)
                    .and_then(|name| self.engines.iter().find(|e| e.name == name))
                    .ok_or(errno::ENODEV)?;
                let client = self.next_client.fetch_add(1, Ordering::Relaxed);
                let channel = self.dev.open_channel(client, engine).map_err(|e| {
                    log::warn!("nvhost: open {} failed: {}", path, e);
                    e.errno()
                })?;
                Ok(Box::new(ChannelNode::new(path.to_string(), self.dev.clone(), channel, client)))
            }
        }
    }

    pub fn open(&self, path: &str) -> i32 {
        match self.create(path) {
            Ok(node) => {
                let fd = self.next_fd.fetch_add(1, Ordering::Relaxed);
                self.files.lock().insert(fd, Arc::new(Mutex::new(node)));
                log::debug!("nvhost: open(\"{}\") -> fd {}", path, fd);
                fd
            }
            Err(e) => {
                log::warn!("nvhost: open(\"{}\") failed: errno {}", path, e);
                -e
            }
        }
    }

    /// Run ioctl `cmd` on `fd`. Only the low byte of `cmd` selects the
    /// operation.
    pub fn ioctl(&self, fd: i32, cmd: u32, input: &[u8], output: &mut Vec<u8>) -> i32 {
        let Some(file) = self.files.lock().get(&fd).cloned() else {
            log::warn!("nvhost: ioctl on bad fd {}", fd);
            return -errno::EBADF;
        };
        let mut node = file.lock();
        let nr = cmd & 0xFF;
        match node.ioctl(nr, input, output) {
            Ok(()) => 0,
            Err(e) => {
                log::debug!("nvhost: {} ioctl {} failed: {}", node.name(), nr, e);
                -e.errno()
            }
        }
    }

    pub fn close(&self, fd: i32) -> i32 {
        let Some(file) = self.files.lock().remove(&fd) else {
            return -errno::EBADF;
        };
        let mut node = file.lock();
        log::debug!("nvhost: close fd {} ({})", fd, node.name());
        node.close();
        0
    }

    /// Close every open descriptor.
    pub fn close_all(&self) {
        let files: Vec<_> = self.files.lock().drain().collect();
        for (_, file) in files {
            file.lock().close();
        }
    }
}

impl Drop for NvhostNodes {
    fn drop(&mut self) {
        self.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{
        GET_SYNCPOINT, GET_TIMEDOUT, OUTCOME_ABORTED, OUTCOME_COMPLETED, SET_TIMEOUT, SUBMIT, WAIT_JOB,
    };
    use crate::ctrl::{MODULE_MUTEX, NO_TIMEOUT, SYNCPT_READ, SYNCPT_WAIT};
    use crate::node::{from_words, to_words};
    use crate::nvmap::{CREATE, READ, WRITE};
    use nvhost_common::settings::Host1xSettings;
    use nvhost_core::memory::DmaPool;
    use nvhost_core::opcodes;
    use nvhost_core::sim::SimHost1x;
    use nvhost_core::Platform;
    use std::thread;

    const VIC: u32 = 0x5d;
    const NVDEC: u32 = 0xf0;

    fn nodes() -> (Arc<NvhostNodes>, Arc<SimHost1x>) {
        let settings = Host1xSettings { push_buffer_slots: 64, cdma_timeout_ms: 200, ..Default::default() };
        let memory = Arc::new(DmaPool::new());
        let sim = SimHost1x::new(settings.chip, memory.clone());
        let dev = Arc::new(Host1xDevice::probe(Platform::simulated(&sim, memory), &settings).unwrap());
        let engines = vec![EngineDesc::new("vic", VIC), EngineDesc::new("nvdec", NVDEC).with_mlock(1)];
        (Arc::new(NvhostNodes::new(dev, engines)), sim)
    }

    fn call(nodes: &NvhostNodes, fd: i32, cmd: u32, words: &[u32]) -> Result<Vec<u32>, i32> {
        let mut out = Vec::new();
        match nodes.ioctl(fd, cmd, &from_words(words), &mut out) {
            0 => Ok(to_words(&out)),
            rc => Err(rc),
        }
    }

    /// Build a command buffer through nvmap: `incrs` immediate increments of
    /// syncpoint `id` from `class`.
    fn cmdbuf(nodes: &NvhostNodes, nvmap: i32, class: u32, id: u32, incrs: u32) -> (u32, u32) {
        let mut words = vec![opcodes::setclass(class, 0, 0), opcodes::nonincr(0, incrs)];
        words.extend((0..incrs).map(|_| opcodes::incr_syncpt(opcodes::COND_IMMEDIATE, id)));
        let handle = call(nodes, nvmap, CREATE, &[words.len() as u32]).unwrap()[0];
        let mut args = vec![handle, 0, words.len() as u32];
        args.extend(&words);
        call(nodes, nvmap, WRITE, &args).unwrap();
        (handle, words.len() as u32)
    }

    #[test]
    fn test_open_paths() {
        let (nodes, _sim) = nodes();
        assert_eq!(
            nodes.paths(),
            vec!["/dev/nvhost-ctrl", "/dev/nvmap", "/dev/nvhost-vic", "/dev/nvhost-nvdec"]
        );
        let a = nodes.open(CTRL_PATH);
        let b = nodes.open("/dev/nvhost-vic");
        assert!(a >= 0 && b >= 0 && a != b);
        assert_eq!(nodes.open("/dev/nvhost-gpu"), -errno::ENODEV);
        assert_eq!(nodes.open("/dev/null"), -errno::ENODEV);
        assert_eq!(nodes.close(a), 0);
        assert_eq!(nodes.close(a), -errno::EBADF);
        assert_eq!(call(&nodes, a, SYNCPT_READ, &[1]), Err(-errno::EBADF));
    }

    #[test]
    fn test_submit_and_wait_through_nodes() {
        let (nodes, sim) = nodes();
        let nvmap = nodes.open(NVMAP_PATH);
        let ctrl = nodes.open(CTRL_PATH);
        let vic = nodes.open("/dev/nvhost-vic");

        let id = call(&nodes, vic, GET_SYNCPOINT, &[]).unwrap()[0];
        assert_eq!(call(&nodes, vic, GET_SYNCPOINT, &[]).unwrap(), vec![id]);
        let (mem, words) = cmdbuf(&nodes, nvmap, VIC, id, 2);

        // One increment block, one cmdbuf, default timeout.
        let submit = [1, 1, 0, 0, NO_TIMEOUT, 0, 2, mem, 0, words, VIC, 0, 0];
        let out = call(&nodes, vic, SUBMIT, &submit).unwrap();
        let (job, fence_id, fence) = (out[0], out[1], out[2]);
        assert_eq!((fence_id, fence), (id, 3));

        assert_eq!(call(&nodes, ctrl, SYNCPT_WAIT, &[id, fence, 5000]).unwrap(), vec![3]);
        assert_eq!(call(&nodes, vic, WAIT_JOB, &[job, 5000]).unwrap(), vec![OUTCOME_COMPLETED]);
        assert_eq!(call(&nodes, vic, WAIT_JOB, &[job, 0]), Err(-errno::EINVAL));
        assert_eq!(sim.syncpt_value(id), 3);
        assert_eq!(call(&nodes, nvmap, READ, &[mem, 0, 1]).unwrap(), vec![opcodes::setclass(VIC, 0, 0)]);

        assert_eq!(nodes.close(vic), 0);
        assert!(!nodes.device().syncpt().is_assigned(id));
        assert!(nodes.device().channels().active().is_empty());
    }

    #[test]
    fn test_stuck_job_reports_abort_and_client_timeout() {
        let (nodes, sim) = nodes();
        let nvmap = nodes.open(NVMAP_PATH);
        let vic = nodes.open("/dev/nvhost-vic");
        let id = call(&nodes, vic, GET_SYNCPOINT, &[]).unwrap()[0];
        let (mem, words) = cmdbuf(&nodes, nvmap, VIC, id, 1);
        call(&nodes, vic, SET_TIMEOUT, &[50]).unwrap();

        sim.set_engine_stalled(VIC, true);
        let submit = [1, 1, 0, 0, NO_TIMEOUT, 0, 1, mem, 0, words, VIC, 0, 0];
        let job = call(&nodes, vic, SUBMIT, &submit).unwrap()[0];
        assert_eq!(call(&nodes, vic, WAIT_JOB, &[job, 5000]).unwrap(), vec![OUTCOME_ABORTED]);
        assert_eq!(call(&nodes, vic, SUBMIT, &submit), Err(-errno::ETIMEDOUT));
        sim.set_engine_stalled(VIC, false);
    }

    #[test]
    fn test_get_timedout_and_close_prunes_client() {
        let (nodes, sim) = nodes();
        let nvmap = nodes.open(NVMAP_PATH);
        // Client 1 times out, client 2 keeps the shared channel mapped.
        let stuck = nodes.open("/dev/nvhost-vic");
        let other = nodes.open("/dev/nvhost-vic");
        let id = call(&nodes, stuck, GET_SYNCPOINT, &[]).unwrap()[0];
        let (mem, words) = cmdbuf(&nodes, nvmap, VIC, id, 1);
        call(&nodes, stuck, SET_TIMEOUT, &[50]).unwrap();
        assert_eq!(call(&nodes, stuck, GET_TIMEDOUT, &[]).unwrap(), vec![0]);

        sim.set_engine_stalled(VIC, true);
        let submit = [1, 1, 0, 0, NO_TIMEOUT, 0, 1, mem, 0, words, VIC, 0, 0];
        let job = call(&nodes, stuck, SUBMIT, &submit).unwrap()[0];
        assert_eq!(call(&nodes, stuck, WAIT_JOB, &[job, 5000]).unwrap(), vec![OUTCOME_ABORTED]);
        sim.set_engine_stalled(VIC, false);
        assert_eq!(call(&nodes, stuck, GET_TIMEDOUT, &[]).unwrap(), vec![1]);
        assert_eq!(call(&nodes, other, GET_TIMEDOUT, &[]).unwrap(), vec![0]);

        let channel = nodes.device().channels().active()[0].clone();
        assert!(channel.is_client_timed_out(1));
        nodes.close(stuck);
        assert!(!channel.is_client_timed_out(1));
        assert_eq!(nodes.device().channels().active().len(), 1);
        nodes.close(other);
    }

    #[test]
    fn test_malformed_submits() {
        let (nodes, _sim) = nodes();
        let vic = nodes.open("/dev/nvhost-vic");
        assert_eq!(call(&nodes, vic, SUBMIT, &[1, 1, 0, 0, 0, 0]), Err(-errno::EINVAL));
        assert_eq!(call(&nodes, vic, SUBMIT, &[0, 0, 0, 0, 0]), Err(-errno::EINVAL));
        // Unknown memory handle.
        assert_eq!(
            call(&nodes, vic, SUBMIT, &[1, 1, 0, 0, 0, 0, 1, 999, 0, 4, VIC, 0, 0]),
            Err(-errno::EINVAL)
        );
        assert_eq!(call(&nodes, vic, 0x77, &[]), Err(-errno::ENOTTY));

        let nvmap = nodes.open(NVMAP_PATH);
        let id = call(&nodes, vic, GET_SYNCPOINT, &[]).unwrap()[0];
        let (mem, words) = cmdbuf(&nodes, nvmap, VIC, id, 1);
        let target = call(&nodes, nvmap, CREATE, &[4]).unwrap()[0];
        // Relocation shifted by 32 bits.
        assert_eq!(
            call(&nodes, vic, SUBMIT, &[1, 1, 1, 0, 0, 0, 1, mem, 0, words, VIC, 0, 0, mem, 4, target, 0, 32]),
            Err(-errno::EINVAL)
        );
        // Wait check at an offset that wraps the address space.
        assert_eq!(
            call(&nodes, vic, SUBMIT, &[1, 1, 0, 1, 0, 0, 1, mem, 0, words, VIC, 0, 0, mem, 0xFFFF_FFFC, id, 0]),
            Err(-errno::EINVAL)
        );
        // Increment count that overflows the fence arithmetic.
        assert_eq!(
            call(&nodes, vic, SUBMIT, &[1, 1, 0, 0, 0, 0, u32::MAX, mem, 0, words, VIC, 0, 0]),
            Err(-errno::EINVAL)
        );
        // The command buffer is untouched and the channel still works.
        assert_eq!(call(&nodes, nvmap, READ, &[mem, 4, 1]).unwrap(), vec![opcodes::nonincr(0, 1)]);
        assert_eq!(nodes.device().syncpt().read_max(id).unwrap(), 0);
        let job = call(&nodes, vic, SUBMIT, &[1, 1, 0, 0, NO_TIMEOUT, 0, 1, mem, 0, words, VIC, 0, 0]).unwrap()[0];
        assert_eq!(call(&nodes, vic, WAIT_JOB, &[job, 5000]).unwrap(), vec![OUTCOME_COMPLETED]);
    }

    #[test]
    fn test_ctrl_close_releases_mutex() {
        let (nodes, _sim) = nodes();
        let a = nodes.open(CTRL_PATH);
        let b = nodes.open(CTRL_PATH);
        call(&nodes, a, MODULE_MUTEX, &[5, 1]).unwrap();
        assert_eq!(call(&nodes, b, MODULE_MUTEX, &[5, 1]), Err(-errno::EBUSY));
        nodes.close(a);
        call(&nodes, b, MODULE_MUTEX, &[5, 1]).unwrap();
    }

    #[test]
    fn test_concurrent_clients_share_engine_channel() {
        let (nodes, _sim) = nodes();
        let threads: Vec<_> = (0..3)
            .map(|_| {
                let nodes = nodes.clone();
                thread::spawn(move || {
                    let nvmap = nodes.open(NVMAP_PATH);
                    let fd = nodes.open("/dev/nvhost-nvdec");
                    let id = call(&nodes, fd, GET_SYNCPOINT, &[]).unwrap()[0];
                    let (mem, words) = cmdbuf(&nodes, nvmap, NVDEC, id, 1);
                    let submit = [1, 1, 0, 0, NO_TIMEOUT, 0, 1, mem, 0, words, NVDEC, 0, 0];
                    for _ in 0..5 {
                        let job = call(&nodes, fd, SUBMIT, &submit).unwrap()[0];
                        assert_eq!(call(&nodes, fd, WAIT_JOB, &[job, 5000]).unwrap(), vec![OUTCOME_COMPLETED]);
                    }
                    let value = nodes.device().syncpt().read_min(id).unwrap();
                    nodes.close(fd);
                    nodes.close(nvmap);
                    value
                })
            })
            .collect();
        for t in threads {
            assert_eq!(t.join().unwrap(), 10);
        }
        assert!(nodes.device().channels().active().is_empty());
        assert_eq!(nodes.device().memory().num_buffers(), 0);
    }
}
