// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Jobs: one client submission.
//!
//! A job is a list of gathers (command buffers in client memory, executed by
//! reference) plus the syncpoint increments they perform. Before submission the
//! job is pinned: its buffers get device addresses, relocations are patched
//! and wait checks that can no longer block are neutralised.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use nvhost_common::{
    ChannelId, ClientId, Fence, Host1xError, Host1xResult, Iova, SyncptId, HOST_RESERVED_SYNCPT,
};

use crate::channel::EngineDesc;
use crate::memory::{DmaPool, MemHandle};
use crate::syncpoint::SyncpointRegistry;

/// Upper bound (exclusive) on the increments one job may reserve. Fences
/// further ahead than this would break the wrap-aware comparisons.
pub const MAX_JOB_INCRS: u64 = 1 << 31;

#[derive(Debug, Clone)]
pub struct Gather {
    pub mem: MemHandle,
    /// Byte offset into `mem`.
    pub offset: u32,
    pub words: u32,
    pub class_id: u32,
    /// Wait for this fence before the gather executes.
    pub pre_fence: Option<Fence>,
    pub(crate) iova: Option<Iova>,
}

/// A four word `LOAD_SYNCPT_PAYLOAD_32` / `WAIT_SYNCPT_32` sequence inside a
/// command buffer.
#[derive(Debug, Clone, Copy)]
pub struct WaitCheck {
    pub mem: MemHandle,
    pub offset: u32,
    pub id: SyncptId,
    pub thresh: u32,
}

/// Write the address of `target + target_offset`, shifted right by `shift`,
/// into `cmdbuf` at `cmdbuf_offset`.
#[derive(Debug, Clone, Copy)]
pub struct Reloc {
    pub cmdbuf: MemHandle,
    pub cmdbuf_offset: u32,
    pub target: MemHandle,
    pub target_offset: u32,
    pub shift: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct SyncptIncr {
    pub id: SyncptId,
    pub incrs: u32,
}

pub struct Job {
    pub client: ClientId,
    gathers: Vec<Gather>,
    waitchks: Vec<WaitCheck>,
    relocs: Vec<Reloc>,
    syncpts: Vec<SyncptIncr>,
    timeout: Option<Duration>,
    pinned: Vec<MemHandle>,
}

impl Job {
    pub fn new(client: ClientId) -> Self {
        Self {
            client,
            gathers: Vec::new(),
            waitchks: Vec::new(),
            relocs: Vec::new(),
            syncpts: Vec::new(),
            timeout: None,
            pinned: Vec::new(),
        }
    }

    pub fn add_gather(&mut self, mem: MemHandle, offset: u32, words: u32, class_id: u32) -> &mut Gather {
        self.gathers.push(Gather { mem, offset, words, class_id, pre_fence: None, iova: None });
        let last = self.gathers.len() - 1;
        &mut self.gathers[last]
    }

    pub fn add_wait_check(&mut self, mem: MemHandle, offset: u32, id: SyncptId, thresh: u32) {
        self.waitchks.push(WaitCheck { mem, offset, id, thresh });
    }

    pub fn add_reloc(
        &mut self,
        cmdbuf: MemHandle,
        cmdbuf_offset: u32,
        target: MemHandle,
        target_offset: u32,
        shift: u32,
    ) {
        self.relocs.push(Reloc { cmdbuf, cmdbuf_offset, target, target_offset, shift });
    }

    /// The first syncpoint added is the job's primary: it also receives the
    /// final increment pushed after the last gather.
    pub fn add_syncpt(&mut self, id: SyncptId, incrs: u32) {
        self.syncpts.push(SyncptIncr { id, incrs });
    }

    /// Per-job watchdog. `None` uses the channel default, zero disables it.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn gathers(&self) -> &[Gather] {
        &self.gathers
    }

    pub fn syncpts(&self) -> &[SyncptIncr] {
        &self.syncpts
    }

    pub fn primary_syncpt(&self) -> Option<SyncptId> {
        self.syncpts.first().map(|s| s.id)
    }

    pub fn is_pinned(&self) -> bool {
        !self.pinned.is_empty()
    }

    /// Resolve device addresses, patch relocations and stale wait checks.
    ///
    /// On failure everything pinned so far is released again.
    pub fn pin(&mut self, pool: &DmaPool, syncpt: &SyncpointRegistry) -> Host1xResult<()> {
        if self.is_pinned() {
            return Ok(());
        }
        let result = self.pin_inner(pool, syncpt);
        if result.is_err() {
            self.unpin(pool);
        }
        result
    }

    fn pin_inner(&mut self, pool: &DmaPool, syncpt: &SyncpointRegistry) -> Host1xResult<()> {
        if self.syncpts.is_empty() {
            return Err(Host1xError::InvalidArgument("job has no syncpoint"));
        }
        // The final increment adds one to the primary syncpoint.
        let mut total = 1u64;
        for s in &self.syncpts {
            if !syncpt.is_valid(s.id) {
                return Err(Host1xError::InvalidSyncpt(s.id));
            }
            total += u64::from(s.incrs);
        }
        if total >= MAX_JOB_INCRS {
            return Err(Host1xError::InvalidArgument("too many syncpoint increments"));
        }

        let mut iovas: HashMap<MemHandle, Iova> = HashMap::new();
        let handles = self
            .gathers
            .iter()
            .map(|g| g.mem)
            .chain(self.relocs.iter().flat_map(|r| [r.cmdbuf, r.target]));
        for mem in handles {
            if iovas.contains_key(&mem) {
                continue;
            }
            let iova = pool.pin(mem)?;
            self.pinned.push(mem);
            iovas.insert(mem, iova);
        }

        // (handle, byte offset, word) patches, written once all are valid.
        let mut patches: Vec<(MemHandle, u32, u32)> = Vec::new();

        for r in &self.relocs {
            let target = pool.get(r.target)?;
            if r.target_offset >= target.size_bytes() {
                return Err(Host1xError::InvalidRange {
                    handle: r.target,
                    offset: r.target_offset,
                    words: 1,
                });
            }
            let addr = iovas[&r.target]
                .checked_add(r.target_offset)
                .and_then(|a| a.checked_shr(r.shift))
                .ok_or(Host1xError::InvalidArgument("relocation shift out of range"))?;
            patches.push((r.cmdbuf, r.cmdbuf_offset, addr));
        }

        for w in &self.waitchks {
            if !syncpt.is_valid(w.id) {
                return Err(Host1xError::InvalidSyncpt(w.id));
            }
            // Payload and syncpoint words of the wait sequence.
            let (Some(payload), Some(id_word)) = (w.offset.checked_add(4), w.offset.checked_add(12)) else {
                return Err(Host1xError::InvalidRange { handle: w.mem, offset: w.offset, words: 4 });
            };
            syncpt.update_min(w.id)?;
            if syncpt.is_wait_stale(w.id, w.thresh)? {
                log::debug!(
                    "job: patching stale wait syncpt {} thresh {} at handle {}+0x{:X}",
                    w.id,
                    w.thresh,
                    w.mem,
                    w.offset
                );
                patches.push((w.mem, payload, 0));
                patches.push((w.mem, id_word, HOST_RESERVED_SYNCPT));
            }
        }

        for g in &mut self.gathers {
            let buf = pool.get(g.mem)?;
            let end = g.offset as u64 + g.words as u64 * 4;
            if g.words == 0 || g.offset % 4 != 0 || end > buf.size_bytes() as u64 {
                return Err(Host1xError::InvalidRange { handle: g.mem, offset: g.offset, words: g.words });
            }
            if let Some(f) = g.pre_fence {
                if !syncpt.is_valid(f.id) {
                    return Err(Host1xError::InvalidSyncpt(f.id));
                }
            }
            g.iova = Some(iovas[&g.mem] + g.offset);
        }

        for &(mem, offset, _) in &patches {
            pool.check_range(mem, offset, 1)?;
        }
        for (mem, offset, word) in patches {
            pool.write(mem, offset, &[word])?;
        }
        Ok(())
    }

    /// Release every pinned buffer. Safe to call more than once.
    pub fn unpin(&mut self, pool: &DmaPool) {
        for mem in self.pinned.drain(..) {
            if let Err(e) = pool.unpin(mem) {
                log::warn!("job: unpin handle {}: {}", mem, e);
            }
        }
        for g in &mut self.gathers {
            g.iova = None;
        }
    }

    /// Worst-case push buffer slots for this job on `engine`.
    pub fn slots_needed(&self, engine: &EngineDesc) -> u32 {
        let per_gather = if engine.gather_mlock().is_some() { 4 } else { 2 };
        let waits = self.gathers.iter().filter(|g| g.pre_fence.is_some()).count() as u32;
        waits * 2 + self.gathers.len() as u32 * per_gather + 1
    }
}

/// How a submitted job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// The hardware executed the job up to its final increment.
    Completed,
    /// The job was force-completed by timeout recovery; its fences are
    /// reached but its work never ran.
    Aborted,
}

/// Completion state shared between the channel and the submitter.
#[derive(Default)]
pub struct JobCompletion {
    outcome: Mutex<Option<JobOutcome>>,
    cond: Condvar,
}

impl JobCompletion {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record the outcome. The first call wins.
    pub fn complete(&self, outcome: JobOutcome) {
        let mut slot = self.outcome.lock();
        if slot.is_none() {
            *slot = Some(outcome);
            self.cond.notify_all();
        }
    }

    pub fn outcome(&self) -> Option<JobOutcome> {
        *self.outcome.lock()
    }

    pub fn is_done(&self) -> bool {
        self.outcome().is_some()
    }

    /// Wait for the outcome. `None` waits forever.
    pub fn wait(&self, timeout: Option<Duration>) -> Option<JobOutcome> {
        let mut slot = self.outcome.lock();
        let deadline = timeout.map(|t| Instant::now() + t);
        while slot.is_none() {
            match deadline {
                Some(d) => {
                    if self.cond.wait_until(&mut slot, d).timed_out() {
                        break;
                    }
                }
                None => self.cond.wait(&mut slot),
            }
        }
        *slot
    }
}

/// Returned by a successful submit.
#[derive(Clone)]
pub struct JobHandle {
    pub channel: ChannelId,
    /// Reserved fence per syncpoint, primary first.
    pub fences: Vec<Fence>,
    completion: Arc<JobCompletion>,
}

impl JobHandle {
    pub(crate) fn new(channel: ChannelId, fences: Vec<Fence>, completion: Arc<JobCompletion>) -> Self {
        Self { channel, fences, completion }
    }

    /// Fence of the primary syncpoint.
    pub fn fence(&self) -> Fence {
        self.fences[0]
    }

    pub fn wait(&self, timeout: Option<Duration>) -> Option<JobOutcome> {
        self.completion.wait(timeout)
    }

    pub fn outcome(&self) -> Option<JobOutcome> {
        self.completion.outcome()
    }

    pub fn is_done(&self) -> bool {
        self.completion.is_done()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend;
    use crate::sim::SimHost1x;
    use nvhost_common::settings::ChipGeneration;
    use std::thread;

    fn env() -> (Arc<DmaPool>, SyncpointRegistry, Arc<SimHost1x>) {
        let pool = Arc::new(DmaPool::new());
        let sim = SimHost1x::new(ChipGeneration::Host1x01, pool.clone());
        let sp = SyncpointRegistry::new(backend::create(ChipGeneration::Host1x01, sim.clone()));
        (pool, sp, sim)
    }

    #[test]
    fn test_pin_resolves_and_relocates() {
        let (pool, sp, _sim) = env();
        let cmd = pool.alloc(16).unwrap();
        let target = pool.alloc(1024).unwrap();
        let mut job = Job::new(1);
        job.add_syncpt(1, 1);
        job.add_gather(cmd, 8, 4, 0x5d);
        job.add_reloc(cmd, 4, target, 0x100, 0);

        job.pin(&pool, &sp).unwrap();
        let target_iova = pool.get(target).unwrap().iova;
        assert_eq!(pool.read(cmd, 4, 1).unwrap(), vec![target_iova + 0x100]);
        assert_eq!(job.gathers()[0].iova, Some(pool.get(cmd).unwrap().iova + 8));
        assert!(pool.get(cmd).unwrap().is_pinned());

        job.unpin(&pool);
        job.unpin(&pool);
        assert!(!pool.get(cmd).unwrap().is_pinned());
        assert!(!pool.get(target).unwrap().is_pinned());
    }

    #[test]
    fn test_pin_failure_releases_everything() {
        let (pool, sp, _sim) = env();
        let cmd = pool.alloc(4).unwrap();
        let mut job = Job::new(1);
        job.add_syncpt(1, 1);
        job.add_gather(cmd, 0, 4, 0x5d);
        job.add_gather(999, 0, 4, 0x5d);
        assert_eq!(job.pin(&pool, &sp), Err(Host1xError::InvalidHandle(999)));
        assert!(!pool.get(cmd).unwrap().is_pinned());
        assert!(!job.is_pinned());
    }

    #[test]
    fn test_pin_rejects_out_of_range_gather() {
        let (pool, sp, _sim) = env();
        let cmd = pool.alloc(4).unwrap();
        let mut job = Job::new(1);
        job.add_syncpt(1, 1);
        job.add_gather(cmd, 8, 4, 0x5d);
        assert!(matches!(job.pin(&pool, &sp), Err(Host1xError::InvalidRange { .. })));
        assert!(!pool.get(cmd).unwrap().is_pinned());
    }

    #[test]
    fn test_expired_wait_check_is_patched() {
        let (pool, sp, _sim) = env();
        let cmd = pool.alloc(8).unwrap();
        pool.write(cmd, 0, &[0xdead, 7, 0xbeef, 5]).unwrap();
        pool.write(cmd, 16, &[0xdead, 9, 0xbeef, 6]).unwrap();
        sp.incr_max(6, 1).unwrap();

        let mut job = Job::new(1);
        job.add_syncpt(1, 1);
        job.add_gather(cmd, 0, 8, 0x5d);
        // Syncpt 5 is at 0 with nothing outstanding, so thresh 7 counts as passed.
        job.add_wait_check(cmd, 0, 5, 7);
        // Syncpt 6 has an increment outstanding; thresh 1 must stay.
        job.add_wait_check(cmd, 16, 6, 1);
        job.pin(&pool, &sp).unwrap();

        assert_eq!(pool.read(cmd, 0, 4).unwrap(), vec![0xdead, 0, 0xbeef, 0]);
        assert_eq!(pool.read(cmd, 16, 4).unwrap(), vec![0xdead, 9, 0xbeef, 6]);
    }

    #[test]
    fn test_pin_rejects_wide_reloc_shift() {
        let (pool, sp, _sim) = env();
        let cmd = pool.alloc(4).unwrap();
        let target = pool.alloc(4).unwrap();
        pool.write(cmd, 0, &[0x1111, 0x2222]).unwrap();
        let mut job = Job::new(1);
        job.add_syncpt(1, 1);
        job.add_gather(cmd, 0, 4, 0x5d);
        job.add_reloc(cmd, 0, target, 0, 0);
        job.add_reloc(cmd, 4, target, 0, 32);
        assert!(matches!(job.pin(&pool, &sp), Err(Host1xError::InvalidArgument(_))));
        // Nothing was patched, not even the valid relocation.
        assert_eq!(pool.read(cmd, 0, 2).unwrap(), vec![0x1111, 0x2222]);
        assert!(!pool.get(cmd).unwrap().is_pinned());
    }

    #[test]
    fn test_pin_rejects_wrapping_wait_check_offset() {
        let (pool, sp, _sim) = env();
        let cmd = pool.alloc(4).unwrap();
        pool.write(cmd, 0, &[0xdead, 7, 0xbeef, 5]).unwrap();
        let mut job = Job::new(1);
        job.add_syncpt(1, 1);
        job.add_gather(cmd, 0, 4, 0x5d);
        job.add_wait_check(cmd, 0, 5, 7);
        job.add_wait_check(cmd, 0xFFFF_FFFC, 5, 7);
        assert!(matches!(job.pin(&pool, &sp), Err(Host1xError::InvalidRange { .. })));
        assert_eq!(pool.read(cmd, 0, 4).unwrap(), vec![0xdead, 7, 0xbeef, 5]);

        // In range of u32 but past the end of the buffer.
        let mut job = Job::new(1);
        job.add_syncpt(1, 1);
        job.add_gather(cmd, 0, 4, 0x5d);
        job.add_wait_check(cmd, 0, 5, 7);
        job.add_wait_check(cmd, 8, 5, 7);
        assert!(matches!(job.pin(&pool, &sp), Err(Host1xError::InvalidRange { .. })));
        assert_eq!(pool.read(cmd, 0, 4).unwrap(), vec![0xdead, 7, 0xbeef, 5]);
    }

    #[test]
    fn test_pin_rejects_oversized_increments() {
        let (pool, sp, _sim) = env();
        let cmd = pool.alloc(4).unwrap();
        let mut job = Job::new(1);
        job.add_syncpt(1, u32::MAX);
        job.add_gather(cmd, 0, 4, 0x5d);
        assert!(matches!(job.pin(&pool, &sp), Err(Host1xError::InvalidArgument(_))));

        // Spread over two entries of the same syncpoint.
        let mut job = Job::new(1);
        job.add_syncpt(1, 1 << 30);
        job.add_syncpt(1, 1 << 30);
        job.add_gather(cmd, 0, 4, 0x5d);
        assert!(matches!(job.pin(&pool, &sp), Err(Host1xError::InvalidArgument(_))));

        let mut job = Job::new(1);
        job.add_syncpt(1, (1 << 31) - 2);
        job.add_gather(cmd, 0, 4, 0x5d);
        job.pin(&pool, &sp).unwrap();
        assert_eq!(sp.read_max(1).unwrap(), 0);
    }

    #[test]
    fn test_slots_needed() {
        let (pool, _sp, _sim) = env();
        let cmd = pool.alloc(4).unwrap();
        let mut job = Job::new(1);
        job.add_syncpt(1, 2);
        job.add_gather(cmd, 0, 4, 0x5d);
        job.add_gather(cmd, 0, 4, 0x5d).pre_fence = Some(Fence::new(3, 1));

        let engine = EngineDesc::new("vic", 0x5d);
        assert_eq!(job.slots_needed(&engine), 2 + 2 * 2 + 1);
        assert_eq!(job.slots_needed(&engine.with_mlock(3)), 2 + 2 * 4 + 1);
    }

    #[test]
    fn test_completion_first_outcome_wins() {
        let c = JobCompletion::new();
        assert_eq!(c.wait(Some(Duration::from_millis(10))), None);
        let c2 = c.clone();
        let t = thread::spawn(move || c2.wait(None));
        c.complete(JobOutcome::Aborted);
        c.complete(JobOutcome::Completed);
        assert_eq!(t.join().unwrap(), Some(JobOutcome::Aborted));
        assert!(c.is_done());
    }
}
