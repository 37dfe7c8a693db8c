// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! `/dev/nvhost-<engine>`: job submission to an engine's channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use nvhost_common::{ClientId, Fence, Host1xError, SyncptId};
use nvhost_core::channel::Channel;
use nvhost_core::{Host1xDevice, Job, JobHandle, JobOutcome};

use crate::ctrl::{wait_timeout, NO_TIMEOUT};
use crate::node::{put_u32, Args, IoctlError, IoctlResult, NvhostNode};

pub const GET_SYNCPOINT: u32 = 1;
pub const SET_TIMEOUT: u32 = 2;
pub const SUBMIT: u32 = 3;
pub const WAIT_JOB: u32 = 4;
pub const GET_TIMEDOUT: u32 = 5;

pub const OUTCOME_COMPLETED: u32 = 0;
pub const OUTCOME_ABORTED: u32 = 1;

const INCR_WORDS: usize = 2;
const CMDBUF_WORDS: usize = 6;
const RELOC_WORDS: usize = 5;
const WAITCHK_WORDS: usize = 4;

pub struct ChannelNode {
    name: String,
    dev: Arc<Host1xDevice>,
    channel: Arc<Channel>,
    client: ClientId,
    syncpt: Option<SyncptId>,
    /// Watchdog for this file's jobs; `None` uses the channel default.
    timeout: Option<Duration>,
    jobs: HashMap<u32, JobHandle>,
    next_job: u32,
}

impl ChannelNode {
    pub fn new(name: String, dev: Arc<Host1xDevice>, channel: Arc<Channel>, client: ClientId) -> Self {
        Self {
            name,
            dev,
            channel,
            client,
            syncpt: None,
            timeout: None,
            jobs: HashMap::new(),
            next_job: 1,
        }
    }

    fn syncpt(&mut self) -> Result<SyncptId, IoctlError> {
        if let Some(id) = self.syncpt {
            return Ok(id);
        }
        let engine = &self.channel.engine().name;
        let id = self.dev.syncpt().alloc_host_managed(&format!("{}-{}", engine, self.client))?;
        self.syncpt = Some(id);
        Ok(id)
    }

    /// Decode a submit block.
    ///
    /// ```text
    /// header   num_incrs num_cmdbufs num_relocs num_waitchks timeout_ms
    /// incr     id incrs                       (id 0: this file's syncpoint)
    /// cmdbuf   mem offset words class pre_fence_id pre_fence_value
    /// reloc    cmdbuf cmdbuf_offset target target_offset shift
    /// waitchk  mem offset id thresh
    /// ```
    fn decode_submit(&mut self, args: &mut Args<'_>) -> Result<Job, IoctlError> {
        let num_incrs = args.u32()? as usize;
        let num_cmdbufs = args.u32()? as usize;
        let num_relocs = args.u32()? as usize;
        let num_waitchks = args.u32()? as usize;
        let timeout_ms = args.u32()?;
        let needed = num_incrs * INCR_WORDS
            + num_cmdbufs * CMDBUF_WORDS
            + num_relocs * RELOC_WORDS
            + num_waitchks * WAITCHK_WORDS;
        if needed > args.remaining() / 4 {
            return Err(IoctlError::Truncated);
        }
        if num_incrs == 0 {
            return Err(IoctlError::Invalid("submit without syncpoint increments"));
        }

        let mut job = Job::new(self.client);
        for _ in 0..num_incrs {
            let id = match args.u32()? {
                0 => self.syncpt()?,
                id => id,
            };
            job.add_syncpt(id, args.u32()?);
        }
        for _ in 0..num_cmdbufs {
            let mem = args.u32()?;
            let offset = args.u32()?;
            let words = args.u32()?;
            let class_id = args.u32()?;
            let fence_id = args.u32()?;
            let fence_value = args.u32()?;
            let gather = job.add_gather(mem, offset, words, class_id);
            if fence_id != 0 {
                gather.pre_fence = Some(Fence::new(fence_id, fence_value));
            }
        }
        for _ in 0..num_relocs {
            let w = args.words(RELOC_WORDS)?;
            job.add_reloc(w[0], w[1], w[2], w[3], w[4]);
        }
        for _ in 0..num_waitchks {
            let w = args.words(WAITCHK_WORDS)?;
            job.add_wait_check(w[0], w[1], w[2], w[3]);
        }
        job.set_timeout(match timeout_ms {
            NO_TIMEOUT => self.timeout,
            ms => Some(Duration::from_millis(ms as u64)),
        });
        Ok(job)
    }
}

impl NvhostNode for ChannelNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn ioctl(&mut self, nr: u32, input: &[u8], output: &mut Vec<u8>) -> IoctlResult {
        let mut args = Args::new(input);
        match nr {
            // -> {id}
            GET_SYNCPOINT => {
                let id = self.syncpt()?;
                put_u32(output, id);
            }

            // {timeout_ms}, 0 disables the watchdog
            SET_TIMEOUT => {
                let ms = args.u32()?;
                self.timeout = Some(Duration::from_millis(ms as u64));
                log::debug!("{}: timeout set to {} ms", self.name, ms);
            }

            // submit block -> {job_id, (id, value) per increment}
            SUBMIT => {
                let job = self.decode_submit(&mut args)?;
                let handle = self.channel.submit(job)?;
                let job_id = self.next_job;
                self.next_job = self.next_job.wrapping_add(1).max(1);
                put_u32(output, job_id);
                for f in &handle.fences {
                    put_u32(output, f.id);
                    put_u32(output, f.value);
                }
                self.jobs.insert(job_id, handle);
            }

            // {job_id, timeout_ms} -> {outcome}
            WAIT_JOB => {
                let job_id = args.u32()?;
                let timeout = wait_timeout(args.u32()?);
                let handle = self.jobs.get(&job_id).ok_or(IoctlError::Invalid("unknown job"))?;
                let outcome = handle.wait(timeout).ok_or(Host1xError::Timeout)?;
                self.jobs.remove(&job_id);
                put_u32(
                    output,
                    match outcome {
                        JobOutcome::Completed => OUTCOME_COMPLETED,
                        JobOutcome::Aborted => OUTCOME_ABORTED,
                    },
                );
            }

            // -> {1 if one of this file's jobs timed out, else 0}
            GET_TIMEDOUT => {
                put_u32(output, u32::from(self.channel.is_client_timed_out(self.client)));
            }

            _ => {
                log::warn!("{}: unknown ioctl {}", self.name, nr);
                return Err(IoctlError::UnknownIoctl(nr));
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        self.jobs.clear();
        self.channel.reset_client(self.client);
        if let Err(e) = self.dev.close_channel(self.channel.id()) {
            log::warn!("{}: closing channel {}: {}", self.name, self.channel.id(), e);
        }
        if let Some(id) = self.syncpt.take() {
            let _ = self.dev.syncpt().put_ref(id);
        }
    }
}
