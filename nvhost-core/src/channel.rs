// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Channels and the channel pool.
//!
//! A [`Channel`] binds one hardware channel slot to an engine and pushes jobs
//! into its CDMA. Hardware slots are fewer than clients, so the
//! [`ChannelPool`] maps engines onto slots on demand and shares a mapped slot
//! between every client of the same engine.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use nvhost_common::settings::Host1xSettings;
use nvhost_common::{ChannelId, ClientId, Fence, Host1xError, Host1xResult};

use crate::cdma::{Cdma, CdmaState, CdmaStats, CdmaSubmit, SyncEntry};
use crate::intr::Intr;
use crate::job::{Job, JobCompletion, JobHandle};
use crate::memory::DmaPool;
use crate::opcodes;
use crate::syncpoint::SyncpointRegistry;

/// How the engine behind a channel is shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourcePolicy {
    /// One engine instance shared by every channel: gathers are bracketed
    /// with the engine's module mutex.
    PerDevice,
    /// Each channel owns its engine instance.
    PerChannelInstance,
}

/// Static description of an engine served by a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineDesc {
    pub name: String,
    pub class_id: u32,
    pub mlock: Option<u32>,
    pub needs_module_reset: bool,
    pub resource_policy: ResourcePolicy,
}

impl EngineDesc {
    pub fn new(name: impl Into<String>, class_id: u32) -> Self {
        Self {
            name: name.into(),
            class_id,
            mlock: None,
            needs_module_reset: false,
            resource_policy: ResourcePolicy::PerChannelInstance,
        }
    }

    /// Share the engine between channels through module mutex `idx`.
    pub fn with_mlock(mut self, idx: u32) -> Self {
        self.mlock = Some(idx);
        self.resource_policy = ResourcePolicy::PerDevice;
        self
    }

    pub fn with_module_reset(mut self) -> Self {
        self.needs_module_reset = true;
        self
    }

    /// Module mutex taken around every gather, if any.
    pub fn gather_mlock(&self) -> Option<u32> {
        match self.resource_policy {
            ResourcePolicy::PerDevice => self.mlock,
            ResourcePolicy::PerChannelInstance => None,
        }
    }
}

pub struct Channel {
    id: ChannelId,
    cdma: Cdma,
    intr: Arc<Intr>,
    pool: Arc<DmaPool>,
    default_timeout: Option<Duration>,
}

impl Channel {
    pub fn new(
        id: ChannelId,
        engine: EngineDesc,
        intr: Arc<Intr>,
        pool: Arc<DmaPool>,
        settings: &Host1xSettings,
    ) -> Host1xResult<Self> {
        let cdma = Cdma::new(id, engine, intr.clone(), pool.clone(), settings)?;
        Ok(Self { id, cdma, intr, pool, default_timeout: settings.cdma_timeout() })
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn engine(&self) -> &EngineDesc {
        self.cdma.engine()
    }

    pub fn cdma(&self) -> &Cdma {
        &self.cdma
    }

    pub fn state(&self) -> CdmaState {
        self.cdma.state()
    }

    pub fn stats(&self) -> CdmaStats {
        self.cdma.stats()
    }

    /// Jobs submitted and not yet retired.
    pub fn busy(&self) -> usize {
        self.cdma.queue_len()
    }

    /// True if a job of `client` timed out on this channel.
    pub fn is_client_timed_out(&self, client: ClientId) -> bool {
        self.cdma.is_client_timed_out(client)
    }

    /// Clear the timed out mark of `client`.
    pub fn reset_client(&self, client: ClientId) -> bool {
        let cleared = self.cdma.reset_client(client);
        if cleared {
            log::info!("ch{}: client {} reset after timeout", self.id, client);
        }
        cleared
    }

    pub fn flush(&self, timeout: Option<Duration>) -> bool {
        self.cdma.flush(timeout)
    }

    pub fn stop(&self) {
        self.cdma.stop();
    }

    /// Submit a job.
    ///
    /// Pinning and the completion waiters are set up before any hardware
    /// state is touched; a failure there leaves the channel as it was.
    pub fn submit(&self, mut job: Job) -> Host1xResult<JobHandle> {
        let client = job.client;
        if self.is_client_timed_out(client) {
            return Err(Host1xError::ClientTimedOut(client));
        }
        let syncpt = self.intr.syncpt().clone();
        job.pin(&self.pool, &syncpt)?;

        let mut waiters = Vec::with_capacity(job.syncpts().len());
        for _ in job.syncpts() {
            match self.intr.alloc_waiter() {
                Ok(w) => waiters.push(w),
                Err(e) => {
                    job.unpin(&self.pool);
                    return Err(e);
                }
            }
        }

        let slots = job.slots_needed(self.engine());
        let mut submit = match self.cdma.begin(slots) {
            Ok(s) => s,
            Err(e) => {
                job.unpin(&self.pool);
                return Err(e);
            }
        };
        let fences = match self.push_job(&mut submit, &job, &syncpt) {
            Ok(f) => f,
            Err(e) => {
                drop(submit);
                job.unpin(&self.pool);
                return Err(e);
            }
        };

        for f in fences.iter().filter(|f| syncpt.is_assigned(f.id)) {
            if let Err(e) = syncpt.mark_used(self.id, f.id) {
                log::warn!("ch{}: marking syncpt {} used: {}", self.id, f.id, e);
            }
        }
        let timeout = match job.timeout() {
            Some(t) if t.is_zero() => None,
            Some(t) => Some(t),
            None => self.default_timeout,
        };
        let completion = JobCompletion::new();
        let entry = SyncEntry::new(job, fences.clone(), timeout, completion.clone());
        submit.end(entry, waiters)?;

        log::trace!("ch{}: client {} submitted, fence {}", self.id, client, fences[0]);
        Ok(JobHandle::new(self.id, fences, completion))
    }

    /// Push the job's slots and reserve its fences. Runs under the submit
    /// lock, so fence order matches push order.
    fn push_job(&self, submit: &mut CdmaSubmit<'_>, job: &Job, syncpt: &SyncpointRegistry) -> Host1xResult<Vec<Fence>> {
        let engine = self.engine();
        let primary = job.primary_syncpt().ok_or(Host1xError::InvalidArgument("job has no syncpoint"))?;

        for fence in job.gathers().iter().filter_map(|g| g.pre_fence) {
            if syncpt.is_expired(fence.id, fence.value)? {
                continue;
            }
            for slot in opcodes::wait_slots(fence.id, fence.value) {
                submit.push(slot)?;
            }
        }

        let mlock = engine.gather_mlock();
        for g in job.gathers() {
            let iova = g.iova.ok_or(Host1xError::InvalidArgument("job is not pinned"))?;
            if let Some(m) = mlock {
                submit.push(opcodes::acquire_mlock_slot(m))?;
            }
            submit.push(opcodes::class_slot(g.class_id))?;
            submit.push(opcodes::gather_slot(g.words, iova))?;
            if let Some(m) = mlock {
                submit.push(opcodes::release_mlock_slot(m))?;
            }
        }
        submit.push(opcodes::final_incr_slot(engine.class_id, primary))?;

        job.syncpts()
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let incrs = s.incrs + u32::from(i == 0);
                Ok(Fence::new(s.id, syncpt.incr_max(s.id, incrs)?))
            })
            .collect()
    }
}

struct PoolEntry {
    channel: Arc<Channel>,
    refs: u32,
}

/// Hardware channel slots, mapped to engines on demand.
pub struct ChannelPool {
    intr: Arc<Intr>,
    pool: Arc<DmaPool>,
    settings: Host1xSettings,
    slots: Mutex<Vec<Option<PoolEntry>>>,
}

impl ChannelPool {
    pub fn new(nb_channels: u32, intr: Arc<Intr>, pool: Arc<DmaPool>, settings: Host1xSettings) -> Self {
        Self {
            intr,
            pool,
            settings,
            slots: Mutex::new((0..nb_channels).map(|_| None).collect()),
        }
    }

    /// Get a channel serving `engine` for `client`.
    pub fn map(&self, client: ClientId, engine: &EngineDesc) -> Host1xResult<Arc<Channel>> {
        let mut slots = self.slots.lock();
        if let Some(entry) = slots.iter_mut().flatten().find(|e| e.channel.engine().name == engine.name) {
            entry.refs += 1;
            log::debug!("ch{}: shared with client {} ({} refs)", entry.channel.id(), client, entry.refs);
            return Ok(entry.channel.clone());
        }

        let Some(idx) = slots.iter().position(|s| s.is_none()) else {
            log::warn!("channel: no free channel for {} (client {})", engine.name, client);
            return Err(Host1xError::NoChannel);
        };
        let channel = Arc::new(Channel::new(
            idx as ChannelId,
            engine.clone(),
            self.intr.clone(),
            self.pool.clone(),
            &self.settings,
        )?);
        slots[idx] = Some(PoolEntry { channel: channel.clone(), refs: 1 });
        log::info!("ch{}: mapped to {} for client {}", idx, engine.name, client);
        Ok(channel)
    }

    /// Drop one reference. The last one drains and stops the channel and
    /// returns its slot.
    pub fn release(&self, ch: ChannelId) -> Host1xResult<()> {
        let channel = {
            let mut slots = self.slots.lock();
            let slot = slots.get_mut(ch as usize).ok_or(Host1xError::NoChannel)?;
            let entry = slot.as_mut().ok_or(Host1xError::NoChannel)?;
            entry.refs -= 1;
            if entry.refs > 0 {
                return Ok(());
            }
            match slot.take() {
                Some(e) => e.channel,
                None => return Err(Host1xError::NoChannel),
            }
        };
        self.retire(&channel);
        log::info!("ch{}: released", ch);
        Ok(())
    }

    fn retire(&self, channel: &Channel) {
        channel.stop();
        let syncpt = self.intr.syncpt();
        for id in 0..syncpt.nb_pts() {
            if syncpt.used_by(id) == Some(channel.id()) {
                let _ = syncpt.mark_unused(id);
            }
        }
    }

    pub fn get(&self, ch: ChannelId) -> Option<Arc<Channel>> {
        self.slots.lock().get(ch as usize)?.as_ref().map(|e| e.channel.clone())
    }

    pub fn active(&self) -> Vec<Arc<Channel>> {
        self.slots.lock().iter().flatten().map(|e| e.channel.clone()).collect()
    }

    pub fn nb_channels(&self) -> u32 {
        self.slots.lock().len() as u32
    }

    /// Stop every mapped channel and empty the pool.
    pub fn shutdown(&self) {
        let channels: Vec<_> = self.slots.lock().iter_mut().filter_map(Option::take).collect();
        for e in channels {
            self.retire(&e.channel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend;
    use crate::job::JobOutcome;
    use crate::sim::SimHost1x;
    use nvhost_common::settings::ChipGeneration;
    use std::collections::HashSet;
    use std::thread;

    const VIC: u32 = 0x5d;

    struct Env {
        sim: Arc<SimHost1x>,
        pool: Arc<DmaPool>,
        intr: Arc<Intr>,
    }

    fn env() -> Env {
        let pool = Arc::new(DmaPool::new());
        let sim = SimHost1x::new(ChipGeneration::Host1x01, pool.clone());
        let sp = Arc::new(SyncpointRegistry::new(backend::create(ChipGeneration::Host1x01, sim.clone())));
        let intr = Intr::new(sp, &Host1xSettings::default());
        intr.start_irq(sim.clone());
        Env { sim, pool, intr }
    }

    fn settings() -> Host1xSettings {
        Host1xSettings { push_buffer_slots: 64, cdma_timeout_ms: 200, ..Default::default() }
    }

    /// A gather incrementing `id` `incrs` times from class VIC.
    fn incr_gather(pool: &DmaPool, id: u32, incrs: u32) -> (u32, u32) {
        let mut words = vec![opcodes::setclass(VIC, 0, 0), opcodes::nonincr(0, incrs)];
        words.extend(std::iter::repeat(opcodes::incr_syncpt(opcodes::COND_IMMEDIATE, id)).take(incrs as usize));
        let h = pool.alloc(words.len() as u32).unwrap();
        pool.write(h, 0, &words).unwrap();
        (h, words.len() as u32)
    }

    fn job(pool: &DmaPool, client: u32, id: u32, incrs: u32) -> Job {
        let (h, words) = incr_gather(pool, id, incrs);
        let mut job = Job::new(client);
        job.add_syncpt(id, incrs);
        job.add_gather(h, 0, words, VIC);
        job
    }

    #[test]
    fn test_submit_completes_and_unpins() {
        let env = env();
        let ch = Channel::new(0, EngineDesc::new("vic", VIC), env.intr.clone(), env.pool.clone(), &settings())
            .unwrap();
        let id = env.intr.syncpt().alloc_host_managed("vic").unwrap();
        let j = job(&env.pool, 1, id, 2);
        let cmd = j.gathers()[0].mem;

        let handle = ch.submit(j).unwrap();
        assert_eq!(handle.fence(), Fence::new(id, 3));
        assert_eq!(handle.wait(Some(Duration::from_secs(5))), Some(JobOutcome::Completed));
        assert!(ch.flush(Some(Duration::from_secs(5))));
        assert_eq!(env.sim.syncpt_value(id), 3);
        assert!(!env.pool.get(cmd).unwrap().is_pinned());
        assert_eq!(ch.busy(), 0);
        assert_eq!(env.intr.syncpt().used_by(id), Some(0));
    }

    #[test]
    fn test_pre_fence_orders_jobs() {
        let env = env();
        let ch = Channel::new(1, EngineDesc::new("vic", VIC), env.intr.clone(), env.pool.clone(), &settings())
            .unwrap();
        let sp = env.intr.syncpt();
        let gate = sp.alloc_client_managed("gate").unwrap();
        let id = sp.alloc_host_managed("work").unwrap();

        let mut j = job(&env.pool, 1, id, 1);
        let g = j.gathers()[0].clone();
        let mut gated = Job::new(1);
        gated.add_syncpt(id, 1);
        gated.add_gather(g.mem, g.offset, g.words, g.class_id).pre_fence = Some(Fence::new(gate, 1));
        j.set_timeout(Some(Duration::ZERO));
        gated.set_timeout(Some(Duration::ZERO));

        let h = ch.submit(gated).unwrap();
        thread::sleep(Duration::from_millis(30));
        assert!(!h.is_done());
        assert_eq!(env.sim.syncpt_value(id), 0);

        sp.cpu_incr(gate).unwrap();
        assert_eq!(h.wait(Some(Duration::from_secs(5))), Some(JobOutcome::Completed));
        let h2 = ch.submit(j).unwrap();
        assert_eq!(h2.wait(Some(Duration::from_secs(5))), Some(JobOutcome::Completed));
        assert_eq!(env.sim.syncpt_value(id), 4);
    }

    #[test]
    fn test_pin_failure_touches_nothing() {
        let env = env();
        let ch = Channel::new(2, EngineDesc::new("vic", VIC), env.intr.clone(), env.pool.clone(), &settings())
            .unwrap();
        let mut j = Job::new(1);
        j.add_syncpt(5, 1);
        j.add_gather(4242, 0, 4, VIC);
        assert_eq!(ch.submit(j).err(), Some(Host1xError::InvalidHandle(4242)));
        assert_eq!(env.intr.syncpt().read_max(5).unwrap(), 0);
        assert_eq!(ch.state(), CdmaState::Stopped);
        assert_eq!(env.intr.waiters_in_use(), 0);
    }

    #[test]
    fn test_waiter_exhaustion_is_reported() {
        let pool = Arc::new(DmaPool::new());
        let sim = SimHost1x::new(ChipGeneration::Host1x01, pool.clone());
        let sp = Arc::new(SyncpointRegistry::new(backend::create(ChipGeneration::Host1x01, sim.clone())));
        let intr = Intr::new(sp, &Host1xSettings { max_waiters: 1, ..Default::default() });
        intr.start_irq(sim.clone());
        let ch = Channel::new(0, EngineDesc::new("vic", VIC), intr.clone(), pool.clone(), &settings()).unwrap();

        let _held = intr.alloc_waiter().unwrap();
        let j = job(&pool, 1, 6, 1);
        let cmd = j.gathers()[0].mem;
        assert_eq!(ch.submit(j).err(), Some(Host1xError::WaiterLimit));
        assert!(!pool.get(cmd).unwrap().is_pinned());
        assert_eq!(intr.syncpt().read_max(6).unwrap(), 0);
    }

    #[test]
    fn test_timed_out_client_is_refused_until_reset() {
        let env = env();
        let ch = Channel::new(3, EngineDesc::new("vic", VIC), env.intr.clone(), env.pool.clone(), &settings())
            .unwrap();
        env.sim.set_engine_stalled(VIC, true);
        let h = ch.submit(job(&env.pool, 9, 7, 1)).unwrap();
        assert_eq!(h.wait(Some(Duration::from_secs(5))), Some(JobOutcome::Aborted));
        assert!(env.intr.syncpt().is_expired(7, h.fence().value).unwrap());

        assert_eq!(ch.submit(job(&env.pool, 9, 7, 1)).err(), Some(Host1xError::ClientTimedOut(9)));
        env.sim.set_engine_stalled(VIC, false);
        let other = ch.submit(job(&env.pool, 10, 7, 1)).unwrap();
        assert_eq!(other.wait(Some(Duration::from_secs(5))), Some(JobOutcome::Completed));

        assert!(ch.reset_client(9));
        let again = ch.submit(job(&env.pool, 9, 7, 1)).unwrap();
        assert_eq!(again.wait(Some(Duration::from_secs(5))), Some(JobOutcome::Completed));
    }

    #[test]
    fn test_mlock_brackets_gathers_on_shared_engine() {
        let env = env();
        let engine = EngineDesc::new("vic", VIC).with_mlock(4);
        let a = Channel::new(4, engine.clone(), env.intr.clone(), env.pool.clone(), &settings()).unwrap();
        let b = Channel::new(5, engine, env.intr.clone(), env.pool.clone(), &settings()).unwrap();
        let ha = a.submit(job(&env.pool, 1, 11, 1)).unwrap();
        let hb = b.submit(job(&env.pool, 2, 12, 1)).unwrap();
        assert_eq!(ha.wait(Some(Duration::from_secs(5))), Some(JobOutcome::Completed));
        assert_eq!(hb.wait(Some(Duration::from_secs(5))), Some(JobOutcome::Completed));
        assert_eq!(env.intr.syncpt().backend().mlock_owner(4), crate::backend::MlockState::Free);
    }

    #[test]
    fn test_concurrent_submit_distinct_fences() {
        let env = env();
        let sp = env.intr.syncpt().clone();
        let shared = sp.alloc_host_managed("shared").unwrap();
        let ch = Arc::new(
            Channel::new(6, EngineDesc::new("vic", VIC), env.intr.clone(), env.pool.clone(), &settings()).unwrap(),
        );

        let threads: Vec<_> = (0..4)
            .map(|client| {
                let ch = ch.clone();
                let pool = env.pool.clone();
                thread::spawn(move || {
                    (0..8)
                        .map(|_| {
                            let h = ch.submit(job(&pool, client, shared, 1)).unwrap();
                            assert_eq!(h.wait(Some(Duration::from_secs(5))), Some(JobOutcome::Completed));
                            h.fence().value
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all = HashSet::new();
        for t in threads {
            let fences = t.join().unwrap();
            assert!(fences.windows(2).all(|w| w[0] < w[1]));
            for f in fences {
                assert!(all.insert(f));
            }
        }
        assert_eq!(all.len(), 32);
        assert_eq!(sp.read_max(shared).unwrap(), 64);
        assert_eq!(env.sim.syncpt_value(shared), 64);
        assert_eq!(ch.stats().completed, 32);
    }

    #[test]
    fn test_independent_channels_share_syncpoint() {
        let env = env();
        let sp = env.intr.syncpt().clone();
        let shared = sp.alloc_host_managed("shared").unwrap();
        let channels: Vec<Arc<Channel>> = [2, 3, 7]
            .into_iter()
            .map(|id| {
                Arc::new(
                    Channel::new(id, EngineDesc::new("vic", VIC), env.intr.clone(), env.pool.clone(), &settings())
                        .unwrap(),
                )
            })
            .collect();

        let threads: Vec<_> = channels
            .iter()
            .enumerate()
            .map(|(client, ch)| {
                let ch = ch.clone();
                let pool = env.pool.clone();
                thread::spawn(move || {
                    (0..8)
                        .map(|_| ch.submit(job(&pool, client as u32, shared, 1)).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all = HashSet::new();
        for t in threads {
            let handles = t.join().unwrap();
            assert!(handles.windows(2).all(|w| w[0].fence().value < w[1].fence().value));
            for h in handles {
                assert_eq!(h.wait(Some(Duration::from_secs(5))), Some(JobOutcome::Completed));
                assert!(all.insert(h.fence().value));
            }
        }
        assert_eq!(all.len(), 24);
        assert_eq!(sp.read_max(shared).unwrap(), 48);
        assert_eq!(env.sim.syncpt_value(shared), 48);
        for ch in &channels {
            assert!(ch.flush(Some(Duration::from_secs(5))));
            assert_eq!(ch.stats().completed, 8);
        }
    }

    #[test]
    fn test_pool_maps_shares_and_releases() {
        let env = env();
        let pool = ChannelPool::new(2, env.intr.clone(), env.pool.clone(), settings());
        let vic = EngineDesc::new("vic", VIC);
        let a = pool.map(1, &vic).unwrap();
        let b = pool.map(2, &vic).unwrap();
        assert_eq!(a.id(), b.id());
        let nvdec = pool.map(3, &EngineDesc::new("nvdec", 0xf0)).unwrap();
        assert_ne!(nvdec.id(), a.id());
        assert_eq!(pool.map(4, &EngineDesc::new("nvenc", 0x21)).err(), Some(Host1xError::NoChannel));

        let id = env.intr.syncpt().alloc_host_managed("vic").unwrap();
        a.submit(job(&env.pool, 1, id, 1)).unwrap();
        pool.release(a.id()).unwrap();
        assert!(pool.get(a.id()).is_some());
        pool.release(a.id()).unwrap();
        assert!(pool.get(a.id()).is_none());
        assert_eq!(a.state(), CdmaState::Stopped);
        assert_eq!(env.intr.syncpt().used_by(id), None);
        assert!(pool.map(4, &EngineDesc::new("nvenc", 0x21)).is_ok());
    }
}
