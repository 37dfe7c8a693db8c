// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Syncpoint registry.
//!
//! Every hardware syncpoint is a 32-bit counter incremented by the command
//! stream (or by the CPU). The registry keeps two cached values per id:
//!
//! - `min`: the last value confirmed by hardware. Only moves forward.
//! - `max`: the value the counter will reach once every reserved increment
//!   has executed. Submitters reserve increments with [`incr_max`].
//!
//! All comparisons are wrap aware. Id 0 is reserved for the host and is never
//! handed out, so a wait on `(0, 0)` is always satisfied.
//!
//! [`incr_max`]: SyncpointRegistry::incr_max

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use nvhost_common::{ChannelId, Host1xError, Host1xResult, SyncptId, HOST_RESERVED_SYNCPT};

use crate::backend::ChipBackend;

#[derive(Default)]
struct SyncptMeta {
    assigned: bool,
    name: Option<String>,
    last_used_by: Option<String>,
    in_use: Option<ChannelId>,
}

/// Snapshot of one assigned syncpoint, for debug output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncptSnapshot {
    pub id: SyncptId,
    pub name: String,
    pub min: u32,
    pub max: u32,
    pub client_managed: bool,
}

/// Process-wide syncpoint table.
pub struct SyncpointRegistry {
    backend: Arc<dyn ChipBackend>,
    nb_pts: u32,
    nb_mlocks: u32,
    min: Box<[AtomicU32]>,
    max: Box<[AtomicU32]>,
    refs: Box<[AtomicU32]>,
    client_managed: Box<[AtomicBool]>,
    lock_counts: Box<[AtomicU32]>,
    meta: Mutex<Vec<SyncptMeta>>,
}

fn atomics(n: u32) -> Box<[AtomicU32]> {
    (0..n).map(|_| AtomicU32::new(0)).collect()
}

impl SyncpointRegistry {
    pub fn new(backend: Arc<dyn ChipBackend>) -> Self {
        let info = *backend.info();
        let mut meta: Vec<SyncptMeta> = (0..info.nb_pts).map(|_| SyncptMeta::default()).collect();
        meta[HOST_RESERVED_SYNCPT as usize] = SyncptMeta {
            assigned: true,
            name: Some("host1x".into()),
            ..Default::default()
        };

        let registry = Self {
            backend,
            nb_pts: info.nb_pts,
            nb_mlocks: info.nb_mlocks,
            min: atomics(info.nb_pts),
            max: atomics(info.nb_pts),
            refs: atomics(info.nb_pts),
            client_managed: (0..info.nb_pts).map(|_| AtomicBool::new(false)).collect(),
            lock_counts: atomics(info.nb_mlocks),
            meta: Mutex::new(meta),
        };
        registry.refs[HOST_RESERVED_SYNCPT as usize].store(1, Ordering::Relaxed);
        registry
    }

    fn index(&self, id: SyncptId) -> Host1xResult<usize> {
        if id < self.nb_pts {
            Ok(id as usize)
        } else {
            Err(Host1xError::InvalidSyncpt(id))
        }
    }

    pub fn nb_pts(&self) -> u32 {
        self.nb_pts
    }

    pub fn nb_mlocks(&self) -> u32 {
        self.nb_mlocks
    }

    pub fn is_valid(&self, id: SyncptId) -> bool {
        id < self.nb_pts
    }

    pub fn backend(&self) -> &Arc<dyn ChipBackend> {
        &self.backend
    }

    /// Seed the cached values from the hardware registers.
    pub fn reset_from_hw(&self) {
        for id in 0..self.nb_pts {
            let val = self.backend.syncpt_read(id);
            self.min[id as usize].store(val, Ordering::Release);
            self.max[id as usize].store(val, Ordering::Release);
        }
        log::debug!("syncpt: seeded {} syncpoints from hardware", self.nb_pts);
    }

    // ── Values ──────────────────────────────────────────────────────────────

    /// Cached hardware value. May lag the register.
    pub fn read_min(&self, id: SyncptId) -> Host1xResult<u32> {
        Ok(self.min[self.index(id)?].load(Ordering::Acquire))
    }

    pub fn read_max(&self, id: SyncptId) -> Host1xResult<u32> {
        Ok(self.max[self.index(id)?].load(Ordering::Acquire))
    }

    /// Read the hardware register and refresh the cached `min`.
    ///
    /// The cache never moves backwards: a register value behind the cache
    /// leaves it untouched.
    pub fn update_min(&self, id: SyncptId) -> Host1xResult<u32> {
        let idx = self.index(id)?;
        let live = self.backend.syncpt_read(id);
        let mut old = self.min[idx].load(Ordering::Acquire);
        loop {
            if (live.wrapping_sub(old) as i32) <= 0 {
                return Ok(old);
            }
            match self.min[idx].compare_exchange_weak(old, live, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(cur) => old = cur,
            }
        }

        if !self.is_client_managed(id) {
            let max = self.max[idx].load(Ordering::Acquire);
            if (max.wrapping_sub(live) as i32) < 0 {
                log::warn!("syncpt {}: hardware value {} is past max {}", id, live, max);
            }
        }
        log::trace!("syncpt {}: min -> {}", id, live);
        Ok(live)
    }

    /// Reserve `count` increments and return the fence value they will reach.
    pub fn incr_max(&self, id: SyncptId, count: u32) -> Host1xResult<u32> {
        let idx = self.index(id)?;
        Ok(self.max[idx].fetch_add(count, Ordering::AcqRel).wrapping_add(count))
    }

    pub fn is_client_managed(&self, id: SyncptId) -> bool {
        self.index(id)
            .map(|idx| self.client_managed[idx].load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// True once `min` has reached `thresh` (signed difference, mod 2^32).
    pub fn is_expired(&self, id: SyncptId, thresh: u32) -> Host1xResult<bool> {
        let idx = self.index(id)?;
        Ok(reached(self.min[idx].load(Ordering::Acquire), thresh))
    }

    /// True if waiting for `thresh` can never block: it has been reached, or
    /// it lies outside every increment reserved on a host-managed syncpoint.
    pub fn is_wait_stale(&self, id: SyncptId, thresh: u32) -> Host1xResult<bool> {
        let idx = self.index(id)?;
        let current = self.min[idx].load(Ordering::Acquire);
        let future = self.max[idx].load(Ordering::Acquire);
        Ok(passed(current, future, !self.is_client_managed(id), thresh))
    }

    /// Wrap-aware ordering of two thresholds on the same syncpoint.
    /// `Less` means `a` triggers first.
    pub fn compare(&self, id: SyncptId, a: u32, b: u32) -> Host1xResult<CmpOrdering> {
        let idx = self.index(id)?;
        let current = self.min[idx].load(Ordering::Acquire);
        let future = self.max[idx].load(Ordering::Acquire);
        let has_future = !self.is_client_managed(id);
        if a == b {
            return Ok(CmpOrdering::Equal);
        }
        match (passed(current, future, has_future, a), passed(current, future, has_future, b)) {
            (true, false) => Ok(CmpOrdering::Less),
            (false, true) => Ok(CmpOrdering::Greater),
            _ => Ok(a.wrapping_sub(current).cmp(&b.wrapping_sub(current))),
        }
    }

    pub fn min_eq_max(&self, id: SyncptId) -> Host1xResult<bool> {
        Ok(self.read_min(id)? == self.read_max(id)?)
    }

    /// Force `min` up to `max` and load it into the register.
    pub fn set_min_eq_max(&self, id: SyncptId) -> Host1xResult<()> {
        let idx = self.index(id)?;
        let max = self.max[idx].load(Ordering::Acquire);
        self.min[idx].store(max, Ordering::Release);
        self.backend.syncpt_load(id, max);
        Ok(())
    }

    /// Increment the register from the CPU. Client-managed syncpoints also
    /// get their `max` bumped, host-managed ones must already have the
    /// increment reserved.
    pub fn cpu_incr(&self, id: SyncptId) -> Host1xResult<()> {
        let idx = self.index(id)?;
        if self.client_managed[idx].load(Ordering::Acquire) {
            self.max[idx].fetch_add(1, Ordering::AcqRel);
        }
        self.backend.syncpt_cpu_incr(id);
        Ok(())
    }

    // ── Allocation ──────────────────────────────────────────────────────────

    pub fn alloc_host_managed(&self, name: &str) -> Host1xResult<SyncptId> {
        self.alloc(name, false)
    }

    pub fn alloc_client_managed(&self, name: &str) -> Host1xResult<SyncptId> {
        self.alloc(name, true)
    }

    fn alloc(&self, name: &str, client_managed: bool) -> Host1xResult<SyncptId> {
        let mut meta = self.meta.lock();
        let idx = meta
            .iter()
            .enumerate()
            .skip(HOST_RESERVED_SYNCPT as usize + 1)
            .find(|(_, m)| !m.assigned)
            .map(|(i, _)| i)
            .ok_or(Host1xError::NoFreeSyncpt)?;

        meta[idx].assigned = true;
        meta[idx].name = Some(name.to_string());
        self.client_managed[idx].store(client_managed, Ordering::Release);
        self.refs[idx].store(1, Ordering::Release);

        log::debug!(
            "syncpt: assigned {} to \"{}\" ({})",
            idx,
            name,
            if client_managed { "client managed" } else { "host managed" }
        );
        Ok(idx as SyncptId)
    }

    pub fn is_assigned(&self, id: SyncptId) -> bool {
        self.index(id).map(|idx| self.meta.lock()[idx].assigned).unwrap_or(false)
    }

    pub fn name(&self, id: SyncptId) -> Option<String> {
        let idx = self.index(id).ok()?;
        self.meta.lock()[idx].name.clone()
    }

    pub fn last_used_by(&self, id: SyncptId) -> Option<String> {
        let idx = self.index(id).ok()?;
        self.meta.lock()[idx].last_used_by.clone()
    }

    pub fn read_ref(&self, id: SyncptId) -> Host1xResult<u32> {
        Ok(self.refs[self.index(id)?].load(Ordering::Acquire))
    }

    pub fn get_ref(&self, id: SyncptId) -> Host1xResult<u32> {
        let idx = self.index(id)?;
        if !self.meta.lock()[idx].assigned {
            return Err(Host1xError::SyncptNotAssigned(id));
        }
        Ok(self.refs[idx].fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Drop a reference; the syncpoint returns to the free pool at zero.
    pub fn put_ref(&self, id: SyncptId) -> Host1xResult<()> {
        let idx = self.index(id)?;
        let prev = self.refs[idx]
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| r.checked_sub(1))
            .map_err(|_| Host1xError::SyncptNotAssigned(id))?;
        if prev == 1 {
            self.free(id);
        }
        Ok(())
    }

    fn free(&self, id: SyncptId) {
        let idx = id as usize;
        if id == HOST_RESERVED_SYNCPT {
            return;
        }
        let client_managed = self.client_managed[idx].load(Ordering::Acquire);
        if !client_managed && !self.min_eq_max(id).unwrap_or(true) {
            log::warn!(
                "syncpt: freeing host managed syncpt {} ({}) still in use",
                id,
                self.name(id).unwrap_or_default()
            );
        }
        if client_managed {
            let _ = self.set_min_eq_max(id);
        }

        let mut meta = self.meta.lock();
        let entry = &mut meta[idx];
        entry.last_used_by = entry.name.take();
        entry.assigned = false;
        entry.in_use = None;
        self.client_managed[idx].store(false, Ordering::Release);
        log::debug!("syncpt: freed {}", id);
    }

    /// Record that `ch` pushes increments to `id`. Holds a reference until
    /// [`mark_unused`](Self::mark_unused).
    pub fn mark_used(&self, ch: ChannelId, id: SyncptId) -> Host1xResult<()> {
        let idx = self.index(id)?;
        let mut meta = self.meta.lock();
        if meta[idx].in_use.is_none() {
            meta[idx].in_use = Some(ch);
            self.refs[idx].fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }

    pub fn mark_unused(&self, id: SyncptId) -> Host1xResult<()> {
        let idx = self.index(id)?;
        let was_used = self.meta.lock()[idx].in_use.take().is_some();
        if was_used {
            self.put_ref(id)?;
        }
        Ok(())
    }

    pub fn used_by(&self, id: SyncptId) -> Option<ChannelId> {
        let idx = self.index(id).ok()?;
        self.meta.lock()[idx].in_use
    }

    // ── Module mutexes ──────────────────────────────────────────────────────

    fn mlock_index(&self, idx: u32) -> Host1xResult<usize> {
        if idx < self.nb_mlocks {
            Ok(idx as usize)
        } else {
            Err(Host1xError::InvalidMlock(idx))
        }
    }

    /// Take a module mutex from the CPU.
    pub fn mutex_try_lock(&self, idx: u32) -> Host1xResult<()> {
        let i = self.mlock_index(idx)?;
        if !self.backend.mlock_try_lock(idx) {
            return Err(Host1xError::MlockBusy(idx));
        }
        self.lock_counts[i].fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    pub fn mutex_unlock(&self, idx: u32) -> Host1xResult<()> {
        let i = self.mlock_index(idx)?;
        self.backend.mlock_unlock(idx);
        let _ = self.lock_counts[i].fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
            c.checked_sub(1)
        });
        Ok(())
    }

    pub fn mutex_lock_count(&self, idx: u32) -> Host1xResult<u32> {
        Ok(self.lock_counts[self.mlock_index(idx)?].load(Ordering::Acquire))
    }

    // ── Debug ───────────────────────────────────────────────────────────────

    pub fn snapshot(&self) -> Vec<SyncptSnapshot> {
        let meta = self.meta.lock();
        meta.iter()
            .enumerate()
            .filter(|(_, m)| m.assigned)
            .map(|(idx, m)| SyncptSnapshot {
                id: idx as SyncptId,
                name: m.name.clone().unwrap_or_default(),
                min: self.min[idx].load(Ordering::Acquire),
                max: self.max[idx].load(Ordering::Acquire),
                client_managed: self.client_managed[idx].load(Ordering::Acquire),
            })
            .collect()
    }
}

fn reached(current: u32, thresh: u32) -> bool {
    (current.wrapping_sub(thresh) as i32) >= 0
}

/// `current` is the confirmed value, `future` the value it converges to.
///
/// With a known future the threshold is passed iff `f - t >= c - t`
/// (mod 2^32); both sides must keep the `- t`. Client-managed counters have
/// no future value and fall back to a signed difference.
fn passed(current: u32, future: u32, has_future: bool, thresh: u32) -> bool {
    if has_future {
        future.wrapping_sub(thresh) >= current.wrapping_sub(thresh)
    } else {
        reached(current, thresh)
    }
}
