// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Channel timeout recovery.
//!
//! Runs on the CDMA worker when the head job outlives its watchdog. The
//! channel is torn down, the stuck job and everything queued behind it is
//! NOP'd out of the push buffer and force-completed, then DMA resumes past
//! the cleaned slots.

use std::collections::VecDeque;

use nvhost_common::{Fence, HOST_RESERVED_SYNCPT};

use crate::backend::MlockState;
use crate::cdma::{CdmaShared, CdmaState, SyncEntry};
use crate::debug;
use crate::syncpoint::SyncpointRegistry;

/// CPU-increment `fence.id` until it reaches `fence.value`.
pub fn force_fence(syncpt: &SyncpointRegistry, fence: Fence) {
    if fence.id == HOST_RESERVED_SYNCPT {
        return;
    }
    let Ok(min) = syncpt.update_min(fence.id) else { return };
    if syncpt.is_expired(fence.id, fence.value).unwrap_or(true) {
        return;
    }
    let missing = fence.value.wrapping_sub(min);
    log::debug!("timeout: forcing {} (+{})", fence, missing);
    let backend = syncpt.backend();
    for _ in 0..missing {
        backend.syncpt_cpu_incr(fence.id);
    }
    let _ = syncpt.update_min(fence.id);
}

/// Release every hardware mutex held by channel `ch`. Returns how many.
pub(crate) fn release_channel_mlocks(shared: &CdmaShared) -> u32 {
    let mut released = 0;
    for idx in 0..shared.syncpt.nb_mlocks() {
        if shared.backend.mlock_owner(idx) == MlockState::Channel(shared.ch) {
            log::warn!("cdma{}: releasing mlock {} held by torn down channel", shared.ch, idx);
            shared.backend.mlock_unlock(idx);
            released += 1;
        }
    }
    released
}

pub(crate) fn handle_timeout(shared: &CdmaShared, queue: &mut VecDeque<SyncEntry>) {
    let ch = shared.ch;
    let Some(head) = queue.front() else { return };
    if shared.entry_complete(head) {
        log::debug!("cdma{}: watchdog raced with completion of job {}", ch, head.seq);
        return;
    }

    let backend = &shared.backend;
    let mut inner = shared.inner.lock();
    backend.cmdproc_stop(ch, true);
    inner.stats.timeouts += 1;

    let Some(head) = queue.front() else { return };
    log::warn!(
        "cdma{}: timeout on job {} of client {}, waiting for {} (at {})",
        ch,
        head.seq,
        head.client,
        head.fences[0],
        shared.syncpt.read_min(head.fences[0].id).unwrap_or(0)
    );
    if shared.debug_dump {
        debug::dump_channel(backend.as_ref(), ch);
        debug::dump_job(&shared.pool, head);
    }

    inner.state = CdmaState::TornDown;
    backend.channel_teardown(ch);
    let reset_ok = if shared.engine.needs_module_reset {
        let ok = backend.module_reset(shared.engine.class_id);
        if !ok {
            log::error!("cdma{}: module reset of {} failed", ch, shared.engine.name);
        }
        ok
    } else {
        true
    };

    release_channel_mlocks(shared);

    // The hardware is stopped: whatever completed by now stays completed.
    shared.retire_completed(&mut inner, queue);
    if let Some(offender) = queue.front() {
        shared.timed_out.lock().insert(offender.client);
    }
    let mut restart_at = None;
    while let Some(entry) = queue.pop_front() {
        if let Err(e) = inner.pb.nop_slots(entry.first_get, entry.num_slots) {
            log::error!("cdma{}: cleaning slots of job {}: {}", ch, entry.seq, e);
        }
        restart_at = Some(inner.pb.offset_after(entry.first_get, entry.num_slots));
        shared.abort_entry(&mut inner, entry);
    }

    if !reset_ok {
        inner.state = CdmaState::Faulted;
        shared.event.notify_all();
        log::error!("cdma{}: channel faulted, command processor left stopped", ch);
        return;
    }

    if let Some(offset) = restart_at {
        let get = inner.pb.dma_start() + offset;
        backend.cdma_set_get(ch, get);
        log::debug!("cdma{}: resuming at 0x{:08X}", ch, get);
    }
    inner.state = CdmaState::Running;
    backend.cmdproc_stop(ch, false);
    shared.event.notify_all();
}
