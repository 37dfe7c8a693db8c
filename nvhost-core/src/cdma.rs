// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Command DMA.
//!
//! One [`Cdma`] per hardware channel. It owns the channel's push buffer and
//! drives the DMA registers. Submitted jobs travel to a dedicated worker
//! thread, the only owner of the sync queue. The worker retires jobs as
//! their fences expire, and when the head job outlives its timeout it runs
//! the teardown in [`crate::timeout`].
//!
//! Locking: `CdmaShared::inner` guards the push buffer and the DMA state. A
//! submission holds it from [`Cdma::begin`] until [`CdmaSubmit::end`]; the
//! worker takes it to retire or tear down.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{fence, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use nvhost_common::settings::Host1xSettings;
use nvhost_common::{ChannelId, ClientId, Fence, Host1xError, Host1xResult, Iova};

use crate::backend::ChipBackend;
use crate::channel::EngineDesc;
use crate::intr::{Intr, IntrAction, WaiterSlot};
use crate::job::{Job, JobCompletion, JobOutcome};
use crate::memory::DmaPool;
use crate::opcodes::Slot;
use crate::push_buffer::PushBuffer;
use crate::syncpoint::SyncpointRegistry;
use crate::timeout;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CdmaState {
    Stopped,
    Running,
    /// Teardown in progress.
    TornDown,
    /// Module reset failed; the command processor stays stopped.
    Faulted,
}

/// A job in the sync queue.
pub struct SyncEntry {
    pub seq: u64,
    pub client: ClientId,
    pub job: Job,
    /// Reserved fences, primary first.
    pub fences: Vec<Fence>,
    /// Byte offset of the job's first push buffer slot.
    pub first_get: u32,
    pub num_slots: u32,
    pub timeout: Option<Duration>,
    pub completion: Arc<JobCompletion>,
}

impl SyncEntry {
    pub fn new(job: Job, fences: Vec<Fence>, timeout: Option<Duration>, completion: Arc<JobCompletion>) -> Self {
        Self {
            seq: 0,
            client: job.client,
            job,
            fences,
            first_get: 0,
            num_slots: 0,
            timeout,
            completion,
        }
    }
}

pub enum WorkerMsg {
    Queued(Box<SyncEntry>),
    /// A fence may have expired.
    Update,
    Shutdown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CdmaStats {
    pub submitted: u64,
    pub completed: u64,
    pub aborted: u64,
    pub timeouts: u64,
}

pub(crate) struct CdmaInner {
    pub pb: PushBuffer,
    pub state: CdmaState,
    pub last_put: Iova,
    /// Jobs handed to the worker and not yet retired.
    pub queued: usize,
    pub next_seq: u64,
    pub stats: CdmaStats,
}

pub(crate) struct CdmaShared {
    pub ch: ChannelId,
    pub engine: EngineDesc,
    pub backend: Arc<dyn ChipBackend>,
    pub syncpt: Arc<SyncpointRegistry>,
    pub pool: Arc<DmaPool>,
    pub debug_dump: bool,
    pub inner: Mutex<CdmaInner>,
    /// Signalled on retirement, abort and teardown.
    pub event: Condvar,
    pub timed_out: Mutex<HashSet<ClientId>>,
}

impl CdmaShared {
    pub fn entry_complete(&self, entry: &SyncEntry) -> bool {
        entry.fences.iter().all(|f| {
            self.syncpt
                .update_min(f.id)
                .and_then(|_| self.syncpt.is_expired(f.id, f.value))
                .unwrap_or(false)
        })
    }

    /// Retire every completed job at the head of `queue`.
    pub fn retire_completed(&self, inner: &mut CdmaInner, queue: &mut VecDeque<SyncEntry>) -> usize {
        let mut retired = 0;
        while queue.front().is_some_and(|e| self.entry_complete(e)) {
            let Some(mut entry) = queue.pop_front() else { break };
            inner.pb.pop_from(entry.num_slots);
            inner.queued -= 1;
            inner.stats.completed += 1;
            entry.job.unpin(&self.pool);
            entry.completion.complete(JobOutcome::Completed);
            log::trace!("cdma{}: retired job {} at {}", self.ch, entry.seq, entry.fences[0]);
            retired += 1;
        }
        if retired > 0 {
            self.event.notify_all();
        }
        retired
    }

    /// Force-complete `entry`: bring its syncpoints up to its fences from the
    /// CPU, release its slots and report it as aborted.
    pub fn abort_entry(&self, inner: &mut CdmaInner, mut entry: SyncEntry) {
        for f in &entry.fences {
            timeout::force_fence(&self.syncpt, *f);
        }
        inner.pb.pop_from(entry.num_slots);
        inner.queued -= 1;
        inner.stats.aborted += 1;
        entry.job.unpin(&self.pool);
        entry.completion.complete(JobOutcome::Aborted);
        log::debug!("cdma{}: aborted job {} of client {}", self.ch, entry.seq, entry.client);
        self.event.notify_all();
    }

    fn kick(&self, inner: &mut CdmaInner) {
        let put = inner.pb.put_ptr();
        if put != inner.last_put {
            fence(Ordering::SeqCst);
            self.backend.cdma_kick(self.ch, put);
            inner.last_put = put;
        }
    }

    fn start(&self, inner: &mut CdmaInner) {
        if inner.state != CdmaState::Stopped {
            return;
        }
        if inner.queued == 0 {
            inner.pb.reset();
        }
        let put = inner.pb.put_ptr();
        self.backend
            .cdma_start(self.ch, inner.pb.dma_start(), inner.pb.dma_end(), put);
        inner.last_put = put;
        inner.state = CdmaState::Running;
        log::debug!("cdma{}: started at 0x{:08X}", self.ch, inner.pb.dma_start());
    }
}

pub struct Cdma {
    shared: Arc<CdmaShared>,
    intr: Arc<Intr>,
    tx: Sender<WorkerMsg>,
    submit_wait: Duration,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Cdma {
    pub fn new(
        ch: ChannelId,
        engine: EngineDesc,
        intr: Arc<Intr>,
        pool: Arc<DmaPool>,
        settings: &Host1xSettings,
    ) -> Host1xResult<Self> {
        let pb = PushBuffer::new(pool.clone(), settings.push_buffer_slots)?;
        let syncpt = intr.syncpt().clone();
        let shared = Arc::new(CdmaShared {
            ch,
            engine,
            backend: syncpt.backend().clone(),
            syncpt,
            pool,
            debug_dump: settings.debug_dump,
            inner: Mutex::new(CdmaInner {
                pb,
                state: CdmaState::Stopped,
                last_put: 0,
                queued: 0,
                next_seq: 1,
                stats: CdmaStats::default(),
            }),
            event: Condvar::new(),
            timed_out: Mutex::new(HashSet::new()),
        });

        let (tx, rx) = mpsc::channel();
        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name(format!("host1x-cdma{}", ch))
            .spawn(move || worker_loop(worker_shared, rx))
            .map_err(|e| {
                log::error!("cdma{}: failed to spawn worker: {}", ch, e);
                Host1xError::NoChannel
            })?;

        Ok(Self {
            shared,
            intr,
            tx,
            submit_wait: settings.submit_wait(),
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn id(&self) -> ChannelId {
        self.shared.ch
    }

    pub fn engine(&self) -> &EngineDesc {
        &self.shared.engine
    }

    pub fn state(&self) -> CdmaState {
        self.shared.inner.lock().state
    }

    /// Jobs submitted and not yet retired.
    pub fn queue_len(&self) -> usize {
        self.shared.inner.lock().queued
    }

    pub fn stats(&self) -> CdmaStats {
        self.shared.inner.lock().stats
    }

    /// Start the DMA engine. No-op unless stopped.
    pub fn start(&self) {
        let mut inner = self.shared.inner.lock();
        self.shared.start(&mut inner);
    }

    /// Publish the push buffer cursor to DMAPUT if it moved.
    pub fn kick(&self) {
        let mut inner = self.shared.inner.lock();
        self.shared.kick(&mut inner);
    }

    /// Ask the worker to retire completed jobs.
    pub fn update(&self) {
        let _ = self.tx.send(WorkerMsg::Update);
    }

    /// Wait until every submitted job is retired. Returns false on timeout.
    pub fn flush(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.shared.inner.lock();
        while inner.queued > 0 {
            match deadline {
                Some(d) => {
                    if self.shared.event.wait_until(&mut inner, d).timed_out() {
                        return inner.queued == 0;
                    }
                }
                None => self.shared.event.wait(&mut inner),
            }
        }
        true
    }

    /// Drain the sync queue, then assert DMASTOP.
    pub fn stop(&self) {
        self.flush(None);
        let mut inner = self.shared.inner.lock();
        match inner.state {
            CdmaState::Running => {
                self.shared.backend.cdma_stop(self.shared.ch);
                inner.state = CdmaState::Stopped;
                log::debug!("cdma{}: stopped", self.shared.ch);
            }
            CdmaState::Faulted => self.shared.backend.cdma_stop(self.shared.ch),
            CdmaState::Stopped | CdmaState::TornDown => {}
        }
    }

    /// Reserve `slots` contiguous slots for one job.
    ///
    /// Waits up to the configured submit wait for the worker to free space.
    /// The returned guard holds the channel lock until it is ended or dropped.
    pub fn begin(&self, slots: u32) -> Host1xResult<CdmaSubmit<'_>> {
        let mut inner = self.shared.inner.lock();
        if inner.state == CdmaState::Faulted {
            return Err(Host1xError::ChannelFaulted(self.shared.ch));
        }
        let limit = inner.pb.reservation_limit();
        if slots >= limit {
            return Err(Host1xError::ReservationTooLarge { slots, limit });
        }
        self.shared.start(&mut inner);

        let deadline = Instant::now() + self.submit_wait;
        loop {
            let needed = slots + inner.pb.padding_for(slots);
            if inner.pb.space() >= needed {
                break;
            }
            if self.shared.event.wait_until(&mut inner, deadline).timed_out() {
                let needed = slots + inner.pb.padding_for(slots);
                let available = inner.pb.space();
                if available >= needed {
                    break;
                }
                log::warn!("cdma{}: no push buffer space for {} slots", self.shared.ch, needed);
                return Err(Host1xError::PushBufferFull { needed, available });
            }
            if inner.state == CdmaState::Faulted {
                return Err(Host1xError::ChannelFaulted(self.shared.ch));
            }
        }

        let first_get = inner.pb.cur();
        let pad = inner.pb.make_adjacent_space(slots)?;
        Ok(CdmaSubmit { cdma: self, inner, first_get, reserved: slots, pushed: 0, pad, ended: false })
    }

    pub fn is_client_timed_out(&self, client: ClientId) -> bool {
        self.shared.timed_out.lock().contains(&client)
    }

    /// Let a timed out client submit again.
    pub fn reset_client(&self, client: ClientId) -> bool {
        self.shared.timed_out.lock().remove(&client)
    }

    pub fn dma_get(&self) -> Iova {
        self.shared.backend.cdma_get(self.shared.ch)
    }
}

impl Drop for Cdma {
    fn drop(&mut self) {
        let _ = self.tx.send(WorkerMsg::Shutdown);
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                log::error!("cdma{}: worker panicked", self.shared.ch);
            }
        }
        let inner = self.shared.inner.lock();
        if inner.state != CdmaState::Stopped {
            self.shared.backend.cdma_stop(self.shared.ch);
        }
    }
}

/// An open submission. Dropping it without [`end`](Self::end) discards the
/// pushed slots.
pub struct CdmaSubmit<'a> {
    cdma: &'a Cdma,
    inner: MutexGuard<'a, CdmaInner>,
    first_get: u32,
    reserved: u32,
    pushed: u32,
    pad: u32,
    ended: bool,
}

impl CdmaSubmit<'_> {
    pub fn push(&mut self, slot: Slot) -> Host1xResult<()> {
        if self.pushed == self.reserved {
            return Err(Host1xError::SlotOverrun { reserved: self.reserved });
        }
        self.inner.pb.push_slot(slot)?;
        self.pushed += 1;
        Ok(())
    }

    pub fn pushed(&self) -> u32 {
        self.pushed
    }

    pub fn first_get(&self) -> u32 {
        self.first_get
    }

    /// Queue `entry`, kick the hardware and arm one completion waiter per
    /// fence. `waiters` must hold one slot per fence.
    pub fn end(mut self, mut entry: SyncEntry, waiters: Vec<WaiterSlot>) -> Host1xResult<()> {
        let cdma = self.cdma;
        let ch = cdma.shared.ch;
        if waiters.len() != entry.fences.len() {
            return Err(Host1xError::InvalidArgument("one waiter per fence"));
        }

        entry.first_get = self.first_get;
        entry.num_slots = self.pad + self.pushed;
        entry.seq = self.inner.next_seq;
        let fences = entry.fences.clone();

        self.inner.next_seq += 1;
        self.inner.queued += 1;
        if let Err(mpsc::SendError(msg)) = cdma.tx.send(WorkerMsg::Queued(Box::new(entry))) {
            log::error!("cdma{}: worker gone, dropping job", ch);
            if let WorkerMsg::Queued(entry) = msg {
                // Nothing was kicked: release the reservation without the slots.
                let mut entry = *entry;
                entry.num_slots = 0;
                cdma.shared.abort_entry(&mut self.inner, entry);
            }
            return Err(Host1xError::ChannelClosed(ch));
        }
        self.ended = true;
        self.inner.stats.submitted += 1;
        cdma.shared.kick(&mut self.inner);

        for (f, slot) in fences.into_iter().zip(waiters) {
            let action = IntrAction::SubmitComplete(cdma.tx.clone());
            if let Err(e) = cdma.intr.add_action(slot, f.id, f.value, action) {
                log::error!("cdma{}: completion waiter on {}: {}", ch, f, e);
            }
        }
        Ok(())
    }
}

impl Drop for CdmaSubmit<'_> {
    fn drop(&mut self) {
        if !self.ended && self.pushed + self.pad > 0 {
            self.inner.pb.rewind(self.first_get);
        }
    }
}

fn worker_loop(shared: Arc<CdmaShared>, rx: Receiver<WorkerMsg>) {
    let mut queue: VecDeque<SyncEntry> = VecDeque::new();
    // Watchdog armed for the head job: (seq, deadline).
    let mut armed: Option<(u64, Instant)> = None;

    loop {
        let msg = match armed {
            Some((_, deadline)) => rx.recv_timeout(deadline.saturating_duration_since(Instant::now())),
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match msg {
            Ok(WorkerMsg::Queued(entry)) => {
                let mut inner = shared.inner.lock();
                if inner.state == CdmaState::Faulted {
                    shared.abort_entry(&mut inner, *entry);
                } else {
                    queue.push_back(*entry);
                }
            }
            Ok(WorkerMsg::Update) => {}
            Ok(WorkerMsg::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                timeout::handle_timeout(&shared, &mut queue);
                armed = None;
            }
        }

        {
            let mut inner = shared.inner.lock();
            shared.retire_completed(&mut inner, &mut queue);
        }

        armed = match queue.front() {
            Some(head) => match armed {
                Some((seq, _)) if seq == head.seq => armed,
                _ => head.timeout.map(|t| (head.seq, Instant::now() + t)),
            },
            None => None,
        };
    }

    let mut inner = shared.inner.lock();
    shared.retire_completed(&mut inner, &mut queue);
    while let Some(entry) = queue.pop_front() {
        shared.abort_entry(&mut inner, entry);
    }
    while let Ok(msg) = rx.try_recv() {
        if let WorkerMsg::Queued(entry) = msg {
            shared.abort_entry(&mut inner, *entry);
        }
    }
    log::debug!("cdma{}: worker exiting", shared.ch);
}
