// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Syncpoint threshold interrupts.
//!
//! Clients register one-shot actions keyed on `(syncpoint, threshold)`. The
//! lowest pending threshold of each syncpoint is programmed into hardware;
//! when it fires, [`Intr::isr`] refreshes the cached value and runs every
//! action whose threshold has been reached. Actions run outside the waiter
//! lock.
//!
//! Delivery is either the platform interrupt line or a polling thread.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use nvhost_common::settings::Host1xSettings;
use nvhost_common::{Host1xError, Host1xResult, SyncptId};

use crate::cdma::WorkerMsg;
use crate::regs::IrqLine;
use crate::syncpoint::SyncpointRegistry;

/// Wakes a thread blocked in [`WakeupSignal::wait`].
#[derive(Default)]
pub struct WakeupSignal {
    fired: Mutex<bool>,
    cond: Condvar,
}

impl WakeupSignal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn notify(&self) {
        *self.fired.lock() = true;
        self.cond.notify_all();
    }

    /// Wait up to `timeout`. Returns true if notified.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut fired = self.fired.lock();
        let deadline = Instant::now() + timeout;
        while !*fired {
            if self.cond.wait_until(&mut fired, deadline).timed_out() {
                break;
            }
        }
        *fired
    }
}

/// What to do once a threshold is reached.
pub enum IntrAction {
    /// Tell a channel's CDMA worker to retire completed jobs.
    SubmitComplete(Sender<WorkerMsg>),
    Wakeup(Arc<WakeupSignal>),
    Callback(Box<dyn FnOnce(u32) + Send>),
}

impl IntrAction {
    fn run(self, value: u32) {
        match self {
            Self::SubmitComplete(tx) => {
                // The worker is gone once its channel is closed.
                let _ = tx.send(WorkerMsg::Update);
            }
            Self::Wakeup(signal) => signal.notify(),
            Self::Callback(f) => f(value),
        }
    }
}

/// A pre-allocated waiter. Returned to the budget when dropped.
pub struct WaiterSlot {
    budget: Arc<AtomicUsize>,
}

impl Drop for WaiterSlot {
    fn drop(&mut self) {
        self.budget.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Handle to a registered action, used to cancel it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaiterRef {
    pub id: SyncptId,
    key: u64,
}

struct WaitEntry {
    key: u64,
    thresh: u32,
    action: IntrAction,
    _slot: WaiterSlot,
}

enum Delivery {
    None,
    Irq(Arc<dyn IrqLine>),
    Polling(JoinHandle<()>),
}

pub struct Intr {
    syncpt: Arc<SyncpointRegistry>,
    lists: Mutex<Vec<Vec<WaitEntry>>>,
    next_key: AtomicU64,
    budget: Arc<AtomicUsize>,
    max_waiters: usize,
    check_period: Duration,
    max_stuck_checks: u32,
    delivery: Mutex<Delivery>,
    stop: Arc<AtomicBool>,
}

impl Intr {
    pub fn new(syncpt: Arc<SyncpointRegistry>, settings: &Host1xSettings) -> Arc<Self> {
        let lists = (0..syncpt.nb_pts()).map(|_| Vec::new()).collect();
        Arc::new(Self {
            syncpt,
            lists: Mutex::new(lists),
            next_key: AtomicU64::new(1),
            budget: Arc::new(AtomicUsize::new(0)),
            max_waiters: settings.max_waiters,
            check_period: settings.syncpt_check_period(),
            max_stuck_checks: settings.max_stuck_checks,
            delivery: Mutex::new(Delivery::None),
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn syncpt(&self) -> &Arc<SyncpointRegistry> {
        &self.syncpt
    }

    // ── Delivery ────────────────────────────────────────────────────────────

    /// Route the platform interrupt line to [`handle_irq`](Self::handle_irq).
    pub fn start_irq(self: &Arc<Self>, line: Arc<dyn IrqLine>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        line.request(Arc::new(move || {
            if let Some(intr) = weak.upgrade() {
                intr.handle_irq();
            }
        }));
        *self.delivery.lock() = Delivery::Irq(line);
        log::info!("intr: using syncpoint threshold interrupts");
    }

    /// Sample every syncpoint with pending waiters each `period`.
    pub fn start_polling(self: &Arc<Self>, period: Duration) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let stop = self.stop.clone();
        let handle = std::thread::Builder::new()
            .name("host1x-intr-poll".into())
            .spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    let Some(intr) = weak.upgrade() else { break };
                    for id in intr.pending_ids() {
                        intr.isr(id);
                    }
                    drop(intr);
                    std::thread::sleep(period);
                }
            });
        match handle {
            Ok(h) => {
                *self.delivery.lock() = Delivery::Polling(h);
                log::info!("intr: polling syncpoints every {:?}", period);
            }
            Err(e) => log::error!("intr: failed to spawn poll thread: {}", e),
        }
    }

    /// Stop delivery and mask every threshold interrupt.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        let delivery = std::mem::replace(&mut *self.delivery.lock(), Delivery::None);
        match delivery {
            Delivery::Irq(line) => line.free(),
            Delivery::Polling(h) => {
                if h.join().is_err() {
                    log::error!("intr: poll thread panicked");
                }
            }
            Delivery::None => {}
        }
        let backend = self.syncpt.backend();
        for id in 0..self.syncpt.nb_pts() {
            backend.syncpt_intr_disable(id);
        }
    }

    /// Interrupt line handler: acknowledge and service every pending syncpoint.
    pub fn handle_irq(&self) {
        let backend = self.syncpt.backend();
        for id in backend.syncpt_intr_status() {
            backend.syncpt_intr_ack(id);
            self.isr(id);
        }
    }

    fn pending_ids(&self) -> Vec<SyncptId> {
        self.lists
            .lock()
            .iter()
            .enumerate()
            .filter(|(_, l)| !l.is_empty())
            .map(|(id, _)| id as SyncptId)
            .collect()
    }

    // ── Waiters ─────────────────────────────────────────────────────────────

    /// Reserve a waiter ahead of [`add_action`](Self::add_action).
    pub fn alloc_waiter(&self) -> Host1xResult<WaiterSlot> {
        let prev = self.budget.fetch_add(1, Ordering::AcqRel);
        let slot = WaiterSlot { budget: self.budget.clone() };
        if prev >= self.max_waiters {
            drop(slot);
            log::warn!("intr: waiter budget of {} exhausted", self.max_waiters);
            return Err(Host1xError::WaiterLimit);
        }
        Ok(slot)
    }

    pub fn waiters_in_use(&self) -> usize {
        self.budget.load(Ordering::Acquire)
    }

    /// Run `action` once syncpoint `id` reaches `thresh`.
    ///
    /// An already expired threshold runs the action before returning.
    pub fn add_action(
        &self,
        slot: WaiterSlot,
        id: SyncptId,
        thresh: u32,
        action: IntrAction,
    ) -> Host1xResult<WaiterRef> {
        if !self.syncpt.is_valid(id) {
            return Err(Host1xError::InvalidSyncpt(id));
        }
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        {
            let mut lists = self.lists.lock();
            let list = &mut lists[id as usize];
            list.push(WaitEntry { key, thresh, action, _slot: slot });
            self.program_threshold(id, list);
        }
        log::trace!("intr: action on syncpt {} thresh {}", id, thresh);

        self.syncpt.update_min(id)?;
        if self.syncpt.is_expired(id, thresh)? {
            self.isr(id);
        }
        Ok(WaiterRef { id, key })
    }

    /// Cancel an action that has not run yet. Returns false if it already ran.
    pub fn put_ref(&self, wref: WaiterRef) -> bool {
        let mut lists = self.lists.lock();
        let Some(list) = lists.get_mut(wref.id as usize) else { return false };
        let Some(pos) = list.iter().position(|e| e.key == wref.key) else { return false };
        let entry = list.remove(pos);
        self.program_threshold(wref.id, list);
        drop(lists);
        drop(entry);
        true
    }

    pub fn pending(&self, id: SyncptId) -> usize {
        self.lists.lock().get(id as usize).map_or(0, |l| l.len())
    }

    /// Service syncpoint `id`: run every expired action.
    pub fn isr(&self, id: SyncptId) {
        loop {
            let value = match self.syncpt.update_min(id) {
                Ok(v) => v,
                Err(e) => {
                    log::error!("intr: {}", e);
                    return;
                }
            };
            let fired: Vec<WaitEntry> = {
                let mut lists = self.lists.lock();
                let list = &mut lists[id as usize];
                let (fired, keep): (Vec<_>, Vec<_>) = list
                    .drain(..)
                    .partition(|e| self.syncpt.is_expired(id, e.thresh).unwrap_or(true));
                *list = keep;
                self.program_threshold(id, list);
                fired
            };
            if fired.is_empty() {
                return;
            }
            log::trace!("intr: syncpt {} at {}, {} action(s)", id, value, fired.len());
            // Slots go back to the budget before anyone woken below can
            // allocate again.
            let actions: Vec<IntrAction> = fired.into_iter().map(|e| e.action).collect();
            for action in actions {
                action.run(value);
            }
        }
    }

    fn program_threshold(&self, id: SyncptId, list: &[WaitEntry]) {
        let backend = self.syncpt.backend();
        let lowest = list.iter().map(|e| e.thresh).reduce(|a, b| {
            match self.syncpt.compare(id, a, b) {
                Ok(std::cmp::Ordering::Greater) => b,
                _ => a,
            }
        });
        match lowest {
            Some(thresh) => {
                backend.syncpt_set_thresh(id, thresh);
                backend.syncpt_intr_enable(id);
            }
            None => backend.syncpt_intr_disable(id),
        }
    }

    // ── Blocking wait ───────────────────────────────────────────────────────

    /// Block until syncpoint `id` reaches `thresh` and return its value.
    ///
    /// `None` waits forever. A zero timeout only checks.
    pub fn wait_timeout(
        &self,
        id: SyncptId,
        thresh: u32,
        timeout: Option<Duration>,
    ) -> Host1xResult<u32> {
        if id == 0 || !self.syncpt.is_valid(id) {
            return Err(Host1xError::InvalidSyncpt(id));
        }

        if self.syncpt.is_expired(id, thresh)? {
            return self.syncpt.read_min(id);
        }
        let val = self.syncpt.update_min(id)?;
        if self.syncpt.is_expired(id, thresh)? {
            return Ok(val);
        }
        if timeout == Some(Duration::ZERO) {
            return Err(Host1xError::Timeout);
        }

        let signal = WakeupSignal::new();
        let slot = self.alloc_waiter()?;
        let wref = self.add_action(slot, id, thresh, IntrAction::Wakeup(signal.clone()))?;

        let refreshed_expired = || {
            self.syncpt
                .update_min(id)
                .and_then(|_| self.syncpt.is_expired(id, thresh))
                .unwrap_or(false)
        };
        let low_timeout = timeout.filter(|t| *t < self.check_period);
        let mut remaining = timeout;
        let mut old_val = val;
        let mut check_count = 0;
        let result = loop {
            let check = remaining.map_or(self.check_period, |r| r.min(self.check_period));
            let woken = signal.wait(check);
            if woken || refreshed_expired() {
                break self.syncpt.read_min(id);
            }

            if let Some(r) = remaining.as_mut() {
                *r = r.saturating_sub(check);
                if r.is_zero() {
                    break Err(Host1xError::Timeout);
                }
            }

            if check_count <= self.max_stuck_checks {
                let new_val = self.syncpt.update_min(id).unwrap_or(old_val);
                let name = self.syncpt.name(id).unwrap_or_default();
                if new_val == old_val {
                    log::warn!("syncpt {} ({}) stuck waiting for {}, at {}", id, name, thresh, new_val);
                    crate::debug::dump_syncpts(&self.syncpt);
                } else {
                    old_val = new_val;
                    log::warn!("syncpt {} ({}) progressing slowly toward {}", id, name, thresh);
                }
                if check_count == self.max_stuck_checks {
                    if let Some(t) = low_timeout {
                        log::warn!("is timeout {:?} too low?", t);
                    }
                }
                check_count += 1;
            }
        };

        self.put_ref(wref);
        result
    }
}

impl Drop for Intr {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}
