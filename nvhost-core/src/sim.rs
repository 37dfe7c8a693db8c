// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Software model of the host1x block.
//!
//! [`SimHost1x`] is a register file plus an executor thread. The executor
//! fetches each running channel's command stream from DMAGET up to DMAPUT,
//! follows gathers into client memory and performs the host class methods:
//! syncpoint increments, 32-bit syncpoint waits and module mutexes. Other
//! engine classes accept every method; only method 0 (`INCR_SYNCPT`) has an
//! effect.
//!
//! Threshold interrupts are raised from the executor thread, after it has
//! released the register file lock. Register writes never call the handler.
//!
//! Timing is not modelled: a channel runs until it idles or blocks.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use nvhost_common::settings::ChipGeneration;
use nvhost_common::{ChannelId, Iova, SyncptId};

use crate::memory::DmaPool;
use crate::opcodes::{Opcode, HOST1X_CLASS_ID, UCLASS_INCR_SYNCPT, UCLASS_LOAD_SYNCPT_PAYLOAD_32, UCLASS_WAIT_SYNCPT_32};
use crate::regs::*;

/// Words a channel may execute before the next one gets a turn.
const BURST_WORDS: u32 = 256;
/// Executor re-check period while nothing changes.
const IDLE_PERIOD: Duration = Duration::from_millis(5);

fn reached(value: u32, thresh: u32) -> bool {
    value.wrapping_sub(thresh) as i32 >= 0
}

#[derive(Debug, Clone, Copy)]
enum RunKind {
    Incr,
    NonIncr,
    Mask(u32),
}

/// Data words still owed to the last SETCLASS/INCR/NONINCR/MASK.
#[derive(Debug, Clone, Copy)]
struct MethodRun {
    offset: u32,
    kind: RunKind,
    remaining: u32,
}

impl MethodRun {
    fn masked(offset: u32, mask: u32) -> Option<Self> {
        Self::with_count(offset, RunKind::Mask(mask), mask.count_ones())
    }

    fn with_count(offset: u32, kind: RunKind, remaining: u32) -> Option<Self> {
        (remaining > 0).then_some(Self { offset, kind, remaining })
    }

    fn method(&self) -> u32 {
        match self.kind {
            RunKind::Mask(mask) => self.offset + mask.trailing_zeros(),
            RunKind::Incr | RunKind::NonIncr => self.offset,
        }
    }

    fn advance(mut self) -> Option<Self> {
        self.remaining -= 1;
        match &mut self.kind {
            RunKind::Mask(mask) => *mask &= *mask - 1,
            RunKind::Incr => self.offset += 1,
            RunKind::NonIncr => {}
        }
        (self.remaining > 0).then_some(self)
    }
}

#[derive(Debug, Clone, Copy)]
struct GatherRun {
    iova: Iova,
    remaining: u32,
}

/// Command processor state of one channel.
#[derive(Debug, Default)]
struct Exec {
    class_id: u32,
    run: Option<MethodRun>,
    /// GATHER seen; its address word comes next.
    gather_words: Option<u32>,
    gather: Option<GatherRun>,
    payload: u32,
    /// Fetch fault; the channel is dead until torn down.
    dead: bool,
}

#[derive(Debug)]
struct SimChannel {
    dmastart: Iova,
    dmaput: Iova,
    dmaget: Iova,
    dmaend: Iova,
    dmactrl: DmaCtrl,
    exec: Exec,
}

impl Default for SimChannel {
    fn default() -> Self {
        Self {
            dmastart: 0,
            dmaput: 0,
            dmaget: 0,
            dmaend: 0,
            dmactrl: DmaCtrl::DMASTOP,
            exec: Exec::default(),
        }
    }
}

struct SyncRegs {
    syncpt: Vec<u32>,
    thresh: Vec<u32>,
    int_enable: Vec<u32>,
    int_status: Vec<u32>,
    mlock_owner: Vec<u32>,
    cmdproc_stop: u32,
    module_reset_status: u32,
}

impl SyncRegs {
    fn incr(&mut self, id: SyncptId) {
        if let Some(v) = self.syncpt.get_mut(id as usize) {
            *v = v.wrapping_add(1);
        }
    }

    fn value(&self, id: SyncptId) -> u32 {
        self.syncpt.get(id as usize).copied().unwrap_or(0)
    }

    /// Latch status bits for enabled thresholds that have been reached.
    fn latch_interrupts(&mut self) -> bool {
        for id in 0..self.syncpt.len() {
            let (w, b) = (id / 32, 1u32 << (id % 32));
            if self.int_enable[w] & b != 0 && reached(self.syncpt[id], self.thresh[id]) {
                self.int_status[w] |= b;
            }
        }
        self.int_status.iter().any(|&s| s != 0)
    }
}

enum Outcome {
    Done,
    Blocked,
    Jump(Iova),
}

struct SimState {
    sync: SyncRegs,
    channels: Vec<SimChannel>,
    stalled: HashSet<u32>,
    reset_fails: bool,
    dirty: bool,
    shutdown: bool,
}

struct SimCore {
    info: ChipInfo,
    pool: Arc<DmaPool>,
    state: Mutex<SimState>,
    wake: Condvar,
    handler: Mutex<Option<IrqHandler>>,
}

/// Host1x hardware model.
pub struct SimHost1x {
    core: Arc<SimCore>,
    executor: Mutex<Option<JoinHandle<()>>>,
}

impl SimHost1x {
    pub fn new(chip: ChipGeneration, pool: Arc<DmaPool>) -> Arc<Self> {
        let info = match chip {
            ChipGeneration::Host1x01 => HOST1X01_INFO,
            ChipGeneration::Host1x04 => HOST1X04_INFO,
        };
        let words = info.bitmap_words() as usize;
        let core = Arc::new(SimCore {
            info,
            pool,
            state: Mutex::new(SimState {
                sync: SyncRegs {
                    syncpt: vec![0; info.nb_pts as usize],
                    thresh: vec![0; info.nb_pts as usize],
                    int_enable: vec![0; words],
                    int_status: vec![0; words],
                    mlock_owner: vec![0; info.nb_mlocks as usize],
                    cmdproc_stop: 0,
                    module_reset_status: 0,
                },
                channels: (0..info.nb_channels).map(|_| SimChannel::default()).collect(),
                stalled: HashSet::new(),
                reset_fails: false,
                dirty: false,
                shutdown: false,
            }),
            wake: Condvar::new(),
            handler: Mutex::new(None),
        });

        let worker_core = core.clone();
        let executor = std::thread::Builder::new()
            .name("host1x-sim".into())
            .spawn(move || worker_core.run());
        let executor = match executor {
            Ok(h) => Some(h),
            Err(e) => {
                log::error!("sim: failed to spawn executor: {}", e);
                None
            }
        };
        log::debug!("sim: {} with {} channels", info.name, info.nb_channels);
        Arc::new(Self { core, executor: Mutex::new(executor) })
    }

    pub fn info(&self) -> &ChipInfo {
        &self.core.info
    }

    pub fn syncpt_value(&self, id: SyncptId) -> u32 {
        self.core.state.lock().sync.value(id)
    }

    pub fn set_syncpt_value(&self, id: SyncptId, value: u32) {
        let mut st = self.core.state.lock();
        if let Some(v) = st.sync.syncpt.get_mut(id as usize) {
            *v = value;
        }
        self.core.touch(&mut st);
    }

    pub fn dma_get(&self, ch: ChannelId) -> Iova {
        self.core.state.lock().channels.get(ch as usize).map_or(0, |c| c.dmaget)
    }

    /// Make every method sent to `class_id` block until cleared.
    pub fn set_engine_stalled(&self, class_id: u32, stalled: bool) {
        let mut st = self.core.state.lock();
        if stalled {
            st.stalled.insert(class_id);
        } else {
            st.stalled.remove(&class_id);
        }
        self.core.touch(&mut st);
    }

    pub fn set_module_reset_fails(&self, fails: bool) {
        self.core.state.lock().reset_fails = fails;
    }

    /// Stop the executor thread.
    pub fn shutdown(&self) {
        {
            let mut st = self.core.state.lock();
            st.shutdown = true;
            self.core.touch(&mut st);
        }
        if let Some(h) = self.executor.lock().take() {
            if h.thread().id() == std::thread::current().id() {
                return;
            }
            if h.join().is_err() {
                log::error!("sim: executor panicked");
            }
        }
    }
}

impl Drop for SimHost1x {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl RegisterAccess for SimHost1x {
    fn read(&self, reg: u32) -> u32 {
        self.core.read(reg)
    }

    fn write(&self, reg: u32, val: u32) {
        self.core.write(reg, val)
    }
}

impl IrqLine for SimHost1x {
    fn request(&self, handler: IrqHandler) {
        *self.core.handler.lock() = Some(handler);
        let mut st = self.core.state.lock();
        self.core.touch(&mut st);
    }

    fn free(&self) {
        *self.core.handler.lock() = None;
    }
}

enum Block {
    Sync(u32),
    Channel(usize, u32),
    Unmapped,
}

impl SimCore {
    fn touch(&self, st: &mut SimState) {
        st.dirty = true;
        self.wake.notify_all();
    }

    fn decode(&self, reg: u32) -> Block {
        let info = &self.info;
        if reg >= info.sync_base && reg < info.sync_base + SYNC_BLOCK_SIZE {
            return Block::Sync(reg - info.sync_base);
        }
        if reg >= info.channel_base {
            let rel = reg - info.channel_base;
            let ch = (rel / info.channel_stride) as usize;
            if ch < info.nb_channels as usize {
                return Block::Channel(ch, rel % info.channel_stride);
            }
        }
        Block::Unmapped
    }

    fn read(&self, reg: u32) -> u32 {
        let mut st = self.state.lock();
        match self.decode(reg) {
            Block::Sync(off) => self.sync_read(&mut st, off),
            Block::Channel(ch, off) => {
                let c = &st.channels[ch];
                match off {
                    CHANNEL_DMASTART => c.dmastart,
                    CHANNEL_DMAPUT => c.dmaput,
                    CHANNEL_DMAGET => c.dmaget,
                    CHANNEL_DMAEND => c.dmaend,
                    CHANNEL_DMACTRL => c.dmactrl.bits(),
                    _ => 0,
                }
            }
            Block::Unmapped => {
                log::warn!("sim: read of unmapped register 0x{:05X}", reg);
                0
            }
        }
    }

    fn sync_read(&self, st: &mut SimState, off: u32) -> u32 {
        let sync = &mut st.sync;
        let words = self.info.bitmap_words();
        let nb_pts = self.info.nb_pts;
        let nb_mlocks = self.info.nb_mlocks;
        match off {
            o if (SYNC_SYNCPT_INT_STATUS..SYNC_SYNCPT_INT_STATUS + words * 4).contains(&o) => {
                sync.int_status[((o - SYNC_SYNCPT_INT_STATUS) / 4) as usize]
            }
            o if (SYNC_SYNCPT_INT_ENABLE..SYNC_SYNCPT_INT_ENABLE + words * 4).contains(&o) => {
                sync.int_enable[((o - SYNC_SYNCPT_INT_ENABLE) / 4) as usize]
            }
            SYNC_CMDPROC_STOP => sync.cmdproc_stop,
            SYNC_MODULE_RESET_STATUS => sync.module_reset_status,
            o if (SYNC_MLOCK..SYNC_MLOCK + nb_mlocks * 4).contains(&o) => {
                let owner = &mut sync.mlock_owner[((o - SYNC_MLOCK) / 4) as usize];
                if *owner == 0 {
                    *owner = MlockOwner::CPU_OWNS.bits();
                    0
                } else {
                    1
                }
            }
            o if (SYNC_MLOCK_OWNER..SYNC_MLOCK_OWNER + nb_mlocks * 4).contains(&o) => {
                sync.mlock_owner[((o - SYNC_MLOCK_OWNER) / 4) as usize]
            }
            o if (SYNC_SYNCPT..SYNC_SYNCPT + nb_pts * 4).contains(&o) => {
                sync.syncpt[((o - SYNC_SYNCPT) / 4) as usize]
            }
            o if (SYNC_SYNCPT_INT_THRESH..SYNC_SYNCPT_INT_THRESH + nb_pts * 4).contains(&o) => {
                sync.thresh[((o - SYNC_SYNCPT_INT_THRESH) / 4) as usize]
            }
            _ => 0,
        }
    }

    fn write(&self, reg: u32, val: u32) {
        let mut st = self.state.lock();
        match self.decode(reg) {
            Block::Sync(off) => self.sync_write(&mut st, off, val),
            Block::Channel(ch, off) => {
                let c = &mut st.channels[ch];
                match off {
                    CHANNEL_DMASTART => c.dmastart = val,
                    CHANNEL_DMAPUT => c.dmaput = val,
                    CHANNEL_DMAEND => c.dmaend = val,
                    CHANNEL_DMAGET if c.dmactrl.contains(DmaCtrl::DMAGETRST) => c.dmaget = val,
                    CHANNEL_DMAGET => log::warn!("sim: ch{} DMAGET written outside reset", ch),
                    CHANNEL_DMACTRL => {
                        let old = c.dmactrl;
                        let new = DmaCtrl::from_bits_truncate(val);
                        if new.contains(DmaCtrl::DMAGETRST) {
                            c.exec = Exec::default();
                        } else if old.contains(DmaCtrl::DMAGETRST | DmaCtrl::DMAINITGET) {
                            c.dmaget = c.dmastart;
                        }
                        c.dmactrl = new;
                    }
                    _ => {}
                }
            }
            Block::Unmapped => log::warn!("sim: write of unmapped register 0x{:05X}", reg),
        }
        self.touch(&mut st);
    }

    fn sync_write(&self, st: &mut SimState, off: u32, val: u32) {
        let words = self.info.bitmap_words();
        let nb_pts = self.info.nb_pts;
        let nb_mlocks = self.info.nb_mlocks;
        let word = |base: u32| ((off - base) / 4) as usize;
        match off {
            o if (SYNC_SYNCPT_INT_STATUS..SYNC_SYNCPT_INT_STATUS + words * 4).contains(&o) => {
                st.sync.int_status[word(SYNC_SYNCPT_INT_STATUS)] &= !val;
            }
            o if (SYNC_SYNCPT_INT_DISABLE..SYNC_SYNCPT_INT_DISABLE + words * 4).contains(&o) => {
                st.sync.int_enable[word(SYNC_SYNCPT_INT_DISABLE)] &= !val;
            }
            o if (SYNC_SYNCPT_INT_ENABLE..SYNC_SYNCPT_INT_ENABLE + words * 4).contains(&o) => {
                st.sync.int_enable[word(SYNC_SYNCPT_INT_ENABLE)] |= val;
            }
            SYNC_CMDPROC_STOP => st.sync.cmdproc_stop = val,
            SYNC_CH_TEARDOWN => {
                for (ch, c) in st.channels.iter_mut().enumerate() {
                    if val & (1 << (ch % 32)) != 0 {
                        log::debug!("sim: ch{} teardown", ch);
                        c.exec = Exec::default();
                    }
                }
            }
            SYNC_MODULE_RESET => {
                st.sync.module_reset_status = st.reset_fails as u32;
                log::debug!("sim: module reset of class 0x{:X}", val);
            }
            o if (SYNC_MLOCK..SYNC_MLOCK + nb_mlocks * 4).contains(&o) => {
                if val == 0 {
                    st.sync.mlock_owner[word(SYNC_MLOCK)] = 0;
                }
            }
            o if (SYNC_SYNCPT_CPU_INCR..SYNC_SYNCPT_CPU_INCR + words * 4).contains(&o) => {
                let base = word(SYNC_SYNCPT_CPU_INCR) as u32 * 32;
                let mut bits = val;
                while bits != 0 {
                    st.sync.incr(base + bits.trailing_zeros());
                    bits &= bits - 1;
                }
            }
            o if (SYNC_SYNCPT..SYNC_SYNCPT + nb_pts * 4).contains(&o) => {
                st.sync.syncpt[word(SYNC_SYNCPT)] = val;
            }
            o if (SYNC_SYNCPT_INT_THRESH..SYNC_SYNCPT_INT_THRESH + nb_pts * 4).contains(&o) => {
                st.sync.thresh[word(SYNC_SYNCPT_INT_THRESH)] = val;
            }
            _ => {}
        }
    }

    // ── Executor ────────────────────────────────────────────────────────────

    fn run(&self) {
        loop {
            let mut st = self.state.lock();
            if st.shutdown {
                break;
            }
            st.dirty = false;

            let mut progressed = false;
            for ch in 0..st.channels.len() {
                for _ in 0..BURST_WORDS {
                    if !self.step(&mut st, ch) {
                        break;
                    }
                    progressed = true;
                }
            }

            let pending = st.sync.latch_interrupts();
            if pending {
                let handler = self.handler.lock().clone();
                if let Some(handler) = handler {
                    drop(st);
                    handler();
                    st = self.state.lock();
                }
            }

            if !progressed && !st.dirty && !st.shutdown {
                self.wake.wait_for(&mut st, IDLE_PERIOD);
            }
        }
        log::debug!("sim: executor stopped");
    }

    fn runnable(st: &SimState, ch: usize) -> bool {
        let c = &st.channels[ch];
        !c.exec.dead
            && !c.dmactrl.intersects(DmaCtrl::DMASTOP | DmaCtrl::DMAGETRST)
            && st.sync.cmdproc_stop & (1 << (ch % 32)) == 0
    }

    /// Execute one word on channel `ch`. Returns false if it could not.
    fn step(&self, st: &mut SimState, ch: usize) -> bool {
        if !Self::runnable(st, ch) {
            return false;
        }
        let SimState { sync, channels, stalled, .. } = st;
        let c = &mut channels[ch];

        let from_gather = c.exec.gather.is_some();
        let addr = match c.exec.gather {
            Some(g) => g.iova,
            None if c.dmaget == c.dmaput => return false,
            None => c.dmaget,
        };
        if !from_gather && (addr < c.dmastart || addr >= c.dmaend) {
            log::error!("sim: ch{} DMAGET 0x{:08X} outside its window", ch, addr);
            c.exec.dead = true;
            return false;
        }
        let word = match self.pool.read_word_iova(addr) {
            Ok(w) => w,
            Err(e) => {
                log::error!("sim: ch{} fetch fault at 0x{:08X}: {}", ch, addr, e);
                c.exec.dead = true;
                return false;
            }
        };

        let outcome = Self::exec(ch as ChannelId, &mut c.exec, sync, stalled, word, from_gather);
        let jump = match outcome {
            Outcome::Blocked => return false,
            Outcome::Done => None,
            Outcome::Jump(to) => Some(to),
        };

        if from_gather {
            if let Some(g) = c.exec.gather.as_mut() {
                g.iova += 4;
                g.remaining -= 1;
                if g.remaining == 0 {
                    c.exec.gather = None;
                }
            }
        } else {
            c.dmaget = match jump {
                Some(to) => to,
                None => addr + 4,
            };
        }
        true
    }

    fn exec(
        ch: ChannelId,
        ex: &mut Exec,
        sync: &mut SyncRegs,
        stalled: &HashSet<u32>,
        word: u32,
        from_gather: bool,
    ) -> Outcome {
        if let Some(words) = ex.gather_words.take() {
            if words > 0 {
                ex.gather = Some(GatherRun { iova: word, remaining: words });
            }
            return Outcome::Done;
        }

        if let Some(run) = ex.run {
            let method = run.method();
            if !Self::method(ex, sync, stalled, method, word) {
                return Outcome::Blocked;
            }
            ex.run = run.advance();
            return Outcome::Done;
        }

        match Opcode::decode(word) {
            Opcode::SetClass { class_id, offset, mask } => {
                ex.class_id = class_id;
                ex.run = MethodRun::masked(offset, mask);
            }
            Opcode::Incr { offset, count } => ex.run = MethodRun::with_count(offset, RunKind::Incr, count),
            Opcode::NonIncr { offset, count } => {
                ex.run = MethodRun::with_count(offset, RunKind::NonIncr, count)
            }
            Opcode::Mask { offset, mask } => ex.run = MethodRun::masked(offset, mask),
            Opcode::Imm { offset, value } => {
                if !Self::method(ex, sync, stalled, offset, value) {
                    return Outcome::Blocked;
                }
            }
            Opcode::Restart { address } if !from_gather => return Outcome::Jump(address),
            Opcode::Gather { count, .. } if !from_gather => ex.gather_words = Some(count),
            Opcode::AcquireMlock { id } => {
                let Some(owner) = sync.mlock_owner.get_mut(id as usize) else {
                    log::warn!("sim: ch{} acquire of bad mlock {}", ch, id);
                    return Outcome::Done;
                };
                let mine = MlockOwner::CH_OWNS.bits() | (ch << MLOCK_OWNER_CHID_SHIFT);
                if *owner != 0 && *owner != mine {
                    return Outcome::Blocked;
                }
                *owner = mine;
            }
            Opcode::ReleaseMlock { id } => {
                let mine = MlockOwner::CH_OWNS.bits() | (ch << MLOCK_OWNER_CHID_SHIFT);
                if let Some(owner) = sync.mlock_owner.get_mut(id as usize) {
                    if *owner == mine {
                        *owner = 0;
                    }
                }
            }
            op => log::warn!("sim: ch{} ignoring {:?}", ch, op),
        }
        Outcome::Done
    }

    /// One method write to the current class. Returns false if it blocks.
    fn method(ex: &mut Exec, sync: &mut SyncRegs, stalled: &HashSet<u32>, method: u32, data: u32) -> bool {
        if stalled.contains(&ex.class_id) {
            return false;
        }
        if method == UCLASS_INCR_SYNCPT {
            sync.incr(data & 0xff);
            return true;
        }
        if ex.class_id == HOST1X_CLASS_ID {
            match method {
                UCLASS_LOAD_SYNCPT_PAYLOAD_32 => ex.payload = data,
                UCLASS_WAIT_SYNCPT_32 => return reached(sync.value(data & 0xff), ex.payload),
                _ => {}
            }
        }
        true
    }
}
