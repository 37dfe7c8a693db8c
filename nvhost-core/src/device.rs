// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Host1x device context.
//!
//! Owns the syncpoint registry, interrupt delivery and channel pool of one
//! Host1x instance. The device nodes and the CLI go through this type;
//! nothing else builds the pieces by hand.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nvhost_common::settings::{Host1xSettings, IntrMode};
use nvhost_common::{ChannelId, ClientId, Host1xResult, SyncptId};

use crate::backend::{self, ChipBackend};
use crate::channel::{Channel, ChannelPool, EngineDesc};
use crate::intr::Intr;
use crate::memory::DmaPool;
use crate::regs::{ChipInfo, IrqLine, RegisterAccess};
use crate::sim::SimHost1x;
use crate::syncpoint::SyncpointRegistry;

/// Hardware resources handed to [`Host1xDevice::probe`].
#[derive(Clone)]
pub struct Platform {
    pub regs: Arc<dyn RegisterAccess>,
    /// Syncpoint threshold interrupt line. Without one, syncpoints are polled.
    pub irq: Option<Arc<dyn IrqLine>>,
    pub memory: Arc<DmaPool>,
}

impl Platform {
    /// A platform backed by the hardware model.
    pub fn simulated(sim: &Arc<SimHost1x>, memory: Arc<DmaPool>) -> Self {
        Self {
            regs: sim.clone(),
            irq: Some(sim.clone()),
            memory,
        }
    }
}

pub struct Host1xDevice {
    backend: Arc<dyn ChipBackend>,
    syncpt: Arc<SyncpointRegistry>,
    intr: Arc<Intr>,
    memory: Arc<DmaPool>,
    channels: ChannelPool,
    removed: AtomicBool,
}

impl Host1xDevice {
    pub fn probe(platform: Platform, settings: &Host1xSettings) -> Host1xResult<Self> {
        let backend = backend::create(settings.chip, platform.regs.clone());
        let info = *backend.info();
        log::info!(
            "host1x: probing {} ({} channels, {} syncpoints, {} mlocks)",
            backend.name(),
            info.nb_channels,
            info.nb_pts,
            info.nb_mlocks
        );

        let syncpt = Arc::new(SyncpointRegistry::new(backend.clone()));
        syncpt.reset_from_hw();

        let intr = Intr::new(syncpt.clone(), settings);
        match (settings.intr_mode, platform.irq) {
            (IntrMode::Interrupt, Some(line)) => intr.start_irq(line),
            (IntrMode::Interrupt, None) => {
                log::warn!("host1x: no interrupt line, falling back to polling");
                intr.start_polling(settings.poll_period());
            }
            (IntrMode::Polling, _) => intr.start_polling(settings.poll_period()),
        }

        let channels = ChannelPool::new(info.nb_channels, intr.clone(), platform.memory.clone(), settings.clone());
        Ok(Self {
            backend,
            syncpt,
            intr,
            memory: platform.memory,
            channels,
            removed: AtomicBool::new(false),
        })
    }

    pub fn syncpt(&self) -> &Arc<SyncpointRegistry> {
        &self.syncpt
    }

    pub fn intr(&self) -> &Arc<Intr> {
        &self.intr
    }

    pub fn memory(&self) -> &Arc<DmaPool> {
        &self.memory
    }

    pub fn info(&self) -> &ChipInfo {
        self.backend.info()
    }

    pub fn channels(&self) -> &ChannelPool {
        &self.channels
    }

    pub fn open_channel(&self, client: ClientId, engine: &EngineDesc) -> Host1xResult<Arc<Channel>> {
        self.channels.map(client, engine)
    }

    pub fn close_channel(&self, ch: ChannelId) -> Host1xResult<()> {
        self.channels.release(ch)
    }

    /// Wait for syncpoint `id` to reach `thresh`. Returns the value observed.
    pub fn wait(&self, id: SyncptId, thresh: u32, timeout: Option<Duration>) -> Host1xResult<u32> {
        self.intr.wait_timeout(id, thresh, timeout)
    }

    /// Stop every channel and interrupt delivery. Idempotent.
    pub fn remove(&self) {
        if self.removed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.channels.shutdown();
        self.intr.stop();
        log::info!("host1x: removed");
    }
}

impl Drop for Host1xDevice {
    fn drop(&mut self) {
        self.remove();
    }
}
