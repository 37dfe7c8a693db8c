// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use nvhost_common::settings::ChipGeneration;
use nvhost_core::memory::DmaPool;
use nvhost_core::opcodes;
use nvhost_core::sim::SimHost1x;
use nvhost_core::{EngineDesc, Host1xDevice, Platform};
use nvhost_service::channel::{GET_SYNCPOINT, OUTCOME_ABORTED, OUTCOME_COMPLETED, SUBMIT, WAIT_JOB};
use nvhost_service::ctrl::{NO_TIMEOUT, SYNCPT_READ, SYNCPT_READ_MAX};
use nvhost_service::node::{from_words, to_words};
use nvhost_service::nvmap;
use nvhost_service::{NvhostNodes, CTRL_PATH, NVMAP_PATH};

/// Engines the workload can drive, one channel each.
const ENGINES: &[(&str, u32)] = &[
    ("vic", 0x5d),
    ("nvdec", 0xf0),
    ("nvenc", 0x21),
    ("nvjpg", 0xc0),
    ("tsec", 0xe0),
    ("isp", 0x32),
    ("vi", 0x30),
    ("gr2d", 0x51),
];

/// How long the workload waits for a single job before calling it unresolved.
const JOB_WAIT_MS: u32 = 10_000;

/// nvhost-sim - Host1x channel engine on a simulated device
#[derive(Parser, Debug)]
#[command(name = "nvhost-sim", version, about = "Drive a simulated Host1x with a synthetic workload")]
struct Args {
    /// Path to config file (default: ~/.config/nvhost/nvhost.ini)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Chip generation (host1x01/t124, host1x04/t186)
    #[arg(long)]
    chip: Option<String>,

    /// Channels to run, one engine each
    #[arg(long, default_value_t = 2)]
    channels: usize,

    /// Jobs submitted per channel
    #[arg(long, default_value_t = 16)]
    jobs: u32,

    /// Gathers per job
    #[arg(long, default_value_t = 2)]
    gathers: u32,

    /// Stall the engine with this class id (hex) to exercise timeout recovery
    #[arg(long, value_parser = parse_hex)]
    stall_class: Option<u32>,

    /// Default job timeout in milliseconds (0 disables the watchdog)
    #[arg(long)]
    timeout_ms: Option<u32>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn parse_hex(s: &str) -> Result<u32, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(digits, 16).map_err(|e| format!("invalid class id \"{}\": {}", s, e))
}

#[derive(Debug, Default)]
struct ChannelReport {
    engine: String,
    completed: u32,
    aborted: u32,
    refused: u32,
    unresolved: u32,
    syncpt: u32,
    min: u32,
    max: u32,
}

fn ioctl(nodes: &NvhostNodes, fd: i32, cmd: u32, words: &[u32]) -> Result<Vec<u32>, i32> {
    let mut out = Vec::new();
    match nodes.ioctl(fd, cmd, &from_words(words), &mut out) {
        0 => Ok(to_words(&out)),
        rc => Err(rc),
    }
}

/// A command buffer of `gathers` gathers, each incrementing `id` once from
/// `class`. Returns the handle and the words per gather.
fn build_cmdbuf(nodes: &NvhostNodes, nvmap: i32, class: u32, id: u32, gathers: u32) -> Result<(u32, u32)> {
    let gather = [
        opcodes::setclass(class, 0, 0),
        opcodes::nonincr(opcodes::UCLASS_INCR_SYNCPT, 1),
        opcodes::incr_syncpt(opcodes::COND_IMMEDIATE, id),
    ];
    let words: Vec<u32> = (0..gathers).flat_map(|_| gather).collect();
    let handle = ioctl(nodes, nvmap, nvmap::CREATE, &[words.len() as u32])
        .map_err(|rc| anyhow::anyhow!("nvmap create failed: {}", rc))?[0];
    let mut args = vec![handle, 0, words.len() as u32];
    args.extend(&words);
    ioctl(nodes, nvmap, nvmap::WRITE, &args).map_err(|rc| anyhow::anyhow!("nvmap write failed: {}", rc))?;
    Ok((handle, gather.len() as u32))
}

fn run_channel(nodes: Arc<NvhostNodes>, engine: EngineDesc, jobs: u32, gathers: u32) -> Result<ChannelReport> {
    let path = format!("/dev/nvhost-{}", engine.name);
    let nvmap = nodes.open(NVMAP_PATH);
    let fd = nodes.open(&path);
    let ctrl = nodes.open(CTRL_PATH);
    anyhow::ensure!(fd >= 0 && nvmap >= 0 && ctrl >= 0, "failed to open {} ({})", path, fd);

    let id = ioctl(&nodes, fd, GET_SYNCPOINT, &[]).map_err(|rc| anyhow::anyhow!("get syncpoint: {}", rc))?[0];
    let (mem, words) = build_cmdbuf(&nodes, nvmap, engine.class_id, id, gathers)?;

    let mut submit = vec![1, gathers, 0, 0, NO_TIMEOUT, 0, gathers];
    for g in 0..gathers {
        submit.extend([mem, g * words * 4, words, engine.class_id, 0, 0]);
    }

    let mut report = ChannelReport { engine: engine.name.clone(), syncpt: id, ..Default::default() };
    let mut submitted = Vec::new();
    for _ in 0..jobs {
        match ioctl(&nodes, fd, SUBMIT, &submit) {
            Ok(out) => submitted.push(out[0]),
            Err(rc) => {
                log::warn!("{}: submit refused ({})", path, rc);
                report.refused += 1;
            }
        }
    }
    for job in submitted {
        match ioctl(&nodes, fd, WAIT_JOB, &[job, JOB_WAIT_MS]).as_deref() {
            Ok([OUTCOME_COMPLETED]) => report.completed += 1,
            Ok([OUTCOME_ABORTED]) => report.aborted += 1,
            _ => report.unresolved += 1,
        }
    }

    report.min = ioctl(&nodes, ctrl, SYNCPT_READ, &[id]).map(|v| v[0]).unwrap_or(0);
    report.max = ioctl(&nodes, ctrl, SYNCPT_READ_MAX, &[id]).map(|v| v[0]).unwrap_or(0);
    nodes.close(fd);
    nodes.close(nvmap);
    nodes.close(ctrl);
    Ok(report)
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp_millis()
        .init();

    info!("nvhost-sim - Host1x channel engine");
    info!("==================================");

    let mut settings = config::load_config(args.config.as_ref());
    if let Some(chip) = &args.chip {
        settings.chip = ChipGeneration::from_str_or_default(chip);
    }
    if let Some(ms) = args.timeout_ms {
        settings.cdma_timeout_ms = ms;
    }
    anyhow::ensure!(args.gathers > 0, "--gathers must be at least 1");
    info!("Settings: {:?}", settings);

    let memory = Arc::new(DmaPool::new());
    let sim = SimHost1x::new(settings.chip, memory.clone());
    let nb_channels = sim.info().nb_channels as usize;
    anyhow::ensure!(
        args.channels <= ENGINES.len().min(nb_channels),
        "--channels is limited to {}",
        ENGINES.len().min(nb_channels)
    );
    if let Some(class) = args.stall_class {
        info!("Stalling engine class 0x{:X}", class);
        sim.set_engine_stalled(class, true);
    }

    let dev = Arc::new(
        Host1xDevice::probe(Platform::simulated(&sim, memory), &settings).context("Failed to probe host1x")?,
    );
    let engines: Vec<EngineDesc> = ENGINES[..args.channels]
        .iter()
        .map(|&(name, class)| EngineDesc::new(name, class).with_module_reset())
        .collect();
    let nodes = Arc::new(NvhostNodes::new(dev.clone(), engines.clone()));

    let workers: Vec<_> = engines
        .into_iter()
        .map(|engine| {
            let nodes = nodes.clone();
            let (jobs, gathers) = (args.jobs, args.gathers);
            thread::Builder::new()
                .name(format!("submit-{}", engine.name))
                .spawn(move || run_channel(nodes, engine, jobs, gathers))
                .context("Failed to spawn submit thread")
        })
        .collect::<Result<_>>()?;

    let mut unresolved = 0;
    for worker in workers {
        let report = worker
            .join()
            .map_err(|_| anyhow::anyhow!("submit thread panicked"))??;
        println!(
            "{:<6} completed {:>4}  aborted {:>4}  refused {:>4}  unresolved {:>4}  syncpt {:>3} min {} max {}",
            report.engine,
            report.completed,
            report.aborted,
            report.refused,
            report.unresolved,
            report.syncpt,
            report.min,
            report.max
        );
        unresolved += report.unresolved;
    }

    if let Some(class) = args.stall_class {
        sim.set_engine_stalled(class, false);
    }
    drop(nodes);
    dev.remove();

    if unresolved > 0 {
        anyhow::bail!("{} jobs left unresolved", unresolved);
    }
    info!("All jobs resolved");
    Ok(())
}
