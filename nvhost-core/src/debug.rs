// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! State dumps logged on timeouts and stuck waits.

use nvhost_common::ChannelId;

use crate::backend::ChipBackend;
use crate::cdma::SyncEntry;
use crate::memory::DmaPool;
use crate::opcodes::Opcode;
use crate::syncpoint::SyncpointRegistry;

/// Gather words shown per gather.
const MAX_DUMP_WORDS: u32 = 64;

pub fn channel_lines(backend: &dyn ChipBackend, ch: ChannelId) -> Vec<String> {
    let get = backend.cdma_get(ch);
    let put = backend.cdma_put(ch);
    vec![format!(
        "ch{} ({}): DMAGET 0x{:08X} DMAPUT 0x{:08X}{}",
        ch,
        backend.name(),
        get,
        put,
        if get == put { " idle" } else { "" }
    )]
}

pub fn job_lines(pool: &DmaPool, entry: &SyncEntry) -> Vec<String> {
    let mut lines = vec![format!(
        "job {} client {}: {} slots at 0x{:X}, fences [{}]",
        entry.seq,
        entry.client,
        entry.num_slots,
        entry.first_get,
        entry.fences.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
    )];
    for (i, g) in entry.job.gathers().iter().enumerate() {
        lines.push(format!(
            "  gather {}: handle {} +0x{:X}, {} words, class 0x{:X}",
            i, g.mem, g.offset, g.words, g.class_id
        ));
        let shown = g.words.min(MAX_DUMP_WORDS);
        match pool.read(g.mem, g.offset, shown) {
            Ok(words) => {
                for (j, w) in words.iter().enumerate() {
                    lines.push(format!("    {:4}: {:08X} {:?}", j, w, Opcode::decode(*w)));
                }
                if shown < g.words {
                    lines.push(format!("    ... {} more words", g.words - shown));
                }
            }
            Err(e) => lines.push(format!("    unreadable: {}", e)),
        }
    }
    lines
}

pub fn syncpt_lines(registry: &SyncpointRegistry) -> Vec<String> {
    registry
        .snapshot()
        .into_iter()
        .map(|s| {
            format!(
                "syncpt {} ({}): min {} max {}{}",
                s.id,
                s.name,
                s.min,
                s.max,
                if s.client_managed { " client managed" } else { "" }
            )
        })
        .collect()
}

pub fn dump_channel(backend: &dyn ChipBackend, ch: ChannelId) {
    for line in channel_lines(backend, ch) {
        log::info!("{}", line);
    }
}

pub fn dump_job(pool: &DmaPool, entry: &SyncEntry) {
    for line in job_lines(pool, entry) {
        log::info!("{}", line);
    }
}

pub fn dump_syncpts(registry: &SyncpointRegistry) {
    for line in syncpt_lines(registry) {
        log::info!("{}", line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend;
    use crate::job::{Job, JobCompletion};
    use crate::opcodes;
    use crate::sim::SimHost1x;
    use nvhost_common::settings::ChipGeneration;
    use nvhost_common::Fence;
    use std::sync::Arc;

    #[test]
    fn test_job_lines_decode_gather() {
        let pool = DmaPool::new();
        let mem = pool.alloc(2).unwrap();
        pool.write(mem, 0, &[opcodes::setclass(0x5d, 0, 0), opcodes::NOOP]).unwrap();
        let mut job = Job::new(7);
        job.add_syncpt(3, 1);
        job.add_gather(mem, 0, 2, 0x5d);
        let entry = SyncEntry::new(job, vec![Fence::new(3, 2)], None, JobCompletion::new());

        let lines = job_lines(&pool, &entry);
        assert_eq!(lines.len(), 4);
        assert!(lines[0].contains("client 7"));
        assert!(lines[0].contains("syncpt 3@2"), "{}", lines[0]);
        assert!(lines[2].contains("SetClass"));
    }

    #[test]
    fn test_syncpt_lines_list_assigned() {
        let pool = Arc::new(DmaPool::new());
        let sim = SimHost1x::new(ChipGeneration::Host1x01, pool);
        let sp = SyncpointRegistry::new(backend::create(ChipGeneration::Host1x01, sim.clone()));
        let id = sp.alloc_host_managed("vic").unwrap();
        sp.incr_max(id, 2).unwrap();

        let lines = syncpt_lines(&sp);
        assert_eq!(lines[0], "syncpt 0 (host1x): min 0 max 0");
        assert_eq!(lines[1..], [format!("syncpt {} (vic): min 0 max 2", id)]);
        assert!(channel_lines(sp.backend().as_ref(), 0)[0].contains("idle"));
    }
}
