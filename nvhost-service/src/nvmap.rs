// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! `/dev/nvmap`: command buffer memory.
//!
//! Handles are the DMA pool's own handles, so they can be passed straight
//! to a channel submit. Each file frees what it created when closed.

use std::collections::HashSet;
use std::sync::Arc;

use nvhost_common::Host1xError;
use nvhost_core::memory::DmaPool;

use crate::node::{put_u32, put_words, Args, IoctlError, IoctlResult, NvhostNode};

pub const CREATE: u32 = 1;
pub const WRITE: u32 = 2;
pub const READ: u32 = 3;
pub const FREE: u32 = 4;

pub struct NvmapNode {
    pool: Arc<DmaPool>,
    owned: HashSet<u32>,
}

impl NvmapNode {
    pub fn new(pool: Arc<DmaPool>) -> Self {
        Self { pool, owned: HashSet::new() }
    }

    fn owned(&self, handle: u32) -> Result<u32, IoctlError> {
        if self.owned.contains(&handle) {
            Ok(handle)
        } else {
            Err(Host1xError::InvalidHandle(handle).into())
        }
    }
}

impl NvhostNode for NvmapNode {
    fn name(&self) -> &str {
        "/dev/nvmap"
    }

    fn ioctl(&mut self, nr: u32, input: &[u8], output: &mut Vec<u8>) -> IoctlResult {
        let mut args = Args::new(input);
        match nr {
            // {words} -> {handle}
            CREATE => {
                let words = args.u32()?;
                let handle = self.pool.alloc(words)?;
                self.owned.insert(handle);
                log::debug!("nvmap: create {} words -> handle {}", words, handle);
                put_u32(output, handle);
            }

            // {handle, offset, count, words...}
            WRITE => {
                let handle = self.owned(args.u32()?)?;
                let offset = args.u32()?;
                let n = args.count(1)?;
                let words = args.words(n)?;
                self.pool.write(handle, offset, &words)?;
            }

            // {handle, offset, count} -> {words...}
            READ => {
                let handle = self.owned(args.u32()?)?;
                let offset = args.u32()?;
                let n = args.u32()?;
                put_words(output, &self.pool.read(handle, offset, n)?);
            }

            // {handle}
            FREE => {
                let handle = self.owned(args.u32()?)?;
                self.pool.free(handle)?;
                self.owned.remove(&handle);
                log::debug!("nvmap: freed handle {}", handle);
            }

            _ => {
                log::warn!("nvmap: unknown ioctl {}", nr);
                return Err(IoctlError::UnknownIoctl(nr));
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        for handle in self.owned.drain() {
            if let Err(e) = self.pool.free(handle) {
                log::warn!("nvmap: handle {} not freed on close: {}", handle, e);
            }
        }
    }
}
