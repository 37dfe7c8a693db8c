// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! DMA memory pool.
//!
//! Handle-based buffer allocator standing in for nvmap. Every buffer owns a
//! page-aligned range of a flat 32-bit IOVA space starting at [`IOVA_BASE`].
//! Offsets and sizes on the handle API are in bytes and must be word aligned.
//!
//! Pinning is refcounted; a buffer cannot be freed while pinned, and the
//! device side (`read_iova` / `write_iova`) only reaches pinned buffers.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use nvhost_common::{align_up, Host1xError, Host1xResult, Iova, PAGE_SIZE};

/// First IOVA handed out by the pool.
pub const IOVA_BASE: Iova = 0x1000_0000;

pub type MemHandle = u32;

/// One allocation.
pub struct DmaBuffer {
    pub handle: MemHandle,
    pub iova: Iova,
    data: RwLock<Vec<u32>>,
    pins: AtomicU32,
}

impl DmaBuffer {
    pub fn size_bytes(&self) -> u32 {
        self.data.read().len() as u32 * 4
    }

    pub fn is_pinned(&self) -> bool {
        self.pins.load(Ordering::Acquire) > 0
    }

    fn range(&self, offset: u32, words: u32) -> Host1xResult<std::ops::Range<usize>> {
        let len = self.data.read().len() as u64;
        let bad = Host1xError::InvalidRange { handle: self.handle, offset, words };
        if offset % 4 != 0 {
            return Err(bad);
        }
        let start = (offset / 4) as u64;
        if start + words as u64 > len {
            return Err(bad);
        }
        Ok(start as usize..(start + words as u64) as usize)
    }
}

struct PoolInner {
    buffers: HashMap<MemHandle, Arc<DmaBuffer>>,
    by_iova: BTreeMap<Iova, MemHandle>,
    next_handle: MemHandle,
    next_iova: u64,
}

/// Handle allocator with an IOVA view for the hardware.
pub struct DmaPool {
    inner: RwLock<PoolInner>,
}

impl DmaPool {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(PoolInner {
                buffers: HashMap::new(),
                by_iova: BTreeMap::new(),
                next_handle: 1,
                next_iova: IOVA_BASE as u64,
            }),
        }
    }

    /// Allocate a zeroed buffer of `words` 32-bit words.
    pub fn alloc(&self, words: u32) -> Host1xResult<MemHandle> {
        if words == 0 {
            return Err(Host1xError::InvalidArgument("zero sized allocation"));
        }
        let bytes = words
            .checked_mul(4)
            .ok_or(Host1xError::InvalidArgument("allocation too large"))?;

        let mut inner = self.inner.write();
        let span = align_up(bytes, PAGE_SIZE) as u64;
        if inner.next_iova + span > u32::MAX as u64 + 1 {
            return Err(Host1xError::InvalidArgument("iova space exhausted"));
        }
        let iova = inner.next_iova as Iova;
        inner.next_iova += span;

        let handle = inner.next_handle;
        inner.next_handle += 1;

        let buf = Arc::new(DmaBuffer {
            handle,
            iova,
            data: RwLock::new(vec![0; words as usize]),
            pins: AtomicU32::new(0),
        });
        inner.buffers.insert(handle, buf);
        inner.by_iova.insert(iova, handle);

        log::debug!("dma_pool: alloc handle={} words={} iova=0x{:08X}", handle, words, iova);
        Ok(handle)
    }

    pub fn get(&self, handle: MemHandle) -> Host1xResult<Arc<DmaBuffer>> {
        self.inner
            .read()
            .buffers
            .get(&handle)
            .cloned()
            .ok_or(Host1xError::InvalidHandle(handle))
    }

    /// Free a buffer. Pinned buffers are refused.
    pub fn free(&self, handle: MemHandle) -> Host1xResult<()> {
        let mut inner = self.inner.write();
        let buf = inner.buffers.get(&handle).ok_or(Host1xError::InvalidHandle(handle))?;
        if buf.is_pinned() {
            return Err(Host1xError::HandlePinned(handle));
        }
        let iova = buf.iova;
        inner.buffers.remove(&handle);
        inner.by_iova.remove(&iova);
        log::debug!("dma_pool: free handle={}", handle);
        Ok(())
    }

    /// Check that `words` words at byte `offset` lie inside `handle`.
    pub fn check_range(&self, handle: MemHandle, offset: u32, words: u32) -> Host1xResult<()> {
        self.get(handle)?.range(offset, words).map(|_| ())
    }

    pub fn write(&self, handle: MemHandle, offset: u32, words: &[u32]) -> Host1xResult<()> {
        let buf = self.get(handle)?;
        let range = buf.range(offset, words.len() as u32)?;
        buf.data.write()[range].copy_from_slice(words);
        Ok(())
    }

    pub fn read(&self, handle: MemHandle, offset: u32, words: u32) -> Host1xResult<Vec<u32>> {
        let buf = self.get(handle)?;
        let range = buf.range(offset, words)?;
        let data = buf.data.read();
        Ok(data[range].to_vec())
    }

    /// Pin for device access and return the buffer's IOVA.
    pub fn pin(&self, handle: MemHandle) -> Host1xResult<Iova> {
        let buf = self.get(handle)?;
        let pins = buf.pins.fetch_add(1, Ordering::AcqRel) + 1;
        log::trace!("dma_pool: pin handle={} count={}", handle, pins);
        Ok(buf.iova)
    }

    pub fn unpin(&self, handle: MemHandle) -> Host1xResult<()> {
        let buf = self.get(handle)?;
        let prev = buf
            .pins
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |p| p.checked_sub(1));
        match prev {
            Ok(p) => {
                log::trace!("dma_pool: unpin handle={} count={}", handle, p - 1);
                Ok(())
            }
            Err(_) => {
                log::warn!("dma_pool: unpin of unpinned handle={}", handle);
                Err(Host1xError::InvalidHandle(handle))
            }
        }
    }

    fn lookup_iova(&self, iova: Iova) -> Host1xResult<(Arc<DmaBuffer>, u32)> {
        let inner = self.inner.read();
        let miss = Host1xError::InvalidRange { handle: 0, offset: iova, words: 0 };
        let (&base, &handle) = inner.by_iova.range(..=iova).next_back().ok_or(miss.clone())?;
        let buf = inner.buffers.get(&handle).cloned().ok_or(miss.clone())?;
        if !buf.is_pinned() {
            return Err(miss);
        }
        Ok((buf, iova - base))
    }

    /// Device-side read of `words` words at `iova`.
    pub fn read_iova(&self, iova: Iova, words: u32) -> Host1xResult<Vec<u32>> {
        let (buf, offset) = self.lookup_iova(iova)?;
        let range = buf.range(offset, words)?;
        let data = buf.data.read();
        Ok(data[range].to_vec())
    }

    pub fn read_word_iova(&self, iova: Iova) -> Host1xResult<u32> {
        let (buf, offset) = self.lookup_iova(iova)?;
        let range = buf.range(offset, 1)?;
        let word = buf.data.read()[range.start];
        Ok(word)
    }

    /// Device-side write at `iova`.
    pub fn write_iova(&self, iova: Iova, words: &[u32]) -> Host1xResult<()> {
        let (buf, offset) = self.lookup_iova(iova)?;
        let range = buf.range(offset, words.len() as u32)?;
        buf.data.write()[range].copy_from_slice(words);
        Ok(())
    }

    pub fn num_buffers(&self) -> usize {
        self.inner.read().buffers.len()
    }
}

impl Default for DmaPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_is_page_aligned() {
        let pool = DmaPool::new();
        let a = pool.alloc(3).unwrap();
        let b = pool.alloc(2048).unwrap();
        let c = pool.alloc(1).unwrap();
        assert_eq!(pool.get(a).unwrap().iova, IOVA_BASE);
        assert_eq!(pool.get(b).unwrap().iova, IOVA_BASE + PAGE_SIZE);
        assert_eq!(pool.get(c).unwrap().iova, IOVA_BASE + 3 * PAGE_SIZE);
    }

    #[test]
    fn test_read_write_bounds() {
        let pool = DmaPool::new();
        let h = pool.alloc(4).unwrap();
        pool.write(h, 8, &[0xaa, 0xbb]).unwrap();
        assert_eq!(pool.read(h, 0, 4).unwrap(), vec![0, 0, 0xaa, 0xbb]);
        assert_eq!(
            pool.write(h, 12, &[1, 2]),
            Err(Host1xError::InvalidRange { handle: h, offset: 12, words: 2 })
        );
        assert!(pool.read(h, 2, 1).is_err());
        assert_eq!(pool.read(99, 0, 1), Err(Host1xError::InvalidHandle(99)));
        assert!(pool.check_range(h, 12, 1).is_ok());
        assert!(pool.check_range(h, 16, 1).is_err());
        assert!(pool.check_range(h, u32::MAX - 3, 1).is_err());
    }

    #[test]
    fn test_pin_refcount_blocks_free() {
        let pool = DmaPool::new();
        let h = pool.alloc(16).unwrap();
        pool.pin(h).unwrap();
        pool.pin(h).unwrap();
        pool.unpin(h).unwrap();
        assert_eq!(pool.free(h), Err(Host1xError::HandlePinned(h)));
        pool.unpin(h).unwrap();
        assert!(pool.unpin(h).is_err());
        pool.free(h).unwrap();
        assert_eq!(pool.num_buffers(), 0);
    }

    #[test]
    fn test_iova_access_requires_pin() {
        let pool = DmaPool::new();
        let h = pool.alloc(8).unwrap();
        pool.write(h, 4, &[7]).unwrap();
        let iova = pool.get(h).unwrap().iova;
        assert!(pool.read_word_iova(iova + 4).is_err());

        assert_eq!(pool.pin(h).unwrap(), iova);
        assert_eq!(pool.read_word_iova(iova + 4).unwrap(), 7);
        pool.write_iova(iova + 8, &[1, 2]).unwrap();
        assert_eq!(pool.read(h, 8, 2).unwrap(), vec![1, 2]);
        assert_eq!(pool.read_iova(iova, 3).unwrap(), vec![0, 7, 1]);
        // Past the end of the buffer, inside its page.
        assert!(pool.read_word_iova(iova + 64).is_err());
    }
}
