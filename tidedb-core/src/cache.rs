//! Shared cache arena backing every memtable
//!
//! All rows of all tables are copied into one process-wide pool of fixed-size
//! blocks. At any instant the pool holds two logical generations: the active
//! one (`mem`), which accepts allocations, and at most one frozen one
//! (`imem`), which the commit pipeline is draining. Freezing is an O(1)
//! pointer swap; reclaiming a drained generation returns its blocks to a free
//! list so warm capacity is kept.
//!
//! Rows are addressed by index-typed [`RowSlot`] handles, never by pointer,
//! so ownership stays arena -> memtable with no back references.

use crate::{Result, TideError, TsKey};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Size of one arena block
pub const ARENA_BLOCK_SIZE: usize = 1024 * 1024;

/// Handle to one row stored in a cache generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowSlot {
    pub(crate) block: u32,
    pub(crate) offset: u32,
    pub(crate) len: u32,
}

impl RowSlot {
    /// Length of the row this slot addresses
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Check if the slot addresses an empty row
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

struct ArenaBlock {
    buf: Vec<u8>,
}

/// One cache generation: an append-only block list plus allocation stats
pub struct MemGeneration {
    blocks: RwLock<Vec<ArenaBlock>>,
    bytes_held: AtomicUsize,
    num_rows: AtomicUsize,
    key_first: AtomicI64,
    key_last: AtomicI64,
}

impl MemGeneration {
    fn new() -> Self {
        Self {
            blocks: RwLock::new(Vec::new()),
            bytes_held: AtomicUsize::new(0),
            num_rows: AtomicUsize::new(0),
            key_first: AtomicI64::new(i64::MAX),
            key_last: AtomicI64::new(i64::MIN),
        }
    }

    /// Smallest key allocated into this generation
    pub fn key_first(&self) -> TsKey {
        self.key_first.load(Ordering::Acquire)
    }

    /// Largest key allocated into this generation
    pub fn key_last(&self) -> TsKey {
        self.key_last.load(Ordering::Acquire)
    }

    /// Number of rows allocated into this generation
    pub fn num_rows(&self) -> usize {
        self.num_rows.load(Ordering::Acquire)
    }

    /// Check if the generation holds no rows
    pub fn is_empty(&self) -> bool {
        self.num_rows() == 0
    }

    /// Total block bytes held by this generation
    pub fn bytes_held(&self) -> usize {
        self.bytes_held.load(Ordering::Acquire)
    }

    /// Read the row behind a slot.
    ///
    /// Blocks are append-only and written rows are never moved, so the slice
    /// handed to `f` is stable for the generation's lifetime.
    pub fn with_row<R>(&self, slot: RowSlot, f: impl FnOnce(&[u8]) -> R) -> R {
        let blocks = self.blocks.read();
        let block = &blocks[slot.block as usize];
        let start = slot.offset as usize;
        f(&block.buf[start..start + slot.len as usize])
    }

    /// Copy the row behind a slot into an owned buffer
    pub fn row_to_vec(&self, slot: RowSlot) -> Vec<u8> {
        self.with_row(slot, |row| row.to_vec())
    }

    fn note_row(&self, key: TsKey) {
        self.num_rows.fetch_add(1, Ordering::AcqRel);
        self.key_first.fetch_min(key, Ordering::AcqRel);
        self.key_last.fetch_max(key, Ordering::AcqRel);
    }
}

struct CacheInner {
    max_bytes: usize,
    mem: Arc<MemGeneration>,
    imem: Option<Arc<MemGeneration>>,
    free: Vec<Vec<u8>>,
}

/// The process-wide cache arena
pub struct Cache {
    inner: Mutex<CacheInner>,
}

impl Cache {
    /// Create an arena capped at `max_bytes`
    pub fn new(max_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                max_bytes,
                mem: Arc::new(MemGeneration::new()),
                imem: None,
                free: Vec::new(),
            }),
        }
    }

    /// Change the capacity; affects the next allocation
    pub fn set_capacity(&self, max_bytes: usize) {
        self.inner.lock().max_bytes = max_bytes;
    }

    /// The active generation
    pub fn current(&self) -> Arc<MemGeneration> {
        self.inner.lock().mem.clone()
    }

    /// The frozen generation, if a commit is pending or in flight
    pub fn frozen(&self) -> Option<Arc<MemGeneration>> {
        self.inner.lock().imem.clone()
    }

    /// Total block bytes held across both generations
    pub fn bytes_used(&self) -> usize {
        let inner = self.inner.lock();
        inner.mem.bytes_held()
            + inner.imem.as_ref().map_or(0, |gen| gen.bytes_held())
    }

    /// Copy `row` into the active generation and return its slot.
    ///
    /// `reserve` extra bytes are allocated after the row for the caller's
    /// bookkeeping (the skiplist node link area); they count against the cap
    /// but are not part of the returned slot.
    pub fn allocate(&self, key: TsKey, row: &[u8], reserve: usize) -> Result<RowSlot> {
        let size = row.len() + reserve;
        let mut inner = self.inner.lock();
        let gen = inner.mem.clone();
        let held = gen.bytes_held()
            + inner.imem.as_ref().map_or(0, |g| g.bytes_held());

        let mut blocks = gen.blocks.write();
        let needs_block = blocks
            .last()
            .map_or(true, |b| b.buf.capacity() - b.buf.len() < size);
        if needs_block {
            let cap = size.max(ARENA_BLOCK_SIZE);
            if held + cap > inner.max_bytes {
                return Err(TideError::CacheFull);
            }
            let buf = if cap == ARENA_BLOCK_SIZE {
                inner.free.pop().unwrap_or_else(|| Vec::with_capacity(cap))
            } else {
                Vec::with_capacity(cap)
            };
            gen.bytes_held.fetch_add(buf.capacity(), Ordering::AcqRel);
            blocks.push(ArenaBlock { buf });
        }

        let block = (blocks.len() - 1) as u32;
        let slot_block = blocks.last_mut().expect("block just ensured");
        let offset = slot_block.buf.len();
        slot_block.buf.extend_from_slice(row);
        slot_block.buf.resize(offset + size, 0);
        drop(blocks);

        gen.note_row(key);
        Ok(RowSlot {
            block,
            offset: offset as u32,
            len: row.len() as u32,
        })
    }

    /// Seal the active generation and start a fresh one.
    ///
    /// Returns the frozen generation. Fails while an earlier frozen
    /// generation is still pending reclaim.
    pub fn freeze(&self) -> Result<Arc<MemGeneration>> {
        let mut inner = self.inner.lock();
        if inner.imem.is_some() {
            return Err(TideError::CommitInProgress);
        }
        let frozen = std::mem::replace(&mut inner.mem, Arc::new(MemGeneration::new()));
        inner.imem = Some(frozen.clone());
        Ok(frozen)
    }

    /// Discard the frozen generation, recycling its blocks into the free pool
    pub fn reclaim(&self) {
        let mut inner = self.inner.lock();
        if let Some(gen) = inner.imem.take() {
            match Arc::try_unwrap(gen) {
                Ok(gen) => {
                    for block in gen.blocks.into_inner() {
                        let mut buf = block.buf;
                        if buf.capacity() == ARENA_BLOCK_SIZE {
                            buf.clear();
                            inner.free.push(buf);
                        }
                    }
                }
                // A straggling reference keeps the generation alive; its
                // memory is released when the reference drops.
                Err(_) => {}
            }
        }
    }

    #[cfg(test)]
    fn free_blocks(&self) -> usize {
        self.inner.lock().free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_read() {
        let cache = Cache::new(4 * 1024 * 1024);
        let slot = cache.allocate(42, b"hello row", 16).unwrap();

        assert_eq!(slot.len(), 9);
        let gen = cache.current();
        gen.with_row(slot, |row| assert_eq!(row, b"hello row"));
        assert_eq!(gen.row_to_vec(slot), b"hello row");
    }

    #[test]
    fn test_key_range_tracking() {
        let cache = Cache::new(4 * 1024 * 1024);
        for key in [30, 10, 20] {
            cache.allocate(key, b"row", 0).unwrap();
        }

        let gen = cache.current();
        assert_eq!(gen.key_first(), 10);
        assert_eq!(gen.key_last(), 30);
        assert_eq!(gen.num_rows(), 3);
    }

    #[test]
    fn test_cache_full() {
        let cache = Cache::new(2 * ARENA_BLOCK_SIZE);
        let row = vec![0u8; 128 * 1024];

        let mut failed = false;
        for i in 0..64 {
            if cache.allocate(i, &row, 0).is_err() {
                failed = true;
                break;
            }
        }
        assert!(failed, "allocation should hit the cap");
        assert!(cache.bytes_used() <= 2 * ARENA_BLOCK_SIZE);
    }

    #[test]
    fn test_oversize_row_gets_dedicated_block() {
        let cache = Cache::new(16 * 1024 * 1024);
        let row = vec![7u8; ARENA_BLOCK_SIZE + 100];
        let slot = cache.allocate(1, &row, 0).unwrap();

        cache.current().with_row(slot, |r| assert_eq!(r.len(), row.len()));
    }

    #[test]
    fn test_freeze_swaps_generations() {
        let cache = Cache::new(4 * 1024 * 1024);
        let slot = cache.allocate(5, b"frozen row", 0).unwrap();

        let frozen = cache.freeze().unwrap();
        assert_eq!(frozen.num_rows(), 1);
        frozen.with_row(slot, |row| assert_eq!(row, b"frozen row"));

        // Fresh active generation is empty and a second freeze is rejected
        assert!(cache.current().is_empty());
        assert!(matches!(cache.freeze(), Err(TideError::CommitInProgress)));
    }

    #[test]
    fn test_reclaim_recycles_blocks() {
        let cache = Cache::new(4 * 1024 * 1024);
        cache.allocate(1, b"row", 0).unwrap();
        let frozen = cache.freeze().unwrap();
        let held = cache.bytes_used();
        assert!(held >= ARENA_BLOCK_SIZE);

        drop(frozen);
        cache.reclaim();
        assert_eq!(cache.bytes_used(), 0);
        assert_eq!(cache.free_blocks(), 1);

        // Next allocation draws from the pool instead of the allocator
        cache.allocate(2, b"row", 0).unwrap();
        assert_eq!(cache.free_blocks(), 0);
    }

    #[test]
    fn test_drained_capacity_is_writable_again() {
        let cache = Cache::new(2 * ARENA_BLOCK_SIZE);
        let row = vec![0u8; 512 * 1024];

        while cache.allocate(1, &row, 0).is_ok() {}
        let frozen = cache.freeze().unwrap();
        drop(frozen);
        cache.reclaim();

        assert!(cache.allocate(2, &row, 0).is_ok());
    }
}
