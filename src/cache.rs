//! Write-back block cache over a level verifier
//!
//! Entries are whole blocks keyed by block index and kept in LRU order.
//! A block being loaded is tracked in a `loading` set so that concurrent
//! requests for it wait for the first load instead of verifying it twice.
//! The table lock is not held while a block is read and verified.
//!
//! Write-backs go to the level above (through the verifier), never to this
//! cache, so holding this cache's table lock during a write-back cannot
//! deadlock: locks are always taken from the data level towards the master.

use crate::buffer_pool::{BufferPool, PooledBuffer};
use crate::config::StorageKind;
use crate::error::{IntegrityError, Result};
use crate::header::{align_down, align_up};
use crate::storage::{
    check_access_range, OperationId, QueryRangeInfo, Storage, TransactionalStorage,
};
use crate::verifier::Verifier;
use lru::LruCache;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Mutex supplied by the caller and shared by every cache of one tree
///
/// It serializes whole-cache sweeps (commit, flush, rollback, range
/// operations) against each other.
pub type SharedMutex = Arc<Mutex<()>>;

/// Cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub write_backs: u64,
    /// Entries currently cached
    pub entries: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Read,
    /// Partial update; the block must be verified first
    Modify,
    /// Every byte of the block is replaced; verification is skipped
    Overwrite,
}

struct CacheEntry {
    buffer: PooledBuffer,
    dirty: bool,
}

struct CacheState {
    entries: LruCache<u64, CacheEntry>,
    loading: HashSet<u64>,
    stats: CacheStats,
}

pub struct BlockCache {
    verifier: Arc<Verifier>,
    pool: Arc<BufferPool>,
    shared_mutex: SharedMutex,
    capacity: usize,
    block_size: u64,
    block_order: u32,
    state: Mutex<CacheState>,
    loaded: Condvar,
}

impl BlockCache {
    /// Create a cache of at most `capacity` blocks over `verifier`
    pub fn new(
        verifier: Arc<Verifier>,
        pool: Arc<BufferPool>,
        shared_mutex: SharedMutex,
        capacity: usize,
    ) -> Result<Self> {
        if capacity == 0 {
            return Err(IntegrityError::InvalidConfig(
                "cache capacity must be non-zero".to_string(),
            ));
        }

        let block_size = verifier.block_size();
        Ok(BlockCache {
            verifier,
            pool,
            shared_mutex,
            capacity,
            block_size,
            block_order: block_size.trailing_zeros(),
            state: Mutex::new(CacheState {
                entries: LruCache::unbounded(),
                loading: HashSet::new(),
                stats: CacheStats::default(),
            }),
            loaded: Condvar::new(),
        })
    }

    pub fn verifier(&self) -> &Arc<Verifier> {
        &self.verifier
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            entries: state.entries.len(),
            ..state.stats
        }
    }

    /// Drop every entry without writing anything back
    pub fn finalize(&self) {
        let _sweep = self.shared_mutex.lock();
        let mut state = self.lock_idle();
        let dirty = state.entries.iter().filter(|(_, e)| e.dirty).count();
        if dirty > 0 {
            warn!(
                "Discarding {} uncommitted blocks of layer {}",
                dirty,
                self.verifier.layer()
            );
        }
        state.entries.clear();
    }

    /// Lock the table once no block is in flight
    fn lock_idle(&self) -> MutexGuard<'_, CacheState> {
        let mut state = self.state.lock();
        while !state.loading.is_empty() {
            self.loaded.wait(&mut state);
        }
        state
    }

    /// Run `f` on the cached copy of block `index`, loading it first if needed
    fn with_block<F>(&self, index: u64, access: Access, f: F) -> Result<()>
    where
        F: FnOnce(&mut [u8]),
    {
        let mut guard = self.state.lock();
        loop {
            let state = &mut *guard;
            if let Some(entry) = state.entries.get_mut(&index) {
                f(&mut entry.buffer[..]);
                if access != Access::Read {
                    entry.dirty = true;
                }
                state.stats.hits += 1;
                return Ok(());
            }
            if !state.loading.contains(&index) {
                break;
            }
            self.loaded.wait(&mut guard);
        }
        guard.loading.insert(index);
        guard.stats.misses += 1;
        drop(guard);

        let loaded = self.load(index, access == Access::Overwrite);

        let mut state = self.state.lock();
        state.loading.remove(&index);
        self.loaded.notify_all();

        let mut buffer = loaded?;
        f(&mut buffer[..]);
        state.entries.put(
            index,
            CacheEntry {
                buffer,
                dirty: access != Access::Read,
            },
        );
        self.enforce_capacity(&mut state)
    }

    fn load(&self, index: u64, skip_verify: bool) -> Result<PooledBuffer> {
        let mut buffer = self.allocate()?;
        if !skip_verify {
            trace!("Filling block {} of layer {}", index, self.verifier.layer());
            self.verifier.verify_and_read(index, &mut buffer)?;
        }
        Ok(buffer)
    }

    /// Allocate one block, evicting this cache's own entries while the pool is exhausted
    fn allocate(&self) -> Result<PooledBuffer> {
        loop {
            match self.pool.allocate(self.block_size as usize) {
                Ok(buffer) => return Ok(buffer),
                Err(e @ IntegrityError::BufferAllocationFailed { .. }) => {
                    let mut state = self.state.lock();
                    match state.entries.pop_lru() {
                        Some((index, entry)) => {
                            state.stats.evictions += 1;
                            self.evict(&mut state, index, entry)?;
                        }
                        None => return Err(e),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn enforce_capacity(&self, state: &mut CacheState) -> Result<()> {
        while state.entries.len() > self.capacity {
            match state.entries.pop_lru() {
                Some((index, entry)) => {
                    state.stats.evictions += 1;
                    self.evict(state, index, entry)?;
                }
                None => break,
            }
        }
        Ok(())
    }

    /// Write back an entry already removed from the table
    ///
    /// On failure the entry is put back so its contents are not lost.
    fn evict(&self, state: &mut CacheState, index: u64, entry: CacheEntry) -> Result<()> {
        if !entry.dirty {
            return Ok(());
        }
        match self.verifier.recompute_and_mark_dirty(index, &entry.buffer) {
            Ok(()) => {
                state.stats.write_backs += 1;
                Ok(())
            }
            Err(e) => {
                state.entries.put(index, entry);
                Err(e)
            }
        }
    }

    /// Write back every dirty entry, keeping the entries cached
    fn write_back_all(&self, state: &mut CacheState) -> Result<()> {
        let mut written = 0;
        for (&index, entry) in state.entries.iter_mut() {
            if entry.dirty {
                self.verifier.recompute_and_mark_dirty(index, &entry.buffer)?;
                entry.dirty = false;
                written += 1;
            }
        }
        state.stats.write_backs += written;
        Ok(())
    }

    /// Remove the entries of blocks `[first, last)`, writing dirty ones back if asked
    fn drop_range(&self, state: &mut CacheState, first: u64, last: u64, write_back: bool) -> Result<()> {
        let indices: Vec<u64> = state
            .entries
            .iter()
            .map(|(&index, _)| index)
            .filter(|index| (first..last).contains(index))
            .collect();

        for index in indices {
            if let Some(entry) = state.entries.pop(&index) {
                if write_back {
                    self.evict(state, index, entry)?;
                }
            }
        }
        Ok(())
    }

    /// Block-aligned bounds of `[offset, offset + size)`, clamped to the data size
    fn clamp_range(&self, offset: u64, size: u64) -> Result<(u64, u64, u64)> {
        let data_size = self.size()?;
        if offset > data_size {
            return Err(IntegrityError::InvalidOffset {
                offset,
                size: data_size,
            });
        }
        let end = offset + size.min(data_size - offset);
        Ok((data_size, offset, end))
    }

    /// Inner block range of `[offset, end)`; a range reaching the end of the
    /// data covers the partial tail block too
    fn inner_range(&self, offset: u64, end: u64, data_size: u64) -> (u64, u64) {
        let start = align_up(offset, self.block_size);
        let end = if end == data_size {
            end
        } else {
            align_down(end, self.block_size)
        };
        (start, end)
    }

    fn block_span(&self, start: u64, end: u64) -> (u64, u64) {
        (
            start >> self.block_order,
            align_up(end, self.block_size) >> self.block_order,
        )
    }

    fn save_data_only(&self, op: OperationId) -> Result<()> {
        if self.verifier.kind() == StorageKind::SaveData {
            Ok(())
        } else {
            Err(IntegrityError::UnsupportedOperation(op))
        }
    }

    fn clear(&self, offset: u64, size: u64) -> Result<()> {
        self.save_data_only(OperationId::Clear)?;
        let (data_size, offset, end) = self.clamp_range(offset, size)?;
        let (start, inner_end) = self.inner_range(offset, end, data_size);

        if start >= inner_end {
            // No whole block inside the range
            if offset < end {
                self.write(offset, &vec![0u8; (end - offset) as usize])?;
            }
            return Ok(());
        }

        // Partial blocks at either edge are zeroed through the cache
        if offset < start {
            self.write(offset, &vec![0u8; (start - offset) as usize])?;
        }
        if inner_end < end {
            self.write(inner_end, &vec![0u8; (end - inner_end) as usize])?;
        }

        let _sweep = self.shared_mutex.lock();
        let mut state = self.lock_idle();
        let (first, last) = self.block_span(start, inner_end);
        self.drop_range(&mut state, first, last, false)?;
        self.verifier
            .operate_range(OperationId::Clear, start, inner_end - start)?;
        Ok(())
    }

    fn clear_signature(&self, offset: u64, size: u64) -> Result<()> {
        self.save_data_only(OperationId::ClearSignature)?;
        let (data_size, offset, end) = self.clamp_range(offset, size)?;
        let (start, inner_end) = self.inner_range(offset, end, data_size);
        if start >= inner_end {
            return Ok(());
        }

        let _sweep = self.shared_mutex.lock();
        let mut state = self.lock_idle();
        let (first, last) = self.block_span(start, inner_end);
        self.drop_range(&mut state, first, last, true)?;
        self.verifier.operate_range(
            OperationId::ClearSignature,
            start,
            align_up(inner_end, self.block_size) - start,
        )?;
        Ok(())
    }

    fn invalidate(&self, offset: u64, size: u64) -> Result<QueryRangeInfo> {
        if self.verifier.kind() == StorageKind::SaveData {
            return Err(IntegrityError::UnsupportedOperation(
                OperationId::InvalidateCache,
            ));
        }
        let (_, offset, end) = self.clamp_range(offset, size)?;
        let start = align_down(offset, self.block_size);
        let end = align_up(end, self.block_size);

        {
            let _sweep = self.shared_mutex.lock();
            let mut state = self.lock_idle();
            let (first, last) = self.block_span(start, end);
            self.drop_range(&mut state, first, last, true)?;
        }

        // The parent level's cache takes the shared mutex itself
        self.verifier
            .operate_range(OperationId::InvalidateCache, start, end - start)
    }

    fn query_range(&self, offset: u64, size: u64) -> Result<QueryRangeInfo> {
        let (_, offset, end) = self.clamp_range(offset, size)?;
        let start = align_down(offset, self.block_size);
        let end = align_up(end, self.block_size);
        self.verifier
            .operate_range(OperationId::QueryRange, start, end - start)
    }
}

impl Storage for BlockCache {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        check_access_range(offset, buf.len() as u64, self.size()?)?;

        let mut first_error = None;
        for chunk in split_blocks(offset, buf.len(), self.block_size) {
            let out = &mut buf[chunk.buf_range()];
            let result = self.with_block(chunk.index, Access::Read, |block| {
                out.copy_from_slice(&block[chunk.block_range()]);
            });
            match result {
                Ok(()) => {}
                Err(e) if e.is_integrity_error() => {
                    out.fill(0);
                    first_error.get_or_insert(e);
                }
                Err(e) => return Err(e),
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn write(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let data_size = self.size()?;
        check_access_range(offset, buf.len() as u64, data_size)?;

        for chunk in split_blocks(offset, buf.len(), self.block_size) {
            let block_start = chunk.index << self.block_order;
            let covers_block = chunk.in_block == 0
                && (chunk.len as u64 == self.block_size
                    || block_start + chunk.len as u64 == data_size);
            let access = if covers_block {
                Access::Overwrite
            } else {
                Access::Modify
            };

            let input = &buf[chunk.buf_range()];
            self.with_block(chunk.index, access, |block| {
                block[chunk.block_range()].copy_from_slice(input);
            })?;
        }
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        self.verifier.size()
    }

    /// Write back, flush the data storage and hand every buffer back to the pool
    fn flush(&self) -> Result<()> {
        let _sweep = self.shared_mutex.lock();
        let mut state = self.lock_idle();
        self.write_back_all(&mut state)?;
        self.verifier.flush_data()?;

        let released = state.entries.len();
        state.entries.clear();
        debug!(
            "Flushed layer {} cache, released {} blocks",
            self.verifier.layer(),
            released
        );
        Ok(())
    }

    fn operate_range(&self, op: OperationId, offset: u64, size: u64) -> Result<QueryRangeInfo> {
        match op {
            OperationId::Clear => {
                self.clear(offset, size)?;
                Ok(QueryRangeInfo::default())
            }
            OperationId::ClearSignature => {
                self.clear_signature(offset, size)?;
                Ok(QueryRangeInfo::default())
            }
            OperationId::InvalidateCache => self.invalidate(offset, size),
            OperationId::QueryRange => self.query_range(offset, size),
            other => Err(IntegrityError::UnsupportedOperation(other)),
        }
    }
}

impl TransactionalStorage for BlockCache {
    fn commit(&self) -> Result<()> {
        let _sweep = self.shared_mutex.lock();
        let mut state = self.lock_idle();
        self.write_back_all(&mut state)?;
        self.verifier.flush_data()
    }

    fn on_rollback(&self) -> Result<()> {
        let _sweep = self.shared_mutex.lock();
        let mut state = self.lock_idle();
        state.entries.clear();
        Ok(())
    }
}

/// Piece of a byte range falling inside one block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BlockChunk {
    index: u64,
    /// Offset of the piece inside its block
    in_block: usize,
    /// Offset of the piece inside the caller's buffer
    in_buf: usize,
    len: usize,
}

impl BlockChunk {
    fn block_range(&self) -> std::ops::Range<usize> {
        self.in_block..self.in_block + self.len
    }

    fn buf_range(&self) -> std::ops::Range<usize> {
        self.in_buf..self.in_buf + self.len
    }
}

fn split_blocks(offset: u64, len: usize, block_size: u64) -> impl Iterator<Item = BlockChunk> {
    let mut pos = offset;
    let end = offset + len as u64;
    std::iter::from_fn(move || {
        if pos >= end {
            return None;
        }
        let index = pos / block_size;
        let in_block = pos % block_size;
        let chunk_len = (block_size - in_block).min(end - pos);
        let chunk = BlockChunk {
            index,
            in_block: in_block as usize,
            in_buf: (pos - offset) as usize,
            len: chunk_len as usize,
        };
        pos += chunk_len;
        Some(chunk)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::{derive_salt, Seed, HASH_SIZE};
    use crate::storage::MemoryStorage;

    const BLOCK: usize = 64;

    struct Fixture {
        cache: BlockCache,
        hashes: Arc<MemoryStorage>,
        data: Arc<MemoryStorage>,
        pool: Arc<BufferPool>,
    }

    fn fixture(kind: StorageKind, data_size: usize, capacity: usize, pool_bytes: usize) -> Fixture {
        let hashes = Arc::new(MemoryStorage::new((data_size + BLOCK - 1) / BLOCK * HASH_SIZE));
        let data = Arc::new(MemoryStorage::new(data_size));
        let verifier = Verifier::new(
            1,
            hashes.clone(),
            data.clone(),
            BLOCK as u64,
            derive_salt(&Seed([3; 32]), 1),
            kind,
        )
        .unwrap();
        let pool = BufferPool::new(pool_bytes);
        let cache = BlockCache::new(
            Arc::new(verifier),
            pool.clone(),
            Arc::new(Mutex::new(())),
            capacity,
        )
        .unwrap();
        Fixture {
            cache,
            hashes,
            data,
            pool,
        }
    }

    #[test]
    fn test_split_blocks() {
        let chunks: Vec<_> = split_blocks(60, 10, 64).collect();
        assert_eq!(
            chunks,
            vec![
                BlockChunk { index: 0, in_block: 60, in_buf: 0, len: 4 },
                BlockChunk { index: 1, in_block: 0, in_buf: 4, len: 6 },
            ]
        );
    }

    #[test]
    fn test_unaligned_write_then_read() {
        let f = fixture(StorageKind::SaveData, 4 * BLOCK, 4, 1 << 16);
        f.cache.write(50, b"straddles a block boundary").unwrap();

        let mut buf = [0u8; 26];
        f.cache.read(50, &mut buf).unwrap();
        assert_eq!(&buf, b"straddles a block boundary");
    }

    #[test]
    fn test_writes_stay_cached_until_commit() {
        let f = fixture(StorageKind::SaveData, 4 * BLOCK, 4, 1 << 16);
        f.cache.write(0, &[7u8; BLOCK]).unwrap();
        assert!(f.data.to_vec().iter().all(|&b| b == 0));

        f.cache.commit().unwrap();
        assert_eq!(&f.data.to_vec()[..BLOCK], &[7u8; BLOCK][..]);
        assert_eq!(f.cache.stats().entries, 1);
        assert_eq!(f.cache.stats().write_backs, 1);
    }

    #[test]
    fn test_rollback_discards_dirty_blocks() {
        let f = fixture(StorageKind::SaveData, 4 * BLOCK, 4, 1 << 16);
        f.cache.write(0, &[7u8; BLOCK]).unwrap();
        f.cache.on_rollback().unwrap();

        let mut buf = [0xFFu8; BLOCK];
        f.cache.read(0, &mut buf).unwrap();
        assert_eq!(buf, [0u8; BLOCK]);
        assert!(f.hashes.to_vec().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_eviction_writes_back_dirty_blocks() {
        let f = fixture(StorageKind::SaveData, 8 * BLOCK, 2, 1 << 16);
        for i in 0..4u8 {
            f.cache.write(i as u64 * BLOCK as u64, &[i + 1; BLOCK]).unwrap();
        }

        let stats = f.cache.stats();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.evictions, 2);
        assert_eq!(stats.write_backs, 2);
        assert_eq!(&f.data.to_vec()[..BLOCK], &[1u8; BLOCK][..]);

        for i in 0..4u8 {
            let mut buf = [0u8; BLOCK];
            f.cache.read(i as u64 * BLOCK as u64, &mut buf).unwrap();
            assert_eq!(buf, [i + 1; BLOCK]);
        }
    }

    #[test]
    fn test_pool_exhaustion_evicts_own_entries() {
        // Room for two blocks even though the cache would hold four
        let f = fixture(StorageKind::SaveData, 8 * BLOCK, 4, 2 * BLOCK);
        for i in 0..4u8 {
            f.cache.write(i as u64 * BLOCK as u64, &[i + 1; BLOCK]).unwrap();
        }
        assert_eq!(f.cache.stats().entries, 2);
        assert!(f.pool.stats().allocated <= 2 * BLOCK);

        let mut buf = [0u8; BLOCK];
        f.cache.read(0, &mut buf).unwrap();
        assert_eq!(buf, [1u8; BLOCK]);
    }

    #[test]
    fn test_empty_pool_surfaces_error() {
        let f = fixture(StorageKind::SaveData, 2 * BLOCK, 2, 0);
        let mut buf = [0u8; 4];
        assert!(matches!(
            f.cache.read(0, &mut buf),
            Err(IntegrityError::BufferAllocationFailed { .. })
        ));
    }

    #[test]
    fn test_flush_releases_buffers() {
        let f = fixture(StorageKind::SaveData, 4 * BLOCK, 4, 1 << 16);
        f.cache.write(10, b"dirty").unwrap();
        assert_eq!(f.pool.stats().allocated, BLOCK);

        f.cache.flush().unwrap();
        assert_eq!(f.pool.stats().allocated, 0);
        assert_eq!(f.cache.stats().entries, 0);

        let mut buf = [0u8; 5];
        f.cache.read(10, &mut buf).unwrap();
        assert_eq!(&buf, b"dirty");
    }

    #[test]
    fn test_corrupt_block_is_zeroed_and_reported() {
        let f = fixture(StorageKind::Archive, 2 * BLOCK, 4, 1 << 16);
        f.cache.write(0, &[5u8; 2 * BLOCK]).unwrap();
        f.cache.flush().unwrap();

        f.data.write(3, &[0xAA]).unwrap();

        let mut buf = [0xEEu8; 2 * BLOCK];
        let err = f.cache.read(0, &mut buf).unwrap_err();
        assert!(matches!(err, IntegrityError::HashMismatch { level: 1, offset: 0 }));
        assert!(buf[..BLOCK].iter().all(|&b| b == 0));
        assert_eq!(&buf[BLOCK..], &[5u8; BLOCK][..]);
    }

    #[test]
    fn test_concurrent_reads_share_one_load() {
        let f = Arc::new(fixture(StorageKind::SaveData, 4 * BLOCK, 4, 1 << 16));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let f = Arc::clone(&f);
                std::thread::spawn(move || {
                    let mut buf = [0u8; 16];
                    f.cache.read(0, &mut buf).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let stats = f.cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 7);
    }

    #[test]
    fn test_clear_zeroes_range() {
        let f = fixture(StorageKind::SaveData, 4 * BLOCK, 4, 1 << 16);
        f.cache.write(0, &[9u8; 4 * BLOCK]).unwrap();
        f.cache.commit().unwrap();

        f.cache
            .operate_range(OperationId::Clear, 32, 2 * BLOCK as u64)
            .unwrap();

        let mut buf = [0u8; 4 * BLOCK];
        f.cache.read(0, &mut buf).unwrap();
        assert!(buf[..32].iter().all(|&b| b == 9));
        assert!(buf[32..32 + 2 * BLOCK].iter().all(|&b| b == 0));
        assert!(buf[32 + 2 * BLOCK..].iter().all(|&b| b == 9));
    }

    #[test]
    fn test_clear_signature_invalidates_blocks() {
        let f = fixture(StorageKind::SaveData, 4 * BLOCK, 4, 1 << 16);
        f.cache.write(0, &[9u8; 4 * BLOCK]).unwrap();

        f.cache
            .operate_range(OperationId::ClearSignature, BLOCK as u64, BLOCK as u64)
            .unwrap();

        let mut buf = [0u8; BLOCK];
        f.cache.read(0, &mut buf).unwrap();
        assert!(f
            .cache
            .read(BLOCK as u64, &mut buf)
            .unwrap_err()
            .is_integrity_error());
    }

    #[test]
    fn test_invalidate_cache_by_kind() {
        let save = fixture(StorageKind::SaveData, 2 * BLOCK, 2, 1 << 16);
        assert!(matches!(
            save.cache.operate_range(OperationId::InvalidateCache, 0, BLOCK as u64),
            Err(IntegrityError::UnsupportedOperation(OperationId::InvalidateCache))
        ));

        let archive = fixture(StorageKind::Archive, 2 * BLOCK, 2, 1 << 16);
        archive.cache.write(0, &[1u8; BLOCK]).unwrap();
        archive
            .cache
            .operate_range(OperationId::InvalidateCache, 0, 2 * BLOCK as u64)
            .unwrap();
        assert_eq!(archive.cache.stats().entries, 0);
        assert_eq!(&archive.data.to_vec()[..BLOCK], &[1u8; BLOCK][..]);
    }

    #[test]
    fn test_out_of_range_access() {
        let f = fixture(StorageKind::SaveData, 2 * BLOCK, 2, 1 << 16);
        let mut buf = [0u8; 8];
        assert!(matches!(
            f.cache.read(2 * BLOCK as u64 - 4, &mut buf),
            Err(IntegrityError::OutOfRange { .. })
        ));
        assert!(f
            .cache
            .operate_range(OperationId::FillZero, 0, 8)
            .is_err());
    }
}
