//! Hierarchical integrity tree storage
//!
//! [`IntegrityTreeStorage`] stacks one [`Level`] per stored layer. Reads and
//! writes go through the bottom (data) level's cache; every block it loads
//! is verified against the level above, up to the master hash.
//!
//! Levels are built from the master hash down and torn down from the data
//! level up, since each level hashes into the one above it.

use crate::admission::AccessSemaphorePair;
use crate::buffer_pool::BufferPool;
use crate::cache::{CacheStats, SharedMutex};
use crate::config::{StorageKind, TreeConfig};
use crate::error::{IntegrityError, Result};
use crate::hash::derive_salt;
use crate::header::{TreeInformation, MAX_LAYERS, MIN_LAYERS};
use crate::level::{CacheRole, Level};
use crate::storage::{OperationId, QueryRangeInfo, Storage, SubStorage, TransactionalStorage};
use crate::verifier::Verifier;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Raw storages backing one tree: the master hash and every stored layer
#[derive(Clone)]
pub struct LevelStorages {
    pub master: Arc<dyn Storage>,
    /// Stored layers below the master hash, data layer last
    pub layers: Vec<Arc<dyn Storage>>,
}

impl LevelStorages {
    pub fn new(master: Arc<dyn Storage>, layers: Vec<Arc<dyn Storage>>) -> Self {
        LevelStorages { master, layers }
    }

    /// Slice one layer image into per-layer windows described by `info`
    pub fn from_image(
        master: Arc<dyn Storage>,
        image: Arc<dyn Storage>,
        info: &TreeInformation,
    ) -> Result<Self> {
        let layers = info
            .levels
            .iter()
            .map(|level| {
                SubStorage::new(Arc::clone(&image), level.offset, level.size)
                    .map(|sub| Arc::new(sub) as Arc<dyn Storage>)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(LevelStorages { master, layers })
    }

    /// Windows of exactly the sizes `info` describes
    fn bounded(&self, info: &TreeInformation) -> Result<LevelStorages> {
        let layer_count = self.layers.len() + 1;
        if layer_count != info.layer_count() || !(MIN_LAYERS..=MAX_LAYERS).contains(&layer_count) {
            return Err(IntegrityError::InvalidLayerCount(layer_count));
        }

        let master = SubStorage::new(Arc::clone(&self.master), 0, info.master_hash_size)?;
        let layers = self
            .layers
            .iter()
            .zip(&info.levels)
            .map(|(raw, level)| {
                SubStorage::new(Arc::clone(raw), 0, level.size)
                    .map(|sub| Arc::new(sub) as Arc<dyn Storage>)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(LevelStorages {
            master: Arc::new(master),
            layers,
        })
    }
}

/// Recompute every hash layer from the raw layer contents
///
/// Works bottom-up directly on the raw storages, so a pre-populated image
/// becomes a tree that mounts cleanly. Archive images must be sealed before
/// their first mount; a zero-filled save-data image is valid as it is.
pub fn seal(info: &TreeInformation, storages: &LevelStorages, kind: StorageKind) -> Result<()> {
    info.validate()?;
    let storages = storages.bounded(info)?;

    for index in (0..info.levels.len()).rev() {
        let hash_storage = if index == 0 {
            Arc::clone(&storages.master)
        } else {
            Arc::clone(&storages.layers[index - 1])
        };
        let data_storage = Arc::clone(&storages.layers[index]);
        let block_size = info.levels[index].block_size();

        let verifier = Verifier::new(
            index + 1,
            hash_storage,
            Arc::clone(&data_storage),
            block_size,
            derive_salt(&info.seed, index),
            kind,
        )?;

        let data_size = data_storage.size()?;
        let mut block = vec![0u8; block_size as usize];
        let mut offset = 0;
        while offset < data_size {
            let len = block_size.min(data_size - offset) as usize;
            block[len..].fill(0);
            data_storage.read(offset, &mut block[..len])?;
            verifier.write(offset, &block)?;
            offset += block_size;
        }
        debug!("Sealed layer {} ({} bytes)", index + 1, data_size);
    }

    storages.master.flush()?;
    for layer in &storages.layers {
        layer.flush()?;
    }

    info!("Sealed integrity tree ({} layers)", info.layer_count());
    Ok(())
}

/// Integrity-verified storage over a stack of hash layers
pub struct IntegrityTreeStorage {
    admission: Arc<AccessSemaphorePair>,
    config: TreeConfig,
    /// Master level first, data level last
    levels: Vec<Level>,
    master: Option<Arc<dyn Storage>>,
    data_size: Option<u64>,
    written_for_rollback: AtomicBool,
}

impl IntegrityTreeStorage {
    /// Create an unmounted tree
    pub fn new(admission: Arc<AccessSemaphorePair>, config: TreeConfig) -> Self {
        IntegrityTreeStorage {
            admission,
            config,
            levels: Vec::new(),
            master: None,
            data_size: None,
            written_for_rollback: AtomicBool::new(false),
        }
    }

    /// Mount the tree described by `info` over `storages`
    ///
    /// A mounted tree is finalized first. On failure every level built so
    /// far is torn down again and the tree stays unmounted.
    pub fn initialize(
        &mut self,
        info: &TreeInformation,
        storages: &LevelStorages,
        pool: Arc<BufferPool>,
        shared_mutex: SharedMutex,
        kind: StorageKind,
    ) -> Result<()> {
        self.finalize();

        info.validate()?;
        self.config.validate()?;
        let storages = storages.bounded(info)?;
        let counts = self.config.cache_counts(kind);

        let mut levels: Vec<Level> = Vec::with_capacity(info.levels.len());
        for index in 0..info.levels.len() {
            let built = self.build_level(info, &storages, &levels, index, kind).and_then(|verifier| {
                let (capacity, role) = if index == info.levels.len() - 1 {
                    (counts.data, CacheRole::Data)
                } else {
                    (counts.hash, CacheRole::Hash)
                };
                Level::new(verifier, Arc::clone(&pool), Arc::clone(&shared_mutex), capacity, role)
            });

            match built {
                Ok(level) => levels.push(level),
                Err(e) => {
                    teardown_levels(&mut levels);
                    return Err(e);
                }
            }
        }

        self.data_size = Some(info.data_size());
        self.master = Some(storages.master);
        self.levels = levels;
        self.written_for_rollback.store(false, Ordering::SeqCst);

        info!(
            "Initialized integrity tree: {} layers, {} data bytes, {:?}",
            info.layer_count(),
            info.data_size(),
            kind
        );
        Ok(())
    }

    fn build_level(
        &self,
        info: &TreeInformation,
        storages: &LevelStorages,
        built: &[Level],
        index: usize,
        kind: StorageKind,
    ) -> Result<Verifier> {
        let hash_storage = match built.last() {
            Some(parent) => parent.hash_storage(),
            None => Arc::clone(&storages.master),
        };

        Verifier::new(
            index + 1,
            hash_storage,
            Arc::clone(&storages.layers[index]),
            info.levels[index].block_size(),
            derive_salt(&info.seed, index),
            kind,
        )
    }

    /// Unmount the tree, data level first
    ///
    /// Uncommitted changes are discarded. Calling this on an unmounted tree
    /// does nothing.
    pub fn finalize(&mut self) {
        if self.levels.is_empty() && self.data_size.is_none() {
            return;
        }

        teardown_levels(&mut self.levels);
        self.master = None;
        self.data_size = None;

        info!("Finalized integrity tree");
    }

    pub fn is_initialized(&self) -> bool {
        self.data_size.is_some()
    }

    /// Size of the data layer, or -1 when unmounted
    pub fn data_size(&self) -> i64 {
        self.data_size.map_or(-1, |size| size as i64)
    }

    /// Number of layers including the master hash, or 0 when unmounted
    pub fn layer_count(&self) -> usize {
        if self.levels.is_empty() {
            0
        } else {
            self.levels.len() + 1
        }
    }

    /// Whether anything was written since the last rollback
    pub fn is_written_for_rollback(&self) -> bool {
        self.written_for_rollback.load(Ordering::SeqCst)
    }

    /// Cache statistics of stored layer `layer` (1 = first layer below the master hash)
    pub fn cache_stats(&self, layer: usize) -> Option<CacheStats> {
        layer
            .checked_sub(1)
            .and_then(|index| self.levels.get(index))
            .map(Level::stats)
    }

    pub fn config(&self) -> &TreeConfig {
        &self.config
    }

    fn data_level(&self) -> Result<&Level> {
        self.levels.last().ok_or(IntegrityError::NotInitialized)
    }

    /// Write back and release every level's buffers, data level first
    fn flush_caches(&self) -> Result<()> {
        for level in self.levels.iter().rev() {
            level.cache().flush()?;
        }
        Ok(())
    }
}

impl Storage for IntegrityTreeStorage {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let data = self.data_level()?;

        let _permit = self.admission.acquire_read(|| self.flush_caches())?;
        data.cache().read(offset, buf)
    }

    fn write(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let data = self.data_level()?;

        let _permit = self.admission.acquire_write(|| self.flush_caches())?;
        data.cache().write(offset, buf)?;
        self.written_for_rollback.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        self.data_size.ok_or(IntegrityError::NotInitialized)
    }

    /// Durability comes from [`TransactionalStorage::commit`]; flushing does nothing
    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn operate_range(&self, op: OperationId, offset: u64, size: u64) -> Result<QueryRangeInfo> {
        match op {
            OperationId::Clear | OperationId::ClearSignature => {
                let info = self.data_level()?.cache().operate_range(op, offset, size)?;
                self.written_for_rollback.store(true, Ordering::SeqCst);
                Ok(info)
            }
            OperationId::InvalidateCache | OperationId::QueryRange => {
                self.data_level()?.cache().operate_range(op, offset, size)
            }
            other => Err(IntegrityError::UnsupportedOperation(other)),
        }
    }
}

/// Finalize `levels` from the data level up to the master
///
/// Returns the finalized layers in teardown order.
fn teardown_levels(levels: &mut Vec<Level>) -> Vec<usize> {
    let mut order = Vec::with_capacity(levels.len());
    while let Some(level) = levels.pop() {
        order.push(level.finalize());
    }
    order
}

impl TransactionalStorage for IntegrityTreeStorage {
    /// Write every level back, data level first, then flush the master hash
    fn commit(&self) -> Result<()> {
        for level in self.levels.iter().rev() {
            level.cache().commit()?;
        }
        if let Some(master) = &self.master {
            master.flush()?;
        }

        debug!("Committed integrity tree");
        Ok(())
    }

    /// Discard every cached change, data level first
    fn on_rollback(&self) -> Result<()> {
        for level in self.levels.iter().rev() {
            level.cache().on_rollback()?;
        }
        self.written_for_rollback.store(false, Ordering::SeqCst);

        debug!("Rolled back integrity tree");
        Ok(())
    }
}

impl Drop for IntegrityTreeStorage {
    fn drop(&mut self) {
        self.finalize();
    }
}
