//! One verified layer of an integrity tree

use crate::buffer_pool::BufferPool;
use crate::cache::{BlockCache, CacheStats, SharedMutex};
use crate::error::Result;
use crate::storage::Storage;
use crate::verifier::Verifier;
use std::sync::Arc;
use tracing::debug;

/// Role of a level's cache, which decides its capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheRole {
    /// Bottom level holding user data
    Data,
    /// Level holding hashes of the level below
    Hash,
}

/// Verifier of one stored layer paired with the cache in front of it
///
/// Level `i` of a tree verifies stored layer `i + 1` against the cache of
/// level `i - 1` (or the master hash for level 0). A level must therefore be
/// finalized before the level it hashes into.
pub struct Level {
    verifier: Arc<Verifier>,
    cache: Arc<BlockCache>,
    role: CacheRole,
}

impl Level {
    pub fn new(
        verifier: Verifier,
        pool: Arc<BufferPool>,
        shared_mutex: SharedMutex,
        capacity: usize,
        role: CacheRole,
    ) -> Result<Self> {
        let verifier = Arc::new(verifier);
        let cache = BlockCache::new(Arc::clone(&verifier), pool, shared_mutex, capacity)?;
        Ok(Level {
            verifier,
            cache: Arc::new(cache),
            role,
        })
    }

    pub fn verifier(&self) -> &Arc<Verifier> {
        &self.verifier
    }

    pub fn cache(&self) -> &Arc<BlockCache> {
        &self.cache
    }

    /// The cache as a storage the level below can hash into
    pub fn hash_storage(&self) -> Arc<dyn Storage> {
        Arc::clone(&self.cache) as Arc<dyn Storage>
    }

    pub fn role(&self) -> CacheRole {
        self.role
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Release the level's cached blocks; uncommitted changes are lost
    ///
    /// Returns the layer this level verified.
    pub fn finalize(self) -> usize {
        let layer = self.verifier.layer();
        self.cache.finalize();
        debug!("Finalized layer {} ({:?} cache)", layer, self.role);
        layer
    }
}
