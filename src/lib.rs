//! # Integrity Tree - Hierarchical Hash-Tree Verified Storage
//!
//! `integrity-tree` protects a data storage with a tree of salted SHA-256
//! hashes. Every block read from the data layer is verified against the
//! layer above it, all the way up to a small master hash that the caller
//! keeps somewhere trusted.
//!
//! - **2 to 7 layers** (master hash, up to five hash layers, data layer)
//! - **Per-level salts** derived with HMAC-SHA256 from a 256-bit seed
//! - **Write-back block caches** per level, committed bottom-up
//! - **Save-data and archive images** (cleared blocks, cache sizing)
//! - **Process-wide admission control** bounding concurrent reads and writes
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use integrity_tree::{
//!     AccessSemaphorePair, BufferPool, ControlHeader, Geometry, IntegrityTreeStorage,
//!     LevelStorages, MemoryStorage, Seed, Storage, StorageKind, TransactionalStorage,
//!     TreeConfig,
//! };
//! use parking_lot::Mutex;
//! use std::sync::Arc;
//!
//! # fn main() -> integrity_tree::Result<()> {
//! // Three hash layers of 4 KiB blocks over 1 MiB of data
//! let geometry = Geometry::new(vec![12, 12, 12], 1 << 20)?;
//! let header = ControlHeader::new(&geometry, Seed::generate())?;
//! let info = header.tree_information()?;
//!
//! let master: Arc<dyn Storage> = Arc::new(MemoryStorage::new(info.master_hash_size as usize));
//! let image: Arc<dyn Storage> = Arc::new(MemoryStorage::new(header.image_size() as usize));
//! let storages = LevelStorages::from_image(master, image, &info)?;
//!
//! let mut tree = IntegrityTreeStorage::new(AccessSemaphorePair::global(), TreeConfig::default());
//! tree.initialize(
//!     &info,
//!     &storages,
//!     BufferPool::new(1 << 20),
//!     Arc::new(Mutex::new(())),
//!     StorageKind::SaveData,
//! )?;
//!
//! tree.write(0, b"Hello, World!")?;
//! tree.commit()?;
//!
//! let mut buf = [0u8; 13];
//! tree.read(0, &mut buf)?;
//! # Ok(())
//! # }
//! ```

pub mod admission;
pub mod buffer_pool;
pub mod cache;
pub mod config;
pub mod error;
pub mod hash;
pub mod header;
pub mod level;
pub mod storage;
pub mod tree;
pub mod verifier;

pub use admission::{AccessPermit, AccessSemaphore, AccessSemaphorePair};
pub use buffer_pool::{BufferPool, BufferPoolStats, PooledBuffer};
pub use cache::{BlockCache, CacheStats, SharedMutex};
pub use config::{CacheCounts, StorageKind, TreeConfig};
pub use error::{IntegrityError, Result};
pub use hash::{BlockHash, HashSalt, Seed, HASH_SIZE};
pub use header::{
    ControlArea, ControlHeader, Geometry, LevelInformation, SizeSet, TreeInformation,
    CONTROL_HEADER_SIZE, MAGIC, MAX_DATA_SIZE, MAX_LAYERS, MIN_LAYERS, VERSION,
};
pub use level::{CacheRole, Level};
pub use storage::{
    FileStorage, MemoryStorage, OperationId, QueryRangeInfo, Storage, SubStorage,
    TransactionalStorage,
};
pub use tree::{seal, IntegrityTreeStorage, LevelStorages};
pub use verifier::Verifier;
