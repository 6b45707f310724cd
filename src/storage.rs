//! Byte-addressable storage contract and the plain storages used as level backings
//!
//! Every layer of an integrity tree, and the tree itself, speaks the same
//! [`Storage`] contract so layers can be stacked transparently.

use crate::error::{IntegrityError, Result};
use parking_lot::{Mutex, RwLock};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

/// Range operations understood by [`Storage::operate_range`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationId {
    /// Fill a range with zeros
    FillZero,
    /// Destroy the signature of a range
    DestroySignature,
    /// Mark a range as cleared (reads back as zeros)
    Clear,
    /// Invalidate the stored hashes of a range
    ClearSignature,
    /// Drop any cached copies of a range
    InvalidateCache,
    /// Query properties of a range
    QueryRange,
}

/// Result of a [`OperationId::QueryRange`] request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryRangeInfo {
    /// Backend specific property flags, OR-merged across layers
    pub flags: u32,
}

impl QueryRangeInfo {
    pub fn merge(&mut self, other: &QueryRangeInfo) {
        self.flags |= other.flags;
    }
}

/// Byte-addressable storage
pub trait Storage: Send + Sync {
    /// Read `buf.len()` bytes starting at `offset`
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write `buf` starting at `offset`
    fn write(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Size of the storage in bytes
    fn size(&self) -> Result<u64>;

    /// Make previous writes durable
    fn flush(&self) -> Result<()>;

    /// Perform a range operation
    ///
    /// Plain storages accept cache invalidation and range queries as no-ops
    /// and reject everything else.
    fn operate_range(&self, op: OperationId, _offset: u64, _size: u64) -> Result<QueryRangeInfo> {
        match op {
            OperationId::InvalidateCache | OperationId::QueryRange => Ok(QueryRangeInfo::default()),
            other => Err(IntegrityError::UnsupportedOperation(other)),
        }
    }
}

/// Storage with commit / rollback semantics
pub trait TransactionalStorage: Storage {
    /// Persist every pending modification
    fn commit(&self) -> Result<()>;

    /// Discard every pending modification
    fn on_rollback(&self) -> Result<()>;
}

/// Check that `[offset, offset + len)` lies within a storage of `size` bytes
pub fn check_access_range(offset: u64, len: u64, size: u64) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(IntegrityError::OutOfRange { offset, len, size }),
    }
}

/// In-memory storage of a fixed size
pub struct MemoryStorage {
    data: RwLock<Vec<u8>>,
}

impl MemoryStorage {
    /// Create a zero-filled storage of `size` bytes
    pub fn new(size: usize) -> Self {
        MemoryStorage {
            data: RwLock::new(vec![0; size]),
        }
    }

    /// Wrap existing bytes
    pub fn from_vec(data: Vec<u8>) -> Self {
        MemoryStorage {
            data: RwLock::new(data),
        }
    }

    /// Copy of the current contents
    pub fn to_vec(&self) -> Vec<u8> {
        self.data.read().clone()
    }
}

impl Storage for MemoryStorage {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let data = self.data.read();
        check_access_range(offset, buf.len() as u64, data.len() as u64)?;
        let start = offset as usize;
        buf.copy_from_slice(&data[start..start + buf.len()]);
        Ok(())
    }

    fn write(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut data = self.data.write();
        check_access_range(offset, buf.len() as u64, data.len() as u64)?;
        let start = offset as usize;
        data[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// File-backed storage
pub struct FileStorage {
    file: Mutex<File>,
    path: std::path::PathBuf,
}

impl FileStorage {
    /// Create (or truncate) a zero-filled file of `size` bytes
    pub fn create<P: AsRef<Path>>(path: P, size: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(size)?;

        Ok(FileStorage {
            file: Mutex::new(file),
            path: path.as_ref().to_path_buf(),
        })
    }

    /// Open an existing file
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;

        Ok(FileStorage {
            file: Mutex::new(file),
            path: path.as_ref().to_path_buf(),
        })
    }

    /// Get file path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Storage for FileStorage {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut file = self.file.lock();
        let size = file.metadata()?.len();
        check_access_range(offset, buf.len() as u64, size)?;

        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn write(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut file = self.file.lock();
        let size = file.metadata()?.len();
        check_access_range(offset, buf.len() as u64, size)?;

        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        Ok(self.file.lock().metadata()?.len())
    }

    fn flush(&self) -> Result<()> {
        let mut file = self.file.lock();
        file.flush()?;
        file.sync_all()?;
        Ok(())
    }
}

/// Window `[offset, offset + size)` over another storage
#[derive(Clone)]
pub struct SubStorage {
    base: Arc<dyn Storage>,
    offset: u64,
    size: u64,
}

impl SubStorage {
    /// Create a window, checking that it fits inside `base`
    pub fn new(base: Arc<dyn Storage>, offset: u64, size: u64) -> Result<Self> {
        check_access_range(offset, size, base.size()?)?;
        Ok(SubStorage { base, offset, size })
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }
}

impl Storage for SubStorage {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_access_range(offset, buf.len() as u64, self.size)?;
        self.base.read(self.offset + offset, buf)
    }

    fn write(&self, offset: u64, buf: &[u8]) -> Result<()> {
        check_access_range(offset, buf.len() as u64, self.size)?;
        self.base.write(self.offset + offset, buf)
    }

    fn size(&self) -> Result<u64> {
        Ok(self.size)
    }

    fn flush(&self) -> Result<()> {
        self.base.flush()
    }

    fn operate_range(&self, op: OperationId, offset: u64, size: u64) -> Result<QueryRangeInfo> {
        if offset > self.size {
            return Err(IntegrityError::InvalidOffset {
                offset,
                size: self.size,
            });
        }
        let size = size.min(self.size - offset);
        self.base.operate_range(op, self.offset + offset, size)
    }
}
