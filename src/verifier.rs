//! Per-level hash verifier
//!
//! A [`Verifier`] guards one stored layer. Every block it reads is hashed
//! with the level salt and compared against the entry kept in the layer
//! above; every block it writes has its entry recomputed there first.

use crate::config::StorageKind;
use crate::error::{IntegrityError, Result};
use crate::hash::{calc_block_hash, BlockHash, HashSalt, HASH_SIZE};
use crate::header::align_up;
use crate::storage::{check_access_range, OperationId, QueryRangeInfo, Storage};
use std::sync::Arc;
use tracing::warn;

/// Chunk size used when zeroing hash entries
const CLEAR_CHUNK_SIZE: usize = 16 * 1024;

/// Outcome of checking one block against its stored hash
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockState {
    Valid,
    /// Save-data block whose entry was cleared; reads back as zeros
    Cleared,
}

pub struct Verifier {
    /// Stored layer this verifier protects (1 = first layer below the master hash)
    layer: usize,
    hash_storage: Arc<dyn Storage>,
    data_storage: Arc<dyn Storage>,
    block_size: u64,
    block_order: u32,
    salt: HashSalt,
    kind: StorageKind,
}

impl Verifier {
    /// Create a verifier over `data_storage` whose entries live in `hash_storage`
    ///
    /// Fails if the hash storage cannot hold one entry per data block.
    pub fn new(
        layer: usize,
        hash_storage: Arc<dyn Storage>,
        data_storage: Arc<dyn Storage>,
        block_size: u64,
        salt: HashSalt,
        kind: StorageKind,
    ) -> Result<Self> {
        if !block_size.is_power_of_two() || block_size < HASH_SIZE as u64 {
            return Err(IntegrityError::InvalidBlockSize(block_size));
        }

        let hash_size = hash_storage.size()?;
        let data_size = data_storage.size()?;
        let required = align_up(data_size, block_size) / block_size * HASH_SIZE as u64;
        if hash_size < required {
            return Err(IntegrityError::InvalidSize {
                required,
                actual: hash_size,
            });
        }

        Ok(Verifier {
            layer,
            hash_storage,
            data_storage,
            block_size,
            block_order: block_size.trailing_zeros(),
            salt,
            kind,
        })
    }

    pub fn layer(&self) -> usize {
        self.layer
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn kind(&self) -> StorageKind {
        self.kind
    }

    /// Read and verify block `block_index` into `buf` (one block long)
    pub fn verify_and_read(&self, block_index: u64, buf: &mut [u8]) -> Result<()> {
        self.read(block_index << self.block_order, buf)
    }

    /// Recompute the entry for block `block_index` and write the block
    ///
    /// The entry lands in the layer above, which marks it dirty until that
    /// layer is committed.
    pub fn recompute_and_mark_dirty(&self, block_index: u64, buf: &[u8]) -> Result<()> {
        self.write(block_index << self.block_order, buf)
    }

    /// Flush the protected data storage only
    ///
    /// The hash storage is the level above, which is committed on its own.
    pub fn flush_data(&self) -> Result<()> {
        self.data_storage.flush()
    }

    fn is_aligned(&self, value: u64) -> bool {
        value & (self.block_size - 1) == 0
    }

    fn check_aligned(&self, offset: u64, len: u64) -> Result<()> {
        if self.is_aligned(offset) && self.is_aligned(len) {
            Ok(())
        } else {
            Err(IntegrityError::InvalidOffset {
                offset,
                size: len,
            })
        }
    }

    /// Byte range of the entries covering `len` bytes of data at `offset`
    fn signature_range(&self, offset: u64, len: u64) -> (u64, u64) {
        (
            (offset >> self.block_order) * HASH_SIZE as u64,
            (len >> self.block_order) * HASH_SIZE as u64,
        )
    }

    fn verify_hash(&self, block: &[u8], stored: &BlockHash, offset: u64) -> Result<BlockState> {
        if self.kind == StorageKind::SaveData && !stored.has_validation_bit() {
            if stored.is_zero() {
                return Ok(BlockState::Cleared);
            }
            return Err(IntegrityError::InvalidZeroHash {
                level: self.layer,
                offset,
            });
        }

        let computed = calc_block_hash(&self.salt, block, self.kind);
        if computed != *stored {
            return Err(IntegrityError::HashMismatch {
                level: self.layer,
                offset,
            });
        }

        Ok(BlockState::Valid)
    }

    fn save_data_only(&self, op: OperationId) -> Result<()> {
        if self.kind == StorageKind::SaveData {
            Ok(())
        } else {
            Err(IntegrityError::UnsupportedOperation(op))
        }
    }

    /// Entry range for a range operation, after checking the offset
    ///
    /// A trailing partial block counts as a whole block.
    fn range_signatures(&self, offset: u64, size: u64) -> Result<(u64, u64)> {
        let data_size = self.data_storage.size()?;
        if offset > data_size {
            return Err(IntegrityError::InvalidOffset {
                offset,
                size: data_size,
            });
        }
        let len = align_up(size.min(data_size - offset), self.block_size);
        Ok(self.signature_range(offset, len))
    }

    fn clear(&self, offset: u64, size: u64) -> Result<()> {
        self.save_data_only(OperationId::Clear)?;

        let (sign_offset, sign_size) = self.range_signatures(offset, size)?;
        let zeros = vec![0u8; (sign_size as usize).min(CLEAR_CHUNK_SIZE)];
        let mut done = 0u64;
        while done < sign_size {
            let chunk = (sign_size - done).min(zeros.len() as u64) as usize;
            self.hash_storage.write(sign_offset + done, &zeros[..chunk])?;
            done += chunk as u64;
        }

        Ok(())
    }

    fn clear_signature(&self, offset: u64, size: u64) -> Result<()> {
        self.save_data_only(OperationId::ClearSignature)?;

        let (sign_offset, sign_size) = self.range_signatures(offset, size)?;
        let mut signatures = vec![0u8; sign_size as usize];
        self.hash_storage.read(sign_offset, &mut signatures)?;

        // Invert every entry byte but keep the validation bit as it was
        for (i, byte) in signatures.iter_mut().enumerate() {
            *byte ^= if (i + 1) % HASH_SIZE == 0 { 0x7F } else { 0xFF };
        }

        self.hash_storage.write(sign_offset, &signatures)
    }
}

impl Storage for Verifier {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }

        let len = buf.len() as u64;
        self.check_aligned(offset, len)?;

        let data_size = self.data_storage.size()?;
        if offset > data_size {
            return Err(IntegrityError::InvalidOffset {
                offset,
                size: data_size,
            });
        }
        check_access_range(offset, len, align_up(data_size, self.block_size))?;

        // Bytes past the end of the data are hashed as zero padding
        let read_len = len.min(data_size - offset) as usize;
        buf[read_len..].fill(0);
        if let Err(e) = self.data_storage.read(offset, &mut buf[..read_len]) {
            buf.fill(0);
            return Err(e);
        }

        let (sign_offset, sign_size) = self.signature_range(offset, len);
        let mut signatures = vec![0u8; sign_size as usize];
        if let Err(e) = self.hash_storage.read(sign_offset, &mut signatures) {
            buf.fill(0);
            return Err(e);
        }

        let block_size = self.block_size as usize;
        let mut first_error = None;
        for (index, (block, entry)) in buf
            .chunks_mut(block_size)
            .zip(signatures.chunks(HASH_SIZE))
            .enumerate()
        {
            let mut stored = BlockHash::default();
            stored.0.copy_from_slice(entry);

            let block_offset = offset + (index * block_size) as u64;
            match self.verify_hash(block, &stored, block_offset) {
                Ok(BlockState::Valid) => {}
                Ok(BlockState::Cleared) => block.fill(0),
                Err(e) => {
                    warn!("Integrity verification failed: {}", e);
                    block.fill(0);
                    first_error.get_or_insert(e);
                }
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

        let len = buf.len() as u64;
        self.check_aligned(offset, len)?;

        let data_size = self.data_storage.size()?;
        if offset >= data_size {
            return Err(IntegrityError::InvalidOffset {
                offset,
                size: data_size,
            });
        }
        check_access_range(offset, len, align_up(data_size, self.block_size))?;

        let mut signatures = Vec::with_capacity((len >> self.block_order) as usize * HASH_SIZE);
        for block in buf.chunks(self.block_size as usize) {
            signatures.extend_from_slice(&calc_block_hash(&self.salt, block, self.kind).0);
        }

        let (sign_offset, _) = self.signature_range(offset, len);
        self.hash_storage.write(sign_offset, &signatures)?;

        let write_len = len.min(data_size - offset) as usize;
        self.data_storage.write(offset, &buf[..write_len])
    }

    fn size(&self) -> Result<u64> {
        self.data_storage.size()
    }

    fn flush(&self) -> Result<()> {
        self.hash_storage.flush()?;
        self.data_storage.flush()
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
            OperationId::InvalidateCache => {
                if self.kind == StorageKind::SaveData {
                    return Err(IntegrityError::UnsupportedOperation(op));
                }
                let (sign_offset, sign_size) = self.range_signatures(offset, size)?;
                self.hash_storage.operate_range(op, sign_offset, sign_size)?;
                self.data_storage.operate_range(op, offset, size)
            }
            OperationId::QueryRange => {
                let data_size = self.data_storage.size()?;
                if offset > data_size {
                    return Err(IntegrityError::InvalidOffset {
                        offset,
                        size: data_size,
                    });
                }
                let len = size.min(data_size - offset);
                let mut info = self.data_storage.operate_range(op, offset, len)?;
                if len > 0 {
                    let (sign_offset, sign_size) = self.range_signatures(offset, len)?;
                    info.merge(&self.hash_storage.operate_range(op, sign_offset, sign_size)?);
                }
                Ok(info)
            }
            other => Err(IntegrityError::UnsupportedOperation(other)),
        }
    }
}
