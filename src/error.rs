use crate::storage::OperationId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IntegrityError {
    #[error("Incorrect integrity verification magic in control header")]
    IncorrectMagic,

    #[error("Unsupported integrity verification version: {major}.{minor}")]
    UnsupportedVersion { major: u16, minor: u16 },

    #[error("Invalid size: {required} bytes required, {actual} available")]
    InvalidSize { required: u64, actual: u64 },

    #[error("Invalid layer count: {0} (must be between 2 and 7)")]
    InvalidLayerCount(usize),

    #[error("Invalid block size: {0} (must be a power of two of at least 32 bytes)")]
    InvalidBlockSize(u64),

    #[error("Invalid offset {offset} for storage of {size} bytes")]
    InvalidOffset { offset: u64, size: u64 },

    #[error("Access of {len} bytes at offset {offset} is out of range ({size} bytes)")]
    OutOfRange { offset: u64, len: u64, size: u64 },

    #[error("Hash mismatch at level {level}, offset {offset}")]
    HashMismatch { level: usize, offset: u64 },

    #[error("Non-zero hash without validation bit at level {level}, offset {offset}")]
    InvalidZeroHash { level: usize, offset: u64 },

    #[error("Unsupported operation: {0:?}")]
    UnsupportedOperation(OperationId),

    #[error("Integrity tree storage is not initialized")]
    NotInitialized,

    #[error("Buffer allocation failed: {requested} bytes requested, {available} available")]
    BufferAllocationFailed { requested: usize, available: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl IntegrityError {
    /// True for errors that signal corrupted or tampered data.
    pub fn is_integrity_error(&self) -> bool {
        matches!(
            self,
            IntegrityError::HashMismatch { .. } | IntegrityError::InvalidZeroHash { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, IntegrityError>;
