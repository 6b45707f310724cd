//! Block hashing and per-level salt derivation

use crate::config::StorageKind;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Size of one stored block hash
pub const HASH_SIZE: usize = 32;

/// Salt labels, one per verification level (master first)
///
/// The labels are hashed including their NUL terminator so that salts match
/// images produced by other implementations of the format.
const LEVEL_LABELS: [&[u8]; 6] = [
    b"HierarchicalIntegrityVerificationStorage::Master\0",
    b"HierarchicalIntegrityVerificationStorage::L1\0",
    b"HierarchicalIntegrityVerificationStorage::L2\0",
    b"HierarchicalIntegrityVerificationStorage::L3\0",
    b"HierarchicalIntegrityVerificationStorage::L4\0",
    b"HierarchicalIntegrityVerificationStorage::L5\0",
];

/// Validation bit in the last byte of a save-data hash
const VALIDATION_BIT: u8 = 0x80;

/// 256-bit secret seed shared by every level of one tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Seed(pub [u8; 32]);

impl Seed {
    /// Generate a random seed
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        Seed(seed)
    }
}

/// Per-level salt mixed into every block hash
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashSalt(pub [u8; 32]);

/// One stored block hash
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockHash(pub [u8; HASH_SIZE]);

impl BlockHash {
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    pub fn has_validation_bit(&self) -> bool {
        self.0[HASH_SIZE - 1] & VALIDATION_BIT != 0
    }

    fn set_validation_bit(&mut self) {
        self.0[HASH_SIZE - 1] |= VALIDATION_BIT;
    }
}

/// Derive the salt for verification level `level` (0 = master)
///
/// # Panics
///
/// Panics if `level` is not below the maximum number of verification levels.
pub fn derive_salt(seed: &Seed, level: usize) -> HashSalt {
    let mut mac = Hmac::<Sha256>::new_from_slice(&seed.0).expect("HMAC key should be valid");
    mac.update(LEVEL_LABELS[level]);
    HashSalt(mac.finalize().into_bytes().into())
}

/// Hash one block: SHA-256(salt || block)
///
/// Save-data hashes additionally carry the validation bit.
pub fn calc_block_hash(salt: &HashSalt, block: &[u8], kind: StorageKind) -> BlockHash {
    let mut hasher = Sha256::new();
    hasher.update(salt.0);
    hasher.update(block);
    let mut hash = BlockHash(hasher.finalize().into());

    if kind == StorageKind::SaveData {
        hash.set_validation_bit();
    }
    hash
}

/// Number of verification levels that have a salt label
pub const fn max_salted_levels() -> usize {
    LEVEL_LABELS.len()
}
