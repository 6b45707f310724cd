use crate::error::{IntegrityError, Result};
use crate::hash::{Seed, HASH_SIZE};
use crate::storage::Storage;
use std::sync::Arc;
use tracing::info;

/// Control header magic: "IVFC"
pub const MAGIC: u32 = u32::from_le_bytes(*b"IVFC");
/// Supported format version (major in the high 16 bits)
pub const VERSION: u32 = 0x0002_0000;
const VERSION_MAJOR_MASK: u32 = 0xFFFF_0000;

/// Fewest layers a tree may have (master hash + data)
pub const MIN_LAYERS: usize = 2;
/// Most layers a tree may have
pub const MAX_LAYERS: usize = 7;
/// Level records stored in the control header
pub const MAX_LEVELS: usize = MAX_LAYERS - 1;

/// Persisted size of [`ControlHeader`]
pub const CONTROL_HEADER_SIZE: usize = 16 + MAX_LEVELS * LEVEL_INFORMATION_SIZE + 32;
const LEVEL_INFORMATION_SIZE: usize = 24;

/// Largest supported block order (1 GiB blocks)
const MAX_BLOCK_ORDER: u32 = 30;

/// Largest supported data layer (64 PiB); keeps every layer offset in range
pub const MAX_DATA_SIZE: u64 = 1 << 56;
const MAX_IMAGE_OFFSET: u64 = MAX_DATA_SIZE << 3;

pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

pub(crate) fn align_down(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    value & !(alignment - 1)
}

/// Caller-supplied tree shape
///
/// `block_orders[i]` is the log2 block size of stored layer `i + 1`; the
/// master hash (layer 0) has no blocks of its own. The last entry therefore
/// describes the data layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Geometry {
    pub block_orders: Vec<u32>,
    pub data_size: u64,
}

impl Geometry {
    pub fn new(block_orders: Vec<u32>, data_size: u64) -> Result<Self> {
        let geometry = Geometry {
            block_orders,
            data_size,
        };
        geometry.validate()?;
        Ok(geometry)
    }

    /// Build a geometry from block sizes, each of which must be a power of two
    pub fn from_block_sizes(block_sizes: &[u64], data_size: u64) -> Result<Self> {
        let block_orders = block_sizes
            .iter()
            .map(|&size| {
                if size.is_power_of_two() {
                    Ok(size.trailing_zeros())
                } else {
                    Err(IntegrityError::InvalidBlockSize(size))
                }
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(block_orders, data_size)
    }

    /// Number of layers including the master hash and the data layer
    pub fn layer_count(&self) -> usize {
        self.block_orders.len() + 1
    }

    pub fn block_size(&self, index: usize) -> u64 {
        1u64 << self.block_orders[index]
    }

    pub fn validate(&self) -> Result<()> {
        let layer_count = self.layer_count();
        if !(MIN_LAYERS..=MAX_LAYERS).contains(&layer_count) {
            return Err(IntegrityError::InvalidLayerCount(layer_count));
        }

        for &order in &self.block_orders {
            if order > MAX_BLOCK_ORDER || (1u64 << order) < HASH_SIZE as u64 {
                return Err(IntegrityError::InvalidBlockSize(1u64 << order.min(63)));
            }
        }

        if self.data_size > MAX_DATA_SIZE {
            return Err(IntegrityError::InvalidSize {
                required: self.data_size,
                actual: MAX_DATA_SIZE,
            });
        }

        Ok(())
    }
}

/// Byte sizes required for a geometry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizeSet {
    /// Size of the persisted control header
    pub control_size: u64,
    /// Size of the master (root) hash blob
    pub master_hash_size: u64,
    /// Sizes of the intermediate hash layers, top first
    pub layered_hash_sizes: Vec<u64>,
}

/// Location and shape of one stored layer inside a layer image
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LevelInformation {
    pub offset: u64,
    pub size: u64,
    pub block_order: u32,
}

impl LevelInformation {
    pub fn block_size(&self) -> u64 {
        1u64 << self.block_order
    }
}

/// Everything an integrity tree needs to mount its layers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeInformation {
    /// Stored layers below the master hash, data layer last
    pub levels: Vec<LevelInformation>,
    pub master_hash_size: u64,
    pub seed: Seed,
}

impl TreeInformation {
    /// Number of layers including the master hash
    pub fn layer_count(&self) -> usize {
        self.levels.len() + 1
    }

    /// Size of the data layer
    pub fn data_size(&self) -> u64 {
        self.levels.last().map(|level| level.size).unwrap_or(0)
    }

    pub fn validate(&self) -> Result<()> {
        Geometry {
            block_orders: self.levels.iter().map(|level| level.block_order).collect(),
            data_size: self.data_size(),
        }
        .validate()?;

        // Headers read from disk carry their own offsets
        for level in &self.levels {
            if level.size > MAX_DATA_SIZE || level.offset > MAX_IMAGE_OFFSET {
                return Err(IntegrityError::InvalidSize {
                    required: level.offset.saturating_add(level.size),
                    actual: MAX_IMAGE_OFFSET,
                });
            }
        }
        Ok(())
    }
}

/// Persisted control header
///
/// ```text
/// 0x00  magic            u32  "IVFC"
/// 0x04  version          u32  major << 16 | minor
/// 0x08  master_hash_size u32
/// 0x0C  layer_count      u32
/// 0x10  levels[6]        { offset u64, size u64, block_order u32, reserved u32 }
/// 0xA0  seed             [u8; 32]
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlHeader {
    pub magic: u32,
    pub version: u32,
    pub master_hash_size: u32,
    pub layer_count: u32,
    pub levels: [LevelInformation; MAX_LEVELS],
    pub seed: Seed,
}

impl ControlHeader {
    /// Lay out every stored layer of `geometry` back to back in one image
    ///
    /// Each layer starts on a multiple of its own block size.
    pub fn new(geometry: &Geometry, seed: Seed) -> Result<Self> {
        let sizes = ControlArea::query_size(geometry)?;
        let layer_count = geometry.layer_count();

        let mut levels = [LevelInformation::default(); MAX_LEVELS];
        let mut cursor = 0u64;
        for (index, level) in levels.iter_mut().take(layer_count - 1).enumerate() {
            let block_size = geometry.block_size(index);
            let (size, stored_size) = if index == layer_count - 2 {
                (geometry.data_size, align_up(geometry.data_size, block_size))
            } else {
                (sizes.layered_hash_sizes[index], sizes.layered_hash_sizes[index])
            };

            let offset = align_up(cursor, block_size);
            *level = LevelInformation {
                offset,
                size,
                block_order: geometry.block_orders[index],
            };
            cursor = offset + stored_size;
        }

        let master_hash_size = u32::try_from(sizes.master_hash_size).map_err(|_| {
            IntegrityError::InvalidSize {
                required: sizes.master_hash_size,
                actual: u32::MAX as u64,
            }
        })?;

        Ok(ControlHeader {
            magic: MAGIC,
            version: VERSION,
            master_hash_size,
            layer_count: layer_count as u32,
            levels,
            seed,
        })
    }

    pub fn version_major(&self) -> u16 {
        (self.version >> 16) as u16
    }

    pub fn version_minor(&self) -> u16 {
        (self.version & 0xFFFF) as u16
    }

    /// Validate the magic and the major version; minor drift is accepted
    pub fn validate(&self) -> Result<()> {
        if self.magic != MAGIC {
            return Err(IntegrityError::IncorrectMagic);
        }

        if (self.version & VERSION_MAJOR_MASK) != (VERSION & VERSION_MAJOR_MASK) {
            return Err(IntegrityError::UnsupportedVersion {
                major: self.version_major(),
                minor: self.version_minor(),
            });
        }

        Ok(())
    }

    /// Stored layers used by this header
    pub fn active_levels(&self) -> &[LevelInformation] {
        let count = (self.layer_count as usize).saturating_sub(1).min(MAX_LEVELS);
        &self.levels[..count]
    }

    /// Bytes needed to hold every stored layer
    pub fn image_size(&self) -> u64 {
        self.active_levels()
            .iter()
            .map(|level| {
                // Unvalidated headers saturate instead of overflowing
                1u64.checked_shl(level.block_order)
                    .and_then(|block_size| level.size.checked_next_multiple_of(block_size))
                    .and_then(|stored| level.offset.checked_add(stored))
                    .unwrap_or(u64::MAX)
            })
            .max()
            .unwrap_or(0)
    }

    pub fn tree_information(&self) -> Result<TreeInformation> {
        let layer_count = self.layer_count as usize;
        if !(MIN_LAYERS..=MAX_LAYERS).contains(&layer_count) {
            return Err(IntegrityError::InvalidLayerCount(layer_count));
        }

        let info = TreeInformation {
            levels: self.active_levels().to_vec(),
            master_hash_size: self.master_hash_size as u64,
            seed: self.seed,
        };
        info.validate()?;
        Ok(info)
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(CONTROL_HEADER_SIZE);

        bytes.extend_from_slice(&self.magic.to_le_bytes());
        bytes.extend_from_slice(&self.version.to_le_bytes());
        bytes.extend_from_slice(&self.master_hash_size.to_le_bytes());
        bytes.extend_from_slice(&self.layer_count.to_le_bytes());
        for level in &self.levels {
            bytes.extend_from_slice(&level.offset.to_le_bytes());
            bytes.extend_from_slice(&level.size.to_le_bytes());
            bytes.extend_from_slice(&level.block_order.to_le_bytes());
            bytes.extend_from_slice(&[0u8; 4]);
        }
        bytes.extend_from_slice(&self.seed.0);

        debug_assert_eq!(bytes.len(), CONTROL_HEADER_SIZE);
        bytes
    }

    /// Deserialize header from bytes without validating it
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < CONTROL_HEADER_SIZE {
            return Err(IntegrityError::InvalidSize {
                required: CONTROL_HEADER_SIZE as u64,
                actual: bytes.len() as u64,
            });
        }

        let u32_at = |offset: usize| {
            u32::from_le_bytes([
                bytes[offset],
                bytes[offset + 1],
                bytes[offset + 2],
                bytes[offset + 3],
            ])
        };
        let u64_at = |offset: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[offset..offset + 8]);
            u64::from_le_bytes(raw)
        };

        let mut levels = [LevelInformation::default(); MAX_LEVELS];
        for (index, level) in levels.iter_mut().enumerate() {
            let base = 16 + index * LEVEL_INFORMATION_SIZE;
            *level = LevelInformation {
                offset: u64_at(base),
                size: u64_at(base + 8),
                block_order: u32_at(base + 16),
            };
        }

        let mut seed = [0u8; 32];
        let seed_offset = 16 + MAX_LEVELS * LEVEL_INFORMATION_SIZE;
        seed.copy_from_slice(&bytes[seed_offset..seed_offset + 32]);

        Ok(ControlHeader {
            magic: u32_at(0),
            version: u32_at(4),
            master_hash_size: u32_at(8),
            layer_count: u32_at(12),
            levels,
            seed: Seed(seed),
        })
    }
}

fn check_header_storage_size(storage: &dyn Storage) -> Result<()> {
    let size = storage.size()?;
    if size < CONTROL_HEADER_SIZE as u64 {
        return Err(IntegrityError::InvalidSize {
            required: CONTROL_HEADER_SIZE as u64,
            actual: size,
        });
    }
    Ok(())
}

fn read_header(storage: &dyn Storage) -> Result<ControlHeader> {
    let mut buffer = [0u8; CONTROL_HEADER_SIZE];
    storage.read(0, &mut buffer)?;
    ControlHeader::from_bytes(&buffer)
}

/// Control header manager
///
/// Holds the header storage of a mounted tree between
/// [`initialize`](Self::initialize) and [`finalize`](Self::finalize).
#[derive(Default)]
pub struct ControlArea {
    storage: Option<Arc<dyn Storage>>,
    header: Option<ControlHeader>,
}

impl ControlArea {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compute the sizes a geometry needs, bottom layer first
    ///
    /// No I/O is performed.
    pub fn query_size(geometry: &Geometry) -> Result<SizeSet> {
        geometry.validate()?;

        let layer_count = geometry.layer_count();
        let hash_size = HASH_SIZE as u64;
        let mut level_size = vec![0u64; layer_count];

        let mut level = layer_count - 1;
        level_size[level] = align_up(geometry.data_size, geometry.block_size(level - 1));

        while level > 1 {
            level -= 1;
            level_size[level] = align_up(
                level_size[level + 1] / geometry.block_size(level) * hash_size,
                geometry.block_size(level - 1),
            );
        }

        let master_hash_size = level_size[1] / geometry.block_size(0) * hash_size;

        Ok(SizeSet {
            control_size: CONTROL_HEADER_SIZE as u64,
            master_hash_size,
            layered_hash_sizes: level_size[1..layer_count - 1].to_vec(),
        })
    }

    /// Write a fresh header to a new image
    pub fn create(storage: &dyn Storage, header: &ControlHeader) -> Result<()> {
        header.validate()?;
        check_header_storage_size(storage)?;

        storage.write(0, &header.to_bytes())?;
        storage.flush()?;

        info!(
            "Created integrity control header ({} layers)",
            header.layer_count
        );
        Ok(())
    }

    /// Replace the persisted header, provided it is compatible with the previous one
    ///
    /// The header storage is left untouched when validation fails.
    pub fn expand(storage: &dyn Storage, header: &ControlHeader) -> Result<()> {
        check_header_storage_size(storage)?;

        let previous = read_header(storage)?;

        if previous.magic != MAGIC || previous.magic != header.magic {
            return Err(IntegrityError::IncorrectMagic);
        }

        for version in [previous.version, header.version] {
            if (version & VERSION_MAJOR_MASK) != (VERSION & VERSION_MAJOR_MASK) {
                return Err(IntegrityError::UnsupportedVersion {
                    major: (version >> 16) as u16,
                    minor: (version & 0xFFFF) as u16,
                });
            }
        }

        storage.write(0, &header.to_bytes())?;
        storage.flush()?;

        info!(
            "Expanded integrity control header to {} layers",
            header.layer_count
        );
        Ok(())
    }

    /// Read and validate the persisted header, retaining its storage
    pub fn initialize(&mut self, storage: Arc<dyn Storage>) -> Result<()> {
        check_header_storage_size(storage.as_ref())?;

        let header = read_header(storage.as_ref())?;
        header.validate()?;

        self.storage = Some(storage);
        self.header = Some(header);
        Ok(())
    }

    /// Release the retained header storage
    pub fn finalize(&mut self) {
        self.storage = None;
        self.header = None;
    }

    pub fn header(&self) -> Option<&ControlHeader> {
        self.header.as_ref()
    }

    pub fn storage(&self) -> Option<&Arc<dyn Storage>> {
        self.storage.as_ref()
    }
}
