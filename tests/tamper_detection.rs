//! Tamper detection tests
//!
//! Flipping any persisted bit of a committed tree must make the affected
//! read fail with an integrity error, reported at the layer that was hit.

use integrity_tree::{
    seal, AccessSemaphorePair, BufferPool, ControlHeader, Geometry, IntegrityError,
    IntegrityTreeStorage, LevelStorages, MemoryStorage, OperationId, Seed, Storage, StorageKind,
    TransactionalStorage, TreeConfig, TreeInformation,
};
use parking_lot::Mutex;
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

struct Image {
    info: TreeInformation,
    master: Arc<MemoryStorage>,
    image: Arc<MemoryStorage>,
    storages: LevelStorages,
}

impl Image {
    fn new(block_orders: Vec<u32>, data_size: u64) -> Self {
        let geometry = Geometry::new(block_orders, data_size).unwrap();
        let header = ControlHeader::new(&geometry, Seed::generate()).unwrap();
        let info = header.tree_information().unwrap();

        let master = Arc::new(MemoryStorage::new(info.master_hash_size as usize));
        let image = Arc::new(MemoryStorage::new(header.image_size() as usize));
        let storages = LevelStorages::from_image(master.clone(), image.clone(), &info).unwrap();
        Image {
            info,
            master,
            image,
            storages,
        }
    }

    fn mount(&self, kind: StorageKind) -> IntegrityTreeStorage {
        let mut tree = IntegrityTreeStorage::new(
            AccessSemaphorePair::new(5, Duration::from_millis(10)),
            TreeConfig::default(),
        );
        tree.initialize(
            &self.info,
            &self.storages,
            BufferPool::new(4 << 20),
            Arc::new(Mutex::new(())),
            kind,
        )
        .unwrap();
        tree
    }

    /// Fill the whole data layer and commit it
    fn populate(&self) -> Vec<u8> {
        let data: Vec<u8> = (0..self.info.data_size()).map(|i| (i * 7 % 256) as u8).collect();
        let tree = self.mount(StorageKind::SaveData);
        tree.write(0, &data).unwrap();
        tree.commit().unwrap();
        data
    }

    /// Flip one bit of stored layer `layer` (0 = master hash)
    fn flip_bit(&self, layer: usize, offset: u64, bit: u8) {
        let (storage, position) = if layer == 0 {
            (&self.master, offset)
        } else {
            (&self.image, self.info.levels[layer - 1].offset + offset)
        };

        let mut byte = [0u8; 1];
        storage.read(position, &mut byte).unwrap();
        byte[0] ^= 1 << bit;
        storage.write(position, &byte).unwrap();
    }

    fn layer_size(&self, layer: usize) -> u64 {
        if layer == 0 {
            self.info.master_hash_size
        } else {
            self.info.levels[layer - 1].size
        }
    }
}

/// Helper: layer an integrity error was reported at
fn failed_level(err: &IntegrityError) -> Option<usize> {
    match err {
        IntegrityError::HashMismatch { level, .. } | IntegrityError::InvalidZeroHash { level, .. } => {
            Some(*level)
        }
        _ => None,
    }
}

#[test]
fn test_flipped_data_bit_is_detected() {
    let image = Image::new(vec![10, 10], 8192);
    image.populate();
    image.flip_bit(2, 5000, 3);

    let tree = image.mount(StorageKind::SaveData);
    let mut buf = vec![0u8; 8192];
    let err = tree.read(0, &mut buf).unwrap_err();
    assert!(matches!(err, IntegrityError::HashMismatch { level: 2, offset: 4096 }));
}

#[test]
fn test_corrupted_block_is_zeroed_and_neighbours_returned() {
    let image = Image::new(vec![10, 10], 4096);
    let data = image.populate();
    image.flip_bit(2, 1024, 0);

    let tree = image.mount(StorageKind::SaveData);
    let mut buf = vec![0xEEu8; 4096];
    assert!(tree.read(0, &mut buf).unwrap_err().is_integrity_error());

    assert_eq!(&buf[..1024], &data[..1024]);
    assert!(buf[1024..2048].iter().all(|&b| b == 0));
    assert_eq!(&buf[2048..], &data[2048..]);
}

#[test]
fn test_flipped_master_bit_is_detected() {
    let image = Image::new(vec![9, 9, 9], 4096);
    image.populate();
    image.flip_bit(0, 0, 7);

    let tree = image.mount(StorageKind::SaveData);
    let mut buf = [0u8; 16];
    let err = tree.read(0, &mut buf).unwrap_err();
    assert_eq!(failed_level(&err), Some(1));
}

#[test]
fn test_clear_signature_fails_later_reads() {
    let image = Image::new(vec![10, 10], 4096);
    image.populate();

    let tree = image.mount(StorageKind::SaveData);
    tree.operate_range(OperationId::ClearSignature, 1024, 1024).unwrap();
    tree.commit().unwrap();

    let mut buf = [0u8; 1024];
    tree.read(0, &mut buf).unwrap();
    assert!(tree.read(1024, &mut buf).unwrap_err().is_integrity_error());
}

#[test]
fn test_sealed_archive_detects_tampering() {
    let image = Image::new(vec![9, 9], 5000);
    image.storages.layers[1].write(0, &vec![0x5Au8; 5000]).unwrap();
    seal(&image.info, &image.storages, StorageKind::Archive).unwrap();

    {
        let tree = image.mount(StorageKind::Archive);
        let mut buf = vec![0u8; 5000];
        tree.read(0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0x5A));
    }

    image.flip_bit(2, 4999, 1);
    let tree = image.mount(StorageKind::Archive);
    let mut tail = [0u8; 8];
    let err = tree.read(4992, &mut tail).unwrap_err();
    assert_eq!(failed_level(&err), Some(2));
}

#[test]
fn test_unsealed_archive_fails_verification() {
    let image = Image::new(vec![10, 10], 2048);
    let tree = image.mount(StorageKind::Archive);

    let mut buf = [0u8; 16];
    assert!(tree.read(0, &mut buf).unwrap_err().is_integrity_error());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_any_flipped_bit_fails_read(
        layer_pick in any::<prop::sample::Index>(),
        offset_pick in any::<prop::sample::Index>(),
        bit in 0u8..8
    ) {
        let image = Image::new(vec![7, 7, 8], 6000);
        image.populate();

        let layer = layer_pick.index(image.info.layer_count());
        let offset = offset_pick.index(image.layer_size(layer) as usize) as u64;
        image.flip_bit(layer, offset, bit);

        let tree = image.mount(StorageKind::SaveData);
        let mut buf = vec![0u8; 6000];
        let err = tree.read(0, &mut buf).unwrap_err();
        prop_assert!(err.is_integrity_error());
        prop_assert_eq!(failed_level(&err), Some(layer.max(1)));
    }
}
