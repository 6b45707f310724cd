//! Concurrent readers/writers stress tests

use integrity_tree::{
    AccessSemaphorePair, BufferPool, ControlHeader, Geometry, IntegrityTreeStorage,
    LevelStorages, MemoryStorage, Seed, Storage, StorageKind, TransactionalStorage, TreeConfig,
    TreeInformation,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

const REGION: u64 = 8 * 1024;

fn layout(data_size: u64) -> (TreeInformation, LevelStorages) {
    let geometry = Geometry::new(vec![9, 9, 10], data_size).unwrap();
    let header = ControlHeader::new(&geometry, Seed::generate()).unwrap();
    let info = header.tree_information().unwrap();

    let master: Arc<dyn Storage> = Arc::new(MemoryStorage::new(info.master_hash_size as usize));
    let image: Arc<dyn Storage> = Arc::new(MemoryStorage::new(header.image_size() as usize));
    let storages = LevelStorages::from_image(master, image, &info).unwrap();
    (info, storages)
}

fn mount(info: &TreeInformation, storages: &LevelStorages, config: TreeConfig, pool: Arc<BufferPool>) -> IntegrityTreeStorage {
    let mut tree = IntegrityTreeStorage::new(
        AccessSemaphorePair::new(4, Duration::from_millis(1)),
        config,
    );
    tree.initialize(info, storages, pool, Arc::new(Mutex::new(())), StorageKind::SaveData)
        .unwrap();
    tree
}

#[test]
fn test_8_writers_on_disjoint_regions() {
    let (info, storages) = layout(8 * REGION);
    // Tight caches force evictions while other threads are loading
    let config = TreeConfig::from_toml_str("[save_data]\ndata = 4\nhash = 2\n").unwrap();
    let tree = Arc::new(mount(&info, &storages, config, BufferPool::new(1 << 20)));

    let handles: Vec<_> = (0..8u64)
        .map(|thread_id| {
            let tree = Arc::clone(&tree);
            std::thread::spawn(move || {
                let base = thread_id * REGION;
                for i in 0..(REGION / 128) {
                    let value = (thread_id * 31 + i) as u8;
                    tree.write(base + i * 128, &[value; 128]).unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    tree.commit().unwrap();

    let verify = |tree: &IntegrityTreeStorage| {
        for thread_id in 0..8u64 {
            for i in 0..(REGION / 128) {
                let mut buf = [0u8; 128];
                tree.read(thread_id * REGION + i * 128, &mut buf).unwrap();
                assert_eq!(buf, [(thread_id * 31 + i) as u8; 128]);
            }
        }
    };
    verify(tree.as_ref());

    drop(tree);
    let remounted = mount(&info, &storages, TreeConfig::default(), BufferPool::new(1 << 20));
    verify(&remounted);
}

#[test]
fn test_readers_alongside_writer() {
    let (info, storages) = layout(4 * REGION);
    let tree = Arc::new(mount(&info, &storages, TreeConfig::default(), BufferPool::new(1 << 20)));

    tree.write(0, &[0x11; REGION as usize]).unwrap();
    tree.commit().unwrap();

    let handles: Vec<_> = (0..6)
        .map(|thread_id| {
            let tree = Arc::clone(&tree);
            std::thread::spawn(move || {
                if thread_id == 0 {
                    // Writer thread
                    for i in 0..200u64 {
                        let offset = REGION + (i * 97) % (3 * REGION - 64);
                        tree.write(offset, &[0x22; 64]).unwrap();
                    }
                } else {
                    // Reader thread, only on the stable region
                    for _ in 0..500 {
                        let offset = rand::random::<u64>() % (REGION - 256);
                        let mut buf = [0u8; 256];
                        tree.read(offset, &mut buf).unwrap();
                        assert!(buf.iter().all(|&b| b == 0x11));
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    tree.commit().unwrap();
}

#[test]
fn test_shared_pool_across_trees() {
    // Three trees with small caches share one budget that fits all of them
    let pool = BufferPool::new(20 * 1024);
    let config = TreeConfig::from_toml_str("[save_data]\ndata = 3\nhash = 1\n").unwrap();
    let trees: Vec<_> = (0..3)
        .map(|_| {
            let (info, storages) = layout(2 * REGION);
            Arc::new(mount(&info, &storages, config.clone(), Arc::clone(&pool)))
        })
        .collect();

    let handles: Vec<_> = trees
        .iter()
        .enumerate()
        .map(|(index, tree)| {
            let tree = Arc::clone(tree);
            std::thread::spawn(move || {
                for i in 0..(2 * REGION / 1024) {
                    tree.write(i * 1024, &[index as u8 + 1; 1024]).unwrap();
                }
                tree.commit().unwrap();

                let mut buf = vec![0u8; (2 * REGION) as usize];
                tree.read(0, &mut buf).unwrap();
                assert!(buf.iter().all(|&b| b == index as u8 + 1));
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    drop(trees);

    let stats = pool.stats();
    assert!(stats.peak <= 20 * 1024);
    assert_eq!(stats.failures, 0);
    assert_eq!(stats.allocated, 0);
}
