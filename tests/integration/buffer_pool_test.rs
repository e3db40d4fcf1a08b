// Buffer Pool Integration Tests

use std::collections::HashMap;
use std::sync::Arc;
use anyhow::Result;
use rand::prelude::*;
use tempfile::TempDir;

use granitedb::common::types::{PageId, PAGE_SIZE};
use granitedb::storage::buffer::{BufferPoolError, BufferPoolManager, ReplacementPolicy};
use granitedb::storage::disk::DiskManager;

fn setup_pool(
    dir: &TempDir,
    pool_size: usize,
    policy: ReplacementPolicy,
) -> Result<(Arc<DiskManager>, BufferPoolManager)> {
    let disk = Arc::new(DiskManager::new(dir.path().join("test.db"))?);
    let pool = BufferPoolManager::new(pool_size, policy, disk.clone());
    Ok((disk, pool))
}

/// Allocate `count` pages on disk, each stamped with its page id, and
/// leave them unpinned.
fn seed_pages(pool: &BufferPoolManager, count: usize) -> Result<Vec<PageId>> {
    let mut ids = Vec::with_capacity(count);
    for _ in 0..count {
        let (page, page_id) = pool.new_page()?;
        {
            let mut guard = page.write();
            guard.data[..8].copy_from_slice(&page_id.to_le_bytes());
        }
        pool.unpin_page(page_id, true)?;
        ids.push(page_id);
    }
    pool.flush_all_pages()?;
    Ok(ids)
}

#[test]
fn test_clock_evicts_first_unpinned_in_scan_order() -> Result<()> {
    let dir = TempDir::new()?;
    let (disk, seed) = setup_pool(&dir, 4, ReplacementPolicy::Clock)?;
    seed_pages(&seed, 4)?;
    drop(seed);

    // Fresh pool of 3 frames over the same file: fetch pages 1, 2, 3 to
    // fill it, then page 4 must evict page 1 (first unpinned in scan
    // order).
    let pool = BufferPoolManager::new(3, ReplacementPolicy::Clock, disk);
    for page_id in [1u64, 2, 3] {
        pool.fetch_page(page_id)?;
        pool.unpin_page(page_id, false)?;
    }

    pool.reset_stats();
    pool.fetch_page(4)?;
    pool.unpin_page(4, false)?;
    assert_eq!(pool.stats().evictions, 1);

    // Page 1 was the victim: fetching it again is a miss, while pages 2
    // and 3 are still resident.
    pool.fetch_page(2)?;
    pool.unpin_page(2, false)?;
    pool.fetch_page(3)?;
    pool.unpin_page(3, false)?;
    assert_eq!(pool.stats().misses, 1);

    pool.fetch_page(1)?;
    pool.unpin_page(1, false)?;
    assert_eq!(pool.stats().misses, 2);
    Ok(())
}

#[test]
fn test_lru_evicts_least_recently_used() -> Result<()> {
    let dir = TempDir::new()?;
    let (disk, seed) = setup_pool(&dir, 4, ReplacementPolicy::Lru)?;
    seed_pages(&seed, 4)?;
    drop(seed);

    let pool = BufferPoolManager::new(3, ReplacementPolicy::Lru, disk);
    for page_id in [1u64, 2, 3] {
        pool.fetch_page(page_id)?;
        pool.unpin_page(page_id, false)?;
    }

    // Touch page 1 so page 2 becomes the oldest.
    pool.fetch_page(1)?;
    pool.unpin_page(1, false)?;

    pool.fetch_page(4)?;
    pool.unpin_page(4, false)?;

    pool.reset_stats();
    pool.fetch_page(1)?;
    pool.unpin_page(1, false)?;
    pool.fetch_page(3)?;
    pool.unpin_page(3, false)?;
    assert_eq!(pool.stats().hits, 2, "pages 1 and 3 should still be resident");

    pool.fetch_page(2)?;
    pool.unpin_page(2, false)?;
    assert_eq!(pool.stats().misses, 1, "page 2 was the LRU victim");
    Ok(())
}

#[test]
fn test_lfu_evicts_lowest_access_count() -> Result<()> {
    let dir = TempDir::new()?;
    let (disk, seed) = setup_pool(&dir, 4, ReplacementPolicy::Lfu)?;
    seed_pages(&seed, 4)?;
    drop(seed);

    let pool = BufferPoolManager::new(3, ReplacementPolicy::Lfu, disk);
    for page_id in [1u64, 2, 3] {
        pool.fetch_page(page_id)?;
        pool.unpin_page(page_id, false)?;
    }
    // Bump pages 1 and 2; page 3 keeps the lowest count.
    for page_id in [1u64, 2, 1, 2] {
        pool.fetch_page(page_id)?;
        pool.unpin_page(page_id, false)?;
    }

    pool.fetch_page(4)?;
    pool.unpin_page(4, false)?;

    pool.reset_stats();
    pool.fetch_page(3)?;
    pool.unpin_page(3, false)?;
    assert_eq!(pool.stats().misses, 1, "page 3 was the LFU victim");
    Ok(())
}

#[test]
fn test_all_pinned_pool_is_exhausted() -> Result<()> {
    let dir = TempDir::new()?;
    let (_disk, pool) = setup_pool(&dir, 2, ReplacementPolicy::Clock)?;
    let ids = {
        let (_, id1) = pool.new_page()?;
        let (_, id2) = pool.new_page()?;
        [id1, id2]
    };

    match pool.new_page() {
        Err(BufferPoolError::PoolExhausted) => {}
        other => panic!("expected PoolExhausted, got {:?}", other.map(|(_, id)| id)),
    }

    // Unpinning one frame makes the pool usable again.
    pool.unpin_page(ids[0], false)?;
    pool.new_page()?;
    Ok(())
}

#[test]
fn test_randomized_pin_discipline() -> Result<()> {
    const POOL_SIZE: usize = 8;
    const NUM_PAGES: usize = 24;
    const OPS: usize = 2_000;

    let dir = TempDir::new()?;
    let (_disk, pool) = setup_pool(&dir, POOL_SIZE, ReplacementPolicy::Clock)?;
    let ids = seed_pages(&pool, NUM_PAGES)?;

    let mut rng = StdRng::seed_from_u64(0xB0F);
    let mut pins: HashMap<PageId, u32> = HashMap::new();

    for _ in 0..OPS {
        let fetch = pins.values().sum::<u32>() == 0 || rng.gen_bool(0.5);

        if fetch {
            let page_id = *ids.choose(&mut rng).unwrap();
            match pool.fetch_page(page_id) {
                Ok(page) => {
                    // A resident page always carries the bytes written at
                    // allocation time: pinned pages were never repurposed
                    // and dirty victims were written back.
                    let guard = page.read();
                    assert_eq!(guard.data[..8], page_id.to_le_bytes());
                    assert_eq!(guard.data[8..], [0u8; PAGE_SIZE - 8][..]);
                    *pins.entry(page_id).or_insert(0) += 1;
                }
                Err(BufferPoolError::PoolExhausted) => {
                    // Only legal when every frame is pinned.
                    let pinned_pages = pins.values().filter(|&&c| c > 0).count();
                    assert_eq!(pinned_pages, POOL_SIZE, "premature PoolExhausted");
                }
                Err(e) => return Err(e.into()),
            }
        } else {
            let pinned: Vec<PageId> = pins
                .iter()
                .filter(|(_, &c)| c > 0)
                .map(|(&id, _)| id)
                .collect();
            let page_id = *pinned.choose(&mut rng).unwrap();
            pool.unpin_page(page_id, false)?;
            *pins.get_mut(&page_id).unwrap() -= 1;
        }
    }

    // Drain all pins; the pool must end fully usable.
    for (page_id, count) in pins {
        for _ in 0..count {
            pool.unpin_page(page_id, false)?;
        }
    }
    for &page_id in &ids {
        pool.fetch_page(page_id)?;
        pool.unpin_page(page_id, false)?;
    }
    Ok(())
}

#[test]
fn test_stats_are_observational() -> Result<()> {
    let dir = TempDir::new()?;
    let (_disk, pool) = setup_pool(&dir, 4, ReplacementPolicy::Clock)?;
    let ids = seed_pages(&pool, 2)?;

    pool.reset_stats();
    pool.fetch_page(ids[0])?;
    pool.unpin_page(ids[0], false)?;
    pool.fetch_page(ids[0])?;
    pool.unpin_page(ids[0], false)?;
    pool.fetch_page(ids[1])?;
    pool.unpin_page(ids[1], false)?;

    let snap = pool.stats();
    assert_eq!(snap.hits + snap.misses, 3);
    assert!(snap.hit_ratio() > 0.0);

    // Resetting the counters changes nothing about residency.
    pool.reset_stats();
    pool.fetch_page(ids[0])?;
    pool.unpin_page(ids[0], false)?;
    assert_eq!(pool.stats().hits, 1);
    Ok(())
}

#[test]
fn test_resize_shrink_flushes_dropped_frames() -> Result<()> {
    let dir = TempDir::new()?;
    let (disk, pool) = setup_pool(&dir, 4, ReplacementPolicy::Lru)?;
    let ids = seed_pages(&pool, 4)?;

    // Dirty one page, then shrink under it.
    let page = pool.fetch_page(ids[3])?;
    page.write().data[100] = 0x77;
    pool.unpin_page(ids[3], true)?;

    pool.resize(1)?;
    assert_eq!(pool.pool_size(), 1);

    // The dirtied page was flushed on its way out.
    drop(pool);
    let pool = BufferPoolManager::new(2, ReplacementPolicy::Lru, disk);
    let page = pool.fetch_page(ids[3])?;
    assert_eq!(page.read().data[100], 0x77);
    pool.unpin_page(ids[3], false)?;
    Ok(())
}
