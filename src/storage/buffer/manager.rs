use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use log::{debug, trace};
use parking_lot::{Mutex, RwLock};

use crate::common::types::{Frame, FrameId, FramePtr, Page, PageId, PagePtr, PAGE_SIZE};
use crate::storage::buffer::error::BufferPoolError;
use crate::storage::buffer::replacer::{build_replacer, ReplacementPolicy, Replacer};
use crate::storage::buffer::stats::{BufferPoolStats, StatsSnapshot};
use crate::storage::disk::DiskManager;

const INVALID_PAGE_ID: PageId = 0;

/// Invoked before any dirty page is written back. The transaction layer
/// installs a hook that forces the WAL durable, preserving the
/// write-ahead ordering: no page reaches the data file before the log
/// records covering it.
pub type PreFlushHook = Box<dyn Fn() -> std::result::Result<(), String> + Send + Sync>;

/// Fixed-size cache of pages backed by the data file.
///
/// The pool is the sole owner of resident page memory; callers receive
/// pinned `PagePtr` handles and must unpin exactly once per fetch. All
/// structural operations (fetch, new, delete, resize) run under a single
/// internal latch; the pool is a critical section, not a lock-free
/// structure.
pub struct BufferPoolManager {
    latch: Mutex<()>,
    frames: RwLock<Vec<FramePtr>>,
    page_table: RwLock<HashMap<PageId, FrameId>>,
    free_list: RwLock<VecDeque<FrameId>>,
    replacer: Mutex<Box<dyn Replacer>>,
    disk_manager: Arc<DiskManager>,
    stats: BufferPoolStats,
    access_tick: AtomicU64,
    pre_flush_hook: RwLock<Option<PreFlushHook>>,
}

impl BufferPoolManager {
    pub fn new(
        pool_size: usize,
        policy: ReplacementPolicy,
        disk_manager: Arc<DiskManager>,
    ) -> Self {
        let mut frames = Vec::with_capacity(pool_size);
        let mut free_list = VecDeque::with_capacity(pool_size);

        for i in 0..pool_size {
            let frame_id = i as FrameId;
            let frame = Frame::new(frame_id, Arc::new(RwLock::new(Page::new(INVALID_PAGE_ID))));
            frames.push(Arc::new(RwLock::new(frame)));
            free_list.push_back(frame_id);
        }

        Self {
            latch: Mutex::new(()),
            frames: RwLock::new(frames),
            page_table: RwLock::new(HashMap::new()),
            free_list: RwLock::new(free_list),
            replacer: Mutex::new(build_replacer(policy, pool_size)),
            disk_manager,
            stats: BufferPoolStats::new(),
            access_tick: AtomicU64::new(0),
            pre_flush_hook: RwLock::new(None),
        }
    }

    /// Install the hook run before every dirty-page write-back.
    pub fn set_pre_flush_hook(&self, hook: PreFlushHook) {
        *self.pre_flush_hook.write() = Some(hook);
    }

    fn run_pre_flush_hook(&self) -> Result<(), BufferPoolError> {
        if let Some(hook) = self.pre_flush_hook.read().as_ref() {
            hook().map_err(BufferPoolError::WalFlushFailed)?;
        }
        Ok(())
    }

    /// Current number of frames.
    pub fn pool_size(&self) -> usize {
        self.frames.read().len()
    }

    /// Observational statistics. These never influence pool behavior.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Reset the statistics counters.
    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    /// Fetch a page, pinned, loading it from the data file on a miss.
    pub fn fetch_page(&self, page_id: PageId) -> Result<PagePtr, BufferPoolError> {
        if page_id == INVALID_PAGE_ID {
            return Err(BufferPoolError::InvalidOperation(
                "Cannot fetch the reserved metadata page".to_string(),
            ));
        }

        let _guard = self.latch.lock();
        let tick = self.access_tick.fetch_add(1, Ordering::Relaxed) + 1;

        // Resident?
        if let Some(&frame_id) = self.page_table.read().get(&page_id) {
            let frame = self.frame_ptr(frame_id);
            {
                let mut frame_guard = frame.write();
                frame_guard.pin_count += 1;
                frame_guard.last_accessed = tick;
            }

            let mut replacer = self.replacer.lock();
            replacer.record_access(frame_id);
            replacer.set_evictable(frame_id, false);

            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(frame.read().page.clone());
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);

        // Miss: take a frame and load from disk.
        let frame_id = self.allocate_frame()?;
        let frame = self.frame_ptr(frame_id);

        let mut new_page = Page::new(page_id);
        self.disk_manager.read_page(page_id, &mut new_page)?;

        {
            let mut frame_guard = frame.write();
            *frame_guard.page.write() = new_page;
            frame_guard.pin_count = 1;
            frame_guard.is_dirty = false;
            frame_guard.last_accessed = tick;
        }

        self.page_table.write().insert(page_id, frame_id);
        {
            let mut replacer = self.replacer.lock();
            replacer.record_access(frame_id);
            replacer.set_evictable(frame_id, false);
        }

        let page = frame.read().page.clone();
        Ok(page)
    }

    /// Allocate a fresh page on disk and pin it in the pool.
    pub fn new_page(&self) -> Result<(PagePtr, PageId), BufferPoolError> {
        let _guard = self.latch.lock();
        let tick = self.access_tick.fetch_add(1, Ordering::Relaxed) + 1;

        let page_id = self.disk_manager.allocate_page()?;
        let frame_id = self.allocate_frame()?;
        let frame = self.frame_ptr(frame_id);

        {
            let mut frame_guard = frame.write();
            *frame_guard.page.write() = Page::new(page_id);
            frame_guard.pin_count = 1;
            frame_guard.is_dirty = true;
            frame_guard.last_accessed = tick;
        }

        self.page_table.write().insert(page_id, frame_id);
        {
            let mut replacer = self.replacer.lock();
            replacer.record_access(frame_id);
            replacer.set_evictable(frame_id, false);
        }

        trace!("allocated page {} into frame {}", page_id, frame_id);
        let page = frame.read().page.clone();
        Ok((page, page_id))
    }

    /// Unpin a page, optionally marking it dirty. Each successful fetch
    /// must be matched by exactly one unpin.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> Result<(), BufferPoolError> {
        let _guard = self.latch.lock();

        let frame_id = {
            let page_table = self.page_table.read();
            match page_table.get(&page_id) {
                Some(&id) => id,
                None => return Err(BufferPoolError::PageNotFound(page_id)),
            }
        };

        let frame = self.frame_ptr(frame_id);
        let pin_count = {
            let mut frame_guard = frame.write();
            if frame_guard.pin_count == 0 {
                return Err(BufferPoolError::InvalidOperation(format!(
                    "Page {} is not pinned",
                    page_id
                )));
            }
            frame_guard.pin_count -= 1;
            if is_dirty {
                frame_guard.is_dirty = true;
            }
            frame_guard.pin_count
        };

        if pin_count == 0 {
            self.replacer.lock().set_evictable(frame_id, true);
        }

        Ok(())
    }

    /// Write a dirty page back to the data file and clear its dirty bit.
    pub fn flush_page(&self, page_id: PageId) -> Result<(), BufferPoolError> {
        let _guard = self.latch.lock();
        self.flush_page_locked(page_id)
    }

    /// Flush every resident dirty page (checkpoint / shutdown path).
    pub fn flush_all_pages(&self) -> Result<(), BufferPoolError> {
        let _guard = self.latch.lock();
        let page_ids: Vec<PageId> = self.page_table.read().keys().copied().collect();
        for page_id in page_ids {
            self.flush_page_locked(page_id)?;
        }
        Ok(())
    }

    /// Drop a resident page from the pool. Fails while the page is pinned.
    pub fn delete_page(&self, page_id: PageId) -> Result<(), BufferPoolError> {
        let _guard = self.latch.lock();

        let frame_id = match self.page_table.read().get(&page_id) {
            Some(&id) => id,
            None => return Ok(()),
        };

        let frame = self.frame_ptr(frame_id);
        {
            let mut frame_guard = frame.write();
            if frame_guard.pin_count > 0 {
                return Err(BufferPoolError::InvalidOperation(format!(
                    "Cannot delete page {} because it is pinned",
                    page_id
                )));
            }
            *frame_guard.page.write() = Page::new(INVALID_PAGE_ID);
            frame_guard.is_dirty = false;
        }

        self.page_table.write().remove(&page_id);
        self.replacer.lock().remove(frame_id);
        self.free_list.write().push_back(frame_id);

        Ok(())
    }

    /// Warm the cache with a batch of pages. Stops early when the pool
    /// has no frame to spare; prefetching is best-effort.
    pub fn prefetch_pages(&self, page_ids: &[PageId]) -> Result<(), BufferPoolError> {
        for &page_id in page_ids {
            match self.fetch_page(page_id) {
                Ok(_) => self.unpin_page(page_id, false)?,
                Err(BufferPoolError::PoolExhausted) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Approximate memory held by the pool's resident pages.
    pub fn memory_usage(&self) -> usize {
        self.pool_size() * PAGE_SIZE + std::mem::size_of::<Self>()
    }

    /// Resize the pool. Growing adds empty frames; shrinking requires
    /// every frame above the new size to be unpinned (dirty ones are
    /// flushed before their frame is dropped).
    pub fn resize(&self, new_size: usize) -> Result<(), BufferPoolError> {
        if new_size == 0 {
            return Err(BufferPoolError::InvalidOperation(
                "Pool size must be at least one frame".to_string(),
            ));
        }

        let _guard = self.latch.lock();
        let current = self.frames.read().len();

        if new_size >= current {
            let mut frames = self.frames.write();
            let mut free_list = self.free_list.write();
            for i in current..new_size {
                let frame_id = i as FrameId;
                frames.push(Arc::new(RwLock::new(Frame::new(
                    frame_id,
                    Arc::new(RwLock::new(Page::new(INVALID_PAGE_ID))),
                ))));
                free_list.push_back(frame_id);
            }
            return Ok(());
        }

        // Shrink path: every dropped frame must be unpinned.
        for i in new_size..current {
            let frame = self.frame_ptr(i as FrameId);
            if frame.read().pin_count > 0 {
                return Err(BufferPoolError::PoolExhausted);
            }
        }

        for i in new_size..current {
            let frame_id = i as FrameId;
            let frame = self.frame_ptr(frame_id);
            let (page_id, dirty) = {
                let frame_guard = frame.read();
                let page_guard = frame_guard.page.read();
                (page_guard.page_id, frame_guard.is_dirty)
            };

            if page_id != INVALID_PAGE_ID {
                if dirty {
                    self.run_pre_flush_hook()?;
                    let page_copy = frame.read().page.read().clone();
                    self.disk_manager.write_page(&page_copy)?;
                    self.stats.flushes.fetch_add(1, Ordering::Relaxed);
                }
                self.page_table.write().remove(&page_id);
            }
            self.replacer.lock().remove(frame_id);
        }

        self.free_list
            .write()
            .retain(|&id| (id as usize) < new_size);
        self.frames.write().truncate(new_size);

        debug!("resized buffer pool from {} to {} frames", current, new_size);
        Ok(())
    }

    fn frame_ptr(&self, frame_id: FrameId) -> FramePtr {
        self.frames.read()[frame_id as usize].clone()
    }

    fn flush_page_locked(&self, page_id: PageId) -> Result<(), BufferPoolError> {
        let frame_id = {
            let page_table = self.page_table.read();
            match page_table.get(&page_id) {
                Some(&id) => id,
                None => return Err(BufferPoolError::PageNotFound(page_id)),
            }
        };

        let frame = self.frame_ptr(frame_id);
        let needs_flush = frame.read().is_dirty;

        if needs_flush {
            self.run_pre_flush_hook()?;
            let page_copy = frame.read().page.read().clone();
            self.disk_manager.write_page(&page_copy)?;
            frame.write().is_dirty = false;
            self.stats.flushes.fetch_add(1, Ordering::Relaxed);
        }

        Ok(())
    }

    /// Take a frame from the free list or evict a victim.
    fn allocate_frame(&self) -> Result<FrameId, BufferPoolError> {
        if let Some(frame_id) = self.free_list.write().pop_front() {
            return Ok(frame_id);
        }

        if let Some(victim_id) = self.replacer.lock().victim() {
            let frame = self.frame_ptr(victim_id);
            let (old_page_id, dirty) = {
                let frame_guard = frame.read();
                // Replacers only hand out frames marked evictable, and the
                // evictable set tracks pin counts under the pool latch.
                debug_assert_eq!(frame_guard.pin_count, 0);
                let page_guard = frame_guard.page.read();
                (page_guard.page_id, frame_guard.is_dirty)
            };

            if dirty {
                self.run_pre_flush_hook()?;
                let page_copy = frame.read().page.read().clone();
                self.disk_manager.write_page(&page_copy)?;
                frame.write().is_dirty = false;
                self.stats.flushes.fetch_add(1, Ordering::Relaxed);
            }

            if old_page_id != INVALID_PAGE_ID {
                self.page_table.write().remove(&old_page_id);
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                trace!("evicted page {} from frame {}", old_page_id, victim_id);
            }

            return Ok(victim_id);
        }

        Err(BufferPoolError::PoolExhausted)
    }
}
