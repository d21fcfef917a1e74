use std::{
    collections::VecDeque,
    fmt,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard,
    },
};

use anyhow::{Context, Result};
use log::{debug, trace, warn};

use crate::{
    container::extendible_hash_table::ExtendibleHashTable,
    storage::{
        disk::manager::DiskManager,
        page::page::{zeroed_buffer, PageId, INVALID_PAGE_ID},
    },
    utils::replacer::{FrameId, LRUKReplacer, Replacer},
    wal::Wal,
};

// Capacity of one page-table bucket before it splits.
pub const DEFAULT_BUCKET_SIZE: usize = 4;

/// One cache slot: a page-sized buffer plus the metadata the pool tracks
/// for it. Lives behind a per-frame `RwLock` so a client holding a
/// `PageHandle` can touch the buffer after the pool call returns.
pub struct FrameHeader {
    page_id: PageId,
    pin_count: u32,
    is_dirty: bool,
    data: Box<[u8]>,
}

impl FrameHeader {
    fn new() -> Self {
        FrameHeader {
            page_id: INVALID_PAGE_ID,
            pin_count: 0,
            is_dirty: false,
            data: zeroed_buffer(),
        }
    }

    // Back to the state of a frame on the free list.
    fn reset(&mut self) {
        self.page_id = INVALID_PAGE_ID;
        self.pin_count = 0;
        self.is_dirty = false;
        self.data.fill(0);
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn is_dirty(&self) -> bool {
        self.is_dirty
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// Access to a pinned page. The pin taken by `new_page`/`fetch_page` lasts
/// until the caller hands the page id back through `unpin_page`, exactly
/// once per handle. Dropping the handle alone does not release the pin.
pub struct PageHandle {
    page_id: PageId,
    frame_id: FrameId,
    frame: Arc<RwLock<FrameHeader>>,
}

impl PageHandle {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    pub fn read(&self) -> RwLockReadGuard<'_, FrameHeader> {
        self.frame.read().unwrap()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, FrameHeader> {
        self.frame.write().unwrap()
    }
}

impl fmt::Debug for PageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageHandle")
            .field("page_id", &self.page_id)
            .field("frame_id", &self.frame_id)
            .finish()
    }
}

struct PoolState {
    free_list: VecDeque<FrameId>,
}

/// Fixed-capacity buffer pool between the disk page store and in-memory
/// clients. Frames are found through an extendible-hash page table and
/// reclaimed through LRU-K replacement; pinned frames are never evicted,
/// and dirty frames are written back before their slot is reused.
pub struct BufferPoolManager {
    next_page_id: AtomicU32,

    frames: Vec<Arc<RwLock<FrameHeader>>>,

    // Pool-wide latch; held across every operation so compound effects
    // (lookup + pin, evict + remap) are atomic to other clients.
    latch: Mutex<PoolState>,

    page_table: ExtendibleHashTable<PageId, FrameId>,
    replacer: LRUKReplacer,

    disk: Mutex<Box<dyn DiskManager>>,
    wal: Option<Arc<Wal>>,
}

impl BufferPoolManager {
    pub fn new(
        pool_size: usize,
        disk: Box<dyn DiskManager>,
        replacer_k: usize,
        wal: Option<Arc<Wal>>,
    ) -> Self {
        Self::with_bucket_size(pool_size, disk, replacer_k, wal, DEFAULT_BUCKET_SIZE)
    }

    pub fn with_bucket_size(
        pool_size: usize,
        disk: Box<dyn DiskManager>,
        replacer_k: usize,
        wal: Option<Arc<Wal>>,
        bucket_size: usize,
    ) -> Self {
        let frames = (0..pool_size)
            .map(|_| Arc::new(RwLock::new(FrameHeader::new())))
            .collect();
        let free_list = (0..pool_size).map(|i| i as FrameId).collect();

        BufferPoolManager {
            next_page_id: AtomicU32::new(0),
            frames,
            latch: Mutex::new(PoolState { free_list }),
            page_table: ExtendibleHashTable::new(bucket_size),
            replacer: LRUKReplacer::new(pool_size, replacer_k),
            disk: Mutex::new(disk),
            wal,
        }
    }

    fn allocate_page(&self) -> PageId {
        self.next_page_id.fetch_add(1, Ordering::SeqCst)
    }

    fn handle_for(&self, frame_id: FrameId, page_id: PageId) -> PageHandle {
        PageHandle {
            page_id,
            frame_id,
            frame: Arc::clone(&self.frames[frame_id as usize]),
        }
    }

    // Log-before-data: the WAL reaches the OS before any page write-back.
    fn force_wal(&self) -> Result<()> {
        match &self.wal {
            Some(wal) => wal.flush(),
            None => Ok(()),
        }
    }

    // Pops a free frame, or victimizes one through the replacer, writing
    // its old contents back first when dirty. A write-back failure aborts
    // the eviction: the victim goes back to the replacer with its mapping
    // intact, so the caller can retry once the disk recovers.
    fn acquire_frame(&self, state: &mut MutexGuard<'_, PoolState>) -> Result<Option<FrameId>> {
        if let Some(frame_id) = state.free_list.pop_front() {
            return Ok(Some(frame_id));
        }

        let Some(victim) = self.replacer.evict() else {
            return Ok(None);
        };

        let (old_page, is_dirty) = {
            let frame = self.frames[victim as usize].read().unwrap();
            (frame.page_id(), frame.is_dirty())
        };

        if is_dirty {
            let written = self.force_wal().and_then(|_| {
                let frame = self.frames[victim as usize].read().unwrap();
                self.disk.lock().unwrap().write_page(old_page, frame.data())
            });
            if let Err(err) = written {
                self.replacer.record_access(victim);
                self.replacer.set_evictable(victim, true);
                return Err(err)
                    .with_context(|| format!("write back of page {} failed", old_page));
            }
            debug!("wrote back dirty page {} from frame {}", old_page, victim);
        }

        self.page_table.remove(&old_page);
        self.frames[victim as usize].write().unwrap().page_id = INVALID_PAGE_ID;
        trace!("evicted page {} from frame {}", old_page, victim);

        Ok(Some(victim))
    }

    /// Allocates a fresh page id and pins it into a frame with a zeroed
    /// buffer. `Ok(None)` means every frame is pinned.
    pub fn new_page(&self) -> Result<Option<PageHandle>> {
        let mut state = self.latch.lock().unwrap();

        if state.free_list.is_empty() && self.replacer.size() == 0 {
            return Ok(None);
        }
        let Some(frame_id) = self.acquire_frame(&mut state)? else {
            return Ok(None);
        };

        let page_id = self.allocate_page();
        self.page_table.insert(page_id, frame_id);
        {
            let mut frame = self.frames[frame_id as usize].write().unwrap();
            frame.reset();
            frame.page_id = page_id;
            frame.pin_count = 1;
        }
        self.replacer.set_evictable(frame_id, false);
        self.replacer.record_access(frame_id);

        Ok(Some(self.handle_for(frame_id, page_id)))
    }

    /// Pins the requested page, reading it from disk on a miss. `Ok(None)`
    /// means the page is not resident and every frame is pinned.
    pub fn fetch_page(&self, page_id: PageId) -> Result<Option<PageHandle>> {
        let mut state = self.latch.lock().unwrap();

        if let Some(frame_id) = self.page_table.find(&page_id) {
            self.frames[frame_id as usize].write().unwrap().pin_count += 1;
            self.replacer.set_evictable(frame_id, false);
            self.replacer.record_access(frame_id);
            trace!("page {} hit in frame {}", page_id, frame_id);

            return Ok(Some(self.handle_for(frame_id, page_id)));
        }

        if state.free_list.is_empty() && self.replacer.size() == 0 {
            return Ok(None);
        }
        let Some(frame_id) = self.acquire_frame(&mut state)? else {
            return Ok(None);
        };

        self.page_table.insert(page_id, frame_id);
        let read = {
            let mut frame = self.frames[frame_id as usize].write().unwrap();
            frame.reset();
            frame.page_id = page_id;
            frame.pin_count = 1;
            self.disk.lock().unwrap().read_page(page_id, frame.data_mut())
        };
        if let Err(err) = read {
            // Undo the half-installed mapping so the frame is reusable.
            self.page_table.remove(&page_id);
            self.frames[frame_id as usize].write().unwrap().reset();
            state.free_list.push_front(frame_id);
            return Err(err).with_context(|| format!("fetch of page {} failed", page_id));
        }
        self.replacer.set_evictable(frame_id, false);
        self.replacer.record_access(frame_id);

        Ok(Some(self.handle_for(frame_id, page_id)))
    }

    /// Releases one pin. Returns `false` when the page is not resident or
    /// was not pinned. The dirty flag is sticky: a clean unpin never clears
    /// a previous dirty one.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        let _state = self.latch.lock().unwrap();

        let Some(frame_id) = self.page_table.find(&page_id) else {
            return false;
        };

        let mut frame = self.frames[frame_id as usize].write().unwrap();
        if frame.pin_count == 0 {
            warn!("unpin of page {} which holds no pins", page_id);
            return false;
        }
        frame.pin_count -= 1;
        frame.is_dirty |= is_dirty;
        let unpinned = frame.pin_count == 0;
        drop(frame);

        if unpinned {
            self.replacer.set_evictable(frame_id, true);
        }
        true
    }

    /// Writes the page's buffer to disk whether or not it is dirty and
    /// clears the dirty flag. Returns `false` when the page is not resident.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        let _state = self.latch.lock().unwrap();

        let Some(frame_id) = self.page_table.find(&page_id) else {
            return Ok(false);
        };

        self.force_wal()?;
        let mut frame = self.frames[frame_id as usize].write().unwrap();
        self.disk
            .lock()
            .unwrap()
            .write_page(page_id, frame.data())
            .with_context(|| format!("flush of page {} failed", page_id))?;
        frame.is_dirty = false;

        Ok(true)
    }

    /// Writes every dirty resident page to disk and marks it clean.
    pub fn flush_all(&self) -> Result<()> {
        let _state = self.latch.lock().unwrap();

        self.force_wal()?;
        for frame in &self.frames {
            let mut frame = frame.write().unwrap();
            if frame.page_id != INVALID_PAGE_ID && frame.is_dirty {
                self.disk
                    .lock()
                    .unwrap()
                    .write_page(frame.page_id, frame.data())
                    .with_context(|| format!("flush of page {} failed", frame.page_id))?;
                frame.is_dirty = false;
            }
        }

        Ok(())
    }

    /// Drops the page from the cache and hints the disk manager that its
    /// storage may be reclaimed. Deleting an absent page succeeds; deleting
    /// a pinned page is refused with `false`.
    pub fn delete_page(&self, page_id: PageId) -> Result<bool> {
        let mut state = self.latch.lock().unwrap();

        let Some(frame_id) = self.page_table.find(&page_id) else {
            return Ok(true);
        };

        {
            let mut frame = self.frames[frame_id as usize].write().unwrap();
            if frame.pin_count > 0 {
                return Ok(false);
            }
            self.page_table.remove(&page_id);
            self.replacer.remove(frame_id);
            frame.reset();
        }
        state.free_list.push_front(frame_id);
        self.disk
            .lock()
            .unwrap()
            .deallocate_page(page_id)
            .with_context(|| format!("deallocation of page {} failed", page_id))?;

        Ok(true)
    }

    pub fn get_pin_count(&self, page_id: PageId) -> Option<u32> {
        let _state = self.latch.lock().unwrap();
        let frame_id = self.page_table.find(&page_id)?;
        Some(self.frames[frame_id as usize].read().unwrap().pin_count)
    }

    #[cfg(test)]
    pub(crate) fn assert_invariants(&self) {
        let state = self.latch.lock().unwrap();

        let mut evictable = 0;
        for (i, frame) in self.frames.iter().enumerate() {
            let frame_id = i as FrameId;
            let frame = frame.read().unwrap();

            if state.free_list.contains(&frame_id) {
                assert_eq!(frame.page_id, INVALID_PAGE_ID, "free frame {} is mapped", i);
                assert_eq!(frame.pin_count, 0, "free frame {} is pinned", i);
            } else {
                assert_ne!(
                    frame.page_id, INVALID_PAGE_ID,
                    "frame {} is neither free nor mapped",
                    i
                );
                assert_eq!(
                    self.page_table.find(&frame.page_id),
                    Some(frame_id),
                    "page table disagrees about frame {}",
                    i
                );
            }

            if self.replacer.is_evictable(frame_id) {
                evictable += 1;
                assert_eq!(frame.pin_count, 0, "pinned frame {} is evictable", i);
                assert!(
                    !state.free_list.contains(&frame_id),
                    "free frame {} is evictable",
                    i
                );
            }
        }
        assert_eq!(evictable, self.replacer.size());
    }
}
