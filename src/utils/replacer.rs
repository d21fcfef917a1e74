use std::sync::Mutex;

use hashlink::LinkedHashMap;
use log::trace;

// Frames are identified by their slot index in the buffer pool.
pub type FrameId = u32;

pub trait Replacer {
    fn evict(&self) -> Option<FrameId>;
    fn record_access(&self, frame_id: FrameId);
    fn set_evictable(&self, frame_id: FrameId, evictable: bool);
    fn remove(&self, frame_id: FrameId);
    fn size(&self) -> usize;
}

struct ReplacerState {
    access_count: Vec<usize>,
    is_evictable: Vec<bool>,
    // Recency queues: entries are re-appended at the back on every access,
    // so the front of each map is the least-recently-accessed frame.
    // `history` holds frames with fewer than k accesses, `cache` the rest.
    history: LinkedHashMap<FrameId, ()>,
    cache: LinkedHashMap<FrameId, ()>,
    evictable_count: usize,
}

/// LRU-K replacement over the buffer pool's frames. Frames that have not yet
/// accumulated k accesses are victimized before any frame that has, oldest
/// access first within each class.
pub struct LRUKReplacer {
    capacity: usize,
    k: usize,
    state: Mutex<ReplacerState>,
}

impl LRUKReplacer {
    pub fn new(capacity: usize, k: usize) -> Self {
        assert!(k >= 1, "replacer k must be at least 1");

        LRUKReplacer {
            capacity,
            k,
            state: Mutex::new(ReplacerState {
                access_count: vec![0; capacity],
                is_evictable: vec![false; capacity],
                history: LinkedHashMap::new(),
                cache: LinkedHashMap::new(),
                evictable_count: 0,
            }),
        }
    }

    fn check_bounds(&self, frame_id: FrameId) {
        if frame_id as usize >= self.capacity {
            panic!(
                "frame id {} out of bounds for replacer of capacity {}",
                frame_id, self.capacity
            );
        }
    }

    #[cfg(test)]
    pub(crate) fn is_evictable(&self, frame_id: FrameId) -> bool {
        self.state.lock().unwrap().is_evictable[frame_id as usize]
    }

    #[cfg(test)]
    pub(crate) fn access_count(&self, frame_id: FrameId) -> usize {
        self.state.lock().unwrap().access_count[frame_id as usize]
    }
}

impl Replacer for LRUKReplacer {
    fn record_access(&self, frame_id: FrameId) {
        self.check_bounds(frame_id);
        let mut state = self.state.lock().unwrap();

        state.access_count[frame_id as usize] += 1;
        let count = state.access_count[frame_id as usize];

        // Detach-and-append keeps each queue in recency order with the
        // newest entry at the back.
        if count < self.k {
            state.history.remove(&frame_id);
            state.history.insert(frame_id, ());
        } else if count == self.k {
            state.history.remove(&frame_id);
            state.cache.insert(frame_id, ());
        } else {
            state.cache.remove(&frame_id);
            state.cache.insert(frame_id, ());
        }
    }

    fn evict(&self) -> Option<FrameId> {
        let mut state = self.state.lock().unwrap();
        if state.evictable_count == 0 {
            return None;
        }

        // Every sub-k frame is preferred over every hot frame, regardless
        // of recency across the two classes.
        let victim = {
            let evictable = &state.is_evictable;
            state
                .history
                .keys()
                .copied()
                .find(|f| evictable[*f as usize])
                .or_else(|| state.cache.keys().copied().find(|f| evictable[*f as usize]))
        };

        let frame_id = victim?;
        state.history.remove(&frame_id);
        state.cache.remove(&frame_id);
        state.access_count[frame_id as usize] = 0;
        state.is_evictable[frame_id as usize] = false;
        state.evictable_count -= 1;
        trace!("replacer evicts frame {}", frame_id);

        Some(frame_id)
    }

    fn set_evictable(&self, frame_id: FrameId, evictable: bool) {
        self.check_bounds(frame_id);
        let mut state = self.state.lock().unwrap();

        let current = state.is_evictable[frame_id as usize];
        if !current && evictable {
            state.evictable_count += 1;
        }
        if current && !evictable {
            state.evictable_count -= 1;
        }
        state.is_evictable[frame_id as usize] = evictable;
    }

    fn remove(&self, frame_id: FrameId) {
        self.check_bounds(frame_id);
        let mut state = self.state.lock().unwrap();

        let count = state.access_count[frame_id as usize];
        if count == 0 {
            return;
        }
        if !state.is_evictable[frame_id as usize] {
            // A tracked, non-evictable frame is pinned; removing it means
            // the caller broke the pin protocol.
            panic!("remove() on pinned frame {}", frame_id);
        }

        if count >= self.k {
            state.cache.remove(&frame_id);
        } else {
            state.history.remove(&frame_id);
        }
        state.access_count[frame_id as usize] = 0;
        state.is_evictable[frame_id as usize] = false;
        state.evictable_count -= 1;
    }

    fn size(&self) -> usize {
        self.state.lock().unwrap().evictable_count
    }
}
