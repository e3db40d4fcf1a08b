use std::collections::HashSet;
use linked_hash_map::LinkedHashMap;

use super::Replacer;
use crate::common::types::FrameId;

/// LRU (Least Recently Used) replacement policy.
///
/// Access order is kept in a linked hash map: re-inserting on access moves
/// the frame to the back, so the front is always the least recently used.
pub struct LruReplacer {
    order: LinkedHashMap<FrameId, ()>,
    evictable: HashSet<FrameId>,
}

impl LruReplacer {
    pub fn new(pool_size: usize) -> Self {
        Self {
            order: LinkedHashMap::with_capacity(pool_size),
            evictable: HashSet::with_capacity(pool_size),
        }
    }
}

impl Replacer for LruReplacer {
    fn record_access(&mut self, frame_id: FrameId) {
        self.order.remove(&frame_id);
        self.order.insert(frame_id, ());
    }

    fn set_evictable(&mut self, frame_id: FrameId, evictable: bool) {
        if evictable {
            self.evictable.insert(frame_id);
        } else {
            self.evictable.remove(&frame_id);
        }
    }

    fn victim(&mut self) -> Option<FrameId> {
        let frame_id = self
            .order
            .keys()
            .copied()
            .find(|id| self.evictable.contains(id))?;
        self.order.remove(&frame_id);
        self.evictable.remove(&frame_id);
        Some(frame_id)
    }

    fn remove(&mut self, frame_id: FrameId) {
        self.order.remove(&frame_id);
        self.evictable.remove(&frame_id);
    }
}
