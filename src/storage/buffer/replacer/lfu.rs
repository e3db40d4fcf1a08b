use std::collections::{HashMap, HashSet};

use super::Replacer;
use crate::common::types::FrameId;

/// LFU (Least Frequently Used) replacement policy.
///
/// The victim is the evictable frame with the lowest access count; equal
/// counts fall back to the oldest access.
pub struct LfuReplacer {
    counts: HashMap<FrameId, u64>,
    last_access: HashMap<FrameId, u64>,
    evictable: HashSet<FrameId>,
    tick: u64,
}

impl LfuReplacer {
    pub fn new(pool_size: usize) -> Self {
        Self {
            counts: HashMap::with_capacity(pool_size),
            last_access: HashMap::with_capacity(pool_size),
            evictable: HashSet::with_capacity(pool_size),
            tick: 0,
        }
    }
}

impl Replacer for LfuReplacer {
    fn record_access(&mut self, frame_id: FrameId) {
        self.tick += 1;
        *self.counts.entry(frame_id).or_insert(0) += 1;
        self.last_access.insert(frame_id, self.tick);
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
            .evictable
            .iter()
            .copied()
            .min_by_key(|id| {
                (
                    self.counts.get(id).copied().unwrap_or(0),
                    self.last_access.get(id).copied().unwrap_or(0),
                )
            })?;

        self.counts.remove(&frame_id);
        self.last_access.remove(&frame_id);
        self.evictable.remove(&frame_id);
        Some(frame_id)
    }

    fn remove(&mut self, frame_id: FrameId) {
        self.counts.remove(&frame_id);
        self.last_access.remove(&frame_id);
        self.evictable.remove(&frame_id);
    }
}
