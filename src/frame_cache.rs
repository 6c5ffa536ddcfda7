//! # Frame Cache
//!
//! Least Recently Used cache of streamed frame query results.
//! Scrubbing the timeline back and forth revisits the same frames, so the
//! live query layer keeps the last few point-query results around.

use std::collections::HashMap;
use std::sync::Arc;

use crate::{AgentPosition, Frame};

/// LRU cache of per-frame positions with O(n) eviction.
///
/// Capacities are small (tens of frames), so a linear scan for the oldest
/// entry is fine. A capacity of 0 disables caching.
#[derive(Debug)]
pub struct FrameCache {
    capacity: usize,
    entries: HashMap<Frame, CachedFrame>,
    access_counter: u64,
    hits: u64,
    misses: u64,
}

#[derive(Debug)]
struct CachedFrame {
    positions: Arc<[AgentPosition]>,
    last_access: u64,
}

impl FrameCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::with_capacity(capacity),
            access_counter: 0,
            hits: 0,
            misses: 0,
        }
    }

    /// Cached positions for `frame`, updating its access time.
    pub fn get(&mut self, frame: Frame) -> Option<Arc<[AgentPosition]>> {
        match self.entries.get_mut(&frame) {
            Some(entry) => {
                self.access_counter += 1;
                entry.last_access = self.access_counter;
                self.hits += 1;
                Some(Arc::clone(&entry.positions))
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Store positions for `frame`, evicting the oldest entry at capacity.
    pub fn insert(&mut self, frame: Frame, positions: Arc<[AgentPosition]>) {
        if self.capacity == 0 {
            return;
        }

        self.access_counter += 1;
        if let Some(entry) = self.entries.get_mut(&frame) {
            entry.positions = positions;
            entry.last_access = self.access_counter;
            return;
        }

        if self.entries.len() >= self.capacity {
            self.evict_oldest();
        }
        self.entries.insert(
            frame,
            CachedFrame {
                positions,
                last_access: self.access_counter,
            },
        );
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.access_counter = 0;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn contains(&self, frame: Frame) -> bool {
        self.entries.contains_key(&frame)
    }

    /// `(hits, misses)` since creation.
    pub fn hit_stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_access)
            .map(|(&frame, _)| frame);

        if let Some(frame) = oldest {
            self.entries.remove(&frame);
        }
    }
}
