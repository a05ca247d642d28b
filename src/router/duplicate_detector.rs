use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;

use crate::common::RequestId;

/// Default number of routing attempts remembered.
pub const DEFAULT_DUPLICATE_DETECTOR_CAPACITY: usize = 10_000;
/// Default time a routing attempt is remembered.
pub const DEFAULT_DUPLICATE_DETECTOR_RETENTION: Duration = Duration::from_secs(5 * 60);

#[derive(Debug)]
/// Bounded, expiring set of recently seen routing request ids.
///
/// Memory is capped by the LRU capacity, so under heavy churn the oldest
/// ids are forgotten before their retention ends.
pub struct DuplicateDetector {
    seen: LruCache<RequestId, Instant>,
    retention: Duration,
}

impl DuplicateDetector {
    pub fn new(capacity: usize, retention: Duration) -> Self {
        Self {
            seen: LruCache::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)),
            retention,
        }
    }

    pub fn add(&mut self, request_id: RequestId) {
        self.seen.put(request_id, Instant::now());
    }

    pub fn is_most_likely_duplicate(&self, request_id: &RequestId) -> bool {
        self.seen
            .peek(request_id)
            .map(|seen_at| seen_at.elapsed() < self.retention)
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

impl Default for DuplicateDetector {
    fn default() -> Self {
        Self::new(
            DEFAULT_DUPLICATE_DETECTOR_CAPACITY,
            DEFAULT_DUPLICATE_DETECTOR_RETENTION,
        )
    }
}
