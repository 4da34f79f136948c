//! Region eviction policies.
//!
//! Policies rank sealed regions for reclaim. The open region is never
//! tracked, so a policy can only ever name a sealed region as victim.

use std::collections::VecDeque;

use parking_lot::Mutex;

/// Picks the victim region for reclaim.
pub(crate) trait EvictionPolicy: Send + Sync {
    /// A region was sealed and became an eviction candidate.
    fn track(&self, region: u32);

    /// A tracked region served a read.
    fn touch(&self, region: u32);

    /// Select and remove the next victim.
    fn evict(&self) -> Option<u32>;
}

/// Evict the region least recently opened for read.
pub(crate) struct LruPolicy {
    /// Front is the coldest region.
    order: Mutex<VecDeque<u32>>,
}

impl LruPolicy {
    pub(crate) fn new() -> Self {
        Self {
            order: Mutex::new(VecDeque::new()),
        }
    }
}

impl EvictionPolicy for LruPolicy {
    fn track(&self, region: u32) {
        self.order.lock().push_back(region);
    }

    fn touch(&self, region: u32) {
        let mut order = self.order.lock();
        if let Some(pos) = order.iter().position(|&r| r == region) {
            order.remove(pos);
            order.push_back(region);
        }
    }

    fn evict(&self) -> Option<u32> {
        self.order.lock().pop_front()
    }
}

/// Evict the oldest sealed region, ignoring reads.
pub(crate) struct FifoPolicy {
    order: Mutex<VecDeque<u32>>,
}

impl FifoPolicy {
    pub(crate) fn new() -> Self {
        Self {
            order: Mutex::new(VecDeque::new()),
        }
    }
}

impl EvictionPolicy for FifoPolicy {
    fn track(&self, region: u32) {
        self.order.lock().push_back(region);
    }

    fn touch(&self, _region: u32) {}

    fn evict(&self) -> Option<u32> {
        self.order.lock().pop_front()
    }
}

/// Segmented FIFO: regions enter the tail segment, are promoted one
/// segment headward on access, and are evicted from the tail. Segment
/// lengths follow the configured ratio, with overflow demoting the oldest
/// region of a hot segment down one level.
pub(crate) struct SegmentedFifoPolicy {
    ratio: Vec<u32>,
    /// `segments[0]` is the head (hottest); the last entry is the tail.
    segments: Mutex<Vec<VecDeque<u32>>>,
}

impl SegmentedFifoPolicy {
    pub(crate) fn new(ratio: Vec<u32>) -> Self {
        assert!(!ratio.is_empty(), "segment ratio must not be empty");
        assert!(ratio.iter().all(|&r| r > 0), "segment ratio parts must be non-zero");
        let segments = (0..ratio.len()).map(|_| VecDeque::new()).collect();
        Self {
            ratio,
            segments: Mutex::new(segments),
        }
    }

    /// Trim every non-tail segment to its ratio share, demoting overflow
    /// toward the tail.
    fn rebalance(&self, segments: &mut [VecDeque<u32>]) {
        let total: usize = segments.iter().map(|s| s.len()).sum();
        let ratio_sum: u32 = self.ratio.iter().sum();
        for i in 0..segments.len() - 1 {
            let target = total * self.ratio[i] as usize / ratio_sum as usize;
            while segments[i].len() > target {
                let Some(region) = segments[i].pop_front() else {
                    break;
                };
                segments[i + 1].push_back(region);
            }
        }
    }
}

impl EvictionPolicy for SegmentedFifoPolicy {
    fn track(&self, region: u32) {
        let mut segments = self.segments.lock();
        let tail = segments.len() - 1;
        segments[tail].push_back(region);
        self.rebalance(&mut segments);
    }

    fn touch(&self, region: u32) {
        let mut segments = self.segments.lock();
        let found = segments.iter().enumerate().find_map(|(seg, q)| {
            q.iter().position(|&r| r == region).map(|pos| (seg, pos))
        });
        if let Some((seg, pos)) = found {
            if seg > 0 {
                segments[seg].remove(pos);
                segments[seg - 1].push_back(region);
                self.rebalance(&mut segments);
            }
        }
    }

    fn evict(&self) -> Option<u32> {
        let mut segments = self.segments.lock();
        for seg in (0..segments.len()).rev() {
            if let Some(region) = segments[seg].pop_front() {
                return Some(region);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lru_prefers_least_recently_read() {
        let policy = LruPolicy::new();
        policy.track(0);
        policy.track(1);
        policy.track(2);
        policy.touch(0);
        assert_eq!(policy.evict(), Some(1));
        assert_eq!(policy.evict(), Some(2));
        assert_eq!(policy.evict(), Some(0));
        assert_eq!(policy.evict(), None);
    }

    #[test]
    fn fifo_ignores_touches() {
        let policy = FifoPolicy::new();
        policy.track(0);
        policy.track(1);
        policy.touch(0);
        assert_eq!(policy.evict(), Some(0));
        assert_eq!(policy.evict(), Some(1));
    }

    #[test]
    fn sfifo_promotes_on_access_and_evicts_from_tail() {
        let policy = SegmentedFifoPolicy::new(vec![3, 1]);
        for region in 0..4 {
            policy.track(region);
        }
        // Promotion moves region 0 from the tail segment to the head.
        policy.touch(0);
        // Reclaim selects from the tail segment, not the promoted region.
        assert_eq!(policy.evict(), Some(1));
        assert_eq!(policy.evict(), Some(2));
        assert_eq!(policy.evict(), Some(3));
        assert_eq!(policy.evict(), Some(0));
    }

    #[test]
    fn sfifo_overflowing_head_demotes_oldest() {
        let policy = SegmentedFifoPolicy::new(vec![1, 1]);
        for region in 0..4 {
            policy.track(region);
        }
        for region in 0..4 {
            policy.touch(region);
        }
        // Head holds at most half of the tracked regions; the rest were
        // demoted back in age order and evict first.
        let first = policy.evict().unwrap();
        assert!(first < 2, "demoted region should evict first, got {first}");
    }

    #[test]
    fn single_segment_degenerates_to_fifo() {
        let policy = SegmentedFifoPolicy::new(vec![1]);
        policy.track(7);
        policy.track(8);
        policy.touch(7);
        assert_eq!(policy.evict(), Some(7));
        assert_eq!(policy.evict(), Some(8));
    }
}
