//! Request-rate tracking for routing hot objects.
//!
//! Each key keeps the timestamps of its most recent `threshold` requests. A
//! key is popular while the oldest of those falls inside the window, which
//! makes this an exact sliding-window count with bounded memory per key.
//!
//! At most `max_tracked` keys are kept. Passing the limit triggers one sweep
//! that drops stale keys and then the least recently requested ones, down to
//! nine tenths of the limit, so sweeps stay rare under a steady stream of new
//! keys.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;

use vstore_config::{BackendKind, PopularityConfig};
use vstore_model::Hash;

pub struct PopularityTracker {
    window: Duration,
    threshold: usize,
    pinned: BackendKind,
    max_tracked: usize,
    hits: DashMap<Hash, VecDeque<Instant>>,
    sweeping: AtomicBool,
}

impl PopularityTracker {
    /// `None` when routing by popularity is off or has nowhere to route to.
    pub fn from_config(config: &PopularityConfig) -> Option<Self> {
        if !config.enabled || config.threshold == 0 {
            return None;
        }
        let pinned = config.pinned_backend?;
        Some(Self::new(
            Duration::from_secs(config.window_secs),
            config.threshold as usize,
            pinned,
            config.max_tracked,
        ))
    }

    pub fn new(window: Duration, threshold: usize, pinned: BackendKind, max_tracked: usize) -> Self {
        Self {
            window,
            threshold: threshold.max(1),
            pinned,
            max_tracked: max_tracked.max(1),
            hits: DashMap::new(),
            sweeping: AtomicBool::new(false),
        }
    }

    pub fn pinned_backend(&self) -> BackendKind {
        self.pinned
    }

    /// Count a request for `key`; true if the key is now popular.
    pub fn record(&self, key: Hash) -> bool {
        self.record_at(key, Instant::now())
    }

    pub(crate) fn record_at(&self, key: Hash, now: Instant) -> bool {
        {
            let mut stamps = self.hits.entry(key).or_default();
            stamps.push_back(now);
            while stamps.len() > self.threshold {
                stamps.pop_front();
            }
        }
        let popular = self.is_popular_at(&key, now);

        if self.hits.len() > self.max_tracked {
            self.shrink(&key, now);
        }
        popular
    }

    /// Whether `key` is popular as of its last recorded request.
    pub fn is_popular(&self, key: &Hash) -> bool {
        self.is_popular_at(key, Instant::now())
    }

    pub(crate) fn is_popular_at(&self, key: &Hash, now: Instant) -> bool {
        self.hits.get(key).is_some_and(|stamps| {
            stamps.len() == self.threshold
                && stamps
                    .front()
                    .is_some_and(|oldest| now.saturating_duration_since(*oldest) <= self.window)
        })
    }

    /// Drop keys with no request inside the window, then the least recently
    /// requested keys other than `keep` until below the limit. Concurrent
    /// callers skip the sweep while one is running.
    fn shrink(&self, keep: &Hash, now: Instant) {
        if self.sweeping.swap(true, Ordering::Acquire) {
            return;
        }

        let window = self.window;
        self.hits.retain(|_, stamps| {
            stamps
                .back()
                .is_some_and(|newest| now.saturating_duration_since(*newest) <= window)
        });

        let target = self.max_tracked - self.max_tracked / 10;
        let len = self.hits.len();
        if len > target {
            let mut by_age: Vec<(Instant, Hash)> = self
                .hits
                .iter()
                .filter(|entry| entry.key() != keep)
                .filter_map(|entry| entry.value().back().map(|newest| (*newest, *entry.key())))
                .collect();
            by_age.sort_unstable_by_key(|(newest, _)| *newest);
            for (_, key) in by_age.into_iter().take(len - target) {
                self.hits.remove(&key);
            }
        }

        self.sweeping.store(false, Ordering::Release);
    }

    pub fn tracked(&self) -> usize {
        self.hits.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(threshold: usize) -> PopularityTracker {
        PopularityTracker::new(Duration::from_secs(10), threshold, BackendKind::Recas, 1000)
    }

    #[test]
    fn test_threshold_within_window() {
        let t = tracker(3);
        let key = Hash::of(b"hot");
        let start = Instant::now();
        assert!(!t.record_at(key, start));
        assert!(!t.record_at(key, start + Duration::from_secs(1)));
        assert!(t.record_at(key, start + Duration::from_secs(2)));
        // Still popular while the last three requests fit in the window.
        assert!(t.record_at(key, start + Duration::from_secs(5)));
    }

    #[test]
    fn test_window_slides() {
        let t = tracker(2);
        let key = Hash::of(b"cooling");
        let start = Instant::now();
        t.record_at(key, start);
        assert!(!t.record_at(key, start + Duration::from_secs(30)));
        assert!(t.record_at(key, start + Duration::from_secs(31)));
    }

    #[test]
    fn test_keys_counted_independently() {
        let t = tracker(2);
        let now = Instant::now();
        t.record_at(Hash::of(b"a"), now);
        assert!(!t.record_at(Hash::of(b"b"), now));
        assert!(t.record_at(Hash::of(b"a"), now));
    }

    #[test]
    fn test_stale_keys_evicted_past_limit() {
        let t = PopularityTracker::new(Duration::from_secs(10), 2, BackendKind::Legacy, 2);
        let start = Instant::now();
        t.record_at(Hash::of(b"1"), start);
        t.record_at(Hash::of(b"2"), start);
        let later = start + Duration::from_secs(60);
        t.record_at(Hash::of(b"3"), later);
        assert_eq!(t.tracked(), 1);
    }

    #[test]
    fn test_from_config_requires_pinned_backend() {
        let mut config = PopularityConfig {
            enabled: true,
            ..PopularityConfig::default()
        };
        assert!(PopularityTracker::from_config(&config).is_none());
        config.pinned_backend = Some(BackendKind::Recas);
        let t = PopularityTracker::from_config(&config).unwrap();
        assert_eq!(t.pinned_backend(), BackendKind::Recas);
        config.enabled = false;
        assert!(PopularityTracker::from_config(&config).is_none());
    }

    #[test]
    fn test_fresh_keys_capped_at_limit() {
        let t = PopularityTracker::new(Duration::from_secs(60), 2, BackendKind::Recas, 2);
        let now = Instant::now();
        for i in 0u32..1000 {
            t.record_at(Hash::of(&i.to_le_bytes()), now);
            assert!(t.tracked() <= 2);
        }
        // The key just recorded is never the one evicted.
        assert!(t.hits.contains_key(&Hash::of(&999u32.to_le_bytes())));
    }

    #[test]
    fn test_least_recent_keys_evicted_first() {
        let t = PopularityTracker::new(Duration::from_secs(600), 2, BackendKind::Recas, 10);
        let start = Instant::now();
        for i in 0u32..=10 {
            t.record_at(Hash::of(&i.to_le_bytes()), start + Duration::from_secs(i as u64));
        }
        assert_eq!(t.tracked(), 9);
        assert!(!t.hits.contains_key(&Hash::of(&0u32.to_le_bytes())));
        assert!(!t.hits.contains_key(&Hash::of(&1u32.to_le_bytes())));
        assert!(t.hits.contains_key(&Hash::of(&2u32.to_le_bytes())));

        // Popularity of surviving keys is unaffected.
        let hot = Hash::of(&5u32.to_le_bytes());
        assert!(t.record_at(hot, start + Duration::from_secs(11)));
    }
}
