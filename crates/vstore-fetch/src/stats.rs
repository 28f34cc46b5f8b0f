use std::sync::atomic::{AtomicU64, Ordering};

/// Coordinator counters.
#[derive(Debug, Default)]
pub struct FetchStats {
    pub(crate) cache_hits: AtomicU64,
    pub(crate) cache_misses: AtomicU64,
    pub(crate) coalesced: AtomicU64,
    pub(crate) backend_fetches: AtomicU64,
    pub(crate) fallbacks: AtomicU64,
    pub(crate) fetch_failures: AtomicU64,
    pub(crate) cache_write_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchStatsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Requests that joined a fetch already in flight.
    pub coalesced: u64,
    /// Fetches dispatched to backends (one per coalesced group).
    pub backend_fetches: u64,
    /// Times a fetch moved on to the next backend.
    pub fallbacks: u64,
    pub fetch_failures: u64,
    pub cache_write_failures: u64,
}

impl FetchStatsSnapshot {
    pub fn hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }
}

impl FetchStats {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> FetchStatsSnapshot {
        FetchStatsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            backend_fetches: self.backend_fetches.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
            cache_write_failures: self.cache_write_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate() {
        let stats = FetchStats::default();
        assert_eq!(stats.snapshot().hit_rate(), 0.0);
        FetchStats::bump(&stats.cache_hits);
        FetchStats::bump(&stats.cache_hits);
        FetchStats::bump(&stats.cache_hits);
        FetchStats::bump(&stats.cache_misses);
        assert!((stats.snapshot().hit_rate() - 0.75).abs() < f64::EPSILON);
    }
}
