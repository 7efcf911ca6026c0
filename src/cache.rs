//! Single-entry memo for the last computed dashboard matrix.
//!
//! Keyed by `(site, from, to)`. Writers replace the entry (last write
//! wins); every mutation path clears it before the next read.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::NaiveDate;
use tracing::debug;

use crate::models::DateRange;
use crate::pivot::DashboardMatrix;

// ---

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    // ---
    pub site: String,
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl CacheKey {
    pub fn new(site: &str, range: &DateRange) -> Self {
        CacheKey {
            site: site.to_string(),
            from: range.from,
            to: range.to,
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    // ---
    entry: Option<(CacheKey, Arc<DashboardMatrix>)>,
    generation: u64,
}

#[derive(Debug, Default)]
pub struct DashboardCache {
    // ---
    slot: Mutex<Slot>,
}

impl DashboardCache {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    /// A poisoned lock only means a writer panicked mid-replace; the slot
    /// itself is still valid.
    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, key: &CacheKey) -> Option<Arc<DashboardMatrix>> {
        // ---
        let slot = self.slot();
        match slot.entry.as_ref() {
            Some((cached, matrix)) if cached == key => {
                debug!("Dashboard cache hit for {} {}..{}", key.site, key.from, key.to);
                Some(Arc::clone(matrix))
            }
            _ => None,
        }
    }

    /// Bumped by every invalidation. Read it before computing a matrix and
    /// hand it back to [`put`](Self::put).
    pub fn generation(&self) -> u64 {
        self.slot().generation
    }

    /// Store a matrix computed at `generation`; the previous entry is
    /// replaced. A matrix computed before an invalidation is discarded.
    pub fn put(&self, key: CacheKey, matrix: Arc<DashboardMatrix>, generation: u64) -> bool {
        // ---
        let mut slot = self.slot();
        if slot.generation != generation {
            debug!("Discarding dashboard computed before an invalidation");
            return false;
        }
        slot.entry = Some((key, matrix));
        true
    }

    /// Drop the cached entry. Returns whether anything was cached.
    pub fn invalidate(&self) -> bool {
        // ---
        let mut slot = self.slot();
        slot.generation += 1;
        let had_entry = slot.entry.take().is_some();
        if had_entry {
            debug!("Dashboard cache invalidated");
        }
        had_entry
    }

    /// Drop the cached entry only if it belongs to `site`.
    pub fn invalidate_site(&self, site: &str) -> bool {
        // ---
        let mut slot = self.slot();
        slot.generation += 1;
        if slot.entry.as_ref().is_some_and(|(key, _)| key.site == site) {
            slot.entry = None;
            debug!("Dashboard cache invalidated for {}", site);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::collapse::DayOutcomes;

    fn key(site: &str, from: u32, to: u32) -> CacheKey {
        CacheKey {
            site: site.to_string(),
            from: NaiveDate::from_ymd_opt(2024, 1, from).unwrap(),
            to: NaiveDate::from_ymd_opt(2024, 1, to).unwrap(),
        }
    }

    fn matrix() -> Arc<DashboardMatrix> {
        Arc::new(DashboardMatrix::build(&DayOutcomes::default()))
    }

    #[test]
    fn test_hit_requires_exact_key() {
        // ---
        let cache = DashboardCache::new();
        cache.put(key("K3", 1, 31), matrix(), cache.generation());

        assert!(cache.get(&key("K3", 1, 31)).is_some());
        assert!(cache.get(&key("K3", 2, 31)).is_none());
        assert!(cache.get(&key("Saffy", 1, 31)).is_none());
    }

    #[test]
    fn test_last_write_wins() {
        // ---
        let cache = DashboardCache::new();
        cache.put(key("K3", 1, 31), matrix(), 0);
        cache.put(key("Saffy", 1, 31), matrix(), 0);

        assert!(cache.get(&key("K3", 1, 31)).is_none());
        assert!(cache.get(&key("Saffy", 1, 31)).is_some());
    }

    #[test]
    fn test_invalidation() {
        // ---
        let cache = DashboardCache::new();
        cache.put(key("K3", 1, 31), matrix(), 0);

        assert!(!cache.invalidate_site("Saffy"));
        assert!(cache.get(&key("K3", 1, 31)).is_some());
        assert!(cache.invalidate_site("K3"));
        assert!(cache.get(&key("K3", 1, 31)).is_none());

        cache.put(key("K3", 1, 31), matrix(), cache.generation());
        assert!(cache.invalidate());
        assert!(!cache.invalidate());
    }

    #[test]
    fn test_stale_put_is_discarded() {
        // ---
        let cache = DashboardCache::new();
        let before = cache.generation();
        cache.invalidate_site("K3");

        assert!(!cache.put(key("K3", 1, 31), matrix(), before));
        assert!(cache.get(&key("K3", 1, 31)).is_none());
    }
}
