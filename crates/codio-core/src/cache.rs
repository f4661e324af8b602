//! Byte-budgeted LRU cache of verified content.
//!
//! Content sizes vary by orders of magnitude, so the budget is counted in
//! bytes rather than entries. Every access goes through a single mutex:
//! a `get` hit moves the entry to the most-recently-used position, so the
//! recency ordering and the byte accounting are never observed half-updated.
//!
//! Only [`VerifiedContent`] can be inserted, so an entry present in the
//! cache has always had its identifier re-derived and matched.

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::content::{ContentSource, VerifiedContent};
use crate::content_id::ContentId;

/// A cached object together with where it originally came from.
#[derive(Clone, Debug)]
pub struct CachedContent {
    pub content: VerifiedContent,
    pub origin: ContentSource,
}

/// Outcome of [`ContentCache::put`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PutOutcome {
    /// Stored; the listed entries were evicted to make room.
    Inserted { evicted: Vec<ContentId> },
    /// An entry for this identifier was already present and has been refreshed.
    Replaced,
    /// The object alone is larger than the whole budget and was not cached.
    Rejected { size: usize, budget: usize },
}

struct CacheEntry {
    content: VerifiedContent,
    origin: ContentSource,
    size: usize,
}

struct CacheInner {
    entries: LruCache<ContentId, CacheEntry>,
    total_bytes: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
    rejected: u64,
}

/// Shared content cache. Wrap in an `Arc` to share across resolutions.
pub struct ContentCache {
    byte_budget: usize,
    inner: Mutex<CacheInner>,
}

impl ContentCache {
    /// Create an empty cache holding at most `byte_budget` bytes of content.
    pub fn new(byte_budget: usize) -> Self {
        Self {
            byte_budget,
            inner: Mutex::new(CacheInner {
                entries: LruCache::unbounded(),
                total_bytes: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
                rejected: 0,
            }),
        }
    }

    /// Look up content, refreshing its recency on a hit.
    pub fn get(&self, cid: &ContentId) -> Option<CachedContent> {
        let mut inner = self.inner.lock();
        match inner.entries.get(cid) {
            Some(entry) => {
                let hit = CachedContent {
                    content: entry.content.clone(),
                    origin: entry.origin.clone(),
                };
                inner.hits += 1;
                Some(hit)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Insert verified content, evicting least-recently-accessed entries
    /// until the budget is restored.
    pub fn put(&self, content: VerifiedContent, origin: ContentSource) -> PutOutcome {
        let size = content.len();
        let mut inner = self.inner.lock();

        if size > self.byte_budget {
            inner.rejected += 1;
            debug!(
                cid = %content.cid(),
                size,
                budget = self.byte_budget,
                "Content larger than cache budget, not cached"
            );
            return PutOutcome::Rejected {
                size,
                budget: self.byte_budget,
            };
        }

        let cid = content.cid().clone();
        let entry = CacheEntry {
            content,
            origin,
            size,
        };

        // Same identifier means same bytes, so the size cannot change.
        if let Some(existing) = inner.entries.get_mut(&cid) {
            *existing = entry;
            return PutOutcome::Replaced;
        }

        let mut evicted = Vec::new();
        while inner.total_bytes + size > self.byte_budget {
            match inner.entries.pop_lru() {
                Some((old_cid, old)) => {
                    inner.total_bytes -= old.size;
                    inner.evictions += 1;
                    debug!(cid = %old_cid, size = old.size, "Evicted from cache");
                    evicted.push(old_cid);
                }
                None => break,
            }
        }

        inner.entries.put(cid, entry);
        inner.total_bytes += size;
        PutOutcome::Inserted { evicted }
    }

    /// Whether `cid` is cached. Does not affect recency.
    pub fn contains(&self, cid: &ContentId) -> bool {
        self.inner.lock().entries.contains(cid)
    }

    /// Remove an entry, returning its content if it was present.
    pub fn remove(&self, cid: &ContentId) -> Option<VerifiedContent> {
        let mut inner = self.inner.lock();
        let entry = inner.entries.pop(cid)?;
        inner.total_bytes -= entry.size;
        Some(entry.content)
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.total_bytes = 0;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Total bytes of content currently held.
    pub fn total_bytes(&self) -> usize {
        self.inner.lock().total_bytes
    }

    pub fn byte_budget(&self) -> usize {
        self.byte_budget
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            entries: inner.entries.len(),
            total_bytes: inner.total_bytes,
            byte_budget: self.byte_budget,
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            rejected: inner.rejected,
        }
    }
}

/// Cache statistics snapshot.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: usize,
    pub byte_budget: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub rejected: u64,
}

impl CacheStats {
    /// Hit rate as a percentage of all lookups.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}
