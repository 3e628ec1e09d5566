use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::time::SystemTime;

use hickory_proto::op::Message;
use lru::LruCache;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::CacheError;
use crate::key::CacheKey;

/// A cached upstream answer. Immutable once inserted; deliveries clone
/// the message before rewriting anything.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub expiration: SystemTime,
    pub msg: Message,
}

/// Adaptive Replacement Cache over the question fingerprints.
///
/// Four lists: T1 (seen once), T2 (seen at least twice), and the ghost
/// lists B1/B2 remembering recent evictions from each. A probe that
/// hits T1 promotes the entry to T2; a ghost hit moves the adaptive
/// target `p` toward the list that would have kept it. The recency
/// mutation lives behind an interior mutex so probes work through a
/// shared outer lock.
pub struct ArcCache {
    inner: Mutex<ArcInner>,
}

struct ArcInner {
    cap: usize,
    /// Target size of T1; self-tuned by ghost hits.
    p: usize,
    t1: LruCache<CacheKey, CachedResponse>,
    t2: LruCache<CacheKey, CachedResponse>,
    b1: LruCache<CacheKey, ()>,
    b2: LruCache<CacheKey, ()>,
}

impl ArcCache {
    pub fn new(cap: usize) -> Result<Self, CacheError> {
        let size = NonZeroUsize::new(cap).ok_or(CacheError::InvalidCapacity)?;
        Ok(Self {
            inner: Mutex::new(ArcInner {
                cap,
                p: 0,
                t1: LruCache::new(size),
                t2: LruCache::new(size),
                b1: LruCache::new(size),
                b2: LruCache::new(size),
            }),
        })
    }

    /// Probe with recency update: a T1 hit moves the entry to T2.
    pub fn get(&self, key: &CacheKey) -> Option<CachedResponse> {
        let mut c = self.inner.lock();
        if let Some(value) = c.t1.pop(key) {
            c.t2.put(*key, value.clone());
            return Some(value);
        }
        c.t2.get(key).cloned()
    }

    /// Probe without touching recency; the snapshot writer uses this so
    /// saving the cache does not reshuffle it.
    pub fn peek(&self, key: &CacheKey) -> Option<CachedResponse> {
        let c = self.inner.lock();
        c.t1.peek(key).or_else(|| c.t2.peek(key)).cloned()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        let c = self.inner.lock();
        c.t1.contains(key) || c.t2.contains(key)
    }

    pub fn add(&self, key: CacheKey, value: CachedResponse) {
        let mut c = self.inner.lock();

        // update paths
        if c.t1.contains(&key) {
            c.t1.pop(&key);
            c.t2.put(key, value);
            return;
        }
        if c.t2.contains(&key) {
            c.t2.put(key, value);
            return;
        }

        // ghost hit in B1: recency would have kept it, grow p
        if c.b1.contains(&key) {
            let delta = if c.b2.len() > c.b1.len() {
                c.b2.len() / c.b1.len()
            } else {
                1
            };
            c.p = (c.p + delta).min(c.cap);
            if c.t1.len() + c.t2.len() >= c.cap {
                c.replace(false);
            }
            c.b1.pop(&key);
            c.t2.put(key, value);
            return;
        }

        // ghost hit in B2: frequency would have kept it, shrink p
        if c.b2.contains(&key) {
            let delta = if c.b1.len() > c.b2.len() {
                c.b1.len() / c.b2.len()
            } else {
                1
            };
            c.p = c.p.saturating_sub(delta);
            if c.t1.len() + c.t2.len() >= c.cap {
                c.replace(true);
            }
            c.b2.pop(&key);
            c.t2.put(key, value);
            return;
        }

        // genuinely new key
        if c.t1.len() + c.t2.len() >= c.cap {
            c.replace(false);
        }
        if c.b1.len() > c.cap - c.p {
            c.b1.pop_lru();
        }
        if c.b2.len() > c.p {
            c.b2.pop_lru();
        }
        c.t1.put(key, value);
    }

    pub fn remove(&self, key: &CacheKey) {
        let mut c = self.inner.lock();
        if c.t1.pop(key).is_some() || c.t2.pop(key).is_some() {
            return;
        }
        if c.b1.pop(key).is_some() {
            return;
        }
        c.b2.pop(key);
    }

    /// Live entry count (T1 + T2).
    pub fn len(&self) -> usize {
        let c = self.inner.lock();
        c.t1.len() + c.t2.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live keys, oldest first, T1 before T2.
    pub fn keys(&self) -> Vec<CacheKey> {
        let c = self.inner.lock();
        let mut keys: Vec<CacheKey> = c.t1.iter().rev().map(|(k, _)| *k).collect();
        keys.extend(c.t2.iter().rev().map(|(k, _)| *k));
        keys
    }

    #[cfg(test)]
    pub(crate) fn in_frequent_list(&self, key: &CacheKey) -> bool {
        self.inner.lock().t2.contains(key)
    }
}

impl ArcInner {
    /// Evicts one live entry into the matching ghost list, arbitrating
    /// between T1 and T2 with the adaptive target.
    fn replace(&mut self, b2_hit: bool) {
        let t1_len = self.t1.len();
        if t1_len > 0 && (t1_len > self.p || (t1_len == self.p && b2_hit)) {
            if let Some((old, _)) = self.t1.pop_lru() {
                self.b1.put(old, ());
            }
        } else if let Some((old, _)) = self.t2.pop_lru() {
            self.b2.put(old, ());
        }
    }
}

/// The process-wide cache slot: the ARC store (constructed lazily at
/// first admission or snapshot load) and the fetch-dedup set, guarded
/// by one reader/writer lock. Readers probe under shared access; the
/// ARC's interior mutex serializes recency updates. No I/O happens
/// under this lock.
#[derive(Default)]
pub struct SharedCache {
    slot: RwLock<CacheSlot>,
}

#[derive(Default)]
pub struct CacheSlot {
    pub store: Option<ArcCache>,
    /// Fingerprints currently being resolved upstream. Membership at
    /// snapshot time becomes the per-entry frequent flag.
    pub fetching: HashSet<CacheKey>,
}

impl SharedCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slot(&self) -> RwLockReadGuard<'_, CacheSlot> {
        self.slot.read()
    }

    pub fn slot_mut(&self) -> RwLockWriteGuard<'_, CacheSlot> {
        self.slot.write()
    }

    pub fn begin_fetch(&self, key: CacheKey) {
        self.slot.write().fetching.insert(key);
    }

    pub fn end_fetch(&self, key: &CacheKey) {
        self.slot.write().fetching.remove(key);
    }
}
