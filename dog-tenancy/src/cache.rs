//! Read-optimized cache in front of the tenant directory.
//!
//! Consistency contract: eventual, bounded by TTL. A cached descriptor may be
//! served until its entry expires unless someone calls [`ResolutionCache::invalidate`].
//! Every invalidation bumps an epoch; a lookup that read the directory before
//! an invalidation stores its result with [`ResolutionCache::put_if_current`],
//! which refuses it, so an in-flight lookup cannot undo an invalidation.
//! Expiry is measured with `tokio::time::Instant` so tests can drive it with
//! a paused clock.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::tenant::{normalize_identifier, TenantDescriptor, TenantId};

/// Lookup namespace. Ids and identifiers never share a slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Id(TenantId),
    Identifier(String),
}

impl CacheKey {
    pub fn identifier(raw: &str) -> Self {
        Self::Identifier(normalize_identifier(raw))
    }

    pub fn id(id: &TenantId) -> Self {
        Self::Id(id.clone())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::Id(id) => write!(f, "id:{id}"),
            CacheKey::Identifier(identifier) => write!(f, "identifier:{identifier}"),
        }
    }
}

/// What the directory said last time.
#[derive(Debug, Clone)]
pub enum CachedEntry {
    Found(Arc<TenantDescriptor>),
    NotFound,
}

/// Result of a cache probe.
#[derive(Debug, Clone)]
pub enum CacheLookup {
    Hit(CachedEntry),
    Miss,
}

#[derive(Debug)]
struct Slot {
    entry: CachedEntry,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct CacheCounters {
    hits: AtomicU64,
    negative_hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
}

/// Point-in-time view of cache effectiveness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub negative_hits: u64,
    pub misses: u64,
    pub invalidations: u64,
    pub entries: usize,
}

/// Concurrent key -> descriptor cache with distinct positive and negative entries.
///
/// Reads go through `DashMap` shards and never contend with each other;
/// population and invalidation lock only the shard they touch.
#[derive(Debug, Default)]
pub struct ResolutionCache {
    slots: DashMap<CacheKey, Slot>,
    epoch: AtomicU64,
    counters: CacheCounters,
}

impl ResolutionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &CacheKey) -> CacheLookup {
        let now = Instant::now();
        let expired = match self.slots.get(key) {
            Some(slot) if slot.expires_at > now => {
                match slot.entry {
                    CachedEntry::Found(_) => self.counters.hits.fetch_add(1, Ordering::Relaxed),
                    CachedEntry::NotFound => {
                        self.counters.negative_hits.fetch_add(1, Ordering::Relaxed)
                    }
                };
                return CacheLookup::Hit(slot.entry.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            // re-check under the shard lock; a fresh put may have landed in between
            self.slots.remove_if(key, |_, slot| slot.expires_at <= now);
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        CacheLookup::Miss
    }

    pub fn put(&self, key: CacheKey, entry: CachedEntry, ttl: Duration) {
        if ttl.is_zero() {
            self.slots.remove(&key);
            return;
        }
        let expires_at = Instant::now() + ttl;
        self.slots.insert(key, Slot { entry, expires_at });
    }

    /// Current invalidation epoch. Capture it before reading the directory.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Store `entry` unless an invalidation happened since `epoch` was read.
    /// Returns whether the entry was stored.
    pub fn put_if_current(&self, key: CacheKey, entry: CachedEntry, ttl: Duration, epoch: u64) -> bool {
        if ttl.is_zero() {
            self.slots.remove(&key);
            return false;
        }
        // the shard stays write-locked between the check and the insert;
        // invalidations bump the epoch before taking that lock
        let slot = self.slots.entry(key);
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return false;
        }
        slot.insert(Slot {
            entry,
            expires_at: Instant::now() + ttl,
        });
        true
    }

    fn bump_epoch(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop one key. Returns whether anything was cached under it.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        self.bump_epoch();
        let removed = self.slots.remove(key).is_some();
        if removed {
            self.counters.invalidations.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Drop every entry pointing at `tenant_id`, whatever key it was cached
    /// under, plus every negative entry: a renamed tenant may now own an
    /// identifier that was cached as unknown.
    pub fn invalidate_tenant(&self, tenant_id: &TenantId) -> usize {
        self.bump_epoch();
        let before = self.slots.len();
        self.slots.retain(|key, slot| {
            let by_id = matches!(key, CacheKey::Id(id) if id == tenant_id);
            let stale = match &slot.entry {
                CachedEntry::Found(t) => t.id == *tenant_id,
                CachedEntry::NotFound => true,
            };
            !(by_id || stale)
        });
        let removed = before.saturating_sub(self.slots.len());
        self.counters
            .invalidations
            .fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Remove expired slots. Lookups already ignore them; this only reclaims memory.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.slots.len();
        self.slots.retain(|_, slot| slot.expires_at > now);
        before.saturating_sub(self.slots.len())
    }

    pub fn clear(&self) {
        self.bump_epoch();
        self.slots.clear();
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            negative_hits: self.counters.negative_hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
            entries: self.slots.len(),
        }
    }
}
