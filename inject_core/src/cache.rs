//! Fingerprint-keyed cache of created textures, with size accounting and
//! least-recently-used purging.
//!
//! Handles are never released while the table lock is held: dropping the last
//! reference runs the release hook, which takes the lock to queue the entry
//! for removal. Queued entries are collected on the next table access.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::fingerprint::Fingerprint;
use crate::observability::{self, lock_unpoisoned};
use crate::resource::{ManagedTexture, ResourceRef};
use crate::MIB;

const LOG_TARGET: &str = "inject::cache";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub basic_bytes: u64,
    pub injected_bytes: u64,
    pub injected_count: usize,
    pub hits: u64,
    pub misses: u64,
    pub bytes_saved: u64,
    pub time_saved: Duration,
}

impl CacheStats {
    pub fn total_bytes(&self) -> u64 {
        self.basic_bytes + self.injected_bytes
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub released: usize,
    pub released_injected: usize,
    pub reclaimed_bytes: u64,
    pub reclaimed_injected_bytes: u64,
    pub remaining: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResetReport {
    pub released: usize,
    pub freed_bytes: u64,
    /// Entries still referenced by the renderer when the cache let go.
    pub leaked: usize,
    pub leaked_refs: i64,
    pub leaked_bytes: u64,
}

#[derive(Default)]
struct CacheTable {
    entries: HashMap<Fingerprint, ManagedTexture>,
    pending_removal: Vec<ManagedTexture>,
    basic_bytes: u64,
    injected_bytes: u64,
    injected_count: usize,
}

impl CacheTable {
    fn total(&self) -> u64 {
        self.basic_bytes + self.injected_bytes
    }

    fn is_resident(&self, texture: &ManagedTexture) -> bool {
        self.entries
            .get(&texture.fingerprint())
            .is_some_and(|entry| entry.same(texture))
    }

    /// Drops queued entries that are still unreferenced.
    fn collect_pending(&mut self) -> Vec<ResourceRef> {
        let mut freed = Vec::new();
        for texture in std::mem::take(&mut self.pending_removal) {
            if texture.refs() > 0 || !self.is_resident(&texture) {
                continue;
            }
            self.entries.remove(&texture.fingerprint());
            self.basic_bytes = self.basic_bytes.saturating_sub(texture.base_size());
            if let Some((resource, size)) = texture.replace_override(None, 0) {
                self.injected_bytes = self.injected_bytes.saturating_sub(size);
                self.injected_count = self.injected_count.saturating_sub(1);
                freed.push(resource);
            }
        }
        freed
    }
}

struct CacheInner {
    table: Mutex<CacheTable>,
    hits: AtomicU64,
    misses: AtomicU64,
    bytes_saved: AtomicU64,
    time_saved_us: AtomicU64,
}

impl CacheInner {
    fn enqueue_removal(&self, texture: &ManagedTexture) {
        lock_unpoisoned(&self.table)
            .pending_removal
            .push(texture.clone());
    }
}

#[derive(Clone)]
pub struct TextureCache {
    inner: Arc<CacheInner>,
}

impl Default for TextureCache {
    fn default() -> Self {
        Self::new()
    }
}

impl TextureCache {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CacheInner {
                table: Mutex::new(CacheTable::default()),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                bytes_saved: AtomicU64::new(0),
                time_saved_us: AtomicU64::new(0),
            }),
        }
    }

    pub fn lookup(&self, fingerprint: Fingerprint) -> Option<ManagedTexture> {
        let (entry, _freed) = {
            let mut table = lock_unpoisoned(&self.inner.table);
            let freed = table.collect_pending();
            (table.entries.get(&fingerprint).cloned(), freed)
        };
        entry
    }

    /// Adds `texture` and takes the cache's own reference. Returns `false`
    /// when the fingerprint is already cached; the existing entry wins.
    pub fn insert(&self, texture: &ManagedTexture) -> bool {
        let fingerprint = texture.fingerprint();
        let mut table = lock_unpoisoned(&self.inner.table);
        let _freed = table.collect_pending();
        if table.entries.contains_key(&fingerprint) {
            return false;
        }
        let weak: Weak<CacheInner> = Arc::downgrade(&self.inner);
        texture.attach_to_cache(Box::new(move |released| {
            if let Some(inner) = weak.upgrade() {
                inner.enqueue_removal(released);
            }
        }));
        table.basic_bytes += texture.base_size();
        let override_size = texture.override_size();
        if texture.has_override() {
            table.injected_bytes += override_size;
            table.injected_count += 1;
        }
        table.entries.insert(fingerprint, texture.clone());
        true
    }

    /// Hands out another reference to a cached texture.
    pub fn acquire(&self, texture: &ManagedTexture) {
        texture.add_ref();
        texture.mark_used();
        self.inner.hits.fetch_add(1, Ordering::Relaxed);
        self.inner
            .bytes_saved
            .fetch_add(texture.base_size(), Ordering::Relaxed);
        self.inner
            .time_saved_us
            .fetch_add(texture.load_time().as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.inner.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Queues a texture whose count reached zero for removal.
    pub fn release(&self, texture: &ManagedTexture) {
        self.inner.enqueue_removal(texture);
    }

    /// Installs a loaded override and accounts for it if the texture is the
    /// cached entry for its fingerprint.
    pub fn install_override(&self, texture: &ManagedTexture, resource: ResourceRef, size: u64) {
        let mut table = lock_unpoisoned(&self.inner.table);
        let previous = texture.replace_override(Some(resource), size);
        if !table.is_resident(texture) {
            return;
        }
        match previous {
            Some((_, previous_size)) => {
                table.injected_bytes = table.injected_bytes.saturating_sub(previous_size);
            }
            None => table.injected_count += 1,
        }
        table.injected_bytes += size;
    }

    /// Removes the override, returning its size.
    pub fn clear_override(&self, texture: &ManagedTexture) -> Option<u64> {
        let mut table = lock_unpoisoned(&self.inner.table);
        let (_resource, size) = texture.replace_override(None, 0)?;
        if table.is_resident(texture) {
            table.injected_bytes = table.injected_bytes.saturating_sub(size);
            table.injected_count = table.injected_count.saturating_sub(1);
        }
        Some(size)
    }

    /// Lets go of the cache's own reference when `texture` is the resident
    /// entry and nothing else holds it. Returns whether the entry was freed.
    pub fn evict_unreferenced(&self, texture: &ManagedTexture) -> bool {
        let resident = lock_unpoisoned(&self.inner.table).is_resident(texture);
        if !resident || !texture.can_free() || texture.must_block() {
            return false;
        }
        match texture.release_from_cache() {
            Some(0) => true,
            Some(remaining) => {
                observability::invariant_violation(
                    LOG_TARGET,
                    format!(
                        "evicted texture {} still has {} references",
                        texture.fingerprint(),
                        remaining
                    ),
                );
                false
            }
            None => false,
        }
    }

    /// Renderer-held references on the cached entry for `fingerprint`.
    pub fn external_refs(&self, fingerprint: Fingerprint) -> Option<(ManagedTexture, i64)> {
        let entry = self.lookup(fingerprint)?;
        let refs = entry.external_refs().max(0);
        Some((entry, refs))
    }

    pub fn total_bytes(&self) -> u64 {
        lock_unpoisoned(&self.inner.table).total()
    }

    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.inner.table).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let table = lock_unpoisoned(&self.inner.table);
        CacheStats {
            entries: table.entries.len(),
            basic_bytes: table.basic_bytes,
            injected_bytes: table.injected_bytes,
            injected_count: table.injected_count,
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            bytes_saved: self.inner.bytes_saved.load(Ordering::Relaxed),
            time_saved: Duration::from_micros(self.inner.time_saved_us.load(Ordering::Relaxed)),
        }
    }

    /// Releases unreferenced entries, oldest use first, until the total
    /// drops below `target` or nothing else is eligible. Entries with a load
    /// in flight or a blocking load pending are kept.
    pub fn purge(&self, target: u64, in_flight: &HashSet<Fingerprint>) -> PurgeReport {
        let (mut candidates, start_total) = {
            let mut table = lock_unpoisoned(&self.inner.table);
            let _freed = table.collect_pending();
            let candidates: Vec<ManagedTexture> = table
                .entries
                .values()
                .filter(|texture| texture.can_free())
                .cloned()
                .collect();
            (candidates, table.total())
        };
        candidates.sort_by_key(ManagedTexture::last_used);

        let mut report = PurgeReport::default();
        for texture in candidates {
            if start_total.saturating_sub(report.reclaimed_bytes) < target {
                break;
            }
            if in_flight.contains(&texture.fingerprint()) || texture.must_block() {
                continue;
            }
            let override_size = texture.override_size();
            match texture.release_from_cache() {
                None => continue,
                Some(0) => {
                    if override_size > 0 {
                        report.released_injected += 1;
                        report.reclaimed_injected_bytes += override_size;
                        report.reclaimed_bytes += override_size;
                    }
                }
                Some(remaining) => observability::invariant_violation(
                    LOG_TARGET,
                    format!(
                        "purged texture {} still has {} references",
                        texture.fingerprint(),
                        remaining
                    ),
                ),
            }
            report.released += 1;
            report.reclaimed_bytes += texture.base_size();
        }

        report.remaining = {
            let mut table = lock_unpoisoned(&self.inner.table);
            let _freed = table.collect_pending();
            table.entries.len()
        };
        log::info!(
            target: LOG_TARGET,
            "purged {} textures ({} injected), reclaimed {} MiB ({} MiB injected), {} remain",
            report.released,
            report.released_injected,
            report.reclaimed_bytes / MIB,
            report.reclaimed_injected_bytes / MIB,
            report.remaining
        );
        report
    }

    /// Lets go of every entry. Entries the renderer still holds are counted
    /// as leaked and survive outside the cache until their holders release
    /// them.
    pub fn reset(&self) -> ResetReport {
        let entries: Vec<ManagedTexture> = {
            let mut table = lock_unpoisoned(&self.inner.table);
            let _freed = table.collect_pending();
            table.entries.values().cloned().collect()
        };

        let mut report = ResetReport::default();
        for texture in &entries {
            let size = texture.base_size() + texture.override_size();
            let external = texture.external_refs();
            match texture.release_from_cache() {
                Some(0) => {
                    report.released += 1;
                    report.freed_bytes += size;
                }
                _ => {
                    report.leaked += 1;
                    report.leaked_refs += external.max(0);
                    report.leaked_bytes += size;
                }
            }
        }

        {
            let mut table = lock_unpoisoned(&self.inner.table);
            let _freed = table.collect_pending();
            // Whatever is still resident is held by the renderer.
            table.entries.clear();
            table.basic_bytes = 0;
            table.injected_bytes = 0;
            table.injected_count = 0;
        }

        log::info!(
            target: LOG_TARGET,
            "reset freed {} textures ({} MiB)",
            report.released,
            report.freed_bytes / MIB
        );
        if report.leaked > 0 {
            log::warn!(
                target: LOG_TARGET,
                "reset leaked {} textures ({} references, {} MiB) still held by the renderer",
                report.leaked,
                report.leaked_refs,
                report.leaked_bytes / MIB
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::tests::stub;
    use std::time::Instant;

    fn texture(value: u32, size: u64) -> ManagedTexture {
        ManagedTexture::new(Fingerprint(value), stub(1, 1), size)
    }

    #[test]
    fn insert_then_hit() {
        let cache = TextureCache::new();
        let created = texture(0x10, 4 * MIB);
        assert!(cache.insert(&created));
        assert_eq!(created.refs(), 2);

        let hit = cache.lookup(Fingerprint(0x10)).expect("cached");
        cache.acquire(&hit);
        assert!(hit.same(&created));
        assert_eq!(created.refs(), 3);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.bytes_saved, 4 * MIB);
        assert_eq!(stats.total_bytes(), 4 * MIB);
    }

    #[test]
    fn duplicate_insert_is_refused() {
        let cache = TextureCache::new();
        assert!(cache.insert(&texture(1, 10)));
        let other = texture(1, 20);
        assert!(!cache.insert(&other));
        assert_eq!(other.refs(), 1);
        assert_eq!(cache.total_bytes(), 10);
    }

    #[test]
    fn override_accounting() {
        let cache = TextureCache::new();
        let created = texture(2, 100);
        cache.insert(&created);
        cache.install_override(&created, stub(2, 2), 40);
        assert_eq!(cache.stats().injected_bytes, 40);
        assert_eq!(cache.stats().injected_count, 1);
        cache.install_override(&created, stub(2, 2), 60);
        assert_eq!(cache.stats().injected_bytes, 60);
        assert_eq!(cache.stats().injected_count, 1);
        assert_eq!(cache.clear_override(&created), Some(60));
        assert_eq!(cache.total_bytes(), 100);
    }

    #[test]
    fn purge_evicts_oldest_until_below_target() {
        let cache = TextureCache::new();
        let base = Instant::now();
        let sizes = [(1u32, 100u64), (2, 50), (3, 30)];
        for (offset, (value, mib)) in sizes.iter().enumerate() {
            let created = texture(*value, mib * MIB);
            cache.insert(&created);
            created.set_last_used(base + Duration::from_secs(offset as u64 + 1));
            created.release();
        }
        assert_eq!(cache.total_bytes(), 180 * MIB);

        let report = cache.purge(80 * MIB, &HashSet::new());
        assert_eq!(report.released, 2);
        assert_eq!(report.remaining, 1);
        assert_eq!(cache.total_bytes(), 30 * MIB);
        assert!(cache.lookup(Fingerprint(3)).is_some());
        assert!(cache.lookup(Fingerprint(1)).is_none());
    }

    #[test]
    fn purge_skips_referenced_in_flight_and_blocking() {
        let cache = TextureCache::new();
        let held = texture(1, 10 * MIB);
        cache.insert(&held);

        let loading = texture(2, 10 * MIB);
        cache.insert(&loading);
        loading.release();

        let blocking = texture(3, 10 * MIB);
        cache.insert(&blocking);
        blocking.release();
        blocking.set_must_block(true);

        let in_flight: HashSet<Fingerprint> = [Fingerprint(2)].into_iter().collect();
        let report = cache.purge(0, &in_flight);
        assert_eq!(report.released, 0);
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn released_entries_are_collected_lazily() {
        let cache = TextureCache::new();
        let created = texture(7, 8);
        cache.insert(&created);
        created.release();
        assert_eq!(created.release_from_cache(), Some(0));
        assert!(cache.lookup(Fingerprint(7)).is_none());
        assert_eq!(cache.total_bytes(), 0);
    }

    #[test]
    fn evict_unreferenced_only_frees_idle_resident_entries() {
        let cache = TextureCache::new();
        let idle = texture(8, 2 * MIB);
        cache.insert(&idle);
        idle.release();
        let held = texture(9, 2 * MIB);
        cache.insert(&held);
        let stray = texture(8, MIB);

        assert!(!cache.evict_unreferenced(&stray));
        assert!(!cache.evict_unreferenced(&held));
        assert!(cache.evict_unreferenced(&idle));
        assert!(cache.lookup(Fingerprint(8)).is_none());
        assert!(cache.lookup(Fingerprint(9)).is_some());
        assert_eq!(cache.total_bytes(), 2 * MIB);
    }

    #[test]
    fn reset_reports_leaks() {
        let cache = TextureCache::new();
        let free = texture(1, 3 * MIB);
        cache.insert(&free);
        free.release();
        let held = texture(2, 5 * MIB);
        cache.insert(&held);

        let report = cache.reset();
        assert_eq!(report.released, 1);
        assert_eq!(report.freed_bytes, 3 * MIB);
        assert_eq!(report.leaked, 1);
        assert_eq!(report.leaked_refs, 1);
        assert!(cache.is_empty());
        assert_eq!(held.refs(), 1);
    }
}
