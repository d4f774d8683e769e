//! Concurrent remap table: logical sector → spare sector.
//!
//! A power-of-two chained hash table behind a reader-writer lock, fronted by
//! a small direct-mapped cache whose slots are sequence-locked so the fast
//! path never touches the table lock. A table-wide generation counter
//! (acquire/release) invalidates every cache slot on structural change.

use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, RwLock};

use crate::error::RemapError;

pub const MIN_BUCKETS: usize = 64;
const CACHE_SLOTS: usize = 64;
/// Scaled load factor thresholds: `100 * count / bucket_count`.
const LOAD_HIGH: usize = 150;
const LOAD_LOW: usize = 50;

const FIB_MULT: u64 = 0x9E37_79B9_7F4A_7C15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryStatus {
    Active = 0,
    Pending = 1,
    Failed = 2,
}

impl EntryStatus {
    pub fn from_raw(raw: u8) -> Result<Self, RemapError> {
        match raw {
            0 => Ok(EntryStatus::Active),
            1 => Ok(EntryStatus::Pending),
            2 => Ok(EntryStatus::Failed),
            _ => Err(RemapError::Decode("unknown remap entry status")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemapEntry {
    pub logical: u64,
    pub spare: u64,
    pub status: EntryStatus,
}

fn bucket_index(logical: u64, bucket_count: usize) -> usize {
    debug_assert!(bucket_count.is_power_of_two());
    let shift = 64 - bucket_count.trailing_zeros();
    (logical.wrapping_mul(FIB_MULT) >> shift) as usize
}

struct Buckets {
    buckets: Vec<Vec<RemapEntry>>,
    count: usize,
    active: usize,
}

impl Buckets {
    fn with_capacity(bucket_count: usize) -> Self {
        Self {
            buckets: (0..bucket_count).map(|_| Vec::new()).collect(),
            count: 0,
            active: 0,
        }
    }

    fn find(&self, logical: u64) -> Option<&RemapEntry> {
        let idx = bucket_index(logical, self.buckets.len());
        self.buckets[idx].iter().find(|e| e.logical == logical)
    }

    fn find_mut(&mut self, logical: u64) -> Option<&mut RemapEntry> {
        let idx = bucket_index(logical, self.buckets.len());
        self.buckets[idx].iter_mut().find(|e| e.logical == logical)
    }

    fn push(&mut self, entry: RemapEntry) {
        let idx = bucket_index(entry.logical, self.buckets.len());
        self.buckets[idx].push(entry);
        self.count += 1;
        if entry.status == EntryStatus::Active {
            self.active += 1;
        }
    }

    fn load(&self) -> usize {
        self.count * 100 / self.buckets.len()
    }

    /// Doubles above the high watermark, halves below the low one (floor 64
    /// buckets). Rehashing preserves every entry.
    fn maybe_resize(&mut self) {
        let new_count = if self.load() > LOAD_HIGH {
            self.buckets.len() * 2
        } else if self.load() < LOAD_LOW && self.buckets.len() > MIN_BUCKETS {
            self.buckets.len() / 2
        } else {
            return;
        };
        let mut next: Vec<Vec<RemapEntry>> = (0..new_count).map(|_| Vec::new()).collect();
        for bucket in self.buckets.drain(..) {
            for entry in bucket {
                next[bucket_index(entry.logical, new_count)].push(entry);
            }
        }
        self.buckets = next;
    }
}

/// Outcome of the install-serializing critical section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemapOutcome {
    /// An `Active` mapping already exists; another request won the race.
    Existing(u64),
    /// A `Pending` mapping exists; the caller should wait via `lookup`.
    InProgress,
    /// A fresh `Pending` entry was linked with the returned spare sector.
    Started(u64),
}

struct CacheSlot {
    seq: AtomicU64,
    logical: AtomicU64,
    spare: AtomicU64,
    gen: AtomicU64,
}

/// Direct-mapped, sequence-locked fast-path cache. Readers validate the
/// per-slot sequence before and after loading the payload, so a torn fill is
/// never observed; staleness is caught by comparing the stored generation
/// against the table generation.
struct FastPathCache {
    slots: Vec<CacheSlot>,
}

impl FastPathCache {
    fn new() -> Self {
        Self {
            slots: (0..CACHE_SLOTS)
                .map(|_| CacheSlot {
                    seq: AtomicU64::new(0),
                    logical: AtomicU64::new(0),
                    spare: AtomicU64::new(0),
                    gen: AtomicU64::new(0),
                })
                .collect(),
        }
    }

    fn slot(&self, logical: u64) -> &CacheSlot {
        &self.slots[(logical % CACHE_SLOTS as u64) as usize]
    }

    fn probe(&self, logical: u64, table_gen: u64) -> Option<u64> {
        let slot = self.slot(logical);
        let s1 = slot.seq.load(Ordering::Acquire);
        if s1 & 1 == 1 {
            return None;
        }
        let l = slot.logical.load(Ordering::Relaxed);
        let spare = slot.spare.load(Ordering::Relaxed);
        let gen = slot.gen.load(Ordering::Relaxed);
        fence(Ordering::Acquire);
        let s2 = slot.seq.load(Ordering::Relaxed);
        if s1 != s2 || l != logical || gen != table_gen {
            return None;
        }
        Some(spare)
    }

    fn fill(&self, logical: u64, spare: u64, table_gen: u64) {
        let slot = self.slot(logical);
        let s = slot.seq.load(Ordering::Relaxed);
        if s & 1 == 1 {
            return;
        }
        // Claim the slot; losing the race just skips the fill.
        if slot
            .seq
            .compare_exchange(s, s + 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        slot.logical.store(logical, Ordering::Relaxed);
        slot.spare.store(spare, Ordering::Relaxed);
        slot.gen.store(table_gen, Ordering::Relaxed);
        slot.seq.store(s + 2, Ordering::Release);
    }
}

pub struct RemapTable {
    inner: RwLock<Buckets>,
    /// Bumped on every structural change; generation 0 never validates, so
    /// empty cache slots are harmless.
    generation: AtomicU64,
    cache: FastPathCache,
    wait_lock: Mutex<()>,
    wait_cv: Condvar,
}

impl Default for RemapTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RemapTable {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Buckets::with_capacity(MIN_BUCKETS)),
            generation: AtomicU64::new(1),
            cache: FastPathCache::new(),
            wait_lock: Mutex::new(()),
            wait_cv: Condvar::new(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn bump_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn notify_waiters(&self) {
        let _guard = self.wait_lock.lock().unwrap();
        self.wait_cv.notify_all();
    }

    /// Looks up a mapping. `Pending` entries block the caller until they are
    /// promoted or failed; this is uniform for reads and writes.
    pub fn lookup(&self, logical: u64) -> Option<(u64, EntryStatus)> {
        loop {
            let gen = self.generation();
            if let Some(spare) = self.cache.probe(logical, gen) {
                return Some((spare, EntryStatus::Active));
            }
            let found = {
                let inner = self.inner.read().unwrap();
                inner.find(logical).copied()
            };
            match found {
                Some(e) if e.status == EntryStatus::Pending => {
                    let guard = self.wait_lock.lock().unwrap();
                    // The entry may have been resolved between dropping the
                    // read lock and acquiring the wait lock.
                    if self.generation() != gen {
                        continue;
                    }
                    drop(self.wait_cv.wait(guard).unwrap());
                }
                Some(e) => {
                    if e.status == EntryStatus::Active {
                        self.cache.fill(logical, e.spare, gen);
                    }
                    return Some((e.spare, e.status));
                }
                None => return None,
            }
        }
    }

    /// Non-blocking variant used by the admin channel; reports `Pending`
    /// entries as they are.
    pub fn peek(&self, logical: u64) -> Option<RemapEntry> {
        self.inner.read().unwrap().find(logical).copied()
    }

    /// Installs an `Active` mapping directly. Fails with `DuplicateMapping`
    /// if any live entry exists for the sector; a `Failed` leftover is
    /// replaced.
    pub fn install(&self, logical: u64, spare: u64) -> Result<(), RemapError> {
        {
            let mut inner = self.inner.write().unwrap();
            let existing = inner.find(logical).map(|e| e.status);
            match existing {
                Some(EntryStatus::Failed) => {
                    if let Some(e) = inner.find_mut(logical) {
                        e.spare = spare;
                        e.status = EntryStatus::Active;
                    }
                    inner.active += 1;
                }
                Some(_) => return Err(RemapError::DuplicateMapping(logical)),
                None => {
                    inner.push(RemapEntry {
                        logical,
                        spare,
                        status: EntryStatus::Active,
                    });
                    inner.maybe_resize();
                }
            }
        }
        let gen = self.bump_generation();
        self.cache.fill(logical, spare, gen);
        Ok(())
    }

    /// The install-serializing critical section of the auto-remap path:
    /// checks for an existing entry and, only if none is live, runs the
    /// caller's allocation and links a `Pending` entry. The allocator lock is
    /// taken inside the table lock, which fixes the table → allocator order.
    pub fn begin_remap<F>(&self, logical: u64, allocate: F) -> Result<RemapOutcome, RemapError>
    where
        F: FnOnce() -> Result<u64, RemapError>,
    {
        let mut inner = self.inner.write().unwrap();
        let existing = inner.find(logical).copied();
        match existing {
            Some(e) if e.status == EntryStatus::Active => Ok(RemapOutcome::Existing(e.spare)),
            Some(e) if e.status == EntryStatus::Pending => Ok(RemapOutcome::InProgress),
            Some(_) => {
                // Retry a previously failed remap with a fresh sector.
                let spare = allocate()?;
                if let Some(e) = inner.find_mut(logical) {
                    e.spare = spare;
                    e.status = EntryStatus::Pending;
                }
                drop(inner);
                self.bump_generation();
                Ok(RemapOutcome::Started(spare))
            }
            None => {
                let spare = allocate()?;
                inner.push(RemapEntry {
                    logical,
                    spare,
                    status: EntryStatus::Pending,
                });
                inner.maybe_resize();
                drop(inner);
                self.bump_generation();
                Ok(RemapOutcome::Started(spare))
            }
        }
    }

    /// Promotes a `Pending` entry to `Active` and wakes blocked lookups.
    pub fn promote(&self, logical: u64) -> Option<u64> {
        let spare = {
            let mut inner = self.inner.write().unwrap();
            let spare = match inner.find_mut(logical) {
                Some(e) if e.status == EntryStatus::Pending => {
                    e.status = EntryStatus::Active;
                    e.spare
                }
                _ => return None,
            };
            inner.active += 1;
            spare
        };
        let gen = self.bump_generation();
        self.cache.fill(logical, spare, gen);
        self.notify_waiters();
        Some(spare)
    }

    /// Marks a `Pending` entry `Failed` and wakes blocked lookups.
    pub fn fail_pending(&self, logical: u64) {
        {
            let mut inner = self.inner.write().unwrap();
            if let Some(e) = inner.find_mut(logical) {
                if e.status == EntryStatus::Pending {
                    e.status = EntryStatus::Failed;
                }
            }
        }
        self.bump_generation();
        self.notify_waiters();
    }

    /// Truncates the table. Dangerous; admin-only.
    pub fn clear(&self) {
        {
            let mut inner = self.inner.write().unwrap();
            *inner = Buckets::with_capacity(MIN_BUCKETS);
        }
        self.bump_generation();
        self.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn active_len(&self) -> usize {
        self.inner.read().unwrap().active
    }

    pub fn bucket_count(&self) -> usize {
        self.inner.read().unwrap().buckets.len()
    }

    /// Scaled load factor, `100 * count / bucket_count`.
    pub fn load(&self) -> usize {
        self.inner.read().unwrap().load()
    }

    /// Consistent snapshot of every entry, unordered.
    pub fn snapshot(&self) -> Vec<RemapEntry> {
        let inner = self.inner.read().unwrap();
        inner.buckets.iter().flatten().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_then_lookup() {
        let table = RemapTable::new();
        table.install(1000, 7).unwrap();
        assert_eq!(table.lookup(1000), Some((7, EntryStatus::Active)));
        assert_eq!(table.lookup(1001), None);
    }

    #[test]
    fn duplicate_install_is_rejected() {
        let table = RemapTable::new();
        table.install(5, 1).unwrap();
        assert!(matches!(
            table.install(5, 2),
            Err(RemapError::DuplicateMapping(5))
        ));
        // The original mapping is untouched.
        assert_eq!(table.lookup(5), Some((1, EntryStatus::Active)));
    }

    #[test]
    fn cache_hit_survives_unrelated_reads() {
        let table = RemapTable::new();
        table.install(42, 9).unwrap();
        for _ in 0..10 {
            assert_eq!(table.lookup(42), Some((9, EntryStatus::Active)));
        }
    }

    #[test]
    fn cache_is_invalidated_by_generation_bump() {
        let table = RemapTable::new();
        table.install(42, 9).unwrap();
        assert_eq!(table.lookup(42), Some((9, EntryStatus::Active)));
        let gen_before = table.generation();
        table.install(43, 10).unwrap();
        assert!(table.generation() > gen_before);
        // Both still resolve correctly after invalidation.
        assert_eq!(table.lookup(42), Some((9, EntryStatus::Active)));
        assert_eq!(table.lookup(43), Some((10, EntryStatus::Active)));
    }

    #[test]
    fn grows_and_preserves_entries() {
        let table = RemapTable::new();
        for i in 0..1500u64 {
            table.install(i * 3, i + 100_000).unwrap();
        }
        // Growth by doubling keeps the scaled load at or below the high
        // watermark: 1500 entries fit in 1024 buckets at load 146.
        assert_eq!(table.bucket_count(), 1024);
        assert!(table.load() <= LOAD_HIGH);
        for i in 0..1500u64 {
            assert_eq!(
                table.lookup(i * 3),
                Some((i + 100_000, EntryStatus::Active)),
                "entry {i} lost in resize"
            );
        }
    }

    #[test]
    fn begin_remap_outcomes() {
        let table = RemapTable::new();
        let out = table.begin_remap(9, || Ok(77)).unwrap();
        assert_eq!(out, RemapOutcome::Started(77));

        // Second attempt sees the pending entry.
        let out = table.begin_remap(9, || panic!("must not allocate")).unwrap();
        assert_eq!(out, RemapOutcome::InProgress);

        table.promote(9);
        let out = table.begin_remap(9, || panic!("must not allocate")).unwrap();
        assert_eq!(out, RemapOutcome::Existing(77));
    }

    #[test]
    fn failed_entry_can_be_retried() {
        let table = RemapTable::new();
        assert_eq!(
            table.begin_remap(4, || Ok(50)).unwrap(),
            RemapOutcome::Started(50)
        );
        table.fail_pending(4);
        assert_eq!(table.lookup(4), Some((50, EntryStatus::Failed)));

        assert_eq!(
            table.begin_remap(4, || Ok(51)).unwrap(),
            RemapOutcome::Started(51)
        );
        table.promote(4);
        assert_eq!(table.lookup(4), Some((51, EntryStatus::Active)));
    }

    #[test]
    fn pending_blocks_lookup_until_promoted() {
        use std::sync::Arc;
        use std::time::Duration;

        let table = Arc::new(RemapTable::new());
        assert_eq!(
            table.begin_remap(11, || Ok(600)).unwrap(),
            RemapOutcome::Started(600)
        );

        let t2 = Arc::clone(&table);
        let reader = std::thread::spawn(move || t2.lookup(11));

        // Give the reader time to park on the pending entry.
        std::thread::sleep(Duration::from_millis(50));
        table.promote(11);

        assert_eq!(reader.join().unwrap(), Some((600, EntryStatus::Active)));
    }

    #[test]
    fn clear_truncates() {
        let table = RemapTable::new();
        for i in 0..200u64 {
            table.install(i, i + 1).unwrap();
        }
        table.clear();
        assert_eq!(table.len(), 0);
        assert_eq!(table.bucket_count(), MIN_BUCKETS);
        assert_eq!(table.lookup(10), None);
    }

    #[test]
    fn concurrent_installs_and_lookups() {
        use std::sync::Arc;

        let table = Arc::new(RemapTable::new());
        let writers: Vec<_> = (0..4u64)
            .map(|w| {
                let t = Arc::clone(&table);
                std::thread::spawn(move || {
                    for i in 0..500u64 {
                        let logical = w * 10_000 + i;
                        t.install(logical, logical + 1).unwrap();
                        assert_eq!(t.lookup(logical), Some((logical + 1, EntryStatus::Active)));
                    }
                })
            })
            .collect();
        for w in writers {
            w.join().unwrap();
        }
        assert_eq!(table.len(), 2000);
        for w in 0..4u64 {
            for i in 0..500u64 {
                let logical = w * 10_000 + i;
                assert_eq!(table.lookup(logical), Some((logical + 1, EntryStatus::Active)));
            }
        }
    }
}
