//! Consistent-hash ring table with delayed eviction (spec §4.4), grounded on
//! `xhashring.Table` from the original Go source. Two structures are kept
//! consistent — `index` (name -> entry) and `ring` (hash -> entry, circular)
//! — both holding `Arc<Entry>` handles into the same logical entry (design
//! note §9: "a single owning container... handles in both the name-index and
//! the hash-ring").
//!
//! Readers (`step`, `next`, `prev`, replica walks) run lock-free against a
//! barrier: a writer bumps a pending-writer count before mutating `index`/
//! `ring`, readers wait for that count to drain to zero before touching
//! either map. Writes are rare (membership events); reads are the hot path
//! of routing, so this favors reads.

use crate::hash::{default_hash_fn, HashFn, RingHash};
use std::collections::BTreeMap;
use std::sync::{Condvar, Mutex, RwLock};
use std::time::{Duration, Instant};

/// Default node-death timeout: 48 hours (spec §4.4).
pub const DEFAULT_NODE_DEATH: Duration = Duration::from_secs(48 * 3600);

struct EntryState {
    alive: bool,
    death_deadline: Instant,
}

/// One ring member. `alive`/`death_deadline` are behind their own lock so
/// liveness checks never contend with structural ring mutation (spec §4.4,
/// §5: "per-entry RW-lock... permits concurrent death tests").
pub struct Entry {
    pub name: String,
    pub hash: RingHash,
    state: RwLock<EntryState>,
}

impl Entry {
    fn new_alive(name: String, hash: RingHash) -> Self {
        Self {
            name,
            hash,
            state: RwLock::new(EntryState { alive: true, death_deadline: Instant::now() }),
        }
    }

    fn join(&self) {
        let mut s = self.state.write().unwrap();
        s.alive = true;
    }

    fn leave(&self, node_death: Duration) {
        let mut s = self.state.write().unwrap();
        s.alive = false;
        s.death_deadline = Instant::now() + node_death;
    }

    pub fn is_alive(&self) -> bool {
        self.state.read().unwrap().alive
    }

    fn test_death(&self, now: Instant) -> bool {
        let s = self.state.read().unwrap();
        if s.alive {
            return false;
        }
        now > s.death_deadline
    }
}

/// Barrier readers wait on while a writer is mutating `index`/`ring`.
struct Barrier {
    pending_writers: Mutex<usize>,
    quiesced: Condvar,
}

impl Barrier {
    fn new() -> Self {
        Self { pending_writers: Mutex::new(0), quiesced: Condvar::new() }
    }

    fn enter(&self) {
        *self.pending_writers.lock().unwrap() += 1;
    }

    fn exit(&self) {
        let mut n = self.pending_writers.lock().unwrap();
        *n -= 1;
        if *n == 0 {
            self.quiesced.notify_all();
        }
    }

    fn wait(&self) {
        let mut n = self.pending_writers.lock().unwrap();
        while *n > 0 {
            n = self.quiesced.wait(n).unwrap();
        }
    }
}

use std::sync::Arc;

pub struct Table {
    hash_fn: HashFn,
    node_death: Duration,
    index: RwLock<BTreeMap<String, Arc<Entry>>>,
    ring: RwLock<BTreeMap<RingHash, Arc<Entry>>>,
    /// Serializes writers (`Join`/`Leave`/`Invalidate`/`Validate`/`Cleanup`'s
    /// removal phase), mirrors the original's `lck sync.Mutex`.
    writer_lock: Mutex<()>,
    barrier: Barrier,
    /// Serializes the scan phase of concurrent `Cleanup` calls, separate from
    /// `writer_lock` (original's `clck sync.Mutex`), so a long scan doesn't
    /// block `Join`/`Leave` from making progress.
    cleanup_scan_lock: Mutex<()>,
}

impl Table {
    pub fn new() -> Self {
        Self::with_config(default_hash_fn(), DEFAULT_NODE_DEATH)
    }

    pub fn with_config(hash_fn: HashFn, node_death: Duration) -> Self {
        Self {
            hash_fn,
            node_death,
            index: RwLock::new(BTreeMap::new()),
            ring: RwLock::new(BTreeMap::new()),
            writer_lock: Mutex::new(()),
            barrier: Barrier::new(),
            cleanup_scan_lock: Mutex::new(()),
        }
    }

    pub fn hash_of(&self, name: &str) -> RingHash {
        (self.hash_fn)(name)
    }

    pub fn len(&self) -> usize {
        self.barrier.wait();
        self.ring.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `Join(name)`: fast path revives an existing entry; slow path (under
    /// the writer lock) creates and inserts a new one.
    pub fn join(&self, name: &str) {
        if let Some(entry) = self.index.read().unwrap().get(name) {
            entry.join();
            return;
        }

        let hash = self.hash_of(name);
        let _guard = self.writer_lock.lock().unwrap();
        self.barrier.enter();
        if let Some(entry) = self.index.read().unwrap().get(name) {
            entry.join();
        } else {
            let entry = Arc::new(Entry::new_alive(name.to_string(), hash));
            self.index.write().unwrap().insert(name.to_string(), entry.clone());
            self.ring.write().unwrap().insert(hash, entry);
        }
        self.barrier.exit();
    }

    /// `Leave(name)`: marks the entry dead with a death deadline. Never
    /// removes from the ring immediately, so in-flight routes still resolve.
    pub fn leave(&self, name: &str) {
        if let Some(entry) = self.index.read().unwrap().get(name) {
            entry.leave(self.node_death);
        }
    }

    /// `Invalidate(name)`: removes from both structures immediately. Called
    /// when a node drops `HRF_Member`.
    pub fn invalidate(&self, name: &str) {
        let present = self.index.read().unwrap().contains_key(name);
        if !present {
            return;
        }
        let _guard = self.writer_lock.lock().unwrap();
        self.barrier.enter();
        if let Some(entry) = self.index.write().unwrap().remove(name) {
            self.ring.write().unwrap().remove(&entry.hash);
        }
        self.barrier.exit();
    }

    /// `Validate(name)`: idempotent join. Faithful to the original: the fast
    /// path returns without reviving a dead entry if one is already indexed;
    /// only the narrow race where the slow path re-check finds an entry
    /// (inserted concurrently between the fast-path check and acquiring the
    /// writer lock) revives it. See DESIGN.md for this quirk's provenance.
    pub fn validate(&self, name: &str) {
        if self.index.read().unwrap().contains_key(name) {
            return;
        }

        let hash = self.hash_of(name);
        let _guard = self.writer_lock.lock().unwrap();
        self.barrier.enter();
        if let Some(entry) = self.index.read().unwrap().get(name) {
            entry.join();
        } else {
            let entry = Arc::new(Entry::new_alive(name.to_string(), hash));
            self.index.write().unwrap().insert(name.to_string(), entry.clone());
            self.ring.write().unwrap().insert(hash, entry);
        }
        self.barrier.exit();
    }

    /// Two-phase cleanup: scan for dead-and-expired entries under the scan
    /// lock (so concurrent `Cleanup` calls don't duplicate work), then remove
    /// them from both structures under the writer lock.
    pub fn cleanup(&self) {
        let dead = {
            let _scan_guard = self.cleanup_scan_lock.lock().unwrap();
            let now = Instant::now();
            self.barrier.wait();
            self.ring
                .read()
                .unwrap()
                .values()
                .filter(|e| e.test_death(now))
                .cloned()
                .collect::<Vec<_>>()
        };
        if dead.is_empty() {
            return;
        }
        let _guard = self.writer_lock.lock().unwrap();
        self.barrier.enter();
        {
            let now = Instant::now();
            let mut index = self.index.write().unwrap();
            let mut ring = self.ring.write().unwrap();
            for entry in &dead {
                // Re-check under the writer lock: a rejoin between the scan
                // above and here must not be evicted on a stale snapshot.
                if !entry.test_death(now) {
                    continue;
                }
                index.remove(&entry.name);
                ring.remove(&entry.hash);
            }
        }
        self.barrier.exit();
    }

    pub fn lookup_by_name(&self, name: &str) -> Option<Arc<Entry>> {
        self.barrier.wait();
        self.index.read().unwrap().get(name).cloned()
    }

    /// Circular successor strictly greater than `id`; wraps to the smallest
    /// key if `id` is >= the largest.
    pub fn next(&self, id: &RingHash) -> Option<Arc<Entry>> {
        self.barrier.wait();
        let ring = self.ring.read().unwrap();
        ring.range((std::ops::Bound::Excluded(*id), std::ops::Bound::Unbounded))
            .next()
            .or_else(|| ring.iter().next())
            .map(|(_, e)| e.clone())
    }

    /// Circular successor greater-than-or-equal to `id`.
    pub fn next_or_equal(&self, id: &RingHash) -> Option<Arc<Entry>> {
        self.barrier.wait();
        let ring = self.ring.read().unwrap();
        ring.range((std::ops::Bound::Included(*id), std::ops::Bound::Unbounded))
            .next()
            .or_else(|| ring.iter().next())
            .map(|(_, e)| e.clone())
    }

    /// Circular predecessor strictly less than `id`; wraps to the largest
    /// key if `id` is <= the smallest.
    pub fn prev(&self, id: &RingHash) -> Option<Arc<Entry>> {
        self.barrier.wait();
        let ring = self.ring.read().unwrap();
        ring.range((std::ops::Bound::Unbounded, std::ops::Bound::Excluded(*id)))
            .next_back()
            .or_else(|| ring.iter().next_back())
            .map(|(_, e)| e.clone())
    }

    /// Next ring slot after `entry`'s own hash, wrapping around. A caller
    /// that calls `step` at most `len()` times visits every slot once.
    pub fn step(&self, entry: &Entry) -> Option<Arc<Entry>> {
        self.next(&entry.hash)
    }

    pub fn step_reverse(&self, entry: &Entry) -> Option<Arc<Entry>> {
        self.prev(&entry.hash)
    }

    pub fn left(&self) -> Option<Arc<Entry>> {
        self.barrier.wait();
        self.ring.read().unwrap().iter().next().map(|(_, e)| e.clone())
    }

    /// Property check used by tests and by the storage/ring invariants in
    /// spec §8 #1: every name in `index` has exactly one ring slot at
    /// `H(name)`, and vice versa.
    #[cfg(test)]
    fn check_symmetry(&self) -> bool {
        self.barrier.wait();
        let index = self.index.read().unwrap();
        let ring = self.ring.read().unwrap();
        if index.len() != ring.len() {
            return false;
        }
        index.values().all(|e| matches!(ring.get(&e.hash), Some(r) if Arc::ptr_eq(r, e)))
    }
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}
