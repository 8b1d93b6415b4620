//! Correlation Store: bridges admission-side identity to watch-observed
//! content via a hash of sanitized output, since the commit worker needs
//! the *post-mutation* object but only the admission request carries
//! `userInfo`.
//!
//! A map from key to a bounded FIFO queue of entries, with a parallel LRU
//! list tracking key recency for capacity eviction. One `Mutex` guards
//! both — contention is negligible at realistic event rates.

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;
use xxhash_rust::xxh64::xxh64;

use crate::event::Operation;
use crate::id::ResourceIdentifier;

pub const DEFAULT_TTL: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;
pub const DEFAULT_MAX_QUEUE_DEPTH: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationEntry {
    pub username: String,
    pub timestamp: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    Ttl,
    Lru,
    QueueDepth,
}

/// `Key(id) + ":" + operation + ":" + hex16(xxhash64(sanitizedYAML))` —
/// identical whether produced by the admission path or the watch path,
/// since both sanitize deterministically before hashing.
pub fn generate_key(id: &ResourceIdentifier, operation: Operation, sanitized_yaml: &[u8]) -> String {
    format!("{}:{}:{:016x}", id.key(), operation, xxh64(sanitized_yaml, 0))
}

/// The operation a correlation key is generated *for*, as opposed to the
/// operation recorded on the resulting `Event`. The watch side observes a
/// `watcher::Event::Apply` for both a brand-new object and an updated one
/// and has no prior-state tracking to tell them apart (see
/// `watch::flatten`), so it always reports `Update`. The admission side,
/// which does see the real `CREATE`/`UPDATE` distinction, must collapse
/// both onto the same canonical operation here or its keys never match the
/// watch side's lookup — every CREATE would miss. DELETE is unambiguous on
/// both sides and keeps its own key.
pub fn canonical_for_key(operation: Operation) -> Operation {
    match operation {
        Operation::Create | Operation::Update => Operation::Update,
        Operation::Delete => Operation::Delete,
    }
}

struct Inner {
    queues: std::collections::HashMap<String, VecDeque<CorrelationEntry>>,
    lru: LruCache<String, ()>,
}

pub struct CorrelationStore {
    inner: Mutex<Inner>,
    ttl: Duration,
    max_queue_depth: usize,
    evictions: Mutex<Vec<EvictionReason>>,
}

impl CorrelationStore {
    pub fn new(ttl: Duration, max_entries: usize, max_queue_depth: usize) -> Self {
        let capacity = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::new(1).unwrap());
        Self {
            inner: Mutex::new(Inner {
                queues: std::collections::HashMap::new(),
                lru: LruCache::new(capacity),
            }),
            ttl,
            max_queue_depth,
            evictions: Mutex::new(Vec::new()),
        }
    }

    /// Drains and returns eviction reasons recorded since the last call —
    /// the seam the metrics layer polls to increment
    /// `correlation_evictions_total{reason}` without this module knowing
    /// about `prometheus_client`.
    pub fn drain_evictions(&self) -> Vec<EvictionReason> {
        std::mem::take(&mut self.evictions.lock().expect("correlation store lock poisoned"))
    }

    pub fn size(&self) -> usize {
        let guard = self.inner.lock().expect("correlation store lock poisoned");
        guard.queues.values().map(VecDeque::len).sum()
    }

    /// Appends an entry to `key`'s queue, evicting the oldest queued
    /// entry if depth exceeds `max_queue_depth`, and evicting the
    /// globally least-recently-used key if inserting a *new* key would
    /// exceed `max_entries`.
    pub fn put(&self, key: impl Into<String>, username: impl Into<String>) {
        let key = key.into();
        let mut guard = self.inner.lock().expect("correlation store lock poisoned");
        let mut reasons = Vec::new();

        let is_new_key = !guard.queues.contains_key(&key);
        if is_new_key {
            if guard.lru.len() >= guard.lru.cap().get() {
                if let Some((evicted_key, _)) = guard.lru.pop_lru() {
                    let evicted_count = guard.queues.get(&evicted_key).map_or(1, VecDeque::len);
                    guard.queues.remove(&evicted_key);
                    reasons.extend(std::iter::repeat(EvictionReason::Lru).take(evicted_count));
                }
            }
            guard.queues.insert(key.clone(), VecDeque::new());
        }

        let queue = guard.queues.entry(key.clone()).or_default();
        queue.push_back(CorrelationEntry {
            username: username.into(),
            timestamp: Instant::now(),
        });
        if queue.len() > self.max_queue_depth {
            queue.pop_front();
            reasons.push(EvictionReason::QueueDepth);
        }

        // Marks `key` most-recently-used; capacity is already enforced
        // above so this never triggers a second, untracked eviction.
        guard.lru.put(key.clone(), ());
        drop(guard);
        self.evictions.lock().expect("correlation store lock poisoned").extend(reasons);
    }

    /// Pops the oldest entry for `key` unless it has aged past the TTL,
    /// in which case the *entire* key is dropped and `None` is returned.
    pub fn get_and_delete(&self, key: &str) -> Option<CorrelationEntry> {
        let mut guard = self.inner.lock().expect("correlation store lock poisoned");
        let expired = match guard.queues.get(key).and_then(|q| q.front()) {
            Some(head) => head.timestamp.elapsed() > self.ttl,
            None => return None,
        };

        if expired {
            let evicted_count = guard.queues.get(key).map_or(1, VecDeque::len);
            guard.queues.remove(key);
            guard.lru.pop(key);
            drop(guard);
            self.evictions
                .lock()
                .expect("correlation store lock poisoned")
                .extend(std::iter::repeat(EvictionReason::Ttl).take(evicted_count));
            return None;
        }

        let queue = guard.queues.get_mut(key)?;
        let entry = queue.pop_front();
        if queue.is_empty() {
            guard.queues.remove(key);
            guard.lru.pop(key);
        }
        entry
    }

    /// Timer-driven sweep: deletes any key whose head entry has aged past
    /// the TTL. Every queued entry in a removed key counts as one
    /// eviction (spec.md §4.D), matching `get_and_delete`'s accounting.
    pub fn evict_expired(&self) {
        let mut guard = self.inner.lock().expect("correlation store lock poisoned");
        let expired_keys: Vec<(String, usize)> = guard
            .queues
            .iter()
            .filter(|(_, q)| q.front().is_some_and(|head| head.timestamp.elapsed() > self.ttl))
            .map(|(k, q)| (k.clone(), q.len()))
            .collect();
        for (key, _) in &expired_keys {
            guard.queues.remove(key);
            guard.lru.pop(key);
        }
        drop(guard);
        if !expired_keys.is_empty() {
            let mut evictions = self.evictions.lock().expect("correlation store lock poisoned");
            evictions.extend(expired_keys.iter().flat_map(|(_, count)| std::iter::repeat(EvictionReason::Ttl).take(*count)));
        }
    }
}

impl Default for CorrelationStore {
    fn default() -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_MAX_ENTRIES, DEFAULT_MAX_QUEUE_DEPTH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_across_same_content_key() {
        let store = CorrelationStore::default();
        store.put("k1", "alice");
        store.put("k1", "bob");
        store.put("k1", "alice");
        assert_eq!(store.get_and_delete("k1").unwrap().username, "alice");
        assert_eq!(store.get_and_delete("k1").unwrap().username, "bob");
        assert_eq!(store.get_and_delete("k1").unwrap().username, "alice");
        assert!(store.get_and_delete("k1").is_none());
    }

    #[test]
    fn miss_on_unknown_key_is_none_not_fatal() {
        let store = CorrelationStore::default();
        assert!(store.get_and_delete("missing").is_none());
    }

    #[test]
    fn queue_depth_drops_oldest_entry() {
        let store = CorrelationStore::new(DEFAULT_TTL, DEFAULT_MAX_ENTRIES, 2);
        store.put("k1", "a");
        store.put("k1", "b");
        store.put("k1", "c");
        assert_eq!(store.get_and_delete("k1").unwrap().username, "b");
        assert_eq!(store.get_and_delete("k1").unwrap().username, "c");
    }

    #[test]
    fn ttl_expiry_drops_whole_key() {
        let store = CorrelationStore::new(Duration::from_millis(1), DEFAULT_MAX_ENTRIES, DEFAULT_MAX_QUEUE_DEPTH);
        store.put("k1", "alice");
        std::thread::sleep(Duration::from_millis(5));
        assert!(store.get_and_delete("k1").is_none());
    }

    #[test]
    fn lru_eviction_at_capacity() {
        let store = CorrelationStore::new(DEFAULT_TTL, 2, DEFAULT_MAX_QUEUE_DEPTH);
        store.put("k1", "a");
        store.put("k2", "b");
        store.put("k3", "c");
        assert!(store.get_and_delete("k1").is_none());
        assert_eq!(store.get_and_delete("k2").unwrap().username, "b");
        assert_eq!(store.get_and_delete("k3").unwrap().username, "c");
    }

    #[test]
    fn capacity_bound_holds() {
        let store = CorrelationStore::new(DEFAULT_TTL, 5, 3);
        for i in 0..20 {
            store.put(format!("k{}", i % 8), "user");
        }
        assert!(store.size() <= 5 * 3);
    }

    #[test]
    fn canonical_for_key_collapses_create_and_update_but_not_delete() {
        let id = ResourceIdentifier::new("", "v1", "configmaps", "default", "cm1");
        let yaml = b"apiVersion: v1\n";
        let create_key = generate_key(&id, canonical_for_key(Operation::Create), yaml);
        let update_key = generate_key(&id, canonical_for_key(Operation::Update), yaml);
        let delete_key = generate_key(&id, canonical_for_key(Operation::Delete), yaml);
        assert_eq!(create_key, update_key, "admission CREATE must land on the same key watch-side Update lookups use");
        assert_ne!(create_key, delete_key);
    }

    #[test]
    fn lru_eviction_counts_every_queued_entry() {
        let store = CorrelationStore::new(DEFAULT_TTL, 2, DEFAULT_MAX_QUEUE_DEPTH);
        store.put("k1", "a");
        store.put("k1", "b");
        store.put("k1", "c");
        store.put("k2", "d");
        // Inserting a third key evicts k1, which still holds 3 queued entries.
        store.put("k3", "e");
        let reasons = store.drain_evictions();
        assert_eq!(reasons.iter().filter(|r| **r == EvictionReason::Lru).count(), 3);
    }

    #[test]
    fn ttl_eviction_via_get_and_delete_counts_every_queued_entry() {
        let store = CorrelationStore::new(Duration::from_millis(1), DEFAULT_MAX_ENTRIES, DEFAULT_MAX_QUEUE_DEPTH);
        store.put("k1", "a");
        store.put("k1", "b");
        std::thread::sleep(Duration::from_millis(5));
        assert!(store.get_and_delete("k1").is_none());
        let reasons = store.drain_evictions();
        assert_eq!(reasons.iter().filter(|r| **r == EvictionReason::Ttl).count(), 2);
    }

    #[test]
    fn ttl_eviction_via_sweep_counts_every_queued_entry() {
        let store = CorrelationStore::new(Duration::from_millis(1), DEFAULT_MAX_ENTRIES, DEFAULT_MAX_QUEUE_DEPTH);
        store.put("k1", "a");
        store.put("k1", "b");
        store.put("k1", "c");
        std::thread::sleep(Duration::from_millis(5));
        store.evict_expired();
        let reasons = store.drain_evictions();
        assert_eq!(reasons.iter().filter(|r| **r == EvictionReason::Ttl).count(), 3);
    }

    #[test]
    fn generate_key_is_stable_for_equal_input() {
        let id = ResourceIdentifier::new("", "v1", "configmaps", "default", "cm1");
        let a = generate_key(&id, Operation::Update, b"apiVersion: v1\n");
        let b = generate_key(&id, Operation::Update, b"apiVersion: v1\n");
        assert_eq!(a, b);
        let c = generate_key(&id, Operation::Update, b"apiVersion: v2\n");
        assert_ne!(a, c);
    }
}
