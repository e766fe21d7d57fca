// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The tiered store: the caching protocol over the tier stack.
//!
//! Invariants maintained here:
//!
//! - A key resides in at most one tier at any moment.
//! - A read hit in a slower tier promotes the mapping to the fastest
//!   tier before returning.
//! - A write always lands in the fastest tier; stale copies in slower
//!   tiers are dropped first.
//! - Entries evicted from a tier cascade to the next slower tier; an
//!   entry evicted from the slowest tier leaves the store.
//!
//! Per-key operations serialize on a striped lock keyed by the key's
//! hash. Stripe locks are held one at a time and never while waiting on
//! another stripe, so the protocol cannot deadlock.

use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::codec::{Codec, JsonCodec};
use crate::config::{TierKind, TieredStoreConfig};
use crate::error::StoreError;
use crate::metrics::{self, LatencyTimer};
use crate::persistence::PersistenceCoordinator;
use crate::tier::{DiskTier, HeapTier, OffHeapTier, StoreKey, StoreValue, Tier, TierStats};

struct StripedLocks {
    stripes: Box<[Mutex<()>]>,
    mask: usize,
}

impl StripedLocks {
    fn new(count: usize) -> Self {
        let n = count.max(1).next_power_of_two();
        let stripes: Vec<Mutex<()>> = (0..n).map(|_| Mutex::new(())).collect();
        Self {
            stripes: stripes.into_boxed_slice(),
            mask: n - 1,
        }
    }

    fn guard<K: Hash>(&self, key: &K) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        self.stripes[(hasher.finish() as usize) & self.mask].lock()
    }
}

/// A cache spread across an ordered stack of storage tiers.
///
/// Closing the store is terminal. A durable disk tier survives a close
/// and is reopened by a later store with the same cache name and
/// directory; a swap tier is deleted.
pub struct TieredStore<K: StoreKey, V: StoreValue, C: Codec = JsonCodec> {
    tiers: Vec<Tier<K, V>>,
    locks: StripedLocks,
    codec: C,
    persistence: Option<PersistenceCoordinator>,
    closed: AtomicBool,
    cache_name: String,
}

impl<K: StoreKey, V: StoreValue> TieredStore<K, V, JsonCodec> {
    /// Open a store with the default JSON codec.
    pub fn new(config: TieredStoreConfig) -> Result<Self, StoreError> {
        Self::with_codec(config, JsonCodec)
    }
}

impl<K: StoreKey, V: StoreValue, C: Codec> TieredStore<K, V, C> {
    /// Open a store with a caller-supplied codec.
    ///
    /// Validates the configuration, then builds the tiers fastest to
    /// slowest. With a disk tier under `create_if_absent`, a prior
    /// segment's entries are visible immediately.
    pub fn with_codec(config: TieredStoreConfig, codec: C) -> Result<Self, StoreError> {
        config.validate()?;

        let mut tiers = Vec::new();
        let mut persistence = None;
        for (kind, pool) in config.ordered_pools() {
            match kind {
                TierKind::Heap => tiers.push(Tier::Heap(HeapTier::new(&pool))),
                TierKind::OffHeap => tiers.push(Tier::OffHeap(OffHeapTier::new(&pool))),
                TierKind::Disk => {
                    let dir = config.disk_dir.as_deref().ok_or_else(|| {
                        StoreError::Configuration("disk tier requires a directory".into())
                    })?;
                    let coordinator =
                        PersistenceCoordinator::new(config.persistence, dir, &config.cache_name)?;
                    let segment = coordinator.open_segment()?;
                    tiers.push(Tier::Disk(DiskTier::open(segment, &pool, &codec)?));
                    persistence = Some(coordinator);
                }
            }
        }

        info!(
            cache = %config.cache_name,
            tiers = tiers.len(),
            persistence = %config.persistence,
            "tiered store opened"
        );
        Ok(Self {
            tiers,
            locks: StripedLocks::new(config.lock_stripes),
            codec,
            persistence,
            closed: AtomicBool::new(false),
            cache_name: config.cache_name,
        })
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    /// Look up a key.
    ///
    /// A hit in a slower tier moves the mapping to the fastest tier, so
    /// repeated reads of the same key are served from memory.
    #[tracing::instrument(level = "debug", skip_all, fields(cache = %self.cache_name, tier = tracing::field::Empty))]
    pub fn get(&self, key: &K) -> Result<Option<V>, StoreError> {
        self.ensure_open()?;
        let _timer = LatencyTimer::new("store", "get");

        let mut promoted_from = None;
        let mut restore_spill = None;
        let value = {
            let _guard = self.locks.guard(key);
            let mut found = None;
            for (idx, tier) in self.tiers.iter().enumerate() {
                if let Some(value) = tier.get(key, &self.codec)? {
                    tracing::Span::current().record("tier", tier.label());
                    metrics::record_tier_op(tier.label(), "get", "hit");
                    found = Some((idx, value));
                    break;
                }
            }
            let Some((idx, value)) = found else {
                metrics::record_tier_op("store", "get", "miss");
                return Ok(None);
            };
            if idx == 0 {
                return Ok(Some(value));
            }

            // Promote: drop the slow copy, install in the fastest tier.
            self.tiers[idx].discard(key, &self.codec)?;
            match self.tiers[0].put(key.clone(), value.clone(), &self.codec) {
                Ok(evicted) => {
                    promoted_from = Some((idx, evicted));
                }
                Err(err) => {
                    // Keep serving the value; put it back where it was.
                    warn!(error = %err, "promotion failed, restoring entry to its tier");
                    match self.tiers[idx].put(key.clone(), value.clone(), &self.codec) {
                        // Anything the restore displaces still has to
                        // move down the stack, not disappear.
                        Ok(evicted) => restore_spill = Some((idx + 1, evicted)),
                        Err(restore) => {
                            error!(error = %restore, "failed to restore entry after promotion failure");
                        }
                    }
                }
            }
            value
        };

        if let Some((idx, evicted)) = promoted_from {
            metrics::record_promotion(self.tiers[idx].label());
            self.cascade(1, evicted);
        }
        if let Some((start, evicted)) = restore_spill {
            self.cascade(start, evicted);
        }
        Ok(Some(value))
    }

    /// Install a mapping in the fastest tier.
    ///
    /// An entry too large for any tier in the stack is rejected before
    /// anything is mutated.
    #[tracing::instrument(level = "debug", skip_all, fields(cache = %self.cache_name))]
    pub fn put(&self, key: K, value: V) -> Result<(), StoreError> {
        self.ensure_open()?;
        let _timer = LatencyTimer::new("store", "put");

        if self.tiers.iter().any(Tier::needs_encoding) {
            let key_len = self.codec.encode(&key)?.len();
            let value_len = self.codec.encode(&value)?.len();
            for tier in &self.tiers {
                tier.check_admissible(key_len, value_len)?;
            }
        }

        let evicted = {
            let _guard = self.locks.guard(&key);
            // Single-residency: purge stale copies below before the
            // fresh write lands on top.
            for tier in &self.tiers[1..] {
                if tier.discard(&key, &self.codec)? {
                    break;
                }
            }
            self.tiers[0].put(key, value, &self.codec)?
        };

        metrics::record_tier_op(self.tiers[0].label(), "put", "ok");
        self.cascade(1, evicted);
        Ok(())
    }

    /// Remove a mapping from whichever tier holds it.
    #[tracing::instrument(level = "debug", skip_all, fields(cache = %self.cache_name))]
    pub fn remove(&self, key: &K) -> Result<Option<V>, StoreError> {
        self.ensure_open()?;
        let _timer = LatencyTimer::new("store", "remove");

        let _guard = self.locks.guard(key);
        for tier in &self.tiers {
            if let Some(value) = tier.remove(key, &self.codec)? {
                metrics::record_tier_op(tier.label(), "remove", "ok");
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    /// Whether a mapping exists, without refreshing its recency or
    /// moving it between tiers.
    pub fn contains_key(&self, key: &K) -> Result<bool, StoreError> {
        self.ensure_open()?;
        let _guard = self.locks.guard(key);
        Ok(self.tiers.iter().any(|t| t.contains(key)))
    }

    /// The tier currently holding a key, if any.
    pub fn residency(&self, key: &K) -> Result<Option<TierKind>, StoreError> {
        self.ensure_open()?;
        let _guard = self.locks.guard(key);
        Ok(self.residency_unlocked(key))
    }

    fn residency_unlocked(&self, key: &K) -> Option<TierKind> {
        self.tiers
            .iter()
            .find(|t| t.contains(key))
            .map(Tier::kind)
    }

    /// Push evicted entries down the stack, starting at `start`.
    ///
    /// Entries falling off the slowest tier leave the store. Each
    /// victim only ever moves to a slower tier, so the walk terminates.
    /// Stripe locks are taken per victim, one at a time.
    fn cascade(&self, start: usize, evicted: Vec<(K, V)>) {
        let mut pending: VecDeque<(usize, K, V)> = evicted
            .into_iter()
            .map(|(k, v)| (start, k, v))
            .collect();

        while let Some((idx, key, value)) = pending.pop_front() {
            if idx >= self.tiers.len() {
                debug!(key = ?key, "entry evicted from the slowest tier");
                metrics::record_eviction(
                    self.tiers
                        .last()
                        .map(Tier::label)
                        .unwrap_or("store"),
                    1,
                );
                continue;
            }

            let _guard = self.locks.guard(&key);
            // A concurrent write or promotion re-established this key
            // elsewhere; the demoted copy is stale.
            if self.residency_unlocked(&key).is_some() {
                debug!(key = ?key, "dropping stale demotion, key was re-established");
                continue;
            }

            let tier = &self.tiers[idx];
            match tier.put(key.clone(), value.clone(), &self.codec) {
                Ok(next) => {
                    metrics::record_demotion(tier.label());
                    drop(_guard);
                    for (k, v) in next {
                        pending.push_back((idx + 1, k, v));
                    }
                }
                Err(StoreError::EntryTooLarge { .. }) => {
                    drop(_guard);
                    // Skip a tier the entry could never fit.
                    pending.push_back((idx + 1, key, value));
                }
                Err(err) => {
                    error!(error = %err, tier = tier.label(), "demotion failed, dropping entry");
                }
            }
        }
    }

    /// Number of mappings across all tiers.
    pub fn len(&self) -> usize {
        self.tiers.iter().map(Tier::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    /// Per-tier occupancy, fastest first.
    pub fn tier_stats(&self) -> Vec<TierStats> {
        self.tiers.iter().map(Tier::stats).collect()
    }

    /// Publish per-tier occupancy gauges.
    pub fn update_gauge_metrics(&self) {
        for tier in &self.tiers {
            metrics::set_tier_entries(tier.label(), tier.len());
            metrics::set_tier_bytes(tier.label(), tier.used_bytes());
        }
    }

    /// Drop every mapping from every tier. The store stays open.
    pub fn invalidate_all(&self) -> Result<(), StoreError> {
        self.ensure_open()?;
        for tier in &self.tiers {
            tier.clear()?;
        }
        info!(cache = %self.cache_name, "all entries invalidated");
        Ok(())
    }

    /// Close the store.
    ///
    /// A durable disk segment is compacted and synced; a swap segment
    /// is deleted. Further operations fail with [`StoreError::Closed`].
    /// Idempotent.
    pub fn close(&self) -> Result<(), StoreError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let retain = self
            .persistence
            .as_ref()
            .is_some_and(PersistenceCoordinator::retain_on_close);
        if let Some(disk) = self.tiers.iter().find_map(|t| match t {
            Tier::Disk(d) => Some(d),
            _ => None,
        }) {
            disk.close(retain)?;
        }
        info!(cache = %self.cache_name, retained = retain, "tiered store closed");
        Ok(())
    }

    /// Close the store and delete its disk segment regardless of the
    /// persistence mode.
    pub fn destroy(self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::Release);
        for tier in &self.tiers {
            tier.clear()?;
        }
        if let Some(coordinator) = &self.persistence {
            coordinator.discard_segment()?;
        }
        info!(cache = %self.cache_name, "tiered store destroyed");
        Ok(())
    }
}

impl<K: StoreKey, V: StoreValue, C: Codec> Drop for TieredStore<K, V, C> {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            if let Err(err) = self.close() {
                warn!(cache = %self.cache_name, error = %err, "close on drop failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PersistenceMode, ResourcePool};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    use serde::de::DeserializeOwned;
    use serde::Serialize;

    /// Codec that fails a bounded number of encodes, then pads later
    /// ones. Padding inflates entry sizes without breaking decode, so a
    /// re-encoded entry can displace its neighbours.
    #[derive(Clone, Default)]
    struct FaultCodec {
        fail_encodes: Arc<AtomicUsize>,
        pad: Arc<AtomicUsize>,
    }

    impl Codec for FaultCodec {
        fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, StoreError> {
            let budget = self.fail_encodes.load(Ordering::SeqCst);
            if budget > 0 {
                self.fail_encodes.store(budget - 1, Ordering::SeqCst);
                return Err(StoreError::Serialization("injected encode failure".into()));
            }
            let mut bytes = vec![b' '; self.pad.load(Ordering::SeqCst)];
            let body = serde_json::to_vec(value)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            bytes.extend_from_slice(&body);
            Ok(bytes)
        }

        fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, StoreError> {
            serde_json::from_slice(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
        }
    }

    fn memory_config(name: &str, heap_entries: u64) -> TieredStoreConfig {
        TieredStoreConfig {
            cache_name: name.into(),
            heap: Some(ResourcePool::entries(heap_entries)),
            offheap: None,
            disk: None,
            persistence: PersistenceMode::None,
            disk_dir: None,
            lock_stripes: 8,
        }
    }

    #[test]
    fn test_put_get_remove() {
        let store: TieredStore<String, u32> =
            TieredStore::new(memory_config("basic", 8)).unwrap();
        store.put("a".into(), 1).unwrap();
        assert_eq!(store.get(&"a".to_string()).unwrap(), Some(1));
        assert_eq!(store.remove(&"a".to_string()).unwrap(), Some(1));
        assert_eq!(store.get(&"a".to_string()).unwrap(), None);
        assert!(store.is_empty());
    }

    #[test]
    fn test_heap_overflow_drops_oldest_when_no_lower_tier() {
        let store: TieredStore<String, u32> =
            TieredStore::new(memory_config("overflow", 1)).unwrap();
        store.put("a".into(), 1).unwrap();
        store.put("b".into(), 2).unwrap();
        assert_eq!(store.get(&"a".to_string()).unwrap(), None);
        assert_eq!(store.get(&"b".to_string()).unwrap(), Some(2));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_overflow_demotes_to_offheap() {
        let mut config = memory_config("demote", 1);
        config.offheap = Some(ResourcePool::bytes(4096));
        let store: TieredStore<String, u32> = TieredStore::new(config).unwrap();

        store.put("a".into(), 1).unwrap();
        store.put("b".into(), 2).unwrap();
        assert_eq!(store.residency(&"a".to_string()).unwrap(), Some(TierKind::OffHeap));
        assert_eq!(store.residency(&"b".to_string()).unwrap(), Some(TierKind::Heap));
    }

    #[test]
    fn test_read_promotes_back_to_heap() {
        let mut config = memory_config("promote", 1);
        config.offheap = Some(ResourcePool::bytes(4096));
        let store: TieredStore<String, u32> = TieredStore::new(config).unwrap();

        store.put("a".into(), 1).unwrap();
        store.put("b".into(), 2).unwrap();
        assert_eq!(store.get(&"a".to_string()).unwrap(), Some(1));
        // Promotion swapped the two keys' tiers.
        assert_eq!(store.residency(&"a".to_string()).unwrap(), Some(TierKind::Heap));
        assert_eq!(store.residency(&"b".to_string()).unwrap(), Some(TierKind::OffHeap));
    }

    #[test]
    fn test_contains_key_does_not_promote() {
        let mut config = memory_config("peek", 1);
        config.offheap = Some(ResourcePool::bytes(4096));
        let store: TieredStore<String, u32> = TieredStore::new(config).unwrap();

        store.put("a".into(), 1).unwrap();
        store.put("b".into(), 2).unwrap();
        assert!(store.contains_key(&"a".to_string()).unwrap());
        assert_eq!(store.residency(&"a".to_string()).unwrap(), Some(TierKind::OffHeap));
    }

    #[test]
    fn test_overwrite_purges_slower_copy() {
        let mut config = memory_config("purge", 1);
        config.offheap = Some(ResourcePool::bytes(4096));
        let store: TieredStore<String, u32> = TieredStore::new(config).unwrap();

        store.put("a".into(), 1).unwrap();
        store.put("b".into(), 2).unwrap();
        // "a" now lives off-heap; rewriting it must leave one copy.
        store.put("a".into(), 10).unwrap();
        assert_eq!(store.residency(&"a".to_string()).unwrap(), Some(TierKind::Heap));
        assert_eq!(store.get(&"a".to_string()).unwrap(), Some(10));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_failed_promotion_restore_cascades_displaced_entries() {
        let dir = tempfile::tempdir().unwrap();
        let codec = FaultCodec::default();
        // Heap fits one entry, off-heap exactly two (26 encoded bytes
        // each), disk catches whatever falls further.
        let config = TieredStoreConfig {
            cache_name: "restore".into(),
            heap: Some(ResourcePool::bytes(26)),
            offheap: Some(ResourcePool::bytes(52)),
            disk: Some(ResourcePool::entries(10).durable()),
            persistence: PersistenceMode::CreateIfAbsent,
            disk_dir: Some(dir.path().to_path_buf()),
            lock_stripes: 8,
        };
        let store: TieredStore<String, String, FaultCodec> =
            TieredStore::with_codec(config, codec.clone()).unwrap();

        let v = "x".repeat(20);
        for key in ["aa", "bb", "cc", "dd"] {
            store.put(key.into(), v.clone()).unwrap();
        }
        assert_eq!(store.residency(&"aa".to_string()).unwrap(), Some(TierKind::Disk));
        assert_eq!(store.residency(&"bb".to_string()).unwrap(), Some(TierKind::OffHeap));
        assert_eq!(store.residency(&"cc".to_string()).unwrap(), Some(TierKind::OffHeap));
        assert_eq!(store.residency(&"dd".to_string()).unwrap(), Some(TierKind::Heap));

        // Fail the next encode (the promotion into the heap), and pad
        // later ones so the restored entry no longer fits beside "cc".
        codec.fail_encodes.store(1, Ordering::SeqCst);
        codec.pad.store(8, Ordering::SeqCst);

        assert_eq!(store.get(&"bb".to_string()).unwrap(), Some(v));
        assert_eq!(store.residency(&"bb".to_string()).unwrap(), Some(TierKind::OffHeap));
        // The entry displaced by the restore moved down the stack; it
        // was not lost.
        assert_eq!(store.residency(&"cc".to_string()).unwrap(), Some(TierKind::Disk));
        assert_eq!(store.len(), 4);
    }

    #[test]
    fn test_operations_fail_after_close() {
        let store: TieredStore<String, u32> =
            TieredStore::new(memory_config("closed", 8)).unwrap();
        store.put("a".into(), 1).unwrap();
        store.close().unwrap();
        store.close().unwrap();
        assert!(matches!(store.get(&"a".to_string()), Err(StoreError::Closed)));
        assert!(matches!(store.put("b".into(), 2), Err(StoreError::Closed)));
        assert!(matches!(store.remove(&"a".to_string()), Err(StoreError::Closed)));
    }

    #[test]
    fn test_invalidate_all_keeps_store_open() {
        let store: TieredStore<String, u32> =
            TieredStore::new(memory_config("wipe", 8)).unwrap();
        store.put("a".into(), 1).unwrap();
        store.invalidate_all().unwrap();
        assert!(store.is_empty());
        store.put("b".into(), 2).unwrap();
        assert_eq!(store.get(&"b".to_string()).unwrap(), Some(2));
    }

    #[test]
    fn test_tier_stats_report_occupancy() {
        let mut config = memory_config("stats", 4);
        config.offheap = Some(ResourcePool::bytes(4096));
        let store: TieredStore<String, u32> = TieredStore::new(config).unwrap();
        for i in 0..3 {
            store.put(format!("k{i}"), i).unwrap();
        }
        let stats = store.tier_stats();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].kind, TierKind::Heap);
        assert_eq!(stats[0].entries, 3);
        assert_eq!(stats[1].kind, TierKind::OffHeap);
        assert_eq!(stats[1].entries, 0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = memory_config("bad", 0);
        config.heap = Some(ResourcePool::entries(0));
        let result: Result<TieredStore<String, u32>, _> = TieredStore::new(config);
        assert!(matches!(
            result,
            Err(StoreError::CapacityMisconfiguration { .. })
        ));
    }

    #[test]
    fn test_stripe_count_rounds_to_power_of_two() {
        let locks = StripedLocks::new(5);
        assert_eq!(locks.stripes.len(), 8);
        assert_eq!(locks.mask, 7);
        let locks = StripedLocks::new(0);
        assert_eq!(locks.stripes.len(), 1);
    }
}
