// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fastest tier: values live on the heap in their deserialized form.
//!
//! Capacity is counted in entries by default. Under a byte-counted pool
//! an entry is charged its encoded key plus value length, which keeps
//! the accounting consistent with the slower tiers.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use crate::codec::Codec;
use crate::config::{ResourcePool, TierKind};
use crate::error::StoreError;
use crate::eviction::{EvictionCandidate, LruPolicy, ReclaimTarget};
use crate::tier::{Capacity, StoreKey, StoreValue};

struct HeapEntry<V> {
    value: V,
    size_bytes: u64,
    last_access: u64,
    inserted_seq: u64,
}

pub(crate) struct HeapTier<K, V> {
    entries: DashMap<K, HeapEntry<V>>,
    capacity: Capacity,
    used_bytes: AtomicU64,
    clock: AtomicU64,
    seq: AtomicU64,
    policy: LruPolicy,
}

impl<K: StoreKey, V: StoreValue> HeapTier<K, V> {
    pub(crate) fn new(pool: &ResourcePool) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: Capacity::from_pool(pool),
            used_bytes: AtomicU64::new(0),
            clock: AtomicU64::new(0),
            seq: AtomicU64::new(0),
            policy: LruPolicy,
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn get(&self, key: &K) -> Option<V> {
        let mut entry = self.entries.get_mut(key)?;
        entry.last_access = self.tick();
        Some(entry.value.clone())
    }

    pub(crate) fn put<C: Codec>(
        &self,
        key: K,
        value: V,
        codec: &C,
    ) -> Result<Vec<(K, V)>, StoreError> {
        let size_bytes = match self.capacity {
            Capacity::Bytes(_) => {
                (codec.encode(&key)?.len() + codec.encode(&value)?.len()) as u64
            }
            Capacity::Entries(_) => 0,
        };
        let entry = HeapEntry {
            value,
            size_bytes,
            last_access: self.tick(),
            inserted_seq: self.seq.fetch_add(1, Ordering::Relaxed),
        };
        // Two atomic ops, never a read-modify-write: concurrent inserts
        // and removes of other keys touch the counter between any load
        // and store we could make here.
        self.used_bytes.fetch_add(size_bytes, Ordering::Release);
        if let Some(old) = self.entries.insert(key, entry) {
            self.used_bytes.fetch_sub(old.size_bytes, Ordering::Release);
        }
        Ok(self.enforce_capacity())
    }

    fn over_capacity(&self) -> Option<ReclaimTarget> {
        match self.capacity {
            Capacity::Entries(cap) => {
                let n = self.entries.len() as u64;
                (n > cap).then(|| ReclaimTarget::Entries(n - cap))
            }
            Capacity::Bytes(cap) => {
                let used = self.used_bytes.load(Ordering::Acquire);
                (used > cap).then(|| ReclaimTarget::Bytes(used - cap))
            }
        }
    }

    fn enforce_capacity(&self) -> Vec<(K, V)> {
        let mut evicted = Vec::new();
        while let Some(target) = self.over_capacity() {
            let candidates: Vec<EvictionCandidate<K>> = self
                .entries
                .iter()
                .map(|r| EvictionCandidate {
                    key: r.key().clone(),
                    last_access: r.value().last_access,
                    inserted_seq: r.value().inserted_seq,
                    size_bytes: r.value().size_bytes,
                })
                .collect();
            if candidates.is_empty() {
                break;
            }
            let victims = self.policy.select_victims(candidates, target);
            if victims.is_empty() {
                break;
            }
            let mut removed_any = false;
            for victim in victims {
                if let Some((k, entry)) = self.entries.remove(&victim) {
                    self.used_bytes.fetch_sub(entry.size_bytes, Ordering::Release);
                    evicted.push((k, entry.value));
                    removed_any = true;
                }
            }
            if !removed_any {
                // A concurrent remove beat us to every victim.
                break;
            }
        }
        evicted
    }

    pub(crate) fn remove(&self, key: &K) -> Option<V> {
        let (_, entry) = self.entries.remove(key)?;
        self.used_bytes.fetch_sub(entry.size_bytes, Ordering::Release);
        Some(entry.value)
    }

    pub(crate) fn discard(&self, key: &K) -> bool {
        self.remove(key).is_some()
    }

    pub(crate) fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub(crate) fn clear(&self) {
        self.entries.clear();
        self.used_bytes.store(0, Ordering::Release);
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn used_bytes(&self) -> u64 {
        self.used_bytes.load(Ordering::Acquire)
    }

    pub(crate) fn needs_encoding(&self) -> bool {
        matches!(self.capacity, Capacity::Bytes(_))
    }

    pub(crate) fn check_admissible(
        &self,
        key_len: usize,
        value_len: usize,
    ) -> Result<(), StoreError> {
        if let Capacity::Bytes(cap) = self.capacity {
            let size = (key_len + value_len) as u64;
            if size > cap {
                return Err(StoreError::EntryTooLarge {
                    kind: TierKind::Heap,
                    size,
                    capacity: cap,
                });
            }
        }
        Ok(())
    }
}
