// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Middle tier: values held in memory in encoded form.
//!
//! Storing only encoded bytes keeps per-entry overhead flat and makes
//! the byte accounting exact, at the cost of a codec round trip on
//! every hit. Off-heap pools are always byte-counted.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tracing::error;

use crate::codec::Codec;
use crate::config::{ResourcePool, TierKind};
use crate::error::StoreError;
use crate::eviction::{EvictionCandidate, LruPolicy, ReclaimTarget};
use crate::tier::{Capacity, StoreKey, StoreValue};

struct OffHeapEntry {
    bytes: Box<[u8]>,
    key_bytes: u64,
    last_access: u64,
    inserted_seq: u64,
}

impl OffHeapEntry {
    fn size_bytes(&self) -> u64 {
        self.key_bytes + self.bytes.len() as u64
    }
}

pub(crate) struct OffHeapTier<K, V> {
    entries: DashMap<K, OffHeapEntry>,
    capacity_bytes: u64,
    used_bytes: AtomicU64,
    clock: AtomicU64,
    seq: AtomicU64,
    policy: LruPolicy,
    _marker: std::marker::PhantomData<fn() -> V>,
}

impl<K: StoreKey, V: StoreValue> OffHeapTier<K, V> {
    pub(crate) fn new(pool: &ResourcePool) -> Self {
        let capacity_bytes = match Capacity::from_pool(pool) {
            Capacity::Bytes(cap) => cap,
            // Config validation rejects entry-counted off-heap pools.
            Capacity::Entries(cap) => cap,
        };
        Self {
            entries: DashMap::new(),
            capacity_bytes,
            used_bytes: AtomicU64::new(0),
            clock: AtomicU64::new(0),
            seq: AtomicU64::new(0),
            policy: LruPolicy,
            _marker: std::marker::PhantomData,
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn get<C: Codec>(&self, key: &K, codec: &C) -> Result<Option<V>, StoreError> {
        let Some(mut entry) = self.entries.get_mut(key) else {
            return Ok(None);
        };
        let value = codec.decode(&entry.bytes)?;
        entry.last_access = self.tick();
        Ok(Some(value))
    }

    pub(crate) fn put<C: Codec>(
        &self,
        key: K,
        value: V,
        codec: &C,
    ) -> Result<Vec<(K, V)>, StoreError> {
        let key_buf = codec.encode(&key)?;
        let value_buf = codec.encode(&value)?;
        let entry = OffHeapEntry {
            bytes: value_buf.into_boxed_slice(),
            key_bytes: key_buf.len() as u64,
            last_access: self.tick(),
            inserted_seq: self.seq.fetch_add(1, Ordering::Relaxed),
        };
        let size = entry.size_bytes();
        // Two atomic ops, never a read-modify-write: concurrent inserts
        // and removes of other keys touch the counter between any load
        // and store we could make here.
        self.used_bytes.fetch_add(size, Ordering::Release);
        if let Some(old) = self.entries.insert(key, entry) {
            self.used_bytes.fetch_sub(old.size_bytes(), Ordering::Release);
        }
        Ok(self.enforce_capacity(codec))
    }

    fn enforce_capacity<C: Codec>(&self, codec: &C) -> Vec<(K, V)> {
        let mut evicted = Vec::new();
        loop {
            let used = self.used_bytes.load(Ordering::Acquire);
            if used <= self.capacity_bytes {
                break;
            }
            let target = ReclaimTarget::Bytes(used - self.capacity_bytes);
            let candidates: Vec<EvictionCandidate<K>> = self
                .entries
                .iter()
                .map(|r| EvictionCandidate {
                    key: r.key().clone(),
                    last_access: r.value().last_access,
                    inserted_seq: r.value().inserted_seq,
                    size_bytes: r.value().size_bytes(),
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
                    self.used_bytes.fetch_sub(entry.size_bytes(), Ordering::Release);
                    removed_any = true;
                    match codec.decode(&entry.bytes) {
                        Ok(value) => evicted.push((k, value)),
                        Err(err) => {
                            error!(error = %err, "dropping evicted entry with undecodable value");
                        }
                    }
                }
            }
            if !removed_any {
                break;
            }
        }
        evicted
    }

    pub(crate) fn remove<C: Codec>(&self, key: &K, codec: &C) -> Result<Option<V>, StoreError> {
        // Decode first so a codec failure leaves the entry intact.
        let value: V = {
            let Some(entry) = self.entries.get(key) else {
                return Ok(None);
            };
            codec.decode(&entry.bytes)?
        };
        let Some((_, entry)) = self.entries.remove(key) else {
            // Lost a race with a concurrent remove.
            return Ok(None);
        };
        self.used_bytes.fetch_sub(entry.size_bytes(), Ordering::Release);
        Ok(Some(value))
    }

    pub(crate) fn discard(&self, key: &K) -> bool {
        if let Some((_, entry)) = self.entries.remove(key) {
            self.used_bytes.fetch_sub(entry.size_bytes(), Ordering::Release);
            true
        } else {
            false
        }
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

    pub(crate) fn check_admissible(
        &self,
        key_len: usize,
        value_len: usize,
    ) -> Result<(), StoreError> {
        let size = (key_len + value_len) as u64;
        if size > self.capacity_bytes {
            return Err(StoreError::EntryTooLarge {
                kind: TierKind::OffHeap,
                size,
                capacity: self.capacity_bytes,
            });
        }
        Ok(())
    }
}
