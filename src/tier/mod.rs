// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The tier stack: heap, off-heap, and disk stores behind one dispatch
//! surface.
//!
//! Tiers are ordered fastest to slowest and the set is closed, so the
//! store dispatches over an enum rather than a trait object. Every tier
//! exposes the same operations; the store composes them into the
//! caching protocol (promotion, demotion, eviction cascade).

mod disk;
mod heap;
mod offheap;

pub(crate) use disk::DiskTier;
pub(crate) use heap::HeapTier;
pub(crate) use offheap::OffHeapTier;

use std::fmt;
use std::hash::Hash;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::Codec;
use crate::config::{CapacityUnit, ResourcePool, TierKind};
use crate::error::StoreError;

/// Bounds a cache key must satisfy.
///
/// Blanket-implemented; never implement this by hand.
pub trait StoreKey:
    Eq + Hash + Clone + Serialize + DeserializeOwned + fmt::Debug + Send + Sync + 'static
{
}

impl<T> StoreKey for T where
    T: Eq + Hash + Clone + Serialize + DeserializeOwned + fmt::Debug + Send + Sync + 'static
{
}

/// Bounds a cache value must satisfy.
///
/// Blanket-implemented; never implement this by hand.
pub trait StoreValue: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> StoreValue for T where T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// A tier's capacity limit in its native unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Capacity {
    Entries(u64),
    Bytes(u64),
}

impl Capacity {
    pub(crate) fn from_pool(pool: &ResourcePool) -> Self {
        match pool.unit {
            CapacityUnit::Entries => Capacity::Entries(pool.capacity),
            CapacityUnit::Bytes => Capacity::Bytes(pool.capacity),
        }
    }
}

/// Point-in-time occupancy of one tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierStats {
    pub kind: TierKind,
    pub entries: usize,
    pub used_bytes: u64,
}

/// One tier in the stack.
pub(crate) enum Tier<K, V> {
    Heap(HeapTier<K, V>),
    OffHeap(OffHeapTier<K, V>),
    Disk(DiskTier<K, V>),
}

impl<K: StoreKey, V: StoreValue> Tier<K, V> {
    pub(crate) fn kind(&self) -> TierKind {
        match self {
            Tier::Heap(_) => TierKind::Heap,
            Tier::OffHeap(_) => TierKind::OffHeap,
            Tier::Disk(_) => TierKind::Disk,
        }
    }

    pub(crate) fn label(&self) -> &'static str {
        match self {
            Tier::Heap(_) => "heap",
            Tier::OffHeap(_) => "offheap",
            Tier::Disk(_) => "disk",
        }
    }

    /// Look up a key, refreshing its recency on a hit.
    pub(crate) fn get<C: Codec>(&self, key: &K, codec: &C) -> Result<Option<V>, StoreError> {
        match self {
            Tier::Heap(t) => Ok(t.get(key)),
            Tier::OffHeap(t) => t.get(key, codec),
            Tier::Disk(t) => t.get(key, codec),
        }
    }

    /// Install a mapping, returning any entries evicted to make room.
    pub(crate) fn put<C: Codec>(
        &self,
        key: K,
        value: V,
        codec: &C,
    ) -> Result<Vec<(K, V)>, StoreError> {
        match self {
            Tier::Heap(t) => t.put(key, value, codec),
            Tier::OffHeap(t) => t.put(key, value, codec),
            Tier::Disk(t) => t.put(key, value, codec),
        }
    }

    /// Remove a mapping and return its value.
    ///
    /// The value is materialized before removal, so a decode failure
    /// leaves the entry in place.
    pub(crate) fn remove<C: Codec>(&self, key: &K, codec: &C) -> Result<Option<V>, StoreError> {
        match self {
            Tier::Heap(t) => Ok(t.remove(key)),
            Tier::OffHeap(t) => t.remove(key, codec),
            Tier::Disk(t) => t.remove(key, codec),
        }
    }

    /// Drop a mapping without materializing its value.
    pub(crate) fn discard<C: Codec>(&self, key: &K, codec: &C) -> Result<bool, StoreError> {
        match self {
            Tier::Heap(t) => Ok(t.discard(key)),
            Tier::OffHeap(t) => Ok(t.discard(key)),
            Tier::Disk(t) => t.discard(key, codec),
        }
    }

    pub(crate) fn contains(&self, key: &K) -> bool {
        match self {
            Tier::Heap(t) => t.contains(key),
            Tier::OffHeap(t) => t.contains(key),
            Tier::Disk(t) => t.contains(key),
        }
    }

    pub(crate) fn clear(&self) -> Result<(), StoreError> {
        match self {
            Tier::Heap(t) => {
                t.clear();
                Ok(())
            }
            Tier::OffHeap(t) => {
                t.clear();
                Ok(())
            }
            Tier::Disk(t) => t.clear(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            Tier::Heap(t) => t.len(),
            Tier::OffHeap(t) => t.len(),
            Tier::Disk(t) => t.len(),
        }
    }

    pub(crate) fn used_bytes(&self) -> u64 {
        match self {
            Tier::Heap(t) => t.used_bytes(),
            Tier::OffHeap(t) => t.used_bytes(),
            Tier::Disk(t) => t.used_bytes(),
        }
    }

    pub(crate) fn stats(&self) -> TierStats {
        TierStats {
            kind: self.kind(),
            entries: self.len(),
            used_bytes: self.used_bytes(),
        }
    }

    /// Whether installs into this tier pass through the codec.
    ///
    /// Only an entry-counted heap tier stores values unencoded.
    pub(crate) fn needs_encoding(&self) -> bool {
        match self {
            Tier::Heap(t) => t.needs_encoding(),
            Tier::OffHeap(_) | Tier::Disk(_) => true,
        }
    }

    /// Reject entries that could never fit this tier even when empty.
    pub(crate) fn check_admissible(
        &self,
        key_len: usize,
        value_len: usize,
    ) -> Result<(), StoreError> {
        match self {
            Tier::Heap(t) => t.check_admissible(key_len, value_len),
            Tier::OffHeap(t) => t.check_admissible(key_len, value_len),
            Tier::Disk(t) => t.check_admissible(key_len, value_len),
        }
    }
}
