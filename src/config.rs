// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the tiered store.
//!
//! # Example
//!
//! ```
//! use tiered_store::{TieredStoreConfig, ResourcePool, PersistenceMode};
//!
//! // Minimal config (heap-only, uses defaults)
//! let config = TieredStoreConfig::default();
//! assert!(config.heap.is_some());
//!
//! // Full three-tier config
//! let config = TieredStoreConfig {
//!     cache_name: "orders".into(),
//!     heap: Some(ResourcePool::entries(10)),
//!     offheap: Some(ResourcePool::bytes(10 * 1024 * 1024)),
//!     disk: Some(ResourcePool::bytes(100 * 1024 * 1024)),
//!     persistence: PersistenceMode::CreateIfAbsent,
//!     disk_dir: Some("/var/cache/orders".into()),
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```

use std::fmt;
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::StoreError;

/// The fixed, ordered set of tier kinds, fastest to slowest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierKind {
    /// Live values in normal process memory.
    Heap,
    /// Serialized byte buffers outside the live object graph.
    OffHeap,
    /// File-backed segment on durable media.
    Disk,
}

impl fmt::Display for TierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Heap => write!(f, "heap"),
            Self::OffHeap => write!(f, "offheap"),
            Self::Disk => write!(f, "disk"),
        }
    }
}

/// Unit a tier's capacity is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapacityUnit {
    /// Bounded by number of resident entries.
    Entries,
    /// Bounded by resident byte footprint.
    Bytes,
}

/// One tier's declared capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ResourcePool {
    pub unit: CapacityUnit,
    pub capacity: u64,
    /// Whether the tier's backing storage is itself durable media.
    #[serde(default)]
    pub durable: bool,
}

impl ResourcePool {
    /// An entry-count bounded pool.
    #[must_use]
    pub fn entries(capacity: u64) -> Self {
        Self {
            unit: CapacityUnit::Entries,
            capacity,
            durable: false,
        }
    }

    /// A byte-size bounded pool.
    #[must_use]
    pub fn bytes(capacity: u64) -> Self {
        Self {
            unit: CapacityUnit::Bytes,
            capacity,
            durable: false,
        }
    }

    /// Mark this pool as backed by durable media.
    #[must_use]
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    fn validate(&self, kind: TierKind) -> Result<(), StoreError> {
        if self.capacity == 0 {
            return Err(StoreError::CapacityMisconfiguration {
                kind,
                capacity: self.capacity,
            });
        }
        Ok(())
    }
}

/// How the disk tier's contents relate to process restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistenceMode {
    /// Reuse on-disk data found at startup if present, otherwise create
    /// fresh; data survives normal close.
    CreateIfAbsent,
    /// Disk is pure overflow capacity: wiped at creation and deleted at
    /// close, never survives restart.
    Swap,
    /// No disk tier exists.
    #[default]
    None,
}

impl fmt::Display for PersistenceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CreateIfAbsent => write!(f, "create_if_absent"),
            Self::Swap => write!(f, "swap"),
            Self::None => write!(f, "none"),
        }
    }
}

/// Configuration for a [`TieredStore`](crate::TieredStore).
///
/// Tiers are declared via optional pools, one per kind. The tier order is
/// fixed: heap (fastest) → offheap → disk (slowest). At least one pool
/// must be declared.
#[derive(Debug, Clone, Deserialize)]
pub struct TieredStoreConfig {
    /// Name identifying this cache; keys the disk segment file name.
    #[serde(default = "default_cache_name")]
    pub cache_name: String,

    /// Heap tier pool (entry-count or byte bounded).
    #[serde(default = "default_heap_pool")]
    pub heap: Option<ResourcePool>,

    /// Off-heap tier pool (always byte bounded).
    #[serde(default)]
    pub offheap: Option<ResourcePool>,

    /// Disk tier pool (entry-count or byte bounded).
    #[serde(default)]
    pub disk: Option<ResourcePool>,

    /// Persistence mode for the disk tier.
    #[serde(default)]
    pub persistence: PersistenceMode,

    /// Directory holding the disk tier's segment file.
    #[serde(default)]
    pub disk_dir: Option<PathBuf>,

    /// Number of key-lock stripes (rounded up to a power of two).
    #[serde(default = "default_lock_stripes")]
    pub lock_stripes: usize,
}

fn default_cache_name() -> String {
    "cache".to_string()
}
fn default_heap_pool() -> Option<ResourcePool> {
    Some(ResourcePool::entries(1024))
}
fn default_lock_stripes() -> usize {
    64
}

impl Default for TieredStoreConfig {
    fn default() -> Self {
        Self {
            cache_name: default_cache_name(),
            heap: default_heap_pool(),
            offheap: None,
            disk: None,
            persistence: PersistenceMode::None,
            disk_dir: None,
            lock_stripes: default_lock_stripes(),
        }
    }
}

impl TieredStoreConfig {
    /// Validate the configuration.
    ///
    /// Fatal misconfigurations (zero capacities, a disk pool with no
    /// persistence mode or directory, a non-byte off-heap pool) are
    /// rejected here, before any tier is built.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.heap.is_none() && self.offheap.is_none() && self.disk.is_none() {
            return Err(StoreError::Configuration(
                "at least one tier pool must be declared".into(),
            ));
        }

        if let Some(pool) = self.heap {
            pool.validate(TierKind::Heap)?;
        }
        if let Some(pool) = self.offheap {
            pool.validate(TierKind::OffHeap)?;
            if pool.unit != CapacityUnit::Bytes {
                return Err(StoreError::Configuration(
                    "offheap tier must be byte bounded".into(),
                ));
            }
        }
        if let Some(pool) = self.disk {
            pool.validate(TierKind::Disk)?;
            if self.persistence == PersistenceMode::None {
                return Err(StoreError::Configuration(
                    "disk tier requires a persistence mode (create_if_absent or swap)".into(),
                ));
            }
            if self.disk_dir.is_none() {
                return Err(StoreError::Configuration(
                    "disk tier requires disk_dir".into(),
                ));
            }
        } else if self.persistence != PersistenceMode::None {
            return Err(StoreError::Configuration(
                "persistence mode declared without a disk pool".into(),
            ));
        }

        if self.lock_stripes == 0 {
            return Err(StoreError::Configuration(
                "lock_stripes must be > 0".into(),
            ));
        }

        Ok(())
    }

    /// Declared pools in tier order, fastest to slowest.
    #[must_use]
    pub fn ordered_pools(&self) -> Vec<(TierKind, ResourcePool)> {
        let mut pools = Vec::with_capacity(3);
        if let Some(pool) = self.heap {
            pools.push((TierKind::Heap, pool));
        }
        if let Some(pool) = self.offheap {
            pools.push((TierKind::OffHeap, pool));
        }
        if let Some(pool) = self.disk {
            pools.push((TierKind::Disk, pool));
        }
        pools
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = TieredStoreConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ordered_pools().len(), 1);
        assert_eq!(config.ordered_pools()[0].0, TierKind::Heap);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let config = TieredStoreConfig {
            heap: Some(ResourcePool::entries(0)),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(StoreError::CapacityMisconfiguration {
                kind: TierKind::Heap,
                capacity: 0
            })
        ));
    }

    #[test]
    fn test_no_pools_rejected() {
        let config = TieredStoreConfig {
            heap: None,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(StoreError::Configuration(_))
        ));
    }

    #[test]
    fn test_offheap_must_be_byte_bounded() {
        let config = TieredStoreConfig {
            offheap: Some(ResourcePool::entries(100)),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(StoreError::Configuration(_))
        ));
    }

    #[test]
    fn test_disk_requires_persistence_and_dir() {
        let config = TieredStoreConfig {
            disk: Some(ResourcePool::entries(100)),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = TieredStoreConfig {
            disk: Some(ResourcePool::entries(100)),
            persistence: PersistenceMode::Swap,
            disk_dir: None,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = TieredStoreConfig {
            disk: Some(ResourcePool::entries(100)),
            persistence: PersistenceMode::Swap,
            disk_dir: Some("/tmp".into()),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_persistence_without_disk_rejected() {
        let config = TieredStoreConfig {
            persistence: PersistenceMode::Swap,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_pool_ordering_is_fixed() {
        let config = TieredStoreConfig {
            heap: Some(ResourcePool::entries(10)),
            offheap: Some(ResourcePool::bytes(1024)),
            disk: Some(ResourcePool::bytes(4096)),
            persistence: PersistenceMode::Swap,
            disk_dir: Some("/tmp".into()),
            ..Default::default()
        };
        let kinds: Vec<TierKind> = config.ordered_pools().iter().map(|(k, _)| *k).collect();
        assert_eq!(kinds, vec![TierKind::Heap, TierKind::OffHeap, TierKind::Disk]);
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: TieredStoreConfig = serde_json::from_str(
            r#"{
                "cache_name": "sessions",
                "offheap": {"unit": "bytes", "capacity": 1048576}
            }"#,
        )
        .unwrap();
        assert_eq!(config.cache_name, "sessions");
        assert!(config.heap.is_some());
        assert_eq!(config.offheap.unwrap().capacity, 1_048_576);
        assert_eq!(config.persistence, PersistenceMode::None);
        assert_eq!(config.lock_stripes, 64);
    }

    #[test]
    fn test_persistence_mode_display() {
        assert_eq!(
            PersistenceMode::CreateIfAbsent.to_string(),
            "create_if_absent"
        );
        assert_eq!(PersistenceMode::Swap.to_string(), "swap");
        assert_eq!(PersistenceMode::None.to_string(), "none");
    }
}
