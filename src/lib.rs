//! A multi-tier caching store.
//!
//! Entries are spread across an ordered stack of storage tiers, fastest
//! to slowest:
//!
//! ```text
//!   +-----------------------------+
//!   |  heap      (deserialized)   |  fastest, smallest
//!   +-----------------------------+
//!   |  offheap   (encoded bytes)  |
//!   +-----------------------------+
//!   |  disk      (segment file)   |  slowest, largest, durable
//!   +-----------------------------+
//! ```
//!
//! A key lives in exactly one tier at a time. Writes land in the
//! fastest tier; reads that hit a slower tier promote the entry back to
//! the top. Entries evicted from a tier cascade to the next one down,
//! and only an entry falling off the slowest tier leaves the store.
//!
//! # Features
//!
//! - LRU eviction per tier, deterministic under insertion-order ties
//! - Entry- or byte-counted capacity per tier
//! - Durable disk tier with crash-safe append-only segments, tombstone
//!   removal, and compaction
//! - `create_if_absent` / `swap` persistence across restarts
//! - Striped per-key locking for concurrent access
//! - Pluggable serialization through the [`Codec`] trait
//!
//! # Example
//!
//! ```no_run
//! use tiered_store::{ResourcePool, TieredStore, TieredStoreConfig};
//!
//! # fn main() -> Result<(), tiered_store::StoreError> {
//! let config = TieredStoreConfig {
//!     cache_name: "sessions".into(),
//!     heap: Some(ResourcePool::entries(10_000)),
//!     offheap: Some(ResourcePool::bytes(64 * 1024 * 1024)),
//!     ..Default::default()
//! };
//! let store: TieredStore<String, String> = TieredStore::new(config)?;
//! store.put("user:1".into(), "alice".into())?;
//! assert_eq!(store.get(&"user:1".to_string())?, Some("alice".into()));
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod eviction;
pub mod metrics;
pub mod persistence;
pub mod store;
pub mod tier;

pub use codec::{Codec, JsonCodec};
pub use config::{CapacityUnit, PersistenceMode, ResourcePool, TierKind, TieredStoreConfig};
pub use error::StoreError;
pub use eviction::{EvictionCandidate, LruPolicy, ReclaimTarget};
pub use persistence::PersistenceCoordinator;
pub use store::TieredStore;
pub use tier::{StoreKey, StoreValue, TierStats};
