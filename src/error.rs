// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::path::PathBuf;
use thiserror::Error;

use crate::config::TierKind;

/// Errors surfaced by the tiered store.
///
/// Construction-time errors (`CapacityMisconfiguration`, `Configuration`,
/// `SegmentCorrupt`) are fatal for the cache being built. Operation-time
/// errors leave the store's observable state unchanged: a failed encode
/// happens before any index mutation, and a failed disk write rolls the
/// segment back to its durably-committed length.
#[derive(Error, Debug)]
pub enum StoreError {
    /// A declared tier has a non-positive capacity.
    #[error("invalid capacity for {kind} tier: {capacity} (must be > 0)")]
    CapacityMisconfiguration { kind: TierKind, capacity: u64 },

    /// The tier/persistence configuration is inconsistent.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A value could not be encoded or decoded for a serializing tier.
    #[error("serialization failure: {0}")]
    Serialization(String),

    /// A single entry's encoded footprint exceeds a tier's entire capacity,
    /// so no amount of eviction could admit it.
    #[error("entry of {size} bytes can never fit the {kind} tier capacity of {capacity} bytes")]
    EntryTooLarge {
        kind: TierKind,
        size: u64,
        capacity: u64,
    },

    /// An existing on-disk segment is unreadable or version-incompatible.
    /// The segment is left untouched; user data is never auto-deleted.
    #[error("persistent segment corrupt at {}: {reason}", path.display())]
    SegmentCorrupt { path: PathBuf, reason: String },

    /// I/O error on the disk tier.
    #[error("disk tier I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The store has been closed; no further operations are accepted.
    #[error("store is closed")]
    Closed,
}
