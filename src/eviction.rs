// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Eviction victim selection.
//!
//! Each tier asks the policy for victims when it is over its declared
//! capacity. Selection is recency-based: the least recently accessed
//! entry goes first, with ties broken by insertion order so results are
//! deterministic. A single call can return several victims when a large
//! admission into a byte-bounded tier needs more than one slot's worth
//! of space reclaimed.
//!
//! Recency and insertion order come from per-tier logical counters, not
//! wall clocks, so two entries never compare equal unless they really
//! are the same entry.

/// Per-entry metadata a tier hands to the policy.
#[derive(Debug, Clone)]
pub struct EvictionCandidate<K> {
    pub key: K,
    /// Logical tick of the entry's last access in its tier.
    pub last_access: u64,
    /// Logical insertion sequence in its tier (tie-break).
    pub inserted_seq: u64,
    /// Tier-local footprint; zero for entry-count bounded tiers.
    pub size_bytes: u64,
}

/// How much capacity a selection call must reclaim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimTarget {
    /// Reclaim at least this many entry slots.
    Entries(u64),
    /// Reclaim at least this many bytes.
    Bytes(u64),
}

/// Least-recently-accessed eviction with deterministic tie-breaks.
#[derive(Debug, Clone, Copy, Default)]
pub struct LruPolicy;

impl LruPolicy {
    /// Select victims until the target is covered.
    ///
    /// Candidates are consumed coldest-first. Returns fewer victims than
    /// requested only when the candidate set itself cannot cover the
    /// target.
    pub fn select_victims<K>(
        &self,
        mut candidates: Vec<EvictionCandidate<K>>,
        target: ReclaimTarget,
    ) -> Vec<K> {
        candidates.sort_by(|a, b| {
            (a.last_access, a.inserted_seq).cmp(&(b.last_access, b.inserted_seq))
        });

        let mut victims = Vec::new();
        match target {
            ReclaimTarget::Entries(need) => {
                victims.extend(
                    candidates
                        .into_iter()
                        .take(need as usize)
                        .map(|c| c.key),
                );
            }
            ReclaimTarget::Bytes(need) => {
                let mut reclaimed = 0u64;
                for candidate in candidates {
                    if reclaimed >= need {
                        break;
                    }
                    reclaimed = reclaimed.saturating_add(candidate.size_bytes);
                    victims.push(candidate.key);
                }
            }
        }
        victims
    }
}
