// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Slowest tier: an append-only segment file with an in-memory index.
//!
//! Every mutation appends a record; removals append a tombstone.
//! Superseded records accumulate as dead bytes until compaction rewrites
//! the segment with only live entries. A byte-counted pool bounds the
//! whole file, so fragmentation counts against capacity until reclaimed.
//!
//! Record layout after the segment header:
//!
//! ```text
//! | flags: u8 | key_len: u32 LE | value_len: u32 LE | key | value |
//! ```
//!
//! A failed append is rolled back by truncating to the last committed
//! length, so the segment never holds a partial record.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::codec::Codec;
use crate::config::{ResourcePool, TierKind};
use crate::error::StoreError;
use crate::eviction::{EvictionCandidate, LruPolicy, ReclaimTarget};
use crate::metrics;
use crate::persistence::{SegmentFile, SEGMENT_HEADER_LEN, SEGMENT_MAGIC, SEGMENT_VERSION};
use crate::tier::{Capacity, StoreKey, StoreValue};

const RECORD_HEADER_LEN: u64 = 9;
const FLAG_TOMBSTONE: u8 = 0x01;

#[derive(Clone, Copy)]
struct Slot {
    offset: u64,
    key_len: u32,
    value_len: u32,
    last_access: u64,
    inserted_seq: u64,
}

fn record_len(slot: &Slot) -> u64 {
    RECORD_HEADER_LEN + slot.key_len as u64 + slot.value_len as u64
}

struct DiskInner<K> {
    file: File,
    path: std::path::PathBuf,
    index: HashMap<K, Slot>,
    /// Length of the segment up to which every record is fully written.
    append_pos: u64,
    /// Bytes held by superseded records and tombstones.
    dead_bytes: u64,
}

pub(crate) struct DiskTier<K, V> {
    inner: Mutex<DiskInner<K>>,
    capacity: Capacity,
    clock: AtomicU64,
    seq: AtomicU64,
    policy: LruPolicy,
    _marker: PhantomData<fn() -> V>,
}

impl<K: StoreKey, V: StoreValue> DiskTier<K, V> {
    /// Open a tier over a segment, scanning it when prior contents were
    /// reused.
    ///
    /// Any structural damage found during the scan is fatal. The file is
    /// left in place for inspection.
    pub(crate) fn open<C: Codec>(
        segment: SegmentFile,
        pool: &ResourcePool,
        codec: &C,
    ) -> Result<Self, StoreError> {
        let SegmentFile {
            mut file,
            path,
            reused,
        } = segment;

        let mut index: HashMap<K, Slot> = HashMap::new();
        let mut dead_bytes = 0u64;
        let mut next_seq = 0u64;
        let file_len = file.metadata()?.len();

        if reused {
            let corrupt = |reason: String| StoreError::SegmentCorrupt {
                path: path.clone(),
                reason,
            };
            let mut pos = SEGMENT_HEADER_LEN;
            file.seek(SeekFrom::Start(pos))?;
            let mut header = [0u8; RECORD_HEADER_LEN as usize];
            while pos < file_len {
                if pos + RECORD_HEADER_LEN > file_len {
                    return Err(corrupt(format!("truncated record header at offset {pos}")));
                }
                file.read_exact(&mut header)?;
                let flags = header[0];
                if flags & !FLAG_TOMBSTONE != 0 {
                    return Err(corrupt(format!(
                        "unknown record flags {flags:#04x} at offset {pos}"
                    )));
                }
                let key_len = u32::from_le_bytes([header[1], header[2], header[3], header[4]]);
                let value_len = u32::from_le_bytes([header[5], header[6], header[7], header[8]]);
                let rec_len = RECORD_HEADER_LEN + key_len as u64 + value_len as u64;
                if pos + rec_len > file_len {
                    return Err(corrupt(format!(
                        "record at offset {pos} extends past end of segment"
                    )));
                }

                let mut key_buf = vec![0u8; key_len as usize];
                file.read_exact(&mut key_buf)?;
                let key: K = codec
                    .decode(&key_buf)
                    .map_err(|e| corrupt(format!("undecodable key at offset {pos}: {e}")))?;

                if flags & FLAG_TOMBSTONE != 0 {
                    if let Some(old) = index.remove(&key) {
                        dead_bytes += record_len(&old);
                    }
                    dead_bytes += rec_len;
                } else {
                    let slot = Slot {
                        offset: pos,
                        key_len,
                        value_len,
                        last_access: next_seq,
                        inserted_seq: next_seq,
                    };
                    if let Some(old) = index.insert(key, slot) {
                        dead_bytes += record_len(&old);
                    }
                }
                next_seq += 1;
                pos += rec_len;
                file.seek(SeekFrom::Start(pos))?;
            }
            if !index.is_empty() {
                info!(
                    entries = index.len(),
                    path = %path.display(),
                    "recovered entries from existing segment"
                );
            }
        }

        Ok(Self {
            inner: Mutex::new(DiskInner {
                file,
                path,
                index,
                append_pos: file_len,
                dead_bytes,
            }),
            capacity: Capacity::from_pool(pool),
            clock: AtomicU64::new(next_seq),
            seq: AtomicU64::new(next_seq),
            policy: LruPolicy,
            _marker: PhantomData,
        })
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn read_value<C: Codec>(
        file: &mut File,
        slot: Slot,
        codec: &C,
    ) -> Result<V, StoreError> {
        let mut buf = vec![0u8; slot.value_len as usize];
        file.seek(SeekFrom::Start(
            slot.offset + RECORD_HEADER_LEN + slot.key_len as u64,
        ))?;
        file.read_exact(&mut buf)?;
        codec.decode(&buf)
    }

    /// Append one record, truncating back on failure so no partial
    /// record survives.
    fn append_record(
        &self,
        inner: &mut DiskInner<K>,
        flags: u8,
        key_buf: &[u8],
        value_buf: &[u8],
    ) -> Result<Slot, StoreError> {
        let offset = inner.append_pos;
        let mut rec = Vec::with_capacity(RECORD_HEADER_LEN as usize + key_buf.len() + value_buf.len());
        rec.push(flags);
        rec.extend_from_slice(&(key_buf.len() as u32).to_le_bytes());
        rec.extend_from_slice(&(value_buf.len() as u32).to_le_bytes());
        rec.extend_from_slice(key_buf);
        rec.extend_from_slice(value_buf);

        let write = (|| {
            inner.file.seek(SeekFrom::Start(offset))?;
            inner.file.write_all(&rec)
        })();
        if let Err(e) = write {
            error!(error = %e, offset, "append failed, rolling segment back");
            let _ = inner.file.set_len(offset);
            return Err(e.into());
        }

        inner.append_pos = offset + rec.len() as u64;
        metrics::record_bytes_written("disk", rec.len() as u64);
        Ok(Slot {
            offset,
            key_len: key_buf.len() as u32,
            value_len: value_buf.len() as u32,
            last_access: self.tick(),
            inserted_seq: self.seq.fetch_add(1, Ordering::Relaxed),
        })
    }

    pub(crate) fn get<C: Codec>(&self, key: &K, codec: &C) -> Result<Option<V>, StoreError> {
        let mut inner = self.inner.lock();
        let Some(slot) = inner.index.get(key).copied() else {
            return Ok(None);
        };
        let value = Self::read_value(&mut inner.file, slot, codec)?;
        let tick = self.tick();
        if let Some(slot) = inner.index.get_mut(key) {
            slot.last_access = tick;
        }
        metrics::record_bytes_read("disk", slot.value_len as u64);
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
        self.check_admissible(key_buf.len(), value_buf.len())?;

        let mut inner = self.inner.lock();
        let slot = self.append_record(&mut inner, 0, &key_buf, &value_buf)?;
        if let Some(old) = inner.index.insert(key, slot) {
            inner.dead_bytes += record_len(&old);
        }
        let evicted = self.enforce_capacity(&mut inner, codec)?;
        self.maybe_compact(&mut inner)?;
        Ok(evicted)
    }

    fn enforce_capacity<C: Codec>(
        &self,
        inner: &mut DiskInner<K>,
        codec: &C,
    ) -> Result<Vec<(K, V)>, StoreError> {
        let mut evicted = Vec::new();
        loop {
            let target = match self.capacity {
                Capacity::Entries(cap) => {
                    let n = inner.index.len() as u64;
                    if n <= cap {
                        break;
                    }
                    ReclaimTarget::Entries(n - cap)
                }
                Capacity::Bytes(cap) => {
                    if inner.append_pos <= cap {
                        break;
                    }
                    // Reclaim dead space before sacrificing live entries.
                    if inner.dead_bytes > 0 {
                        self.compact(inner)?;
                        continue;
                    }
                    ReclaimTarget::Bytes(inner.append_pos - cap)
                }
            };
            let candidates: Vec<EvictionCandidate<K>> = inner
                .index
                .iter()
                .map(|(k, s)| EvictionCandidate {
                    key: k.clone(),
                    last_access: s.last_access,
                    inserted_seq: s.inserted_seq,
                    size_bytes: record_len(s),
                })
                .collect();
            if candidates.is_empty() {
                break;
            }
            let victims = self.policy.select_victims(candidates, target);
            if victims.is_empty() {
                break;
            }
            for victim in victims {
                let Some(slot) = inner.index.remove(&victim) else {
                    continue;
                };
                inner.dead_bytes += record_len(&slot);
                match Self::read_value(&mut inner.file, slot, codec) {
                    Ok(value) => evicted.push((victim, value)),
                    Err(err) => {
                        error!(error = %err, "dropping evicted disk entry that failed to read");
                    }
                }
            }
        }
        Ok(evicted)
    }

    /// Rewrite the segment with only live records.
    ///
    /// Writes to a sibling temp file, fsyncs, then renames over the
    /// segment path. The in-memory state is only updated after the
    /// rename succeeds, so a failure leaves the tier fully usable.
    fn compact(&self, inner: &mut DiskInner<K>) -> Result<(), StoreError> {
        let tmp_path = inner.path.with_extension("compact");
        let mut tmp = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        tmp.write_all(&SEGMENT_MAGIC)?;
        tmp.write_all(&SEGMENT_VERSION.to_le_bytes())?;

        let mut live: Vec<(K, Slot)> = inner
            .index
            .iter()
            .map(|(k, s)| (k.clone(), *s))
            .collect();
        live.sort_by_key(|(_, s)| s.offset);

        let mut write_pos = SEGMENT_HEADER_LEN;
        let mut relocated: Vec<(K, Slot)> = Vec::with_capacity(live.len());
        let mut buf = Vec::new();
        for (key, slot) in live {
            let len = record_len(&slot) as usize;
            buf.resize(len, 0);
            inner.file.seek(SeekFrom::Start(slot.offset))?;
            inner.file.read_exact(&mut buf)?;
            tmp.write_all(&buf)?;
            relocated.push((
                key,
                Slot {
                    offset: write_pos,
                    ..slot
                },
            ));
            write_pos += len as u64;
        }
        tmp.sync_all()?;
        fs::rename(&tmp_path, &inner.path)?;

        let reclaimed = inner.append_pos.saturating_sub(write_pos);
        inner.file = tmp;
        inner.index = relocated.into_iter().collect();
        inner.append_pos = write_pos;
        inner.dead_bytes = 0;
        metrics::record_compaction("disk", reclaimed);
        debug!(reclaimed, live_bytes = write_pos, "compacted disk segment");
        Ok(())
    }

    fn maybe_compact(&self, inner: &mut DiskInner<K>) -> Result<(), StoreError> {
        if inner.dead_bytes == 0 {
            return Ok(());
        }
        let over_budget = matches!(self.capacity, Capacity::Bytes(cap) if inner.append_pos > cap);
        // An entry-counted pool never trips the byte budget, so the
        // segment would grow without bound under overwrite and remove
        // churn. Reclaim once dead records dominate the file.
        let fragmented =
            inner.dead_bytes > inner.append_pos.saturating_sub(SEGMENT_HEADER_LEN) / 2;
        if over_budget || fragmented {
            self.compact(inner)?;
        }
        Ok(())
    }

    pub(crate) fn remove<C: Codec>(&self, key: &K, codec: &C) -> Result<Option<V>, StoreError> {
        let mut inner = self.inner.lock();
        let Some(slot) = inner.index.get(key).copied() else {
            return Ok(None);
        };
        // Materialize the value before touching the index or the file.
        let value = Self::read_value(&mut inner.file, slot, codec)?;
        let key_buf = codec.encode(key)?;
        self.append_record(&mut inner, FLAG_TOMBSTONE, &key_buf, &[])?;
        inner.index.remove(key);
        inner.dead_bytes += record_len(&slot) + RECORD_HEADER_LEN + key_buf.len() as u64;
        self.maybe_compact(&mut inner)?;
        Ok(Some(value))
    }

    pub(crate) fn discard<C: Codec>(&self, key: &K, codec: &C) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        let Some(slot) = inner.index.get(key).copied() else {
            return Ok(false);
        };
        let key_buf = codec.encode(key)?;
        self.append_record(&mut inner, FLAG_TOMBSTONE, &key_buf, &[])?;
        inner.index.remove(key);
        inner.dead_bytes += record_len(&slot) + RECORD_HEADER_LEN + key_buf.len() as u64;
        self.maybe_compact(&mut inner)?;
        Ok(true)
    }

    pub(crate) fn contains(&self, key: &K) -> bool {
        self.inner.lock().index.contains_key(key)
    }

    pub(crate) fn clear(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.file.set_len(SEGMENT_HEADER_LEN)?;
        inner.index.clear();
        inner.append_pos = SEGMENT_HEADER_LEN;
        inner.dead_bytes = 0;
        Ok(())
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().index.len()
    }

    pub(crate) fn used_bytes(&self) -> u64 {
        self.inner
            .lock()
            .append_pos
            .saturating_sub(SEGMENT_HEADER_LEN)
    }

    pub(crate) fn check_admissible(
        &self,
        key_len: usize,
        value_len: usize,
    ) -> Result<(), StoreError> {
        if let Capacity::Bytes(cap) = self.capacity {
            let size = RECORD_HEADER_LEN + key_len as u64 + value_len as u64;
            if SEGMENT_HEADER_LEN + size > cap {
                return Err(StoreError::EntryTooLarge {
                    kind: TierKind::Disk,
                    size,
                    capacity: cap,
                });
            }
        }
        Ok(())
    }

    /// Close the tier, either retaining a compacted segment or deleting
    /// it.
    pub(crate) fn close(&self, retain: bool) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if retain {
            if inner.dead_bytes > 0 {
                self.compact(&mut inner)?;
            }
            inner.file.sync_all()?;
            info!(
                path = %inner.path.display(),
                entries = inner.index.len(),
                "disk segment retained"
            );
        } else {
            match fs::remove_file(&inner.path) {
                Ok(()) => debug!(path = %inner.path.display(), "disk segment discarded"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
