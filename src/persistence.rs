// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Disk segment lifecycle, governed by [`PersistenceMode`].
//!
//! Each cache with a disk tier owns one segment file inside the
//! configured directory, named after the cache. The coordinator decides
//! whether an existing segment is reused at startup and whether it is
//! retained or deleted at close:
//!
//! - `CreateIfAbsent`: a valid existing segment is reopened and its
//!   entries become visible immediately; an invalid one is a fatal
//!   [`StoreError::SegmentCorrupt`] and is never deleted. The segment
//!   survives a normal close.
//! - `Swap`: the segment is wiped at open and deleted at close. It never
//!   survives a restart.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::config::PersistenceMode;
use crate::error::StoreError;

/// Magic bytes opening every segment file.
pub(crate) const SEGMENT_MAGIC: [u8; 8] = *b"TIERSEG\0";
/// On-disk format version.
pub(crate) const SEGMENT_VERSION: u32 = 1;
/// Segment header length: magic + version.
pub(crate) const SEGMENT_HEADER_LEN: u64 = 12;

/// An opened, header-validated segment file.
pub(crate) struct SegmentFile {
    pub(crate) file: File,
    pub(crate) path: PathBuf,
    /// True when a prior segment's contents were reopened and the disk
    /// tier must scan it to rebuild its index.
    pub(crate) reused: bool,
}

/// Governs the disk segment across the cache lifecycle.
pub struct PersistenceCoordinator {
    mode: PersistenceMode,
    path: PathBuf,
}

impl PersistenceCoordinator {
    /// Create a coordinator for one cache's segment.
    ///
    /// The directory is created if missing. The segment path is keyed by
    /// the cache name so several caches can share a directory.
    pub fn new(mode: PersistenceMode, dir: &Path, cache_name: &str) -> Result<Self, StoreError> {
        if mode == PersistenceMode::None {
            return Err(StoreError::Configuration(
                "persistence coordinator requires create_if_absent or swap mode".into(),
            ));
        }
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{cache_name}.segment"));
        Ok(Self { mode, path })
    }

    #[must_use]
    pub fn mode(&self) -> PersistenceMode {
        self.mode
    }

    #[must_use]
    pub fn segment_path(&self) -> &Path {
        &self.path
    }

    /// Whether a normal close keeps the segment on disk.
    #[must_use]
    pub fn retain_on_close(&self) -> bool {
        self.mode == PersistenceMode::CreateIfAbsent
    }

    /// Open the segment per the persistence mode.
    pub(crate) fn open_segment(&self) -> Result<SegmentFile, StoreError> {
        match self.mode {
            PersistenceMode::Swap => {
                // Never reuse prior contents in swap mode.
                match fs::remove_file(&self.path) {
                    Ok(()) => {
                        debug!(path = %self.path.display(), "wiped stale swap segment");
                    }
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                self.create_fresh()
            }
            PersistenceMode::CreateIfAbsent => {
                if self.path.exists() {
                    self.reopen_existing()
                } else {
                    self.create_fresh()
                }
            }
            PersistenceMode::None => Err(StoreError::Configuration(
                "no disk segment under persistence mode none".into(),
            )),
        }
    }

    /// Delete the segment file, ignoring its absence.
    pub(crate) fn discard_segment(&self) -> Result<(), StoreError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "segment deleted");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn create_fresh(&self) -> Result<SegmentFile, StoreError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)?;
        file.write_all(&SEGMENT_MAGIC)?;
        file.write_all(&SEGMENT_VERSION.to_le_bytes())?;
        file.sync_all()?;
        info!(path = %self.path.display(), mode = %self.mode, "created fresh disk segment");
        Ok(SegmentFile {
            file,
            path: self.path.clone(),
            reused: false,
        })
    }

    fn reopen_existing(&self) -> Result<SegmentFile, StoreError> {
        let mut file = OpenOptions::new().read(true).write(true).open(&self.path)?;

        let len = file.metadata()?.len();
        if len < SEGMENT_HEADER_LEN {
            return Err(self.corrupt(format!(
                "segment too short for header: {len} bytes"
            )));
        }
        let mut magic = [0u8; 8];
        file.read_exact(&mut magic)?;
        if magic != SEGMENT_MAGIC {
            return Err(self.corrupt("bad magic bytes".into()));
        }
        let mut version = [0u8; 4];
        file.read_exact(&mut version)?;
        let version = u32::from_le_bytes(version);
        if version != SEGMENT_VERSION {
            return Err(self.corrupt(format!(
                "unsupported segment version {version} (expected {SEGMENT_VERSION})"
            )));
        }

        info!(
            path = %self.path.display(),
            bytes = len,
            "reusing existing disk segment"
        );
        Ok(SegmentFile {
            file,
            path: self.path.clone(),
            reused: true,
        })
    }

    fn corrupt(&self, reason: String) -> StoreError {
        warn!(path = %self.path.display(), reason = %reason, "refusing corrupt segment");
        StoreError::SegmentCorrupt {
            path: self.path.clone(),
            reason,
        }
    }
}
