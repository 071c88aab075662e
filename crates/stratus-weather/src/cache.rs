//! Durable snapshot cache shared between the app and satellite processes.
//!
//! Two records live side by side in one shared directory: the full
//! serialized [`CacheRecord`] and a small [`LastKnownLocation`] that stays
//! readable even when the snapshot fails to parse. Writes go through a
//! temp-file-plus-rename so a crash mid-write never corrupts the committed
//! record, and a concurrent reader in another process never observes a torn
//! file. Writer discipline is single-writer: only the main process holds a
//! [`SnapshotCache`]; satellites get a [`CacheReader`].

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::types::{CacheRecord, LastKnownLocation};

const SNAPSHOT_FILE: &str = "snapshot.json";
const LOCATION_FILE: &str = "location.json";

/// Read-write handle to the durable cache. One per main process.
#[derive(Debug, Clone)]
pub struct SnapshotCache {
    primary_dir: PathBuf,
    legacy_dir: Option<PathBuf>,
}

impl SnapshotCache {
    /// Create a cache rooted at `primary_dir` (the process-shared container).
    /// If `legacy_dir` is given, records found only there are migrated
    /// forward on first load.
    pub fn new(primary_dir: impl Into<PathBuf>, legacy_dir: Option<PathBuf>) -> Self {
        Self { primary_dir: primary_dir.into(), legacy_dir }
    }

    /// Load the most recent cache record, if any.
    ///
    /// Tries the primary location first, then the legacy location; a record
    /// found only in the legacy location is rewritten to the primary
    /// location before being returned. Missing or undecodable records are
    /// `None`, never an error: the cache degrades to a cold start.
    pub fn load(&self) -> Option<CacheRecord> {
        if let Some(record) = read_json::<CacheRecord>(&self.primary_dir.join(SNAPSHOT_FILE)) {
            return Some(record);
        }
        let legacy = self.legacy_dir.as_ref()?;
        let record = read_json::<CacheRecord>(&legacy.join(SNAPSHOT_FILE))?;
        tracing::info!(
            "Migrating cached snapshot from legacy store {}",
            legacy.display()
        );
        if let Err(error) = self.write_record_sync(&record) {
            tracing::warn!("Failed to migrate cached snapshot forward: {:#}", error);
        }
        Some(record)
    }

    /// Read only the small coordinate record. Constant-time with respect to
    /// snapshot size; consulted on process start before any heavier I/O.
    pub fn last_known_location(&self) -> Option<LastKnownLocation> {
        if let Some(location) = read_json::<LastKnownLocation>(&self.primary_dir.join(LOCATION_FILE))
        {
            return Some(location);
        }
        let legacy = self.legacy_dir.as_ref()?;
        read_json::<LastKnownLocation>(&legacy.join(LOCATION_FILE))
    }

    /// Persist `record`, replacing whatever was committed before.
    ///
    /// Serialization happens on the caller's task; the file writes run on
    /// the blocking pool so a foreground path awaiting this never blocks on
    /// disk.
    ///
    /// # Errors
    /// Fails on serialization or I/O problems; the previously committed
    /// record is left intact in that case.
    pub async fn save(&self, record: &CacheRecord) -> Result<()> {
        let snapshot_bytes = serde_json::to_vec_pretty(record).context("serialize snapshot")?;
        let location_bytes = serde_json::to_vec_pretty(&location_record(record))
            .context("serialize last known location")?;
        let dir = self.primary_dir.clone();
        tokio::task::spawn_blocking(move || write_files(&dir, &snapshot_bytes, &location_bytes))
            .await
            .context("cache writer task panicked")??;
        Ok(())
    }

    fn write_record_sync(&self, record: &CacheRecord) -> Result<()> {
        let snapshot_bytes = serde_json::to_vec_pretty(record).context("serialize snapshot")?;
        let location_bytes = serde_json::to_vec_pretty(&location_record(record))
            .context("serialize last known location")?;
        write_files(&self.primary_dir, &snapshot_bytes, &location_bytes)
    }
}

/// Read-only view for satellite processes (widgets) that never fetch and
/// never write. Constructed without a legacy location so a load can never
/// trigger a migration write from the wrong process.
#[derive(Debug, Clone)]
pub struct CacheReader {
    inner: SnapshotCache,
}

impl CacheReader {
    /// Open the shared cache directory read-only.
    pub fn open(shared_dir: impl Into<PathBuf>) -> Self {
        Self { inner: SnapshotCache::new(shared_dir, None) }
    }

    /// Load the most recent committed record, if any.
    pub fn load(&self) -> Option<CacheRecord> {
        self.inner.load()
    }

    /// Read only the small coordinate record.
    pub fn last_known_location(&self) -> Option<LastKnownLocation> {
        self.inner.last_known_location()
    }
}

fn location_record(record: &CacheRecord) -> LastKnownLocation {
    LastKnownLocation {
        coordinate: record.snapshot.coordinate,
        label: record.location_label.clone(),
        updated_at: record.snapshot.fetched_at,
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return None,
        Err(error) => {
            tracing::warn!("Failed to read {}: {}", path.display(), error);
            return None;
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(value) => Some(value),
        Err(error) => {
            tracing::warn!("Discarding undecodable cache file {}: {}", path.display(), error);
            None
        }
    }
}

fn write_files(dir: &Path, snapshot: &[u8], location: &[u8]) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("create cache dir {}", dir.display()))?;
    // Location first: if the snapshot write is interrupted, the coordinate
    // record still points at the right place on the next start.
    atomic_write(&dir.join(LOCATION_FILE), location)?;
    atomic_write(&dir.join(SNAPSHOT_FILE), snapshot)?;
    Ok(())
}

/// Write to a temp file in the same directory, then rename over the target.
/// Rename within one filesystem is atomic, so a reader sees either the old
/// or the new record, never a mix.
fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes).with_context(|| format!("write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("rename {} into place", tmp.display()))?;
    Ok(())
}
