//! Archive ledger.
//!
//! [`ArchiveStore`] is the narrow interface the engine uses to read archived
//! entries and record restorations. Two implementations are provided:
//!
//! - [`JsonlArchiveStore`]: an append-only JSON-lines file. Every archive and
//!   restore is one event line; reads fold the events into entries, so a
//!   restoration is a single isolated append and nothing is ever rewritten.
//! - [`InMemoryArchiveStore`]: for tests and embedding.

use crate::error::StoreError;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestorationStatus {
    Active,
    Restored,
}

/// One archived script. Paths are relative to the repository root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivedScriptEntry {
    pub original_path: PathBuf,
    pub archive_path: PathBuf,
    pub archive_batch_id: String,
    pub archived_at: DateTime<Utc>,
    pub reason: String,
    pub restoration_status: RestorationStatus,
    pub restored_at: Option<DateTime<Utc>>,
}

impl ArchivedScriptEntry {
    pub fn new(
        original_path: impl Into<PathBuf>,
        archive_path: impl Into<PathBuf>,
        archive_batch_id: impl Into<String>,
        archived_at: DateTime<Utc>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            original_path: original_path.into(),
            archive_path: archive_path.into(),
            archive_batch_id: archive_batch_id.into(),
            archived_at,
            reason: reason.into(),
            restoration_status: RestorationStatus::Active,
            restored_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.restoration_status == RestorationStatus::Active
    }

    /// Inclusive on both ends, compared on the UTC calendar date.
    pub fn archived_within(&self, start: NaiveDate, end: NaiveDate) -> bool {
        let day = self.archived_at.date_naive();
        start <= day && day <= end
    }
}

/// Read and status-transition access to the archive ledger.
///
/// Implementations must be safe to share across the restoration worker pool.
/// `mark_restored` is an isolated per-entry write; no multi-entry transaction
/// is assumed.
pub trait ArchiveStore: Send + Sync {
    /// Snapshot of all entries whose status is `Active`.
    fn list_active(&self) -> Result<Vec<ArchivedScriptEntry>, StoreError>;

    /// Active entries archived under `batch_id`.
    fn list_by_batch(&self, batch_id: &str) -> Result<Vec<ArchivedScriptEntry>, StoreError> {
        Ok(self
            .list_active()?
            .into_iter()
            .filter(|e| e.archive_batch_id == batch_id)
            .collect())
    }

    /// Active entries archived between `start` and `end`, inclusive.
    fn list_by_date_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<ArchivedScriptEntry>, StoreError> {
        Ok(self
            .list_active()?
            .into_iter()
            .filter(|e| e.archived_within(start, end))
            .collect())
    }

    /// Transitions the active entry for `original_path` to `Restored`.
    fn mark_restored(
        &self,
        original_path: &Path,
        restored_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Appends a new active entry. Fails if `original_path` already has one.
    fn record_archived(&self, entry: ArchivedScriptEntry) -> Result<(), StoreError>;
}

/// Applies a restore transition to the single active entry for `original_path`.
fn transition_restored(
    entries: &mut [ArchivedScriptEntry],
    original_path: &Path,
    restored_at: DateTime<Utc>,
) -> Result<(), StoreError> {
    let entry = entries
        .iter_mut()
        .find(|e| e.is_active() && e.original_path == original_path)
        .ok_or_else(|| StoreError::NotFound(original_path.to_path_buf()))?;
    entry.restoration_status = RestorationStatus::Restored;
    entry.restored_at = Some(restored_at);
    Ok(())
}

fn ensure_no_active(entries: &[ArchivedScriptEntry], original_path: &Path) -> Result<(), StoreError> {
    if entries
        .iter()
        .any(|e| e.is_active() && e.original_path == original_path)
    {
        return Err(StoreError::DuplicateActive(original_path.to_path_buf()));
    }
    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, StoreError> {
    mutex
        .lock()
        .map_err(|_| StoreError::Unavailable("ledger lock poisoned".to_string()))
}

/// In-memory store. Not durable.
#[derive(Debug, Default)]
pub struct InMemoryArchiveStore {
    entries: Mutex<Vec<ArchivedScriptEntry>>,
}

impl InMemoryArchiveStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(entries: Vec<ArchivedScriptEntry>) -> Self {
        Self {
            entries: Mutex::new(entries),
        }
    }

    /// Every entry, restored ones included, in insertion order.
    pub fn all(&self) -> Result<Vec<ArchivedScriptEntry>, StoreError> {
        Ok(lock(&self.entries)?.clone())
    }
}

impl ArchiveStore for InMemoryArchiveStore {
    fn list_active(&self) -> Result<Vec<ArchivedScriptEntry>, StoreError> {
        Ok(lock(&self.entries)?
            .iter()
            .filter(|e| e.is_active())
            .cloned()
            .collect())
    }

    fn mark_restored(
        &self,
        original_path: &Path,
        restored_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        transition_restored(&mut lock(&self.entries)?, original_path, restored_at)
    }

    fn record_archived(&self, entry: ArchivedScriptEntry) -> Result<(), StoreError> {
        let mut entries = lock(&self.entries)?;
        ensure_no_active(&entries, &entry.original_path)?;
        entries.push(entry);
        Ok(())
    }
}

/// A single ledger line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum LedgerEvent {
    Archived {
        original_path: PathBuf,
        archive_path: PathBuf,
        archive_batch_id: String,
        archived_at: DateTime<Utc>,
        reason: String,
    },
    Restored {
        original_path: PathBuf,
        archive_batch_id: String,
        restored_at: DateTime<Utc>,
    },
}

/// Append-only JSON-lines ledger.
#[derive(Debug)]
pub struct JsonlArchiveStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlArchiveStore {
    /// Opens the ledger at `path`. The file is created on first write.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Folds the event log into entries, restored ones included.
    pub fn all(&self) -> Result<Vec<ArchivedScriptEntry>, StoreError> {
        let mut entries: Vec<ArchivedScriptEntry> = Vec::new();
        for event in self.read_events()? {
            match event {
                LedgerEvent::Archived {
                    original_path,
                    archive_path,
                    archive_batch_id,
                    archived_at,
                    reason,
                } => entries.push(ArchivedScriptEntry::new(
                    original_path,
                    archive_path,
                    archive_batch_id,
                    archived_at,
                    reason,
                )),
                LedgerEvent::Restored {
                    original_path,
                    restored_at,
                    ..
                } => {
                    // A restore without a matching active entry means the file
                    // was edited by hand; keep reading rather than refuse the ledger.
                    if transition_restored(&mut entries, &original_path, restored_at).is_err() {
                        tracing::warn!(
                            "ledger {} restores {} with no active entry",
                            self.path.display(),
                            original_path.display()
                        );
                    }
                }
            }
        }
        Ok(entries)
    }

    fn read_events(&self) -> Result<Vec<LedgerEvent>, StoreError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&self.path).map_err(|source| StoreError::Io {
            path: self.path.clone(),
            source,
        })?;
        let mut events = Vec::new();
        for (idx, line) in raw.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let event = serde_json::from_str(trimmed).map_err(|source| StoreError::Parse {
                path: self.path.clone(),
                line: idx + 1,
                source,
            })?;
            events.push(event);
        }
        Ok(events)
    }

    fn append(&self, event: &LedgerEvent) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut line = serde_json::to_string(event).map_err(|source| StoreError::Parse {
            path: self.path.clone(),
            line: 0,
            source,
        })?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io_err)?;
        file.write_all(line.as_bytes()).map_err(io_err)?;
        file.sync_data().map_err(io_err)
    }
}

impl ArchiveStore for JsonlArchiveStore {
    fn list_active(&self) -> Result<Vec<ArchivedScriptEntry>, StoreError> {
        Ok(self.all()?.into_iter().filter(|e| e.is_active()).collect())
    }

    fn mark_restored(
        &self,
        original_path: &Path,
        restored_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let _guard = lock(&self.write_lock)?;
        let entry = self
            .list_active()?
            .into_iter()
            .find(|e| e.original_path == original_path)
            .ok_or_else(|| StoreError::NotFound(original_path.to_path_buf()))?;
        self.append(&LedgerEvent::Restored {
            original_path: entry.original_path,
            archive_batch_id: entry.archive_batch_id,
            restored_at,
        })
    }

    fn record_archived(&self, entry: ArchivedScriptEntry) -> Result<(), StoreError> {
        let _guard = lock(&self.write_lock)?;
        ensure_no_active(&self.list_active()?, &entry.original_path)?;
        self.append(&LedgerEvent::Archived {
            original_path: entry.original_path,
            archive_path: entry.archive_path,
            archive_batch_id: entry.archive_batch_id,
            archived_at: entry.archived_at,
            reason: entry.reason,
        })
    }
}
