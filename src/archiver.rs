//! Archiving scripts.
//!
//! Each script moves into an archive directory beside it and gets a dated
//! name: `scripts/media/clip.ts` archived on 2025-06-01 becomes
//! `scripts/media/.archived_scripts/clip.2025-06-01.ts`. Every move is
//! recorded in the ledger under one batch id so the batch can be restored as
//! a unit.

use crate::error::{RestoreError, StoreError};
use crate::resolver::normalize;
use crate::store::{ArchiveStore, ArchivedScriptEntry};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::ffi::OsStr;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Serialize)]
pub struct ArchiveOutcome {
    pub batch_id: String,
    pub dry_run: bool,
    /// Entries recorded, or that would be recorded on a dry run.
    pub entries: Vec<ArchivedScriptEntry>,
}

pub struct Archiver<'a> {
    repo_root: PathBuf,
    store: &'a dyn ArchiveStore,
    archive_dir_name: String,
}

impl<'a> Archiver<'a> {
    pub fn new(repo_root: impl Into<PathBuf>, store: &'a dyn ArchiveStore) -> Self {
        Self {
            repo_root: repo_root.into(),
            store,
            archive_dir_name: crate::config::DEFAULT_ARCHIVE_DIR.to_string(),
        }
    }

    pub fn with_archive_dir_name(mut self, name: impl Into<String>) -> Self {
        self.archive_dir_name = name.into();
        self
    }

    /// Archives `paths` (repo-relative) as one batch.
    ///
    /// Every path is checked before anything moves: it must be a file inside
    /// the repository with no active ledger entry. A ledger write failure
    /// moves that script back and stops the batch; scripts archived before it
    /// stay archived.
    pub fn archive(
        &self,
        paths: &[PathBuf],
        reason: &str,
        batch_id: Option<String>,
        dry_run: bool,
        now: DateTime<Utc>,
    ) -> Result<ArchiveOutcome, RestoreError> {
        let batch_id = batch_id.unwrap_or_else(|| default_batch_id(now));
        let active: BTreeSet<PathBuf> = self
            .store
            .list_active()?
            .into_iter()
            .map(|e| e.original_path)
            .collect();

        let mut planned = Vec::new();
        let mut taken = BTreeSet::new();
        for path in paths {
            let original = normalize(path)
                .filter(|p| !p.as_os_str().is_empty())
                .ok_or_else(|| RestoreError::NotAFile(path.clone()))?;
            if !self.repo_root.join(&original).is_file() {
                return Err(RestoreError::NotAFile(original));
            }
            if active.contains(&original) || planned.iter().any(|e: &ArchivedScriptEntry| e.original_path == original) {
                return Err(StoreError::DuplicateActive(original).into());
            }
            let archive_path = self.archive_path_for(&original, now, &taken);
            taken.insert(archive_path.clone());
            planned.push(ArchivedScriptEntry::new(
                original,
                archive_path,
                batch_id.clone(),
                now,
                reason,
            ));
        }

        if dry_run {
            return Ok(ArchiveOutcome {
                batch_id,
                dry_run,
                entries: planned,
            });
        }

        let mut recorded = Vec::new();
        for entry in planned {
            let from = self.repo_root.join(&entry.original_path);
            let to = self.repo_root.join(&entry.archive_path);
            move_file(&from, &to).map_err(|source| RestoreError::Io {
                path: entry.original_path.clone(),
                source,
            })?;

            if let Err(err) = self.store.record_archived(entry.clone()) {
                if let Err(undo) = move_file(&to, &from) {
                    warn!(
                        "could not move {} back after ledger failure: {}",
                        entry.archive_path.display(),
                        undo
                    );
                }
                return Err(err.into());
            }
            info!(
                "archived {} -> {}",
                entry.original_path.display(),
                entry.archive_path.display()
            );
            recorded.push(entry);
        }

        Ok(ArchiveOutcome {
            batch_id,
            dry_run,
            entries: recorded,
        })
    }

    /// First free `<dir>/<archive dir>/<stem>.<date>[-n].<ext>` for `original`.
    fn archive_path_for(&self, original: &Path, now: DateTime<Utc>, taken: &BTreeSet<PathBuf>) -> PathBuf {
        let dir = original
            .parent()
            .unwrap_or(Path::new(""))
            .join(&self.archive_dir_name);
        let stem = original
            .file_stem()
            .and_then(OsStr::to_str)
            .unwrap_or("script");
        let ext = original.extension().and_then(OsStr::to_str);
        let date = now.format("%Y-%m-%d");

        let mut n = 1;
        loop {
            let dated = if n == 1 {
                format!("{}.{}", stem, date)
            } else {
                format!("{}.{}-{}", stem, date, n)
            };
            let name = match ext {
                Some(ext) => format!("{}.{}", dated, ext),
                None => dated,
            };
            let candidate = dir.join(name);
            if !taken.contains(&candidate) && !self.repo_root.join(&candidate).exists() {
                return candidate;
            }
            n += 1;
        }
    }
}

/// Batch id used when the caller does not name one.
pub fn default_batch_id(now: DateTime<Utc>) -> String {
    format!("archive-{}", now.format("%Y%m%d-%H%M%S"))
}

/// Renames `from` to `to`, falling back to copy and remove across devices.
pub(crate) fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(err) if matches!(err.kind(), ErrorKind::CrossesDevices | ErrorKind::PermissionDenied) => {
            fs::copy(from, to)?;
            fs::remove_file(from)
        }
        Err(err) => Err(err),
    }
}
