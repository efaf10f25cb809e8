//! Restoring archived scripts.
//!
//! Restoration is two-phase. [`RestorationEngine::plan`] selects active
//! entries and decides, per entry, whether it can come back; nothing is
//! touched. [`RestorationEngine::apply`] then carries out a plan.
//!
//! Per item, putting the file back and marking the ledger entry `Restored`
//! form one unit. The file is copied into place first; the ledger is only
//! updated once the copy is complete, and if the ledger write fails the copy
//! is removed again. A restored path therefore always has a `Restored` ledger
//! entry and a failed path keeps its `Active` one. The only exception is a
//! failed rollback, which is reported as
//! [`ItemFailure::StoreUpdate`] with `rolled_back: false`.
//!
//! Items are grouped by target path. Groups run in parallel; items within a
//! group run in order, so no two restorations race on one path.

use crate::error::{ItemFailure, RestoreError};
use crate::resolver::normalize;
use crate::store::{ArchiveStore, ArchivedScriptEntry};
use chrono::{NaiveDate, Utc};
use rayon::prelude::*;
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::collections::hash_map::DefaultHasher;
use std::ffi::OsStr;
use std::fs::{self, File, OpenOptions};
use std::hash::{Hash, Hasher};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Selects which active entries a restoration covers. Exactly one dimension
/// per request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "by", content = "value")]
pub enum RestoreCriteria {
    Batch(String),
    Category(String),
    DateRange { start: NaiveDate, end: NaiveDate },
    Path(PathBuf),
}

impl RestoreCriteria {
    /// Builds criteria from front-end flags, rejecting zero or several.
    pub fn from_flags(
        archive_id: Option<String>,
        category: Option<String>,
        date_range: Option<&str>,
        path: Option<PathBuf>,
    ) -> Result<Self, RestoreError> {
        let given: Vec<&'static str> = [
            archive_id.as_ref().map(|_| "archive id"),
            category.as_ref().map(|_| "category"),
            date_range.map(|_| "date range"),
            path.as_ref().map(|_| "path"),
        ]
        .into_iter()
        .flatten()
        .collect();
        if given.len() > 1 {
            return Err(RestoreError::AmbiguousCriteria(given));
        }

        if let Some(id) = archive_id {
            Ok(RestoreCriteria::Batch(id))
        } else if let Some(tag) = category {
            Ok(RestoreCriteria::Category(tag))
        } else if let Some(range) = date_range {
            let (start, end) = parse_date_range(range)?;
            Ok(RestoreCriteria::DateRange { start, end })
        } else if let Some(path) = path {
            Ok(RestoreCriteria::Path(path))
        } else {
            Err(RestoreError::MissingCriteria)
        }
    }

    pub fn describe(&self) -> String {
        match self {
            RestoreCriteria::Batch(id) => format!("archive id '{}'", id),
            RestoreCriteria::Category(tag) => format!("category '{}'", tag),
            RestoreCriteria::DateRange { start, end } => format!("dates {}..{}", start, end),
            RestoreCriteria::Path(path) => format!("path '{}'", path.display()),
        }
    }
}

/// Parses `YYYY-MM-DD..YYYY-MM-DD` (inclusive). A single date means that day.
pub fn parse_date_range(raw: &str) -> Result<(NaiveDate, NaiveDate), RestoreError> {
    let invalid = || RestoreError::InvalidDateRange(raw.to_string());
    let parse = |s: &str| NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_err(|_| invalid());

    let (start, end) = match raw.split_once("..") {
        Some((start, end)) => (parse(start)?, parse(end)?),
        None => {
            let day = parse(raw)?;
            (day, day)
        }
    };
    if start > end {
        return Err(invalid());
    }
    Ok((start, end))
}

/// Maps a path to its category tag.
///
/// Configured prefixes are matched by whole path components and the longest
/// one wins; paths under no prefix fall into their parent directory.
pub fn category_of(categories: &BTreeMap<String, String>, path: &Path) -> String {
    let mut prefixes: Vec<_> = categories.keys().collect();
    prefixes.sort_by_key(|k| std::cmp::Reverse(k.len()));

    for prefix in prefixes {
        if path.starts_with(prefix.trim_end_matches('/')) {
            return categories[prefix].clone();
        }
    }

    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_string_lossy().into_owned(),
        _ => ".".to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanAction {
    Restore,
    /// Something already lives at the original path. Live code is never
    /// overwritten.
    SkipAlreadyExists,
    /// The ledger says active but the archived file is gone.
    SkipArchiveMissing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestorationPlanItem {
    pub entry: ArchivedScriptEntry,
    pub action: PlanAction,
    /// Repo-relative destination, the entry's original path.
    pub target_path: PathBuf,
    /// Whether executable bits are set on the restored file.
    pub restore_permissions: bool,
}

/// A reviewable restoration. Every selected entry appears exactly once.
#[derive(Debug, Clone, Serialize)]
pub struct RestorationPlan {
    pub criteria: RestoreCriteria,
    pub items: Vec<RestorationPlanItem>,
    confirmation_token: String,
}

impl RestorationPlan {
    fn new(criteria: RestoreCriteria, items: Vec<RestorationPlanItem>) -> Self {
        let mut hasher = DefaultHasher::new();
        for item in &items {
            item.target_path.hash(&mut hasher);
            item.entry.archive_path.hash(&mut hasher);
            item.entry.archive_batch_id.hash(&mut hasher);
            item.action.hash(&mut hasher);
        }
        let confirmation_token = format!("{:016x}", hasher.finish());
        Self {
            criteria,
            items,
            confirmation_token,
        }
    }

    /// Token a caller passes back to [`RestorationEngine::apply`] to confirm
    /// this exact plan. Any change to the plan changes the token.
    pub fn confirmation_token(&self) -> &str {
        &self.confirmation_token
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn count(&self, action: PlanAction) -> usize {
        self.items.iter().filter(|i| i.action == action).count()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ApplyOptions {
    pub dry_run: bool,
    pub force_skip_confirmation: bool,
    /// Must equal the plan's token unless `force_skip_confirmation` is set.
    pub confirmation_token: Option<String>,
    /// Items not started by this instant fail with `DeadlineExceeded`.
    pub deadline: Option<Instant>,
}

impl ApplyOptions {
    pub fn dry_run() -> Self {
        Self {
            dry_run: true,
            ..Default::default()
        }
    }

    pub fn forced() -> Self {
        Self {
            force_skip_confirmation: true,
            ..Default::default()
        }
    }

    pub fn confirmed(token: impl Into<String>) -> Self {
        Self {
            confirmation_token: Some(token.into()),
            ..Default::default()
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// A file occupies the target path.
    FilesystemConflict,
    /// The archived copy is missing although the entry is active.
    LedgerInconsistency,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SkipReason::FilesystemConflict => "target already exists",
            SkipReason::LedgerInconsistency => "archived file missing",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct SkippedItem {
    pub path: PathBuf,
    pub reason: SkipReason,
}

#[derive(Debug, Serialize)]
pub struct FailedItem {
    pub path: PathBuf,
    #[serde(serialize_with = "serialize_display")]
    pub error: ItemFailure,
}

fn serialize_display<S: Serializer>(error: &ItemFailure, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(error)
}

#[derive(Debug, Default, Serialize)]
pub struct RestorationResult {
    pub dry_run: bool,
    pub restored: Vec<PathBuf>,
    /// Targets a real run would restore. Only filled on a dry run.
    pub would_restore: Vec<PathBuf>,
    pub skipped: Vec<SkippedItem>,
    pub failed: Vec<FailedItem>,
    pub warnings: Vec<String>,
}

impl RestorationResult {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

enum ItemOutcome {
    Restored { warning: Option<String> },
    Skipped(SkipReason),
    Failed(ItemFailure),
}

pub struct RestorationEngine<'a> {
    repo_root: PathBuf,
    store: &'a dyn ArchiveStore,
    categories: BTreeMap<String, String>,
    threads: Option<usize>,
}

impl<'a> RestorationEngine<'a> {
    pub fn new(repo_root: impl Into<PathBuf>, store: &'a dyn ArchiveStore) -> Self {
        Self {
            repo_root: repo_root.into(),
            store,
            categories: BTreeMap::new(),
            threads: None,
        }
    }

    pub fn with_categories(mut self, categories: BTreeMap<String, String>) -> Self {
        self.categories = categories;
        self
    }

    pub fn with_threads(mut self, threads: Option<usize>) -> Self {
        self.threads = threads;
        self
    }

    /// Maps a path given on the command line to the repo-relative form the
    /// ledger records. Absolute paths under the root are stripped of it.
    fn repo_relative(&self, path: &Path) -> PathBuf {
        let relative = if path.is_absolute() {
            path.strip_prefix(&self.repo_root)
                .map(Path::to_path_buf)
                .ok()
                .or_else(|| {
                    // The root may be canonical while the argument is not.
                    let root = self.repo_root.canonicalize().ok()?;
                    let parent = path.parent()?.canonicalize().ok()?;
                    Some(parent.strip_prefix(root).ok()?.join(path.file_name()?))
                })
        } else {
            Some(path.to_path_buf())
        };
        relative
            .as_deref()
            .and_then(normalize)
            .unwrap_or_else(|| path.to_path_buf())
    }

    /// Selects active entries and classifies each one. Reads only.
    ///
    /// Zero matches is an empty plan, not an error.
    pub fn plan(&self, criteria: RestoreCriteria) -> Result<RestorationPlan, RestoreError> {
        let mut selected = match &criteria {
            RestoreCriteria::Batch(id) => self.store.list_by_batch(id)?,
            RestoreCriteria::DateRange { start, end } => self.store.list_by_date_range(*start, *end)?,
            RestoreCriteria::Category(tag) => self
                .store
                .list_active()?
                .into_iter()
                .filter(|e| category_of(&self.categories, &e.original_path) == *tag)
                .collect(),
            RestoreCriteria::Path(path) => {
                let wanted = self.repo_relative(path);
                self.store
                    .list_active()?
                    .into_iter()
                    .filter(|e| e.original_path == wanted)
                    .collect()
            }
        };
        selected.sort_by(|a, b| {
            (&a.original_path, a.archived_at).cmp(&(&b.original_path, b.archived_at))
        });

        let items: Vec<_> = selected.into_iter().map(|entry| self.plan_item(entry)).collect();
        debug!("planned {} items for {}", items.len(), criteria.describe());
        Ok(RestorationPlan::new(criteria, items))
    }

    fn plan_item(&self, entry: ArchivedScriptEntry) -> RestorationPlanItem {
        let archive = self.repo_root.join(&entry.archive_path);
        let target = self.repo_root.join(&entry.original_path);

        let (action, restore_permissions) = if !archive.is_file() {
            (PlanAction::SkipArchiveMissing, false)
        } else if fs::symlink_metadata(&target).is_ok() {
            (PlanAction::SkipAlreadyExists, false)
        } else {
            (PlanAction::Restore, is_executable_script(&archive))
        };

        RestorationPlanItem {
            target_path: entry.original_path.clone(),
            entry,
            action,
            restore_permissions,
        }
    }

    /// Carries out `plan`.
    ///
    /// A dry run reports what would happen and mutates nothing. A real run
    /// that restores anything needs either `force_skip_confirmation` or the
    /// plan's confirmation token, and fails with `NoMatches` when the plan is
    /// empty. Per-item
    /// problems land in the result; committed items stay committed.
    pub fn apply(
        &self,
        plan: &RestorationPlan,
        options: &ApplyOptions,
    ) -> Result<RestorationResult, RestoreError> {
        let mut result = RestorationResult {
            dry_run: options.dry_run,
            ..Default::default()
        };

        let mut groups: BTreeMap<&Path, Vec<&RestorationPlanItem>> = BTreeMap::new();
        for item in &plan.items {
            match item.action {
                PlanAction::Restore => groups.entry(item.target_path.as_path()).or_default().push(item),
                PlanAction::SkipAlreadyExists => result.skipped.push(SkippedItem {
                    path: item.target_path.clone(),
                    reason: SkipReason::FilesystemConflict,
                }),
                PlanAction::SkipArchiveMissing => result.skipped.push(SkippedItem {
                    path: item.target_path.clone(),
                    reason: SkipReason::LedgerInconsistency,
                }),
            }
        }

        if options.dry_run {
            result.would_restore = groups
                .values()
                .flatten()
                .map(|item| item.target_path.clone())
                .collect();
            result.skipped.sort();
            return Ok(result);
        }

        if plan.is_empty() {
            return Err(RestoreError::NoMatches(plan.criteria.describe()));
        }
        // A plan of skips mutates nothing, so it needs no confirmation.
        if !options.force_skip_confirmation
            && !groups.is_empty()
            && options.confirmation_token.as_deref() != Some(plan.confirmation_token())
        {
            return Err(RestoreError::ConfirmationRequired);
        }

        let groups: Vec<Vec<&RestorationPlanItem>> = groups.into_values().collect();
        let run = || -> Vec<(PathBuf, ItemOutcome)> {
            groups
                .par_iter()
                .flat_map_iter(|group| {
                    group
                        .iter()
                        .map(|item| (item.target_path.clone(), self.run_item(item, options.deadline)))
                        .collect::<Vec<_>>()
                })
                .collect()
        };
        let outcomes = match self.threads {
            Some(n) => match rayon::ThreadPoolBuilder::new().num_threads(n).build() {
                Ok(pool) => pool.install(run),
                Err(err) => {
                    warn!("cannot build a {}-thread pool, using the global pool: {}", n, err);
                    run()
                }
            },
            None => run(),
        };

        for (path, outcome) in outcomes {
            match outcome {
                ItemOutcome::Restored { warning } => {
                    result.warnings.extend(warning);
                    result.restored.push(path);
                }
                ItemOutcome::Skipped(reason) => result.skipped.push(SkippedItem { path, reason }),
                ItemOutcome::Failed(error) => result.failed.push(FailedItem { path, error }),
            }
        }
        result.restored.sort();
        result.skipped.sort();
        result.failed.sort_by(|a, b| a.path.cmp(&b.path));
        result.warnings.sort();

        info!(
            "restored {}, skipped {}, failed {}",
            result.restored.len(),
            result.skipped.len(),
            result.failed.len()
        );
        Ok(result)
    }

    fn run_item(&self, item: &RestorationPlanItem, deadline: Option<Instant>) -> ItemOutcome {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return ItemOutcome::Failed(ItemFailure::DeadlineExceeded);
        }

        let archive = self.repo_root.join(&item.entry.archive_path);
        let target = self.repo_root.join(&item.target_path);

        // The tree may have changed since planning.
        if !archive.is_file() {
            return ItemOutcome::Skipped(SkipReason::LedgerInconsistency);
        }
        match place_copy(&archive, &target, item.restore_permissions) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                return ItemOutcome::Skipped(SkipReason::FilesystemConflict);
            }
            Err(err) => {
                warn!("failed to restore {}: {}", item.target_path.display(), err);
                return ItemOutcome::Failed(ItemFailure::Filesystem(err));
            }
        }

        if let Err(source) = self.store.mark_restored(&item.target_path, Utc::now()) {
            let rolled_back = fs::remove_file(&target).is_ok();
            warn!(
                "ledger update failed for {} (rolled back: {}): {}",
                item.target_path.display(),
                rolled_back,
                source
            );
            return ItemOutcome::Failed(ItemFailure::StoreUpdate { source, rolled_back });
        }

        info!(
            "restored {} from {}",
            item.target_path.display(),
            item.entry.archive_path.display()
        );
        let warning = fs::remove_file(&archive).err().map(|err| {
            format!(
                "restored {} but could not remove archived copy {}: {}",
                item.target_path.display(),
                item.entry.archive_path.display(),
                err
            )
        });
        ItemOutcome::Restored { warning }
    }
}

/// Copies `archive` to a new file at `target`. Fails with `AlreadyExists`
/// rather than overwrite; a partial copy is removed.
fn place_copy(archive: &Path, target: &Path, executable: bool) -> io::Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut source = File::open(archive)?;
    let mut dest = OpenOptions::new().write(true).create_new(true).open(target)?;

    let copied = io::copy(&mut source, &mut dest)
        .and_then(|_| dest.sync_all())
        .and_then(|_| copy_permissions(archive, target, executable));
    if let Err(err) = copied {
        drop(dest);
        let _ = fs::remove_file(target);
        return Err(err);
    }
    Ok(())
}

#[cfg(unix)]
fn copy_permissions(archive: &Path, target: &Path, executable: bool) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut mode = fs::metadata(archive)?.permissions().mode() & 0o7777;
    if executable {
        // Execute wherever read is granted, like `chmod +x`.
        mode |= (mode & 0o444) >> 2;
    }
    fs::set_permissions(target, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn copy_permissions(_archive: &Path, _target: &Path, _executable: bool) -> io::Result<()> {
    Ok(())
}

/// A script is executable if its archived copy has an execute bit, it has a
/// shell extension, or it starts with a shebang.
fn is_executable_script(archive: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if fs::metadata(archive).is_ok_and(|m| m.permissions().mode() & 0o111 != 0) {
            return true;
        }
    }

    let shell_ext = archive
        .extension()
        .and_then(OsStr::to_str)
        .is_some_and(|e| matches!(e, "sh" | "bash" | "zsh"));
    if shell_ext {
        return true;
    }

    let mut head = [0u8; 2];
    File::open(archive)
        .and_then(|mut f| f.read_exact(&mut head))
        .is_ok_and(|_| &head == b"#!")
}
