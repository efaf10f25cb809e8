//! Full archive validation.
//!
//! [`ValidationOrchestrator`] reads one snapshot of the active ledger
//! entries, scans the codebase for references to them, validates the command
//! catalog, and aggregates both into a [`ValidationReport`]. The two sections
//! are independent: when one fails its error is recorded in the report and
//! the other still runs.

use crate::catalog::{CatalogSource, CommandCatalogEntry, ValidationResult};
use crate::config::Settings;
use crate::error::{ConfigError, StoreError, ValidationError};
use crate::scanner::{ReferenceFinding, ReferenceScanner, ScanOutcome, ScanWarning};
use crate::store::{ArchiveStore, ArchivedScriptEntry};
use crate::validator::{CatalogValidation, PipelineIssue, RegistryValidator};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SummaryCounts {
    pub archived_entries: usize,
    pub files_scanned: usize,
    /// Reference findings; each one is a use of an archived script.
    pub broken_imports: usize,
    /// Catalog entries whose result is not `Ok`.
    pub broken_commands: usize,
    /// Distinct pipelines with at least one broken command.
    pub broken_pipelines: usize,
    pub imports_by_batch: BTreeMap<String, usize>,
    pub commands_by_pipeline: BTreeMap<String, usize>,
    /// Broken commands whose implementation or shell entry was archived, by
    /// the batch that archived it.
    pub commands_by_batch: BTreeMap<String, usize>,
}

/// A validation section that could not run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SectionError {
    pub section: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub generated_at: DateTime<Utc>,
    pub findings: Vec<ReferenceFinding>,
    pub catalog_results: Vec<CommandCatalogEntry>,
    pub pipeline_issues: Vec<PipelineIssue>,
    pub summary: SummaryCounts,
    pub scan_warnings: Vec<ScanWarning>,
    pub warnings: Vec<String>,
    pub errors: Vec<SectionError>,
}

impl ValidationReport {
    /// No findings, no broken commands and every section ran.
    pub fn is_clean(&self) -> bool {
        self.summary.broken_imports == 0 && self.summary.broken_commands == 0 && self.errors.is_empty()
    }

    /// `archive-validation-<YYYY-MM-DD>.json`
    pub fn artifact_file_name(&self) -> String {
        format!("archive-validation-{}.json", self.generated_at.format("%Y-%m-%d"))
    }
}

/// Reference scan results together with the entries they were checked against.
#[derive(Debug, Serialize)]
pub struct ImportValidation {
    pub archived_entries: Vec<ArchivedScriptEntry>,
    #[serde(flatten)]
    pub outcome: ScanOutcome,
}

impl ImportValidation {
    pub fn findings_by_batch(&self) -> BTreeMap<String, usize> {
        let batches = batch_index(&self.archived_entries);
        let mut counts = BTreeMap::new();
        for finding in &self.outcome.findings {
            if let Some(batch) = batches.get(&finding.archived_path) {
                *counts.entry(batch.clone()).or_insert(0) += 1;
            }
        }
        counts
    }
}

pub struct ValidationOrchestrator<'a> {
    store: &'a dyn ArchiveStore,
    catalog: &'a dyn CatalogSource,
    scanner: ReferenceScanner,
    validator: RegistryValidator,
    search_roots: Vec<PathBuf>,
    exclude_dirs: BTreeSet<PathBuf>,
}

impl<'a> ValidationOrchestrator<'a> {
    /// Orchestrator with default settings rooted at `repo_root`.
    pub fn new(repo_root: impl Into<PathBuf>, store: &'a dyn ArchiveStore, catalog: &'a dyn CatalogSource) -> Self {
        let repo_root = repo_root.into();
        let settings = Settings::default();
        Self {
            store,
            catalog,
            scanner: ReferenceScanner::new(&repo_root),
            validator: RegistryValidator::new(&repo_root),
            search_roots: settings.search_roots,
            exclude_dirs: settings.exclude_dirs.into_iter().collect(),
        }
    }

    pub fn from_settings(
        repo_root: impl Into<PathBuf>,
        settings: &Settings,
        store: &'a dyn ArchiveStore,
        catalog: &'a dyn CatalogSource,
    ) -> Result<Self, ConfigError> {
        let repo_root = repo_root.into();
        let mut exclude_dirs: BTreeSet<PathBuf> = settings.exclude_dirs.iter().cloned().collect();
        exclude_dirs.insert(PathBuf::from(&settings.archive_dir_name));
        Ok(Self {
            store,
            catalog,
            scanner: ReferenceScanner::from_settings(&repo_root, settings)?,
            validator: RegistryValidator::new(&repo_root),
            search_roots: settings.search_roots.clone(),
            exclude_dirs,
        })
    }

    pub fn with_scanner(mut self, scanner: ReferenceScanner) -> Self {
        self.scanner = scanner;
        self
    }

    pub fn with_validator(mut self, validator: RegistryValidator) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_search_roots(mut self, roots: Vec<PathBuf>) -> Self {
        self.search_roots = roots;
        self
    }

    pub fn with_exclude_dirs(mut self, dirs: BTreeSet<PathBuf>) -> Self {
        self.exclude_dirs = dirs;
        self
    }

    /// Scans the codebase for references to active archived scripts.
    pub fn validate_imports(&self) -> Result<ImportValidation, StoreError> {
        let entries = self.store.list_active()?;
        Ok(self.scan_entries(entries))
    }

    /// Validates the command catalog against the tree and the active ledger.
    pub fn validate_cli_commands(&self) -> Result<CatalogValidation, ValidationError> {
        let entries = self.store.list_active()?;
        let catalog = self.catalog.load()?;
        Ok(self.validator.validate(&catalog, &archived_paths(&entries)))
    }

    /// Runs both sections over one ledger snapshot and aggregates them.
    ///
    /// Never fails as a whole. A section that cannot run is listed in
    /// `errors` and contributes nothing to the counts.
    pub fn run_full_validation(&self) -> ValidationReport {
        let mut errors = Vec::new();
        let mut ledger_read = true;
        let entries = match self.store.list_active() {
            Ok(entries) => entries,
            Err(err) => {
                warn!("cannot read archive ledger: {}", err);
                errors.push(SectionError {
                    section: "archive-store",
                    message: err.to_string(),
                });
                ledger_read = false;
                Vec::new()
            }
        };

        let imports = self.scan_entries(entries);
        let commands = match self.catalog.load() {
            Ok(catalog) => Some(
                self.validator
                    .validate(&catalog, &archived_paths(&imports.archived_entries)),
            ),
            Err(err) => {
                warn!("cannot load command catalog: {}", err);
                errors.push(SectionError {
                    section: "command-catalog",
                    message: err.to_string(),
                });
                None
            }
        };

        let summary = summarize(&imports, commands.as_ref());
        info!(
            "validation found {} broken imports and {} broken commands",
            summary.broken_imports, summary.broken_commands
        );

        let mut commands = commands.unwrap_or_default();
        if !ledger_read {
            let unattributed = commands
                .entries
                .iter()
                .filter(|e| e.validation_result == Some(ValidationResult::MissingImplementation))
                .count();
            if unattributed > 0 {
                commands.warnings.push(format!(
                    "archive ledger unavailable: {} missing implementations may be archived \
                     scripts rather than stale entries",
                    unattributed
                ));
            }
        }
        ValidationReport {
            generated_at: Utc::now(),
            findings: imports.outcome.findings,
            catalog_results: commands.entries,
            pipeline_issues: commands.pipeline_issues,
            summary,
            scan_warnings: imports.outcome.warnings,
            warnings: commands.warnings,
            errors,
        }
    }

    fn scan_entries(&self, entries: Vec<ArchivedScriptEntry>) -> ImportValidation {
        let outcome = self
            .scanner
            .scan(&archived_paths(&entries), &self.search_roots, &self.exclude_dirs);
        ImportValidation {
            archived_entries: entries,
            outcome,
        }
    }
}

fn archived_paths(entries: &[ArchivedScriptEntry]) -> BTreeSet<PathBuf> {
    entries.iter().map(|e| e.original_path.clone()).collect()
}

fn batch_index(entries: &[ArchivedScriptEntry]) -> BTreeMap<PathBuf, String> {
    entries
        .iter()
        .map(|e| (e.original_path.clone(), e.archive_batch_id.clone()))
        .collect()
}

fn summarize(imports: &ImportValidation, commands: Option<&CatalogValidation>) -> SummaryCounts {
    let mut summary = SummaryCounts {
        archived_entries: imports.archived_entries.len(),
        files_scanned: imports.outcome.files_scanned,
        broken_imports: imports.outcome.findings.len(),
        imports_by_batch: imports.findings_by_batch(),
        ..Default::default()
    };

    let Some(commands) = commands else {
        return summary;
    };
    let batches = batch_index(&imports.archived_entries);
    for entry in commands.broken() {
        summary.broken_commands += 1;
        *summary
            .commands_by_pipeline
            .entry(entry.pipeline_name.clone())
            .or_insert(0) += 1;

        let archived = match entry.validation_result {
            Some(ValidationResult::ImplementationArchived) => entry.implementation_path.as_ref(),
            Some(ValidationResult::MissingShellEntry) => Some(&entry.shell_entry_path),
            _ => None,
        };
        if let Some(batch) = archived.and_then(|p| batches.get(p)) {
            *summary.commands_by_batch.entry(batch.clone()).or_insert(0) += 1;
        }
    }
    summary.broken_pipelines = summary.commands_by_pipeline.len();
    summary
}

/// Plain-text summary of a report.
pub fn render_summary(report: &ValidationReport) -> String {
    let s = &report.summary;
    let mut out = String::new();
    out.push_str(&format!("archived entries: {}\n", s.archived_entries));
    out.push_str(&format!("files scanned: {}\n", s.files_scanned));
    out.push_str(&format!("broken imports: {}\n", s.broken_imports));
    for (batch, n) in &s.imports_by_batch {
        out.push_str(&format!("  batch {}: {}\n", batch, n));
    }
    out.push_str(&format!(
        "broken commands: {} across {} pipelines\n",
        s.broken_commands, s.broken_pipelines
    ));
    for (pipeline, n) in &s.commands_by_pipeline {
        out.push_str(&format!("  {}: {}\n", pipeline, n));
    }
    for (batch, n) in &s.commands_by_batch {
        out.push_str(&format!("  archived by batch {}: {}\n", batch, n));
    }
    for issue in &report.pipeline_issues {
        out.push_str(&format!(
            "pipeline {} ({}): {}\n",
            issue.pipeline_name,
            issue.shell_entry_path.display(),
            issue.problem
        ));
    }
    for error in &report.errors {
        out.push_str(&format!("error in {}: {}\n", error.section, error.message));
    }
    out
}
