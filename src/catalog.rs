//! Command catalog loading and traversal.
//!
//! The catalog is an externally maintained JSON document mapping each
//! pipeline to its shell entry point and the commands that shell dispatches
//! to:
//!
//! ```json
//! {
//!   "media": {
//!     "shell": "scripts/cli-pipeline/media/media-cli.sh",
//!     "commands": {
//!       "transcribe": "scripts/cli-pipeline/media/transcribe.ts",
//!       "health-check": null
//!     }
//!   }
//! }
//! ```
//!
//! A `null` implementation marks a pure-shell command. The document is
//! flattened into one [`CommandCatalogEntry`] per command, sorted by pipeline
//! then command, and is never written back.

use crate::error::CatalogError;
use crate::resolver::normalize;
use colored::Colorize;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Outcome of validating one catalog entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationResult {
    Ok,
    MissingShellEntry,
    MissingImplementation,
    ImplementationArchived,
    ShellSyntaxError,
}

impl ValidationResult {
    pub fn is_ok(self) -> bool {
        self == ValidationResult::Ok
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ValidationResult::Ok => "ok",
            ValidationResult::MissingShellEntry => "missing shell entry",
            ValidationResult::MissingImplementation => "missing implementation",
            ValidationResult::ImplementationArchived => "implementation archived",
            ValidationResult::ShellSyntaxError => "shell syntax error",
        }
    }
}

impl std::fmt::Display for ValidationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One registered command. Paths are relative to the repository root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandCatalogEntry {
    pub pipeline_name: String,
    pub command_name: String,
    pub shell_entry_path: PathBuf,
    /// `None` for commands implemented entirely in the shell entry.
    pub implementation_path: Option<PathBuf>,
    /// Populated by [`crate::validator::RegistryValidator`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_result: Option<ValidationResult>,
}

impl CommandCatalogEntry {
    pub fn new(
        pipeline_name: impl Into<String>,
        command_name: impl Into<String>,
        shell_entry_path: impl Into<PathBuf>,
        implementation_path: Option<PathBuf>,
    ) -> Self {
        Self {
            pipeline_name: pipeline_name.into(),
            command_name: command_name.into(),
            shell_entry_path: shell_entry_path.into(),
            implementation_path,
            validation_result: None,
        }
    }
}

/// Read-only supplier of catalog entries.
pub trait CatalogSource: Send + Sync {
    fn load(&self) -> Result<Vec<CommandCatalogEntry>, CatalogError>;
}

/// Entries already in memory, returned as given.
impl CatalogSource for Vec<CommandCatalogEntry> {
    fn load(&self) -> Result<Vec<CommandCatalogEntry>, CatalogError> {
        Ok(self.clone())
    }
}

/// A catalog JSON file on disk. It is re-read on every load.
#[derive(Debug, Clone)]
pub struct JsonCatalog {
    path: PathBuf,
}

impl JsonCatalog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CatalogSource for JsonCatalog {
    fn load(&self) -> Result<Vec<CommandCatalogEntry>, CatalogError> {
        let raw = std::fs::read_to_string(&self.path).map_err(|source| CatalogError::Io {
            path: self.path.clone(),
            source,
        })?;
        let value: serde_json::Value =
            serde_json::from_str(&raw).map_err(|source| CatalogError::Parse {
                path: self.path.clone(),
                source,
            })?;
        flatten_catalog(&value)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PipelineDecl {
    shell: PathBuf,
    #[serde(default)]
    commands: BTreeMap<String, Option<PathBuf>>,
}

/// Flattens a catalog document into entries sorted by pipeline, then command.
///
/// Paths are normalized; a path that is absolute or climbs out of the
/// repository is rejected.
pub fn flatten_catalog(value: &serde_json::Value) -> Result<Vec<CommandCatalogEntry>, CatalogError> {
    let pipelines: BTreeMap<String, PipelineDecl> = serde_json::from_value(value.clone())
        .map_err(|e| CatalogError::Invalid(e.to_string()))?;

    let mut entries = Vec::new();
    for (pipeline, decl) in pipelines {
        let shell = repo_path(&decl.shell, &pipeline)?;
        for (command, implementation) in decl.commands {
            let implementation = implementation
                .map(|p| repo_path(&p, &format!("{}.{}", pipeline, command)))
                .transpose()?;
            entries.push(CommandCatalogEntry::new(
                pipeline.clone(),
                command,
                shell.clone(),
                implementation,
            ));
        }
    }
    Ok(entries)
}

fn repo_path(path: &Path, owner: &str) -> Result<PathBuf, CatalogError> {
    match normalize(path) {
        Some(p) if !p.as_os_str().is_empty() => Ok(p),
        _ => Err(CatalogError::Invalid(format!(
            "{}: '{}' is not a path inside the repository",
            owner,
            path.display()
        ))),
    }
}

/// Prints the catalog as a pipeline → command tree.
///
/// Pure-shell commands are dimmed. Validation results, when present, are
/// appended to each command line.
pub fn print_tree(entries: &[CommandCatalogEntry]) {
    let mut current: Option<(&str, &Path)> = None;
    for entry in entries {
        let key = (entry.pipeline_name.as_str(), entry.shell_entry_path.as_path());
        if current != Some(key) {
            println!(
                "{} {}",
                entry.pipeline_name.bold(),
                entry.shell_entry_path.display().to_string().dimmed()
            );
            current = Some(key);
        }

        let status = match entry.validation_result {
            Some(ValidationResult::Ok) => format!(" [{}]", "ok".green()),
            Some(result) => format!(" [{}]", result.as_str().red()),
            None => String::new(),
        };
        match &entry.implementation_path {
            Some(p) => println!("  {} -> {}{}", entry.command_name, p.display(), status),
            None => println!("  {}{}", entry.command_name.dimmed(), status),
        }
    }
}

/// Number of distinct pipelines in a flattened catalog.
pub fn pipeline_count(entries: &[CommandCatalogEntry]) -> usize {
    let mut names: Vec<&str> = entries.iter().map(|e| e.pipeline_name.as_str()).collect();
    names.dedup();
    names.len()
}
