//! Repository settings.
//!
//! Settings are read from `.script-archive.json` at the repository root when
//! present. Every field has a default so an empty or missing file yields a
//! usable configuration; command-line flags override individual fields.

use crate::error::ConfigError;
use glob::Pattern;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// File name looked up in the repository root.
pub const CONFIG_FILE_NAME: &str = ".script-archive.json";

/// Directory, next to the original script, that archived copies move into.
pub const DEFAULT_ARCHIVE_DIR: &str = ".archived_scripts";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Directories walked by the reference scanner, relative to the repo root.
    pub search_roots: Vec<PathBuf>,
    /// Directory names (single component, matched anywhere) or repo-relative
    /// directory paths skipped during the walk.
    pub exclude_dirs: Vec<PathBuf>,
    /// Glob patterns matched against repo-relative paths.
    pub exclude_globs: Vec<String>,
    pub archive_dir_name: String,
    /// Append-only ledger used by the JSONL archive store.
    pub ledger_path: PathBuf,
    /// JSON command catalog (pipeline → command → implementation).
    pub catalog_path: PathBuf,
    /// Path prefix → category tag. Longest prefix wins.
    pub categories: BTreeMap<String, String>,
    /// Files larger than this are skipped with a warning.
    pub max_file_bytes: u64,
    /// Worker count for scanning; `None` uses rayon's global pool.
    pub threads: Option<usize>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            search_roots: vec![PathBuf::from(".")],
            exclude_dirs: [
                "node_modules",
                ".git",
                "dist",
                "build",
                "target",
                ".next",
                ".turbo",
                "coverage",
                "__pycache__",
                ".venv",
                DEFAULT_ARCHIVE_DIR,
            ]
            .iter()
            .map(PathBuf::from)
            .collect(),
            exclude_globs: Vec::new(),
            archive_dir_name: DEFAULT_ARCHIVE_DIR.to_string(),
            ledger_path: Path::new(DEFAULT_ARCHIVE_DIR).join("ledger.jsonl"),
            catalog_path: PathBuf::from("command-catalog.json"),
            categories: BTreeMap::new(),
            max_file_bytes: 4 * 1024 * 1024,
            threads: None,
        }
    }
}

impl Settings {
    /// Loads settings from `repo_root/.script-archive.json`, falling back to
    /// defaults when the file does not exist.
    pub fn load(repo_root: &Path) -> Result<Self, ConfigError> {
        let path = repo_root.join(CONFIG_FILE_NAME);
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::from_file(&path)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let settings: Settings = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        settings.compiled_excludes()?;
        Ok(settings)
    }

    /// Compiles `exclude_globs`, reporting the first invalid pattern.
    pub fn compiled_excludes(&self) -> Result<Vec<Pattern>, ConfigError> {
        self.exclude_globs
            .iter()
            .map(|pattern| {
                Pattern::new(pattern).map_err(|source| ConfigError::Glob {
                    pattern: pattern.clone(),
                    source,
                })
            })
            .collect()
    }

    /// Resolves a settings path against the repository root.
    pub fn resolve(&self, repo_root: &Path, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            repo_root.join(path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(dir.path()).unwrap();
        assert_eq!(settings.search_roots, vec![PathBuf::from(".")]);
        assert!(settings.exclude_dirs.contains(&PathBuf::from("node_modules")));
        assert_eq!(
            settings.ledger_path,
            PathBuf::from(".archived_scripts/ledger.jsonl")
        );
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            r#"{ "search_roots": ["apps", "scripts"], "categories": { "scripts/whisper": "audio" } }"#,
        )
        .unwrap();
        let settings = Settings::load(dir.path()).unwrap();
        assert_eq!(
            settings.search_roots,
            vec![PathBuf::from("apps"), PathBuf::from("scripts")]
        );
        assert_eq!(settings.categories["scripts/whisper"], "audio");
        assert_eq!(settings.catalog_path, PathBuf::from("command-catalog.json"));
    }

    #[test]
    fn rejects_unknown_fields() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), r#"{ "serch_roots": [] }"#).unwrap();
        let err = Settings::load(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn rejects_invalid_glob() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            r#"{ "exclude_globs": ["**/[unclosed"] }"#,
        )
        .unwrap();
        let err = Settings::load(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Glob { .. }));
    }
}
