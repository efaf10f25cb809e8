//! Codebase reference scanner.
//!
//! Recursively walks the search roots, skipping excluded directories, and
//! runs every registered detector over each line of each text file. Detected
//! specifiers are resolved against the archived path set; matches become
//! [`ReferenceFinding`]s. File reads run on a rayon pool and the findings are
//! sorted afterwards, so output order never depends on scheduling.
//!
//! The scan never aborts because of a single file. Unreadable or oversized
//! files are reported as [`ScanWarning`]s and skipped.

use crate::config::Settings;
use crate::detectors::{self, ReferenceKind, SourceFlavor};
use crate::error::ConfigError;
use crate::resolver::ArchivedIndex;
use glob::Pattern;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Bytes inspected when deciding whether a file is binary.
const BINARY_SNIFF_LEN: usize = 8000;
const MAX_SNIPPET_CHARS: usize = 200;

/// A use of an archived script found in another file.
///
/// Field order defines the report order: archived path, then referencing
/// file, then line.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ReferenceFinding {
    /// Archived script being referenced, repo-relative.
    pub archived_path: PathBuf,
    /// File containing the reference, repo-relative.
    pub referencing_file: PathBuf,
    /// Line number, 1-indexed.
    pub line_number: usize,
    pub reference_kind: ReferenceKind,
    /// The trimmed source line.
    pub raw_snippet: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanWarningKind {
    /// The file or directory could not be read.
    Unreadable,
    /// The file exceeds the configured size limit and was not scanned.
    Oversized,
}

/// A soft per-file failure. The scan continues past it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct ScanWarning {
    pub path: PathBuf,
    pub kind: ScanWarningKind,
    pub message: String,
}

#[derive(Debug, Default, Serialize)]
pub struct ScanOutcome {
    pub findings: Vec<ReferenceFinding>,
    pub warnings: Vec<ScanWarning>,
    pub files_scanned: usize,
}

/// Directory exclusion rules for one walk.
///
/// Single-component entries (`node_modules`) match a directory of that name
/// anywhere; multi-component entries (`apps/legacy`) match that repo-relative
/// directory only. Glob patterns match repo-relative files and directories.
#[derive(Debug, Default)]
struct Excludes {
    names: BTreeSet<PathBuf>,
    paths: BTreeSet<PathBuf>,
    globs: Vec<Pattern>,
}

impl Excludes {
    fn new(exclude_dirs: &BTreeSet<PathBuf>, globs: &[Pattern]) -> Self {
        let mut excludes = Excludes {
            globs: globs.to_vec(),
            ..Default::default()
        };
        for dir in exclude_dirs {
            let dir = crate::resolver::normalize(dir).unwrap_or_else(|| dir.clone());
            if dir.components().count() == 1 {
                excludes.names.insert(dir);
            } else {
                excludes.paths.insert(dir);
            }
        }
        excludes
    }

    fn matches(&self, relative: &Path, is_dir: bool) -> bool {
        if is_dir {
            let by_name = relative
                .file_name()
                .is_some_and(|name| self.names.contains(Path::new(name)));
            if by_name || self.paths.contains(relative) {
                return true;
            }
        }
        self.globs.iter().any(|p| p.matches_path(relative))
    }
}

/// Scanner bound to one repository root.
#[derive(Debug, Clone)]
pub struct ReferenceScanner {
    repo_root: PathBuf,
    exclude_globs: Vec<Pattern>,
    max_file_bytes: u64,
    threads: Option<usize>,
}

impl ReferenceScanner {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
            exclude_globs: Vec::new(),
            max_file_bytes: Settings::default().max_file_bytes,
            threads: None,
        }
    }

    pub fn from_settings(repo_root: impl Into<PathBuf>, settings: &Settings) -> Result<Self, ConfigError> {
        Ok(Self::new(repo_root)
            .with_exclude_globs(settings.compiled_excludes()?)
            .with_max_file_bytes(settings.max_file_bytes)
            .with_threads(settings.threads))
    }

    pub fn with_exclude_globs(mut self, globs: Vec<Pattern>) -> Self {
        self.exclude_globs = globs;
        self
    }

    pub fn with_max_file_bytes(mut self, limit: u64) -> Self {
        self.max_file_bytes = limit;
        self
    }

    pub fn with_threads(mut self, threads: Option<usize>) -> Self {
        self.threads = threads;
        self
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    /// Collects the files a scan would read, sorted and deduplicated across
    /// overlapping roots. Walk errors become warnings.
    pub fn collect_files(
        &self,
        search_roots: &[PathBuf],
        exclude_dirs: &BTreeSet<PathBuf>,
    ) -> (Vec<PathBuf>, Vec<ScanWarning>) {
        let excludes = Excludes::new(exclude_dirs, &self.exclude_globs);
        let mut files = BTreeSet::new();
        let mut warnings = Vec::new();

        for root in search_roots {
            let start = if root.is_absolute() {
                root.clone()
            } else {
                self.repo_root.join(root)
            };
            let walker = WalkDir::new(&start).follow_links(false).into_iter();
            for entry in walker.filter_entry(|e| {
                e.depth() == 0 || !excludes.matches(&self.relative(e.path()), e.file_type().is_dir())
            }) {
                match entry {
                    Ok(entry) if entry.file_type().is_file() => {
                        files.insert(self.relative(entry.path()));
                    }
                    Ok(_) => {}
                    Err(err) => {
                        let path = err.path().map(|p| self.relative(p)).unwrap_or_else(|| root.clone());
                        warn!("cannot walk {}: {}", path.display(), err);
                        warnings.push(ScanWarning {
                            path,
                            kind: ScanWarningKind::Unreadable,
                            message: err.to_string(),
                        });
                    }
                }
            }
        }

        (files.into_iter().collect(), warnings)
    }

    /// Scans `search_roots` for references to any of `archived_paths`.
    ///
    /// Archived paths are repo-relative. Findings are sorted by archived path,
    /// then referencing file, then line; warnings by path.
    pub fn scan(
        &self,
        archived_paths: &BTreeSet<PathBuf>,
        search_roots: &[PathBuf],
        exclude_dirs: &BTreeSet<PathBuf>,
    ) -> ScanOutcome {
        let index = ArchivedIndex::new(archived_paths);
        let (files, mut warnings) = self.collect_files(search_roots, exclude_dirs);
        info!(
            "scanning {} files for references to {} archived scripts",
            files.len(),
            index.len()
        );
        if index.is_empty() {
            return ScanOutcome {
                findings: Vec::new(),
                warnings,
                files_scanned: files.len(),
            };
        }

        let per_file = || -> Vec<Result<Vec<ReferenceFinding>, ScanWarning>> {
            files
                .par_iter()
                .map(|relative| self.scan_file(relative, &index))
                .collect()
        };
        let results = match self.threads {
            Some(n) => match rayon::ThreadPoolBuilder::new().num_threads(n).build() {
                Ok(pool) => pool.install(per_file),
                Err(err) => {
                    warn!("cannot build a {}-thread pool, using the global pool: {}", n, err);
                    per_file()
                }
            },
            None => per_file(),
        };

        let mut findings = Vec::new();
        for result in results {
            match result {
                Ok(found) => findings.extend(found),
                Err(warning) => warnings.push(warning),
            }
        }
        findings.sort();
        findings.dedup();
        warnings.sort();

        debug!(
            "scan produced {} findings and {} warnings",
            findings.len(),
            warnings.len()
        );
        ScanOutcome {
            findings,
            warnings,
            files_scanned: files.len(),
        }
    }

    fn scan_file(
        &self,
        relative: &Path,
        index: &ArchivedIndex,
    ) -> Result<Vec<ReferenceFinding>, ScanWarning> {
        let absolute = self.repo_root.join(relative);
        let unreadable = |err: std::io::Error| {
            warn!("cannot read {}: {}", relative.display(), err);
            ScanWarning {
                path: relative.to_path_buf(),
                kind: ScanWarningKind::Unreadable,
                message: err.to_string(),
            }
        };

        let size = std::fs::metadata(&absolute).map_err(unreadable)?.len();
        if size > self.max_file_bytes {
            warn!("skipping {} ({} bytes)", relative.display(), size);
            return Err(ScanWarning {
                path: relative.to_path_buf(),
                kind: ScanWarningKind::Oversized,
                message: format!("{} bytes exceeds the {} byte limit", size, self.max_file_bytes),
            });
        }

        let bytes = std::fs::read(&absolute).map_err(unreadable)?;
        if bytes[..bytes.len().min(BINARY_SNIFF_LEN)].contains(&0) {
            debug!("skipping binary file {}", relative.display());
            return Ok(Vec::new());
        }
        let source = String::from_utf8_lossy(&bytes);
        Ok(extract_references(&source, relative, index, &self.repo_root))
    }

    fn relative(&self, path: &Path) -> PathBuf {
        path.strip_prefix(&self.repo_root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

/// Extracts references to archived scripts from one file's contents.
///
/// `file` is the repo-relative path of the source, used to resolve relative
/// specifiers. A file never references itself.
pub fn extract_references(
    source: &str,
    file: &Path,
    index: &ArchivedIndex,
    repo_root: &Path,
) -> Vec<ReferenceFinding> {
    let flavor = SourceFlavor::of(file);
    let mut findings = Vec::new();

    for (idx, line) in source.lines().enumerate() {
        for (kind, spec) in detectors::detect(line, flavor) {
            for archived in index.resolve(&spec, kind, file, repo_root) {
                if archived == file {
                    continue;
                }
                findings.push(ReferenceFinding {
                    archived_path: archived,
                    referencing_file: file.to_path_buf(),
                    line_number: idx + 1,
                    reference_kind: kind,
                    raw_snippet: snippet(line),
                });
            }
        }
    }

    findings.sort();
    findings.dedup();
    findings
}

fn snippet(line: &str) -> String {
    let trimmed = line.trim();
    if trimmed.chars().count() > MAX_SNIPPET_CHARS {
        let mut s: String = trimmed.chars().take(MAX_SNIPPET_CHARS).collect();
        s.push_str("...");
        s
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn fixture_root() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/reference-kinds")
    }

    fn archived(items: &[&str]) -> BTreeSet<PathBuf> {
        items.iter().map(PathBuf::from).collect()
    }

    fn default_excludes() -> BTreeSet<PathBuf> {
        Settings::default().exclude_dirs.into_iter().collect()
    }

    #[test]
    fn fixture_yields_one_finding_per_kind() {
        let scanner = ReferenceScanner::new(fixture_root());
        let outcome = scanner.scan(
            &archived(&[
                "scripts/static-target.ts",
                "scripts/dynamic-target.ts",
                "scripts/required.js",
                "scripts/env.sh",
                "scripts/deploy.sh",
            ]),
            &[PathBuf::from(".")],
            &default_excludes(),
        );

        assert!(outcome.warnings.is_empty(), "{:?}", outcome.warnings);
        let got: Vec<_> = outcome
            .findings
            .iter()
            .map(|f| (f.archived_path.to_string_lossy().into_owned(), f.reference_kind))
            .collect();
        assert_eq!(
            got,
            vec![
                ("scripts/deploy.sh".to_string(), ReferenceKind::ShellDirectExec),
                ("scripts/dynamic-target.ts".to_string(), ReferenceKind::DynamicImport),
                ("scripts/env.sh".to_string(), ReferenceKind::ShellSource),
                ("scripts/required.js".to_string(), ReferenceKind::Require),
                ("scripts/static-target.ts".to_string(), ReferenceKind::StaticImport),
            ]
        );
        for finding in &outcome.findings {
            assert_eq!(finding.referencing_file, PathBuf::from("app/mixed.txt"));
        }
    }

    #[test]
    fn excluded_directories_are_not_scanned() {
        let scanner = ReferenceScanner::new(fixture_root());
        let (files, _) = scanner.collect_files(&[PathBuf::from(".")], &default_excludes());
        assert_eq!(files, vec![PathBuf::from("app/mixed.txt")]);

        let (files, _) = scanner.collect_files(&[PathBuf::from(".")], &BTreeSet::new());
        assert!(files.contains(&PathBuf::from("node_modules/pkg/index.js")));
    }

    #[test]
    fn findings_are_sorted_by_archived_path_then_file() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("b")).unwrap();
        fs::create_dir_all(root.join("a")).unwrap();
        fs::write(root.join("b/run.sh"), "./scripts/x.sh\n./scripts/w.sh\n").unwrap();
        fs::write(root.join("a/run.sh"), "bash scripts/x.sh\n").unwrap();

        let outcome = ReferenceScanner::new(root).scan(
            &archived(&["scripts/x.sh", "scripts/w.sh"]),
            &[PathBuf::from(".")],
            &BTreeSet::new(),
        );
        let order: Vec<_> = outcome
            .findings
            .iter()
            .map(|f| {
                format!(
                    "{}<-{}:{}",
                    f.archived_path.display(),
                    f.referencing_file.display(),
                    f.line_number
                )
            })
            .collect();
        assert_eq!(
            order,
            vec![
                "scripts/w.sh<-b/run.sh:2",
                "scripts/x.sh<-a/run.sh:1",
                "scripts/x.sh<-b/run.sh:1",
            ]
        );
    }

    #[test]
    fn overlapping_roots_scan_each_file_once() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("apps/web")).unwrap();
        fs::write(
            dir.path().join("apps/web/page.ts"),
            "import b from '../../scripts/b';\n",
        )
        .unwrap();

        let outcome = ReferenceScanner::new(dir.path()).scan(
            &archived(&["scripts/b.ts"]),
            &[PathBuf::from("."), PathBuf::from("apps")],
            &BTreeSet::new(),
        );
        assert_eq!(outcome.files_scanned, 1);
        assert_eq!(outcome.findings.len(), 1);
    }

    #[test]
    fn bare_relative_exec_is_found() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("ops")).unwrap();
        fs::write(dir.path().join("ops/deploy.sh"), "scripts/deploy.sh --prod\n").unwrap();

        let outcome = ReferenceScanner::new(dir.path()).scan(
            &archived(&["scripts/deploy.sh"]),
            &[PathBuf::from(".")],
            &BTreeSet::new(),
        );
        assert_eq!(outcome.findings.len(), 1);
        let finding = &outcome.findings[0];
        assert_eq!(finding.reference_kind, ReferenceKind::ShellDirectExec);
        assert_eq!(finding.referencing_file, PathBuf::from("ops/deploy.sh"));
        assert_eq!(finding.line_number, 1);
    }

    #[test]
    fn sibling_python_modules_are_found() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("packages/tools/nlp")).unwrap();
        fs::create_dir_all(dir.path().join("scripts/whisper")).unwrap();
        fs::write(
            dir.path().join("packages/tools/nlp/analyze.py"),
            "from utils import clean_text\n",
        )
        .unwrap();
        fs::write(dir.path().join("scripts/whisper/batch.py"), "import process_audio\n").unwrap();

        let outcome = ReferenceScanner::new(dir.path()).scan(
            &archived(&[
                "packages/tools/nlp/utils/__init__.py",
                "scripts/whisper/process_audio.py",
            ]),
            &[PathBuf::from(".")],
            &BTreeSet::new(),
        );
        let got: Vec<_> = outcome
            .findings
            .iter()
            .map(|f| (f.archived_path.clone(), f.referencing_file.clone()))
            .collect();
        assert_eq!(
            got,
            vec![
                (
                    PathBuf::from("packages/tools/nlp/utils/__init__.py"),
                    PathBuf::from("packages/tools/nlp/analyze.py")
                ),
                (
                    PathBuf::from("scripts/whisper/process_audio.py"),
                    PathBuf::from("scripts/whisper/batch.py")
                ),
            ]
        );
    }

    #[test]
    fn oversized_files_are_reported_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("big.js"), "require('./scripts/b');\n".repeat(10)).unwrap();
        fs::write(dir.path().join("small.js"), "require('./scripts/b');\n").unwrap();

        let outcome = ReferenceScanner::new(dir.path())
            .with_max_file_bytes(64)
            .scan(&archived(&["scripts/b.js"]), &[PathBuf::from(".")], &BTreeSet::new());

        assert_eq!(outcome.findings.len(), 1);
        assert_eq!(outcome.findings[0].referencing_file, PathBuf::from("small.js"));
        assert_eq!(outcome.warnings.len(), 1);
        assert_eq!(outcome.warnings[0].kind, ScanWarningKind::Oversized);
    }

    #[test]
    fn binary_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut bytes = b"./scripts/a.sh\n".to_vec();
        bytes.push(0);
        fs::write(dir.path().join("blob.bin"), bytes).unwrap();

        let outcome = ReferenceScanner::new(dir.path()).scan(
            &archived(&["scripts/a.sh"]),
            &[PathBuf::from(".")],
            &BTreeSet::new(),
        );
        assert!(outcome.findings.is_empty());
        assert!(outcome.warnings.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_file_becomes_warning() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let locked = dir.path().join("locked.sh");
        fs::write(&locked, "./scripts/a.sh\n").unwrap();
        fs::write(dir.path().join("open.sh"), "./scripts/a.sh\n").unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();
        if fs::read(&locked).is_ok() {
            // Running as root: permissions are not enforced.
            return;
        }

        let outcome = ReferenceScanner::new(dir.path()).with_threads(Some(2)).scan(
            &archived(&["scripts/a.sh"]),
            &[PathBuf::from(".")],
            &BTreeSet::new(),
        );
        assert_eq!(outcome.findings.len(), 1);
        assert_eq!(outcome.warnings.len(), 1);
        assert_eq!(outcome.warnings[0].kind, ScanWarningKind::Unreadable);
    }

    #[test]
    fn snippet_is_trimmed_and_truncated() {
        assert_eq!(snippet("   source x.sh  "), "source x.sh");
        let long = "x".repeat(300);
        assert_eq!(snippet(&long).chars().count(), MAX_SNIPPET_CHARS + 3);
    }
}
