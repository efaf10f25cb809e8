//! Command registry validation.
//!
//! Cross-checks catalog entries against the working tree:
//!
//! - A missing shell entry is a pipeline-level problem and is recorded once
//!   per pipeline in [`CatalogValidation::pipeline_issues`].
//! - A missing implementation is `ImplementationArchived` when the path is in
//!   the archived set (a restoration candidate) and `MissingImplementation`
//!   otherwise (a stale registration).
//! - Existing shell entries get a parse-only syntax check. Nothing is run.
//!
//! Each distinct shell entry is checked once, on the rayon pool. The result
//! depends only on the tree and the inputs, never on a previous run.

use crate::catalog::{CommandCatalogEntry, ValidationResult};
use crate::resolver::normalize;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, warn};

/// Result of a syntax-only check of one shell script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyntaxCheck {
    Valid,
    /// The script does not parse; carries the checker's diagnostic.
    Invalid(String),
    /// The checker could not run. The script is not flagged.
    Unavailable(String),
}

/// Parse-only shell syntax checking.
pub trait ShellSyntaxChecker: Send + Sync {
    fn check(&self, script: &Path) -> SyntaxCheck;
}

/// Runs `bash -n <script>`.
#[derive(Debug, Clone)]
pub struct BashSyntaxChecker {
    program: PathBuf,
}

impl Default for BashSyntaxChecker {
    fn default() -> Self {
        Self {
            program: PathBuf::from("bash"),
        }
    }
}

impl BashSyntaxChecker {
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl ShellSyntaxChecker for BashSyntaxChecker {
    fn check(&self, script: &Path) -> SyntaxCheck {
        let output = match Command::new(&self.program).arg("-n").arg(script).output() {
            Ok(output) => output,
            Err(err) => {
                return SyntaxCheck::Unavailable(format!(
                    "failed to run {}: {}",
                    self.program.display(),
                    err
                ));
            }
        };

        if output.status.success() {
            SyntaxCheck::Valid
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            SyntaxCheck::Invalid(stderr.trim().to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum PipelineProblem {
    MissingShellEntry {
        /// The shell entry itself is in the archived set.
        archived: bool,
    },
    ShellSyntaxError {
        message: String,
    },
}

impl std::fmt::Display for PipelineProblem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineProblem::MissingShellEntry { archived: true } => f.write_str("shell entry archived"),
            PipelineProblem::MissingShellEntry { archived: false } => f.write_str("shell entry missing"),
            PipelineProblem::ShellSyntaxError { message } => write!(f, "syntax error: {}", message),
        }
    }
}

/// A problem with a pipeline's shell entry, reported once per pipeline.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct PipelineIssue {
    pub pipeline_name: String,
    pub shell_entry_path: PathBuf,
    pub problem: PipelineProblem,
}

#[derive(Debug, Default, Serialize)]
pub struct CatalogValidation {
    /// The input entries, in input order, with `validation_result` set.
    pub entries: Vec<CommandCatalogEntry>,
    pub pipeline_issues: Vec<PipelineIssue>,
    pub warnings: Vec<String>,
}

impl CatalogValidation {
    pub fn broken(&self) -> impl Iterator<Item = &CommandCatalogEntry> {
        self.entries
            .iter()
            .filter(|e| e.validation_result.is_some_and(|r| !r.is_ok()))
    }

    /// Entries whose implementation can come back through restoration.
    pub fn restoration_candidates(&self) -> impl Iterator<Item = &CommandCatalogEntry> {
        self.entries
            .iter()
            .filter(|e| e.validation_result == Some(ValidationResult::ImplementationArchived))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ShellState {
    Missing,
    Present(SyntaxCheck),
}

pub struct RegistryValidator {
    repo_root: PathBuf,
    checker: Box<dyn ShellSyntaxChecker>,
}

impl RegistryValidator {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
            checker: Box::new(BashSyntaxChecker::default()),
        }
    }

    pub fn with_checker(mut self, checker: impl ShellSyntaxChecker + 'static) -> Self {
        self.checker = Box::new(checker);
        self
    }

    /// Classifies every entry against the working tree.
    ///
    /// Per entry, implementation problems take precedence over a missing
    /// shell entry, which takes precedence over a syntax error.
    pub fn validate(
        &self,
        catalog: &[CommandCatalogEntry],
        archived_paths: &BTreeSet<PathBuf>,
    ) -> CatalogValidation {
        let archived: BTreeSet<PathBuf> = archived_paths
            .iter()
            .filter_map(|p| normalize(p))
            .collect();

        let shells: BTreeSet<&Path> = catalog.iter().map(|e| e.shell_entry_path.as_path()).collect();
        let states: BTreeMap<&Path, ShellState> = shells
            .into_par_iter()
            .map(|shell| (shell, self.shell_state(shell)))
            .collect();

        let mut validation = CatalogValidation::default();
        let mut reported: BTreeSet<(&str, &Path)> = BTreeSet::new();
        let mut unavailable_noted = false;

        for entry in catalog {
            let shell = entry.shell_entry_path.as_path();
            let state = states.get(shell).unwrap_or(&ShellState::Missing);

            let pipeline_problem = match state {
                ShellState::Missing => Some(PipelineProblem::MissingShellEntry {
                    archived: is_archived(&archived, shell),
                }),
                ShellState::Present(SyntaxCheck::Invalid(message)) => {
                    Some(PipelineProblem::ShellSyntaxError {
                        message: message.clone(),
                    })
                }
                ShellState::Present(SyntaxCheck::Unavailable(message)) => {
                    if !unavailable_noted {
                        warn!("shell syntax check skipped: {}", message);
                        validation
                            .warnings
                            .push(format!("shell syntax check skipped: {}", message));
                        unavailable_noted = true;
                    }
                    None
                }
                ShellState::Present(SyntaxCheck::Valid) => None,
            };
            if let Some(problem) = &pipeline_problem
                && reported.insert((entry.pipeline_name.as_str(), shell))
            {
                validation.pipeline_issues.push(PipelineIssue {
                    pipeline_name: entry.pipeline_name.clone(),
                    shell_entry_path: shell.to_path_buf(),
                    problem: problem.clone(),
                });
            }

            let implementation_result = entry.implementation_path.as_deref().and_then(|p| {
                if self.repo_root.join(p).is_file() {
                    None
                } else if is_archived(&archived, p) {
                    Some(ValidationResult::ImplementationArchived)
                } else {
                    Some(ValidationResult::MissingImplementation)
                }
            });

            let result = implementation_result.unwrap_or(match pipeline_problem {
                Some(PipelineProblem::MissingShellEntry { .. }) => ValidationResult::MissingShellEntry,
                Some(PipelineProblem::ShellSyntaxError { .. }) => ValidationResult::ShellSyntaxError,
                None => ValidationResult::Ok,
            });
            debug!(
                "{}.{}: {}",
                entry.pipeline_name, entry.command_name, result
            );

            let mut entry = entry.clone();
            entry.validation_result = Some(result);
            validation.entries.push(entry);
        }

        validation.pipeline_issues.sort();
        validation
    }

    fn shell_state(&self, shell: &Path) -> ShellState {
        let absolute = self.repo_root.join(shell);
        if !absolute.is_file() {
            return ShellState::Missing;
        }
        ShellState::Present(self.checker.check(&absolute))
    }
}

fn is_archived(archived: &BTreeSet<PathBuf>, path: &Path) -> bool {
    normalize(path).is_some_and(|p| archived.contains(&p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    /// Flags any script containing the word `BROKEN`.
    struct MarkerChecker;

    impl ShellSyntaxChecker for MarkerChecker {
        fn check(&self, script: &Path) -> SyntaxCheck {
            match fs::read_to_string(script) {
                Ok(body) if body.contains("BROKEN") => SyntaxCheck::Invalid("unexpected token".into()),
                Ok(_) => SyntaxCheck::Valid,
                Err(e) => SyntaxCheck::Unavailable(e.to_string()),
            }
        }
    }

    struct NoChecker;

    impl ShellSyntaxChecker for NoChecker {
        fn check(&self, _: &Path) -> SyntaxCheck {
            SyntaxCheck::Unavailable("no shell".into())
        }
    }

    fn write(root: &Path, rel: &str, body: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
    }

    fn entry(pipeline: &str, command: &str, shell: &str, implementation: Option<&str>) -> CommandCatalogEntry {
        CommandCatalogEntry::new(pipeline, command, shell, implementation.map(PathBuf::from))
    }

    fn results(validation: &CatalogValidation) -> Vec<(String, ValidationResult)> {
        validation
            .entries
            .iter()
            .map(|e| (e.command_name.clone(), e.validation_result.unwrap()))
            .collect()
    }

    #[test]
    fn classifies_each_result_kind() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "p/cli.sh", "echo ok\n");
        write(root, "p/bad.sh", "if BROKEN\n");
        write(root, "p/ok.ts", "export {}\n");

        let catalog = vec![
            entry("p", "fine", "p/cli.sh", Some("p/ok.ts")),
            entry("p", "pure-shell", "p/cli.sh", None),
            entry("p", "archived", "p/cli.sh", Some("p/gone.ts")),
            entry("p", "stale", "p/cli.sh", Some("p/never.ts")),
            entry("q", "no-shell", "q/cli.sh", None),
            entry("r", "syntax", "p/bad.sh", None),
        ];
        let archived = BTreeSet::from([PathBuf::from("p/gone.ts")]);

        let validation = RegistryValidator::new(root)
            .with_checker(MarkerChecker)
            .validate(&catalog, &archived);

        assert_eq!(
            results(&validation),
            vec![
                ("fine".to_string(), ValidationResult::Ok),
                ("pure-shell".to_string(), ValidationResult::Ok),
                ("archived".to_string(), ValidationResult::ImplementationArchived),
                ("stale".to_string(), ValidationResult::MissingImplementation),
                ("no-shell".to_string(), ValidationResult::MissingShellEntry),
                ("syntax".to_string(), ValidationResult::ShellSyntaxError),
            ]
        );
        assert_eq!(validation.restoration_candidates().count(), 1);
        assert_eq!(validation.broken().count(), 4);
    }

    #[test]
    fn missing_shell_entry_recorded_once_per_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = vec![
            entry("media", "a", "media/cli.sh", None),
            entry("media", "b", "media/cli.sh", None),
            entry("media", "c", "media/cli.sh", None),
        ];
        let archived = BTreeSet::from([PathBuf::from("media/cli.sh")]);
        let validation = RegistryValidator::new(dir.path())
            .with_checker(MarkerChecker)
            .validate(&catalog, &archived);

        assert_eq!(
            validation.pipeline_issues,
            vec![PipelineIssue {
                pipeline_name: "media".into(),
                shell_entry_path: PathBuf::from("media/cli.sh"),
                problem: PipelineProblem::MissingShellEntry { archived: true },
            }]
        );
        assert!(
            validation
                .entries
                .iter()
                .all(|e| e.validation_result == Some(ValidationResult::MissingShellEntry))
        );
    }

    #[test]
    fn implementation_problem_outranks_missing_shell() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = vec![entry("p", "x", "p/cli.sh", Some("p/x.ts"))];
        let archived = BTreeSet::from([PathBuf::from("p/x.ts")]);
        let validation = RegistryValidator::new(dir.path())
            .with_checker(MarkerChecker)
            .validate(&catalog, &archived);
        assert_eq!(
            validation.entries[0].validation_result,
            Some(ValidationResult::ImplementationArchived)
        );
        assert_eq!(validation.pipeline_issues.len(), 1);
    }

    #[test]
    fn unavailable_checker_warns_once_and_flags_nothing() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.sh", "");
        write(dir.path(), "b.sh", "");
        let catalog = vec![entry("a", "x", "a.sh", None), entry("b", "y", "b.sh", None)];
        let validation = RegistryValidator::new(dir.path())
            .with_checker(NoChecker)
            .validate(&catalog, &BTreeSet::new());
        assert_eq!(validation.warnings.len(), 1);
        assert!(validation.pipeline_issues.is_empty());
        assert_eq!(validation.broken().count(), 0);
    }

    #[test]
    fn validation_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "p/cli.sh", "BROKEN");
        let catalog = vec![
            entry("p", "a", "p/cli.sh", Some("p/a.ts")),
            entry("p", "b", "p/cli.sh", None),
        ];
        let validator = RegistryValidator::new(dir.path()).with_checker(MarkerChecker);
        let first = validator.validate(&catalog, &BTreeSet::new());
        let second = validator.validate(&catalog, &BTreeSet::new());
        assert_eq!(first.entries, second.entries);
        assert_eq!(first.pipeline_issues, second.pipeline_issues);
    }

    #[test]
    fn bash_checker_detects_syntax_errors() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "good.sh", "#!/bin/bash\nif true; then echo ok; fi\n");
        write(dir.path(), "bad.sh", "#!/bin/bash\nif true; then echo ok\n");

        let checker = BashSyntaxChecker::default();
        if let SyntaxCheck::Unavailable(_) = checker.check(&dir.path().join("good.sh")) {
            // bash is not installed here.
            return;
        }
        assert_eq!(checker.check(&dir.path().join("good.sh")), SyntaxCheck::Valid);
        assert!(matches!(
            checker.check(&dir.path().join("bad.sh")),
            SyntaxCheck::Invalid(_)
        ));
    }

    #[test]
    fn missing_checker_program_is_unavailable() {
        let checker = BashSyntaxChecker::with_program("/nonexistent/bash-for-tests");
        assert!(matches!(
            checker.check(Path::new("x.sh")),
            SyntaxCheck::Unavailable(_)
        ));
    }
}
