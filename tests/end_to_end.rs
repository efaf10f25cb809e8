//! End-to-end scenarios over real temporary repositories: archive a batch,
//! validate, and restore through the JSONL ledger.

use chrono::{DateTime, Utc};
use script_archive::archiver::Archiver;
use script_archive::catalog::JsonCatalog;
use script_archive::error::StoreError;
use script_archive::restore::{ApplyOptions, PlanAction, RestorationEngine, RestoreCriteria};
use script_archive::store::{ArchiveStore, ArchivedScriptEntry, JsonlArchiveStore, RestorationStatus};
use script_archive::validator::{RegistryValidator, ShellSyntaxChecker, SyntaxCheck};
use script_archive::{ReferenceKind, Settings, ValidationOrchestrator};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

struct AlwaysValid;

impl ShellSyntaxChecker for AlwaysValid {
    fn check(&self, _: &Path) -> SyntaxCheck {
        SyntaxCheck::Valid
    }
}

/// Delegates to a ledger but refuses to mark the listed paths restored.
struct FlakyStore {
    inner: JsonlArchiveStore,
    refuse: Vec<PathBuf>,
}

impl ArchiveStore for FlakyStore {
    fn list_active(&self) -> Result<Vec<ArchivedScriptEntry>, StoreError> {
        self.inner.list_active()
    }

    fn mark_restored(&self, original_path: &Path, restored_at: DateTime<Utc>) -> Result<(), StoreError> {
        if self.refuse.iter().any(|p| p == original_path) {
            return Err(StoreError::Unavailable("write refused".into()));
        }
        self.inner.mark_restored(original_path, restored_at)
    }

    fn record_archived(&self, entry: ArchivedScriptEntry) -> Result<(), StoreError> {
        self.inner.record_archived(entry)
    }
}

struct Repo {
    dir: tempfile::TempDir,
    settings: Settings,
}

impl Repo {
    /// A repository with `scripts/a.sh`, `scripts/b.ts`, a media pipeline
    /// and its catalog.
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repo {
            dir,
            settings: Settings::default(),
        };
        repo.write("scripts/a.sh", "#!/bin/bash\necho a\n");
        repo.write("scripts/b.ts", "export const b = 1;\n");
        repo.write("scripts/media/media-cli.sh", "#!/bin/bash\ncase \"$1\" in run) ;; esac\n");
        repo.write("scripts/media/run.ts", "console.log('run');\n");
        repo.write("apps/web/index.ts", "import { util } from './util';\n");
        repo.write("apps/web/util.ts", "export const util = 1;\n");
        repo.write(
            "command-catalog.json",
            r#"{
                "media": {
                    "shell": "scripts/media/media-cli.sh",
                    "commands": { "run": "scripts/media/run.ts", "status": null }
                }
            }"#,
        );
        repo
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn write(&self, rel: &str, body: &str) {
        let path = self.root().join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
    }

    fn store(&self) -> JsonlArchiveStore {
        JsonlArchiveStore::open(self.root().join(&self.settings.ledger_path))
    }

    fn catalog(&self) -> JsonCatalog {
        JsonCatalog::new(self.root().join(&self.settings.catalog_path))
    }

    fn archive_b1(&self) {
        let store = self.store();
        Archiver::new(self.root(), &store)
            .archive(
                &[PathBuf::from("scripts/a.sh"), PathBuf::from("scripts/b.ts")],
                "superseded",
                Some("b1".into()),
                false,
                Utc::now(),
            )
            .unwrap();
    }

    /// Every file under the root with its contents.
    fn snapshot(&self) -> BTreeMap<PathBuf, Vec<u8>> {
        WalkDir::new(self.root())
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .map(|e| {
                let rel = e.path().strip_prefix(self.root()).unwrap().to_path_buf();
                (rel, fs::read(e.path()).unwrap())
            })
            .collect()
    }
}

fn validate(repo: &Repo) -> script_archive::ValidationReport {
    let store = repo.store();
    let catalog = repo.catalog();
    ValidationOrchestrator::from_settings(repo.root(), &repo.settings, &store, &catalog)
        .unwrap()
        .with_validator(RegistryValidator::new(repo.root()).with_checker(AlwaysValid))
        .run_full_validation()
}

#[test]
fn unreferenced_batch_validates_clean() {
    let repo = Repo::new();
    repo.archive_b1();

    let report = validate(&repo);
    assert!(report.errors.is_empty(), "{:?}", report.errors);
    assert_eq!(report.summary.archived_entries, 2);
    assert!(report.findings.is_empty());
    assert_eq!(report.summary.broken_commands, 0);
    assert!(!report.summary.commands_by_batch.contains_key("b1"));
    assert!(report.is_clean());
}

#[test]
fn dynamic_import_of_archived_script_is_found() {
    let repo = Repo::new();
    repo.archive_b1();
    repo.write(
        "apps/web/loader.ts",
        "export async function load() {\n  return await import('../../scripts/b.ts');\n}\n",
    );

    let report = validate(&repo);
    assert_eq!(report.findings.len(), 1);
    let finding = &report.findings[0];
    assert_eq!(finding.archived_path, PathBuf::from("scripts/b.ts"));
    assert_eq!(finding.reference_kind, ReferenceKind::DynamicImport);
    assert_eq!(finding.referencing_file, PathBuf::from("apps/web/loader.ts"));
    assert_eq!(finding.line_number, 2);
    assert_eq!(report.summary.imports_by_batch.get("b1"), Some(&1));
}

#[test]
fn archived_implementation_is_attributed_to_its_batch() {
    let repo = Repo::new();
    let store = repo.store();
    Archiver::new(repo.root(), &store)
        .archive(&[PathBuf::from("scripts/media/run.ts")], "", Some("b2".into()), false, Utc::now())
        .unwrap();

    let report = validate(&repo);
    assert_eq!(report.summary.broken_commands, 1);
    assert_eq!(report.summary.commands_by_batch.get("b2"), Some(&1));
    assert_eq!(report.summary.commands_by_pipeline.get("media"), Some(&1));
}

#[test]
fn validation_is_idempotent() {
    let repo = Repo::new();
    repo.archive_b1();
    repo.write("ops/deploy.sh", "source scripts/a.sh\n./scripts/a.sh\n");

    let first = validate(&repo);
    let second = validate(&repo);
    assert_eq!(first.summary, second.summary);
    assert_eq!(first.findings, second.findings);
    assert_eq!(first.findings.len(), 2);
}

#[test]
fn dry_run_plan_skips_existing_and_changes_nothing() {
    let repo = Repo::new();
    repo.archive_b1();
    repo.write("scripts/a.sh", "#!/bin/bash\necho rewritten\n");

    let store = repo.store();
    let engine = RestorationEngine::new(repo.root(), &store);
    let before = repo.snapshot();

    let plan = engine.plan(RestoreCriteria::Batch("b1".into())).unwrap();
    let actions: Vec<_> = plan
        .items
        .iter()
        .map(|i| (i.target_path.clone(), i.action))
        .collect();
    assert_eq!(
        actions,
        vec![
            (PathBuf::from("scripts/a.sh"), PlanAction::SkipAlreadyExists),
            (PathBuf::from("scripts/b.ts"), PlanAction::Restore),
        ]
    );

    let result = engine.apply(&plan, &ApplyOptions::dry_run()).unwrap();
    assert_eq!(result.would_restore, vec![PathBuf::from("scripts/b.ts")]);
    assert_eq!(repo.snapshot(), before);

    // A real run after the dry run sees the same plan.
    let again = engine.plan(RestoreCriteria::Batch("b1".into())).unwrap();
    assert_eq!(again.items, plan.items);
    assert_eq!(again.confirmation_token(), plan.confirmation_token());

    let result = engine
        .apply(&again, &ApplyOptions::confirmed(plan.confirmation_token()))
        .unwrap();
    assert_eq!(result.restored, vec![PathBuf::from("scripts/b.ts")]);
    assert_eq!(result.skipped.len(), 1);
    assert_eq!(
        fs::read_to_string(repo.root().join("scripts/a.sh")).unwrap(),
        "#!/bin/bash\necho rewritten\n"
    );
}

#[test]
fn plan_partition_is_total() {
    let repo = Repo::new();
    repo.archive_b1();
    let store = repo.store();
    Archiver::new(repo.root(), &store)
        .archive(
            &[PathBuf::from("apps/web/util.ts"), PathBuf::from("scripts/media/run.ts")],
            "",
            Some("b1-extra".into()),
            false,
            Utc::now(),
        )
        .unwrap();
    repo.write("scripts/a.sh", "live\n");
    let active = store.list_active().unwrap();
    let missing = active
        .iter()
        .find(|e| e.original_path == Path::new("apps/web/util.ts"))
        .unwrap();
    fs::remove_file(repo.root().join(&missing.archive_path)).unwrap();

    let engine = RestorationEngine::new(repo.root(), &store);
    let today = Utc::now().date_naive();
    let plan = engine
        .plan(RestoreCriteria::DateRange { start: today, end: today })
        .unwrap();

    assert_eq!(plan.items.len(), active.len());
    let mut targets: Vec<_> = plan.items.iter().map(|i| i.target_path.clone()).collect();
    targets.dedup();
    assert_eq!(targets.len(), active.len());
    assert_eq!(
        plan.count(PlanAction::Restore)
            + plan.count(PlanAction::SkipAlreadyExists)
            + plan.count(PlanAction::SkipArchiveMissing),
        active.len()
    );
    assert_eq!(plan.count(PlanAction::SkipAlreadyExists), 1);
    assert_eq!(plan.count(PlanAction::SkipArchiveMissing), 1);
}

#[test]
fn restored_and_failed_paths_match_the_ledger() {
    let repo = Repo::new();
    repo.archive_b1();
    let store = FlakyStore {
        inner: repo.store(),
        refuse: vec![PathBuf::from("scripts/b.ts")],
    };

    let engine = RestorationEngine::new(repo.root(), &store);
    let plan = engine.plan(RestoreCriteria::Batch("b1".into())).unwrap();
    let result = engine.apply(&plan, &ApplyOptions::forced()).unwrap();

    assert_eq!(result.restored, vec![PathBuf::from("scripts/a.sh")]);
    assert_eq!(result.failed.len(), 1);
    assert_eq!(result.failed[0].path, PathBuf::from("scripts/b.ts"));

    let ledger: BTreeMap<PathBuf, RestorationStatus> = store
        .inner
        .all()
        .unwrap()
        .into_iter()
        .map(|e| (e.original_path, e.restoration_status))
        .collect();
    for path in &result.restored {
        assert_eq!(ledger[path], RestorationStatus::Restored);
        assert!(repo.root().join(path).exists());
    }
    for failed in &result.failed {
        assert_eq!(ledger[&failed.path], RestorationStatus::Active);
        assert!(!repo.root().join(&failed.path).exists());
    }
}

#[cfg(unix)]
#[test]
fn restored_shell_script_is_executable() {
    use std::os::unix::fs::PermissionsExt;

    let repo = Repo::new();
    repo.archive_b1();
    let store = repo.store();
    let engine = RestorationEngine::new(repo.root(), &store);
    let plan = engine
        .plan(RestoreCriteria::Path(PathBuf::from("scripts/a.sh")))
        .unwrap();
    let result = engine.apply(&plan, &ApplyOptions::forced()).unwrap();

    assert_eq!(result.restored, vec![PathBuf::from("scripts/a.sh")]);
    let mode = fs::metadata(repo.root().join("scripts/a.sh"))
        .unwrap()
        .permissions()
        .mode();
    assert_ne!(mode & 0o111, 0);
}

#[test]
fn restored_script_can_be_archived_again() {
    let repo = Repo::new();
    repo.archive_b1();
    let store = repo.store();
    let engine = RestorationEngine::new(repo.root(), &store);
    let plan = engine.plan(RestoreCriteria::Batch("b1".into())).unwrap();
    engine.apply(&plan, &ApplyOptions::forced()).unwrap();
    assert!(store.list_active().unwrap().is_empty());

    let outcome = Archiver::new(repo.root(), &store)
        .archive(&[PathBuf::from("scripts/b.ts")], "again", Some("b3".into()), false, Utc::now())
        .unwrap();
    assert_eq!(outcome.entries.len(), 1);
    assert_eq!(store.list_by_batch("b3").unwrap().len(), 1);
    // b1 entries stay in the ledger as restored history.
    assert_eq!(store.all().unwrap().len(), 3);
}
