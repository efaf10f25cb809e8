//! script-archive: archive obsolete scripts, validate that nothing still uses
//! them, and restore them when something does.
//!
//! This binary is a thin adapter over the `script_archive` library. It loads
//! settings, opens the ledger and catalog, calls one library entry point per
//! subcommand and prints the result.

mod cli;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use cli::{ApplyArgs, Args, Commands};
use colored::Colorize;
use dialoguer::Confirm;
use script_archive::archiver::Archiver;
use script_archive::catalog::{self, CatalogSource, JsonCatalog};
use script_archive::logging;
use script_archive::orchestrator::{self, ImportValidation, ValidationOrchestrator};
use script_archive::restore::{
    ApplyOptions, PlanAction, RestorationEngine, RestorationPlan, RestorationResult,
    RestoreCriteria,
};
use script_archive::scanner::{ReferenceFinding, ReferenceScanner};
use script_archive::store::JsonlArchiveStore;
use script_archive::validator::CatalogValidation;
use script_archive::Settings;
use std::collections::BTreeSet;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, Instant};

fn main() -> Result<ExitCode> {
    let args = Args::parse();
    logging::init_logger(args.verbose);
    let workspace = Workspace::load(&args)?;

    match args.command {
        Commands::ValidateImports { json } => cmd_validate_imports(&workspace, json),
        Commands::ValidateCliCommands { catalog, json } => {
            cmd_validate_cli_commands(&workspace, catalog, json)
        }
        Commands::ValidateArchiving {
            catalog,
            output,
            json,
        } => cmd_validate_archiving(&workspace, catalog, output, json),
        Commands::RestoreBatch {
            archive_id,
            category,
            date_range,
            category_prefix,
            apply,
        } => {
            let criteria =
                RestoreCriteria::from_flags(archive_id, category, date_range.as_deref(), None)?;
            cmd_restore(&workspace, criteria, category_prefix, &apply)
        }
        Commands::RestoreScript { path, apply } => {
            let criteria = RestoreCriteria::from_flags(None, None, None, Some(path))?;
            cmd_restore(&workspace, criteria, Vec::new(), &apply)
        }
        Commands::ArchiveScript {
            paths,
            reason,
            batch_id,
            dry_run,
            json,
        } => cmd_archive(&workspace, &paths, &reason, batch_id, dry_run, json),
        Commands::Catalog { catalog, json } => cmd_catalog(&workspace, catalog, json),
        Commands::Scan { paths } => cmd_scan(&workspace, paths),
    }
}

/// Repository root plus effective settings.
struct Workspace {
    root: PathBuf,
    settings: Settings,
}

impl Workspace {
    fn load(args: &Args) -> Result<Self> {
        let root = std::fs::canonicalize(&args.root)
            .with_context(|| format!("Failed to resolve root {}", args.root.display()))?;
        let mut settings = match &args.config {
            Some(path) => Settings::from_file(path),
            None => Settings::load(&root),
        }
        .context("Failed to load settings")?;

        settings.exclude_globs.extend(args.exclude.iter().cloned());
        if args.threads.is_some() {
            settings.threads = args.threads;
        }
        settings
            .compiled_excludes()
            .context("Invalid --exclude pattern")?;

        if args.verbose {
            eprintln!(
                "{} Repository root {}",
                "info:".blue().bold(),
                root.display()
            );
        }
        Ok(Self { root, settings })
    }

    fn store(&self) -> JsonlArchiveStore {
        JsonlArchiveStore::open(self.settings.resolve(&self.root, &self.settings.ledger_path))
    }

    fn catalog(&self, path: Option<PathBuf>) -> JsonCatalog {
        let path = path.unwrap_or_else(|| self.settings.catalog_path.clone());
        JsonCatalog::new(self.settings.resolve(&self.root, &path))
    }

    fn orchestrator<'a>(
        &self,
        store: &'a JsonlArchiveStore,
        catalog: &'a JsonCatalog,
    ) -> Result<ValidationOrchestrator<'a>> {
        ValidationOrchestrator::from_settings(&self.root, &self.settings, store, catalog)
            .context("Invalid scan settings")
    }
}

fn exit_code(clean: bool) -> ExitCode {
    if clean {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn cmd_validate_imports(workspace: &Workspace, json: bool) -> Result<ExitCode> {
    let store = workspace.store();
    let catalog = workspace.catalog(None);
    let imports = workspace
        .orchestrator(&store, &catalog)?
        .validate_imports()
        .context("Failed to read archive ledger")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&imports)?);
    } else {
        print_import_validation(&imports);
    }
    Ok(exit_code(imports.outcome.findings.is_empty()))
}

fn cmd_validate_cli_commands(
    workspace: &Workspace,
    catalog: Option<PathBuf>,
    json: bool,
) -> Result<ExitCode> {
    let store = workspace.store();
    let catalog = workspace.catalog(catalog);
    let validation = workspace
        .orchestrator(&store, &catalog)?
        .validate_cli_commands()
        .context("Failed to validate command catalog")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&validation)?);
    } else {
        print_catalog_validation(&validation);
    }
    Ok(exit_code(validation.broken().next().is_none()))
}

fn cmd_validate_archiving(
    workspace: &Workspace,
    catalog: Option<PathBuf>,
    output: Option<PathBuf>,
    json: bool,
) -> Result<ExitCode> {
    let store = workspace.store();
    let catalog = workspace.catalog(catalog);
    let report = workspace.orchestrator(&store, &catalog)?.run_full_validation();

    if let Some(dir) = output {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        let path = dir.join(report.artifact_file_name());
        std::fs::write(&path, serde_json::to_string_pretty(&report)?)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        eprintln!("{} Wrote {}", "ok:".green().bold(), path.display());
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_findings(&report.findings);
        for warning in &report.warnings {
            eprintln!("{} {}", "warn:".yellow().bold(), warning);
        }
        for warning in &report.scan_warnings {
            eprintln!(
                "{} {}: {}",
                "warn:".yellow().bold(),
                warning.path.display(),
                warning.message
            );
        }
        println!();
        print!("{}", orchestrator::render_summary(&report));
        if report.is_clean() {
            println!("\n{} Archiving broke nothing", "ok:".green().bold());
        } else if report.summary.broken_imports > 0 || report.summary.broken_commands > 0 {
            println!(
                "\n{} Use restore-batch --archive-id <id> --dry-run to review a restoration",
                "hint:".cyan().bold()
            );
        }
    }
    Ok(exit_code(report.is_clean()))
}

fn cmd_restore(
    workspace: &Workspace,
    criteria: RestoreCriteria,
    category_prefix: Vec<(String, String)>,
    args: &ApplyArgs,
) -> Result<ExitCode> {
    let store = workspace.store();
    let mut categories = workspace.settings.categories.clone();
    categories.extend(category_prefix);
    let engine = RestorationEngine::new(&workspace.root, &store)
        .with_categories(categories)
        .with_threads(workspace.settings.threads);

    let plan = engine.plan(criteria)?;
    if !args.json {
        print_plan(&plan);
    }

    let mut options = if args.dry_run {
        ApplyOptions::dry_run()
    } else if args.force {
        ApplyOptions::forced()
    } else if let Some(token) = &args.confirm {
        ApplyOptions::confirmed(token.clone())
    } else if plan.count(PlanAction::Restore) > 0 && std::io::stdin().is_terminal() {
        let confirmed = Confirm::new()
            .with_prompt(format!(
                "Restore {} scripts?",
                plan.count(PlanAction::Restore)
            ))
            .default(false)
            .interact()?;
        if !confirmed {
            println!("{} Nothing restored", "info:".blue().bold());
            return Ok(ExitCode::SUCCESS);
        }
        ApplyOptions::confirmed(plan.confirmation_token())
    } else {
        if plan.count(PlanAction::Restore) > 0 {
            eprintln!(
                "{} Re-run with --confirm {} or --force",
                "hint:".cyan().bold(),
                plan.confirmation_token()
            );
        }
        ApplyOptions::default()
    };
    if let Some(secs) = args.timeout {
        options = options.with_deadline(Instant::now() + Duration::from_secs(secs));
    }

    let result = engine.apply(&plan, &options)?;
    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({ "plan": plan, "result": result }))?
        );
    } else {
        print_restoration_result(&result);
    }
    Ok(exit_code(result.is_clean()))
}

fn cmd_archive(
    workspace: &Workspace,
    paths: &[PathBuf],
    reason: &str,
    batch_id: Option<String>,
    dry_run: bool,
    json: bool,
) -> Result<ExitCode> {
    let store = workspace.store();
    let outcome = Archiver::new(&workspace.root, &store)
        .with_archive_dir_name(workspace.settings.archive_dir_name.clone())
        .archive(paths, reason, batch_id, dry_run, Utc::now())?;

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(ExitCode::SUCCESS);
    }

    let verb = if dry_run { "Would archive:" } else { "Archived:" };
    for entry in &outcome.entries {
        println!(
            "{} {} -> {}",
            verb.yellow().bold(),
            entry.original_path.display(),
            entry.archive_path.display()
        );
    }
    println!(
        "\n{} Batch {}",
        "info:".blue().bold(),
        outcome.batch_id.bold()
    );
    if dry_run {
        println!("{} Drop --dry-run to archive", "hint:".cyan().bold());
    } else {
        println!(
            "{} Run validate-archiving to check nothing still uses them",
            "hint:".cyan().bold()
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_catalog(workspace: &Workspace, catalog: Option<PathBuf>, json: bool) -> Result<ExitCode> {
    let source = workspace.catalog(catalog);
    let entries = source
        .load()
        .with_context(|| format!("Failed to load {}", source.path().display()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else {
        catalog::print_tree(&entries);
        println!(
            "\n{} {} commands in {} pipelines",
            "info:".blue().bold(),
            entries.len(),
            catalog::pipeline_count(&entries)
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_scan(workspace: &Workspace, paths: Option<Vec<PathBuf>>) -> Result<ExitCode> {
    let roots = paths.unwrap_or_else(|| workspace.settings.search_roots.clone());
    let scanner = ReferenceScanner::from_settings(&workspace.root, &workspace.settings)?;
    let exclude_dirs: BTreeSet<PathBuf> = workspace.settings.exclude_dirs.iter().cloned().collect();
    let (files, warnings) = scanner.collect_files(&roots, &exclude_dirs);

    println!("Would scan {} files:", files.len());
    for file in files {
        println!("  {}", file.display());
    }
    for warning in warnings {
        eprintln!(
            "{} {}: {}",
            "warn:".yellow().bold(),
            warning.path.display(),
            warning.message
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn print_findings(findings: &[ReferenceFinding]) {
    let mut current: Option<&Path> = None;
    for finding in findings {
        if current != Some(finding.archived_path.as_path()) {
            println!(
                "\n{} {}",
                "Referenced:".red().bold(),
                finding.archived_path.display()
            );
            current = Some(finding.archived_path.as_path());
        }
        println!(
            "  {}:{} [{}] {}",
            finding.referencing_file.display(),
            finding.line_number,
            finding.reference_kind,
            finding.raw_snippet.dimmed()
        );
    }
}

fn print_import_validation(imports: &ImportValidation) {
    print_findings(&imports.outcome.findings);
    for warning in &imports.outcome.warnings {
        eprintln!(
            "{} {}: {}",
            "warn:".yellow().bold(),
            warning.path.display(),
            warning.message
        );
    }

    println!(
        "\n{} Scanned {} files for {} archived scripts",
        "info:".blue().bold(),
        imports.outcome.files_scanned,
        imports.archived_entries.len()
    );
    if imports.outcome.findings.is_empty() {
        println!("{} No references to archived scripts", "ok:".green().bold());
        return;
    }
    for (batch, count) in imports.findings_by_batch() {
        println!("  batch {}: {} references", batch.bold(), count);
    }
}

fn print_catalog_validation(validation: &CatalogValidation) {
    catalog::print_tree(&validation.entries);
    for issue in &validation.pipeline_issues {
        println!(
            "{} pipeline {} ({}): {}",
            "warn:".yellow().bold(),
            issue.pipeline_name,
            issue.shell_entry_path.display(),
            issue.problem
        );
    }
    for warning in &validation.warnings {
        eprintln!("{} {}", "warn:".yellow().bold(), warning);
    }

    let broken = validation.broken().count();
    if broken == 0 {
        println!("\n{} All {} commands valid", "ok:".green().bold(), validation.entries.len());
        return;
    }
    println!(
        "\n{} {} of {} commands broken",
        "warn:".yellow().bold(),
        broken,
        validation.entries.len()
    );
    let candidates = validation.restoration_candidates().count();
    if candidates > 0 {
        println!(
            "{} {} commands lost their implementation to archiving; restore-script --path <implementation> brings one back",
            "hint:".cyan().bold(),
            candidates
        );
    }
}

fn print_plan(plan: &RestorationPlan) {
    println!(
        "{} Plan for {}: {} to restore, {} already present, {} missing from archive",
        "info:".blue().bold(),
        plan.criteria.describe(),
        plan.count(PlanAction::Restore),
        plan.count(PlanAction::SkipAlreadyExists),
        plan.count(PlanAction::SkipArchiveMissing)
    );
    for item in &plan.items {
        let action = match item.action {
            PlanAction::Restore => "restore".green(),
            PlanAction::SkipAlreadyExists => "skip (exists)".yellow(),
            PlanAction::SkipArchiveMissing => "skip (archive missing)".red(),
        };
        println!(
            "  {} {} <- {} [{}]",
            action,
            item.target_path.display(),
            item.entry.archive_path.display(),
            item.entry.archive_batch_id
        );
    }
}

fn print_restoration_result(result: &RestorationResult) {
    if result.dry_run {
        println!(
            "\n{} Dry run: would restore {} scripts",
            "info:".blue().bold(),
            result.would_restore.len()
        );
        println!("{} Drop --dry-run to restore", "hint:".cyan().bold());
        return;
    }

    for path in &result.restored {
        println!("{} {}", "Restored:".green().bold(), path.display());
    }
    for skipped in &result.skipped {
        println!(
            "{} {} ({})",
            "Skipped:".yellow().bold(),
            skipped.path.display(),
            skipped.reason.as_str()
        );
    }
    for failed in &result.failed {
        println!("{} {}: {}", "Failed:".red().bold(), failed.path.display(), failed.error);
    }
    for warning in &result.warnings {
        eprintln!("{} {}", "warn:".yellow().bold(), warning);
    }
    println!(
        "\n{} {} restored, {} skipped, {} failed",
        "info:".blue().bold(),
        result.restored.len(),
        result.skipped.len(),
        result.failed.len()
    );
}
