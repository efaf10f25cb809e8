//! Command-line interface definitions.
//!
//! Defines the argument parser and subcommands using clap's derive API.
//! Each subcommand maps onto one library entry point: validating imports,
//! validating catalog commands, running the full validation, restoring by
//! criteria or path, archiving, and inspecting the catalog or scan targets.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Archive obsolete scripts, validate that nothing still uses them, and
/// restore them when something does.
#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Args {
    /// Repository root. All ledger and catalog paths are relative to it.
    #[arg(long, global = true, default_value = ".")]
    pub root: PathBuf,

    /// Settings file. Defaults to `.script-archive.json` in the root.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Glob patterns for files/directories to exclude from scanning
    /// (e.g., "**/*.min.js"). Added to the configured patterns.
    #[arg(short, long, global = true)]
    pub exclude: Vec<String>,

    /// Worker threads for scanning and restoring.
    #[arg(long, global = true)]
    pub threads: Option<usize>,

    /// Print additional diagnostics to stderr.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Report remaining references to archived scripts.
    ValidateImports {
        /// Emit JSON instead of human-readable output.
        #[arg(long)]
        json: bool,
    },

    /// Check catalog commands against implementation files and shell syntax.
    ValidateCliCommands {
        /// Command catalog to validate. Defaults to the configured catalog.
        #[arg(long)]
        catalog: Option<PathBuf>,

        /// Emit JSON instead of human-readable output.
        #[arg(long)]
        json: bool,
    },

    /// Run reference and catalog validation together.
    ValidateArchiving {
        /// Command catalog to validate. Defaults to the configured catalog.
        #[arg(long)]
        catalog: Option<PathBuf>,

        /// Directory to write `archive-validation-<date>.json` into.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Emit JSON instead of human-readable output.
        #[arg(long)]
        json: bool,
    },

    /// Restore archived scripts selected by batch, category or date range.
    RestoreBatch {
        /// Archive batch id.
        #[arg(long)]
        archive_id: Option<String>,

        /// Category tag (configured prefix tag or parent directory).
        #[arg(long)]
        category: Option<String>,

        /// Inclusive range `YYYY-MM-DD..YYYY-MM-DD`, or a single date.
        #[arg(long)]
        date_range: Option<String>,

        /// Extra category mappings in `prefix=tag` format. Longest prefix wins.
        #[arg(long, value_parser = parse_mapping)]
        category_prefix: Vec<(String, String)>,

        #[command(flatten)]
        apply: ApplyArgs,
    },

    /// Restore a single archived script.
    RestoreScript {
        /// Original path of the script.
        #[arg(short, long)]
        path: PathBuf,

        #[command(flatten)]
        apply: ApplyArgs,
    },

    /// Move scripts into the archive and record them in the ledger.
    ArchiveScript {
        /// Scripts to archive, relative to the root.
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Why the scripts are being archived.
        #[arg(long, default_value = "")]
        reason: String,

        /// Batch id. Defaults to a timestamped id.
        #[arg(long)]
        batch_id: Option<String>,

        /// Show what would be archived without moving anything.
        #[arg(long)]
        dry_run: bool,

        /// Emit JSON instead of human-readable output.
        #[arg(long)]
        json: bool,
    },

    /// Print the command catalog as a tree.
    Catalog {
        /// Command catalog to print. Defaults to the configured catalog.
        #[arg(long)]
        catalog: Option<PathBuf>,

        /// Emit JSON instead of human-readable output.
        #[arg(long)]
        json: bool,
    },

    /// List files that would be scanned without processing them.
    Scan {
        /// Paths to scan. Defaults to the configured search roots.
        #[arg(short, long)]
        paths: Option<Vec<PathBuf>>,
    },
}

/// Options shared by the restore subcommands.
#[derive(Debug, clap::Args)]
pub struct ApplyArgs {
    /// Print the plan without touching files or the ledger.
    #[arg(long)]
    pub dry_run: bool,

    /// Skip confirmation.
    #[arg(long)]
    pub force: bool,

    /// Confirmation token printed with the plan, for non-interactive runs.
    #[arg(long)]
    pub confirm: Option<String>,

    /// Give up on items not started within this many seconds.
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Emit JSON instead of human-readable output.
    #[arg(long)]
    pub json: bool,
}

fn parse_mapping(s: &str) -> Result<(String, String), String> {
    let parts: Vec<&str> = s.splitn(2, '=').collect();
    if parts.len() != 2 {
        return Err(format!("Invalid mapping format '{}', expected 'prefix=tag'", s));
    }
    Ok((parts[0].to_string(), parts[1].to_string()))
}
