//! script-archive library for archiving scripts, validating that archiving
//! broke nothing, and restoring archived scripts.
//!
//! The workflow has three parts:
//!
//! 1. **Archiving**: move obsolete scripts aside and record them in the ledger
//!    ([`archiver`], [`store`])
//! 2. **Validation**: scan the codebase for remaining references to archived
//!    scripts and check the command catalog against the tree ([`scanner`],
//!    [`validator`], [`orchestrator`])
//! 3. **Restoration**: plan and apply the return of archived scripts
//!    ([`restore`])
//!
//! # Example
//!
//! ```no_run
//! use script_archive::catalog::JsonCatalog;
//! use script_archive::orchestrator::ValidationOrchestrator;
//! use script_archive::restore::{ApplyOptions, RestorationEngine, RestoreCriteria};
//! use script_archive::store::JsonlArchiveStore;
//!
//! let store = JsonlArchiveStore::open(".archived_scripts/ledger.jsonl");
//! let catalog = JsonCatalog::new("command-catalog.json");
//!
//! let report = ValidationOrchestrator::new(".", &store, &catalog).run_full_validation();
//! println!("{} broken imports", report.summary.broken_imports);
//!
//! if !report.is_clean() {
//!     let engine = RestorationEngine::new(".", &store);
//!     let plan = engine.plan(RestoreCriteria::Batch("b1".into())).unwrap();
//!     let options = ApplyOptions::confirmed(plan.confirmation_token());
//!     let result = engine.apply(&plan, &options).unwrap();
//!     println!("restored {} scripts", result.restored.len());
//! }
//! ```

pub mod archiver;
pub mod catalog;
pub mod config;
pub mod detectors;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod resolver;
pub mod restore;
pub mod scanner;
pub mod store;
pub mod validator;

// Re-export commonly used types at crate root
pub use catalog::{CommandCatalogEntry, ValidationResult};
pub use config::Settings;
pub use detectors::ReferenceKind;
pub use orchestrator::{ValidationOrchestrator, ValidationReport};
pub use restore::{PlanAction, RestorationEngine, RestorationResult, RestoreCriteria};
pub use scanner::{ReferenceFinding, ReferenceScanner};
pub use store::{ArchiveStore, ArchivedScriptEntry};
