//! Reference detectors.
//!
//! Each [`ReferenceKind`] owns one matcher function, registered in
//! [`DETECTORS`] in a fixed order. A matcher looks at a single line and returns
//! the raw path specifiers it found; resolving them against the archived set
//! happens in [`crate::resolver`]. Adding a reference style means adding a
//! variant and a matcher, nothing else.
//!
//! Matching is syntactic. A missed reference is worse than a spurious one, so
//! the patterns err on the side of matching.

use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::sync::LazyLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ReferenceKind {
    StaticImport,
    DynamicImport,
    Require,
    ShellSource,
    ShellDirectExec,
}

impl ReferenceKind {
    pub const ALL: [ReferenceKind; 5] = [
        ReferenceKind::StaticImport,
        ReferenceKind::DynamicImport,
        ReferenceKind::Require,
        ReferenceKind::ShellSource,
        ReferenceKind::ShellDirectExec,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ReferenceKind::StaticImport => "static-import",
            ReferenceKind::DynamicImport => "dynamic-import",
            ReferenceKind::Require => "require",
            ReferenceKind::ShellSource => "shell-source",
            ReferenceKind::ShellDirectExec => "shell-exec",
        }
    }

    /// Shell references may be run from the repository root as well as from
    /// the referencing file's directory.
    pub fn is_shell(self) -> bool {
        matches!(
            self,
            ReferenceKind::ShellSource | ReferenceKind::ShellDirectExec
        )
    }
}

impl fmt::Display for ReferenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a raw specifier should be interpreted by the resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Specifier {
    /// A file path, relative or absolute, possibly prefixed by a shell variable.
    Path(String),
    /// A path with `${...}` holes, e.g. a template-literal import.
    Computed(String),
    /// A Python dotted module path. `level` counts leading dots of a relative
    /// import (`from ..pkg import x` has level 2).
    PythonModule { module: String, level: usize },
}

/// Language family of the file being scanned, used to gate matchers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFlavor {
    Python,
    Other,
}

impl SourceFlavor {
    pub fn of(path: &std::path::Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("py") | Some("pyi") => SourceFlavor::Python,
            _ => SourceFlavor::Other,
        }
    }
}

pub struct Detector {
    pub kind: ReferenceKind,
    pub matcher: fn(&str, SourceFlavor) -> Vec<Specifier>,
}

/// Registered detectors, in reporting order.
pub static DETECTORS: [Detector; 5] = [
    Detector {
        kind: ReferenceKind::StaticImport,
        matcher: match_static_import,
    },
    Detector {
        kind: ReferenceKind::DynamicImport,
        matcher: match_dynamic_import,
    },
    Detector {
        kind: ReferenceKind::Require,
        matcher: match_require,
    },
    Detector {
        kind: ReferenceKind::ShellSource,
        matcher: match_shell_source,
    },
    Detector {
        kind: ReferenceKind::ShellDirectExec,
        matcher: match_shell_exec,
    },
];

fn compile(pattern: &str) -> Regex {
    // Patterns are literals exercised by the tests below.
    Regex::new(pattern).unwrap_or_else(|e| panic!("invalid detector pattern {pattern}: {e}"))
}

// `import x from '...'`, `export * from "..."`, `import '...'`, `#include "..."`, `@import '...'`.
static STATIC_IMPORT: LazyLock<Regex> = LazyLock::new(|| {
    compile(r#"(?:\bfrom\s*|\bimport\s+|#\s*include\s*|@import\s+(?:url\()?)["'<]([^"'<>\n]+)["'>]"#)
});

static PY_FROM_IMPORT: LazyLock<Regex> =
    LazyLock::new(|| compile(r"^\s*from\s+(\.*)([\w.]*)\s+import\s*\(?\s*([\w\s,]*)"));

static PY_IMPORT: LazyLock<Regex> =
    LazyLock::new(|| compile(r"^\s*import\s+([\w.]+(?:\s*,\s*[\w.]+)*)"));

// `import('...')`, `import(\`...\`)`.
static DYNAMIC_IMPORT: LazyLock<Regex> =
    LazyLock::new(|| compile(r#"\bimport\s*\(\s*["'`]([^"'`\n]+)["'`]"#));

static PY_DYNAMIC_IMPORT: LazyLock<Regex> = LazyLock::new(|| {
    compile(r#"\b(?:importlib\.import_module|import_module|__import__)\s*\(\s*["']([\w.]+)["']"#)
});

static REQUIRE: LazyLock<Regex> =
    LazyLock::new(|| compile(r#"\brequire(?:\.resolve)?\s*\(\s*["'`]([^"'`\n]+)["'`]"#));

/// Start of a shell command: line start, a list operator, a subshell, or a
/// compound-command keyword.
const COMMAND_START: &str = r#"(?:^|[;&|(`]|\$\(|\b(?:then|do|else|exec|time|sudo|env)\s)"#;

/// A path argument, optionally quoted. Stops at whitespace, quotes and
/// shell operators.
const SHELL_WORD: &str = r#"["']?([^\s"';|&)<>`]+)"#;

static SHELL_SOURCE: LazyLock<Regex> = LazyLock::new(|| {
    compile(&format!(r"{COMMAND_START}\s*(?:source|\.)\s+{SHELL_WORD}"))
});

// `bash scripts/x.sh`, `ts-node ./x.ts`, `python3 tools/run.py`, `pnpm exec tsx x.ts`.
static INTERPRETER_EXEC: LazyLock<Regex> = LazyLock::new(|| {
    compile(&format!(
        r#"(?:^|[\s;&|(`"']|\$\()(?:bash|sh|zsh|dash|ksh|node|deno\s+run|bun(?:\s+run)?|ts-node(?:-esm)?|tsx|npx\s+(?:ts-node|tsx)|pnpm\s+(?:exec\s+)?(?:ts-node|tsx)|python[23]?(?:\.\d+)?|uv\s+run|poetry\s+run\s+python)\s+(?:-{{1,2}}[\w-]+(?:=\S+)?\s+)*{SHELL_WORD}"#
    ))
});

// `./scripts/x.sh`, `"$SCRIPT_DIR/x.sh" arg`, `../tools/run`.
static PATH_EXEC: LazyLock<Regex> = LazyLock::new(|| {
    compile(&format!(
        r#"{COMMAND_START}\s*["']?((?:\.{{1,2}}/|/|~/|\$\{{?\w+\}}?/)[^\s"';|&)<>`]*)"#
    ))
});

// `scripts/deploy.sh --prod`, `exec tools/run`: a relative path with a
// separator in command position.
static BARE_EXEC: LazyLock<Regex> = LazyLock::new(|| {
    compile(&format!(
        r#"{COMMAND_START}\s*["']?([\w@+-][^\s"';|&)<>`]*/[^\s"';|&)<>`]*)"#
    ))
});

fn captures(re: &Regex, line: &str, group: usize) -> Vec<String> {
    re.captures_iter(line)
        .filter_map(|c| c.get(group).map(|m| m.as_str().to_string()))
        .collect()
}

fn path_or_computed(raw: String) -> Specifier {
    if raw.contains("${") {
        Specifier::Computed(raw)
    } else {
        Specifier::Path(raw)
    }
}

fn match_static_import(line: &str, flavor: SourceFlavor) -> Vec<Specifier> {
    if flavor == SourceFlavor::Python {
        if let Some(c) = PY_FROM_IMPORT.captures(line) {
            let level = c.get(1).map_or(0, |m| m.as_str().len());
            let module = c.get(2).map_or("", |m| m.as_str());
            // `from pkg import mod` may name a submodule, so each imported
            // name is a candidate as well as the package itself.
            let names = c.get(3).map_or("", |m| m.as_str());
            let mut specs = vec![Specifier::PythonModule {
                module: module.to_string(),
                level,
            }];
            for name in names.split(',').filter_map(|n| n.split_whitespace().next()) {
                let module = if module.is_empty() {
                    name.to_string()
                } else {
                    format!("{module}.{name}")
                };
                specs.push(Specifier::PythonModule { module, level });
            }
            return specs;
        }
        if let Some(c) = PY_IMPORT.captures(line) {
            return c[1]
                .split(',')
                .map(|m| Specifier::PythonModule {
                    module: m.trim().to_string(),
                    level: 0,
                })
                .collect();
        }
        return Vec::new();
    }
    captures(&STATIC_IMPORT, line, 1)
        .into_iter()
        .map(Specifier::Path)
        .collect()
}

fn match_dynamic_import(line: &str, flavor: SourceFlavor) -> Vec<Specifier> {
    if flavor == SourceFlavor::Python {
        return captures(&PY_DYNAMIC_IMPORT, line, 1)
            .into_iter()
            .map(|module| Specifier::PythonModule { module, level: 0 })
            .collect();
    }
    captures(&DYNAMIC_IMPORT, line, 1)
        .into_iter()
        .map(path_or_computed)
        .collect()
}

fn match_require(line: &str, _flavor: SourceFlavor) -> Vec<Specifier> {
    captures(&REQUIRE, line, 1)
        .into_iter()
        .map(path_or_computed)
        .collect()
}

fn match_shell_source(line: &str, _flavor: SourceFlavor) -> Vec<Specifier> {
    captures(&SHELL_SOURCE, line, 1)
        .into_iter()
        .map(Specifier::Path)
        .collect()
}

fn match_shell_exec(line: &str, _flavor: SourceFlavor) -> Vec<Specifier> {
    let mut out: Vec<Specifier> = captures(&INTERPRETER_EXEC, line, 1)
        .into_iter()
        .filter(|word| looks_like_path(word))
        .map(Specifier::Path)
        .collect();
    for c in PATH_EXEC.captures_iter(line) {
        let (Some(whole), Some(word)) = (c.get(0), c.get(1)) else {
            continue;
        };
        if is_call_argument(&line[..whole.start()]) {
            continue;
        }
        let spec = Specifier::Path(word.as_str().to_string());
        if !out.contains(&spec) {
            out.push(spec);
        }
    }
    for c in BARE_EXEC.captures_iter(line) {
        let (Some(whole), Some(word)) = (c.get(0), c.get(1)) else {
            continue;
        };
        if is_call_argument(&line[..whole.start()]) || !is_bare_command(word.as_str(), &line[word.end()..]) {
            continue;
        }
        let spec = Specifier::Path(word.as_str().to_string());
        if !out.contains(&spec) {
            out.push(spec);
        }
    }
    out
}

/// A bare `dir/file` word is a command when it carries a script extension,
/// or when it ends the line or is followed by arguments or a list operator.
/// `(total/count)` is arithmetic, not a command.
fn is_bare_command(word: &str, after: &str) -> bool {
    if word.contains("://") {
        return false;
    }
    has_script_extension(word)
        || after
            .chars()
            .next()
            .is_none_or(|c| c.is_whitespace() || matches!(c, ';' | '&' | '|' | '"' | '\''))
}

/// True when a `(`-started path is the argument of an import or require
/// call, which the module detectors already report.
fn is_call_argument(before: &str) -> bool {
    let before = before.trim_end();
    let before = before.strip_suffix('(').unwrap_or(before).trim_end();
    ["import", "require", "require.resolve", "import_module", "__import__"]
        .iter()
        .any(|call| before.ends_with(call))
}

/// Interpreter arguments are only paths if they contain a separator or carry
/// a script extension; `node -e` style inline code is ignored.
fn looks_like_path(word: &str) -> bool {
    word.contains('/') || has_script_extension(word)
}

fn has_script_extension(word: &str) -> bool {
    std::path::Path::new(word)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| {
            matches!(
                e,
                "sh" | "bash" | "zsh" | "js" | "mjs" | "cjs" | "ts" | "mts" | "cts" | "tsx" | "py"
            )
        })
}

/// Runs every detector over `line`, in registration order.
pub fn detect(line: &str, flavor: SourceFlavor) -> Vec<(ReferenceKind, Specifier)> {
    DETECTORS
        .iter()
        .flat_map(|d| {
            (d.matcher)(line, flavor)
                .into_iter()
                .map(move |spec| (d.kind, spec))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(line: &str) -> Vec<(ReferenceKind, String)> {
        detect(line, SourceFlavor::Other)
            .into_iter()
            .map(|(k, s)| match s {
                Specifier::Path(p) | Specifier::Computed(p) => (k, p),
                Specifier::PythonModule { module, .. } => (k, module),
            })
            .collect()
    }

    #[test]
    fn static_imports() {
        assert_eq!(
            paths("import { run } from '../scripts/b';"),
            vec![(ReferenceKind::StaticImport, "../scripts/b".to_string())]
        );
        assert_eq!(
            paths(r#"export * from "./lib/util.js""#),
            vec![(ReferenceKind::StaticImport, "./lib/util.js".to_string())]
        );
        assert_eq!(
            paths("import './polyfill';"),
            vec![(ReferenceKind::StaticImport, "./polyfill".to_string())]
        );
        assert_eq!(
            paths("} from \"./multi-line\";"),
            vec![(ReferenceKind::StaticImport, "./multi-line".to_string())]
        );
        assert_eq!(
            paths(r#"#include "helpers/common.h""#),
            vec![(ReferenceKind::StaticImport, "helpers/common.h".to_string())]
        );
    }

    #[test]
    fn dynamic_imports_are_not_static() {
        assert_eq!(
            paths("const m = await import('./scripts/b.ts');"),
            vec![(ReferenceKind::DynamicImport, "./scripts/b.ts".to_string())]
        );
    }

    #[test]
    fn computed_dynamic_import() {
        let found = detect("await import(`./commands/${name}.ts`)", SourceFlavor::Other);
        assert_eq!(
            found,
            vec![(
                ReferenceKind::DynamicImport,
                Specifier::Computed("./commands/${name}.ts".to_string())
            )]
        );
    }

    #[test]
    fn require_calls() {
        assert_eq!(
            paths("const x = require(\"../tools/x\");"),
            vec![(ReferenceKind::Require, "../tools/x".to_string())]
        );
        assert_eq!(
            paths("require.resolve('./worker.js')"),
            vec![(ReferenceKind::Require, "./worker.js".to_string())]
        );
    }

    #[test]
    fn shell_source_forms() {
        assert_eq!(
            paths("source \"$SCRIPT_DIR/lib/env.sh\""),
            vec![(ReferenceKind::ShellSource, "$SCRIPT_DIR/lib/env.sh".to_string())]
        );
        assert_eq!(
            paths("  . ./common.sh"),
            vec![(ReferenceKind::ShellSource, "./common.sh".to_string())]
        );
        assert_eq!(
            paths("if [ -f x ]; then source scripts/a.sh; fi"),
            vec![(ReferenceKind::ShellSource, "scripts/a.sh".to_string())]
        );
    }

    #[test]
    fn shell_exec_forms() {
        assert_eq!(
            paths("./scripts/a.sh --flag"),
            vec![(ReferenceKind::ShellDirectExec, "./scripts/a.sh".to_string())]
        );
        assert_eq!(
            paths("bash scripts/a.sh"),
            vec![(ReferenceKind::ShellDirectExec, "scripts/a.sh".to_string())]
        );
        assert_eq!(
            paths("  ts-node --transpile-only \"$ROOT/scripts/b.ts\" \"$@\""),
            vec![(ReferenceKind::ShellDirectExec, "$ROOT/scripts/b.ts".to_string())]
        );
        assert_eq!(
            paths("make build && ${TOOLS}/run.sh"),
            vec![(ReferenceKind::ShellDirectExec, "${TOOLS}/run.sh".to_string())]
        );
    }

    #[test]
    fn bare_relative_exec() {
        assert_eq!(
            paths("scripts/deploy.sh --prod"),
            vec![(ReferenceKind::ShellDirectExec, "scripts/deploy.sh".to_string())]
        );
        assert_eq!(
            paths("  exec tools/run \"$@\""),
            vec![(ReferenceKind::ShellDirectExec, "tools/run".to_string())]
        );
        assert_eq!(
            paths("make && bin/release"),
            vec![(ReferenceKind::ShellDirectExec, "bin/release".to_string())]
        );
    }

    #[test]
    fn bare_exec_ignores_arithmetic_and_urls() {
        assert!(paths("const avg = Math.round(total/count);").is_empty());
        assert!(paths("https://example.com/x.sh").is_empty());
        assert!(paths("source scripts/a.sh")
            .iter()
            .all(|(kind, _)| *kind == ReferenceKind::ShellSource));
    }

    #[test]
    fn shell_exec_ignores_inline_code() {
        assert!(paths("node -e \"console.log(1)\"").is_empty());
        assert!(paths("echo done").is_empty());
    }

    #[test]
    fn python_imports() {
        let found = detect("from .helpers.audio import clip as c", SourceFlavor::Python);
        assert_eq!(
            found,
            vec![
                (
                    ReferenceKind::StaticImport,
                    Specifier::PythonModule {
                        module: "helpers.audio".to_string(),
                        level: 1
                    }
                ),
                (
                    ReferenceKind::StaticImport,
                    Specifier::PythonModule {
                        module: "helpers.audio.clip".to_string(),
                        level: 1
                    }
                ),
            ]
        );

        let found = detect("from scripts.python import (", SourceFlavor::Python);
        assert_eq!(found.len(), 1);

        let found = detect("import os, scripts.python.clip_audio", SourceFlavor::Python);
        assert_eq!(found.len(), 2);

        let found = detect(
            "mod = importlib.import_module('scripts.python.modal_process')",
            SourceFlavor::Python,
        );
        assert_eq!(
            found,
            vec![(
                ReferenceKind::DynamicImport,
                Specifier::PythonModule {
                    module: "scripts.python.modal_process".to_string(),
                    level: 0
                }
            )]
        );
    }

    #[test]
    fn python_flavor_skips_js_import_patterns() {
        assert!(detect("# import './x'", SourceFlavor::Python).is_empty());
    }
}
