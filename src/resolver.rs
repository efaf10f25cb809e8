//! Resolution of raw specifiers against the archived path set.
//!
//! A specifier resolves to an archived script when its path, normalized
//! lexically against the referencing file (or the repository root for shell
//! commands and bare paths), names that script. Matching is
//! extension-insensitive where module resolution is: an extensionless
//! specifier matches any extension, a JS-family extension matches any other
//! JS-family extension (`./b.js` imports `b.ts`), and a directory matches its
//! `index` file. Specifiers whose leading segment cannot be resolved
//! statically (`$SCRIPT_DIR/x.sh`, `@/lib/x`) match by path suffix.

use crate::detectors::{ReferenceKind, Specifier};
use glob::{MatchOptions, Pattern};
use std::collections::{BTreeSet, HashMap};
use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};

const JS_FAMILY: &[&str] = &["js", "mjs", "cjs", "jsx", "ts", "mts", "cts", "tsx"];

fn is_js_family(path: &Path) -> bool {
    path.extension()
        .and_then(OsStr::to_str)
        .is_some_and(|e| JS_FAMILY.contains(&e))
}

/// Lexically normalizes a relative path, resolving `.` and `..`.
///
/// Returns `None` if the path climbs above its starting point or is absolute.
pub fn normalize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            Component::Normal(part) => out.push(part),
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(out)
}

/// Strips everything up to and including the last `..` or leading `.`
/// component, leaving the part of the path that names a concrete location.
fn concrete_tail(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            _ => out = PathBuf::new(),
        }
    }
    out
}

/// Suffix matches need enough structure to avoid matching every file with a
/// common name.
fn suffix_is_specific(tail: &Path) -> bool {
    tail.components().count() >= 2 || tail.extension().is_some()
}

/// Index over the archived paths of one scan run.
#[derive(Debug, Default)]
pub struct ArchivedIndex {
    paths: BTreeSet<PathBuf>,
    by_stem: HashMap<PathBuf, Vec<PathBuf>>,
}

impl ArchivedIndex {
    /// Builds the index from repo-relative paths. Paths that do not
    /// normalize are dropped.
    pub fn new<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut index = ArchivedIndex::default();
        for path in paths {
            let Some(path) = normalize(path.as_ref()) else {
                continue;
            };
            if path.as_os_str().is_empty() || !index.paths.insert(path.clone()) {
                continue;
            }
            index
                .by_stem
                .entry(path.with_extension(""))
                .or_default()
                .push(path);
        }
        index
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.paths.contains(path)
    }

    /// Resolves one specifier found in `referencing_file` (repo-relative).
    ///
    /// `repo_root` is only used to relativize absolute specifiers.
    pub fn resolve(
        &self,
        spec: &Specifier,
        kind: ReferenceKind,
        referencing_file: &Path,
        repo_root: &Path,
    ) -> BTreeSet<PathBuf> {
        let mut out = BTreeSet::new();
        if self.is_empty() {
            return out;
        }
        let base = referencing_file.parent().unwrap_or(Path::new(""));
        match spec {
            Specifier::Path(raw) => self.resolve_path(raw, kind, base, repo_root, &mut out),
            Specifier::Computed(raw) => self.resolve_computed(raw, base, &mut out),
            Specifier::PythonModule { module, level } => {
                self.resolve_python(module, *level, base, &mut out)
            }
        }
        out
    }

    fn resolve_path(
        &self,
        raw: &str,
        kind: ReferenceKind,
        base: &Path,
        repo_root: &Path,
        out: &mut BTreeSet<PathBuf>,
    ) {
        let raw = clean_specifier(raw);
        if raw.is_empty() {
            return;
        }

        // `$DIR/x.sh`, `${ROOT}/x`, `~/x`, `@/lib/x`, `#internal/x`: the
        // leading segment is unknown here, so match on what follows it.
        if raw.starts_with(['$', '~', '@', '#']) {
            if let Some((_, rest)) = raw.split_once('/') {
                let tail = concrete_tail(Path::new(rest));
                if suffix_is_specific(&tail) {
                    self.match_suffix(&tail, out);
                }
            }
            return;
        }

        let path = Path::new(raw);
        if path.is_absolute() {
            let relative = path
                .strip_prefix(repo_root)
                .map(Path::to_path_buf)
                .unwrap_or_else(|_| path.components().skip(1).collect());
            if let Some(candidate) = normalize(&relative) {
                self.match_candidate(&candidate, out);
            }
            return;
        }

        if let Some(candidate) = normalize(&base.join(path)) {
            self.match_candidate(&candidate, out);
        }
        let explicit_relative = raw.starts_with("./") || raw.starts_with("../");
        // Shell commands usually run from the repository root; bare module
        // paths are commonly root-relative too (tsconfig baseUrl, PYTHONPATH).
        if (kind.is_shell() || !explicit_relative)
            && let Some(candidate) = normalize(path)
        {
            self.match_candidate(&candidate, out);
        }
    }

    fn resolve_computed(&self, raw: &str, base: &Path, out: &mut BTreeSet<PathBuf>) {
        const HOLE: char = '\u{0}';
        let mut template = String::with_capacity(raw.len());
        let mut rest = clean_specifier(raw);
        while let Some(start) = rest.find("${") {
            template.push_str(&rest[..start]);
            template.push(HOLE);
            rest = match rest[start..].find('}') {
                Some(end) => &rest[start + end + 1..],
                None => "",
            };
        }
        template.push_str(rest);

        let relative = template.starts_with("./") || template.starts_with("../");
        let joined = if relative {
            base.join(&template)
        } else {
            PathBuf::from(&template)
        };
        let Some(normalized) = normalize(&joined) else {
            return;
        };
        let pattern_src: Vec<String> = normalized
            .to_string_lossy()
            .split(HOLE)
            .map(Pattern::escape)
            .collect();
        let Ok(pattern) = Pattern::new(&pattern_src.join("*")) else {
            return;
        };
        let options = MatchOptions {
            require_literal_separator: true,
            ..MatchOptions::new()
        };
        let has_ext = normalized.extension().is_some();
        for archived in &self.paths {
            if pattern.matches_path_with(archived, options)
                || (!has_ext && pattern.matches_path_with(&archived.with_extension(""), options))
            {
                out.insert(archived.clone());
            }
        }
    }

    fn resolve_python(&self, module: &str, level: usize, base: &Path, out: &mut BTreeSet<PathBuf>) {
        let module_path: PathBuf = module.split('.').filter(|s| !s.is_empty()).collect();
        if level > 0 {
            let mut dir = base.to_path_buf();
            for _ in 1..level {
                if !dir.pop() {
                    return;
                }
            }
            let target = dir.join(&module_path);
            self.match_python_target(&target, out);
            return;
        }
        if module_path.as_os_str().is_empty() {
            return;
        }
        self.match_python_target(&module_path, out);
        // The script's own directory comes first on `sys.path`.
        self.match_python_target(&base.join(&module_path), out);
        // Packages are often rooted below the repository root
        // (e.g. `packages/tool/whisperx/utils.py` imported as `whisperx.utils`).
        if module_path.components().count() >= 2 {
            self.match_suffix(&module_path.with_extension("py"), out);
            self.match_suffix(&module_path.join("__init__.py"), out);
        }
    }

    fn match_python_target(&self, target: &Path, out: &mut BTreeSet<PathBuf>) {
        for candidate in [target.with_extension("py"), target.join("__init__.py")] {
            if self.paths.contains(&candidate) {
                out.insert(candidate);
            }
        }
    }

    /// Matches a normalized repo-relative candidate path.
    fn match_candidate(&self, candidate: &Path, out: &mut BTreeSet<PathBuf>) {
        if candidate.as_os_str().is_empty() {
            return;
        }
        if self.paths.contains(candidate) {
            out.insert(candidate.to_path_buf());
        }
        if candidate.extension().is_none() {
            for key in [candidate.to_path_buf(), candidate.join("index")] {
                if let Some(found) = self.by_stem.get(&key) {
                    out.extend(found.iter().cloned());
                }
            }
        } else if is_js_family(candidate)
            && let Some(found) = self.by_stem.get(&candidate.with_extension(""))
        {
            out.extend(found.iter().filter(|p| is_js_family(p)).cloned());
        }
    }

    /// Matches archived paths ending with `tail`, component-wise.
    fn match_suffix(&self, tail: &Path, out: &mut BTreeSet<PathBuf>) {
        if tail.as_os_str().is_empty() {
            return;
        }
        let tail_has_ext = tail.extension().is_some();
        let tail_js = is_js_family(tail);
        let tail_stem = tail.with_extension("");
        for archived in &self.paths {
            let matched = archived.ends_with(tail)
                || (!tail_has_ext && archived.with_extension("").ends_with(tail))
                || (tail_js
                    && is_js_family(archived)
                    && archived.with_extension("").ends_with(&tail_stem));
            if matched {
                out.insert(archived.clone());
            }
        }
    }
}

/// Drops query strings and fragments used by bundlers (`./x.ts?raw`).
fn clean_specifier(raw: &str) -> &str {
    let raw = raw.trim();
    let end = raw.find(['?', '#']).filter(|&i| i > 0).unwrap_or(raw.len());
    raw[..end].trim_end_matches('/')
}
