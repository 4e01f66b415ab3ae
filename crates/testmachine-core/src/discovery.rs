//! Test discovery with a per-(resource, root, pattern) selection cache.
//!
//! For every changed file the router yields glob patterns. Each pattern is
//! matched against the files under each test root, and the resulting absolute
//! paths are merged into one de-duplicated list that keeps first-seen order.
//! Glob results are cached per triple until `clear_cache` is called, so a file
//! that keeps changing between builds costs one directory walk.

use crate::collection::Collection;
use crate::router::{ParsedPath, Router};
use glob::{MatchOptions, Pattern};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};
use walkdir::WalkDir;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: true,
};

/// Computes which tests are affected by a set of changed files.
pub struct TestExtractor {
    roots: Vec<PathBuf>,
    router: Box<dyn Router>,
    cache: Collection<Vec<PathBuf>>,
}

impl std::fmt::Debug for TestExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestExtractor")
            .field("roots", &self.roots)
            .field("cached", &self.cache.len())
            .finish_non_exhaustive()
    }
}

impl TestExtractor {
    /// Roots should be absolute; relative roots are taken as-is and produce
    /// relative results.
    pub fn new(roots: Vec<PathBuf>, router: impl Router + 'static) -> Self {
        Self {
            roots,
            router: Box::new(router),
            cache: Collection::new(),
        }
    }

    #[must_use]
    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Number of cached (resource, root, pattern) entries.
    #[must_use]
    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    /// Drop every cached glob result.
    pub fn clear_cache(&mut self) {
        debug!(entries = self.cache.len(), "clearing test selection cache");
        self.cache.clear();
    }

    /// Ordered, de-duplicated absolute test paths for the changed files.
    ///
    /// Never fails: empty resources, empty patterns, invalid globs and
    /// unreadable directories contribute nothing.
    pub fn extract_tests<S: AsRef<str>>(&mut self, changed: &[S]) -> Vec<PathBuf> {
        let mut tests = Vec::new();
        let mut seen = HashSet::new();

        if self.roots.is_empty() {
            return tests;
        }

        for resource in changed {
            self.extract_test(resource.as_ref(), &mut tests, &mut seen);
        }

        debug!(changed = changed.len(), tests = tests.len(), "extracted tests");
        tests
    }

    fn extract_test(&mut self, resource: &str, tests: &mut Vec<PathBuf>, seen: &mut HashSet<PathBuf>) {
        if resource.is_empty() {
            return;
        }

        let route = self.router.route(&ParsedPath::parse(resource));
        if route.is_none() {
            return;
        }

        let patterns: Vec<String> = route.patterns().map(str::to_string).collect();
        let roots = self.roots.clone();
        for root in &roots {
            for pattern in &patterns {
                for test in self.process_pattern(resource, root, pattern) {
                    if seen.insert(test.clone()) {
                        tests.push(test);
                    }
                }
            }
        }
    }

    fn process_pattern(&mut self, resource: &str, root: &Path, pattern: &str) -> Vec<PathBuf> {
        let key = cache_key(resource, root, pattern);
        if let Some(hit) = self.cache.get(&key) {
            trace!(resource, pattern, "selection cache hit");
            return hit.clone();
        }

        let found = glob_under(root, pattern);
        self.cache.set(&key, found.clone());
        found
    }
}

fn cache_key(resource: &str, root: &Path, pattern: &str) -> String {
    format!("{resource}\0{}\0{pattern}", root.display())
}

/// Files under `root` whose root-relative path matches `pattern`, sorted by
/// relative path.
fn glob_under(root: &Path, pattern: &str) -> Vec<PathBuf> {
    let pattern = pattern.strip_prefix("./").unwrap_or(pattern);
    let Ok(compiled) = Pattern::new(pattern) else {
        debug!(pattern, "ignoring invalid test glob");
        return Vec::new();
    };

    let mut matches: Vec<(String, PathBuf)> = WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let rel = entry.path().strip_prefix(root).ok()?;
            let rel = rel.to_string_lossy().replace('\\', "/");
            compiled
                .matches_with(&rel, MATCH_OPTIONS)
                .then(|| (rel, entry.path().to_path_buf()))
        })
        .collect();

    matches.sort_by(|a, b| a.0.cmp(&b.0));
    matches.into_iter().map(|(_, path)| path).collect()
}
