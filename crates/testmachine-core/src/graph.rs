//! Module descriptors and the per-build module graph.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use testmachine_util::fs::resolve_against;
use tracing::debug;

/// One import edge of a module: the request string as written in the source
/// and the resource it resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleDependency {
    pub request: String,
    pub resource: String,
}

impl ModuleDependency {
    pub fn new(request: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            request: request.into(),
            resource: resource.into(),
        }
    }
}

/// A module as supplied by the host bundler.
pub trait ModuleSource {
    /// Stable path identifying the module.
    fn resource(&self) -> &str;
    /// Current source text.
    fn source(&self) -> &str;
    /// Import edges, in source order.
    fn dependencies(&self) -> Vec<ModuleDependency>;
}

/// Normalized module used by the sandboxes. Resources are canonical paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestModule {
    pub resource: String,
    pub source: String,
    pub dependencies: Vec<ModuleDependency>,
}

/// Canonical form of a resource path. Falls back to the input when the file
/// does not exist.
#[must_use]
pub fn canonical_resource(resource: &str) -> String {
    dunce::canonicalize(resource)
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| resource.to_string())
}

/// All modules of one build, keyed by canonical resource.
#[derive(Debug, Clone, Default)]
pub struct ModuleGraph {
    modules: HashMap<String, TestModule>,
}

impl ModuleGraph {
    /// Normalize bundler modules. Edges whose target is not part of the build
    /// are dropped; later duplicates of a resource are ignored.
    pub fn from_modules<M: ModuleSource>(modules: &[M]) -> Self {
        let mut canonical: HashMap<&str, String> = HashMap::new();
        for module in modules {
            let resource = module.resource();
            if resource.is_empty() {
                continue;
            }
            canonical
                .entry(resource)
                .or_insert_with(|| canonical_resource(resource));
        }

        let known: HashSet<&str> = canonical.values().map(String::as_str).collect();
        let mut graph = HashMap::with_capacity(canonical.len());
        for module in modules {
            let Some(resource) = canonical.get(module.resource()) else {
                continue;
            };
            if graph.contains_key(resource) {
                continue;
            }

            let dependencies = module
                .dependencies()
                .into_iter()
                .filter_map(|dep| {
                    let target = canonical
                        .get(dep.resource.as_str())
                        .cloned()
                        .unwrap_or_else(|| canonical_resource(&dep.resource));
                    known
                        .contains(target.as_str())
                        .then(|| ModuleDependency::new(dep.request, target))
                })
                .collect();

            graph.insert(
                resource.clone(),
                TestModule {
                    resource: resource.clone(),
                    source: module.source().to_string(),
                    dependencies,
                },
            );
        }

        debug!(modules = graph.len(), "built module graph");
        Self { modules: graph }
    }

    #[must_use]
    pub fn get(&self, resource: &str) -> Option<&TestModule> {
        self.modules.get(resource)
    }

    #[must_use]
    pub fn contains(&self, resource: &str) -> bool {
        self.modules.contains_key(resource)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Canonical resources in sorted order.
    #[must_use]
    pub fn resources(&self) -> Vec<String> {
        let mut resources: Vec<String> = self.modules.keys().cloned().collect();
        resources.sort();
        resources
    }
}

/// Read-only table redirecting resolved module paths to replacement modules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mocks {
    entries: HashMap<PathBuf, PathBuf>,
}

impl Mocks {
    /// Build from `original → replacement` pairs, resolving relative paths
    /// against `cwd`. Paths that exist are canonicalized.
    #[must_use]
    pub fn from_map(cwd: &Path, map: &BTreeMap<String, String>) -> Self {
        let normalize = |p: &str| {
            let path = resolve_against(cwd, p);
            dunce::canonicalize(&path).unwrap_or(path)
        };
        let entries = map
            .iter()
            .map(|(original, replacement)| (normalize(original), normalize(replacement)))
            .collect();
        Self { entries }
    }

    /// Replacement module for a resolved path.
    #[must_use]
    pub fn get(&self, original: &Path) -> Option<&Path> {
        self.entries.get(original).map(PathBuf::as_path)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Original paths that have a replacement.
    pub fn originals(&self) -> impl Iterator<Item = &Path> {
        self.entries.keys().map(PathBuf::as_path)
    }

    /// Replacement module paths.
    pub fn targets(&self) -> impl Iterator<Item = &Path> {
        self.entries.values().map(PathBuf::as_path)
    }
}
