//! Normalization of bundler output before a run.
//!
//! Bundlers wrap modules: concatenation merges several modules under a root
//! module, and extraction plugins hide the original module behind a proxy.
//! `HostModule` names those shapes explicitly and `ModulesPreprocessor`
//! flattens them, applies the include/exclude filters and works out which
//! modules were rebuilt since the previous build.

use crate::config::Config;
use crate::error::Result;
use crate::graph::{ModuleDependency, ModuleSource};
use regex_lite::Regex;
use tracing::debug;

/// Where a dependency edge of a built module points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyTarget {
    /// Another module of the build, by resource.
    Module(String),
    /// Left to the runtime (externals, built-ins).
    External,
    /// The bundler could not resolve the request.
    Unresolved,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildDependency {
    /// Request as written in the source.
    pub request: String,
    pub target: DependencyTarget,
}

impl BuildDependency {
    pub fn module(request: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            request: request.into(),
            target: DependencyTarget::Module(resource.into()),
        }
    }

    pub fn external(request: impl Into<String>) -> Self {
        Self {
            request: request.into(),
            target: DependencyTarget::External,
        }
    }
}

/// A plain module as produced by the bundler.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BuildModule {
    /// Empty for synthetic modules, which never take part in a run.
    pub resource: String,
    pub source: String,
    /// Milliseconds timestamp of the last time the bundler built the module.
    pub build_timestamp: u64,
    pub dependencies: Vec<BuildDependency>,
}

impl BuildModule {
    pub fn new(resource: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            source: source.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_timestamp(mut self, build_timestamp: u64) -> Self {
        self.build_timestamp = build_timestamp;
        self
    }

    #[must_use]
    pub fn with_dependency(mut self, dependency: BuildDependency) -> Self {
        self.dependencies.push(dependency);
        self
    }
}

impl ModuleSource for BuildModule {
    fn resource(&self) -> &str {
        &self.resource
    }

    fn source(&self) -> &str {
        &self.source
    }

    fn dependencies(&self) -> Vec<ModuleDependency> {
        self.dependencies
            .iter()
            .filter_map(|dep| match &dep.target {
                DependencyTarget::Module(resource) => {
                    Some(ModuleDependency::new(dep.request.clone(), resource.clone()))
                }
                DependencyTarget::External | DependencyTarget::Unresolved => None,
            })
            .collect()
    }
}

/// Module shapes a bundler hands over after a build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostModule {
    Normal(BuildModule),
    /// Scope-hoisted group: inner modules plus the module they were merged into.
    Concatenated {
        root: BuildModule,
        modules: Vec<BuildModule>,
    },
    /// Proxy left behind by an extraction plugin.
    Extracted(BuildModule),
}

impl HostModule {
    /// The real modules behind this shape.
    #[must_use]
    pub fn flatten(&self) -> Vec<&BuildModule> {
        match self {
            Self::Normal(module) | Self::Extracted(module) => vec![module],
            Self::Concatenated { root, modules } => {
                modules.iter().chain(std::iter::once(root)).collect()
            }
        }
    }
}

impl From<BuildModule> for HostModule {
    fn from(module: BuildModule) -> Self {
        Self::Normal(module)
    }
}

/// Filters bundler output and tracks the build watermark.
#[derive(Debug, Clone)]
pub struct ModulesPreprocessor {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
    last_compilation: u64,
}

impl ModulesPreprocessor {
    #[must_use]
    pub fn new(include: Vec<Regex>, exclude: Vec<Regex>) -> Self {
        Self {
            include,
            exclude,
            last_compilation: 0,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(config.include_patterns()?, config.exclude_patterns()?))
    }

    /// Start from a known watermark instead of zero.
    #[must_use]
    pub fn with_watermark(mut self, timestamp: u64) -> Self {
        self.last_compilation = timestamp;
        self
    }

    /// Newest build timestamp seen so far.
    #[must_use]
    pub fn watermark(&self) -> u64 {
        self.last_compilation
    }

    /// Flatten wrapped modules and keep those with a resource that passes the
    /// filters.
    #[must_use]
    pub fn filter_modules(&self, modules: &[HostModule]) -> Vec<BuildModule> {
        let filtered: Vec<BuildModule> = modules
            .iter()
            .flat_map(HostModule::flatten)
            .filter(|module| self.accepts(&module.resource))
            .cloned()
            .collect();
        debug!(total = modules.len(), kept = filtered.len(), "filtered build modules");
        filtered
    }

    fn accepts(&self, resource: &str) -> bool {
        !resource.is_empty()
            && !self.exclude.iter().any(|re| re.is_match(resource))
            && self.include.iter().any(|re| re.is_match(resource))
    }

    /// Resources built after the watermark. Advances the watermark to the
    /// newest timestamp seen.
    pub fn changed_modules(&mut self, modules: &[BuildModule]) -> Vec<String> {
        let mut next = self.last_compilation;
        let changed = modules
            .iter()
            .filter(|module| module.build_timestamp > self.last_compilation)
            .map(|module| {
                next = next.max(module.build_timestamp);
                module.resource.clone()
            })
            .collect();
        self.last_compilation = next;
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn preprocessor() -> ModulesPreprocessor {
        ModulesPreprocessor::from_config(&Config::new("/proj".into())).unwrap()
    }

    #[test]
    fn test_flatten_shapes() {
        let a = BuildModule::new("/proj/a.js", "");
        let b = BuildModule::new("/proj/b.js", "");
        let root = BuildModule::new("/proj/root.js", "");

        let concatenated = HostModule::Concatenated {
            root: root.clone(),
            modules: vec![a.clone(), b.clone()],
        };
        let resources: Vec<&str> = concatenated
            .flatten()
            .iter()
            .map(|m| m.resource.as_str())
            .collect();
        assert_eq!(resources, vec!["/proj/a.js", "/proj/b.js", "/proj/root.js"]);

        assert_eq!(HostModule::Extracted(a.clone()).flatten(), vec![&a]);
    }

    #[test]
    fn test_filter_modules() {
        let modules = vec![
            HostModule::from(BuildModule::new("/proj/src/a.js", "")),
            HostModule::from(BuildModule::new("/proj/node_modules/x/index.js", "")),
            HostModule::from(BuildModule::new("", "synthetic")),
            HostModule::Extracted(BuildModule::new("/proj/src/style.css", "")),
        ];

        let kept: Vec<String> = preprocessor()
            .filter_modules(&modules)
            .into_iter()
            .map(|m| m.resource)
            .collect();
        assert_eq!(kept, vec!["/proj/src/a.js", "/proj/src/style.css"]);
    }

    #[test]
    fn test_include_restricts() {
        let config = Config::new("/proj".into()).with_filters(vec![r"\.js$".into()], vec![]);
        let pre = ModulesPreprocessor::from_config(&config).unwrap();
        let modules = vec![
            HostModule::from(BuildModule::new("/proj/a.js", "")),
            HostModule::from(BuildModule::new("/proj/a.css", "")),
        ];
        assert_eq!(pre.filter_modules(&modules).len(), 1);
    }

    #[test]
    fn test_changed_modules_advances_watermark() {
        let mut pre = preprocessor().with_watermark(100);
        let modules = vec![
            BuildModule::new("/proj/a.js", "").with_timestamp(90),
            BuildModule::new("/proj/b.js", "").with_timestamp(150),
            BuildModule::new("/proj/c.js", "").with_timestamp(120),
        ];

        assert_eq!(pre.changed_modules(&modules), vec!["/proj/b.js", "/proj/c.js"]);
        assert_eq!(pre.watermark(), 150);
        assert!(pre.changed_modules(&modules).is_empty());
    }

    #[test]
    fn test_only_module_edges_are_dependencies() {
        let module = BuildModule::new("/proj/b.js", "")
            .with_dependency(BuildDependency::module("./a", "/proj/a.js"))
            .with_dependency(BuildDependency::external("fs"))
            .with_dependency(BuildDependency {
                request: "./missing".into(),
                target: DependencyTarget::Unresolved,
            });

        assert_eq!(
            module.dependencies(),
            vec![ModuleDependency::new("./a", "/proj/a.js")]
        );
    }
}
