//! Runner configuration, loaded from `testmachine.json` or built in code.

use crate::define::DefineCompiler;
use crate::error::{Error, Result};
use crate::graph::Mocks;
use crate::router::TemplateRouter;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use testmachine_util::fs::{normalize_path, resolve_against};
use tracing::debug;

/// File name searched for by [`Config::discover`].
pub const CONFIG_FILE_NAME: &str = "testmachine.json";

/// Runtime configuration for a test machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Directory relative paths are resolved against.
    pub cwd: PathBuf,

    /// Directories searched for test files.
    pub test_roots: Vec<String>,

    /// Glob templates mapping a changed file to tests. See [`TemplateRouter`].
    pub router: Vec<String>,

    /// A module takes part in the run only if its resource matches one of
    /// these regexes...
    pub include: Vec<String>,

    /// ...and none of these.
    pub exclude: Vec<String>,

    /// Modules required before the engine starts, for every run.
    pub dependencies: Vec<String>,

    /// Resolved module path → replacement module path.
    pub mocks: BTreeMap<String, String>,

    /// Expressions replaced with literal values at compile time.
    pub define: BTreeMap<String, serde_json::Value>,

    /// Whether the host bundler runs in watch mode.
    pub watch: bool,

    /// Report test failures as build errors instead of warnings.
    pub fail_on_error: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            test_roots: vec!["./test".to_string()],
            router: vec!["**/*.spec.js".to_string(), "**/*.test.js".to_string()],
            include: vec![".*".to_string()],
            exclude: vec!["node_modules".to_string()],
            dependencies: Vec::new(),
            mocks: BTreeMap::new(),
            define: BTreeMap::new(),
            watch: false,
            fail_on_error: false,
        }
    }
}

impl Config {
    /// Create a new config with the given working directory.
    #[must_use]
    pub fn new(cwd: PathBuf) -> Self {
        Self {
            cwd,
            ..Default::default()
        }
    }

    /// Load a config file. A missing `cwd` defaults to the file's directory;
    /// a relative one is resolved against it.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| Error::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        let raw: serde_json::Value =
            serde_json::from_str(&text).map_err(|source| Error::ConfigParse {
                path: path.to_path_buf(),
                source,
            })?;
        let has_cwd = raw.get("cwd").is_some();
        let mut config: Self =
            serde_json::from_value(raw).map_err(|source| Error::ConfigParse {
                path: path.to_path_buf(),
                source,
            })?;

        let base = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        config.cwd = if has_cwd {
            normalize_path(&base.join(&config.cwd))
        } else {
            base
        };

        config.validate()?;
        debug!(path = %path.display(), cwd = %config.cwd.display(), "loaded config");
        Ok(config)
    }

    /// Parse an inline JSON config.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|source| Error::ConfigParse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Look for `testmachine.json` in `start` and its ancestors. Falls back to
    /// the defaults rooted at `start` when none exists.
    pub fn discover(start: &Path) -> Result<Self> {
        let mut current = Some(start);
        while let Some(dir) = current {
            let candidate = dir.join(CONFIG_FILE_NAME);
            if candidate.is_file() {
                return Self::load(&candidate);
            }
            current = dir.parent();
        }
        Ok(Self::new(start.to_path_buf()))
    }

    /// Fail fast on patterns that can never work.
    pub fn validate(&self) -> Result<()> {
        self.include_patterns()?;
        self.exclude_patterns()?;
        self.template_router()?;
        Ok(())
    }

    /// Set the test roots.
    #[must_use]
    pub fn with_test_roots<I, S>(mut self, roots: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.test_roots = roots.into_iter().map(Into::into).collect();
        self
    }

    /// Set the router templates.
    #[must_use]
    pub fn with_router<I, S>(mut self, templates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.router = templates.into_iter().map(Into::into).collect();
        self
    }

    /// Set global dependencies.
    #[must_use]
    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Add one mock.
    #[must_use]
    pub fn with_mock(mut self, original: impl Into<String>, replacement: impl Into<String>) -> Self {
        self.mocks.insert(original.into(), replacement.into());
        self
    }

    /// Add one compile-time definition.
    #[must_use]
    pub fn with_define(mut self, expression: impl Into<String>, value: serde_json::Value) -> Self {
        self.define.insert(expression.into(), value);
        self
    }

    /// Set include/exclude regexes.
    #[must_use]
    pub fn with_filters(mut self, include: Vec<String>, exclude: Vec<String>) -> Self {
        self.include = include;
        self.exclude = exclude;
        self
    }

    /// Set watch mode.
    #[must_use]
    pub fn with_watch(mut self, watch: bool) -> Self {
        self.watch = watch;
        self
    }

    /// Set whether failures become build errors.
    #[must_use]
    pub fn with_fail_on_error(mut self, fail: bool) -> Self {
        self.fail_on_error = fail;
        self
    }

    /// Test roots as absolute paths, canonicalized when they exist.
    #[must_use]
    pub fn test_root_paths(&self) -> Vec<PathBuf> {
        self.test_roots
            .iter()
            .map(|root| {
                let path = resolve_against(&self.cwd, root);
                dunce::canonicalize(&path).unwrap_or(path)
            })
            .collect()
    }

    pub fn include_patterns(&self) -> Result<Vec<Regex>> {
        compile_all("include", &self.include)
    }

    pub fn exclude_patterns(&self) -> Result<Vec<Regex>> {
        compile_all("exclude", &self.exclude)
    }

    pub fn template_router(&self) -> Result<TemplateRouter> {
        TemplateRouter::new(self.router.iter().cloned())
    }

    #[must_use]
    pub fn mocks_table(&self) -> Mocks {
        Mocks::from_map(&self.cwd, &self.mocks)
    }

    #[must_use]
    pub fn define_compiler(&self) -> DefineCompiler {
        DefineCompiler::new(&self.define)
    }
}

fn compile_all(field: &'static str, patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|pattern| {
            Regex::new(pattern).map_err(|source| Error::InvalidRegex {
                field,
                pattern: pattern.clone(),
                source,
            })
        })
        .collect()
}
