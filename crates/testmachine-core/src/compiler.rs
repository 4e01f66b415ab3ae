//! Compilation pipeline.
//!
//! A `Compiler` runs its stages in registration order, feeding the output of
//! one stage into the next. Results are memoized by the BLAKE3 hash of the
//! original source text, so identical sources compile once no matter which
//! file they came from. Registering a stage invalidates the whole cache.

use crate::collection::Collection;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::debug;

/// Output of the pipeline: code plus an optional source map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledSource {
    pub code: String,
    pub sourcemap: Option<String>,
}

impl CompiledSource {
    /// Create a compiled source with code only.
    pub fn code(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            sourcemap: None,
        }
    }

    /// Attach a source map.
    #[must_use]
    pub fn with_sourcemap(mut self, map: impl Into<String>) -> Self {
        self.sourcemap = Some(map.into());
        self
    }
}

/// A compiler stage rejected its input.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("[{stage}] failed to compile {filename}: {message}")]
pub struct CompileError {
    pub stage: String,
    pub filename: String,
    pub message: String,
}

impl CompileError {
    pub fn new(
        stage: impl Into<String>,
        filename: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            stage: stage.into(),
            filename: filename.into(),
            message: message.into(),
        }
    }
}

/// One stage of the pipeline.
///
/// Returning `Ok(None)` leaves the input untouched for this stage.
pub trait CompilerPlugin {
    fn name(&self) -> &str {
        "anonymous"
    }

    fn compile(&self, input: &str, filename: &str) -> Result<Option<CompiledSource>, CompileError>;
}

impl<F> CompilerPlugin for F
where
    F: Fn(&str, &str) -> Result<Option<CompiledSource>, CompileError>,
{
    fn compile(&self, input: &str, filename: &str) -> Result<Option<CompiledSource>, CompileError> {
        self(input, filename)
    }
}

/// Ordered list of compiler stages with a content-addressed result cache.
pub struct Compiler {
    plugins: RefCell<Vec<Rc<dyn CompilerPlugin>>>,
    cache: RefCell<Collection<Rc<CompiledSource>>>,
}

impl std::fmt::Debug for Compiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self
            .plugins
            .borrow()
            .iter()
            .map(|p| p.name().to_string())
            .collect();
        f.debug_struct("Compiler")
            .field("plugins", &names)
            .field("cached", &self.cache.borrow().len())
            .finish()
    }
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

impl Compiler {
    #[must_use]
    pub fn new() -> Self {
        Self {
            plugins: RefCell::new(Vec::new()),
            cache: RefCell::new(Collection::hashed()),
        }
    }

    /// Append a stage. Clears every cached result.
    pub fn push(&self, plugin: impl CompilerPlugin + 'static) {
        self.push_rc(Rc::new(plugin));
    }

    /// Append a closure stage. Clears every cached result.
    pub fn push_fn<F>(&self, stage: F)
    where
        F: Fn(&str, &str) -> Result<Option<CompiledSource>, CompileError> + 'static,
    {
        self.push(stage);
    }

    /// Append an already shared stage. Clears every cached result.
    pub fn push_rc(&self, plugin: Rc<dyn CompilerPlugin>) {
        debug!(stage = plugin.name(), "registering compiler stage");
        self.plugins.borrow_mut().push(plugin);
        self.cache.borrow_mut().clear();
    }

    /// Number of registered stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.plugins.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.plugins.borrow().is_empty()
    }

    /// Number of memoized results.
    #[must_use]
    pub fn cached(&self) -> usize {
        self.cache.borrow().len()
    }

    pub fn clear_cache(&self) {
        self.cache.borrow_mut().clear();
    }

    /// Run every stage over `source`.
    ///
    /// A stage that produces no source map keeps the previous one.
    pub fn compile(&self, source: &str, filename: &str) -> Result<Rc<CompiledSource>, CompileError> {
        if let Some(hit) = self.cache.borrow().get(source) {
            return Ok(Rc::clone(hit));
        }

        // Stages run without the list borrowed so they may push more stages.
        let plugins: Vec<Rc<dyn CompilerPlugin>> = self.plugins.borrow().clone();
        let mut current = CompiledSource::code(source);
        for plugin in &plugins {
            if let Some(next) = plugin.compile(&current.code, filename)? {
                current = CompiledSource {
                    code: next.code,
                    sourcemap: next.sourcemap.or(current.sourcemap),
                };
            }
        }

        debug!(filename, stages = plugins.len(), "compiled source");
        let compiled = Rc::new(current);
        self.cache.borrow_mut().set(source, Rc::clone(&compiled));
        Ok(compiled)
    }
}
