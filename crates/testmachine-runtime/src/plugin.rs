//! Machine plugins: hooks into the compiler pipeline and the end of a run.

use crate::sandbox::Sandbox;
use testmachine_core::{Collection, Compiler};
use tracing::debug;

/// Extension point of a [`crate::TestMachine`].
pub trait Plugin {
    fn name(&self) -> &str {
        "anonymous"
    }

    /// Called once, when the plugin is added, to push compiler stages.
    fn compiler_pipeline(&self, _compiler: &Compiler) {}

    /// Called after every run with the sandboxes the run resolved, before
    /// they are dropped.
    fn after_run(&self, _resolved: &Collection<Sandbox>) {}
}

#[derive(Default)]
pub struct PluginController {
    plugins: Vec<Box<dyn Plugin>>,
}

impl std::fmt::Debug for PluginController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.plugins.iter().map(|p| p.name()))
            .finish()
    }
}

impl PluginController {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, plugin: Box<dyn Plugin>) {
        debug!(plugin = plugin.name(), "plugin registered");
        self.plugins.push(plugin);
    }

    pub fn apply_compiler_pipeline(&self, compiler: &Compiler) {
        for plugin in &self.plugins {
            plugin.compiler_pipeline(compiler);
        }
    }

    pub fn apply_after_run(&self, resolved: &Collection<Sandbox>) {
        for plugin in &self.plugins {
            plugin.after_run(resolved);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;
    use testmachine_core::CompiledSource;

    struct Upper;

    impl Plugin for Upper {
        fn name(&self) -> &str {
            "upper"
        }

        fn compiler_pipeline(&self, compiler: &Compiler) {
            compiler.push_fn(|source, _| Ok(Some(CompiledSource::code(source.to_uppercase()))));
        }
    }

    struct Counter(Rc<Cell<usize>>);

    impl Plugin for Counter {
        fn after_run(&self, resolved: &Collection<Sandbox>) {
            self.0.set(self.0.get() + resolved.len() + 1);
        }
    }

    #[test]
    fn test_compiler_pipeline() {
        let compiler = Compiler::new();
        let mut plugins = PluginController::new();
        plugins.push(Box::new(Upper));
        plugins.apply_compiler_pipeline(&compiler);
        assert_eq!(compiler.len(), 1);
        assert_eq!(compiler.compile("abc", "x.js").unwrap().code, "ABC");
    }

    #[test]
    fn test_after_run_sees_every_plugin() {
        let calls = Rc::new(Cell::new(0));
        let mut plugins = PluginController::new();
        plugins.push(Box::new(Counter(Rc::clone(&calls))));
        plugins.push(Box::new(Counter(Rc::clone(&calls))));
        plugins.apply_after_run(&Collection::new());
        assert_eq!(calls.get(), 2);
        assert_eq!(format!("{plugins:?}"), r#"["anonymous", "anonymous"]"#);
    }
}
