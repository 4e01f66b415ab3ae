//! The orchestrator: one run per bundler build.

use crate::controller::SandboxController;
use crate::engine::{Engine, EngineError};
use crate::error::{FailureKind, PatchError};
use crate::patch::EnvironmentPatch;
use crate::plugin::{Plugin, PluginController};
use crate::runtime::{HostOptions, JsHost, RuntimeError};
use std::path::PathBuf;
use std::rc::Rc;
use testmachine_core::{
    CompilerPlugin, Compiler, Config, ModuleGraph, ModuleSource, Router, TestExtractor, TestWatcher,
};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum TestMachineError {
    #[error(transparent)]
    Config(#[from] testmachine_core::Error),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Patch(#[from] PatchError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl TestMachineError {
    /// Kind of the sandbox failure behind this error, if any.
    #[must_use]
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Patch(PatchError::Dependency { source, .. })
            | Self::Engine(EngineError::Load { source, .. }) => Some(source.kind()),
            _ => None,
        }
    }
}

/// Result of a run that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Nothing matched the changed modules; the engine was not invoked.
    NoTests,
    Completed { tests: Vec<PathBuf> },
}

impl RunOutcome {
    #[must_use]
    pub fn tests(&self) -> &[PathBuf] {
        match self {
            Self::NoTests => &[],
            Self::Completed { tests } => tests,
        }
    }
}

/// Selects the tests affected by a build, runs them against sandboxed
/// modules and restores the host afterwards.
pub struct TestMachine {
    config: Config,
    engine: Box<dyn Engine>,
    compiler: Rc<Compiler>,
    extractor: TestExtractor,
    plugins: PluginController,
    controller: Rc<SandboxController>,
    patch: Rc<EnvironmentPatch>,
    watcher: Option<TestWatcher>,
    // Last: every V8 handle above is released before the isolate.
    host: JsHost,
}

impl std::fmt::Debug for TestMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestMachine")
            .field("cwd", &self.config.cwd)
            .field("compiler", &self.compiler)
            .field("extractor", &self.extractor)
            .field("plugins", &self.plugins)
            .field("watching", &self.watcher.is_some())
            .finish_non_exhaustive()
    }
}

impl TestMachine {
    pub fn new(config: Config, engine: impl Engine + 'static) -> Result<Self, TestMachineError> {
        config.validate()?;

        let compiler = Rc::new(Compiler::new());
        let define = config.define_compiler();
        if !define.is_empty() {
            compiler.push(define);
        }

        let roots = config.test_root_paths();
        let extractor = TestExtractor::new(roots.clone(), config.template_router()?);

        let mocks = config.mocks_table();
        let mocks = (!mocks.is_empty()).then(|| Rc::new(mocks));
        let controller = Rc::new(SandboxController::new(Rc::clone(&compiler), mocks.clone()));
        let patch = Rc::new(EnvironmentPatch::new(
            Rc::clone(&controller),
            config.dependencies.clone(),
            mocks,
        ));

        let watcher = if config.watch {
            match TestWatcher::start(&roots) {
                Ok(watcher) => Some(watcher),
                Err(e) => {
                    warn!(error = %e, "test root watcher unavailable, selection cache is never invalidated");
                    None
                }
            }
        } else {
            None
        };

        let host = JsHost::new(HostOptions {
            cwd: Some(config.cwd.clone()),
        })?;

        debug!(
            roots = roots.len(),
            dependencies = config.dependencies.len(),
            watch = config.watch,
            "test machine ready"
        );
        Ok(Self {
            config,
            engine: Box::new(engine),
            compiler,
            extractor,
            plugins: PluginController::new(),
            controller,
            patch,
            watcher,
            host,
        })
    }

    /// Replace the configured router.
    #[must_use]
    pub fn with_router(mut self, router: impl Router + 'static) -> Self {
        self.extractor = TestExtractor::new(self.config.test_root_paths(), router);
        self
    }

    /// Add a plugin. Its compiler stages are registered immediately.
    #[must_use]
    pub fn with_plugin(mut self, plugin: impl Plugin + 'static) -> Self {
        plugin.compiler_pipeline(&self.compiler);
        self.plugins.push(Box::new(plugin));
        self
    }

    /// Run the tests affected by `changed` (every module when `None`).
    pub async fn run_tests<M: ModuleSource>(
        &mut self,
        modules: &[M],
        changed: Option<&[String]>,
    ) -> Result<RunOutcome, TestMachineError> {
        if self.watcher.as_ref().is_some_and(TestWatcher::take_changed) {
            debug!("test roots changed, clearing selection cache");
            self.extractor.clear_cache();
        }

        let graph = Rc::new(ModuleGraph::from_modules(modules));
        let changed = match changed {
            Some(changed) => changed.to_vec(),
            None => graph.resources(),
        };

        let tests = self.extractor.extract_tests(&changed);
        if tests.is_empty() {
            info!(changed = changed.len(), "no tests affected");
            return Ok(RunOutcome::NoTests);
        }

        info!(tests = tests.len(), modules = graph.len(), "running tests");
        let result = self.execute(graph, &tests).await;
        self.after_run(&tests);
        result.map(|()| RunOutcome::Completed { tests })
    }

    async fn execute(&mut self, graph: Rc<ModuleGraph>, tests: &[PathBuf]) -> Result<(), TestMachineError> {
        {
            let loader = Rc::clone(self.host.loader());
            let scope = &mut self.host.handle_scope();
            self.patch.setup(scope, &loader, graph, tests)?;
        }
        self.engine.run(&mut self.host, tests).await?;
        Ok(())
    }

    fn after_run(&mut self, tests: &[PathBuf]) {
        self.plugins.apply_after_run(&self.controller.resolved_modules());
        self.controller.clear();
        self.patch.clean(self.host.loader(), tests);
    }

    /// Append a compiler stage.
    pub fn push_compiler(&self, plugin: impl CompilerPlugin + 'static) {
        self.compiler.push(plugin);
    }

    /// Forget every cached test selection.
    pub fn clear_tests_fs_cache(&mut self) {
        self.extractor.clear_cache();
    }

    /// Forget every parsed sandbox script.
    pub fn clear_script_cache(&self) {
        self.host.loader().clear_script_cache();
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn compiler(&self) -> &Rc<Compiler> {
        &self.compiler
    }

    #[must_use]
    pub fn host(&self) -> &JsHost {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut JsHost {
        &mut self.host
    }
}
