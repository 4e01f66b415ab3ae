//! Bundler integration: run the machine on every emitted compilation.

use crate::machine::{RunOutcome, TestMachine, TestMachineError};
use std::cell::{Cell, RefCell};
use std::path::PathBuf;
use testmachine_core::{HostModule, ModulesPreprocessor};
use tracing::{debug, error, warn};

/// What the bundler hands over on emit. Failures are reported back through
/// `warnings` and `errors`.
#[derive(Debug, Clone, Default)]
pub struct Compilation {
    pub modules: Vec<HostModule>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl Compilation {
    pub fn new(modules: impl IntoIterator<Item = impl Into<HostModule>>) -> Self {
        Self {
            modules: modules.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmitOutcome {
    /// A run was already in progress.
    Skipped,
    NoTests,
    Passed { tests: Vec<PathBuf> },
    /// The run failed and the failure went into the compilation's warnings.
    Failed,
}

#[derive(Debug)]
pub struct BuildHook {
    machine: RefCell<Option<TestMachine>>,
    preprocessor: RefCell<ModulesPreprocessor>,
    watching: Cell<bool>,
    fail_on_error: bool,
    in_progress: Cell<bool>,
}

impl BuildHook {
    pub fn new(machine: TestMachine) -> Result<Self, TestMachineError> {
        let config = machine.config();
        let preprocessor = ModulesPreprocessor::from_config(config)?;
        let watching = config.watch;
        let fail_on_error = config.fail_on_error;
        Ok(Self {
            machine: RefCell::new(Some(machine)),
            preprocessor: RefCell::new(preprocessor),
            watching: Cell::new(watching),
            fail_on_error,
            in_progress: Cell::new(false),
        })
    }

    /// Whether the bundler is in watch mode. Failures are never fatal while
    /// watching.
    pub fn set_watching(&self, watching: bool) {
        self.watching.set(watching);
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.in_progress.get()
    }

    /// Run the tests affected by `compilation`. A second emit arriving while
    /// a run is in progress is skipped.
    pub async fn on_emit(&self, compilation: &mut Compilation) -> Result<EmitOutcome, TestMachineError> {
        if self.in_progress.get() {
            debug!("run in progress, skipping emit");
            return Ok(EmitOutcome::Skipped);
        }
        let Some(mut machine) = self.machine.borrow_mut().take() else {
            return Ok(EmitOutcome::Skipped);
        };
        self.in_progress.set(true);

        let (modules, changed) = {
            let mut preprocessor = self.preprocessor.borrow_mut();
            let modules = preprocessor.filter_modules(&compilation.modules);
            let changed = preprocessor.changed_modules(&modules);
            (modules, changed)
        };
        debug!(modules = modules.len(), changed = changed.len(), "emit");

        let result = machine.run_tests(&modules, Some(&changed)).await;
        *self.machine.borrow_mut() = Some(machine);
        self.in_progress.set(false);

        match result {
            Ok(RunOutcome::NoTests) => Ok(EmitOutcome::NoTests),
            Ok(RunOutcome::Completed { tests }) => Ok(EmitOutcome::Passed { tests }),
            Err(err) => self.report(compilation, err),
        }
    }

    fn report(
        &self,
        compilation: &mut Compilation,
        err: TestMachineError,
    ) -> Result<EmitOutcome, TestMachineError> {
        let message = format!("testmachine: {err}");
        if self.watching.get() || !self.fail_on_error {
            warn!(kind = ?err.failure_kind(), "test run failed");
            compilation.warnings.push(message);
            Ok(EmitOutcome::Failed)
        } else {
            error!(kind = ?err.failure_kind(), "test run failed");
            compilation.errors.push(message);
            Err(err)
        }
    }

    /// Run `f` against the wrapped machine, unless a run holds it.
    pub fn with_machine<R>(&self, f: impl FnOnce(&mut TestMachine) -> R) -> Option<R> {
        self.machine.borrow_mut().as_mut().map(f)
    }
}
