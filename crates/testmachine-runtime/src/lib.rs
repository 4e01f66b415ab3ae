#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::return_self_not_must_use)]

//! V8 side of testmachine.
//!
//! Uses deno_core to run test files against sandboxed copies of the modules
//! a bundler just built. A build flows through [`BuildHook`] into
//! [`TestMachine::run_tests`], which selects the affected tests, patches the
//! host loader so graph modules resolve to [`Sandbox`]es and hands the tests
//! to an [`Engine`].
//!
//! ## Usage
//!
//! ```ignore
//! use testmachine_core::{BuildModule, Config};
//! use testmachine_runtime::{SpecEngine, TestMachine};
//!
//! let mut machine = TestMachine::new(Config::discover(&cwd)?, SpecEngine::new())?;
//! let outcome = machine.run_tests(&modules, None).await?;
//! ```

pub mod controller;
pub mod engine;
pub mod error;
mod exception;
pub mod hook;
pub mod loader;
pub mod machine;
pub mod patch;
pub mod plugin;
pub mod resolver;
pub mod runtime;
pub mod sandbox;

pub use controller::SandboxController;
pub use engine::{Engine, EngineError, SpecEngine, SpecReport, TestFailure};
pub use error::{FailureKind, PatchError, SandboxError};
pub use hook::{BuildHook, Compilation, EmitOutcome};
pub use loader::{HostLoader, LoadInterceptor};
pub use machine::{RunOutcome, TestMachine, TestMachineError};
pub use patch::EnvironmentPatch;
pub use plugin::{Plugin, PluginController};
pub use runtime::{HostOptions, JsHost, RuntimeError};
pub use sandbox::{Dependency, Sandbox, SandboxOptions, SandboxState};
