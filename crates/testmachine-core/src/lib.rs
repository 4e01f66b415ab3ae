#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::return_self_not_must_use)]

//! Engine-independent parts of testmachine.
//!
//! Everything here is plain Rust: the keyed store behind the caches, the
//! compilation pipeline, test discovery, the per-build module graph and the
//! bundler-facing preprocessing. The V8 side lives in `testmachine-runtime`.

pub mod codeframe;
pub mod collection;
pub mod compiler;
pub mod config;
pub mod define;
pub mod discovery;
pub mod error;
pub mod graph;
pub mod preprocess;
pub mod router;
pub mod watch;

pub use codeframe::{code_frame, Location};
pub use collection::Collection;
pub use compiler::{CompileError, CompiledSource, Compiler, CompilerPlugin};
pub use config::{Config, CONFIG_FILE_NAME};
pub use define::DefineCompiler;
pub use discovery::TestExtractor;
pub use error::Error;
pub use graph::{canonical_resource, Mocks, ModuleDependency, ModuleGraph, ModuleSource, TestModule};
pub use preprocess::{BuildDependency, BuildModule, DependencyTarget, HostModule, ModulesPreprocessor};
pub use router::{ParsedPath, Route, Router, TemplateRouter};
pub use watch::TestWatcher;
