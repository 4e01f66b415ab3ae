//! V8 host built on deno_core.
//!
//! A `JsHost` owns the isolate, installs the bootstrap globals and the
//! [`HostLoader`] every `require` goes through. The loader is stored in an
//! isolate slot so native callbacks can reach it.

use crate::error::SandboxError;
use crate::loader::HostLoader;
use deno_core::{extension, op2, v8, JsRuntime, OpState, RuntimeOptions as DenoRuntimeOptions};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;
use tracing::debug;

/// Runtime error.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("JavaScript error: {0}")]
    JavaScript(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Runtime initialization failed: {0}")]
    Init(String),
}

/// Host configuration options.
#[derive(Debug, Clone, Default)]
pub struct HostOptions {
    /// Working directory reported by `process.cwd()` and used to resolve
    /// top-level requests. Defaults to the process working directory.
    pub cwd: Option<PathBuf>,
}

/// Working directory visible to scripts.
struct HostCwd(PathBuf);

extension!(
    testmachine_runtime,
    ops = [
        op_testmachine_print,
        op_testmachine_cwd,
        op_testmachine_env_get,
        op_testmachine_platform,
        op_testmachine_sleep,
    ],
);

/// Bootstrap JavaScript: console, timers, process, built-in modules and
/// the `__testmachine` helpers.
const BOOTSTRAP_JS: &str = include_str!("bootstrap.js");

/// Name of the hidden helper object installed by the bootstrap.
pub(crate) const HELPERS_GLOBAL: &str = "__testmachine";

#[op2(fast)]
fn op_testmachine_print(#[string] msg: &str, is_err: bool) {
    if is_err {
        eprint!("{msg}");
    } else {
        print!("{msg}");
    }
}

#[op2]
#[string]
fn op_testmachine_cwd(state: &mut OpState) -> String {
    state
        .try_borrow::<HostCwd>()
        .map(|cwd| cwd.0.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[op2]
#[string]
fn op_testmachine_env_get(#[string] key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// `process.platform` naming.
#[op2]
#[string]
fn op_testmachine_platform() -> String {
    match std::env::consts::OS {
        "macos" => "darwin",
        "windows" => "win32",
        other => other,
    }
    .to_string()
}

/// Timer fallback for cores without built-in user timers.
#[op2(async)]
async fn op_testmachine_sleep(millis: u32) {
    tokio::time::sleep(Duration::from_millis(u64::from(millis))).await;
}

/// The isolate plus the module loader bound to it.
pub struct JsHost {
    // Declared first: loader handles are released while the isolate lives.
    loader: Rc<HostLoader>,
    runtime: JsRuntime,
}

impl JsHost {
    /// Create a host and run the bootstrap.
    pub fn new(options: HostOptions) -> Result<Self, RuntimeError> {
        let cwd = match options.cwd {
            Some(cwd) => cwd,
            None => std::env::current_dir().map_err(|e| RuntimeError::Io(e.to_string()))?,
        };
        let cwd = dunce::canonicalize(&cwd).unwrap_or(cwd);

        let mut runtime = JsRuntime::new(DenoRuntimeOptions {
            extensions: vec![testmachine_runtime::init_ops()],
            ..Default::default()
        });
        runtime.op_state().borrow_mut().put(HostCwd(cwd.clone()));

        runtime
            .execute_script("<testmachine:bootstrap>", BOOTSTRAP_JS.to_string())
            .map_err(|e| RuntimeError::Init(format!("Bootstrap failed: {e}")))?;

        let helpers = {
            let scope = &mut runtime.handle_scope();
            let context = scope.get_current_context();
            let global = context.global(scope);
            let key = v8::String::new(scope, HELPERS_GLOBAL)
                .ok_or_else(|| RuntimeError::Init("Failed to allocate helper name".into()))?;
            let value = global
                .get(scope, key.into())
                .ok_or_else(|| RuntimeError::Init("Bootstrap helpers missing".into()))?;
            let object = v8::Local::<v8::Object>::try_from(value)
                .map_err(|_| RuntimeError::Init("Bootstrap helpers are not an object".into()))?;
            v8::Global::new(scope, object)
        };

        let loader = Rc::new(HostLoader::new(cwd.clone(), helpers));
        runtime.v8_isolate().set_slot(Rc::clone(&loader));

        debug!(cwd = %cwd.display(), "JS host ready");
        Ok(Self { loader, runtime })
    }

    #[must_use]
    pub fn loader(&self) -> &Rc<HostLoader> {
        &self.loader
    }

    #[must_use]
    pub fn cwd(&self) -> &Path {
        self.loader.cwd()
    }

    /// Scope in the main context, for direct V8 work.
    pub fn handle_scope(&mut self) -> v8::HandleScope<'_> {
        self.runtime.handle_scope()
    }

    pub fn js_runtime(&mut self) -> &mut JsRuntime {
        &mut self.runtime
    }

    /// `require(request)` from the working directory.
    pub fn require(&mut self, request: &str) -> Result<v8::Global<v8::Value>, SandboxError> {
        let loader = Rc::clone(&self.loader);
        let scope = &mut self.runtime.handle_scope();
        let value = loader.require(scope, request, loader.cwd())?;
        Ok(v8::Global::new(scope, value))
    }

    /// Load a resolved file through the loader, interceptor included.
    pub fn load(&mut self, path: &Path) -> Result<v8::Global<v8::Value>, SandboxError> {
        let loader = Rc::clone(&self.loader);
        let scope = &mut self.runtime.handle_scope();
        let value = loader.load(scope, path)?;
        Ok(v8::Global::new(scope, value))
    }

    /// Run a classic script in the global scope.
    pub fn execute_script(
        &mut self,
        name: &'static str,
        code: &str,
    ) -> Result<v8::Global<v8::Value>, RuntimeError> {
        self.runtime
            .execute_script(name, code.to_string())
            .map_err(|e| RuntimeError::JavaScript(e.to_string()))
    }

    /// Evaluate an expression and stringify the result.
    pub fn eval_to_string(&mut self, code: &str) -> Result<String, RuntimeError> {
        let value = self.execute_script("<testmachine:eval>", code)?;
        let scope = &mut self.runtime.handle_scope();
        let local = v8::Local::new(scope, value);
        Ok(local.to_rust_string_lossy(scope))
    }

    /// Run the event loop until completion.
    pub async fn run_event_loop(&mut self) -> Result<(), RuntimeError> {
        self.runtime
            .run_event_loop(Default::default())
            .await
            .map_err(|e| RuntimeError::JavaScript(e.to_string()))
    }
}

impl Drop for JsHost {
    fn drop(&mut self) {
        self.runtime.v8_isolate().remove_slot::<Rc<HostLoader>>();
        self.loader.release();
    }
}
