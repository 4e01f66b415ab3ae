//! Execution sandbox: one CommonJS module evaluated against its own scope.
//!
//! The module body runs inside a `with` block over a scope object built by
//! the bootstrap. Free identifiers resolve against that object first and
//! fall through to the real global; assignments stay on the object.
//! `module.exports`, `exports` and `global.exports` all read one cell.
//!
//! A sandbox evaluates its source at most once. Failures are stored and
//! returned again on every later call.

pub(crate) mod script;

use crate::error::SandboxError;
use crate::exception;
use crate::loader::{js_string, module_exports, request_argument, HostLoader};
use crate::resolver::{self, Resolved};
use deno_core::v8;
use script::SANDBOX;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};
use testmachine_core::{CompiledSource, Compiler, Mocks};
use testmachine_util::fs::resolve_against;
use tracing::{debug, trace};

/// A value served for a specific `require` request.
#[derive(Clone)]
pub enum Dependency {
    Value(v8::Global<v8::Value>),
    Json(serde_json::Value),
    /// Another sandbox; its exports are produced on first use.
    Sandbox(Sandbox),
}

impl Dependency {
    fn to_local<'s>(
        &self,
        scope: &mut v8::HandleScope<'s>,
    ) -> Result<v8::Local<'s, v8::Value>, SandboxError> {
        match self {
            Self::Value(value) => Ok(v8::Local::new(scope, value)),
            Self::Json(value) => {
                let text = js_string(scope, &value.to_string())?;
                v8::json::parse(scope, text)
                    .ok_or_else(|| SandboxError::internal("failed to materialize JSON dependency"))
            }
            Self::Sandbox(sandbox) => sandbox.get_exports(scope),
        }
    }
}

impl std::fmt::Debug for Dependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Value(_) => f.write_str("Value(..)"),
            Self::Json(value) => f.debug_tuple("Json").field(value).finish(),
            Self::Sandbox(sandbox) => f.debug_tuple("Sandbox").field(&sandbox.filename()).finish(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SandboxOptions {
    /// Applied to the source before it is parsed. Without one the source is
    /// used as-is.
    pub compiler: Option<Rc<Compiler>>,
    /// Request string → value, consulted before the host loader.
    pub dependencies: HashMap<String, Dependency>,
    /// Consulted before everything else when set.
    pub mocks: Option<Rc<Mocks>>,
}

impl SandboxOptions {
    #[must_use]
    pub fn with_compiler(mut self, compiler: Rc<Compiler>) -> Self {
        self.compiler = Some(compiler);
        self
    }

    #[must_use]
    pub fn with_dependency(mut self, request: impl Into<String>, dependency: Dependency) -> Self {
        self.dependencies.insert(request.into(), dependency);
        self
    }

    #[must_use]
    pub fn with_mocks(mut self, mocks: Rc<Mocks>) -> Self {
        self.mocks = Some(mocks);
        self
    }
}

/// Lifecycle of a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    Created,
    Compiling,
    Evaluating,
    Evaluated,
    Failed,
}

enum State {
    Created,
    Compiling,
    Evaluating,
    Evaluated(v8::Global<v8::Value>),
    Failed(SandboxError),
}

struct Inner {
    id: u32,
    source: String,
    filename: String,
    dirname: PathBuf,
    options: SandboxOptions,
    state: RefCell<State>,
    compiled: RefCell<Option<Rc<CompiledSource>>>,
    context: RefCell<Option<v8::Global<v8::Object>>>,
    module: RefCell<Option<v8::Global<v8::Object>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let id = self.id;
        let _ = REGISTRY.try_with(|registry| {
            if let Ok(mut registry) = registry.try_borrow_mut() {
                registry.remove(&id);
            }
        });
    }
}

thread_local! {
    // Native `require` callbacks find their sandbox by id.
    static REGISTRY: RefCell<HashMap<u32, Weak<Inner>>> = RefCell::new(HashMap::new());
    static NEXT_ID: Cell<u32> = const { Cell::new(1) };
}

/// Shared handle to a sandbox.
#[derive(Clone)]
pub struct Sandbox {
    inner: Rc<Inner>,
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("filename", &self.inner.filename)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Sandbox {
    pub fn new(source: impl Into<String>, filename: impl Into<String>, options: SandboxOptions) -> Self {
        let filename = filename.into();
        let dirname = Path::new(&filename)
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let id = NEXT_ID.with(|next| {
            let id = next.get();
            next.set(id.wrapping_add(1).max(1));
            id
        });

        let inner = Rc::new(Inner {
            id,
            source: source.into(),
            filename,
            dirname,
            options,
            state: RefCell::new(State::Created),
            compiled: RefCell::new(None),
            context: RefCell::new(None),
            module: RefCell::new(None),
        });
        REGISTRY.with(|registry| {
            registry.borrow_mut().insert(id, Rc::downgrade(&inner));
        });
        Self { inner }
    }

    fn lookup(id: u32) -> Option<Self> {
        REGISTRY
            .with(|registry| registry.borrow().get(&id).and_then(Weak::upgrade))
            .map(|inner| Self { inner })
    }

    /// Drop every parsed script shared by sandboxes of this isolate.
    pub fn clear_cache(loader: &HostLoader) {
        loader.clear_script_cache();
    }

    #[must_use]
    pub fn filename(&self) -> &str {
        &self.inner.filename
    }

    #[must_use]
    pub fn dirname(&self) -> &Path {
        &self.inner.dirname
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.inner.source
    }

    /// Output of the compiler, once compilation succeeded.
    #[must_use]
    pub fn compiled_source(&self) -> Option<Rc<CompiledSource>> {
        self.inner.compiled.borrow().clone()
    }

    #[must_use]
    pub fn state(&self) -> SandboxState {
        match &*self.inner.state.borrow() {
            State::Created => SandboxState::Created,
            State::Compiling => SandboxState::Compiling,
            State::Evaluating => SandboxState::Evaluating,
            State::Evaluated(_) => SandboxState::Evaluated,
            State::Failed(_) => SandboxState::Failed,
        }
    }

    /// The stored failure of a failed sandbox.
    #[must_use]
    pub fn error(&self) -> Option<SandboxError> {
        match &*self.inner.state.borrow() {
            State::Failed(err) => Some(err.clone()),
            _ => None,
        }
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Sandbox) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Exports of the module, evaluating it on the first call.
    ///
    /// While the module is still evaluating (a cycle through an injected
    /// dependency) the partially populated exports are returned.
    pub fn get_exports<'s>(
        &self,
        scope: &mut v8::HandleScope<'s>,
    ) -> Result<v8::Local<'s, v8::Value>, SandboxError> {
        {
            let state = self.inner.state.borrow();
            match &*state {
                State::Evaluated(exports) => return Ok(v8::Local::new(scope, exports)),
                State::Failed(err) => return Err(err.clone()),
                State::Evaluating => return self.partial_exports(scope),
                State::Compiling => {
                    return Err(SandboxError::internal(format!(
                        "{} was required while compiling",
                        self.inner.filename
                    )))
                }
                State::Created => {}
            }
        }
        self.evaluate(scope)
    }

    /// The scope object module code runs against, created on first use.
    pub fn context<'s>(
        &self,
        scope: &mut v8::HandleScope<'s>,
    ) -> Result<v8::Local<'s, v8::Object>, SandboxError> {
        if let Some(context) = self.inner.context.borrow().as_ref() {
            return Ok(v8::Local::new(scope, context));
        }

        let loader = HostLoader::from_scope(scope)?;
        let require = v8::Function::builder(sandbox_require)
            .data(v8::Integer::new_from_unsigned(scope, self.inner.id).into())
            .build(scope)
            .ok_or_else(|| SandboxError::internal("failed to create require function"))?;
        let filename = js_string(scope, &self.inner.filename)?;
        let dirname = js_string(scope, &self.inner.dirname.to_string_lossy())?;

        let created = loader.call_helper(
            scope,
            "createSandboxScope",
            &[filename.into(), dirname.into(), require.into()],
        )?;
        let created = v8::Local::<v8::Object>::try_from(created)
            .map_err(|_| SandboxError::internal("sandbox scope is not an object"))?;
        let context = get_object(scope, created, "scope")?;
        let module = get_object(scope, created, "module")?;

        *self.inner.context.borrow_mut() = Some(v8::Global::new(scope, context));
        *self.inner.module.borrow_mut() = Some(v8::Global::new(scope, module));
        Ok(context)
    }

    /// Resolve `request` the way module code sees it: mocks, then injected
    /// dependencies, then the host loader.
    pub fn require<'s>(
        &self,
        scope: &mut v8::HandleScope<'s>,
        request: &str,
    ) -> Result<v8::Local<'s, v8::Value>, SandboxError> {
        let loader = HostLoader::from_scope(scope)?;
        let parent = &self.inner.dirname;
        let mut unresolved = None;

        if let Some(mocks) = &self.inner.options.mocks {
            let target = match resolver::resolve(request, parent) {
                Some(Resolved::File(path)) => Some(path),
                Some(Resolved::Builtin(_)) => None,
                None => {
                    unresolved = Some(SandboxError::not_found(request, &self.inner.filename));
                    Some(resolve_against(parent, request))
                }
            };
            if let Some(mock) = target.as_deref().and_then(|target| mocks.get(target)) {
                debug!(request, mock = %mock.display(), from = %self.inner.filename, "serving mock");
                let mock = mock.to_string_lossy().into_owned();
                return loader.require(scope, &mock, parent);
            }
        }

        if let Some(dependency) = self.inner.options.dependencies.get(request) {
            trace!(request, from = %self.inner.filename, "serving injected dependency");
            return dependency.to_local(scope);
        }

        if let Some(err) = unresolved {
            return Err(err);
        }

        match resolver::resolve(request, parent) {
            Some(Resolved::Builtin(name)) => loader.builtin(scope, &name),
            Some(Resolved::File(path)) => loader.load(scope, &path),
            None => Err(SandboxError::not_found(request, &self.inner.filename)),
        }
    }

    fn evaluate<'s>(
        &self,
        scope: &mut v8::HandleScope<'s>,
    ) -> Result<v8::Local<'s, v8::Value>, SandboxError> {
        self.set_state(State::Compiling);
        let compiled = match self.compile() {
            Ok(compiled) => compiled,
            Err(err) => return Err(self.fail(err)),
        };

        let loader = match HostLoader::from_scope(scope) {
            Ok(loader) => loader,
            Err(err) => return Err(self.fail(err)),
        };
        let script = match loader.script_factory(scope, &compiled.code, &self.inner.filename) {
            Ok(script) => script,
            Err(err) => return Err(self.fail(err)),
        };

        self.set_state(State::Evaluating);
        match self.run(scope, &script.factory, &script.filename) {
            Ok(exports) => {
                self.set_state(State::Evaluated(v8::Global::new(scope, exports)));
                debug!(module = %self.inner.filename, "sandbox evaluated");
                Ok(exports)
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    fn compile(&self) -> Result<Rc<CompiledSource>, SandboxError> {
        let compiled = match &self.inner.options.compiler {
            Some(compiler) => compiler.compile(&self.inner.source, &self.inner.filename)?,
            None => Rc::new(CompiledSource::code(self.inner.source.clone())),
        };
        *self.inner.compiled.borrow_mut() = Some(Rc::clone(&compiled));
        Ok(compiled)
    }

    fn run<'s>(
        &self,
        scope: &mut v8::HandleScope<'s>,
        factory: &v8::Global<v8::Function>,
        script_name: &str,
    ) -> Result<v8::Local<'s, v8::Value>, SandboxError> {
        let context = self.context(scope)?;
        let module = self.module_object(scope)?;
        let exports = module_exports(scope, module)?;
        let factory = v8::Local::new(scope, factory);

        let tc = &mut v8::TryCatch::new(scope);
        let undefined = v8::undefined(tc).into();
        let Some(body) = factory.call(tc, undefined, &[context.into()]) else {
            return Err(exception::caught(tc, script_name, SANDBOX));
        };
        let body = v8::Local::<v8::Function>::try_from(body)
            .map_err(|_| SandboxError::internal("sandbox body is not a function"))?;
        if body.call(tc, exports, &[]).is_none() {
            return Err(exception::caught(tc, script_name, SANDBOX));
        }

        module_exports(tc, module)
    }

    fn partial_exports<'s>(
        &self,
        scope: &mut v8::HandleScope<'s>,
    ) -> Result<v8::Local<'s, v8::Value>, SandboxError> {
        let module = self.module_object(scope)?;
        module_exports(scope, module)
    }

    fn module_object<'s>(
        &self,
        scope: &mut v8::HandleScope<'s>,
    ) -> Result<v8::Local<'s, v8::Object>, SandboxError> {
        self.inner
            .module
            .borrow()
            .as_ref()
            .map(|module| v8::Local::new(scope, module))
            .ok_or_else(|| SandboxError::internal("sandbox module object missing"))
    }

    fn set_state(&self, state: State) {
        *self.inner.state.borrow_mut() = state;
    }

    fn fail(&self, err: SandboxError) -> SandboxError {
        debug!(module = %self.inner.filename, kind = %err.kind(), "sandbox failed");
        self.set_state(State::Failed(err.clone()));
        err
    }
}

fn get_object<'s>(
    scope: &mut v8::HandleScope<'s>,
    object: v8::Local<v8::Object>,
    key: &str,
) -> Result<v8::Local<'s, v8::Object>, SandboxError> {
    let name = js_string(scope, key)?;
    object
        .get(scope, name.into())
        .and_then(|value| v8::Local::<v8::Object>::try_from(value).ok())
        .ok_or_else(|| SandboxError::internal(format!("sandbox scope has no `{key}`")))
}

fn sandbox_require(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    mut rv: v8::ReturnValue,
) {
    let id = args.data().uint32_value(scope).unwrap_or(0);
    let Some(request) = request_argument(scope, &args) else {
        return;
    };

    let result = match Sandbox::lookup(id) {
        Some(sandbox) => sandbox.require(scope, &request),
        None => Err(SandboxError::internal("require called on a dropped sandbox")),
    };
    match result {
        Ok(value) => rv.set(value),
        Err(err) => exception::throw(scope, &err),
    }
}
