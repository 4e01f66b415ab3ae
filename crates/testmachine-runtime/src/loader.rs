//! CommonJS loader for modules outside the sandboxes.
//!
//! Every `require` that is not answered by a sandbox ends up in
//! [`HostLoader::load`]. The loader holds one optional [`LoadInterceptor`]
//! which sees each resolved path before the module cache does; that slot is
//! how a run redirects known resources into sandboxes.

use crate::error::{PatchError, SandboxError};
use crate::exception;
use crate::resolver::{self, Resolved};
use crate::sandbox::script::{self, HOST};
use deno_core::v8;
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use testmachine_core::Collection;
use testmachine_util::fs::read_to_string_lossy;
use tracing::debug;

/// Hook consulted for every resolved file path.
///
/// Returning `None` lets the loader continue normally.
pub trait LoadInterceptor {
    fn intercept<'s>(
        &self,
        scope: &mut v8::HandleScope<'s>,
        path: &Path,
    ) -> Option<Result<v8::Local<'s, v8::Value>, SandboxError>>;
}

/// A parsed sandbox script, shared by all sandboxes with the same code.
pub(crate) struct CachedScript {
    pub factory: v8::Global<v8::Function>,
    /// Name the script was compiled under, as it appears in stack traces.
    pub filename: String,
}

pub struct HostLoader {
    cwd: PathBuf,
    helpers: RefCell<Option<v8::Global<v8::Object>>>,
    modules: RefCell<HashMap<PathBuf, v8::Global<v8::Object>>>,
    scripts: RefCell<Collection<Rc<CachedScript>>>,
    interceptor: RefCell<Option<Rc<dyn LoadInterceptor>>>,
}

impl std::fmt::Debug for HostLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostLoader")
            .field("cwd", &self.cwd)
            .field("modules", &self.modules.borrow().len())
            .field("scripts", &self.scripts.borrow().len())
            .field("intercepted", &self.is_intercepted())
            .finish()
    }
}

impl HostLoader {
    pub(crate) fn new(cwd: PathBuf, helpers: v8::Global<v8::Object>) -> Self {
        Self {
            cwd,
            helpers: RefCell::new(Some(helpers)),
            modules: RefCell::new(HashMap::new()),
            scripts: RefCell::new(Collection::hashed()),
            interceptor: RefCell::new(None),
        }
    }

    /// The loader of the isolate `scope` belongs to.
    pub fn from_scope(scope: &mut v8::HandleScope) -> Result<Rc<Self>, SandboxError> {
        scope
            .get_slot::<Rc<HostLoader>>()
            .cloned()
            .ok_or_else(|| SandboxError::internal("no host loader bound to this isolate"))
    }

    #[must_use]
    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Install `interceptor`. Installing the same interceptor twice is a
    /// no-op; a different one is refused while the slot is taken.
    pub fn install(&self, interceptor: Rc<dyn LoadInterceptor>) -> Result<(), PatchError> {
        let mut slot = self.interceptor.borrow_mut();
        match slot.as_ref() {
            Some(current) if same_interceptor(current, &interceptor) => Ok(()),
            Some(_) => Err(PatchError::AlreadyInstalled),
            None => {
                *slot = Some(interceptor);
                debug!("load interceptor installed");
                Ok(())
            }
        }
    }

    /// Remove `interceptor` if it is the installed one. Returns whether
    /// anything was removed.
    pub fn uninstall(&self, interceptor: &Rc<dyn LoadInterceptor>) -> bool {
        let mut slot = self.interceptor.borrow_mut();
        match slot.as_ref() {
            Some(current) if same_interceptor(current, interceptor) => {
                *slot = None;
                debug!("load interceptor removed");
                true
            }
            _ => false,
        }
    }

    #[must_use]
    pub fn is_intercepted(&self) -> bool {
        self.interceptor.borrow().is_some()
    }

    /// Resolve and load `request` as seen from `parent_dir`.
    pub fn require<'s>(
        &self,
        scope: &mut v8::HandleScope<'s>,
        request: &str,
        parent_dir: &Path,
    ) -> Result<v8::Local<'s, v8::Value>, SandboxError> {
        match resolver::resolve(request, parent_dir) {
            Some(Resolved::Builtin(name)) => self.builtin(scope, &name),
            Some(Resolved::File(path)) => self.load(scope, &path),
            None => Err(SandboxError::not_found(request, parent_dir.display())),
        }
    }

    /// Load a resolved file: interceptor first, then the module cache, then
    /// a fresh evaluation.
    pub fn load<'s>(
        &self,
        scope: &mut v8::HandleScope<'s>,
        path: &Path,
    ) -> Result<v8::Local<'s, v8::Value>, SandboxError> {
        let interceptor = self.interceptor.borrow().clone();
        if let Some(interceptor) = interceptor {
            if let Some(result) = interceptor.intercept(scope, path) {
                return result;
            }
        }

        let cached = self
            .modules
            .borrow()
            .get(path)
            .map(|module| v8::Local::new(scope, module));
        if let Some(module) = cached {
            return module_exports(scope, module);
        }

        self.evaluate_file(scope, path)
    }

    /// Exports of a runtime built-in module.
    pub fn builtin<'s>(
        &self,
        scope: &mut v8::HandleScope<'s>,
        name: &str,
    ) -> Result<v8::Local<'s, v8::Value>, SandboxError> {
        let name = js_string(scope, name)?;
        self.call_helper(scope, "builtin", &[name.into()])
    }

    /// Drop `path` from the module cache. Returns whether it was cached.
    pub fn remove_from_cache(&self, path: &Path) -> bool {
        self.modules.borrow_mut().remove(path).is_some()
    }

    #[must_use]
    pub fn is_cached(&self, path: &Path) -> bool {
        self.modules.borrow().contains_key(path)
    }

    #[must_use]
    pub fn cached_modules(&self) -> usize {
        self.modules.borrow().len()
    }

    #[must_use]
    pub fn cached_scripts(&self) -> usize {
        self.scripts.borrow().len()
    }

    /// Forget every parsed sandbox script.
    pub fn clear_script_cache(&self) {
        self.scripts.borrow_mut().clear();
    }

    /// Parsed sandbox wrapper for `code`, compiled under `filename` on a miss.
    ///
    /// Sandboxes with identical compiled code share one parsed script, so
    /// stack traces name the file that was compiled first. Callers locate
    /// failures through [`CachedScript::filename`] and report them under
    /// their own resource.
    pub(crate) fn script_factory(
        &self,
        scope: &mut v8::HandleScope,
        code: &str,
        filename: &str,
    ) -> Result<Rc<CachedScript>, SandboxError> {
        if let Some(cached) = self.scripts.borrow().get(code) {
            return Ok(Rc::clone(cached));
        }

        let function = script::SANDBOX.compile(scope, code, filename)?;
        let cached = Rc::new(CachedScript {
            factory: v8::Global::new(scope, function),
            filename: filename.to_string(),
        });
        self.scripts.borrow_mut().set(code, Rc::clone(&cached));
        Ok(cached)
    }

    /// Call a bootstrap helper with the helper object as receiver.
    pub(crate) fn call_helper<'s>(
        &self,
        scope: &mut v8::HandleScope<'s>,
        name: &str,
        args: &[v8::Local<'s, v8::Value>],
    ) -> Result<v8::Local<'s, v8::Value>, SandboxError> {
        let helpers = self
            .helpers
            .borrow()
            .as_ref()
            .map(|helpers| v8::Local::new(scope, helpers))
            .ok_or_else(|| SandboxError::internal("host loader was released"))?;

        let key = js_string(scope, name)?;
        let function = helpers
            .get(scope, key.into())
            .and_then(|value| v8::Local::<v8::Function>::try_from(value).ok())
            .ok_or_else(|| SandboxError::internal(format!("missing runtime helper `{name}`")))?;

        let tc = &mut v8::TryCatch::new(scope);
        function
            .call(tc, helpers.into(), args)
            .ok_or_else(|| exception::caught(tc, "", HOST))
    }

    /// Drop every V8 handle. Called before the isolate goes away.
    pub(crate) fn release(&self) {
        self.interceptor.borrow_mut().take();
        self.modules.borrow_mut().clear();
        self.scripts.borrow_mut().clear();
        self.helpers.borrow_mut().take();
    }

    fn evaluate_file<'s>(
        &self,
        scope: &mut v8::HandleScope<'s>,
        path: &Path,
    ) -> Result<v8::Local<'s, v8::Value>, SandboxError> {
        let filename = path.to_string_lossy().into_owned();
        let source = read_to_string_lossy(path).map_err(|e| SandboxError::Reference {
            message: format!("Cannot read module '{filename}': {e}"),
            location: None,
        })?;

        let name = js_string(scope, &filename)?;
        let module = self.call_helper(scope, "createHostModule", &[name.into()])?;
        let module = v8::Local::<v8::Object>::try_from(module)
            .map_err(|_| SandboxError::internal("host module is not an object"))?;

        // Cached before evaluation so that cycles see the partial exports.
        self.modules
            .borrow_mut()
            .insert(path.to_path_buf(), v8::Global::new(scope, module));

        let is_json = path.extension().is_some_and(|ext| ext == "json");
        let result = if is_json {
            evaluate_json(scope, module, &source, &filename)
        } else {
            self.evaluate_js(scope, module, &source, path, &filename)
        };

        if let Err(err) = result {
            self.modules.borrow_mut().remove(path);
            debug!(module = %filename, kind = %err.kind(), "host module failed");
            return Err(err);
        }

        set_value(scope, module, "loaded", v8::Boolean::new(scope, true).into());
        debug!(module = %filename, "host module loaded");
        module_exports(scope, module)
    }

    fn evaluate_js<'s>(
        &self,
        scope: &mut v8::HandleScope<'s>,
        module: v8::Local<'s, v8::Object>,
        source: &str,
        path: &Path,
        filename: &str,
    ) -> Result<(), SandboxError> {
        let function = HOST.compile(scope, source, filename)?;

        let dirname = path.parent().unwrap_or(path);
        let exports = module_exports(scope, module)?;
        let require = create_require(scope, dirname)?;
        let filename_value = js_string(scope, filename)?;
        let dirname_value = js_string(scope, &dirname.to_string_lossy())?;
        let args = [
            exports,
            require.into(),
            module.into(),
            filename_value.into(),
            dirname_value.into(),
        ];

        let tc = &mut v8::TryCatch::new(scope);
        if function.call(tc, exports, &args).is_none() {
            return Err(exception::caught(tc, filename, HOST));
        }
        Ok(())
    }
}

fn same_interceptor(a: &Rc<dyn LoadInterceptor>, b: &Rc<dyn LoadInterceptor>) -> bool {
    std::ptr::eq(
        Rc::as_ptr(a).cast::<()>(),
        Rc::as_ptr(b).cast::<()>(),
    )
}

fn evaluate_json(
    scope: &mut v8::HandleScope,
    module: v8::Local<v8::Object>,
    source: &str,
    filename: &str,
) -> Result<(), SandboxError> {
    let text = js_string(scope, source)?;
    let tc = &mut v8::TryCatch::new(scope);
    let Some(value) = v8::json::parse(tc, text) else {
        let detail = tc
            .exception()
            .map(|e| e.to_rust_string_lossy(tc))
            .unwrap_or_default();
        return Err(SandboxError::Syntax {
            filename: filename.to_string(),
            message: format!("{filename}: {detail}"),
            location: None,
        });
    };
    set_value(tc, module, "exports", value);
    Ok(())
}

/// `require` function for host modules living in `dirname`.
pub(crate) fn create_require<'s>(
    scope: &mut v8::HandleScope<'s>,
    dirname: &Path,
) -> Result<v8::Local<'s, v8::Function>, SandboxError> {
    let data = js_string(scope, &dirname.to_string_lossy())?;
    v8::Function::builder(host_require)
        .data(data.into())
        .build(scope)
        .ok_or_else(|| SandboxError::internal("failed to create require function"))
}

fn host_require(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    mut rv: v8::ReturnValue,
) {
    let parent_dir = PathBuf::from(args.data().to_rust_string_lossy(scope));
    let Some(request) = request_argument(scope, &args) else {
        return;
    };

    let result = HostLoader::from_scope(scope)
        .and_then(|loader| loader.require(scope, &request, &parent_dir));
    match result {
        Ok(value) => rv.set(value),
        Err(err) => exception::throw(scope, &err),
    }
}

/// First argument of a `require` call as a string, or a thrown `TypeError`.
pub(crate) fn request_argument(
    scope: &mut v8::HandleScope,
    args: &v8::FunctionCallbackArguments,
) -> Option<String> {
    let request = args.get(0);
    if request.is_string() {
        return Some(request.to_rust_string_lossy(scope));
    }
    let message = v8::String::new(scope, "The \"id\" argument must be of type string")
        .unwrap_or_else(|| v8::String::empty(scope));
    let exception = v8::Exception::type_error(scope, message);
    scope.throw_exception(exception);
    None
}

pub(crate) fn js_string<'s>(
    scope: &mut v8::HandleScope<'s>,
    value: &str,
) -> Result<v8::Local<'s, v8::String>, SandboxError> {
    v8::String::new(scope, value)
        .ok_or_else(|| SandboxError::internal("string too large for V8"))
}

pub(crate) fn module_exports<'s>(
    scope: &mut v8::HandleScope<'s>,
    module: v8::Local<v8::Object>,
) -> Result<v8::Local<'s, v8::Value>, SandboxError> {
    let key = js_string(scope, "exports")?;
    module
        .get(scope, key.into())
        .ok_or_else(|| SandboxError::internal("failed to read module.exports"))
}

pub(crate) fn set_value(
    scope: &mut v8::HandleScope,
    object: v8::Local<v8::Object>,
    key: &str,
    value: v8::Local<v8::Value>,
) {
    if let Some(key) = v8::String::new(scope, key) {
        object.set(scope, key.into(), value);
    }
}
