//! Per-run table of sandboxes built from the module graph.

use crate::error::SandboxError;
use crate::sandbox::{Dependency, Sandbox, SandboxOptions};
use deno_core::v8;
use std::cell::{Ref, RefCell};
use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;
use testmachine_core::{code_frame, Collection, Compiler, Mocks, ModuleGraph, TestModule};
use testmachine_util::fs::read_to_string_lossy;
use tracing::{debug, trace};

/// Builds sandboxes for graph modules, dependencies first, and memoizes them
/// by resource until [`SandboxController::clear`].
#[derive(Debug)]
pub struct SandboxController {
    compiler: Rc<Compiler>,
    mocks: Option<Rc<Mocks>>,
    graph: RefCell<Rc<ModuleGraph>>,
    modules: RefCell<Collection<Sandbox>>,
    in_progress: RefCell<Vec<String>>,
}

impl SandboxController {
    #[must_use]
    pub fn new(compiler: Rc<Compiler>, mocks: Option<Rc<Mocks>>) -> Self {
        Self {
            compiler,
            mocks,
            graph: RefCell::new(Rc::new(ModuleGraph::default())),
            modules: RefCell::new(Collection::new()),
            in_progress: RefCell::new(Vec::new()),
        }
    }

    /// Graph the next lookups are answered from.
    pub fn set_graph(&self, graph: Rc<ModuleGraph>) {
        *self.graph.borrow_mut() = graph;
    }

    #[must_use]
    pub fn graph(&self) -> Rc<ModuleGraph> {
        Rc::clone(&self.graph.borrow())
    }

    /// Sandboxes created since the last [`SandboxController::clear`].
    #[must_use]
    pub fn resolved_modules(&self) -> Ref<'_, Collection<Sandbox>> {
        self.modules.borrow()
    }

    /// Drop the per-run table.
    pub fn clear(&self) {
        self.modules.borrow_mut().clear();
        self.in_progress.borrow_mut().clear();
    }

    /// Sandbox for a graph module, built and evaluated on first use.
    pub fn get_module(
        &self,
        scope: &mut v8::HandleScope,
        resource: &str,
    ) -> Result<Sandbox, SandboxError> {
        let cached = self.modules.borrow().get(resource).cloned();
        if let Some(sandbox) = cached {
            return match sandbox.get_exports(scope) {
                Ok(_) => Ok(sandbox),
                Err(err) => Err(self.annotate(&sandbox, err)),
            };
        }

        if self.in_progress.borrow().iter().any(|r| r == resource) {
            let chain = {
                let mut chain = self.in_progress.borrow().clone();
                chain.push(resource.to_string());
                chain.join(" -> ")
            };
            return Err(SandboxError::Reference {
                message: format!("Cannot require '{resource}' while it is being built: {chain}"),
                location: None,
            });
        }

        let graph = self.graph();
        let Some(module) = graph.get(resource) else {
            return Err(SandboxError::Reference {
                message: format!("Module '{resource}' is not part of the build"),
                location: None,
            });
        };

        self.in_progress.borrow_mut().push(resource.to_string());
        let result = self.build(scope, module);
        self.in_progress.borrow_mut().pop();
        result
    }

    /// Exports of a graph module.
    pub fn exports<'s>(
        &self,
        scope: &mut v8::HandleScope<'s>,
        resource: &str,
    ) -> Result<v8::Local<'s, v8::Value>, SandboxError> {
        let sandbox = self.get_module(scope, resource)?;
        sandbox
            .get_exports(scope)
            .map_err(|err| self.annotate(&sandbox, err))
    }

    /// Exports of a test file, read from disk and sandboxed without injected
    /// dependencies.
    pub fn get_test<'s>(
        &self,
        scope: &mut v8::HandleScope<'s>,
        path: &Path,
    ) -> Result<v8::Local<'s, v8::Value>, SandboxError> {
        let resource = path.to_string_lossy().into_owned();
        let cached = self.modules.borrow().get(&resource).cloned();
        let sandbox = match cached {
            Some(sandbox) => sandbox,
            None => {
                let source = read_to_string_lossy(path).map_err(|e| SandboxError::Reference {
                    message: format!("Cannot read test '{resource}': {e}"),
                    location: None,
                })?;
                let sandbox = Sandbox::new(source, resource.clone(), self.options(HashMap::new()));
                self.modules.borrow_mut().set(&resource, sandbox.clone());
                debug!(test = %resource, "sandboxed test");
                sandbox
            }
        };

        sandbox
            .get_exports(scope)
            .map_err(|err| self.annotate(&sandbox, err))
    }

    fn build(&self, scope: &mut v8::HandleScope, module: &TestModule) -> Result<Sandbox, SandboxError> {
        let mut dependencies = HashMap::new();
        for dependency in &module.dependencies {
            if self.in_progress.borrow().contains(&dependency.resource) {
                trace!(
                    resource = %module.resource,
                    dependency = %dependency.resource,
                    "skipping dependency already being built"
                );
                continue;
            }
            let exports = self.exports(scope, &dependency.resource)?;
            dependencies.insert(
                dependency.request.clone(),
                Dependency::Value(v8::Global::new(scope, exports)),
            );
        }

        let sandbox = Sandbox::new(
            module.source.clone(),
            module.resource.clone(),
            self.options(dependencies),
        );
        self.modules.borrow_mut().set(&module.resource, sandbox.clone());
        debug!(resource = %module.resource, "sandboxed module");

        match sandbox.get_exports(scope) {
            Ok(_) => Ok(sandbox),
            Err(err) => Err(self.annotate(&sandbox, err)),
        }
    }

    fn options(&self, dependencies: HashMap<String, Dependency>) -> SandboxOptions {
        SandboxOptions {
            compiler: Some(Rc::clone(&self.compiler)),
            dependencies,
            mocks: self.mocks.clone(),
        }
    }

    /// Attach the resource and a code frame around the failure, taken from
    /// the compiled source when compilation got that far.
    fn annotate(&self, sandbox: &Sandbox, err: SandboxError) -> SandboxError {
        let frame = err
            .location()
            .map(|location| match sandbox.compiled_source() {
                Some(compiled) => code_frame(&compiled.code, location),
                None => code_frame(sandbox.source(), location),
            })
            .unwrap_or_default();
        err.annotate(sandbox.filename(), frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{HostOptions, JsHost};
    use testmachine_core::BuildModule;

    fn host() -> JsHost {
        JsHost::new(HostOptions::default()).unwrap()
    }

    fn controller(modules: &[BuildModule]) -> SandboxController {
        let controller = SandboxController::new(Rc::new(Compiler::new()), None);
        controller.set_graph(Rc::new(ModuleGraph::from_modules(modules)));
        controller
    }

    #[tokio::test]
    async fn test_modules_memoized_until_clear() {
        let mut host = host();
        let controller = controller(&[BuildModule::new("/virtual/a.js", "module.exports = {};")]);
        let scope = &mut host.handle_scope();

        let first = controller.get_module(scope, "/virtual/a.js").unwrap();
        let second = controller.get_module(scope, "/virtual/a.js").unwrap();
        assert!(first.ptr_eq(&second));
        assert_eq!(controller.resolved_modules().len(), 1);

        controller.clear();
        assert!(controller.resolved_modules().is_empty());
        let third = controller.get_module(scope, "/virtual/a.js").unwrap();
        assert!(!third.ptr_eq(&first));
    }

    #[tokio::test]
    async fn test_failure_carries_code_frame() {
        let mut host = host();
        let controller = controller(&[BuildModule::new(
            "/virtual/broken.js",
            "const ok = 1;\nnull.boom;\nmodule.exports = ok;\n",
        )]);
        let scope = &mut host.handle_scope();

        let err = controller.get_module(scope, "/virtual/broken.js").unwrap_err();
        assert_eq!(err.kind(), crate::error::FailureKind::Eval);
        match &err {
            SandboxError::Module { resource, frame, .. } => {
                assert_eq!(resource, "/virtual/broken.js");
                assert!(frame.contains("null.boom"));
            }
            other => panic!("expected annotated failure, got {other:?}"),
        }

        let again = controller.get_module(scope, "/virtual/broken.js").unwrap_err();
        assert_eq!(again.to_string(), err.to_string());
    }

    #[tokio::test]
    async fn test_unknown_resource_is_reference_failure() {
        let mut host = host();
        let controller = controller(&[]);
        let scope = &mut host.handle_scope();
        let err = controller.get_module(scope, "/virtual/nope.js").unwrap_err();
        assert_eq!(err.kind(), crate::error::FailureKind::Reference);
    }

    #[tokio::test]
    async fn test_dependencies_built_first() {
        let mut host = host();
        let controller = controller(&[
            BuildModule::new("/virtual/main.js", "module.exports = require('./dep') + 1;").with_dependency(
                testmachine_core::BuildDependency::module("./dep", "/virtual/dep.js"),
            ),
            BuildModule::new("/virtual/dep.js", "module.exports = 41;"),
        ]);
        let scope = &mut host.handle_scope();

        let exports = controller.exports(scope, "/virtual/main.js").unwrap();
        assert_eq!(exports.number_value(scope), Some(42.0));
        assert_eq!(controller.resolved_modules().len(), 2);
    }
}
