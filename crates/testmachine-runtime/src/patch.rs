//! Redirection of host `require` calls into sandboxes for the length of a run.

use crate::controller::SandboxController;
use crate::error::{PatchError, SandboxError};
use crate::loader::{HostLoader, LoadInterceptor};
use crate::resolver::{self, Resolved};
use deno_core::v8;
use std::cell::RefCell;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use testmachine_core::{Mocks, ModuleGraph};
use tracing::{debug, info};

/// Load interceptor serving graph modules and test files from the
/// controller. Installed by [`EnvironmentPatch::setup`], removed by
/// [`EnvironmentPatch::clean`].
#[derive(Debug)]
pub struct EnvironmentPatch {
    controller: Rc<SandboxController>,
    dependencies: Vec<String>,
    mocks: Option<Rc<Mocks>>,
    tests: RefCell<HashSet<PathBuf>>,
}

impl EnvironmentPatch {
    #[must_use]
    pub fn new(
        controller: Rc<SandboxController>,
        dependencies: Vec<String>,
        mocks: Option<Rc<Mocks>>,
    ) -> Self {
        Self {
            controller,
            dependencies,
            mocks,
            tests: RefCell::new(HashSet::new()),
        }
    }

    #[must_use]
    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    /// Install the interceptor for `graph` and `tests`, then require every
    /// global dependency from the loader's working directory.
    pub fn setup(
        self: &Rc<Self>,
        scope: &mut v8::HandleScope,
        loader: &HostLoader,
        graph: Rc<ModuleGraph>,
        tests: &[PathBuf],
    ) -> Result<(), PatchError> {
        loader.install(self.as_interceptor())?;
        self.controller.set_graph(graph);
        self.tests.borrow_mut().extend(tests.iter().cloned());

        for request in &self.dependencies {
            loader
                .require(scope, request, loader.cwd())
                .map_err(|source| PatchError::Dependency {
                    request: request.clone(),
                    source,
                })?;
            debug!(dependency = %request, "global dependency loaded");
        }
        Ok(())
    }

    /// Remove the interceptor and purge the host cache entries a run leaves
    /// behind: test files, global dependencies and mock targets.
    pub fn clean(self: &Rc<Self>, loader: &HostLoader, tests: &[PathBuf]) {
        self.controller.set_graph(Rc::new(ModuleGraph::default()));
        self.tests.borrow_mut().clear();
        loader.uninstall(&self.as_interceptor());

        let mut purged = 0usize;
        for test in tests {
            purged += usize::from(loader.remove_from_cache(test));
        }
        for request in &self.dependencies {
            if let Some(Resolved::File(path)) = resolver::resolve(request, loader.cwd()) {
                purged += usize::from(loader.remove_from_cache(&path));
            }
        }
        if let Some(mocks) = &self.mocks {
            for target in mocks.targets() {
                let resolved = resolver::resolve(&target.to_string_lossy(), loader.cwd());
                if let Some(path) = resolved.as_ref().and_then(Resolved::as_file) {
                    purged += usize::from(loader.remove_from_cache(path));
                }
            }
        }
        info!(count = purged, "environment restored");
    }

    fn as_interceptor(self: &Rc<Self>) -> Rc<dyn LoadInterceptor> {
        Rc::clone(self) as Rc<dyn LoadInterceptor>
    }
}

impl LoadInterceptor for EnvironmentPatch {
    fn intercept<'s>(
        &self,
        scope: &mut v8::HandleScope<'s>,
        path: &Path,
    ) -> Option<Result<v8::Local<'s, v8::Value>, SandboxError>> {
        let resource = path.to_string_lossy();
        if self.controller.graph().contains(&resource) {
            return Some(self.controller.exports(scope, &resource));
        }
        if self.tests.borrow().contains(path) {
            return Some(self.controller.get_test(scope, path));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{HostOptions, JsHost};
    use std::fs;
    use testmachine_core::{BuildModule, Compiler};

    fn patch(dependencies: Vec<String>) -> Rc<EnvironmentPatch> {
        let controller = Rc::new(SandboxController::new(Rc::new(Compiler::new()), None));
        Rc::new(EnvironmentPatch::new(controller, dependencies, None))
    }

    fn require_string(host: &mut JsHost, request: &str) -> String {
        let value = host.require(request).unwrap();
        let scope = &mut host.handle_scope();
        v8::Local::new(scope, value).to_rust_string_lossy(scope)
    }

    fn setup(
        host: &mut JsHost,
        patch: &Rc<EnvironmentPatch>,
        graph: ModuleGraph,
        tests: &[PathBuf],
    ) -> Result<(), PatchError> {
        let loader = Rc::clone(host.loader());
        let scope = &mut host.handle_scope();
        patch.setup(scope, &loader, Rc::new(graph), tests)
    }

    #[tokio::test]
    async fn test_graph_modules_redirected_until_clean() {
        let dir = tempfile::tempdir().unwrap();
        let root = dunce::canonicalize(dir.path()).unwrap();
        let file = root.join("a.js");
        fs::write(&file, "module.exports = 'disk';").unwrap();
        let graph = ModuleGraph::from_modules(&[BuildModule::new(
            file.to_string_lossy(),
            "module.exports = 'sandboxed';",
        )]);

        let mut host = JsHost::new(HostOptions { cwd: Some(root) }).unwrap();
        let patch = patch(Vec::new());
        setup(&mut host, &patch, graph, &[]).unwrap();
        assert_eq!(require_string(&mut host, "./a"), "sandboxed");

        patch.clean(host.loader(), &[]);
        assert!(!host.loader().is_intercepted());
        assert_eq!(require_string(&mut host, "./a"), "disk");
    }

    #[tokio::test]
    async fn test_second_patch_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let mut host = JsHost::new(HostOptions {
            cwd: Some(dir.path().to_path_buf()),
        })
        .unwrap();
        let first = patch(Vec::new());
        let second = patch(Vec::new());

        setup(&mut host, &first, ModuleGraph::default(), &[]).unwrap();
        setup(&mut host, &first, ModuleGraph::default(), &[]).unwrap();
        assert!(matches!(
            setup(&mut host, &second, ModuleGraph::default(), &[]),
            Err(PatchError::AlreadyInstalled)
        ));

        second.clean(host.loader(), &[]);
        assert!(host.loader().is_intercepted());
        first.clean(host.loader(), &[]);
        assert!(!host.loader().is_intercepted());
    }

    #[tokio::test]
    async fn test_dependencies_purged_on_clean() {
        let dir = tempfile::tempdir().unwrap();
        let root = dunce::canonicalize(dir.path()).unwrap();
        fs::write(root.join("setup.js"), "globalThis.ready = true;").unwrap();
        let test = root.join("x.spec.js");
        fs::write(&test, "module.exports = 'test';").unwrap();

        let mut host = JsHost::new(HostOptions {
            cwd: Some(root.clone()),
        })
        .unwrap();
        let patch = patch(vec!["./setup".to_string()]);
        setup(&mut host, &patch, ModuleGraph::default(), &[test.clone()]).unwrap();

        assert_eq!(host.eval_to_string("ready").unwrap(), "true");
        assert!(host.loader().is_cached(&root.join("setup.js")));
        host.load(&test).unwrap();
        assert!(!host.loader().is_cached(&test));

        patch.clean(host.loader(), &[test]);
        assert!(!host.loader().is_cached(&root.join("setup.js")));
    }
}
