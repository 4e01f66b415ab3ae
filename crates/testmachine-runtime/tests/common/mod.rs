//! Shared fixtures for the runtime integration tests.

#![allow(dead_code)]

use deno_core::v8;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Once;
use testmachine_runtime::{HostOptions, JsHost, Sandbox, SandboxError};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

static TRACING: Once = Once::new();

/// Opt-in log output: `RUST_LOG=testmachine_runtime=debug cargo test`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("off"));
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_test_writer())
            .try_init();
    });
}

/// A throwaway project directory.
pub struct Project {
    dir: tempfile::TempDir,
}

impl Project {
    pub fn new() -> Self {
        init_tracing();
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    /// Canonical project root.
    pub fn root(&self) -> PathBuf {
        dunce::canonicalize(self.dir.path()).unwrap()
    }

    /// Write `body` to `relative`, creating parent directories. Returns the
    /// canonical path.
    pub fn write(&self, relative: &str, body: &str) -> PathBuf {
        let path = self.root().join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, body).unwrap();
        dunce::canonicalize(path).unwrap()
    }

    /// Canonical path of a file that may not exist yet.
    pub fn path(&self, relative: &str) -> PathBuf {
        self.root().join(relative)
    }

    pub fn resource(&self, relative: &str) -> String {
        self.path(relative).to_string_lossy().into_owned()
    }

    pub fn host(&self) -> JsHost {
        JsHost::new(HostOptions {
            cwd: Some(self.root()),
        })
        .unwrap()
    }
}

pub fn to_json(scope: &mut v8::HandleScope, value: v8::Local<v8::Value>) -> serde_json::Value {
    let text = v8::json::stringify(scope, value).unwrap();
    serde_json::from_str(&text.to_rust_string_lossy(scope)).unwrap()
}

/// Exports of `sandbox` as JSON.
pub fn exports_json(host: &mut JsHost, sandbox: &Sandbox) -> Result<serde_json::Value, SandboxError> {
    let scope = &mut host.handle_scope();
    let exports = sandbox.get_exports(scope)?;
    Ok(to_json(scope, exports))
}

pub fn file_name(path: &Path) -> String {
    path.file_name().unwrap().to_string_lossy().into_owned()
}
