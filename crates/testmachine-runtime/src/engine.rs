//! Test engines.
//!
//! An [`Engine`] receives the host and the selected test files once the
//! environment is patched. [`SpecEngine`] is the built-in `describe`/`it`
//! runner driven by the bootstrap.

use crate::error::SandboxError;
use crate::runtime::{JsHost, RuntimeError};
use futures::future::{FutureExt, LocalBoxFuture};
use serde::Deserialize;
use std::cell::RefCell;
use std::fmt;
use std::path::PathBuf;
use tracing::{debug, info};

/// A failing test as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TestFailure {
    pub title: String,
    pub message: String,
}

impl fmt::Display for TestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\n{}", self.title, self.message)
    }
}

/// Totals of one engine run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SpecReport {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub pending: usize,
    pub failures: Vec<TestFailure>,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Failed to load test {}: {source}", test.display())]
    Load {
        test: PathBuf,
        #[source]
        source: SandboxError,
    },

    #[error("{failed} of {total} tests failed{}", list_failures(failures))]
    Failed {
        failed: usize,
        total: usize,
        failures: Vec<TestFailure>,
    },

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

fn list_failures(failures: &[TestFailure]) -> String {
    failures
        .iter()
        .enumerate()
        .map(|(i, failure)| format!("\n\n  {}) {failure}", i + 1))
        .collect()
}

/// Runs test files inside a patched host.
pub trait Engine {
    /// Run `tests`. An empty list must resolve without touching the host.
    fn run<'a>(
        &'a self,
        host: &'a mut JsHost,
        tests: &'a [PathBuf],
    ) -> LocalBoxFuture<'a, Result<(), EngineError>>;
}

/// `describe`/`it` engine backed by the bootstrap's spec registry.
#[derive(Debug, Default)]
pub struct SpecEngine {
    last_report: RefCell<Option<SpecReport>>,
}

impl SpecEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Report of the most recent non-empty run.
    #[must_use]
    pub fn last_report(&self) -> Option<SpecReport> {
        self.last_report.borrow().clone()
    }

    async fn run_tests(&self, host: &mut JsHost, tests: &[PathBuf]) -> Result<(), EngineError> {
        host.execute_script("<testmachine:spec>", "__testmachine.spec.reset()")?;

        for test in tests {
            debug!(test = %test.display(), "loading test file");
            host.load(test).map_err(|source| EngineError::Load {
                test: test.clone(),
                source,
            })?;
        }

        host.execute_script("<testmachine:spec>", "__testmachine.spec.start()")?;
        host.run_event_loop().await?;

        let json = host.eval_to_string("__testmachine.spec.takeReport()")?;
        let report: Option<SpecReport> = serde_json::from_str(&json)
            .map_err(|e| RuntimeError::JavaScript(format!("Malformed spec report: {e}")))?;
        let report = report.ok_or_else(|| {
            RuntimeError::JavaScript("Spec run did not settle before the event loop drained".into())
        })?;

        info!(
            tests = report.total,
            passed = report.passed,
            failed = report.failed,
            pending = report.pending,
            "spec run finished"
        );
        *self.last_report.borrow_mut() = Some(report.clone());

        if report.failed > 0 {
            return Err(EngineError::Failed {
                failed: report.failed,
                total: report.total,
                failures: report.failures,
            });
        }
        Ok(())
    }
}

impl Engine for SpecEngine {
    fn run<'a>(
        &'a self,
        host: &'a mut JsHost,
        tests: &'a [PathBuf],
    ) -> LocalBoxFuture<'a, Result<(), EngineError>> {
        async move {
            if tests.is_empty() {
                return Ok(());
            }
            self.run_tests(host, tests).await
        }
        .boxed_local()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::HostOptions;
    use std::fs;

    fn host_in(dir: &std::path::Path) -> JsHost {
        JsHost::new(HostOptions {
            cwd: Some(dir.to_path_buf()),
        })
        .unwrap()
    }

    fn write(dir: &std::path::Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, body).unwrap();
        dunce::canonicalize(path).unwrap()
    }

    #[tokio::test]
    async fn test_empty_run_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut host = host_in(dir.path());
        let engine = SpecEngine::new();
        engine.run(&mut host, &[]).await.unwrap();
        assert!(engine.last_report().is_none());
    }

    #[tokio::test]
    async fn test_passing_suite() {
        let dir = tempfile::tempdir().unwrap();
        let test = write(
            dir.path(),
            "math.spec.js",
            r"
            const assert = require('assert');
            describe('math', () => {
              let base;
              beforeEach(() => { base = 40; });
              it('adds', () => assert.strictEqual(base + 2, 42));
              it('waits', () => new Promise((r) => setTimeout(r, 5)));
              it('calls done', (done) => setTimeout(done, 1));
              xit('later');
            });
            ",
        );
        let mut host = host_in(dir.path());
        let engine = SpecEngine::new();
        engine.run(&mut host, &[test]).await.unwrap();

        let report = engine.last_report().unwrap();
        assert_eq!(report.total, 3);
        assert_eq!(report.passed, 3);
        assert_eq!(report.pending, 1);
    }

    #[tokio::test]
    async fn test_failures_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let test = write(
            dir.path(),
            "broken.spec.js",
            r"
            const assert = require('assert');
            describe('broken', () => {
              it('passes', () => {});
              it('fails', () => assert.equal(1, 2));
            });
            ",
        );
        let mut host = host_in(dir.path());
        let err = SpecEngine::new().run(&mut host, &[test]).await.unwrap_err();
        match err {
            EngineError::Failed { failed, total, failures } => {
                assert_eq!((failed, total), (1, 2));
                assert_eq!(failures[0].title, "broken fails");
                assert!(failures[0].message.contains("1 == 2"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_load_failure() {
        let dir = tempfile::tempdir().unwrap();
        let test = write(dir.path(), "bad.spec.js", "describe('x', () => {");
        let mut host = host_in(dir.path());
        let err = SpecEngine::new().run(&mut host, &[test.clone()]).await.unwrap_err();
        assert!(matches!(err, EngineError::Load { test: t, .. } if t == test));
    }
}
