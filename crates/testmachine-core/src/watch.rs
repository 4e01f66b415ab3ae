//! Watcher that flags the selection cache as stale when test roots change.
//!
//! Adding, removing or renaming a test file changes which files a glob
//! matches, which the selection cache cannot notice on its own. The watcher
//! only raises a flag; the owner clears its cache before the next run.

use crate::error::{Error, Result};
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Poll interval for backends that need one.
const POLL_INTERVAL_MS: u64 = 500;

/// Recursive watcher over the test roots.
pub struct TestWatcher {
    roots: Vec<PathBuf>,
    stale: Arc<AtomicBool>,
    _watcher: RecommendedWatcher,
}

impl std::fmt::Debug for TestWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestWatcher")
            .field("roots", &self.roots)
            .field("stale", &self.stale.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl TestWatcher {
    /// Start watching. Roots that do not exist yet are skipped.
    pub fn start(roots: &[PathBuf]) -> Result<Self> {
        let stale = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stale);

        let mut watcher = RecommendedWatcher::new(
            move |res: std::result::Result<Event, notify::Error>| match res {
                Ok(event) => {
                    if affects_selection(&event.kind) {
                        flag.store(true, Ordering::Release);
                    }
                }
                Err(e) => warn!(error = %e, "test watcher error"),
            },
            NotifyConfig::default().with_poll_interval(Duration::from_millis(POLL_INTERVAL_MS)),
        )
        .map_err(|e| Error::Watch {
            path: roots.first().cloned().unwrap_or_default(),
            message: e.to_string(),
        })?;

        let mut watched = Vec::new();
        for root in roots {
            if !root.is_dir() {
                debug!(root = %root.display(), "skipping missing test root");
                continue;
            }
            watcher
                .watch(root, RecursiveMode::Recursive)
                .map_err(|e| Error::Watch {
                    path: root.clone(),
                    message: e.to_string(),
                })?;
            info!(root = %root.display(), "watching test root");
            watched.push(root.clone());
        }

        Ok(Self {
            roots: watched,
            stale,
            _watcher: watcher,
        })
    }

    #[must_use]
    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Whether a change happened since the last call, resetting the flag.
    pub fn take_changed(&self) -> bool {
        self.stale.swap(false, Ordering::AcqRel)
    }

    /// Raise the flag by hand.
    pub fn mark_changed(&self) {
        self.stale.store(true, Ordering::Release);
    }
}

fn affects_selection(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Remove(_) | EventKind::Modify(notify::event::ModifyKind::Name(_))
    )
}
