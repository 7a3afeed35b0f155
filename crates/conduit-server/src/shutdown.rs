//! Server shutdown: one token for every background task, and a bounded
//! drain of the named tasks that `listen` started.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// A background task the server owns.
pub struct ServiceTask {
    name: &'static str,
    handle: JoinHandle<()>,
}

impl ServiceTask {
    /// Tag `handle` with a name for drain reporting.
    pub fn new(name: &'static str, handle: JoinHandle<()>) -> Self {
        Self { name, handle }
    }
}

/// Which tasks exited on their own and which had to be aborted.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Exited within the timeout (including by panicking).
    pub finished: Vec<&'static str>,
    /// Still running at the deadline.
    pub aborted: Vec<&'static str>,
}

impl DrainReport {
    /// Every task exited without being aborted.
    pub fn is_clean(&self) -> bool {
        self.aborted.is_empty()
    }
}

/// Shared cancellation for the listener, dispatch, sweeper, and every
/// connection task.
#[derive(Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    /// Fresh, not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Clone of the token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Signal shutdown. Idempotent.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether shutdown has been signalled.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Signal shutdown, then give `tasks` a shared deadline of `timeout`
    /// (30s when unset). Tasks still running at the deadline are aborted.
    pub async fn drain(&self, tasks: Vec<ServiceTask>, timeout: Option<Duration>) -> DrainReport {
        let timeout = timeout.unwrap_or(DEFAULT_DRAIN_TIMEOUT);
        self.shutdown();
        info!(
            tasks = tasks.len(),
            timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            "draining server tasks"
        );

        let deadline = tokio::time::Instant::now() + timeout;
        let mut report = DrainReport::default();
        for mut task in tasks {
            match tokio::time::timeout_at(deadline, &mut task.handle).await {
                Ok(Ok(())) => {
                    debug!(task = task.name, "task finished");
                    report.finished.push(task.name);
                }
                Ok(Err(err)) => {
                    warn!(task = task.name, %err, "task ended abnormally");
                    report.finished.push(task.name);
                }
                Err(_) => {
                    task.handle.abort();
                    report.aborted.push(task.name);
                }
            }
        }
        if !report.is_clean() {
            warn!(aborted = ?report.aborted, "drain deadline passed, tasks aborted");
        }
        report
    }
}
