//! Task supervisor - owns every concurrent unit of work in the service
//!
//! The bus consume loop, each handler invocation and each per-host dispatch
//! task are spawned through one [`TaskSupervisor`]. It records how every task
//! settled (completed, failed, cancelled) and supports two ways of ending:
//! - [`TaskSupervisor::drain`]: wait for all tasks, spawning stays allowed
//! - [`TaskSupervisor::shutdown`]: refuse new work, cancel and await everything

use std::future::Future;

use parking_lot::Mutex;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type Settled = (String, anyhow::Result<()>);

/// Cumulative settlement counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskReport {
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl TaskReport {
    pub fn total(&self) -> u64 {
        self.completed + self.failed + self.cancelled
    }
}

struct Inner {
    tasks: JoinSet<Settled>,
    closed: bool,
    report: TaskReport,
}

impl Inner {
    fn record(&mut self, result: Result<Settled, JoinError>) {
        match result {
            Ok((name, Ok(()))) => {
                debug!(task = %name, "Task completed");
                self.report.completed += 1;
            }
            Ok((name, Err(e))) => {
                warn!(task = %name, error = %e, "Task finished with failure");
                self.report.failed += 1;
            }
            Err(e) if e.is_cancelled() => {
                self.report.cancelled += 1;
            }
            Err(e) => {
                warn!(error = %e, "Task panicked");
                self.report.failed += 1;
            }
        }
    }

    /// Collect tasks that already finished so the set does not grow unbounded
    fn reap(&mut self) {
        while let Some(result) = self.tasks.try_join_next() {
            self.record(result);
        }
    }
}

/// Spawns and tracks the service's concurrent tasks
pub struct TaskSupervisor {
    inner: Mutex<Inner>,
    token: CancellationToken,
}

impl TaskSupervisor {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                tasks: JoinSet::new(),
                closed: false,
                report: TaskReport::default(),
            }),
            token: CancellationToken::new(),
        }
    }

    /// Spawn a named task. Returns `false` if shutdown already started.
    pub fn spawn<F>(&self, name: impl Into<String>, future: F) -> bool
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.into();
        let mut inner = self.inner.lock();
        if inner.closed {
            warn!(task = %name, "Supervisor is shutting down, task refused");
            return false;
        }
        inner.reap();
        inner.tasks.spawn(async move { (name, future.await) });
        true
    }

    /// Token cancelled when shutdown begins, for loops that want to exit
    /// between units of work instead of at an arbitrary suspension point.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.lock().closed
    }

    /// Number of tracked tasks not yet collected
    pub fn in_flight(&self) -> usize {
        self.inner.lock().tasks.len()
    }

    /// Cumulative settlement counters
    pub fn report(&self) -> TaskReport {
        self.inner.lock().report
    }

    /// Wait until every task, including ones spawned while waiting, settled.
    pub async fn drain(&self) -> TaskReport {
        loop {
            let mut tasks = std::mem::take(&mut self.inner.lock().tasks);
            if tasks.is_empty() {
                break;
            }
            while let Some(result) = tasks.join_next().await {
                self.inner.lock().record(result);
            }
        }
        self.report()
    }

    /// Refuse new work, cancel every tracked task and await all of them.
    ///
    /// Cancellation-induced failures are absorbed into the report.
    pub async fn shutdown(&self) -> TaskReport {
        let mut tasks = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            std::mem::take(&mut inner.tasks)
        };
        self.token.cancel();

        let pending = tasks.len();
        tasks.abort_all();
        while let Some(result) = tasks.join_next().await {
            self.inner.lock().record(result);
        }

        let report = self.report();
        info!(
            pending = pending,
            completed = report.completed,
            failed = report.failed,
            cancelled = report.cancelled,
            "Finished pending tasks"
        );
        report
    }
}

impl Default for TaskSupervisor {
    fn default() -> Self {
        Self::new()
    }
}
