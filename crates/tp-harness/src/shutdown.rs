use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

// ---------------------------------------------------------------------------
// ShutdownSignal: cooperative shutdown coordination
// ---------------------------------------------------------------------------

/// Broadcast-based shutdown coordinator.
///
/// Long-running tasks `select!` on [`ShutdownSignal::wait`] next to their
/// work; the daemon calls [`ShutdownSignal::trigger`] once on ctrl-c.
///
/// ```ignore
/// let shutdown = ShutdownSignal::new();
/// tokio::select! {
///     _ = shutdown.wait() => { /* graceful cleanup */ }
///     _ = do_work() => {}
/// }
/// ```
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    trigger: broadcast::Sender<()>,
    /// Atomic flag for cheap polling.
    shutting_down: Arc<AtomicBool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (trigger, _) = broadcast::channel(1);
        Self {
            trigger,
            shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.trigger.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    /// Trigger shutdown for all subscribers. Later calls are no-ops.
    pub fn trigger(&self) {
        if self
            .shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            info!("shutdown signal triggered");
            let _ = self.trigger.send(());
        } else {
            debug!("shutdown already triggered");
        }
    }

    /// Resolve once shutdown has been triggered, including before this call.
    pub async fn wait(&self) {
        let mut rx = self.trigger.subscribe();
        if self.is_shutting_down() {
            return;
        }
        // Closed or lagged both mean the trigger fired.
        let _ = rx.recv().await;
    }

    pub fn subscriber_count(&self) -> usize {
        self.trigger.receiver_count()
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// SupervisedTasks
// ---------------------------------------------------------------------------

/// A background task that ended with an error or a panic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub name: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainResult {
    /// Every task finished on its own.
    Complete(usize),
    /// Timeout expired; the remaining tasks were aborted.
    Timeout { finished: usize, aborted: usize },
}

impl DrainResult {
    pub fn is_complete(&self) -> bool {
        matches!(self, DrainResult::Complete(_))
    }
}

/// Owner of the workspace's background tasks.
///
/// Each task gets the shared [`ShutdownSignal`] and is expected to return
/// once it fires. Errors and panics are logged and reported on the failure
/// channel instead of vanishing with a detached `tokio::spawn`.
#[derive(Clone)]
pub struct SupervisedTasks {
    shutdown: ShutdownSignal,
    set: Arc<Mutex<JoinSet<()>>>,
    failures_tx: flume::Sender<TaskFailure>,
    failures_rx: flume::Receiver<TaskFailure>,
}

impl SupervisedTasks {
    pub fn new(shutdown: ShutdownSignal) -> Self {
        let (failures_tx, failures_rx) = flume::unbounded();
        Self {
            shutdown,
            set: Arc::new(Mutex::new(JoinSet::new())),
            failures_tx,
            failures_rx,
        }
    }

    pub fn shutdown(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    /// Spawn `make(signal)` under supervision.
    pub fn spawn<F, Fut, E>(&self, name: impl Into<String>, make: F)
    where
        F: FnOnce(ShutdownSignal) -> Fut,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let name = name.into();
        let failures = self.failures_tx.clone();
        let fut = make(self.shutdown.clone());
        let task_name = name.clone();
        let supervised = async move {
            if let Err(e) = fut.await {
                error!(task = %task_name, error = %e, "supervised task failed");
                let _ = failures.send(TaskFailure {
                    name: task_name,
                    error: e.to_string(),
                });
            }
        };
        debug!(task = %name, "spawning supervised task");
        self.lock().spawn(supervised);
        self.reap();
    }

    /// Failures reported so far; each is delivered once.
    pub fn failures(&self) -> flume::Receiver<TaskFailure> {
        self.failures_rx.clone()
    }

    /// Tasks not yet reaped.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for every task to finish, aborting stragglers after `timeout`.
    /// Does not trigger shutdown itself.
    pub async fn drain(&self, timeout: Duration) -> DrainResult {
        let mut set = std::mem::take(&mut *self.lock());
        let mut finished = 0;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, set.join_next()).await {
                Ok(Some(joined)) => {
                    finished += 1;
                    self.report_panic(joined);
                }
                Ok(None) => {
                    info!(finished, "supervised tasks drained");
                    return DrainResult::Complete(finished);
                }
                Err(_) => {
                    let aborted = set.len();
                    warn!(finished, aborted, "drain timeout; aborting remaining tasks");
                    set.shutdown().await;
                    return DrainResult::Timeout { finished, aborted };
                }
            }
        }
    }

    /// Collect already-finished tasks so the set does not grow unbounded.
    fn reap(&self) {
        let mut set = self.lock();
        while let Some(joined) = set.try_join_next() {
            self.report_panic(joined);
        }
    }

    fn report_panic(&self, joined: Result<(), tokio::task::JoinError>) {
        if let Err(e) = joined {
            if e.is_panic() {
                error!(error = %e, "supervised task panicked");
                let _ = self.failures_tx.send(TaskFailure {
                    name: "<panicked>".to_string(),
                    error: e.to_string(),
                });
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, JoinSet<()>> {
        self.set.lock().unwrap_or_else(|e| {
            warn!("supervised task set mutex was poisoned, recovering");
            e.into_inner()
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
