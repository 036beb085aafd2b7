//! Structured-concurrency lifecycle tree
//!
//! Every supervised activity (provider, watcher, event queue flush, route)
//! owns a [`Task`]: a node in a cancellation tree. Canceling a task cancels
//! all of its descendants, and its `finish` only completes once every child
//! and every registered callback has finished, bounded by a drain timeout.
//!
//! Tasks are created from a process-scoped [`TaskRegistry`] rather than a
//! global, so tests can construct isolated trees. The registry keeps the set
//! of live task names for stuck-shutdown diagnosis.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Upper bound on waiting for children or callbacks during a single finish
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Process-scoped set of live tasks
///
/// Supports concurrent insert/remove from many providers at once and exposes
/// the live task names for debugging.
pub struct TaskRegistry {
    live: DashMap<u64, String>,
    next_id: AtomicU64,
    /// Re-raise recovered callback/handler panics after logging
    strict_panics: bool,
}

impl TaskRegistry {
    pub fn new() -> Arc<Self> {
        Self::with_strict_panics(false)
    }

    pub fn with_strict_panics(strict_panics: bool) -> Arc<Self> {
        Arc::new(Self {
            live: DashMap::new(),
            next_id: AtomicU64::new(1),
            strict_panics,
        })
    }

    /// Allocate a new root task. Roots have no parent; everything else is
    /// created via [`Task::subtask`].
    pub fn root_task(self: &Arc<Self>, name: impl Into<String>) -> Task {
        Task::new(name.into(), None, CancellationToken::new(), Arc::clone(self))
    }

    /// Names of every task currently alive, for operator diagnosis.
    pub fn live_tasks(&self) -> Vec<String> {
        let mut names: Vec<String> = self.live.iter().map(|e| e.value().clone()).collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn strict_panics(&self) -> bool {
        self.strict_panics
    }

    fn register(&self, name: &str) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.live.insert(id, name.to_string());
        id
    }

    fn deregister(&self, id: u64) {
        self.live.remove(&id);
    }
}

struct TaskInner {
    id: u64,
    name: String,
    token: CancellationToken,
    reason: Mutex<Option<String>>,

    parent: Option<Arc<TaskInner>>,
    children: AtomicUsize,
    children_notify: Notify,

    callbacks_pending: AtomicUsize,
    callbacks_notify: Notify,

    finishing: AtomicBool,
    finished_tx: watch::Sender<bool>,

    registry: Arc<TaskRegistry>,
}

/// A node in the cancellation tree. Cheap to clone; all clones refer to the
/// same node.
#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

impl Task {
    fn new(
        name: String,
        parent: Option<Arc<TaskInner>>,
        token: CancellationToken,
        registry: Arc<TaskRegistry>,
    ) -> Self {
        let id = registry.register(&name);
        let (finished_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(TaskInner {
                id,
                name,
                token,
                reason: Mutex::new(None),
                parent,
                children: AtomicUsize::new(0),
                children_notify: Notify::new(),
                callbacks_pending: AtomicUsize::new(0),
                callbacks_notify: Notify::new(),
                finishing: AtomicBool::new(false),
                finished_tx,
                registry,
            }),
        }
    }

    /// Hierarchical dotted name, e.g. `root.provider.local.event_queue`.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Create a child bound to this task's cancellation. If this task is
    /// already canceled the child starts out canceled too.
    pub fn subtask(&self, name: &str) -> Task {
        let full = format!("{}.{}", self.inner.name, name);
        self.inner.children.fetch_add(1, Ordering::AcqRel);
        Task::new(
            full,
            Some(Arc::clone(&self.inner)),
            self.inner.token.child_token(),
            Arc::clone(&self.inner.registry),
        )
    }

    /// Resolves when cancellation has been requested on this task or any
    /// ancestor.
    pub async fn cancelled(&self) {
        self.inner.token.cancelled().await;
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// The reason passed to `finish`, if this task was finished directly.
    pub fn finish_reason(&self) -> Option<String> {
        self.inner.reason.lock().clone()
    }

    /// Whether recovered panics should be re-raised after logging.
    pub fn strict_panics(&self) -> bool {
        self.inner.registry.strict_panics
    }

    /// Register `f` to run as soon as cancellation is requested, without
    /// waiting for children. Used for teardown that must start immediately,
    /// like closing a listener.
    pub fn on_cancel(&self, about: &str, f: impl FnOnce() + Send + 'static) {
        self.add_callback(about, f, false);
    }

    /// Register `f` to run only after every child has finished, for cleanup
    /// that must see a fully quiesced subtree.
    pub fn on_finished(&self, about: &str, f: impl FnOnce() + Send + 'static) {
        self.add_callback(about, f, true);
    }

    fn add_callback(&self, about: &str, f: impl FnOnce() + Send + 'static, wait_children: bool) {
        let inner = Arc::clone(&self.inner);
        let about = about.to_string();
        inner.callbacks_pending.fetch_add(1, Ordering::AcqRel);
        tokio::spawn(async move {
            inner.token.cancelled().await;
            if wait_children && !inner.wait_children(DRAIN_TIMEOUT).await {
                warn!(
                    task = %inner.name,
                    callback = %about,
                    "timed out waiting for children before callback"
                );
            }
            inner.run_recovered(&about, f);
            if inner.callbacks_pending.fetch_sub(1, Ordering::AcqRel) == 1 {
                inner.callbacks_notify.notify_waiters();
            }
        });
    }

    /// Cancel this task and wait for its subtree and callbacks, bounded by
    /// the drain timeout. Idempotent; only the first call does the work.
    pub async fn finish(&self, reason: &str) {
        self.finish_with_timeout(reason, DRAIN_TIMEOUT).await;
    }

    pub(crate) async fn finish_with_timeout(&self, reason: &str, timeout: Duration) {
        let inner = &self.inner;
        if inner.finishing.swap(true, Ordering::AcqRel) {
            return;
        }

        *inner.reason.lock() = Some(reason.to_string());
        inner.token.cancel();
        debug!(task = %inner.name, reason, "task finishing");

        if !inner.wait_children(timeout).await {
            warn!(
                task = %inner.name,
                stuck = ?inner.stuck_subtasks(),
                "timed out waiting for subtasks to finish"
            );
        }
        if !inner.wait_callbacks(timeout).await {
            warn!(task = %inner.name, "timed out waiting for callbacks to finish");
        }

        inner.registry.deregister(inner.id);
        if let Some(parent) = &inner.parent {
            if parent.children.fetch_sub(1, Ordering::AcqRel) == 1 {
                parent.children_notify.notify_waiters();
            }
        }
        let _ = inner.finished_tx.send(true);
        debug!(task = %inner.name, "task finished");
    }

    /// Resolves once `finish` has fully completed on this task.
    pub async fn finished(&self) {
        let mut rx = self.inner.finished_tx.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl TaskInner {
    async fn wait_children(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.children.load(Ordering::Acquire) == 0 {
                return true;
            }
            let notified = self.children_notify.notified();
            if self.children.load(Ordering::Acquire) == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return false;
            }
        }
    }

    async fn wait_callbacks(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.callbacks_pending.load(Ordering::Acquire) == 0 {
                return true;
            }
            let notified = self.callbacks_notify.notified();
            if self.callbacks_pending.load(Ordering::Acquire) == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return false;
            }
        }
    }

    /// Names of live descendants, from the registry, by dotted-name prefix.
    fn stuck_subtasks(&self) -> Vec<String> {
        let prefix = format!("{}.", self.name);
        self.registry
            .live_tasks()
            .into_iter()
            .filter(|n| n.starts_with(&prefix))
            .collect()
    }

    fn run_recovered(&self, about: &str, f: impl FnOnce()) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
            let message = panic_message(&payload);
            error!(task = %self.name, callback = %about, %message, "panic in task callback");
            if self.registry.strict_panics {
                panic::resume_unwind(payload);
            }
        }
    }
}

/// Best-effort extraction of a panic payload's message.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Cancel `root` and block until the whole tree finishes or `timeout`
/// elapses, reporting the tasks still outstanding on timeout.
pub async fn graceful_shutdown(registry: &TaskRegistry, root: &Task, timeout: Duration) {
    let finish = root.finish_with_timeout("program exiting", timeout);
    if tokio::time::timeout(timeout, finish).await.is_err() {
        warn!(
            stuck = ?registry.live_tasks(),
            "graceful shutdown timed out; these tasks are still running"
        );
    }
}
