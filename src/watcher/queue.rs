//! Debouncing event queue
//!
//! Buffers raw watcher events and flushes them as one batch on a fixed
//! interval. Each flush runs under its own flush-scoped [`Task`] and the
//! queue waits for it to finish before taking the next tick's work, so two
//! reconciliations for the same provider never overlap.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error};

use crate::error::RouteError;
use crate::task::{panic_message, Task};
use crate::watcher::events::Event;

const QUEUE_CAPACITY: usize = 10;

/// Handler invoked with a full batch and a fresh flush-scoped task.
pub type FlushFn = Arc<dyn Fn(Vec<Event>, Task) -> BoxFuture<'static, ()> + Send + Sync>;

/// Called for watcher errors and recovered flush panics; never triggers a
/// flush by itself.
pub type ErrorFn = Arc<dyn Fn(RouteError) + Send + Sync>;

pub struct EventQueue {
    task: Task,
    flush_interval: Duration,
    on_flush: FlushFn,
    on_error: ErrorFn,
}

impl EventQueue {
    pub fn new(task: Task, flush_interval: Duration, on_flush: FlushFn, on_error: ErrorFn) -> Self {
        Self {
            task,
            flush_interval,
            on_flush,
            on_error,
        }
    }

    /// Consume the watcher's event and error streams until the queue's task
    /// is canceled or both streams close.
    pub fn start(self, mut event_rx: mpsc::Receiver<Event>, mut err_rx: mpsc::Receiver<RouteError>) {
        tokio::spawn(async move {
            let mut buffer: Vec<Event> = Vec::with_capacity(QUEUE_CAPACITY);
            let mut ticker = tokio::time::interval(self.flush_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut flush_seq: u64 = 0;

            loop {
                tokio::select! {
                    _ = self.task.cancelled() => break,
                    _ = ticker.tick() => {
                        if buffer.is_empty() {
                            continue;
                        }
                        let batch = std::mem::take(&mut buffer);
                        flush_seq += 1;
                        self.flush(batch, flush_seq).await;
                        ticker.reset();
                    }
                    event = event_rx.recv() => match event {
                        Some(event) => {
                            debug!(task = %self.task.name(), %event, "queued event");
                            buffer.push(event);
                        }
                        None => break,
                    },
                    err = err_rx.recv() => match err {
                        Some(err) => (self.on_error)(err),
                        None => break,
                    },
                }
            }

            self.task.finish("event queue closed").await;
        });
    }

    /// Run one flush to completion; panics inside the handler are recovered
    /// and reported instead of killing the queue.
    async fn flush(&self, batch: Vec<Event>, seq: u64) {
        let flush_task = self.task.subtask(&format!("flush#{seq}"));
        debug!(
            task = %flush_task.name(),
            events = batch.len(),
            "flushing event batch"
        );

        let fut = AssertUnwindSafe((self.on_flush)(batch, flush_task.clone())).catch_unwind();
        if let Err(payload) = fut.await {
            let message = panic_message(&payload);
            error!(task = %flush_task.name(), %message, "panic in flush handler");
            (self.on_error)(RouteError::Panic {
                task: flush_task.name().to_string(),
                message,
            });
            if self.task.strict_panics() {
                flush_task.finish("flush panicked").await;
                panic::resume_unwind(payload);
            }
        }

        // next tick's work must not start until this flush has fully drained
        flush_task.finish("flush done").await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskRegistry;
    use crate::watcher::events::{Action, EventKind};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use parking_lot::Mutex;

    fn event(name: &str) -> Event {
        Event {
            kind: EventKind::Docker,
            actor_id: format!("id-{name}"),
            actor_name: name.to_string(),
            action: Action::CONTAINER_START,
        }
    }

    #[tokio::test]
    async fn test_flushes_whole_batch() {
        let registry = TaskRegistry::new();
        let root = registry.root_task("root");

        let batches: Arc<Mutex<Vec<Vec<Event>>>> = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&batches);
        let on_flush: FlushFn = Arc::new(move |events, _task| {
            let seen = Arc::clone(&seen);
            async move {
                seen.lock().push(events);
            }
            .boxed()
        });
        let on_error: ErrorFn = Arc::new(|err| panic!("unexpected error: {err}"));

        let (event_tx, event_rx) = mpsc::channel(8);
        let (_err_tx, err_rx) = mpsc::channel(8);

        let queue = EventQueue::new(
            root.subtask("event_queue"),
            Duration::from_millis(20),
            on_flush,
            on_error,
        );
        queue.start(event_rx, err_rx);

        event_tx.send(event("a")).await.unwrap();
        event_tx.send(event("b")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        let collected = batches.lock();
        assert_eq!(collected.len(), 1, "burst should flush as one batch");
        assert_eq!(collected[0].len(), 2);

        drop(collected);
        root.finish("test done").await;
    }

    #[tokio::test]
    async fn test_errors_do_not_trigger_flush() {
        let registry = TaskRegistry::new();
        let root = registry.root_task("root");

        let flushes = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(AtomicUsize::new(0));

        let f = Arc::clone(&flushes);
        let on_flush: FlushFn = Arc::new(move |_events, _task| {
            f.fetch_add(1, Ordering::SeqCst);
            async {}.boxed()
        });
        let e = Arc::clone(&errors);
        let on_error: ErrorFn = Arc::new(move |_err| {
            e.fetch_add(1, Ordering::SeqCst);
        });

        let (_event_tx, event_rx) = mpsc::channel::<Event>(8);
        let (err_tx, err_rx) = mpsc::channel(8);

        let queue = EventQueue::new(
            root.subtask("event_queue"),
            Duration::from_millis(10),
            on_flush,
            on_error,
        );
        queue.start(event_rx, err_rx);

        err_tx
            .send(RouteError::connection("tcp://docker", "refused"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(flushes.load(Ordering::SeqCst), 0);

        root.finish("test done").await;
    }

    #[tokio::test]
    async fn test_flush_panic_is_reported_not_fatal() {
        let registry = TaskRegistry::new();
        let root = registry.root_task("root");

        let errors = Arc::new(AtomicUsize::new(0));
        let flushes = Arc::new(AtomicUsize::new(0));

        let f = Arc::clone(&flushes);
        let on_flush: FlushFn = Arc::new(move |_events, _task| {
            let n = f.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    panic!("first flush blows up");
                }
            }
            .boxed()
        });
        let e = Arc::clone(&errors);
        let on_error: ErrorFn = Arc::new(move |err| {
            assert!(matches!(err, RouteError::Panic { .. }));
            e.fetch_add(1, Ordering::SeqCst);
        });

        let (event_tx, event_rx) = mpsc::channel(8);
        let (_err_tx, err_rx) = mpsc::channel(8);

        let queue = EventQueue::new(
            root.subtask("event_queue"),
            Duration::from_millis(10),
            on_flush,
            on_error,
        );
        queue.start(event_rx, err_rx);

        event_tx.send(event("a")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        event_tx.send(event("b")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(flushes.load(Ordering::SeqCst), 2, "queue survives the panic");

        root.finish("test done").await;
    }
}
