//! Directory watcher with per-file fan-out
//!
//! One native filesystem watch per declarative-config directory. Events are
//! surfaced on the directory-wide stream and additionally fanned out to
//! per-file subscribers keyed by the file's path relative to the directory,
//! so each file provider only sees changes to its own document.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use notify::event::ModifyKind;
use notify::{EventKind as FsEventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::RouteError;
use crate::task::Task;
use crate::watcher::events::{Action, Event, EventKind};
use crate::watcher::{Watcher, STREAM_CAPACITY};

struct Subscriber {
    event_tx: mpsc::Sender<Event>,
    err_tx: mpsc::Sender<RouteError>,
}

struct Shared {
    dir: PathBuf,
    /// subscriber id -> optional relative-path filter
    subscribers: DashMap<u64, (Option<String>, Subscriber)>,
    next_id: AtomicU64,
}

impl Shared {
    fn dispatch(&self, rel_path: &str, event: &Event) {
        for entry in self.subscribers.iter() {
            let (filter, sub) = entry.value();
            let wanted = match filter {
                Some(path) => path == rel_path,
                None => true,
            };
            if !wanted {
                continue;
            }
            // never block the notify thread; a full subscriber drops the event
            if sub.event_tx.try_send(event.clone()).is_err() {
                warn!(rel_path, "file event dropped, subscriber queue full");
            }
        }
    }

    fn dispatch_error(&self, err_text: String) {
        for entry in self.subscribers.iter() {
            let (_, sub) = entry.value();
            let _ = sub.err_tx.try_send(RouteError::InvalidDocument {
                path: self.dir.display().to_string(),
                reason: err_text.clone(),
            });
        }
    }
}

/// Watches one directory (non-recursively) for file changes.
pub struct DirWatcher {
    shared: Arc<Shared>,
    /// Dropped on task cancel to release the OS watch
    _watcher: Arc<Mutex<Option<RecommendedWatcher>>>,
}

impl DirWatcher {
    /// Create the watcher and bind its lifetime to `task`: canceling the
    /// task releases the OS-level watch and closes every subscriber stream.
    pub fn new(task: &Task, dir: impl AsRef<Path>) -> notify::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let shared = Arc::new(Shared {
            dir: dir.clone(),
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(1),
        });

        let cb_shared = Arc::clone(&shared);
        let mut watcher = RecommendedWatcher::new(
            move |res: Result<notify::Event, notify::Error>| match res {
                Ok(fs_event) => {
                    let Some(action) = map_fs_event(&fs_event.kind) else {
                        return;
                    };
                    for path in &fs_event.paths {
                        let rel = match path.strip_prefix(&cb_shared.dir) {
                            Ok(rel) => rel.to_string_lossy().to_string(),
                            Err(_) => continue,
                        };
                        let event = Event {
                            kind: EventKind::File,
                            actor_id: String::new(),
                            actor_name: rel.clone(),
                            action,
                        };
                        cb_shared.dispatch(&rel, &event);
                    }
                }
                Err(e) => cb_shared.dispatch_error(e.to_string()),
            },
            notify::Config::default(),
        )?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;
        debug!(dir = %dir.display(), "directory watch established");

        let watcher = Arc::new(Mutex::new(Some(watcher)));
        let on_cancel_watcher = Arc::clone(&watcher);
        let on_cancel_shared = Arc::clone(&shared);
        task.on_cancel("release directory watch", move || {
            on_cancel_watcher.lock().take();
            on_cancel_shared.subscribers.clear();
        });

        Ok(Self {
            shared,
            _watcher: watcher,
        })
    }

    /// A [`Watcher`] that only sees events for one file under this
    /// directory, keyed by its relative path.
    pub fn file(&self, rel_path: impl Into<String>) -> FileWatcher {
        FileWatcher {
            shared: Arc::clone(&self.shared),
            rel_path: rel_path.into(),
        }
    }

    fn add_subscriber(
        shared: &Arc<Shared>,
        task: &Task,
        filter: Option<String>,
    ) -> (mpsc::Receiver<Event>, mpsc::Receiver<RouteError>) {
        let (event_tx, event_rx) = mpsc::channel(STREAM_CAPACITY);
        let (err_tx, err_rx) = mpsc::channel(STREAM_CAPACITY);
        let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
        shared
            .subscribers
            .insert(id, (filter, Subscriber { event_tx, err_tx }));

        // closing the stream when the subscriber's task goes away
        let cleanup = Arc::clone(shared);
        task.on_cancel("drop file subscription", move || {
            cleanup.subscribers.remove(&id);
        });

        (event_rx, err_rx)
    }
}

impl Watcher for DirWatcher {
    fn subscribe(&self, task: &Task) -> (mpsc::Receiver<Event>, mpsc::Receiver<RouteError>) {
        Self::add_subscriber(&self.shared, task, None)
    }
}

/// Per-file subscriber handle produced by [`DirWatcher::file`].
#[derive(Clone)]
pub struct FileWatcher {
    shared: Arc<Shared>,
    rel_path: String,
}

impl FileWatcher {
    pub fn rel_path(&self) -> &str {
        &self.rel_path
    }
}

impl Watcher for FileWatcher {
    fn subscribe(&self, task: &Task) -> (mpsc::Receiver<Event>, mpsc::Receiver<RouteError>) {
        DirWatcher::add_subscriber(&self.shared, task, Some(self.rel_path.clone()))
    }
}

fn map_fs_event(kind: &FsEventKind) -> Option<Action> {
    match kind {
        FsEventKind::Modify(ModifyKind::Name(_)) => Some(Action::FILE_RENAMED),
        FsEventKind::Modify(_) => Some(Action::FILE_WRITTEN),
        FsEventKind::Create(_) => Some(Action::FILE_CREATED),
        FsEventKind::Remove(_) => Some(Action::FILE_DELETED),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskRegistry;
    use std::time::Duration;

    #[tokio::test]
    async fn test_file_events_fan_out_by_relative_path() {
        let registry = TaskRegistry::new();
        let root = registry.root_task("root");
        let tmp = tempfile::tempdir().unwrap();

        let dir_watcher = DirWatcher::new(&root, tmp.path()).unwrap();
        let (mut all_events, _all_errs) = dir_watcher.subscribe(&root);
        let file_watcher = dir_watcher.file("routes.yml");
        let (mut file_events, _file_errs) = file_watcher.subscribe(&root);

        tokio::fs::write(tmp.path().join("other.yml"), "x: 1")
            .await
            .unwrap();
        tokio::fs::write(tmp.path().join("routes.yml"), "web:\n  port: 80")
            .await
            .unwrap();

        // the dir-wide stream sees both files
        let mut seen = std::collections::HashSet::new();
        while seen.len() < 2 {
            let ev = tokio::time::timeout(Duration::from_secs(5), all_events.recv())
                .await
                .expect("directory event")
                .expect("stream open");
            assert_eq!(ev.kind, EventKind::File);
            seen.insert(ev.actor_name);
        }
        assert!(seen.contains("routes.yml"));
        assert!(seen.contains("other.yml"));

        // the per-file stream only sees its own document
        let ev = tokio::time::timeout(Duration::from_secs(5), file_events.recv())
            .await
            .expect("file event")
            .expect("stream open");
        assert_eq!(ev.actor_name, "routes.yml");
        assert!(ev.action == Action::FILE_CREATED || ev.action == Action::FILE_WRITTEN);

        root.finish("test done").await;
    }

    #[tokio::test]
    async fn test_streams_close_on_task_cancel() {
        let registry = TaskRegistry::new();
        let root = registry.root_task("root");
        let tmp = tempfile::tempdir().unwrap();

        let dir_watcher = DirWatcher::new(&root, tmp.path()).unwrap();
        let sub_task = root.subtask("subscriber");
        let (mut events, _errs) = dir_watcher.subscribe(&sub_task);

        sub_task.finish("unsubscribe").await;
        // sender side was removed, the stream must end rather than hang
        let closed = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("stream should close");
        assert!(closed.is_none());

        root.finish("test done").await;
    }

    #[test]
    fn test_fs_event_mapping() {
        use notify::event::{CreateKind, DataChange, RemoveKind, RenameMode};

        assert_eq!(
            map_fs_event(&FsEventKind::Create(CreateKind::File)),
            Some(Action::FILE_CREATED)
        );
        assert_eq!(
            map_fs_event(&FsEventKind::Modify(ModifyKind::Data(DataChange::Content))),
            Some(Action::FILE_WRITTEN)
        );
        assert_eq!(
            map_fs_event(&FsEventKind::Modify(ModifyKind::Name(RenameMode::Any))),
            Some(Action::FILE_RENAMED)
        );
        assert_eq!(
            map_fs_event(&FsEventKind::Remove(RemoveKind::File)),
            Some(Action::FILE_DELETED)
        );
        assert_eq!(map_fs_event(&FsEventKind::Access(notify::event::AccessKind::Any)), None);
    }
}
