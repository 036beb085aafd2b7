//! Change watchers for route sources
//!
//! A [`Watcher`] turns an external source (docker event stream, directory of
//! declarative files) into a lazy, infinite pair of streams: events and
//! errors. Both streams close when the subscribing [`Task`] is canceled.

pub mod dir;
pub mod docker;
pub mod events;
pub mod queue;

use tokio::sync::mpsc;

use crate::error::RouteError;
use crate::task::Task;

pub use dir::{DirWatcher, FileWatcher};
pub use docker::DockerWatcher;
pub use events::{Action, Event, EventKind};
pub use queue::{ErrorFn, EventQueue, FlushFn};

/// Channel capacity of watcher streams; sends never block the source loop
pub(crate) const STREAM_CAPACITY: usize = 16;

/// Polymorphic source of change events. Closed set of variants: the docker
/// event-stream watcher, the directory watcher and its per-file subscribers.
pub trait Watcher: Send + Sync {
    /// Subscribe for the lifetime of `task`. The returned receivers yield
    /// events and errors until the task is canceled.
    fn subscribe(&self, task: &Task) -> (mpsc::Receiver<Event>, mpsc::Receiver<RouteError>);
}
