//! Route providers
//!
//! A provider owns the routes loaded from one source (a docker host, a
//! declarative route file, or a remote agent) and keeps them reconciled
//! against change events from the matching watcher.

pub mod agent;
pub mod docker;
pub mod file;
mod handler;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::entry::RawEntry;
use crate::error::ErrorList;
use crate::route::Route;
use crate::task::Task;
use crate::watcher::{ErrorFn, EventQueue, FlushFn, Watcher};

pub use agent::AgentSource;
pub use docker::DockerSource;
pub use file::FileSource;

/// Debounce window between a change event and the reconcile it triggers.
const FLUSH_INTERVAL: Duration = Duration::from_millis(300);

/// Where a provider's routes come from. Closed set; each variant knows how
/// to produce a full desired-state snapshot.
pub enum RouteSource {
    Docker(DockerSource),
    File(FileSource),
    Agent(AgentSource),
}

impl RouteSource {
    pub fn kind(&self) -> &'static str {
        match self {
            RouteSource::Docker(_) => "docker",
            RouteSource::File(_) => "file",
            RouteSource::Agent(_) => "agent",
        }
    }

    /// Load the full desired state. Always returns a best-effort entry map;
    /// failures are collected, never thrown halfway.
    pub async fn load(&self) -> (BTreeMap<String, RawEntry>, ErrorList) {
        match self {
            RouteSource::Docker(s) => s.load().await,
            RouteSource::File(s) => s.load().await,
            RouteSource::Agent(s) => s.load().await,
        }
    }
}

/// Point-in-time view of one provider, for status logging and collaborators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderStats {
    pub name: String,
    pub kind: &'static str,
    pub routes: usize,
}

pub struct Provider {
    name: String,
    source: RouteSource,
    routes: Mutex<BTreeMap<String, Arc<Route>>>,
    task: Mutex<Option<Task>>,
    /// Serializes reconcile passes. Queue flushes never overlap each other,
    /// but an operator reload arrives outside the queue and must not race a
    /// flush over the same route table.
    reconcile_gate: tokio::sync::Mutex<()>,
}

impl Provider {
    pub fn new(name: impl Into<String>, source: RouteSource) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            source,
            routes: Mutex::new(BTreeMap::new()),
            task: Mutex::new(None),
            reconcile_gate: tokio::sync::Mutex::new(()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &RouteSource {
        &self.source
    }

    pub fn num_routes(&self) -> usize {
        self.routes.lock().len()
    }

    pub fn route_aliases(&self) -> Vec<String> {
        self.routes.lock().keys().cloned().collect()
    }

    pub fn route(&self, alias: &str) -> Option<Arc<Route>> {
        self.routes.lock().get(alias).cloned()
    }

    pub fn statistics(&self) -> ProviderStats {
        ProviderStats {
            name: self.name.clone(),
            kind: self.source.kind(),
            routes: self.num_routes(),
        }
    }

    pub(crate) fn routes_snapshot(&self) -> BTreeMap<String, Arc<Route>> {
        self.routes.lock().clone()
    }

    pub(crate) fn task(&self) -> Option<Task> {
        self.task.lock().clone()
    }

    pub(super) fn replace_routes(&self, routes: BTreeMap<String, Arc<Route>>) {
        *self.routes.lock() = routes;
    }

    /// Load the initial routes and wire the change watcher through an event
    /// queue. Source failures at startup leave the provider empty; the
    /// watcher's reconnect force-reload fills it in once the source is back.
    ///
    /// Returns the number of routes started.
    pub async fn start(self: &Arc<Self>, parent: &Task, watcher: &dyn Watcher) -> usize {
        let task = parent.subtask(&format!("provider.{}", self.name));
        *self.task.lock() = Some(task.clone());

        let (entries, errs) = self.source.load().await;
        if !errs.is_empty() {
            warn!(provider = %self.name, "initial load: {errs}");
        }

        {
            let mut routes = self.routes.lock();
            for (alias, entry) in entries {
                let route = Route::new(&self.name, entry);
                match route.start(&task) {
                    Ok(()) => {
                        routes.insert(alias, route);
                    }
                    Err(err) => warn!(provider = %self.name, %err, "route failed to start"),
                }
            }
        }

        let queue_task = task.subtask("event_queue");
        let (event_rx, err_rx) = watcher.subscribe(&queue_task);

        let flush_provider = Arc::clone(self);
        let on_flush: FlushFn = Arc::new(move |batch, flush_task| {
            let provider = Arc::clone(&flush_provider);
            async move {
                handler::reconcile(&provider, batch, flush_task).await;
            }
            .boxed()
        });
        let error_provider = Arc::clone(self);
        let on_error: ErrorFn = Arc::new(move |err| {
            warn!(provider = %error_provider.name, %err, "watcher error");
        });
        EventQueue::new(queue_task, FLUSH_INTERVAL, on_flush, on_error).start(event_rx, err_rx);

        let started = self.num_routes();
        info!(
            provider = %self.name,
            kind = self.source.kind(),
            routes = started,
            "provider started"
        );
        started
    }

    /// Force a full reconcile against a fresh load of the source, as if a
    /// force-reload event had arrived. Used for operator-driven reloads.
    pub async fn reload(self: &Arc<Self>) {
        let Some(task) = self.task() else {
            return;
        };
        let flush_task = task.subtask("reload");
        handler::reconcile(self, vec![crate::watcher::Event::force_reload()], flush_task.clone())
            .await;
        flush_task.finish("reload done").await;
    }

    /// Stop every route and the provider's own task tree.
    pub async fn stop(&self, reason: &str) {
        let routes = std::mem::take(&mut *self.routes.lock());
        for route in routes.values() {
            if let Err(err) = route.stop(reason).await {
                warn!(provider = %self.name, %err, "route failed to stop");
            }
        }
        if let Some(task) = self.task.lock().take() {
            task.finish(reason).await;
        }
        info!(provider = %self.name, reason, "provider stopped");
    }
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider")
            .field("name", &self.name)
            .field("kind", &self.source.kind())
            .field("routes", &self.num_routes())
            .finish()
    }
}
