//! A running route: a finalized entry bound to a task in the cancellation
//! tree, with an optional health probe loop.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::entry::RawEntry;
use crate::error::RouteError;
use crate::task::Task;

const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(5);
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Route {
    entry: RawEntry,
    provider: String,
    task: Mutex<Option<Task>>,
}

impl Route {
    /// Build a route from a compiled entry. Finalizes the entry, so host,
    /// port and scheme are always set afterwards.
    pub fn new(provider: impl Into<String>, mut entry: RawEntry) -> Arc<Self> {
        entry.finalize();
        Arc::new(Self {
            entry,
            provider: provider.into(),
            task: Mutex::new(None),
        })
    }

    pub fn alias(&self) -> &str {
        &self.entry.alias
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn entry(&self) -> &RawEntry {
        &self.entry
    }

    /// Backend URL, e.g. `http://172.17.0.2:8080`. Valid after `new`.
    pub fn target_url(&self) -> String {
        format!(
            "{}://{}:{}",
            self.entry.scheme.as_deref().unwrap_or("http"),
            self.entry.host.as_deref().unwrap_or("localhost"),
            self.entry.port.as_deref().unwrap_or("80"),
        )
    }

    pub fn started(&self) -> bool {
        self.task.lock().is_some()
    }

    /// Register the route under `parent` and spawn its health probe loop.
    pub fn start(self: &Arc<Self>, parent: &Task) -> Result<(), RouteError> {
        let mut slot = self.task.lock();
        if slot.is_some() {
            return Err(RouteError::RouteLifecycle {
                alias: self.entry.alias.clone(),
                action: "start",
                reason: "already started".to_string(),
            });
        }
        let task = parent.subtask(&format!("route.{}", self.entry.alias));

        if let Some(hc) = self.entry.healthcheck.clone() {
            if !hc.disable && self.probeable() {
                let probe_task = task.subtask("health");
                let url = format!(
                    "{}{}",
                    self.target_url(),
                    hc.path.as_deref().unwrap_or("/")
                );
                let interval = hc.interval.unwrap_or(DEFAULT_HEALTH_INTERVAL);
                let use_get = hc.use_get;
                let insecure = self.entry.no_tls_verify;
                let alias = self.entry.alias.clone();
                tokio::spawn(async move {
                    health_loop(probe_task, alias, url, use_get, interval, insecure).await;
                });
            }
        }

        info!(
            alias = %self.entry.alias,
            provider = %self.provider,
            target = %self.target_url(),
            "route started"
        );
        *slot = Some(task);
        Ok(())
    }

    /// Cancel the route's task tree and wait for it to drain.
    pub async fn stop(&self, reason: &str) -> Result<(), RouteError> {
        let task = self.task.lock().take();
        let Some(task) = task else {
            return Err(RouteError::RouteLifecycle {
                alias: self.entry.alias.clone(),
                action: "stop",
                reason: "not started".to_string(),
            });
        };
        task.finish(reason).await;
        info!(alias = %self.entry.alias, provider = %self.provider, reason, "route stopped");
        Ok(())
    }

    fn probeable(&self) -> bool {
        matches!(self.entry.scheme.as_deref(), Some("http") | Some("https"))
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("alias", &self.entry.alias)
            .field("provider", &self.provider)
            .field("target", &self.target_url())
            .field("started", &self.started())
            .finish()
    }
}

/// Periodic liveness probe. Logs only on state transitions.
async fn health_loop(
    task: Task,
    alias: String,
    url: String,
    use_get: bool,
    interval: Duration,
    insecure: bool,
) {
    let client = match reqwest::Client::builder()
        .timeout(HEALTH_PROBE_TIMEOUT)
        .danger_accept_invalid_certs(insecure)
        .build()
    {
        Ok(client) => client,
        Err(err) => {
            warn!(alias = %alias, error = %err, "health probe client unavailable");
            task.finish("probe client unavailable").await;
            return;
        }
    };

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut healthy: Option<bool> = None;

    loop {
        tokio::select! {
            _ = task.cancelled() => break,
            _ = ticker.tick() => {
                let request = if use_get { client.get(&url) } else { client.head(&url) };
                let now_healthy = match request.send().await {
                    Ok(resp) => resp.status().is_success() || resp.status().is_redirection(),
                    Err(_) => false,
                };
                if healthy != Some(now_healthy) {
                    if now_healthy {
                        info!(alias = %alias, url = %url, "backend healthy");
                    } else {
                        warn!(alias = %alias, url = %url, "backend unhealthy");
                    }
                    healthy = Some(now_healthy);
                } else {
                    debug!(alias = %alias, healthy = now_healthy, "health probe");
                }
            }
        }
    }

    task.finish("health monitor stopped").await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskRegistry;

    fn entry(alias: &str) -> RawEntry {
        let mut e = RawEntry::new(alias, None);
        e.port = Some("8080".to_string());
        e
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let registry = TaskRegistry::new();
        let root = registry.root_task("test");

        let route = Route::new("local", entry("web"));
        assert!(!route.started());
        route.start(&root).unwrap();
        assert!(route.started());
        route.stop("test teardown").await.unwrap();
        assert!(!route.started());

        root.finish("done").await;
    }

    #[tokio::test]
    async fn test_double_start_is_an_error() {
        let registry = TaskRegistry::new();
        let root = registry.root_task("test");

        let route = Route::new("local", entry("web"));
        route.start(&root).unwrap();
        let err = route.start(&root).unwrap_err();
        assert!(matches!(err, RouteError::RouteLifecycle { action: "start", .. }));

        route.stop("test teardown").await.unwrap();
        root.finish("done").await;
    }

    #[tokio::test]
    async fn test_stop_without_start_is_an_error() {
        let route = Route::new("local", entry("web"));
        let err = route.stop("nothing to do").await.unwrap_err();
        assert!(matches!(err, RouteError::RouteLifecycle { action: "stop", .. }));
    }

    #[test]
    fn test_target_url_from_finalized_entry() {
        let mut e = RawEntry::new("web", None);
        e.scheme = Some("https".to_string());
        e.port = Some("8443".to_string());
        e.host = Some("10.0.0.5".to_string());
        let route = Route::new("local", e);
        assert_eq!(route.target_url(), "https://10.0.0.5:8443");
    }
}
