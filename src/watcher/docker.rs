//! Docker event-stream watcher
//!
//! Subscribes to container lifecycle events from the runtime and translates
//! them into [`Event`]s. On stream failure it emits a force-reload event,
//! retries the connection on a fixed backoff, and emits another force-reload
//! once the stream is back so the reconciler resynchronizes.

use std::collections::HashMap;
use std::time::Duration;

use bollard::system::EventsOptions;
use bollard::Docker;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::docker;
use crate::error::RouteError;
use crate::task::Task;
use crate::watcher::events::{Action, Event, EventKind};
use crate::watcher::{Watcher, STREAM_CAPACITY};

const RETRY_INTERVAL: Duration = Duration::from_secs(3);

pub struct DockerWatcher {
    host: String,
}

impl DockerWatcher {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }

    fn container_event_options() -> EventsOptions<String> {
        let mut filters = HashMap::new();
        filters.insert("type".to_string(), vec!["container".to_string()]);
        EventsOptions::<String> {
            filters,
            ..Default::default()
        }
    }

    async fn connect_with_retry(
        host: &str,
        task: &Task,
        err_tx: &mpsc::Sender<RouteError>,
    ) -> Option<Docker> {
        let mut attempts = 0u32;
        loop {
            match docker::connect(host) {
                Ok(client) => match client.ping().await {
                    Ok(_) => return Some(client),
                    Err(e) => {
                        attempts += 1;
                        let _ = err_tx
                            .try_send(RouteError::connection(host, format!("attempt #{attempts}: {e}")));
                    }
                },
                Err(e) => {
                    attempts += 1;
                    let _ = err_tx
                        .try_send(RouteError::connection(host, format!("attempt #{attempts}: {e}")));
                }
            }
            tokio::select! {
                _ = task.cancelled() => return None,
                _ = tokio::time::sleep(RETRY_INTERVAL) => {}
            }
        }
    }

    async fn run(host: String, task: Task, event_tx: mpsc::Sender<Event>, err_tx: mpsc::Sender<RouteError>) {
        let Some(client) = Self::connect_with_retry(&host, &task, &err_tx).await else {
            return;
        };

        let mut stream = client.events(Some(Self::container_event_options()));
        loop {
            tokio::select! {
                _ = task.cancelled() => {
                    debug!(host = %host, "docker watcher closed");
                    return;
                }
                msg = stream.next() => match msg {
                    Some(Ok(msg)) => {
                        let Some(action) = msg.action.as_deref().and_then(Action::from_docker) else {
                            continue;
                        };
                        let (actor_id, actor_name) = match &msg.actor {
                            Some(actor) => (
                                actor.id.clone().unwrap_or_default(),
                                actor
                                    .attributes
                                    .as_ref()
                                    .and_then(|a| a.get("name").cloned())
                                    .unwrap_or_default(),
                            ),
                            None => (String::new(), String::new()),
                        };
                        let event = Event {
                            kind: EventKind::Docker,
                            actor_id,
                            actor_name,
                            action,
                        };
                        if event_tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(host = %host, error = %e, "docker event stream error, reconnecting");
                        let _ = err_tx.try_send(RouteError::connection(host.as_str(), &e));
                        // routes may have changed while the stream was down
                        let _ = event_tx.send(Event::force_reload()).await;

                        loop {
                            tokio::select! {
                                _ = task.cancelled() => return,
                                _ = tokio::time::sleep(RETRY_INTERVAL) => {
                                    if client.ping().await.is_ok() {
                                        break;
                                    }
                                }
                            }
                        }

                        let _ = event_tx.send(Event::force_reload()).await;
                        stream = client.events(Some(Self::container_event_options()));
                    }
                    None => {
                        warn!(host = %host, "docker event stream ended");
                        return;
                    }
                }
            }
        }
    }
}

impl Watcher for DockerWatcher {
    fn subscribe(&self, task: &Task) -> (mpsc::Receiver<Event>, mpsc::Receiver<RouteError>) {
        let (event_tx, event_rx) = mpsc::channel(STREAM_CAPACITY);
        let (err_tx, err_rx) = mpsc::channel(STREAM_CAPACITY);
        let host = self.host.clone();
        let task = task.clone();
        tokio::spawn(Self::run(host, task, event_tx, err_tx));
        (event_rx, err_rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskRegistry;

    #[tokio::test]
    async fn test_unreachable_host_reports_connection_errors() {
        let registry = TaskRegistry::new();
        let root = registry.root_task("root");
        let watcher = DockerWatcher::new("unix:///nonexistent/docker.sock");

        let (_events, mut errors) = watcher.subscribe(&root);
        let err = tokio::time::timeout(Duration::from_secs(5), errors.recv())
            .await
            .expect("expected a connection error")
            .expect("error stream open");
        assert!(err.is_connection());

        root.finish("test done").await;
    }

    #[test]
    fn test_event_options_filter_containers_only() {
        let opts = DockerWatcher::container_event_options();
        assert_eq!(
            opts.filters.get("type"),
            Some(&vec!["container".to_string()])
        );
    }
}
