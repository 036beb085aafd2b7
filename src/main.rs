use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use driftgate::provider::{AgentSource, DockerSource, FileSource};
use driftgate::watcher::{DirWatcher, DockerWatcher};
use driftgate::{graceful_shutdown, Config, Provider, RouteSource, TaskRegistry};

const DEFAULT_CONFIG_PATH: &str = "driftgate.toml";

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("driftgate=info,warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = Config::load(Path::new(&config_path))?;
    if config.providers.is_empty() {
        warn!("no providers configured, nothing will be routed");
    }

    let registry = TaskRegistry::with_strict_panics(config.server.strict_panics);
    let root = registry.root_task("driftgate");

    let mut providers: Vec<Arc<Provider>> = Vec::new();
    // one directory watcher per distinct parent dir, shared by its files
    let mut dir_watchers: HashMap<PathBuf, DirWatcher> = HashMap::new();

    for docker_cfg in &config.providers.docker {
        let provider = Provider::new(
            &docker_cfg.name,
            RouteSource::Docker(DockerSource::new(&docker_cfg.host)),
        );
        let watcher = DockerWatcher::new(&docker_cfg.host);
        provider.start(&root, &watcher).await;
        providers.push(provider);
    }

    for agent_cfg in &config.providers.agent {
        let provider = Provider::new(
            &agent_cfg.name,
            RouteSource::Agent(AgentSource::new(&agent_cfg.addr)),
        );
        let watcher = DockerWatcher::new(&agent_cfg.addr);
        provider.start(&root, &watcher).await;
        providers.push(provider);
    }

    for file_cfg in &config.providers.file {
        let dir = file_cfg
            .path
            .parent()
            .context("file provider path has no parent")?
            .to_path_buf();
        let file_name = file_cfg
            .path
            .file_name()
            .with_context(|| format!("bad file provider path {}", file_cfg.path.display()))?
            .to_string_lossy()
            .to_string();

        if !dir_watchers.contains_key(&dir) {
            let watcher = DirWatcher::new(&root, &dir)
                .with_context(|| format!("watching {}", dir.display()))?;
            dir_watchers.insert(dir.clone(), watcher);
        }
        let file_watcher = dir_watchers[&dir].file(file_name);

        let provider = Provider::new(
            &file_cfg.name,
            RouteSource::File(FileSource::new(&file_cfg.path)),
        );
        provider.start(&root, &file_watcher).await;
        providers.push(provider);
    }

    for provider in &providers {
        let stats = provider.statistics();
        info!(provider = %stats.name, kind = stats.kind, routes = stats.routes, "provider ready");
    }
    let total: usize = providers.iter().map(|p| p.num_routes()).sum();
    info!(providers = providers.len(), routes = total, "ready");

    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
                break;
            }
            _ = sighup.recv() => {
                info!("received SIGHUP, reloading all providers");
                for provider in &providers {
                    provider.reload().await;
                }
                let total: usize = providers.iter().map(|p| p.num_routes()).sum();
                info!(routes = total, "reload complete");
            }
        }
    }

    for provider in &providers {
        provider.stop("shutting down").await;
    }
    graceful_shutdown(&registry, &root, config.server.shutdown_timeout()).await;

    Ok(())
}
