//! Docker client connection and container metadata
//!
//! Connects to the container runtime and snapshots the per-container
//! metadata the label compiler and providers work from: declared aliases,
//! exclusion flags, database detection, port mappings and addresses.

use std::collections::HashMap;

use bollard::container::ListContainersOptions;
use bollard::Docker;
use tracing::debug;

/// Sentinel host value meaning "resolve from the environment"
pub const DOCKER_HOST_FROM_ENV: &str = "$DOCKER_HOST";

/// Top-level container labels consumed (and stripped) before namespace
/// parsing.
pub const LABEL_ALIASES: &str = "proxy.aliases";
pub const LABEL_EXCLUDE: &str = "proxy.exclude";
pub const LABEL_IDLE_TIMEOUT: &str = "proxy.idle_timeout";
pub const LABEL_WAKE_TIMEOUT: &str = "proxy.wake_timeout";
pub const LABEL_STOP_METHOD: &str = "proxy.stop_method";
pub const LABEL_STOP_TIMEOUT: &str = "proxy.stop_timeout";
pub const LABEL_STOP_SIGNAL: &str = "proxy.stop_signal";

/// Images that are almost certainly internal services (databases, search
/// engines) and should not be proxied unless explicitly aliased.
const IMAGE_BLACKLIST: &[&str] = &[
    "postgres",
    "mysql",
    "mariadb",
    "redis",
    "memcached",
    "mongo",
    "rabbitmq",
    "couchdb",
    "neo4j",
    "elasticsearch",
    "meilisearch",
    "kibana",
    "solr",
];

/// Well-known private ports of databases; containers exposing only these are
/// skipped unless explicitly aliased.
const DATABASE_PORTS: &[u16] = &[5432, 3306, 6379, 11211, 27017];

/// Connect to the Docker daemon.
///
/// Connection priority:
/// 1. Explicit host (`unix://...` or `tcp://...`)
/// 2. `DOCKER_HOST` environment variable (when host is the env sentinel)
/// 3. bollard's platform default socket
pub fn connect(host: &str) -> anyhow::Result<Docker> {
    let host = if host == DOCKER_HOST_FROM_ENV {
        match std::env::var("DOCKER_HOST") {
            Ok(h) => return connect(&h),
            Err(_) => {
                return Docker::connect_with_socket_defaults().map_err(|e| {
                    anyhow::anyhow!(
                        "Cannot connect to Docker daemon via default socket: {}. \
                         Set DOCKER_HOST or configure an explicit host.",
                        e
                    )
                })
            }
        }
    } else {
        host
    };

    if let Some(socket_path) = host.strip_prefix("unix://") {
        Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
            .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
    } else if host.starts_with("tcp://") || host.starts_with("http://") || host.starts_with("https://")
    {
        Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
            .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
    } else {
        anyhow::bail!(
            "Invalid docker host format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
            host
        )
    }
}

/// Snapshot of one container's proxy-relevant metadata
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Container {
    pub docker_host: String,
    pub id: String,
    pub name: String,
    /// Image name with registry and tag stripped
    pub image: String,

    /// Remaining labels after the top-level proxy labels were stripped
    pub labels: HashMap<String, String>,

    pub aliases: Vec<String>,
    pub is_excluded: bool,
    /// Carries an explicit `proxy.aliases` label
    pub is_explicit: bool,
    pub is_database: bool,

    pub idle_timeout: Option<String>,
    pub wake_timeout: Option<String>,
    pub stop_method: Option<String>,
    pub stop_timeout: Option<String>,
    pub stop_signal: Option<String>,

    pub public_ip: Option<String>,
    pub private_ip: Option<String>,
    /// Ascending, deduplicated
    pub private_ports: Vec<u16>,
    pub public_ports: Vec<u16>,

    pub running: bool,
}

impl Container {
    pub fn from_summary(summary: &bollard::models::ContainerSummary, docker_host: &str) -> Self {
        let mut labels = summary.labels.clone().unwrap_or_default();

        let name = summary
            .names
            .as_ref()
            .and_then(|n| n.first())
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_default();

        let aliases_label = labels.remove(LABEL_ALIASES).unwrap_or_default();
        let is_explicit = !aliases_label.is_empty();
        let aliases = if is_explicit {
            aliases_label
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        } else {
            vec![name.clone()]
        };

        let is_excluded = labels
            .remove(LABEL_EXCLUDE)
            .map(|v| parse_bool(&v))
            .unwrap_or(false);

        let image = short_image_name(summary.image.as_deref().unwrap_or_default());

        let mut private_ports = Vec::new();
        let mut public_ports = Vec::new();
        if let Some(ports) = &summary.ports {
            for p in ports {
                private_ports.push(p.private_port);
                if let Some(public) = p.public_port {
                    public_ports.push(public);
                }
            }
        }
        private_ports.sort_unstable();
        private_ports.dedup();
        public_ports.sort_unstable();
        public_ports.dedup();

        let is_database = is_database(&image, summary, &private_ports);

        let state = summary.state.as_deref().unwrap_or_default();
        let running = state == "running" || summary.status.as_deref() == Some("running");

        let private_ip = summary
            .network_settings
            .as_ref()
            .and_then(|ns| ns.networks.as_ref())
            .and_then(|networks| {
                networks
                    .values()
                    .filter_map(|ep| ep.ip_address.clone())
                    .find(|ip| !ip.is_empty())
            });

        let public_ip = if !running {
            None
        } else if docker_host.starts_with("unix://") {
            Some("127.0.0.1".to_string())
        } else {
            host_from_url(docker_host)
        };

        Self {
            docker_host: docker_host.to_string(),
            id: summary.id.clone().unwrap_or_default(),
            name,
            image,
            idle_timeout: labels.remove(LABEL_IDLE_TIMEOUT),
            wake_timeout: labels.remove(LABEL_WAKE_TIMEOUT),
            stop_method: labels.remove(LABEL_STOP_METHOD),
            stop_timeout: labels.remove(LABEL_STOP_TIMEOUT),
            stop_signal: labels.remove(LABEL_STOP_SIGNAL),
            labels,
            aliases,
            is_excluded,
            is_explicit,
            is_database,
            public_ip,
            private_ip,
            private_ports,
            public_ports,
            running,
        }
    }
}

fn is_database(
    image: &str,
    summary: &bollard::models::ContainerSummary,
    private_ports: &[u16],
) -> bool {
    if IMAGE_BLACKLIST.contains(&image) {
        return true;
    }
    if let Some(mounts) = &summary.mounts {
        for m in mounts {
            if let Some(dest) = &m.destination {
                if matches!(
                    dest.as_str(),
                    "/var/lib/postgresql/data" | "/var/lib/mysql" | "/data" | "/data/db"
                ) {
                    return true;
                }
            }
        }
    }
    private_ports.iter().any(|p| DATABASE_PORTS.contains(p))
}

/// List all containers on a client, including stopped ones (a stopped
/// container's entry should still compile so its route errors are reported).
pub async fn list_containers(
    client: &Docker,
) -> Result<Vec<bollard::models::ContainerSummary>, bollard::errors::Error> {
    let options = ListContainersOptions::<String> {
        all: true,
        ..Default::default()
    };
    let containers = client.list_containers(Some(options)).await?;
    debug!(count = containers.len(), "listed containers");
    Ok(containers)
}

pub fn parse_bool(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "true" | "yes" | "1")
}

/// `ghcr.io/acme/widget:latest` -> `widget`
fn short_image_name(image: &str) -> String {
    let no_tag = image.split(':').next().unwrap_or(image);
    no_tag.rsplit('/').next().unwrap_or(no_tag).to_string()
}

fn host_from_url(url: &str) -> Option<String> {
    let rest = url.split("://").nth(1)?;
    let host = rest.split(':').next()?;
    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::{ContainerSummary, Port};

    fn summary(name: &str, labels: &[(&str, &str)]) -> ContainerSummary {
        ContainerSummary {
            id: Some(format!("{name}-id")),
            names: Some(vec![format!("/{name}")]),
            image: Some("ghcr.io/acme/widget:latest".to_string()),
            labels: Some(
                labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            state: Some("running".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_aliases_default_to_container_name() {
        let c = Container::from_summary(&summary("widget", &[]), "unix:///var/run/docker.sock");
        assert_eq!(c.aliases, vec!["widget"]);
        assert!(!c.is_explicit);
        assert_eq!(c.image, "widget");
        assert_eq!(c.public_ip.as_deref(), Some("127.0.0.1"));
    }

    #[test]
    fn test_explicit_aliases_are_stripped_from_labels() {
        let c = Container::from_summary(
            &summary("widget", &[("proxy.aliases", "web, api"), ("proxy.web.port", "80")]),
            "unix:///var/run/docker.sock",
        );
        assert_eq!(c.aliases, vec!["web", "api"]);
        assert!(c.is_explicit);
        assert!(!c.labels.contains_key(LABEL_ALIASES));
        assert!(c.labels.contains_key("proxy.web.port"));
    }

    #[test]
    fn test_exclude_label() {
        let c = Container::from_summary(
            &summary("widget", &[("proxy.exclude", "true")]),
            "unix:///var/run/docker.sock",
        );
        assert!(c.is_excluded);
        assert!(!c.labels.contains_key(LABEL_EXCLUDE));
    }

    #[test]
    fn test_database_detection_by_port() {
        let mut s = summary("db", &[]);
        s.image = Some("postgres:16".to_string());
        let c = Container::from_summary(&s, "unix:///var/run/docker.sock");
        assert!(c.is_database);

        let mut s = summary("svc", &[]);
        s.ports = Some(vec![Port {
            private_port: 6379,
            ..Default::default()
        }]);
        let c = Container::from_summary(&s, "unix:///var/run/docker.sock");
        assert!(c.is_database);
    }

    #[test]
    fn test_public_ip_from_tcp_host() {
        let c = Container::from_summary(&summary("widget", &[]), "tcp://10.0.0.5:2375");
        assert_eq!(c.public_ip.as_deref(), Some("10.0.0.5"));
    }

    #[test]
    fn test_short_image_name() {
        assert_eq!(short_image_name("postgres:16"), "postgres");
        assert_eq!(short_image_name("ghcr.io/acme/widget:latest"), "widget");
        assert_eq!(short_image_name("nginx"), "nginx");
    }

    #[test]
    fn test_connect_rejects_bad_scheme() {
        assert!(connect("ftp://nope").is_err());
    }
}
