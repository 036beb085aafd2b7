//! TOML configuration
//!
//! One `[server]` table plus provider lists. Every provider needs a unique
//! name; it becomes the prefix of the provider's task tree and shows up in
//! every log line about its routes.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use serde::Deserialize;

use crate::docker::DOCKER_HOST_FROM_ENV;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    pub server: ServerConfig,
    pub providers: ProvidersConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ServerConfig {
    /// Seconds to wait for the task tree to drain on shutdown.
    pub shutdown_timeout_secs: u64,
    /// Re-raise recovered flush panics instead of logging them. Meant for
    /// development; production keeps reconciling after a panic.
    pub strict_panics: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout_secs: default_shutdown_timeout(),
            strict_panics: false,
        }
    }
}

fn default_shutdown_timeout() -> u64 {
    10
}

impl ServerConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ProvidersConfig {
    pub docker: Vec<DockerProviderConfig>,
    pub file: Vec<FileProviderConfig>,
    pub agent: Vec<AgentProviderConfig>,
}

impl ProvidersConfig {
    pub fn is_empty(&self) -> bool {
        self.docker.is_empty() && self.file.is_empty() && self.agent.is_empty()
    }

    fn names(&self) -> impl Iterator<Item = &str> {
        self.docker
            .iter()
            .map(|p| p.name.as_str())
            .chain(self.file.iter().map(|p| p.name.as_str()))
            .chain(self.agent.iter().map(|p| p.name.as_str()))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DockerProviderConfig {
    pub name: String,
    /// `unix:///...`, `tcp://host:port`, or `$DOCKER_HOST` to defer to the
    /// environment. Defaults to the environment.
    #[serde(default = "default_docker_host")]
    pub host: String,
}

fn default_docker_host() -> String {
    DOCKER_HOST_FROM_ENV.to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileProviderConfig {
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentProviderConfig {
    pub name: String,
    pub addr: String,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Config> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Config = toml::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let mut seen = HashSet::new();
        for name in self.providers.names() {
            if name.is_empty() {
                bail!("provider with empty name");
            }
            if !seen.insert(name) {
                bail!("duplicate provider name `{name}`");
            }
        }
        for file in &self.providers.file {
            if file.path.parent().is_none() {
                bail!(
                    "file provider `{}`: path `{}` has no parent directory to watch",
                    file.name,
                    file.path.display()
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config() {
        let config: Config = toml::from_str(
            r#"
[server]
shutdown_timeout_secs = 30
strict_panics = true

[[providers.docker]]
name = "local"
host = "unix:///var/run/docker.sock"

[[providers.file]]
name = "static"
path = "/etc/driftgate/routes.yml"

[[providers.agent]]
name = "edge"
addr = "http://10.0.1.5:2375"
"#,
        )
        .unwrap();
        config.validate().unwrap();

        assert_eq!(config.server.shutdown_timeout(), Duration::from_secs(30));
        assert!(config.server.strict_panics);
        assert_eq!(config.providers.docker[0].name, "local");
        assert_eq!(config.providers.file[0].name, "static");
        assert_eq!(config.providers.agent[0].addr, "http://10.0.1.5:2375");
    }

    #[test]
    fn test_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.shutdown_timeout(), Duration::from_secs(10));
        assert!(!config.server.strict_panics);
        assert!(config.providers.is_empty());
    }

    #[test]
    fn test_docker_host_defaults_to_environment() {
        let config: Config = toml::from_str(
            r#"
[[providers.docker]]
name = "local"
"#,
        )
        .unwrap();
        assert_eq!(config.providers.docker[0].host, DOCKER_HOST_FROM_ENV);
    }

    #[test]
    fn test_duplicate_provider_names_rejected() {
        let config: Config = toml::from_str(
            r#"
[[providers.docker]]
name = "main"

[[providers.file]]
name = "main"
path = "/etc/driftgate/routes.yml"
"#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_keys_rejected() {
        assert!(toml::from_str::<Config>("[server]\nbogus = 1\n").is_err());
    }
}
