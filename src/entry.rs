//! Raw route entries
//!
//! A [`RawEntry`] is the compiled, provider-agnostic description of one
//! route, before validation: built by the label compiler for docker sources
//! or deserialized straight from a YAML document for file sources.
//! `finalize` fills in defaults from the originating container's metadata.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::docker::Container;

/// Default ports for well-known images, used when a docker entry declares no
/// port of its own.
const IMAGE_PORT_MAP: &[(&str, u16)] = &[
    ("nginx", 80),
    ("httpd", 80),
    ("caddy", 80),
    ("grafana", 3000),
    ("gitea", 3000),
    ("prometheus", 9090),
    ("alertmanager", 9093),
    ("adguardhome", 3000),
    ("home-assistant", 8123),
    ("homeassistant", 8123),
    ("jellyfin", 8096),
    ("portainer", 9000),
    ("vaultwarden", 80),
];

/// Health-monitor options attached to an entry
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthCheckConfig {
    #[serde(default)]
    pub disable: bool,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub use_get: bool,
    #[serde(default, deserialize_with = "de_opt_duration")]
    pub interval: Option<Duration>,
}

/// Homepage/dashboard metadata attached to an entry
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HomepageItem {
    #[serde(default = "default_true")]
    pub show: bool,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Middleware name -> option name -> option value
pub type MiddlewareOptions = BTreeMap<String, BTreeMap<String, serde_yaml::Value>>;

/// The not-yet-validated description of one route.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawEntry {
    #[serde(skip)]
    pub alias: String,

    #[serde(default)]
    pub scheme: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default, deserialize_with = "de_opt_stringish")]
    pub port: Option<String>,
    #[serde(default)]
    pub no_tls_verify: bool,
    #[serde(default)]
    pub path_patterns: Vec<String>,
    #[serde(default)]
    pub middlewares: MiddlewareOptions,
    #[serde(default)]
    pub healthcheck: Option<HealthCheckConfig>,
    #[serde(default)]
    pub homepage: Option<HomepageItem>,

    /// Back-reference to the originating container, docker sources only
    #[serde(skip)]
    pub container: Option<Arc<Container>>,
}

impl RawEntry {
    pub fn new(alias: impl Into<String>, container: Option<Arc<Container>>) -> Self {
        Self {
            alias: alias.into(),
            container,
            ..Default::default()
        }
    }

    /// Fill unset fields from container metadata and well-known defaults.
    /// Idempotent; recomputing with no underlying change yields an identical
    /// entry.
    pub fn finalize(&mut self) {
        let container = self.container.clone();

        if self.host.is_none() {
            self.host = container
                .as_ref()
                .and_then(|c| c.private_ip.clone().or_else(|| c.public_ip.clone()))
                .or_else(|| Some("localhost".to_string()));
        }

        if self.port.is_none() {
            if let Some(c) = container.as_ref() {
                if let Some((_, port)) = IMAGE_PORT_MAP.iter().find(|(img, _)| *img == c.image) {
                    self.port = Some(port.to_string());
                } else if let Some(p) = c.private_ports.first() {
                    self.port = Some(p.to_string());
                } else if let Some(p) = c.public_ports.first() {
                    self.port = Some(p.to_string());
                }
            }
            if self.port.is_none() {
                self.port = Some(if self.scheme.as_deref() == Some("https") {
                    "443".to_string()
                } else {
                    "80".to_string()
                });
            }
        }

        if self.scheme.is_none() {
            self.scheme = Some(match self.port.as_deref() {
                Some("443") => "https".to_string(),
                _ => "http".to_string(),
            });
        }
    }

    /// The resolved backend port; only meaningful after `finalize`.
    pub fn resolved_port(&self) -> Option<u16> {
        self.port.as_deref().and_then(|p| p.parse().ok())
    }
}

/// Accept YAML numbers where strings are expected (`port: 8080`).
fn de_opt_stringish<'de, D: Deserializer<'de>>(de: D) -> Result<Option<String>, D::Error> {
    let value = Option::<serde_yaml::Value>::deserialize(de)?;
    Ok(match value {
        None | Some(serde_yaml::Value::Null) => None,
        Some(serde_yaml::Value::String(s)) => Some(s),
        Some(serde_yaml::Value::Number(n)) => Some(n.to_string()),
        Some(other) => {
            return Err(serde::de::Error::custom(format!(
                "expected string or number, got {other:?}"
            )))
        }
    })
}

fn de_opt_duration<'de, D: Deserializer<'de>>(de: D) -> Result<Option<Duration>, D::Error> {
    let value = Option::<serde_yaml::Value>::deserialize(de)?;
    Ok(match value {
        None | Some(serde_yaml::Value::Null) => None,
        Some(serde_yaml::Value::String(s)) => {
            Some(parse_duration(&s).map_err(serde::de::Error::custom)?)
        }
        Some(serde_yaml::Value::Number(n)) => {
            let secs = n
                .as_u64()
                .ok_or_else(|| serde::de::Error::custom("negative duration"))?;
            Some(Duration::from_secs(secs))
        }
        Some(other) => {
            return Err(serde::de::Error::custom(format!(
                "expected duration, got {other:?}"
            )))
        }
    })
}

/// Parse `300ms`, `30s`, `5m`, `1h` or a bare number of seconds.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    let (num, unit): (&str, &str) = match s.find(|c: char| c.is_ascii_alphabetic()) {
        Some(idx) => (&s[..idx], &s[idx..]),
        None => (s, "s"),
    };
    let value: u64 = num
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration `{s}`"))?;
    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        _ => Err(format!("invalid duration unit `{unit}` in `{s}`")),
    }
}
