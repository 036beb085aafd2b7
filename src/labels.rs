//! Label compiler: container labels -> route entries
//!
//! Turns a container's flat `proxy.*` label map into named [`RawEntry`]s.
//! Labels are parsed as `proxy.<target>.<attribute>` (a two-segment
//! `proxy.<target>` key carries a YAML mapping of attributes). Targets may be
//! an alias, the wildcard `*`, or a positional alias reference `#N`
//! (legacy `$N`). Errors are collected per label and never abort the
//! compilation; valid entries always survive errors in unrelated labels.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::warn;

use crate::docker::Container;
use crate::entry::{parse_duration, HealthCheckConfig, HomepageItem, RawEntry};
use crate::error::{ErrorList, RouteError};

pub const NAMESPACE: &str = "proxy";
pub const WILDCARD_TARGET: &str = "*";
const ALIAS_REF_SIGIL: char = '#';
const ALIAS_REF_SIGIL_LEGACY: char = '$';

/// A label value: either a scalar string or a nested mapping built from
/// deeper label segments (or an inline YAML block).
#[derive(Debug, Clone, PartialEq)]
pub enum LabelValue {
    Str(String),
    Map(BTreeMap<String, LabelValue>),
}

impl LabelValue {
    fn as_str(&self) -> Option<&str> {
        match self {
            LabelValue::Str(s) => Some(s),
            LabelValue::Map(_) => None,
        }
    }

    fn as_map(&self) -> Option<&BTreeMap<String, LabelValue>> {
        match self {
            LabelValue::Str(_) => None,
            LabelValue::Map(m) => Some(m),
        }
    }
}

/// Parse the `proxy.*` labels of a container into a per-target attribute
/// map. Labels outside the namespace are ignored; malformed ones are
/// collected as errors.
pub fn parse_labels(
    labels: &std::collections::HashMap<String, String>,
) -> (BTreeMap<String, BTreeMap<String, LabelValue>>, ErrorList) {
    let mut targets: BTreeMap<String, BTreeMap<String, LabelValue>> = BTreeMap::new();
    let mut errs = ErrorList::new("label errors");

    // sorted iteration keeps error output and map construction deterministic
    let mut keys: Vec<&String> = labels.keys().collect();
    keys.sort();

    for key in keys {
        let value = &labels[key];
        let mut parts = key.split('.');
        if parts.next() != Some(NAMESPACE) {
            continue;
        }
        let Some(target) = parts.next() else {
            errs.push(RouteError::InvalidLabel {
                label: key.clone(),
                reason: "missing target".to_string(),
            });
            continue;
        };
        if target.is_empty() {
            errs.push(RouteError::InvalidLabel {
                label: key.clone(),
                reason: "empty alias".to_string(),
            });
            continue;
        }

        let rest: Vec<&str> = parts.collect();
        if rest.is_empty() {
            // `proxy.<target>` with a YAML mapping of attributes as value
            match yaml_attribute_map(value) {
                Ok(attrs) => {
                    targets.entry(target.to_string()).or_default().extend(attrs);
                }
                Err(reason) => errs.push(RouteError::InvalidValue {
                    label: key.clone(),
                    reason,
                }),
            }
            continue;
        }
        if rest.iter().any(|segment| segment.is_empty()) {
            errs.push(RouteError::InvalidLabel {
                label: key.clone(),
                reason: "empty attribute segment".to_string(),
            });
            continue;
        }

        let attrs = targets.entry(target.to_string()).or_default();
        if let Err(reason) = insert_nested(attrs, &rest, value) {
            errs.push(RouteError::InvalidLabel {
                label: key.clone(),
                reason,
            });
        }
    }

    (targets, errs)
}

/// Insert `proxy.<target>.a.b.c = value` as `a -> b -> c -> value`.
fn insert_nested(
    map: &mut BTreeMap<String, LabelValue>,
    path: &[&str],
    value: &str,
) -> Result<(), String> {
    let Some((head, tail)) = path.split_first() else {
        return Ok(());
    };
    if tail.is_empty() {
        map.insert(head.to_string(), LabelValue::Str(value.to_string()));
        return Ok(());
    }
    let slot = map
        .entry(head.to_string())
        .or_insert_with(|| LabelValue::Map(BTreeMap::new()));
    match slot {
        LabelValue::Map(inner) => insert_nested(inner, tail, value),
        LabelValue::Str(_) => Err(format!("`{head}` is both a value and a mapping")),
    }
}

/// Parse a YAML mapping value (`proxy.web: "port: 80\nscheme: http"`).
fn yaml_attribute_map(value: &str) -> Result<BTreeMap<String, LabelValue>, String> {
    let parsed: serde_yaml::Value =
        serde_yaml::from_str(value).map_err(|e| format!("invalid YAML: {e}"))?;
    let serde_yaml::Value::Mapping(mapping) = parsed else {
        return Err("expected a YAML mapping of attributes".to_string());
    };
    let mut out = BTreeMap::new();
    for (k, v) in mapping {
        let key = match k {
            serde_yaml::Value::String(s) => s,
            other => return Err(format!("non-string attribute key {other:?}")),
        };
        out.insert(key, yaml_to_label_value(v)?);
    }
    Ok(out)
}

fn yaml_to_label_value(value: serde_yaml::Value) -> Result<LabelValue, String> {
    Ok(match value {
        serde_yaml::Value::String(s) => LabelValue::Str(s),
        serde_yaml::Value::Number(n) => LabelValue::Str(n.to_string()),
        serde_yaml::Value::Bool(b) => LabelValue::Str(b.to_string()),
        serde_yaml::Value::Mapping(m) => {
            let mut out = BTreeMap::new();
            for (k, v) in m {
                let key = match k {
                    serde_yaml::Value::String(s) => s,
                    other => return Err(format!("non-string attribute key {other:?}")),
                };
                out.insert(key, yaml_to_label_value(v)?);
            }
            LabelValue::Map(out)
        }
        serde_yaml::Value::Sequence(seq) => {
            // re-render lists as YAML so the list-typed decoders handle them
            let rendered = serde_yaml::to_string(&seq).map_err(|e| e.to_string())?;
            LabelValue::Str(rendered)
        }
        other => return Err(format!("unsupported attribute value {other:?}")),
    })
}

/// Compile a container's labels into a map of alias -> entry.
///
/// Always returns a (possibly partial) entry map even when errors were
/// collected. Wildcard attributes are applied after all per-alias labels so
/// explicit values are never overwritten.
pub fn compile_entries(container: &Arc<Container>) -> (BTreeMap<String, RawEntry>, ErrorList) {
    let mut entries: BTreeMap<String, RawEntry> = BTreeMap::new();
    let mut errs = ErrorList::new(format!("labels of `{}`", container.name));

    for alias in &container.aliases {
        if alias.is_empty() {
            errs.push(RouteError::InvalidLabel {
                label: crate::docker::LABEL_ALIASES.to_string(),
                reason: "empty alias".to_string(),
            });
            continue;
        }
        entries.insert(
            alias.clone(),
            RawEntry::new(alias.clone(), Some(Arc::clone(container))),
        );
    }

    let (mut targets, parse_errs) = parse_labels(&container.labels);
    errs.extend(parse_errs);

    let wildcard = targets.remove(WILDCARD_TARGET);

    for (target, attrs) in targets {
        let label_prefix = format!("{NAMESPACE}.{target}");
        let alias = match resolve_target(&target, container, &label_prefix) {
            Ok(alias) => alias,
            Err(err) => {
                errs.push(err);
                continue;
            }
        };

        let entry = entries
            .entry(alias.clone())
            .or_insert_with(|| RawEntry::new(alias, Some(Arc::clone(container))));
        apply_attributes(entry, &attrs, &label_prefix, true, &mut errs);
    }

    if let Some(wildcard_attrs) = wildcard {
        let prefix = format!("{NAMESPACE}.{WILDCARD_TARGET}");
        for entry in entries.values_mut() {
            apply_attributes(entry, &wildcard_attrs, &prefix, false, &mut errs);
        }
    }

    (entries, errs)
}

/// Resolve a label target to an alias: plain aliases pass through, `#N`
/// (or legacy `$N`) resolves positionally against the declared alias list.
fn resolve_target(
    target: &str,
    container: &Container,
    label: &str,
) -> Result<String, RouteError> {
    let mut chars = target.chars();
    let sigil = match chars.next() {
        Some(c) if c == ALIAS_REF_SIGIL || c == ALIAS_REF_SIGIL_LEGACY => c,
        _ => return Ok(target.to_string()),
    };
    if sigil == ALIAS_REF_SIGIL_LEGACY {
        warn!(
            label,
            container = %container.name,
            "`$N` alias references are deprecated, use `#N`"
        );
    }

    let reference: String = chars.collect();
    let index: usize = reference.parse().map_err(|_| RouteError::AliasRefNotInteger {
        label: label.to_string(),
        reference: target.to_string(),
    })?;
    if index < 1 || index > container.aliases.len() {
        return Err(RouteError::AliasRefOutOfRange {
            label: label.to_string(),
            reference: target.to_string(),
            alias_count: container.aliases.len(),
        });
    }
    Ok(container.aliases[index - 1].clone())
}

/// Type-directed application of an attribute map onto one entry.
///
/// With `overwrite` false (the wildcard pass) attributes only land on fields
/// that are still unset.
fn apply_attributes(
    entry: &mut RawEntry,
    attrs: &BTreeMap<String, LabelValue>,
    label_prefix: &str,
    overwrite: bool,
    errs: &mut ErrorList,
) {
    for (attr, value) in attrs {
        let label = format!("{label_prefix}.{attr}");
        if let Err(err) = apply_attribute(entry, attr, value, &label, overwrite) {
            errs.push(err);
        }
    }
}

fn apply_attribute(
    entry: &mut RawEntry,
    attr: &str,
    value: &LabelValue,
    label: &str,
    overwrite: bool,
) -> Result<(), RouteError> {
    match attr {
        "scheme" => {
            let v = expect_str(value, label)?;
            if overwrite || entry.scheme.is_none() {
                entry.scheme = Some(v.to_string());
            }
        }
        "host" => {
            let v = expect_str(value, label)?;
            if overwrite || entry.host.is_none() {
                entry.host = Some(v.to_string());
            }
        }
        "port" => {
            let v = expect_str(value, label)?;
            if overwrite || entry.port.is_none() {
                entry.port = Some(v.to_string());
            }
        }
        "no_tls_verify" => {
            let v = parse_strict_bool(expect_str(value, label)?).ok_or_else(|| {
                RouteError::InvalidValue {
                    label: label.to_string(),
                    reason: "expected a boolean".to_string(),
                }
            })?;
            if overwrite || !entry.no_tls_verify {
                entry.no_tls_verify = v;
            }
        }
        "path_patterns" => {
            let v = parse_string_list(expect_str(value, label)?, label)?;
            if overwrite || entry.path_patterns.is_empty() {
                entry.path_patterns = v;
            }
        }
        "middlewares" => {
            let map = value.as_map().ok_or_else(|| RouteError::InvalidValue {
                label: label.to_string(),
                reason: "expected middleware mappings".to_string(),
            })?;
            let mut middlewares = BTreeMap::new();
            for (name, options) in map {
                let options_map = options.as_map().ok_or_else(|| RouteError::InvalidValue {
                    label: format!("{label}.{name}"),
                    reason: "expected an options mapping".to_string(),
                })?;
                let mut out = BTreeMap::new();
                for (opt, opt_value) in options_map {
                    out.insert(opt.clone(), label_value_to_yaml(opt_value));
                }
                middlewares.insert(name.clone(), out);
            }
            if overwrite || entry.middlewares.is_empty() {
                entry.middlewares = middlewares;
            }
        }
        "healthcheck" => {
            let hc = decode_healthcheck(value, label)?;
            if overwrite || entry.healthcheck.is_none() {
                entry.healthcheck = Some(hc);
            }
        }
        "homepage" => {
            let hp = decode_homepage(value, label)?;
            if overwrite || entry.homepage.is_none() {
                entry.homepage = Some(hp);
            }
        }
        _ => {
            return Err(RouteError::UnknownAttribute {
                label: label.to_string(),
                attribute: attr.to_string(),
            })
        }
    }
    Ok(())
}

fn decode_healthcheck(value: &LabelValue, label: &str) -> Result<HealthCheckConfig, RouteError> {
    let map = value.as_map().ok_or_else(|| RouteError::InvalidValue {
        label: label.to_string(),
        reason: "expected a mapping".to_string(),
    })?;
    let mut hc = HealthCheckConfig::default();
    for (key, v) in map {
        let sub_label = format!("{label}.{key}");
        match key.as_str() {
            "disable" => {
                hc.disable = parse_strict_bool(expect_str(v, &sub_label)?).ok_or_else(|| {
                    RouteError::InvalidValue {
                        label: sub_label.clone(),
                        reason: "expected a boolean".to_string(),
                    }
                })?
            }
            "path" => hc.path = Some(expect_str(v, &sub_label)?.to_string()),
            "use_get" => {
                hc.use_get = parse_strict_bool(expect_str(v, &sub_label)?).ok_or_else(|| {
                    RouteError::InvalidValue {
                        label: sub_label.clone(),
                        reason: "expected a boolean".to_string(),
                    }
                })?
            }
            "interval" => {
                hc.interval = Some(parse_duration(expect_str(v, &sub_label)?).map_err(|reason| {
                    RouteError::InvalidValue {
                        label: sub_label.clone(),
                        reason,
                    }
                })?)
            }
            other => {
                return Err(RouteError::UnknownAttribute {
                    label: sub_label,
                    attribute: other.to_string(),
                })
            }
        }
    }
    Ok(hc)
}

fn decode_homepage(value: &LabelValue, label: &str) -> Result<HomepageItem, RouteError> {
    let map = value.as_map().ok_or_else(|| RouteError::InvalidValue {
        label: label.to_string(),
        reason: "expected a mapping".to_string(),
    })?;
    let mut hp = HomepageItem {
        show: true,
        ..Default::default()
    };
    for (key, v) in map {
        let sub_label = format!("{label}.{key}");
        let text = expect_str(v, &sub_label)?;
        match key.as_str() {
            "show" => {
                hp.show = parse_strict_bool(text).ok_or_else(|| RouteError::InvalidValue {
                    label: sub_label.clone(),
                    reason: "expected a boolean".to_string(),
                })?
            }
            "name" => hp.name = Some(text.to_string()),
            "icon" => hp.icon = Some(text.to_string()),
            "description" => hp.description = Some(text.to_string()),
            "category" => hp.category = Some(text.to_string()),
            other => {
                return Err(RouteError::UnknownAttribute {
                    label: sub_label,
                    attribute: other.to_string(),
                })
            }
        }
    }
    Ok(hp)
}

fn expect_str<'a>(value: &'a LabelValue, label: &str) -> Result<&'a str, RouteError> {
    value.as_str().ok_or_else(|| RouteError::InvalidValue {
        label: label.to_string(),
        reason: "expected a scalar value".to_string(),
    })
}

fn parse_strict_bool(s: &str) -> Option<bool> {
    match s.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Some(true),
        "false" | "no" | "0" => Some(false),
        _ => None,
    }
}

/// `a, b, c` or a YAML block list (`- a\n- b`).
fn parse_string_list(value: &str, label: &str) -> Result<Vec<String>, RouteError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    if trimmed.starts_with('-') {
        return serde_yaml::from_str::<Vec<String>>(trimmed).map_err(|e| RouteError::InvalidValue {
            label: label.to_string(),
            reason: format!("invalid YAML list: {e}"),
        });
    }
    Ok(trimmed
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect())
}

fn label_value_to_yaml(value: &LabelValue) -> serde_yaml::Value {
    match value {
        LabelValue::Str(s) => serde_yaml::Value::String(s.clone()),
        LabelValue::Map(m) => {
            let mut mapping = serde_yaml::Mapping::new();
            for (k, v) in m {
                mapping.insert(
                    serde_yaml::Value::String(k.clone()),
                    label_value_to_yaml(v),
                );
            }
            serde_yaml::Value::Mapping(mapping)
        }
    }
}
