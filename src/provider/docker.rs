//! Docker route source: lists containers on one host and compiles their
//! labels into route entries.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::docker::{self, Container};
use crate::entry::RawEntry;
use crate::error::{ErrorList, RouteError};
use crate::labels;

pub struct DockerSource {
    host: String,
}

impl DockerSource {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub async fn load(&self) -> (BTreeMap<String, RawEntry>, ErrorList) {
        let mut errs = ErrorList::new(format!("docker host `{}`", self.host));

        let client = match docker::connect(&self.host) {
            Ok(client) => client,
            Err(err) => {
                errs.push(RouteError::connection(self.host.as_str(), err));
                return (BTreeMap::new(), errs);
            }
        };
        let summaries = match docker::list_containers(&client).await {
            Ok(summaries) => summaries,
            Err(err) => {
                errs.push(RouteError::connection(self.host.as_str(), err));
                return (BTreeMap::new(), errs);
            }
        };

        let containers: Vec<Arc<Container>> = summaries
            .iter()
            .map(|s| Arc::new(Container::from_summary(s, &self.host)))
            .collect();

        let (entries, compile_errs) = compile_all(&containers);
        errs.extend(compile_errs);
        (entries, errs)
    }
}

/// Compile every eligible container and merge the results. An alias declared
/// by more than one container is dropped from ALL of them and reported, so a
/// copy-pasted label never silently hijacks an existing route.
pub(super) fn compile_all(containers: &[Arc<Container>]) -> (BTreeMap<String, RawEntry>, ErrorList) {
    let mut errs = ErrorList::new("container labels");
    let mut entries: BTreeMap<String, RawEntry> = BTreeMap::new();
    let mut owners: BTreeMap<String, String> = BTreeMap::new();
    let mut dropped: std::collections::BTreeSet<String> = std::collections::BTreeSet::new();

    for container in containers {
        if should_skip(container) {
            debug!(container = %container.name, "skipped container");
            continue;
        }
        let (compiled, compile_errs) = labels::compile_entries(container);
        errs.extend(compile_errs);

        for (alias, entry) in compiled {
            if dropped.contains(&alias) {
                errs.push(RouteError::DuplicateAlias {
                    alias: alias.clone(),
                    first: owners[&alias].clone(),
                    second: container.name.clone(),
                });
                continue;
            }
            if let Some(first) = owners.get(&alias) {
                errs.push(RouteError::DuplicateAlias {
                    alias: alias.clone(),
                    first: first.clone(),
                    second: container.name.clone(),
                });
                entries.remove(&alias);
                dropped.insert(alias);
                continue;
            }
            owners.insert(alias.clone(), container.name.clone());
            entries.insert(alias, entry);
        }
    }

    (entries, errs)
}

/// Containers that never produce routes: explicitly excluded ones, databases
/// without explicit labels, blue-green leftovers (`-old` suffix) and stopped
/// containers with no idle-wake configuration.
fn should_skip(container: &Container) -> bool {
    if container.is_excluded {
        return true;
    }
    if container.is_database && !container.is_explicit {
        return true;
    }
    if container.name.ends_with("-old") {
        return true;
    }
    !container.running && container.idle_timeout.is_none()
}
