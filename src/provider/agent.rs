//! Remote agent source: a docker engine exposed over HTTP by an agent on
//! another machine. Listing goes through the engine API; a cheap liveness
//! probe runs first so an unreachable agent fails fast with a clear error.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::docker::{self, Container};
use crate::entry::RawEntry;
use crate::error::{ErrorList, RouteError};

use super::docker::compile_all;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct AgentSource {
    addr: String,
    probe: reqwest::Client,
}

impl AgentSource {
    /// `addr` is the agent's engine endpoint, e.g. `http://10.0.1.5:2375`.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            probe: reqwest::Client::new(),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub async fn load(&self) -> (BTreeMap<String, RawEntry>, ErrorList) {
        let mut errs = ErrorList::new(format!("agent `{}`", self.addr));

        if let Err(err) = self.ping().await {
            errs.push(err);
            return (BTreeMap::new(), errs);
        }

        let client = match docker::connect(&self.addr) {
            Ok(client) => client,
            Err(err) => {
                errs.push(RouteError::connection(self.addr.as_str(), err));
                return (BTreeMap::new(), errs);
            }
        };
        let summaries = match docker::list_containers(&client).await {
            Ok(summaries) => summaries,
            Err(err) => {
                errs.push(RouteError::connection(self.addr.as_str(), err));
                return (BTreeMap::new(), errs);
            }
        };

        let containers: Vec<Arc<Container>> = summaries
            .iter()
            .map(|s| Arc::new(Container::from_summary(s, &self.addr)))
            .collect();

        let (entries, compile_errs) = compile_all(&containers);
        errs.extend(compile_errs);
        (entries, errs)
    }

    async fn ping(&self) -> Result<(), RouteError> {
        let url = format!("{}/_ping", self.addr.trim_end_matches('/'));
        let response = self
            .probe
            .get(&url)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .map_err(|err| RouteError::connection(self.addr.as_str(), err))?;
        if !response.status().is_success() {
            return Err(RouteError::connection(
                self.addr.as_str(),
                format!("ping returned {}", response.status()),
            ));
        }
        Ok(())
    }
}
