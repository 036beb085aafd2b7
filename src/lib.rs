//! driftgate: a reverse-proxy control plane
//!
//! Routes are reconciled from three kinds of sources: docker hosts (via
//! container labels), declarative YAML files, and remote agents. Watchers
//! turn source changes into debounced event batches; each batch triggers a
//! minimal diff of the provider's route table. Everything runs inside a
//! structured task tree so shutdown can name whatever refuses to drain.

pub mod config;
pub mod docker;
pub mod entry;
pub mod error;
pub mod labels;
pub mod provider;
pub mod route;
pub mod task;
pub mod watcher;

pub use config::Config;
pub use entry::RawEntry;
pub use error::{ErrorList, RouteError};
pub use provider::{Provider, ProviderStats, RouteSource};
pub use route::Route;
pub use task::{graceful_shutdown, Task, TaskRegistry};
