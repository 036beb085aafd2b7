//! Batch reconciliation: turn a flushed event batch into the minimal set of
//! route stops and starts.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use tracing::{debug, info, warn};

use crate::entry::RawEntry;
use crate::error::{ErrorList, RouteError};
use crate::route::Route;
use crate::task::Task;
use crate::watcher::Event;

use super::Provider;

/// Reconcile the provider's route table against a fresh load of its source.
///
/// Removals and additions always apply. An existing route with a changed
/// definition is only restarted when the batch actually names it, so an
/// unrelated container's restart never bounces its neighbors. The flush task
/// scopes this one pass; started routes live under the provider's task.
pub(super) async fn reconcile(provider: &Arc<Provider>, batch: Vec<Event>, flush_task: Task) {
    // queue flushes are already serialized; this additionally serializes
    // operator reloads against them, so two passes never race one table
    let _gate = provider.reconcile_gate.lock().await;
    let Some(provider_task) = provider.task() else {
        // provider already stopped, nothing to reconcile against
        return;
    };

    let force = batch.iter().any(|e| e.action.is_force_reload());
    let (new_entries, errs) = provider.source().load().await;

    if !errs.is_empty() {
        if source_failure(&errs) {
            warn!(
                provider = %provider.name(),
                routes = provider.num_routes(),
                "source unavailable, keeping current routes: {errs}"
            );
            return;
        }
        warn!(provider = %provider.name(), "{errs}");
    }

    apply(provider, &provider_task, new_entries, &batch, force, &flush_task).await;
}

/// One per-alias outcome of a reconcile pass.
enum Applied {
    Kept(String, Arc<Route>),
    Added(String, Arc<Route>),
    Updated(String, Arc<Route>),
    Removed,
    Failed,
}

/// Diff the current table against `new_entries` and perform the resulting
/// stops and starts. Aliases are independent, so their actions run in
/// parallel; within one alias the old route is always stopped before its
/// replacement starts.
async fn apply(
    provider: &Arc<Provider>,
    provider_task: &Task,
    new_entries: BTreeMap<String, RawEntry>,
    batch: &[Event],
    force: bool,
    flush_task: &Task,
) {
    let old = provider.routes_snapshot();
    let mut actions: Vec<BoxFuture<'static, Applied>> = Vec::new();

    for (alias, route) in &old {
        if new_entries.contains_key(alias) {
            continue;
        }
        let provider = Arc::clone(provider);
        let route = Arc::clone(route);
        actions.push(
            async move {
                if let Err(err) = route.stop("route removed").await {
                    warn!(provider = %provider.name(), %err, "failed to stop removed route");
                }
                Applied::Removed
            }
            .boxed(),
        );
    }

    for (alias, entry) in new_entries {
        let existing = old.get(&alias).map(Arc::clone);
        let restart = match &existing {
            None => true,
            Some(existing) => {
                let mut candidate = entry.clone();
                candidate.finalize();
                candidate != *existing.entry() && (force || batch_names(batch, existing))
            }
        };
        if !restart {
            if let Some(existing) = existing {
                actions.push(async move { Applied::Kept(alias, existing) }.boxed());
            }
            continue;
        }

        let provider = Arc::clone(provider);
        let provider_task = provider_task.clone();
        actions.push(
            async move {
                let outdated = existing.is_some();
                if let Some(existing) = existing {
                    if let Err(err) = existing.stop("route updated").await {
                        warn!(provider = %provider.name(), %err, "failed to stop outdated route");
                    }
                }
                let route = Route::new(provider.name(), entry);
                match route.start(&provider_task) {
                    Ok(()) if outdated => Applied::Updated(alias, route),
                    Ok(()) => Applied::Added(alias, route),
                    Err(err) => {
                        warn!(provider = %provider.name(), %err, "failed to start route");
                        Applied::Failed
                    }
                }
            }
            .boxed(),
        );
    }

    let mut next: BTreeMap<String, Arc<Route>> = BTreeMap::new();
    let (mut added, mut removed, mut updated, mut failed) = (0usize, 0usize, 0usize, 0usize);
    for outcome in join_all(actions).await {
        match outcome {
            Applied::Kept(alias, route) => {
                next.insert(alias, route);
            }
            Applied::Added(alias, route) => {
                next.insert(alias, route);
                added += 1;
            }
            Applied::Updated(alias, route) => {
                next.insert(alias, route);
                updated += 1;
            }
            Applied::Removed => removed += 1,
            Applied::Failed => failed += 1,
        }
    }

    provider.replace_routes(next);

    if added + removed + updated + failed > 0 {
        info!(
            provider = %provider.name(),
            task = %flush_task.name(),
            events = batch.len(),
            added,
            removed,
            updated,
            failed,
            total = provider.num_routes(),
            "routes reconciled"
        );
    } else {
        debug!(
            provider = %provider.name(),
            task = %flush_task.name(),
            events = batch.len(),
            "no route changes"
        );
    }
}

/// True when the whole load failed at the source level (unreachable host or
/// unparseable document) rather than per-route compile errors.
fn source_failure(errs: &ErrorList) -> bool {
    errs.iter().all(|e| {
        matches!(
            e,
            RouteError::Connection { .. } | RouteError::InvalidDocument { .. }
        )
    })
}

/// Whether the batch names this route's actor. File events carry no actor
/// identity, so any file change names every route of a file provider.
fn batch_names(batch: &[Event], route: &Route) -> bool {
    match &route.entry().container {
        Some(container) => batch
            .iter()
            .any(|e| e.actor_id == container.id || e.actor_name == container.name),
        None => true,
    }
}
