//! End-to-end reconciliation against a file provider: real files, real
//! watcher, real route lifecycles. Only the docker daemon is out of scope.

use std::sync::Arc;
use std::time::Duration;

use driftgate::provider::FileSource;
use driftgate::watcher::DirWatcher;
use driftgate::{Provider, RouteSource, TaskRegistry};

fn write_routes(path: &std::path::Path, doc: &str) {
    std::fs::write(path, doc).unwrap();
}

async fn file_provider(
    root: &driftgate::Task,
    path: &std::path::Path,
) -> (Arc<Provider>, DirWatcher) {
    let dir = path.parent().unwrap();
    let watcher = DirWatcher::new(root, dir).unwrap();
    let file_watcher = watcher.file(path.file_name().unwrap().to_string_lossy().to_string());

    let provider = Provider::new(
        "static",
        RouteSource::File(FileSource::new(path)),
    );
    provider.start(root, &file_watcher).await;
    (provider, watcher)
}

#[tokio::test]
async fn test_initial_load_starts_all_routes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("routes.yml");
    write_routes(&path, "a:\n  port: 1000\nb:\n  port: 2000\n");

    let registry = TaskRegistry::new();
    let root = registry.root_task("test");
    let (provider, _watcher) = file_provider(&root, &path).await;

    assert_eq!(provider.route_aliases(), vec!["a", "b"]);
    let a = provider.route("a").unwrap();
    assert!(a.started());
    assert_eq!(a.target_url(), "http://localhost:1000");

    provider.stop("test done").await;
    root.finish("test done").await;
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_reconcile_touches_only_changed_routes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("routes.yml");
    write_routes(&path, "a:\n  port: 1000\nb:\n  port: 2000\nc:\n  port: 3000\n");

    let registry = TaskRegistry::new();
    let root = registry.root_task("test");
    let (provider, _watcher) = file_provider(&root, &path).await;

    let a_before = provider.route("a").unwrap();
    let b_before = provider.route("b").unwrap();
    let c_before = provider.route("c").unwrap();

    // {a, b, c} -> {a, b, d}: exactly one removal and one addition
    write_routes(&path, "a:\n  port: 1000\nb:\n  port: 2000\nd:\n  port: 4000\n");
    provider.reload().await;

    assert_eq!(provider.route_aliases(), vec!["a", "b", "d"]);
    // untouched routes keep their identity (they were never restarted)
    assert!(Arc::ptr_eq(&a_before, &provider.route("a").unwrap()));
    assert!(Arc::ptr_eq(&b_before, &provider.route("b").unwrap()));
    assert!(!c_before.started(), "removed route must be stopped");
    assert!(provider.route("d").unwrap().started());

    provider.stop("test done").await;
    root.finish("test done").await;
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_changed_definition_restarts_the_route() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("routes.yml");
    write_routes(&path, "web:\n  port: 80\nother:\n  port: 5000\n");

    let registry = TaskRegistry::new();
    let root = registry.root_task("test");
    let (provider, _watcher) = file_provider(&root, &path).await;

    let before = provider.route("web").unwrap();
    let other_before = provider.route("other").unwrap();
    assert_eq!(before.target_url(), "http://localhost:80");

    write_routes(&path, "web:\n  port: 8080\nother:\n  port: 5000\n");
    provider.reload().await;

    let after = provider.route("web").unwrap();
    assert!(!Arc::ptr_eq(&before, &after), "updated route is a new instance");
    assert!(!before.started());
    assert!(after.started());
    assert_eq!(after.target_url(), "http://localhost:8080");
    // the unrelated alias is never touched
    assert!(Arc::ptr_eq(&other_before, &provider.route("other").unwrap()));

    provider.stop("test done").await;
    root.finish("test done").await;
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_reload_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("routes.yml");
    write_routes(&path, "web:\n  port: 8080\n");

    let registry = TaskRegistry::new();
    let root = registry.root_task("test");
    let (provider, _watcher) = file_provider(&root, &path).await;

    let before = provider.route("web").unwrap();
    provider.reload().await;
    provider.reload().await;
    assert!(
        Arc::ptr_eq(&before, &provider.route("web").unwrap()),
        "reloading an unchanged source must not bounce routes"
    );

    provider.stop("test done").await;
    root.finish("test done").await;
}

#[tokio::test]
async fn test_concurrent_reloads_never_double_start_a_route() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("routes.yml");
    write_routes(&path, "web:\n  port: 80\n");

    let registry = TaskRegistry::new();
    let root = registry.root_task("test");
    let (provider, _watcher) = file_provider(&root, &path).await;

    write_routes(&path, "web:\n  port: 8080\n");
    tokio::join!(provider.reload(), provider.reload());

    // one reload applies the change, the other sees an already-current table;
    // a lost race would leave an orphaned second task for the same alias
    let live: Vec<String> = registry
        .live_tasks()
        .into_iter()
        .filter(|n| n.ends_with(".route.web"))
        .collect();
    assert_eq!(live.len(), 1, "exactly one live task per alias: {live:?}");
    assert_eq!(
        provider.route("web").unwrap().target_url(),
        "http://localhost:8080"
    );

    provider.stop("test done").await;
    root.finish("test done").await;
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_broken_document_keeps_current_routes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("routes.yml");
    write_routes(&path, "web:\n  port: 8080\n");

    let registry = TaskRegistry::new();
    let root = registry.root_task("test");
    let (provider, _watcher) = file_provider(&root, &path).await;
    assert_eq!(provider.num_routes(), 1);

    write_routes(&path, "web: [broken");
    provider.reload().await;
    assert_eq!(provider.num_routes(), 1, "stale routes keep serving");
    assert!(provider.route("web").unwrap().started());

    // a fixed document reconciles normally again
    write_routes(&path, "web:\n  port: 9090\n");
    provider.reload().await;
    assert_eq!(
        provider.route("web").unwrap().target_url(),
        "http://localhost:9090"
    );

    provider.stop("test done").await;
    root.finish("test done").await;
}

#[tokio::test]
async fn test_deleted_file_removes_all_routes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("routes.yml");
    write_routes(&path, "web:\n  port: 8080\n");

    let registry = TaskRegistry::new();
    let root = registry.root_task("test");
    let (provider, _watcher) = file_provider(&root, &path).await;
    let route = provider.route("web").unwrap();

    std::fs::remove_file(&path).unwrap();
    provider.reload().await;

    assert_eq!(provider.num_routes(), 0);
    assert!(!route.started());

    provider.stop("test done").await;
    root.finish("test done").await;
}

#[tokio::test]
async fn test_file_change_reconciles_through_the_watcher() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("routes.yml");
    write_routes(&path, "web:\n  port: 80\n");

    let registry = TaskRegistry::new();
    let root = registry.root_task("test");
    let (provider, _watcher) = file_provider(&root, &path).await;
    assert_eq!(provider.route_aliases(), vec!["web"]);

    write_routes(&path, "web:\n  port: 80\napi:\n  port: 9000\n");

    // notify latency + debounce window
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if provider.num_routes() == 2 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "watcher never delivered the change"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(provider.route("api").unwrap().started());

    provider.stop("test done").await;
    root.finish("test done").await;
}
