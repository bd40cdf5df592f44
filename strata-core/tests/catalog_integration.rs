//! Integration tests for the service catalog.
//!
//! Seeds an on-disk SQLite store from a directory of JSON specs and drives the
//! catalog through the same calls the daemon makes.
//!
//! ```bash
//! cargo test -p strata-core --test catalog_integration
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use strata_core::catalog::load_specs;
use strata_core::types::{stack_service_id, Dependency};
use strata_core::{
    volumes, Account, Caller, CatalogScope, CatalogView, DependencyGraph, ErrorKind,
    ServiceCatalog, ServiceSpec, Stack, StackService, StackStore, StateManager, StrataError,
};
use tempfile::TempDir;

const POSTGRES: &str = r#"{
    "key": "postgres",
    "label": "PostgreSQL",
    "image": "postgres:16",
    "ports": [{"port": 5432}],
    "config": [
        {"name": "POSTGRES_PASSWORD", "value": "changeme", "canOverride": true, "isPassword": true},
        {"name": "PGDATA", "value": "/var/lib/postgresql/data"}
    ],
    "volumeMounts": [{"name": "data", "mountPath": "/var/lib/postgresql/data"}]
}"#;

const WIKI: &str = r#"{
    "key": "wiki",
    "image": "mediawiki:1.41",
    "ports": [{"port": 80, "protocol": "http"}],
    "access": "external",
    "dependencies": [{"key": "postgres", "required": true, "shareConfig": true}]
}"#;

const LICENSES: &str = r#"{
    "terms": [
        {"id": "apache-2.0", "name": "Apache License 2.0"},
        {"id": "mit", "name": "MIT License"}
    ]
}"#;

fn write(root: &Path, relative: &str, contents: &str) {
    let path = root.join(relative);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}

async fn seeded() -> (Arc<StateManager>, ServiceCatalog, TempDir) {
    let dir = TempDir::new().unwrap();
    let specs = dir.path().join("specs");
    write(&specs, "databases/postgres.json", POSTGRES);
    write(&specs, "apps/wiki.json", WIKI);
    write(&specs, "apps/README.md", "not a spec");
    write(&specs, "vocab/licenses.json", LICENSES);

    let store = Arc::new(StateManager::new(dir.path().join("strata.db")).await.unwrap());
    let summary = load_specs(&*store, &specs).await.unwrap();
    assert_eq!(summary.services, 2);
    assert_eq!(summary.vocabularies, 1);
    assert!(summary.skipped.is_empty());

    let catalog = ServiceCatalog::new(store.clone());
    (store, catalog, dir)
}

#[tokio::test]
async fn test_seeded_catalog_resolves_across_tiers() {
    let (_store, catalog, _dir) = seeded().await;
    let admin = Caller::admin();
    let alice = Caller::user("alice");

    let system = catalog.list(&admin, CatalogView::System).await.unwrap();
    assert_eq!(system.iter().map(|s| s.key.as_str()).collect::<Vec<_>>(), ["postgres", "wiki"]);

    // A user entry shadows the system one for its owner only
    let mut custom = ServiceSpec::new("redis", "redis:7");
    custom.label = "Cache".into();
    catalog.add(&alice, CatalogScope::User, custom).await.unwrap();
    let mut wiki = catalog.get(&alice, "wiki").await.unwrap();
    wiki.image = "mediawiki:1.42".into();
    let err = catalog.add(&alice, CatalogScope::User, wiki.clone()).await.unwrap_err();
    assert!(matches!(err, StrataError::ServiceExists { .. }));
    catalog.update(&alice, CatalogScope::User, "wiki", wiki).await.unwrap();

    assert_eq!(catalog.get(&alice, "wiki").await.unwrap().image, "mediawiki:1.42");
    assert_eq!(catalog.get(&alice, "wiki").await.unwrap().catalog, CatalogScope::User);
    assert_eq!(catalog.get(&Caller::user("bob"), "wiki").await.unwrap().image, "mediawiki:1.41");
    assert_eq!(catalog.list(&alice, CatalogView::All).await.unwrap().len(), 3);
    assert!(!catalog.exists(&Caller::user("bob"), "redis").await.unwrap());

    let configs = catalog.configs(&alice, &["postgres".to_string()]).await.unwrap();
    assert_eq!(configs["postgres"].len(), 2);

    let licenses = catalog.vocabulary("licenses").await.unwrap();
    assert_eq!(licenses.terms.len(), 2);
    assert!(catalog.vocabulary("colors").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_catalog_graph_orders_dependencies() {
    let (store, _catalog, _dir) = seeded().await;

    let specs = store.list_global_services().await.unwrap();
    let graph = DependencyGraph::from_catalog(&specs);
    assert_eq!(graph.layers().unwrap(), vec![vec!["postgres".to_string()], vec!["wiki".to_string()]]);
    assert_eq!(graph.required_dependencies("wiki"), vec!["postgres".to_string()]);
    assert_eq!(graph.dependents("postgres"), vec!["wiki".to_string()]);
}

#[tokio::test]
async fn test_cycles_are_rejected() {
    let (_store, catalog, _dir) = seeded().await;

    let mut postgres = catalog.get(&Caller::admin(), "postgres").await.unwrap();
    postgres.dependencies =
        vec![Dependency { key: "wiki".into(), required: false, share_config: false }];
    let err = catalog
        .update(&Caller::admin(), CatalogScope::System, "postgres", postgres)
        .await
        .unwrap_err();
    assert!(matches!(err, StrataError::CircularDependency { .. }));
    assert_eq!(err.kind(), ErrorKind::Invalid);
}

#[tokio::test]
async fn test_entries_in_use_are_protected() {
    let (store, catalog, _dir) = seeded().await;
    let admin = Caller::admin();

    store
        .put_account(&Account { namespace: "alice".into(), name: "Alice".into(), ..Default::default() })
        .await
        .unwrap();

    let postgres = catalog.get(&admin, "postgres").await.unwrap();
    let mut stack = Stack::new("wiki", "team wiki")
        .with_service(StackService::new("postgres"))
        .with_service(StackService::new("wiki"));
    stack.id = "q7w2e".into();
    stack.derive_service_ids();
    let db = &mut stack.services[0];
    db.config = postgres.resolve_config(&BTreeMap::new()).unwrap();
    db.volume_mounts = volumes::allocate(&postgres.volume_mounts, &db.volume_mounts, || {
        "abcde".to_string()
    })
    .unwrap();
    assert_eq!(db.id, stack_service_id("q7w2e", "postgres"));
    assert_eq!(
        db.volume_mounts,
        BTreeMap::from([(
            "AppData/abcde".to_string(),
            "/var/lib/postgresql/data".to_string()
        )])
    );
    store.put_stack("alice", &stack).await.unwrap();

    assert_eq!(catalog.usage_count("postgres").await.unwrap(), 1);

    let err = catalog.delete(&admin, CatalogScope::System, "postgres").await.unwrap_err();
    assert!(matches!(err, StrataError::ServiceRequired { .. }));
    let err = catalog.delete(&admin, CatalogScope::System, "wiki").await.unwrap_err();
    assert!(matches!(err, StrataError::ServiceInUse { count: 1, .. }));
    let err = catalog
        .update(&admin, CatalogScope::System, "wiki", catalog.get(&admin, "wiki").await.unwrap())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let err = catalog
        .delete(&Caller::user("alice"), CatalogScope::System, "wiki")
        .await
        .unwrap_err();
    assert!(matches!(err, StrataError::Unauthorized { .. }));

    store.delete_stack("alice", "q7w2e").await.unwrap();
    catalog.delete(&admin, CatalogScope::System, "wiki").await.unwrap();
    catalog.delete(&admin, CatalogScope::System, "postgres").await.unwrap();
    assert!(catalog.list(&admin, CatalogView::System).await.unwrap().is_empty());
}
