#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Integration tests for the permission catalog installer.

use std::path::Path;
use std::sync::Arc;

mod common;
use common::{FailingProvider, FixtureProvider, TestApp};

use bazaar_authz::config::AuthzConfig;
use bazaar_authz::models::Customer;
use bazaar_authz::permissions::{
    MigrationGuard, PermissionInstaller, PermissionProvider, TomlPermissionProvider,
};
use bazaar_authz::store::AuthzStore;

fn catalog_provider() -> Arc<dyn PermissionProvider> {
    FixtureProvider::new(
        "catalog",
        &["catalog", "catalog.product", "catalog.product.create"],
    )
    .grant("vendors", &["catalog.product", "catalog.product.create"])
    .shared()
}

async fn persisted_names(app: &TestApp) -> Vec<String> {
    let mut names: Vec<String> = app
        .store
        .permissions()
        .await
        .unwrap()
        .into_iter()
        .map(|p| p.system_name)
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn second_install_writes_nothing() {
    let app = TestApp::new();
    let providers = vec![catalog_provider()];

    let first = app
        .installer
        .install_permissions(&providers, true)
        .await
        .unwrap();
    assert_eq!(first.added.len(), 3);
    // one role, three permissions, two mappings
    assert_eq!(app.store.write_count(), 6);

    let second = app
        .installer
        .install_permissions(&providers, true)
        .await
        .unwrap();
    assert!(second.is_noop());
    assert_eq!(app.store.write_count(), 6);
}

#[tokio::test]
async fn missing_roles_are_created_active_and_granted() {
    let app = TestApp::uncached();

    let report = app
        .installer
        .install_permissions(&[catalog_provider()], false)
        .await
        .unwrap();
    assert_eq!(report.roles_created, vec!["vendors".to_string()]);

    let vendors = app
        .store
        .role_by_system_name("vendors")
        .await
        .unwrap()
        .unwrap();
    assert!(vendors.active);
    assert!(!vendors.is_system_role);

    let customer = Customer::new(1, vec![vendors]);
    assert!(
        app.permissions
            .authorize_customer("catalog.product.create", &customer)
            .await
            .unwrap()
    );
    assert!(
        !app.permissions
            .authorize_customer("catalog", &customer)
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn existing_roles_are_reused() {
    let app = TestApp::new();
    let vendors = app.seed_role("Vendors");

    let report = app
        .installer
        .install_permissions(&[catalog_provider()], false)
        .await
        .unwrap();

    assert!(report.roles_created.is_empty());
    assert_eq!(
        app.store
            .role_mappings(Some(vendors.id))
            .await
            .unwrap()
            .len(),
        2
    );
}

#[tokio::test]
async fn unused_permissions_are_removed_in_chunks() {
    let app = TestApp::new();
    app.seed_catalog(&["legacy.a", "legacy.b", "legacy.c", "legacy.d", "legacy.e"]);
    let installer = PermissionInstaller::new(
        Arc::new(app.store.clone()),
        Arc::new(app.cache.clone()),
        &AuthzConfig {
            delete_chunk_size: 2,
            ..AuthzConfig::default()
        },
    );

    let report = installer
        .install_permissions(&[catalog_provider()], true)
        .await
        .unwrap();

    assert_eq!(report.removed, 5);
    assert_eq!(
        persisted_names(&app).await,
        vec!["catalog", "catalog.product", "catalog.product.create"]
    );
}

#[tokio::test]
async fn unused_permissions_stay_without_removal_flag() {
    let app = TestApp::new();
    app.seed_catalog(&["legacy.a"]);

    let report = app
        .installer
        .install_permissions(&[catalog_provider()], false)
        .await
        .unwrap();

    assert_eq!(report.removed, 0);
    assert!(persisted_names(&app).await.contains(&"legacy.a".to_string()));
}

#[tokio::test]
async fn failing_provider_does_not_stop_others() {
    let app = TestApp::new();
    app.seed_catalog(&["orders.read"]);
    let providers: Vec<Arc<dyn PermissionProvider>> =
        vec![Arc::new(FailingProvider), catalog_provider()];

    let report = app
        .installer
        .install_permissions(&providers, true)
        .await
        .unwrap();

    assert_eq!(report.failed_providers, vec!["failing".to_string()]);
    assert_eq!(report.added.len(), 3);
    // the failed provider may own `orders.read`, so nothing is removed
    assert_eq!(report.removed, 0);
    assert!(persisted_names(&app).await.contains(&"orders.read".to_string()));
}

#[tokio::test]
async fn unmigrated_catalog_is_left_alone() {
    let app = TestApp::new();
    app.seed_catalog(&["ManageCatalog"]);

    let report = app
        .installer
        .install_permissions(&[catalog_provider()], true)
        .await
        .unwrap();

    assert!(report.skipped);
    assert!(report.is_noop());
    assert_eq!(app.store.write_count(), 0);
    assert_eq!(persisted_names(&app).await, vec!["ManageCatalog"]);
}

#[tokio::test]
async fn guard_can_be_replaced() {
    let app = TestApp::new();
    app.seed_catalog(&["ManageCatalog"]);
    let installer = app
        .installer
        .clone()
        .with_migration_guard(Some(MigrationGuard {
            marker: "catalog".to_string(),
            legacy: "ManageOrders".to_string(),
        }));

    let report = installer
        .install_permissions(&[catalog_provider()], false)
        .await
        .unwrap();

    assert!(!report.skipped);
    assert_eq!(report.added.len(), 3);
}

#[tokio::test]
async fn catalog_change_evicts_cached_trees() {
    let app = TestApp::uncached();
    let ids = app.seed_catalog(&["catalog"]);
    let buyers = app.seed_role("buyers");
    app.store.seed_mapping(ids[0], buyers.id, true);
    let customer = Customer::new(1, vec![buyers.clone()]);

    assert!(
        !app.permissions
            .authorize_customer("catalog.product", &customer)
            .await
            .unwrap()
    );
    assert!(app.cache.contains_key(&format!("permission:tree-{}", buyers.id)));

    app.installer
        .install_permissions(&[catalog_provider()], false)
        .await
        .unwrap();

    assert!(!app.cache.contains_key(&format!("permission:tree-{}", buyers.id)));
    // the new permission inherits the grant on `catalog`
    assert!(
        app.permissions
            .authorize_customer("catalog.product", &customer)
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn demo_catalog_installs() {
    let app = TestApp::uncached();
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("demos/storefront.toml");
    let provider: Arc<dyn PermissionProvider> =
        Arc::new(TomlPermissionProvider::from_path(&path).unwrap());
    assert_eq!(provider.name(), "storefront");

    let report = app
        .installer
        .install_permissions(&[provider], false)
        .await
        .unwrap();
    assert!(report.roles_created.contains(&"administrators".to_string()));

    let admins = app
        .store
        .role_by_system_name("administrators")
        .await
        .unwrap()
        .unwrap();
    assert!(admins.is_system_role);
    let customer = Customer::new(1, vec![admins]);
    assert!(
        app.permissions
            .authorize_customer("customers.impersonate", &customer)
            .await
            .unwrap()
    );
}
