#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Common test utilities for integration tests.
//!
//! [`TestApp`] wires the real services over an [`InMemoryStore`] and a
//! [`MokaCacheStore`], with the invalidation listeners registered exactly as
//! a host would register them.

#![allow(dead_code)]

use std::sync::Arc;

use bazaar_authz::acl::AclService;
use bazaar_authz::cache::MokaCacheStore;
use bazaar_authz::config::AuthzConfig;
use bazaar_authz::context::StaticWorkContext;
use bazaar_authz::invalidation;
use bazaar_authz::models::{AclEntity, Customer, NewRole, Role};
use bazaar_authz::permissions::{
    DefaultGrant, PermissionInstaller, PermissionProvider, PermissionService, RoleService,
};
use bazaar_authz::store::InMemoryStore;

pub struct TestApp {
    pub store: InMemoryStore,
    pub cache: MokaCacheStore,
    pub context: Arc<StaticWorkContext>,
    pub config: AuthzConfig,
    pub permissions: PermissionService,
    pub acl: AclService,
    pub roles: RoleService,
    pub installer: PermissionInstaller,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_config(AuthzConfig::default())
    }

    pub fn with_config(config: AuthzConfig) -> Self {
        let store = InMemoryStore::new();
        let cache = MokaCacheStore::default();
        let context = Arc::new(StaticWorkContext::default());

        let permissions = PermissionService::new(
            Arc::new(store.clone()),
            Arc::new(cache.clone()),
            context.clone(),
            config.clone(),
        );
        let acl = AclService::new(
            Arc::new(store.clone()),
            Arc::new(cache.clone()),
            context.clone(),
        );
        invalidation::register(&store, Arc::new(cache.clone()), &acl);

        let roles = RoleService::new(Arc::new(store.clone()));
        let installer =
            PermissionInstaller::new(Arc::new(store.clone()), Arc::new(cache.clone()), &config);

        Self {
            store,
            cache,
            context,
            config,
            permissions,
            acl,
            roles,
            installer,
        }
    }

    /// A configuration without the per-customer result cache, so checks
    /// observe invalidation immediately.
    pub fn uncached() -> Self {
        Self::with_config(AuthzConfig {
            result_cache_enabled: false,
            ..AuthzConfig::default()
        })
    }

    /// Seed the catalog and return the permission ids in input order.
    pub fn seed_catalog(&self, names: &[&str]) -> Vec<i64> {
        names
            .iter()
            .map(|name| self.store.seed_permission(name).id)
            .collect()
    }

    pub fn seed_role(&self, system_name: &str) -> Role {
        self.store.seed_role(NewRole::active(system_name))
    }

    pub fn sign_in(&self, customer: Customer) {
        self.context.set_customer(Some(customer));
    }
}

/// A catalog entity restricted by ACL.
#[derive(Debug, Clone)]
pub struct TestEntity {
    pub name: &'static str,
    pub id: i64,
    pub subject_to_acl: bool,
}

impl TestEntity {
    pub fn product(id: i64) -> Self {
        Self {
            name: "Product",
            id,
            subject_to_acl: false,
        }
    }
}

impl AclEntity for TestEntity {
    fn entity_name(&self) -> &str {
        self.name
    }

    fn entity_id(&self) -> i64 {
        self.id
    }

    fn subject_to_acl(&self) -> bool {
        self.subject_to_acl
    }

    fn set_subject_to_acl(&mut self, subject: bool) {
        self.subject_to_acl = subject;
    }
}

/// Provider with a fixed declaration list.
pub struct FixtureProvider {
    pub name: &'static str,
    pub permissions: Vec<&'static str>,
    pub grants: Vec<(&'static str, Vec<&'static str>)>,
}

impl FixtureProvider {
    pub fn new(name: &'static str, permissions: &[&'static str]) -> Self {
        Self {
            name,
            permissions: permissions.to_vec(),
            grants: Vec::new(),
        }
    }

    pub fn grant(mut self, role: &'static str, permissions: &[&'static str]) -> Self {
        self.grants.push((role, permissions.to_vec()));
        self
    }

    pub fn shared(self) -> Arc<dyn PermissionProvider> {
        Arc::new(self)
    }
}

impl PermissionProvider for FixtureProvider {
    fn name(&self) -> &str {
        self.name
    }

    fn permissions(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.permissions.iter().map(|p| p.to_string()).collect())
    }

    fn default_grants(&self) -> anyhow::Result<Vec<DefaultGrant>> {
        Ok(self
            .grants
            .iter()
            .map(|(role, permissions)| DefaultGrant {
                role: role.to_string(),
                permissions: permissions.iter().map(|p| p.to_string()).collect(),
            })
            .collect())
    }
}

/// Provider whose declarations cannot be read.
pub struct FailingProvider;

impl PermissionProvider for FailingProvider {
    fn name(&self) -> &str {
        "failing"
    }

    fn permissions(&self) -> anyhow::Result<Vec<String>> {
        anyhow::bail!("declaration source unavailable")
    }
}
