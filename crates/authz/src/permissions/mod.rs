//! Permission checking service.
//!
//! Authorization is evaluated per role against a cached [`PermissionTree`]
//! and OR-ed across the customer's active roles. Results are additionally
//! cached per customer for a short TTL.

pub mod installer;
pub mod roles;
pub mod tree;

use std::sync::Arc;

use tracing::debug;

use crate::cache::{self, CacheStore, keys};
use crate::config::AuthzConfig;
use crate::context::WorkContext;
use crate::error::{AuthzError, AuthzResult};
use crate::models::{Allow, Customer};
use crate::store::AuthzStore;

pub use installer::{
    DefaultGrant, InstallReport, MigrationGuard, PermissionInstaller, PermissionProvider,
    TomlPermissionProvider,
};
pub use roles::RoleService;
pub use tree::{PermissionNode, PermissionTree};

/// Permission service.
#[derive(Clone)]
pub struct PermissionService {
    store: Arc<dyn AuthzStore>,
    cache: Arc<dyn CacheStore>,
    context: Arc<dyn WorkContext>,
    config: AuthzConfig,
}

impl PermissionService {
    /// Create a new permission service.
    ///
    /// Tree invalidation is wired separately through
    /// [`crate::invalidation::register`].
    pub fn new(
        store: Arc<dyn AuthzStore>,
        cache: Arc<dyn CacheStore>,
        context: Arc<dyn WorkContext>,
        config: AuthzConfig,
    ) -> Self {
        Self {
            store,
            cache,
            context,
            config,
        }
    }

    /// Check a permission for the current customer. No customer means deny.
    pub async fn authorize(&self, permission: &str) -> AuthzResult<bool> {
        match self.context.current_customer() {
            Some(customer) => self.authorize_customer(permission, &customer).await,
            None => Ok(false),
        }
    }

    /// Check a permission for `customer`.
    pub async fn authorize_customer(
        &self,
        permission: &str,
        customer: &Customer,
    ) -> AuthzResult<bool> {
        self.cached_check(permission, customer, false).await
    }

    /// Descendant-search check for the current customer.
    pub async fn find_authorization(&self, permission: &str) -> AuthzResult<bool> {
        match self.context.current_customer() {
            Some(customer) => self.find_authorization_customer(permission, &customer).await,
            None => Ok(false),
        }
    }

    /// Descendant-search check for `customer`: a grant anywhere below
    /// `permission` also authorizes it. Used for coarse menu visibility.
    pub async fn find_authorization_customer(
        &self,
        permission: &str,
        customer: &Customer,
    ) -> AuthzResult<bool> {
        self.cached_check(permission, customer, true).await
    }

    /// The cached tree for one role.
    pub async fn get_permission_tree(&self, role_id: i64) -> AuthzResult<PermissionTree> {
        let key = keys::permission_tree(role_id);
        let store = self.store.clone();

        cache::get_or_compute(self.cache.as_ref(), &key, None, || async move {
            let catalog = store.permissions().await?;
            let mappings = store.role_mappings(Some(role_id)).await?;
            debug!(
                role_id,
                permissions = catalog.len(),
                mappings = mappings.len(),
                "building permission tree"
            );
            Ok::<_, AuthzError>(PermissionTree::build(&catalog, &mappings))
        })
        .await
    }

    /// The effective tree of a customer across all active roles: a node is
    /// granted when any role authorizes it and denied otherwise.
    pub async fn build_customer_permission_tree(
        &self,
        customer: &Customer,
    ) -> AuthzResult<PermissionTree> {
        let mut role_trees = Vec::new();
        for role in customer.active_roles() {
            role_trees.push(self.get_permission_tree(role.id).await?);
        }

        let catalog = self.store.permissions().await?;
        let shape = PermissionTree::build(&catalog, &[]);

        Ok(shape.map_allow(|node| {
            let granted = role_trees
                .iter()
                .any(|tree| tree.authorize(&node.system_name));
            Allow::from(granted)
        }))
    }

    async fn cached_check(
        &self,
        permission: &str,
        customer: &Customer,
        allow_by_descendant: bool,
    ) -> AuthzResult<bool> {
        if permission.is_empty() {
            return Ok(false);
        }

        if !self.config.result_cache_enabled {
            return self.evaluate(permission, customer, allow_by_descendant).await;
        }

        let key = keys::authorization_result(customer.id, allow_by_descendant, permission);
        cache::get_or_compute(
            self.cache.as_ref(),
            &key,
            Some(self.config.result_cache_ttl),
            || self.evaluate(permission, customer, allow_by_descendant),
        )
        .await
    }

    async fn evaluate(
        &self,
        permission: &str,
        customer: &Customer,
        allow_by_descendant: bool,
    ) -> AuthzResult<bool> {
        for role in customer.active_roles() {
            let tree = self.get_permission_tree(role.id).await?;
            if tree.find_authorization(permission, allow_by_descendant) {
                debug!(
                    customer_id = customer.id,
                    role = %role.system_name,
                    permission = %permission,
                    "permission granted"
                );
                return Ok(true);
            }
        }

        Ok(false)
    }
}

impl std::fmt::Debug for PermissionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionService")
            .field("config", &self.config)
            .finish()
    }
}
