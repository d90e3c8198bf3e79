//! Role administration write paths.
//!
//! Every change goes through a store transaction so the commit listeners
//! see it and evict the affected permission trees.

use std::sync::Arc;

use tracing::info;

use crate::error::{AuthzResult, StoreError};
use crate::models::{Allow, NewRole, Role};
use crate::store::{AuthzStore, HookMode};

/// Role and role-permission management.
#[derive(Clone)]
pub struct RoleService {
    store: Arc<dyn AuthzStore>,
}

impl RoleService {
    pub fn new(store: Arc<dyn AuthzStore>) -> Self {
        Self { store }
    }

    /// Create a role.
    pub async fn create_role(&self, role: NewRole) -> AuthzResult<Role> {
        let mut tx = self.store.begin(HookMode::All).await?;
        let role = tx.insert_role(role).await?;
        tx.commit().await?;

        info!(role = %role.system_name, id = role.id, "role created");
        Ok(role)
    }

    /// Activate or deactivate a role.
    pub async fn set_active(&self, role_id: i64, active: bool) -> AuthzResult<Role> {
        let mut role = self
            .store
            .role(role_id)
            .await?
            .ok_or(StoreError::RoleNotFound(role_id))?;
        if role.active == active {
            return Ok(role);
        }
        role.active = active;

        let mut tx = self.store.begin(HookMode::All).await?;
        tx.update_role(&role).await?;
        tx.commit().await?;

        info!(role = %role.system_name, active, "role activation changed");
        Ok(role)
    }

    /// Delete a role. System roles are refused and nothing is written.
    pub async fn delete_role(&self, role_id: i64) -> AuthzResult<()> {
        let mut tx = self.store.begin(HookMode::All).await?;
        tx.delete_role(role_id).await?;
        tx.commit().await?;

        info!(id = role_id, "role deleted");
        Ok(())
    }

    /// Set the tri-state allow of one permission for one role.
    /// [`Allow::Inherit`] removes the explicit mapping.
    pub async fn set_permission(
        &self,
        role_id: i64,
        permission_id: i64,
        allow: Allow,
    ) -> AuthzResult<()> {
        let mut tx = self.store.begin(HookMode::All).await?;
        tx.set_role_mapping(permission_id, role_id, allow.decision())
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Apply several permission changes for one role in a single commit.
    pub async fn set_permissions(
        &self,
        role_id: i64,
        changes: &[(i64, Allow)],
    ) -> AuthzResult<usize> {
        let mut tx = self.store.begin(HookMode::All).await?;
        for (permission_id, allow) in changes {
            tx.set_role_mapping(*permission_id, role_id, allow.decision())
                .await?;
        }
        let written = tx.pending_changes();
        tx.commit().await?;
        Ok(written)
    }
}

impl std::fmt::Debug for RoleService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoleService").finish()
    }
}
