//! Persistence port.
//!
//! The authorization core never talks to a database directly. It reads and
//! writes through [`AuthzStore`] and learns about committed changes through
//! the store's [`CommitHooks`].

mod hooks;
pub mod memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::models::{AclRecord, NewRole, Permission, Role, RoleMapping};

pub use hooks::{ChangeOp, ChangedEntity, CommitHooks, CommitListener, EntityChange, HookMode};
pub use memory::InMemoryStore;
pub use postgres::PgStore;

/// Read access plus transaction entry point.
#[async_trait]
pub trait AuthzStore: Send + Sync {
    /// The full permission catalog.
    async fn permissions(&self) -> Result<Vec<Permission>, StoreError>;

    /// Role mappings, optionally restricted to one role.
    async fn role_mappings(&self, role_id: Option<i64>) -> Result<Vec<RoleMapping>, StoreError>;

    async fn roles(&self, active_only: bool) -> Result<Vec<Role>, StoreError>;

    async fn role(&self, id: i64) -> Result<Option<Role>, StoreError>;

    async fn role_by_system_name(&self, system_name: &str) -> Result<Option<Role>, StoreError>;

    /// ACL records of one entity type with `min_id <= entity_id <= max_id`.
    /// Entity names compare case-insensitively.
    async fn acl_records_in_range(
        &self,
        entity_name: &str,
        min_id: i64,
        max_id: i64,
    ) -> Result<Vec<AclRecord>, StoreError>;

    /// Whether any ACL record exists at all.
    async fn has_acl_records(&self) -> Result<bool, StoreError>;

    /// Open a transaction. Dropping it without [`StoreTransaction::commit`]
    /// discards every staged write.
    async fn begin(&self, mode: HookMode) -> Result<Box<dyn StoreTransaction>, StoreError>;

    /// Listener registry notified after each commit.
    fn hooks(&self) -> &Arc<CommitHooks>;
}

/// A unit of work against the store.
///
/// Inserts return generated ids immediately so dependent rows (mappings
/// referencing a freshly created role) can be staged in the same
/// transaction.
#[async_trait]
pub trait StoreTransaction: Send {
    async fn permissions(&mut self) -> Result<Vec<Permission>, StoreError>;

    async fn roles(&mut self) -> Result<Vec<Role>, StoreError>;

    async fn role_by_system_name(&mut self, system_name: &str)
    -> Result<Option<Role>, StoreError>;

    /// ACL records for one entity instance.
    async fn acl_records_for(
        &mut self,
        entity_name: &str,
        entity_id: i64,
    ) -> Result<Vec<AclRecord>, StoreError>;

    async fn insert_permission(&mut self, system_name: &str) -> Result<Permission, StoreError>;

    /// Delete permissions and their role mappings. Returns rows removed.
    async fn delete_permissions(&mut self, ids: &[i64]) -> Result<u64, StoreError>;

    async fn insert_role(&mut self, role: NewRole) -> Result<Role, StoreError>;

    async fn update_role(&mut self, role: &Role) -> Result<(), StoreError>;

    /// Delete a role. System roles are refused with
    /// [`StoreError::SystemRoleDeletion`]; the transaction is then aborted
    /// and `commit` returns the same error.
    async fn delete_role(&mut self, id: i64) -> Result<(), StoreError>;

    /// Set the tri-state allow for a (permission, role) pair. `None` removes
    /// the mapping row so the permission inherits again.
    async fn set_role_mapping(
        &mut self,
        permission_id: i64,
        role_id: i64,
        allow: Option<bool>,
    ) -> Result<(), StoreError>;

    async fn insert_acl_record(
        &mut self,
        entity_name: &str,
        entity_id: i64,
        role_id: i64,
    ) -> Result<AclRecord, StoreError>;

    async fn delete_acl_record(&mut self, record: &AclRecord) -> Result<(), StoreError>;

    /// Number of changes staged so far.
    fn pending_changes(&self) -> usize;

    /// Make staged writes durable, then notify listeners. Returns the
    /// published change set.
    async fn commit(self: Box<Self>) -> Result<Vec<EntityChange>, StoreError>;
}
