//! In-process implementation of the persistence port.
//!
//! Transactions are serialized: `begin` waits for the previous transaction
//! to finish, works on a private copy of the state, and swaps it in on
//! commit. Used by tests and by hosts that keep the catalog in memory.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;

use super::{
    AuthzStore, ChangeOp, ChangedEntity, CommitHooks, EntityChange, HookMode, StoreTransaction,
};
use crate::error::StoreError;
use crate::models::{AclRecord, NewRole, Permission, Role, RoleMapping};

#[derive(Debug, Clone, Default)]
struct State {
    last_id: i64,
    permissions: BTreeMap<i64, Permission>,
    roles: BTreeMap<i64, Role>,
    /// (permission_id, role_id) -> allow
    mappings: BTreeMap<(i64, i64), bool>,
    acl: BTreeMap<i64, AclRecord>,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }

    fn role_by_system_name(&self, system_name: &str) -> Option<&Role> {
        self.roles
            .values()
            .find(|r| r.system_name.eq_ignore_ascii_case(system_name))
    }

    fn mapping_rows(&self, role_id: Option<i64>) -> Vec<RoleMapping> {
        self.mappings
            .iter()
            .filter(|((_, r), _)| role_id.is_none_or(|id| id == *r))
            .map(|(&(permission_id, role_id), &allow)| RoleMapping {
                permission_id,
                role_id,
                allow,
            })
            .collect()
    }
}

/// Transactional in-memory store.
#[derive(Clone)]
pub struct InMemoryStore {
    state: Arc<Mutex<State>>,
    tx_lock: Arc<tokio::sync::Mutex<()>>,
    hooks: Arc<CommitHooks>,
    writes: Arc<AtomicU64>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            tx_lock: Arc::new(tokio::sync::Mutex::new(())),
            hooks: Arc::new(CommitHooks::new()),
            writes: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Total number of row writes committed so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Insert a permission directly, bypassing transactions and listeners.
    /// Intended for fixtures set up before any cache is populated.
    pub fn seed_permission(&self, system_name: &str) -> Permission {
        let mut state = self.state.lock();
        let permission = Permission {
            id: state.next_id(),
            system_name: system_name.to_string(),
        };
        state.permissions.insert(permission.id, permission.clone());
        permission
    }

    /// Insert a role directly. See [`InMemoryStore::seed_permission`].
    pub fn seed_role(&self, role: NewRole) -> Role {
        let mut state = self.state.lock();
        let role = Role {
            id: state.next_id(),
            system_name: role.system_name,
            active: role.active,
            is_system_role: role.is_system_role,
        };
        state.roles.insert(role.id, role.clone());
        role
    }

    /// Insert a role mapping directly. See [`InMemoryStore::seed_permission`].
    pub fn seed_mapping(&self, permission_id: i64, role_id: i64, allow: bool) {
        self.state
            .lock()
            .mappings
            .insert((permission_id, role_id), allow);
    }

    /// Insert an ACL record directly. See [`InMemoryStore::seed_permission`].
    pub fn seed_acl(&self, entity_name: &str, entity_id: i64, role_id: i64) -> AclRecord {
        let mut state = self.state.lock();
        let record = AclRecord {
            id: state.next_id(),
            entity_name: entity_name.to_string(),
            entity_id,
            role_id,
        };
        state.acl.insert(record.id, record.clone());
        record
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore")
            .field("writes", &self.write_count())
            .finish()
    }
}

#[async_trait]
impl AuthzStore for InMemoryStore {
    async fn permissions(&self) -> Result<Vec<Permission>, StoreError> {
        Ok(self.state.lock().permissions.values().cloned().collect())
    }

    async fn role_mappings(&self, role_id: Option<i64>) -> Result<Vec<RoleMapping>, StoreError> {
        Ok(self.state.lock().mapping_rows(role_id))
    }

    async fn roles(&self, active_only: bool) -> Result<Vec<Role>, StoreError> {
        Ok(self
            .state
            .lock()
            .roles
            .values()
            .filter(|r| !active_only || r.active)
            .cloned()
            .collect())
    }

    async fn role(&self, id: i64) -> Result<Option<Role>, StoreError> {
        Ok(self.state.lock().roles.get(&id).cloned())
    }

    async fn role_by_system_name(&self, system_name: &str) -> Result<Option<Role>, StoreError> {
        Ok(self.state.lock().role_by_system_name(system_name).cloned())
    }

    async fn acl_records_in_range(
        &self,
        entity_name: &str,
        min_id: i64,
        max_id: i64,
    ) -> Result<Vec<AclRecord>, StoreError> {
        Ok(self
            .state
            .lock()
            .acl
            .values()
            .filter(|a| {
                a.entity_name.eq_ignore_ascii_case(entity_name)
                    && (min_id..=max_id).contains(&a.entity_id)
            })
            .cloned()
            .collect())
    }

    async fn has_acl_records(&self) -> Result<bool, StoreError> {
        Ok(!self.state.lock().acl.is_empty())
    }

    async fn begin(&self, mode: HookMode) -> Result<Box<dyn StoreTransaction>, StoreError> {
        let guard = self.tx_lock.clone().lock_owned().await;
        let staged = self.state.lock().clone();

        Ok(Box::new(InMemoryTransaction {
            guard,
            staged,
            changes: Vec::new(),
            aborted: None,
            mode,
            state: self.state.clone(),
            hooks: self.hooks.clone(),
            writes: self.writes.clone(),
        }))
    }

    fn hooks(&self) -> &Arc<CommitHooks> {
        &self.hooks
    }
}

struct InMemoryTransaction {
    guard: OwnedMutexGuard<()>,
    staged: State,
    changes: Vec<EntityChange>,
    /// Set when a system role delete was attempted; commit then fails.
    aborted: Option<String>,
    mode: HookMode,
    state: Arc<Mutex<State>>,
    hooks: Arc<CommitHooks>,
    writes: Arc<AtomicU64>,
}

impl InMemoryTransaction {
    fn record(&mut self, entity: ChangedEntity, op: ChangeOp) {
        self.changes.push(EntityChange::new(entity, op));
    }

    fn remove_mappings_where(&mut self, pred: impl Fn(i64, i64) -> bool) {
        let doomed: Vec<(i64, i64)> = self
            .staged
            .mappings
            .keys()
            .filter(|(p, r)| pred(*p, *r))
            .copied()
            .collect();

        for (permission_id, role_id) in doomed {
            self.staged.mappings.remove(&(permission_id, role_id));
            self.record(
                ChangedEntity::RoleMapping {
                    permission_id,
                    role_id,
                },
                ChangeOp::Deleted,
            );
        }
    }
}

#[async_trait]
impl StoreTransaction for InMemoryTransaction {
    async fn permissions(&mut self) -> Result<Vec<Permission>, StoreError> {
        Ok(self.staged.permissions.values().cloned().collect())
    }

    async fn roles(&mut self) -> Result<Vec<Role>, StoreError> {
        Ok(self.staged.roles.values().cloned().collect())
    }

    async fn role_by_system_name(
        &mut self,
        system_name: &str,
    ) -> Result<Option<Role>, StoreError> {
        Ok(self.staged.role_by_system_name(system_name).cloned())
    }

    async fn acl_records_for(
        &mut self,
        entity_name: &str,
        entity_id: i64,
    ) -> Result<Vec<AclRecord>, StoreError> {
        Ok(self
            .staged
            .acl
            .values()
            .filter(|a| a.entity_id == entity_id && a.entity_name.eq_ignore_ascii_case(entity_name))
            .cloned()
            .collect())
    }

    async fn insert_permission(&mut self, system_name: &str) -> Result<Permission, StoreError> {
        if self
            .staged
            .permissions
            .values()
            .any(|p| p.system_name == system_name)
        {
            return Err(StoreError::DuplicatePermission(system_name.to_string()));
        }

        let permission = Permission {
            id: self.staged.next_id(),
            system_name: system_name.to_string(),
        };
        self.staged
            .permissions
            .insert(permission.id, permission.clone());
        self.record(
            ChangedEntity::Permission { id: permission.id },
            ChangeOp::Added,
        );
        Ok(permission)
    }

    async fn delete_permissions(&mut self, ids: &[i64]) -> Result<u64, StoreError> {
        self.remove_mappings_where(|p, _| ids.contains(&p));

        let mut removed = 0;
        for id in ids {
            if self.staged.permissions.remove(id).is_some() {
                self.record(ChangedEntity::Permission { id: *id }, ChangeOp::Deleted);
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn insert_role(&mut self, role: NewRole) -> Result<Role, StoreError> {
        if self.staged.role_by_system_name(&role.system_name).is_some() {
            return Err(StoreError::DuplicateRole(role.system_name));
        }

        let role = Role {
            id: self.staged.next_id(),
            system_name: role.system_name,
            active: role.active,
            is_system_role: role.is_system_role,
        };
        self.staged.roles.insert(role.id, role.clone());
        self.record(ChangedEntity::Role { id: role.id }, ChangeOp::Added);
        Ok(role)
    }

    async fn update_role(&mut self, role: &Role) -> Result<(), StoreError> {
        let Some(existing) = self.staged.roles.get_mut(&role.id) else {
            return Err(StoreError::RoleNotFound(role.id));
        };
        *existing = role.clone();
        self.record(ChangedEntity::Role { id: role.id }, ChangeOp::Modified);
        Ok(())
    }

    async fn delete_role(&mut self, id: i64) -> Result<(), StoreError> {
        let role = self
            .staged
            .roles
            .get(&id)
            .cloned()
            .ok_or(StoreError::RoleNotFound(id))?;
        if let Err(err) = role.ensure_deletable() {
            self.aborted = Some(role.system_name);
            return Err(err);
        }

        self.remove_mappings_where(|_, r| r == id);

        let grants: Vec<AclRecord> = self
            .staged
            .acl
            .values()
            .filter(|a| a.role_id == id)
            .cloned()
            .collect();
        for record in grants {
            self.delete_acl_record(&record).await?;
        }

        self.staged.roles.remove(&id);
        self.record(ChangedEntity::Role { id }, ChangeOp::Deleted);
        Ok(())
    }

    async fn set_role_mapping(
        &mut self,
        permission_id: i64,
        role_id: i64,
        allow: Option<bool>,
    ) -> Result<(), StoreError> {
        let entity = ChangedEntity::RoleMapping {
            permission_id,
            role_id,
        };
        let key = (permission_id, role_id);

        match (self.staged.mappings.get(&key).copied(), allow) {
            (None, None) => {}
            (Some(current), Some(allow)) if current == allow => {}
            (Some(_), None) => {
                self.staged.mappings.remove(&key);
                self.record(entity, ChangeOp::Deleted);
            }
            (current, Some(allow)) => {
                self.staged.mappings.insert(key, allow);
                let op = if current.is_some() {
                    ChangeOp::Modified
                } else {
                    ChangeOp::Added
                };
                self.record(entity, op);
            }
        }
        Ok(())
    }

    async fn insert_acl_record(
        &mut self,
        entity_name: &str,
        entity_id: i64,
        role_id: i64,
    ) -> Result<AclRecord, StoreError> {
        let record = AclRecord {
            id: self.staged.next_id(),
            entity_name: entity_name.to_string(),
            entity_id,
            role_id,
        };
        self.staged.acl.insert(record.id, record.clone());
        self.record(
            ChangedEntity::AclRecord {
                entity_name: record.entity_name.clone(),
                entity_id,
                role_id,
            },
            ChangeOp::Added,
        );
        Ok(record)
    }

    async fn delete_acl_record(&mut self, record: &AclRecord) -> Result<(), StoreError> {
        if self.staged.acl.remove(&record.id).is_some() {
            self.record(
                ChangedEntity::AclRecord {
                    entity_name: record.entity_name.clone(),
                    entity_id: record.entity_id,
                    role_id: record.role_id,
                },
                ChangeOp::Deleted,
            );
        }
        Ok(())
    }

    fn pending_changes(&self) -> usize {
        self.changes.len()
    }

    async fn commit(self: Box<Self>) -> Result<Vec<EntityChange>, StoreError> {
        let InMemoryTransaction {
            guard,
            staged,
            changes,
            aborted,
            mode,
            state,
            hooks,
            writes,
        } = *self;

        if let Some(system_name) = aborted {
            return Err(StoreError::SystemRoleDeletion { system_name });
        }

        if !changes.is_empty() {
            *state.lock() = staged;
            writes.fetch_add(changes.len() as u64, Ordering::SeqCst);
        }
        drop(guard);

        hooks.dispatch(mode, &changes).await;
        Ok(changes)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dropped_transaction_discards_writes() {
        let store = InMemoryStore::new();
        {
            let mut tx = store.begin(HookMode::All).await.unwrap();
            tx.insert_permission("catalog.product.read").await.unwrap();
        }
        assert!(store.permissions().await.unwrap().is_empty());
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn commit_publishes_changes() {
        let store = InMemoryStore::new();
        let mut tx = store.begin(HookMode::All).await.unwrap();
        let role = tx.insert_role(NewRole::active("editors")).await.unwrap();
        let permission = tx.insert_permission("cms.page").await.unwrap();
        tx.set_role_mapping(permission.id, role.id, Some(true))
            .await
            .unwrap();
        let changes = tx.commit().await.unwrap();

        assert_eq!(changes.len(), 3);
        assert_eq!(store.write_count(), 3);
        assert_eq!(store.role_mappings(Some(role.id)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn setting_same_mapping_twice_is_not_a_write() {
        let store = InMemoryStore::new();
        let role = store.seed_role(NewRole::active("editors"));
        let permission = store.seed_permission("cms.page");
        store.seed_mapping(permission.id, role.id, true);

        let mut tx = store.begin(HookMode::All).await.unwrap();
        tx.set_role_mapping(permission.id, role.id, Some(true))
            .await
            .unwrap();
        assert_eq!(tx.pending_changes(), 0);
    }

    #[tokio::test]
    async fn clearing_mapping_removes_row() {
        let store = InMemoryStore::new();
        let role = store.seed_role(NewRole::active("editors"));
        let permission = store.seed_permission("cms.page");
        store.seed_mapping(permission.id, role.id, false);

        let mut tx = store.begin(HookMode::All).await.unwrap();
        tx.set_role_mapping(permission.id, role.id, None)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert!(store.role_mappings(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn system_role_delete_is_refused() {
        let store = InMemoryStore::new();
        let admin = store.seed_role(NewRole {
            system_name: "administrators".to_string(),
            active: true,
            is_system_role: true,
        });

        let mut tx = store.begin(HookMode::All).await.unwrap();
        let err = tx.delete_role(admin.id).await.unwrap_err();
        assert!(matches!(err, StoreError::SystemRoleDeletion { .. }));
        assert_eq!(tx.pending_changes(), 0);
    }

    #[tokio::test]
    async fn system_role_delete_aborts_the_transaction() {
        let store = InMemoryStore::new();
        let admin = store.seed_role(NewRole {
            system_name: "administrators".to_string(),
            active: true,
            is_system_role: true,
        });

        let mut tx = store.begin(HookMode::All).await.unwrap();
        tx.insert_permission("catalog.product").await.unwrap();
        assert!(tx.delete_role(admin.id).await.is_err());

        let err = tx.commit().await.unwrap_err();
        assert!(matches!(err, StoreError::SystemRoleDeletion { .. }));
        assert!(store.permissions().await.unwrap().is_empty());
        assert!(store.role(admin.id).await.unwrap().is_some());
        assert_eq!(store.write_count(), 0);

        // the lock is released, so later transactions still run
        let mut tx = store.begin(HookMode::All).await.unwrap();
        tx.insert_permission("catalog.product").await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.permissions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn deleting_role_cascades_to_mappings_and_acl() {
        let store = InMemoryStore::new();
        let role = store.seed_role(NewRole::active("wholesale"));
        let permission = store.seed_permission("catalog.product.read");
        store.seed_mapping(permission.id, role.id, true);
        store.seed_acl("Product", 42, role.id);

        let mut tx = store.begin(HookMode::All).await.unwrap();
        tx.delete_role(role.id).await.unwrap();
        tx.commit().await.unwrap();

        assert!(store.role(role.id).await.unwrap().is_none());
        assert!(store.role_mappings(None).await.unwrap().is_empty());
        assert!(!store.has_acl_records().await.unwrap());
    }

    #[tokio::test]
    async fn acl_range_query_is_case_insensitive_and_bounded() {
        let store = InMemoryStore::new();
        store.seed_acl("Product", 999, 1);
        store.seed_acl("Product", 1000, 1);
        store.seed_acl("Category", 1500, 1);

        let rows = store
            .acl_records_in_range("product", 1000, 1999)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].entity_id, 1000);
    }
}
