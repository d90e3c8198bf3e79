//! PostgreSQL implementation of the persistence port.
//!
//! Works against the platform's existing tables; it does not create or
//! migrate them:
//!
//! - `permission_record (id, system_name)`
//! - `customer_role (id, system_name, active, is_system_role)`
//! - `permission_role_mapping (permission_record_id, customer_role_id, allow)`
//! - `acl_record (id, entity_name, entity_id, customer_role_id)`

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::debug;

use super::{
    AuthzStore, ChangeOp, ChangedEntity, CommitHooks, EntityChange, HookMode, StoreTransaction,
};
use crate::error::StoreError;
use crate::models::{AclRecord, NewRole, Permission, Role, RoleMapping};

const SELECT_ROLE: &str = "SELECT id, system_name, active, is_system_role FROM customer_role";

const SELECT_ACL: &str =
    "SELECT id, entity_name, entity_id, customer_role_id AS role_id FROM acl_record";

/// Store backed by a PostgreSQL pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    hooks: Arc<CommitHooks>,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            hooks: Arc::new(CommitHooks::new()),
        }
    }
}

impl std::fmt::Debug for PgStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgStore").finish()
    }
}

#[async_trait]
impl AuthzStore for PgStore {
    async fn permissions(&self) -> Result<Vec<Permission>, StoreError> {
        let rows = sqlx::query_as::<_, Permission>(
            "SELECT id, system_name FROM permission_record ORDER BY system_name",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn role_mappings(&self, role_id: Option<i64>) -> Result<Vec<RoleMapping>, StoreError> {
        let rows = sqlx::query_as::<_, RoleMapping>(
            r#"
            SELECT permission_record_id AS permission_id, customer_role_id AS role_id, allow
            FROM permission_role_mapping
            WHERE $1::BIGINT IS NULL OR customer_role_id = $1
            "#,
        )
        .bind(role_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn roles(&self, active_only: bool) -> Result<Vec<Role>, StoreError> {
        let sql = format!("{SELECT_ROLE} WHERE active OR NOT $1 ORDER BY system_name");
        let rows = sqlx::query_as::<_, Role>(&sql)
            .bind(active_only)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows)
    }

    async fn role(&self, id: i64) -> Result<Option<Role>, StoreError> {
        let sql = format!("{SELECT_ROLE} WHERE id = $1");
        let row = sqlx::query_as::<_, Role>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row)
    }

    async fn role_by_system_name(&self, system_name: &str) -> Result<Option<Role>, StoreError> {
        let sql = format!("{SELECT_ROLE} WHERE lower(system_name) = lower($1)");
        let row = sqlx::query_as::<_, Role>(&sql)
            .bind(system_name)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row)
    }

    async fn acl_records_in_range(
        &self,
        entity_name: &str,
        min_id: i64,
        max_id: i64,
    ) -> Result<Vec<AclRecord>, StoreError> {
        let sql = format!(
            "{SELECT_ACL} WHERE lower(entity_name) = lower($1) AND entity_id BETWEEN $2 AND $3"
        );
        let rows = sqlx::query_as::<_, AclRecord>(&sql)
            .bind(entity_name)
            .bind(min_id)
            .bind(max_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows)
    }

    async fn has_acl_records(&self) -> Result<bool, StoreError> {
        let exists = sqlx::query_scalar::<_, bool>("SELECT EXISTS (SELECT 1 FROM acl_record)")
            .fetch_one(&self.pool)
            .await?;

        Ok(exists)
    }

    async fn begin(&self, mode: HookMode) -> Result<Box<dyn StoreTransaction>, StoreError> {
        let tx = self.pool.begin().await?;

        Ok(Box::new(PgTransaction {
            tx,
            changes: Vec::new(),
            aborted: None,
            mode,
            hooks: self.hooks.clone(),
        }))
    }

    fn hooks(&self) -> &Arc<CommitHooks> {
        &self.hooks
    }
}

struct PgTransaction {
    tx: Transaction<'static, Postgres>,
    changes: Vec<EntityChange>,
    aborted: Option<String>,
    mode: HookMode,
    hooks: Arc<CommitHooks>,
}

impl PgTransaction {
    fn record(&mut self, entity: ChangedEntity, op: ChangeOp) {
        self.changes.push(EntityChange::new(entity, op));
    }

    fn record_mappings_deleted(&mut self, rows: Vec<(i64, i64)>) {
        for (permission_id, role_id) in rows {
            self.record(
                ChangedEntity::RoleMapping {
                    permission_id,
                    role_id,
                },
                ChangeOp::Deleted,
            );
        }
    }

    fn record_acl_deleted(&mut self, rows: Vec<AclRecord>) {
        for record in rows {
            self.record(
                ChangedEntity::AclRecord {
                    entity_name: record.entity_name,
                    entity_id: record.entity_id,
                    role_id: record.role_id,
                },
                ChangeOp::Deleted,
            );
        }
    }
}

#[async_trait]
impl StoreTransaction for PgTransaction {
    async fn permissions(&mut self) -> Result<Vec<Permission>, StoreError> {
        let rows = sqlx::query_as::<_, Permission>("SELECT id, system_name FROM permission_record")
            .fetch_all(&mut *self.tx)
            .await?;

        Ok(rows)
    }

    async fn roles(&mut self) -> Result<Vec<Role>, StoreError> {
        let rows = sqlx::query_as::<_, Role>(SELECT_ROLE)
            .fetch_all(&mut *self.tx)
            .await?;

        Ok(rows)
    }

    async fn role_by_system_name(
        &mut self,
        system_name: &str,
    ) -> Result<Option<Role>, StoreError> {
        let sql = format!("{SELECT_ROLE} WHERE lower(system_name) = lower($1)");
        let row = sqlx::query_as::<_, Role>(&sql)
            .bind(system_name)
            .fetch_optional(&mut *self.tx)
            .await?;

        Ok(row)
    }

    async fn acl_records_for(
        &mut self,
        entity_name: &str,
        entity_id: i64,
    ) -> Result<Vec<AclRecord>, StoreError> {
        let sql = format!("{SELECT_ACL} WHERE lower(entity_name) = lower($1) AND entity_id = $2");
        let rows = sqlx::query_as::<_, AclRecord>(&sql)
            .bind(entity_name)
            .bind(entity_id)
            .fetch_all(&mut *self.tx)
            .await?;

        Ok(rows)
    }

    async fn insert_permission(&mut self, system_name: &str) -> Result<Permission, StoreError> {
        let permission = sqlx::query_as::<_, Permission>(
            "INSERT INTO permission_record (system_name) VALUES ($1) RETURNING id, system_name",
        )
        .bind(system_name)
        .fetch_one(&mut *self.tx)
        .await?;

        self.record(
            ChangedEntity::Permission { id: permission.id },
            ChangeOp::Added,
        );
        Ok(permission)
    }

    async fn delete_permissions(&mut self, ids: &[i64]) -> Result<u64, StoreError> {
        let mappings = sqlx::query_as::<_, (i64, i64)>(
            r#"
            DELETE FROM permission_role_mapping
            WHERE permission_record_id = ANY($1)
            RETURNING permission_record_id, customer_role_id
            "#,
        )
        .bind(ids)
        .fetch_all(&mut *self.tx)
        .await?;
        self.record_mappings_deleted(mappings);

        let deleted =
            sqlx::query_scalar::<_, i64>("DELETE FROM permission_record WHERE id = ANY($1) RETURNING id")
                .bind(ids)
                .fetch_all(&mut *self.tx)
                .await?;

        for id in &deleted {
            self.record(ChangedEntity::Permission { id: *id }, ChangeOp::Deleted);
        }

        debug!(requested = ids.len(), deleted = deleted.len(), "permissions deleted");
        Ok(deleted.len() as u64)
    }

    async fn insert_role(&mut self, role: NewRole) -> Result<Role, StoreError> {
        let role = sqlx::query_as::<_, Role>(
            r#"
            INSERT INTO customer_role (system_name, active, is_system_role)
            VALUES ($1, $2, $3)
            RETURNING id, system_name, active, is_system_role
            "#,
        )
        .bind(&role.system_name)
        .bind(role.active)
        .bind(role.is_system_role)
        .fetch_one(&mut *self.tx)
        .await?;

        self.record(ChangedEntity::Role { id: role.id }, ChangeOp::Added);
        Ok(role)
    }

    async fn update_role(&mut self, role: &Role) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE customer_role SET system_name = $1, active = $2, is_system_role = $3 WHERE id = $4",
        )
        .bind(&role.system_name)
        .bind(role.active)
        .bind(role.is_system_role)
        .bind(role.id)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::RoleNotFound(role.id));
        }

        self.record(ChangedEntity::Role { id: role.id }, ChangeOp::Modified);
        Ok(())
    }

    async fn delete_role(&mut self, id: i64) -> Result<(), StoreError> {
        let sql = format!("{SELECT_ROLE} WHERE id = $1 FOR UPDATE");
        let role = sqlx::query_as::<_, Role>(&sql)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?
            .ok_or(StoreError::RoleNotFound(id))?;
        if let Err(err) = role.ensure_deletable() {
            self.aborted = Some(role.system_name);
            return Err(err);
        }

        let mappings = sqlx::query_as::<_, (i64, i64)>(
            r#"
            DELETE FROM permission_role_mapping
            WHERE customer_role_id = $1
            RETURNING permission_record_id, customer_role_id
            "#,
        )
        .bind(id)
        .fetch_all(&mut *self.tx)
        .await?;
        self.record_mappings_deleted(mappings);

        let grants = sqlx::query_as::<_, AclRecord>(
            r#"
            DELETE FROM acl_record
            WHERE customer_role_id = $1
            RETURNING id, entity_name, entity_id, customer_role_id AS role_id
            "#,
        )
        .bind(id)
        .fetch_all(&mut *self.tx)
        .await?;
        self.record_acl_deleted(grants);

        sqlx::query("DELETE FROM customer_role WHERE id = $1")
            .bind(id)
            .execute(&mut *self.tx)
            .await?;

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

        match allow {
            Some(allow) => {
                // Row comes back only when something changed; xmax = 0 marks an insert.
                let inserted = sqlx::query_scalar::<_, bool>(
                    r#"
                    INSERT INTO permission_role_mapping (permission_record_id, customer_role_id, allow)
                    VALUES ($1, $2, $3)
                    ON CONFLICT (permission_record_id, customer_role_id)
                    DO UPDATE SET allow = EXCLUDED.allow
                    WHERE permission_role_mapping.allow IS DISTINCT FROM EXCLUDED.allow
                    RETURNING (xmax = 0)
                    "#,
                )
                .bind(permission_id)
                .bind(role_id)
                .bind(allow)
                .fetch_optional(&mut *self.tx)
                .await?;

                match inserted {
                    Some(true) => self.record(entity, ChangeOp::Added),
                    Some(false) => self.record(entity, ChangeOp::Modified),
                    None => {}
                }
            }
            None => {
                let result = sqlx::query(
                    "DELETE FROM permission_role_mapping WHERE permission_record_id = $1 AND customer_role_id = $2",
                )
                .bind(permission_id)
                .bind(role_id)
                .execute(&mut *self.tx)
                .await?;

                if result.rows_affected() > 0 {
                    self.record(entity, ChangeOp::Deleted);
                }
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
        let record = sqlx::query_as::<_, AclRecord>(
            r#"
            INSERT INTO acl_record (entity_name, entity_id, customer_role_id)
            VALUES ($1, $2, $3)
            RETURNING id, entity_name, entity_id, customer_role_id AS role_id
            "#,
        )
        .bind(entity_name)
        .bind(entity_id)
        .bind(role_id)
        .fetch_one(&mut *self.tx)
        .await?;

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
        let result = sqlx::query("DELETE FROM acl_record WHERE id = $1")
            .bind(record.id)
            .execute(&mut *self.tx)
            .await?;

        if result.rows_affected() > 0 {
            self.record_acl_deleted(vec![record.clone()]);
        }
        Ok(())
    }

    fn pending_changes(&self) -> usize {
        self.changes.len()
    }

    async fn commit(self: Box<Self>) -> Result<Vec<EntityChange>, StoreError> {
        let PgTransaction {
            tx,
            changes,
            aborted,
            mode,
            hooks,
        } = *self;

        if let Some(system_name) = aborted {
            tx.rollback().await?;
            return Err(StoreError::SystemRoleDeletion { system_name });
        }
        tx.commit().await?;

        hooks.dispatch(mode, &changes).await;
        Ok(changes)
    }
}
