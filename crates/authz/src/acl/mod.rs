//! Entity-level access control.
//!
//! Grants are cached per entity type in fixed-width id segments (see
//! [`keys::ACL_SEGMENT_SIZE`]) so the number of cache keys stays bounded no
//! matter how many entities carry ACL records.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::{self, CacheStore, keys};
use crate::context::WorkContext;
use crate::error::{AuthzError, AuthzResult};
use crate::models::{AclEntity, Role};
use crate::store::{AuthzStore, StoreTransaction};

/// Role grants of every entity in one id segment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclSegment {
    /// Entity id to the role ids granted access, ascending.
    pub grants: BTreeMap<i64, Vec<i64>>,
}

impl AclSegment {
    fn role_ids(&self, entity_id: i64) -> Option<&[i64]> {
        self.grants.get(&entity_id).map(Vec::as_slice)
    }
}

/// Memoized "is any ACL record stored at all" flag.
///
/// Shared between an [`AclService`] and the commit listener that resets it,
/// so a long-lived service notices the first record being added or the last
/// one being removed.
#[derive(Debug, Clone, Default)]
pub struct AclUsage(Arc<Mutex<Option<bool>>>);

impl AclUsage {
    pub(crate) fn get(&self) -> Option<bool> {
        *self.0.lock()
    }

    pub(crate) fn set(&self, value: bool) {
        *self.0.lock() = Some(value);
    }

    /// Forget the memoized value; the next check asks the store again.
    pub fn reset(&self) {
        *self.0.lock() = None;
    }
}

/// ACL service.
#[derive(Clone)]
pub struct AclService {
    store: Arc<dyn AuthzStore>,
    cache: Arc<dyn CacheStore>,
    context: Arc<dyn WorkContext>,
    usage: AclUsage,
}

impl AclService {
    pub fn new(
        store: Arc<dyn AuthzStore>,
        cache: Arc<dyn CacheStore>,
        context: Arc<dyn WorkContext>,
    ) -> Self {
        Self {
            store,
            cache,
            context,
            usage: AclUsage::default(),
        }
    }

    /// Handle to the memoized usage flag, for invalidation.
    pub fn usage(&self) -> AclUsage {
        self.usage.clone()
    }

    /// Whether any ACL record exists. Memoized until the next ACL commit.
    pub async fn has_active_acl(&self) -> AuthzResult<bool> {
        if let Some(active) = self.usage.get() {
            return Ok(active);
        }

        let active = self.store.has_acl_records().await?;
        self.usage.set(active);
        debug!(active, "acl usage resolved");
        Ok(active)
    }

    /// Drop every cached segment and the usage flag, e.g. after ACL rows
    /// were changed outside the store's transactions.
    pub async fn clear_cache(&self) -> AuthzResult<u64> {
        self.usage.reset();
        let removed = self
            .cache
            .remove_by_pattern(keys::ACL_SEGMENT_PATTERN)
            .await?;
        debug!(segments = removed, "acl cache cleared");
        Ok(removed)
    }

    /// The cached segment containing `entity_id`.
    pub async fn get_segment(&self, entity_name: &str, entity_id: i64) -> AuthzResult<AclSegment> {
        let key = keys::acl_segment(entity_name, entity_id);
        let (min_id, max_id) = keys::segment_bounds(entity_id);
        let store = self.store.clone();

        cache::get_or_compute(self.cache.as_ref(), &key, None, || async move {
            let records = store
                .acl_records_in_range(entity_name, min_id, max_id)
                .await?;

            let mut segment = AclSegment::default();
            for record in records {
                segment
                    .grants
                    .entry(record.entity_id)
                    .or_default()
                    .push(record.role_id);
            }
            for role_ids in segment.grants.values_mut() {
                role_ids.sort_unstable();
                role_ids.dedup();
            }

            debug!(
                entity = %entity_name,
                min_id,
                max_id,
                entities = segment.grants.len(),
                "building acl segment"
            );
            Ok::<_, AuthzError>(segment)
        })
        .await
    }

    /// Role ids explicitly granted access to one entity.
    pub async fn get_authorized_role_ids(
        &self,
        entity_name: &str,
        entity_id: i64,
    ) -> AuthzResult<Vec<i64>> {
        if entity_id <= 0 || !self.has_active_acl().await? {
            return Ok(Vec::new());
        }

        let segment = self.get_segment(entity_name, entity_id).await?;
        Ok(segment
            .role_ids(entity_id)
            .map(<[i64]>::to_vec)
            .unwrap_or_default())
    }

    /// Check entity access for the current customer.
    pub async fn authorize(&self, entity_name: &str, entity_id: i64) -> AuthzResult<bool> {
        let roles = self
            .context
            .current_customer()
            .map(|customer| customer.roles)
            .unwrap_or_default();

        self.authorize_with_roles(entity_name, entity_id, &roles)
            .await
    }

    /// Check entity access for an explicit set of roles. Inactive roles are
    /// ignored.
    pub async fn authorize_with_roles(
        &self,
        entity_name: &str,
        entity_id: i64,
        roles: &[Role],
    ) -> AuthzResult<bool> {
        if entity_id <= 0 {
            return Ok(false);
        }

        if !self.has_active_acl().await? {
            return Ok(true);
        }

        let segment = self.get_segment(entity_name, entity_id).await?;
        let Some(granted) = segment.role_ids(entity_id) else {
            return Ok(false);
        };

        Ok(roles
            .iter()
            .filter(|role| role.active)
            .any(|role| granted.contains(&role.id)))
    }

    /// Check access to an entity for the current customer. Entities not
    /// subject to ACL are open to everyone.
    pub async fn authorize_entity<E>(&self, entity: &E) -> AuthzResult<bool>
    where
        E: AclEntity + ?Sized + Sync,
    {
        if !entity.subject_to_acl() {
            return Ok(true);
        }

        self.authorize(entity.entity_name(), entity.entity_id())
            .await
    }

    /// Like [`AclService::authorize_entity`] for an explicit set of roles.
    pub async fn authorize_entity_with_roles<E>(
        &self,
        entity: &E,
        roles: &[Role],
    ) -> AuthzResult<bool>
    where
        E: AclEntity + ?Sized + Sync,
    {
        if !entity.subject_to_acl() {
            return Ok(true);
        }

        self.authorize_with_roles(entity.entity_name(), entity.entity_id(), roles)
            .await
    }

    /// Stage ACL records so exactly the roles in `selected_role_ids` are
    /// granted `entity`, and update its `subject_to_acl` flag.
    ///
    /// An empty selection, or the single placeholder id `0`, clears every
    /// grant and marks the entity unrestricted. Nothing is written until the
    /// caller commits `tx`.
    pub async fn apply_acl_mappings<E>(
        &self,
        tx: &mut dyn StoreTransaction,
        entity: &mut E,
        selected_role_ids: &[i64],
    ) -> AuthzResult<()>
    where
        E: AclEntity + ?Sized + Send,
    {
        let restricted = !(selected_role_ids.is_empty() || selected_role_ids == [0]);
        entity.set_subject_to_acl(restricted);

        let entity_id = entity.entity_id();
        if entity_id <= 0 {
            warn!(
                entity = %entity.entity_name(),
                "acl mappings applied to an unsaved entity, no records written"
            );
            return Ok(());
        }

        let entity_name = entity.entity_name().to_string();
        let selected: BTreeSet<i64> = selected_role_ids.iter().copied().collect();
        let existing = tx.acl_records_for(&entity_name, entity_id).await?;

        for role in tx.roles().await? {
            let current: Vec<_> = existing.iter().filter(|r| r.role_id == role.id).collect();

            if selected.contains(&role.id) {
                if current.is_empty() {
                    tx.insert_acl_record(&entity_name, entity_id, role.id)
                        .await?;
                }
            } else {
                for record in current {
                    tx.delete_acl_record(record).await?;
                }
            }
        }

        debug!(
            entity = %entity_name,
            entity_id,
            roles = selected.len(),
            restricted,
            "acl mappings staged"
        );
        Ok(())
    }
}

impl std::fmt::Debug for AclService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AclService")
            .field("usage", &self.usage.get())
            .finish()
    }
}
