//! Commit listeners that evict cached trees and segments.
//!
//! Every write path that can alter a role, a role mapping, or the permission
//! catalog publishes a change; these listeners translate the changes into
//! cache keys. Eviction failures are logged and otherwise ignored: a stale
//! entry is preferred over failing a committed write.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::acl::{AclService, AclUsage};
use crate::cache::{CacheStore, keys};
use crate::store::{AuthzStore, ChangedEntity, CommitListener, EntityChange};

/// Evicts `permission:tree-{roleId}` for changed roles and mappings, and
/// every tree when the catalog itself changed.
pub struct PermissionTreeInvalidator {
    cache: Arc<dyn CacheStore>,
}

impl PermissionTreeInvalidator {
    pub fn new(cache: Arc<dyn CacheStore>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl CommitListener for PermissionTreeInvalidator {
    fn name(&self) -> &str {
        "permission_tree_invalidator"
    }

    fn is_important(&self) -> bool {
        true
    }

    async fn on_commit(&self, changes: &[EntityChange]) -> anyhow::Result<()> {
        let mut role_ids = BTreeSet::new();
        let mut catalog_changed = false;

        for change in changes {
            match &change.entity {
                ChangedEntity::Role { id } => {
                    role_ids.insert(*id);
                }
                ChangedEntity::RoleMapping { role_id, .. } => {
                    role_ids.insert(*role_id);
                }
                ChangedEntity::Permission { .. } => catalog_changed = true,
                ChangedEntity::AclRecord { .. } => {}
            }
        }

        // a catalog change reshapes every role's tree
        if catalog_changed {
            if let Err(e) = self
                .cache
                .remove_by_pattern(keys::PERMISSION_TREE_PATTERN)
                .await
            {
                warn!(error = %e, "failed to evict permission trees");
            }
            return Ok(());
        }

        for role_id in role_ids {
            if let Err(e) = self.cache.remove(&keys::permission_tree(role_id)).await {
                warn!(role_id, error = %e, "failed to evict permission tree");
            }
        }

        Ok(())
    }
}

/// Evicts the segment of every changed ACL record and resets the memoized
/// ACL usage flag.
pub struct AclSegmentInvalidator {
    cache: Arc<dyn CacheStore>,
    usage: AclUsage,
}

impl AclSegmentInvalidator {
    pub fn new(cache: Arc<dyn CacheStore>, usage: AclUsage) -> Self {
        Self { cache, usage }
    }
}

#[async_trait]
impl CommitListener for AclSegmentInvalidator {
    fn name(&self) -> &str {
        "acl_segment_invalidator"
    }

    fn is_important(&self) -> bool {
        true
    }

    async fn on_commit(&self, changes: &[EntityChange]) -> anyhow::Result<()> {
        let segments: BTreeSet<String> = changes
            .iter()
            .filter_map(|change| match &change.entity {
                ChangedEntity::AclRecord {
                    entity_name,
                    entity_id,
                    ..
                } => Some(keys::acl_segment(entity_name, *entity_id)),
                _ => None,
            })
            .collect();

        if segments.is_empty() {
            return Ok(());
        }

        self.usage.reset();

        for key in &segments {
            if let Err(e) = self.cache.remove(key).await {
                warn!(key = %key, error = %e, "failed to evict acl segment");
            }
        }

        debug!(segments = segments.len(), "acl segments invalidated");
        Ok(())
    }
}

/// Subscribe the tree and segment invalidators to `store`'s commits.
pub fn register(store: &dyn AuthzStore, cache: Arc<dyn CacheStore>, acl: &AclService) {
    let hooks = store.hooks();
    hooks.subscribe(Arc::new(PermissionTreeInvalidator::new(cache.clone())));
    hooks.subscribe(Arc::new(AclSegmentInvalidator::new(cache, acl.usage())));
}
