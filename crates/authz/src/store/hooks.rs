//! Post-commit notifications.
//!
//! Every committed transaction publishes the list of entities it changed.
//! Listeners run strictly after the data is durable, in registration order.
//! A failing listener is logged and skipped so the others still run.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, error};

/// Which listeners a transaction notifies on commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HookMode {
    /// Notify every registered listener.
    #[default]
    All,
    /// Notify only listeners that report [`CommitListener::is_important`].
    /// Used for bulk seeding where unrelated side effects are unwanted.
    ImportantOnly,
}

/// What happened to an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOp {
    Added,
    Modified,
    Deleted,
}

/// Identity of a changed entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangedEntity {
    Permission {
        id: i64,
    },
    Role {
        id: i64,
    },
    RoleMapping {
        permission_id: i64,
        role_id: i64,
    },
    AclRecord {
        entity_name: String,
        entity_id: i64,
        role_id: i64,
    },
}

/// One `(entity, operation)` tuple published after commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityChange {
    pub entity: ChangedEntity,
    pub op: ChangeOp,
}

impl EntityChange {
    pub fn new(entity: ChangedEntity, op: ChangeOp) -> Self {
        Self { entity, op }
    }
}

/// Subscriber to committed changes.
#[async_trait]
pub trait CommitListener: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Important listeners also run in [`HookMode::ImportantOnly`].
    fn is_important(&self) -> bool {
        false
    }

    async fn on_commit(&self, changes: &[EntityChange]) -> anyhow::Result<()>;
}

/// Registry of commit listeners shared by a store and its transactions.
#[derive(Default)]
pub struct CommitHooks {
    listeners: RwLock<Vec<Arc<dyn CommitListener>>>,
}

impl CommitHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for all future commits.
    pub fn subscribe(&self, listener: Arc<dyn CommitListener>) {
        debug!(listener = %listener.name(), "commit listener registered");
        self.listeners.write().push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    /// Notify listeners of a committed change set.
    pub async fn dispatch(&self, mode: HookMode, changes: &[EntityChange]) {
        if changes.is_empty() {
            return;
        }

        // Snapshot so no lock is held across await points.
        let listeners: Vec<Arc<dyn CommitListener>> = self.listeners.read().clone();

        for listener in listeners {
            if mode == HookMode::ImportantOnly && !listener.is_important() {
                continue;
            }
            if let Err(e) = listener.on_commit(changes).await {
                error!(
                    listener = %listener.name(),
                    changes = changes.len(),
                    error = %e,
                    "commit listener failed"
                );
            }
        }
    }
}

impl std::fmt::Debug for CommitHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitHooks")
            .field("listeners", &self.len())
            .finish()
    }
}
