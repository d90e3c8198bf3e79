//! Permission records and role mappings.

use serde::{Deserialize, Serialize};

/// A persisted permission record.
///
/// `system_name` is a dot-segmented path such as `catalog.product.create`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Permission {
    pub id: i64,
    pub system_name: String,
}

/// The only persisted tri-state fact: an explicit allow or deny of one
/// permission for one role. A missing row means [`Allow::Inherit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct RoleMapping {
    pub permission_id: i64,
    pub role_id: i64,
    pub allow: bool,
}

/// Tri-state authorization attached to a (permission, role) pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Allow {
    Grant,
    Deny,
    #[default]
    Inherit,
}

impl Allow {
    /// The explicit decision, or `None` when the value is inherited.
    pub fn decision(self) -> Option<bool> {
        match self {
            Allow::Grant => Some(true),
            Allow::Deny => Some(false),
            Allow::Inherit => None,
        }
    }
}

impl From<bool> for Allow {
    fn from(allow: bool) -> Self {
        if allow { Allow::Grant } else { Allow::Deny }
    }
}

impl From<Option<bool>> for Allow {
    fn from(allow: Option<bool>) -> Self {
        allow.map_or(Allow::Inherit, Allow::from)
    }
}
