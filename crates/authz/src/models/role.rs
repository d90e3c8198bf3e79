//! Customer role model.

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Well-known role system names.
pub mod well_known {
    /// Full back-office access.
    pub const ADMINISTRATORS: &str = "administrators";

    /// Every signed-in customer.
    pub const REGISTERED: &str = "registered";

    /// Visitors without an account.
    pub const GUESTS: &str = "guests";

    /// Whether `system_name` names a platform role (case-insensitive).
    pub fn is_well_known(system_name: &str) -> bool {
        [ADMINISTRATORS, REGISTERED, GUESTS]
            .iter()
            .any(|name| name.eq_ignore_ascii_case(system_name))
    }
}

/// Role record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Role {
    pub id: i64,
    pub system_name: String,
    pub active: bool,
    pub is_system_role: bool,
}

impl Role {
    /// Reject deletion of system roles.
    pub fn ensure_deletable(&self) -> Result<(), StoreError> {
        if self.is_system_role {
            return Err(StoreError::SystemRoleDeletion {
                system_name: self.system_name.clone(),
            });
        }
        Ok(())
    }
}

/// Values for a role that has not been persisted yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRole {
    pub system_name: String,
    pub active: bool,
    pub is_system_role: bool,
}

impl NewRole {
    /// An active, non-system role.
    pub fn active(system_name: impl Into<String>) -> Self {
        Self {
            system_name: system_name.into(),
            active: true,
            is_system_role: false,
        }
    }

    /// An active role created to receive default grants. Well-known
    /// platform roles are created as system roles.
    pub fn for_grant(system_name: impl Into<String>) -> Self {
        let system_name = system_name.into();
        Self {
            is_system_role: well_known::is_well_known(&system_name),
            system_name,
            active: true,
        }
    }
}
