//! The customer as seen by the authorization core.

use serde::{Deserialize, Serialize};

use super::Role;

/// A customer and the roles mapped to them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub id: i64,
    pub roles: Vec<Role>,
}

impl Customer {
    pub fn new(id: i64, roles: Vec<Role>) -> Self {
        Self { id, roles }
    }

    /// Roles that take part in authorization. Inactive roles never grant.
    pub fn active_roles(&self) -> impl Iterator<Item = &Role> {
        self.roles.iter().filter(|r| r.active)
    }
}
