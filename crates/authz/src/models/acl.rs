//! Entity-level access control records.

use serde::{Deserialize, Serialize};

/// An explicit grant of one entity instance to one role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct AclRecord {
    pub id: i64,
    pub entity_name: String,
    pub entity_id: i64,
    pub role_id: i64,
}

/// A domain entity that can be restricted to a set of roles.
///
/// Products, categories, manufacturers and the like implement this so the
/// ACL service can read their identity and maintain the `subject_to_acl`
/// flag.
pub trait AclEntity {
    /// Entity type name, e.g. `Product`. Compared case-insensitively.
    fn entity_name(&self) -> &str;

    fn entity_id(&self) -> i64;

    fn subject_to_acl(&self) -> bool;

    fn set_subject_to_acl(&mut self, subject: bool);
}
