//! Data models for the authorization core.

pub mod acl;
pub mod customer;
pub mod permission;
pub mod role;

pub use acl::{AclEntity, AclRecord};
pub use customer::Customer;
pub use permission::{Allow, Permission, RoleMapping};
pub use role::{NewRole, Role};
