//! Bazaar authorization core.
//!
//! Hierarchical permission checks with per-role tree caching, entity ACLs
//! cached in fixed-width id segments, and an idempotent permission catalog
//! installer. Persistence and caching are reached through the
//! [`store::AuthzStore`] and [`cache::CacheStore`] ports; committed writes
//! evict affected cache entries through the listeners in [`invalidation`].

pub mod acl;
pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod invalidation;
pub mod models;
pub mod permissions;
pub mod store;

pub use acl::AclService;
pub use config::AuthzConfig;
pub use error::{AuthzError, AuthzResult};
pub use permissions::{PermissionInstaller, PermissionService, RoleService};
