//! Authorization error types.

use thiserror::Error;

/// Errors raised by a persistence port implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// System roles are part of the platform and cannot be removed.
    #[error("role '{system_name}' is a system role and cannot be deleted")]
    SystemRoleDeletion { system_name: String },

    #[error("role {0} not found")]
    RoleNotFound(i64),

    #[error("permission '{0}' already exists")]
    DuplicatePermission(String),

    #[error("role '{0}' already exists")]
    DuplicateRole(String),

    #[error("database error")]
    Database(#[from] sqlx::Error),
}

/// Errors raised by a cache port implementation.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),

    #[error("invalid cache pattern '{0}'")]
    InvalidPattern(String),
}

/// Errors surfaced by the authorization services.
#[derive(Debug, Error)]
pub enum AuthzError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("cache value could not be encoded: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias using AuthzError.
pub type AuthzResult<T> = Result<T, AuthzError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_role_error_names_the_role() {
        let err = StoreError::SystemRoleDeletion {
            system_name: "administrators".to_string(),
        };
        assert!(err.to_string().contains("administrators"));
    }

    #[test]
    fn store_errors_pass_through_transparently() {
        let err: AuthzError = StoreError::RoleNotFound(7).into();
        assert_eq!(err.to_string(), "role 7 not found");
    }
}
