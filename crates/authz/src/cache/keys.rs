//! Cache key formats.
//!
//! These strings are shared with other processes reading the same backend,
//! so their shape is fixed.

/// Width of one ACL segment. Boundaries never change at runtime.
pub const ACL_SEGMENT_SIZE: i64 = 1000;

/// Evicts every cached permission tree.
pub const PERMISSION_TREE_PATTERN: &str = "permission:tree-*";

/// Evicts every cached ACL segment.
pub const ACL_SEGMENT_PATTERN: &str = "acl:range-*";

/// `permission:tree-{roleId}`
pub fn permission_tree(role_id: i64) -> String {
    format!("permission:tree-{role_id}")
}

/// `permission:{customerId}.{mode}.{permissionName}`, where mode is whether
/// descendant grants count.
pub fn authorization_result(customer_id: i64, allow_by_descendant: bool, permission: &str) -> String {
    format!("permission:{customer_id}.{allow_by_descendant}.{permission}")
}

/// Lower bound of the segment containing `entity_id`. The lowest segment is
/// clamped to `i64::MIN` where the multiple would not fit.
pub fn segment_floor(entity_id: i64) -> i64 {
    entity_id
        .div_euclid(ACL_SEGMENT_SIZE)
        .checked_mul(ACL_SEGMENT_SIZE)
        .unwrap_or(i64::MIN)
}

/// Inclusive `(min, max)` id range of the segment containing `entity_id`.
/// The topmost segment ends at `i64::MAX`.
pub fn segment_bounds(entity_id: i64) -> (i64, i64) {
    let min = segment_floor(entity_id);
    let max = entity_id
        .div_euclid(ACL_SEGMENT_SIZE)
        .checked_add(1)
        .and_then(|next| next.checked_mul(ACL_SEGMENT_SIZE))
        .map_or(i64::MAX, |next| next - 1);
    (min, max)
}

/// `acl:range-{entityNameLower}.{minId}`
pub fn acl_segment(entity_name: &str, entity_id: i64) -> String {
    format!(
        "acl:range-{}.{}",
        entity_name.to_lowercase(),
        segment_floor(entity_id)
    )
}
