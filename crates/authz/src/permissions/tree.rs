//! Permission tree construction and resolution.
//!
//! The catalog is a flat list of dot-segmented system names. A tree is built
//! per role: the structure comes from the names alone, and each node carries
//! the role's tri-state [`Allow`] for that permission.
//!
//! Nodes live in a flat arena with parent and child indices; the virtual,
//! empty-named root sits at index 0.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::models::{Allow, Permission, RoleMapping};

const ROOT: usize = 0;

/// One permission within a tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionNode {
    pub id: i64,
    pub system_name: String,
    pub allow: Allow,
    parent: Option<usize>,
    children: Vec<usize>,
}

impl PermissionNode {
    fn new(id: i64, system_name: String, allow: Allow, parent: Option<usize>) -> Self {
        Self {
            id,
            system_name,
            allow,
            parent,
            children: Vec::new(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

/// A rooted permission hierarchy with O(1) lookup by system name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionTree {
    nodes: Vec<PermissionNode>,
    index: HashMap<String, usize>,
}

impl PermissionTree {
    /// Build a tree from the catalog, applying one role's mappings.
    ///
    /// A node's parent is the node whose name is the longest proper
    /// dot-prefix present in the catalog; names without one hang off the
    /// root. Mappings for permissions outside the catalog are ignored.
    pub fn build(catalog: &[Permission], mappings: &[RoleMapping]) -> Self {
        let allow_by_permission: HashMap<i64, bool> = mappings
            .iter()
            .map(|m| (m.permission_id, m.allow))
            .collect();

        // Shallow names first so every parent is indexed before its children.
        let mut ordered: Vec<&Permission> = catalog
            .iter()
            .filter(|p| !p.system_name.is_empty())
            .collect();
        ordered.sort_by(|a, b| {
            depth_of(&a.system_name)
                .cmp(&depth_of(&b.system_name))
                .then_with(|| a.system_name.cmp(&b.system_name))
        });

        let mut tree = Self {
            nodes: vec![PermissionNode::new(0, String::new(), Allow::Inherit, None)],
            index: HashMap::with_capacity(ordered.len()),
        };

        for permission in ordered {
            if tree.index.contains_key(&permission.system_name) {
                continue;
            }

            let parent = tree.nearest_ancestor_index(&permission.system_name);
            let allow = Allow::from(allow_by_permission.get(&permission.id).copied());
            let position = tree.nodes.len();

            tree.nodes.push(PermissionNode::new(
                permission.id,
                permission.system_name.clone(),
                allow,
                Some(parent),
            ));
            tree.nodes[parent].children.push(position);
            tree.index.insert(permission.system_name.clone(), position);
        }

        tree
    }

    /// Tree with the same shape whose allow values come from `allow_for`.
    pub fn map_allow(&self, mut allow_for: impl FnMut(&PermissionNode) -> Allow) -> Self {
        let mut tree = self.clone();
        for (position, node) in self.nodes.iter().enumerate().skip(1) {
            tree.nodes[position].allow = allow_for(node);
        }
        tree
    }

    /// Whether the role is allowed `system_name`.
    ///
    /// Unknown names are denied. Otherwise the nearest explicit decision on
    /// the path from the node up to the root wins; no decision at all means
    /// deny.
    pub fn authorize(&self, system_name: &str) -> bool {
        match self.index.get(system_name) {
            Some(&position) => self.ancestor_decision(position),
            None => false,
        }
    }

    /// Like [`PermissionTree::authorize`], but when `allow_by_descendant` is
    /// set a grant anywhere below the node also authorizes it.
    pub fn find_authorization(&self, system_name: &str, allow_by_descendant: bool) -> bool {
        let Some(&position) = self.index.get(system_name) else {
            return false;
        };

        if allow_by_descendant && self.any_descendant_granted(position) {
            return true;
        }

        self.ancestor_decision(position)
    }

    pub fn get(&self, system_name: &str) -> Option<&PermissionNode> {
        self.index.get(system_name).map(|&i| &self.nodes[i])
    }

    pub fn root(&self) -> &PermissionNode {
        &self.nodes[ROOT]
    }

    pub fn parent(&self, node: &PermissionNode) -> Option<&PermissionNode> {
        node.parent.map(|i| &self.nodes[i])
    }

    pub fn children(&self, node: &PermissionNode) -> impl Iterator<Item = &PermissionNode> {
        node.children.iter().map(|&i| &self.nodes[i])
    }

    /// Number of ancestors between `node` and the root.
    pub fn depth(&self, node: &PermissionNode) -> usize {
        let mut depth = 0;
        let mut current = node.parent;
        while let Some(position) = current {
            if position == ROOT {
                break;
            }
            depth += 1;
            current = self.nodes[position].parent;
        }
        depth
    }

    /// All permission nodes in pre-order, root excluded.
    pub fn iter(&self) -> impl Iterator<Item = &PermissionNode> {
        let mut stack: Vec<usize> = self.nodes[ROOT].children.iter().rev().copied().collect();
        std::iter::from_fn(move || {
            let position = stack.pop()?;
            let node = &self.nodes[position];
            stack.extend(node.children.iter().rev().copied());
            Some(node)
        })
    }

    /// Number of permission nodes, root excluded.
    pub fn len(&self) -> usize {
        self.nodes.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn nearest_ancestor_index(&self, system_name: &str) -> usize {
        let mut prefix = system_name;
        while let Some((head, _)) = prefix.rsplit_once('.') {
            if let Some(&position) = self.index.get(head) {
                return position;
            }
            prefix = head;
        }
        ROOT
    }

    fn ancestor_decision(&self, position: usize) -> bool {
        let mut current = Some(position);
        while let Some(i) = current {
            let node = &self.nodes[i];
            if let Some(decision) = node.allow.decision() {
                return decision;
            }
            current = node.parent;
        }
        false
    }

    fn any_descendant_granted(&self, position: usize) -> bool {
        let mut stack: Vec<usize> = self.nodes[position].children.clone();
        while let Some(i) = stack.pop() {
            let node = &self.nodes[i];
            if node.allow == Allow::Grant {
                return true;
            }
            stack.extend_from_slice(&node.children);
        }
        false
    }
}

fn depth_of(system_name: &str) -> usize {
    system_name.matches('.').count()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn catalog(names: &[&str]) -> Vec<Permission> {
        names
            .iter()
            .enumerate()
            .map(|(i, name)| Permission {
                id: i as i64 + 1,
                system_name: name.to_string(),
            })
            .collect()
    }

    fn mapping(catalog: &[Permission], name: &str, allow: bool) -> RoleMapping {
        let permission = catalog.iter().find(|p| p.system_name == name).unwrap();
        RoleMapping {
            permission_id: permission.id,
            role_id: 1,
            allow,
        }
    }

    #[test]
    fn nearest_explicit_ancestor_wins() {
        let perms = catalog(&["a", "a.b", "a.b.c"]);
        let mappings = vec![mapping(&perms, "a", false), mapping(&perms, "a.b", true)];
        let tree = PermissionTree::build(&perms, &mappings);

        assert!(tree.authorize("a.b.c"));
        assert!(tree.authorize("a.b"));
        assert!(!tree.authorize("a"));
    }

    #[test]
    fn no_decision_on_chain_denies() {
        let perms = catalog(&["a", "a.b", "a.b.c"]);
        let tree = PermissionTree::build(&perms, &[]);

        assert!(!tree.authorize("a.b.c"));
        assert!(!tree.authorize("a"));
    }

    #[test]
    fn unknown_permission_denies() {
        let perms = catalog(&["a"]);
        let tree = PermissionTree::build(&perms, &[mapping(&perms, "a", true)]);

        assert!(!tree.authorize("a.unknown"));
        assert!(!tree.find_authorization("missing", true));
    }

    #[test]
    fn descendant_grant_authorizes_broader_check() {
        let perms = catalog(&["a", "a.b", "a.b.c"]);
        let mappings = vec![mapping(&perms, "a.b", false), mapping(&perms, "a.b.c", true)];
        let tree = PermissionTree::build(&perms, &mappings);

        assert!(tree.find_authorization("a", true));
        assert!(!tree.find_authorization("a", false));
        assert!(!tree.authorize("a"));
    }

    #[test]
    fn descendant_search_falls_back_to_ancestors() {
        let perms = catalog(&["a", "a.b"]);
        let tree = PermissionTree::build(&perms, &[mapping(&perms, "a", true)]);

        assert!(tree.find_authorization("a.b", true));
    }

    #[test]
    fn structure_is_independent_of_input_order() {
        let forward = catalog(&["catalog", "catalog.product", "catalog.product.create"]);
        let mut reversed = forward.clone();
        reversed.reverse();

        let a = PermissionTree::build(&forward, &[]);
        let b = PermissionTree::build(&reversed, &[]);

        let names = |t: &PermissionTree| t.iter().map(|n| n.system_name.clone()).collect::<Vec<_>>();
        assert_eq!(names(&a), names(&b));
    }

    #[test]
    fn missing_intermediate_attaches_to_longest_present_prefix() {
        let perms = catalog(&["sales", "sales.order.read", "cms"]);
        let tree = PermissionTree::build(&perms, &[mapping(&perms, "sales", true)]);

        let node = tree.get("sales.order.read").unwrap();
        assert_eq!(tree.parent(node).unwrap().system_name, "sales");
        assert_eq!(tree.depth(node), 1);
        assert!(tree.authorize("sales.order.read"));
    }

    #[test]
    fn similar_prefixes_are_not_parents() {
        let perms = catalog(&["cat", "catalog.read"]);
        let tree = PermissionTree::build(&perms, &[mapping(&perms, "cat", true)]);

        let node = tree.get("catalog.read").unwrap();
        assert!(tree.parent(node).unwrap().is_root());
        assert!(!tree.authorize("catalog.read"));
    }

    #[test]
    fn children_and_iteration() {
        let perms = catalog(&["a", "a.x", "a.y", "b"]);
        let tree = PermissionTree::build(&perms, &[]);

        let a = tree.get("a").unwrap();
        let children: Vec<&str> = tree.children(a).map(|n| n.system_name.as_str()).collect();
        assert_eq!(children, vec!["a.x", "a.y"]);

        let all: Vec<&str> = tree.iter().map(|n| n.system_name.as_str()).collect();
        assert_eq!(all, vec!["a", "a.x", "a.y", "b"]);
        assert_eq!(tree.len(), 4);
        assert_eq!(tree.children(tree.root()).count(), 2);
    }

    #[test]
    fn survives_json_round_trip() {
        let perms = catalog(&["a", "a.b"]);
        let tree = PermissionTree::build(&perms, &[mapping(&perms, "a.b", true)]);

        let raw = serde_json::to_string(&tree).unwrap();
        let restored: PermissionTree = serde_json::from_str(&raw).unwrap();

        assert_eq!(tree, restored);
        assert!(restored.authorize("a.b"));
    }
}
