//! Hierarchical dependency resolution for tree-structured entities.
//!
//! Reconciling a category requires its parent to already have a
//! resolved sink id, so a request for one node expands into the full
//! root→target chain. The chain is dispatched as a strict linear task
//! sequence — each link runs only after the previous link's create has
//! committed — never as a fan-out.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// One node of the category tree, as read from the source system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryNode {
    pub id: i64,
    pub name: String,
    pub parent_id: Option<i64>,
}

/// Build the root→target chain for one node.
///
/// Walks `parent_id` pointers upward and reverses the path. Dangling
/// parent pointers end the walk (the highest known ancestor becomes the
/// root); cycles are guarded by a visited set so corrupt data cannot
/// loop forever.
#[must_use]
pub fn build_chain(target_id: i64, nodes: &HashMap<i64, CategoryNode>) -> Vec<CategoryNode> {
    let mut chain = Vec::new();
    let mut visited = HashSet::new();
    let mut current = nodes.get(&target_id);

    while let Some(node) = current {
        if !visited.insert(node.id) {
            break;
        }
        chain.push(node.clone());
        current = node.parent_id.and_then(|pid| nodes.get(&pid));
    }

    chain.reverse();
    chain
}

/// Index a node list by id.
#[must_use]
pub fn nodes_by_id(nodes: Vec<CategoryNode>) -> HashMap<i64, CategoryNode> {
    nodes.into_iter().map(|node| (node.id, node)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: i64, name: &str, parent_id: Option<i64>) -> CategoryNode {
        CategoryNode {
            id,
            name: name.to_string(),
            parent_id,
        }
    }

    fn tree() -> HashMap<i64, CategoryNode> {
        nodes_by_id(vec![
            node(1, "All", None),
            node(2, "Office", Some(1)),
            node(3, "Chairs", Some(2)),
            node(4, "Outdoor", Some(1)),
        ])
    }

    #[test]
    fn test_chain_is_root_to_target() {
        let chain = build_chain(3, &tree());
        let names: Vec<_> = chain.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, ["All", "Office", "Chairs"]);
    }

    #[test]
    fn test_root_chain_is_single_node() {
        let chain = build_chain(1, &tree());
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].id, 1);
    }

    #[test]
    fn test_unknown_target_is_empty() {
        assert!(build_chain(99, &tree()).is_empty());
    }

    #[test]
    fn test_dangling_parent_starts_at_highest_known() {
        let nodes = nodes_by_id(vec![node(2, "Office", Some(1)), node(3, "Chairs", Some(2))]);
        let chain = build_chain(3, &nodes);
        let ids: Vec<_> = chain.iter().map(|n| n.id).collect();
        assert_eq!(ids, [2, 3]);
    }

    #[test]
    fn test_cycle_terminates() {
        let nodes = nodes_by_id(vec![node(1, "A", Some(2)), node(2, "B", Some(1))]);
        let chain = build_chain(1, &nodes);
        assert_eq!(chain.len(), 2);
    }
}
