//! Route resolution over a registry snapshot
//!
//! A route between two nodes climbs from the source to the lowest common
//! ancestor and descends to the destination. Both functions are pure: they
//! read a [`NodeTable`] and never touch the registry lock.

use std::collections::HashSet;

use nodemesh_core::{NodeId, Route};

use crate::registry::NodeTable;

/// Chain of ids from `id` up to the root, inclusive at both ends
///
/// Returns an empty chain when `id` is unknown, when a parent reference
/// dangles before reaching a root, or when the parent links form a cycle.
/// The chain must end at the table's one root; a table with several
/// parentless records has no root and resolves nothing.
pub fn path_to_root(table: &NodeTable, id: &str) -> Route {
    let Some(root) = table.root() else {
        return Vec::new();
    };
    let mut chain: Route = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();
    let mut current = id;

    while let Some(node) = table.get(current) {
        if !seen.insert(node.id.as_str()) {
            return Vec::new();
        }
        chain.push(node.id.clone());
        if node.is_root() {
            break;
        }
        current = node.parent_id.as_str();
    }

    let starts_at_id = chain.first().is_some_and(|first| first == id);
    let ends_at_root = chain.last().is_some_and(|last| *last == root.id);

    if starts_at_id && ends_at_root {
        chain
    } else {
        Vec::new()
    }
}

/// Route from `from` to `to` through their lowest common ancestor
///
/// Empty when either endpoint cannot reach the root or the two endpoints
/// share no ancestor.
pub fn resolve_path(table: &NodeTable, from: &str, to: &str) -> Route {
    let from_root = path_to_root(table, from);
    if from_root.is_empty() {
        return Vec::new();
    }
    let to_root = path_to_root(table, to);
    if to_root.is_empty() {
        return Vec::new();
    }

    if from_root.len() == 1 {
        return to_root.into_iter().rev().collect();
    }
    if to_root.len() == 1 {
        return from_root;
    }

    for (i, id) in to_root.iter().enumerate() {
        if let Some(n) = from_root.iter().position(|one| one == id) {
            let mut route: Route = from_root[..n].to_vec();
            route.extend(to_root[..=i].iter().rev().cloned());
            return route;
        }
    }

    Vec::new()
}

/// The neighbor after `local` on `route`, if any
pub fn next_hop<'a>(route: &'a [NodeId], local: &str) -> Option<&'a NodeId> {
    let pos = route.iter().position(|id| id == local)?;
    route.get(pos + 1)
}

/// The neighbor before `local` on `route`, if any
pub fn prev_hop<'a>(route: &'a [NodeId], local: &str) -> Option<&'a NodeId> {
    let pos = route.iter().position(|id| id == local)?;
    pos.checked_sub(1).and_then(|p| route.get(p))
}
