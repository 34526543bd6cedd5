//! Node registry
//!
//! The local node's view of the tree: every node known transitively plus the
//! subset that are direct children of the local node. Mutations are
//! serialized by a single async lock that is held across the fan-out to child
//! links, so every child observes add/remove events in the order this node
//! applied them. Readers take cheap `Arc` snapshots and never wait on that
//! lock.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use nodemesh_core::{MeshError, NetMessage, NodeId, NodeInfo, NodeStatus, Route};

use crate::link_pool::ChildLinks;
use crate::route;

/// Registry change notifications
#[derive(Clone, Debug)]
pub enum NodeEvent {
    /// A previously unknown node was added
    Added(NodeInfo),
    /// An existing node was updated in place
    Updated(NodeInfo),
    /// A node was removed
    Removed(NodeId),
    /// Liveness of a node changed
    StatusChanged {
        node_id: NodeId,
        status: NodeStatus,
        error: Option<String>,
    },
}

/// Point-in-time view of the registry
///
/// Nodes keep insertion order; an id index sits beside the list so lookups
/// during route walks are O(1).
#[derive(Clone, Debug, Default)]
pub struct NodeTable {
    nodes: Vec<NodeInfo>,
    index: HashMap<NodeId, usize>,
    /// Direct children of the local node, in tracking order
    children: Vec<NodeId>,
}

impl NodeTable {
    /// Build a table from a node list, tracking children of `local_id`
    pub fn from_nodes(local_id: &str, nodes: impl IntoIterator<Item = NodeInfo>) -> Self {
        let mut table = Self::default();
        for node in nodes {
            table.upsert(node);
        }
        table.track_children(local_id);
        table
    }

    pub fn get(&self, id: &str) -> Option<&NodeInfo> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn nodes(&self) -> &[NodeInfo] {
        &self.nodes
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The unique node without a parent
    ///
    /// `None` when there is no root or more than one.
    pub fn root(&self) -> Option<&NodeInfo> {
        let mut roots = self.nodes.iter().filter(|n| n.is_root());
        let root = roots.next()?;
        if roots.next().is_some() {
            return None;
        }
        Some(root)
    }

    /// Nodes whose parent is `id`
    pub fn children_of(&self, id: &str) -> Vec<&NodeInfo> {
        self.nodes.iter().filter(|n| n.parent_id == id).collect()
    }

    /// Insert or update in place; returns the previous record
    fn upsert(&mut self, node: NodeInfo) -> Option<NodeInfo> {
        match self.index.get(&node.id) {
            Some(&i) => {
                let previous = self.nodes[i].clone();
                self.nodes[i].update_from(&node);
                Some(previous)
            }
            None => {
                self.index.insert(node.id.clone(), self.nodes.len());
                self.nodes.push(node);
                None
            }
        }
    }

    fn remove(&mut self, id: &str) -> Option<NodeInfo> {
        self.children.retain(|c| c != id);
        let i = self.index.remove(id)?;
        let removed = self.nodes.remove(i);
        for pos in self.index.values_mut() {
            if *pos > i {
                *pos -= 1;
            }
        }
        Some(removed)
    }

    fn set_status(&mut self, id: &str, status: NodeStatus, error: Option<String>) -> bool {
        let Some(&i) = self.index.get(id) else {
            return false;
        };
        let node = &mut self.nodes[i];
        if node.status == status && node.status_error == error {
            return false;
        }
        node.status = status;
        node.status_error = error;
        true
    }

    /// Track nodes parented by `local_id` that are not yet children
    ///
    /// Returns the newly tracked nodes. Additive only.
    fn track_children(&mut self, local_id: &str) -> Vec<NodeInfo> {
        let fresh: Vec<NodeInfo> = self
            .nodes
            .iter()
            .filter(|n| n.parent_id == local_id && n.id != local_id)
            .filter(|n| !self.children.contains(&n.id))
            .cloned()
            .collect();
        self.children.extend(fresh.iter().map(|n| n.id.clone()));
        fresh
    }

    /// Stop tracking children that were re-parented elsewhere
    fn untrack_moved(&mut self, local_id: &str) -> Vec<NodeId> {
        let (keep, moved): (Vec<NodeId>, Vec<NodeId>) =
            self.children.drain(..).partition(|id| {
                self.index
                    .get(id)
                    .is_some_and(|&i| self.nodes[i].parent_id == local_id)
            });
        self.children = keep;
        moved
    }
}

/// Registry of nodes known to the local node
pub struct NodeRegistry {
    local_id: NodeId,
    table: RwLock<Arc<NodeTable>>,
    /// Serializes add/remove/refresh, held across child fan-out
    mutation: Mutex<()>,
    links: Arc<dyn ChildLinks>,
    event_tx: broadcast::Sender<NodeEvent>,
}

impl NodeRegistry {
    /// Create a registry seeded with the local node's own record
    pub fn new(local: NodeInfo, links: Arc<dyn ChildLinks>) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        let local_id = local.id.clone();
        Self {
            table: RwLock::new(Arc::new(NodeTable::from_nodes(&local_id, [local]))),
            local_id,
            mutation: Mutex::new(()),
            links,
            event_tx,
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Subscribe to registry events
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.event_tx.subscribe()
    }

    pub fn snapshot(&self) -> Arc<NodeTable> {
        Arc::clone(&self.table.read())
    }

    /// Add a node or update it in place
    ///
    /// The add is broadcast to every direct child before local state changes.
    pub async fn add_node(&self, node: NodeInfo) -> Result<(), MeshError> {
        if node.id.is_empty() {
            return Err(MeshError::Validation("node id is empty".into()));
        }
        if node.token.is_empty() {
            return Err(MeshError::Validation(format!(
                "node {} has no token",
                node.id
            )));
        }

        let _guard = self.mutation.lock().await;
        info!("Adding node {} ({})", node.id, node.descriptor());

        self.links.broadcast(&NetMessage::node_add(node.clone())).await;

        let (previous, moved, tracked) = {
            let mut guard = self.table.write();
            let table = Arc::make_mut(&mut guard);
            let previous = table.upsert(node.clone());
            let moved = table.untrack_moved(&self.local_id);
            let tracked = table.track_children(&self.local_id);
            (previous, moved, tracked)
        };

        for id in &moved {
            info!("Node {} moved away from {}, closing its link", id, self.local_id);
            self.links.close(id);
        }
        for child in &tracked {
            debug!("Tracking direct child {}", child.id);
            self.links.establish(child);
        }

        let event = match previous {
            Some(_) => NodeEvent::Updated(self.find_node(&node.id).unwrap_or(node)),
            None => NodeEvent::Added(node),
        };
        let _ = self.event_tx.send(event);
        Ok(())
    }

    /// Remove a node
    ///
    /// Unconditional: the removal is broadcast to every direct child even when
    /// the id is unknown here, and descendants are left for each hop to remove
    /// when the propagated message reaches it.
    pub async fn remove_node(&self, id: &str) -> Option<NodeInfo> {
        let _guard = self.mutation.lock().await;
        info!("Removing node {}", id);

        self.links.broadcast(&NetMessage::node_remove(id)).await;

        let (removed, was_child) = {
            let mut guard = self.table.write();
            let table = Arc::make_mut(&mut guard);
            let was_child = table.children.iter().any(|c| c == id);
            (table.remove(id), was_child)
        };

        if was_child {
            self.links.close(id);
        }
        if removed.is_some() {
            let _ = self.event_tx.send(NodeEvent::Removed(id.to_string()));
        } else {
            debug!("Node {} was not in the registry", id);
        }
        removed
    }

    /// Track new direct children and establish their links
    pub async fn refresh_node_list(&self) {
        let _guard = self.mutation.lock().await;
        let tracked = {
            let mut guard = self.table.write();
            Arc::make_mut(&mut guard).track_children(&self.local_id)
        };
        for child in &tracked {
            debug!("Tracking direct child {}", child.id);
            self.links.establish(child);
        }
    }

    /// Replay every known node to a child whose link just came up
    ///
    /// Runs under the mutation lock so the replay cannot interleave with a
    /// concurrent add or remove. Returns the number of records sent.
    pub async fn sync_child(&self, node_id: &str) -> Result<usize, MeshError> {
        let _guard = self.mutation.lock().await;
        let snapshot = self.snapshot();
        for node in snapshot.nodes() {
            self.links
                .send(node_id, NetMessage::node_add(node.clone()))
                .await?;
        }
        debug!("Replayed {} nodes to {}", snapshot.len(), node_id);
        Ok(snapshot.len())
    }

    /// Update a node's liveness; returns whether anything changed
    pub fn set_status(&self, id: &str, status: NodeStatus, error: Option<String>) -> bool {
        let changed = {
            let mut guard = self.table.write();
            // Skip the copy when nothing would change
            let differs = match guard.get(id) {
                Some(node) => node.status != status || node.status_error != error,
                None => {
                    warn!("Status update for unknown node {}", id);
                    false
                }
            };
            differs && Arc::make_mut(&mut guard).set_status(id, status, error.clone())
        };
        if changed {
            debug!("Node {} is now {}", id, status);
            let _ = self.event_tx.send(NodeEvent::StatusChanged {
                node_id: id.to_string(),
                status,
                error,
            });
        }
        changed
    }

    pub fn find_node(&self, id: &str) -> Option<NodeInfo> {
        self.table.read().get(id).cloned()
    }

    pub fn find_root_node(&self) -> Option<NodeInfo> {
        self.table.read().root().cloned()
    }

    pub fn find_children_of(&self, id: &str) -> Vec<NodeInfo> {
        self.table
            .read()
            .children_of(id)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Direct children of the local node
    pub fn children(&self) -> Vec<NodeId> {
        self.table.read().children().to_vec()
    }

    pub fn resolve_path(&self, from: &str, to: &str) -> Route {
        route::resolve_path(&self.snapshot(), from, to)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;

    /// Records every call the registry makes on its child links
    #[derive(Default)]
    pub(crate) struct RecordingLinks {
        pub broadcasts: parking_lot::Mutex<Vec<NetMessage>>,
        pub established: parking_lot::Mutex<Vec<NodeId>>,
        pub closed: parking_lot::Mutex<Vec<NodeId>>,
        pub sent: parking_lot::Mutex<Vec<(NodeId, NetMessage)>>,
    }

    #[async_trait]
    impl ChildLinks for RecordingLinks {
        async fn send(&self, node_id: &str, msg: NetMessage) -> Result<(), MeshError> {
            self.sent.lock().push((node_id.to_string(), msg));
            Ok(())
        }

        async fn broadcast(&self, msg: &NetMessage) {
            self.broadcasts.lock().push(msg.clone());
        }

        fn establish(&self, node: &NodeInfo) {
            self.established.lock().push(node.id.clone());
        }

        fn close(&self, node_id: &str) {
            self.closed.lock().push(node_id.to_string());
        }
    }

    fn node(id: &str, parent: &str) -> NodeInfo {
        NodeInfo::new(id, parent, format!("{id}-token"))
    }

    fn registry() -> (Arc<NodeRegistry>, Arc<RecordingLinks>) {
        let links = Arc::new(RecordingLinks::default());
        let registry = NodeRegistry::new(node("R", ""), links.clone());
        (Arc::new(registry), links)
    }

    #[tokio::test]
    async fn test_add_then_find() {
        let (registry, links) = registry();
        let a = node("A", "R").with_address("10.0.0.1", 21090);

        registry.add_node(a.clone()).await.unwrap();

        assert_eq!(registry.find_node("A"), Some(a));
        assert_eq!(registry.children(), vec!["A".to_string()]);
        assert_eq!(*links.established.lock(), vec!["A".to_string()]);
        assert!(matches!(
            links.broadcasts.lock().as_slice(),
            [NetMessage::NodeAdd(m)] if m.node.id == "A"
        ));
    }

    #[tokio::test]
    async fn test_update_in_place() {
        let (registry, links) = registry();
        registry.add_node(node("A", "R")).await.unwrap();

        let updated = node("A", "R").with_name("renamed").with_address("h", 7);
        registry.add_node(updated.clone()).await.unwrap();

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.get("A"), Some(&updated));
        assert_eq!(snapshot.children().len(), 1);
        // Update keeps the existing link
        assert_eq!(links.established.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_add_rejects_missing_fields() {
        let (registry, links) = registry();

        let err = registry.add_node(node("", "R")).await.unwrap_err();
        assert!(matches!(err, MeshError::Validation(_)));

        let err = registry
            .add_node(NodeInfo::new("A", "R", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::Validation(_)));

        assert!(registry.find_node("A").is_none());
        assert!(links.broadcasts.lock().is_empty());
    }

    #[tokio::test]
    async fn test_remove_clears_children() {
        let (registry, links) = registry();
        registry.add_node(node("A", "R")).await.unwrap();
        registry.add_node(node("B", "A")).await.unwrap();

        let removed = registry.remove_node("A").await;

        assert_eq!(removed.map(|n| n.id), Some("A".to_string()));
        assert!(registry.find_node("A").is_none());
        assert!(registry.children().is_empty());
        assert_eq!(*links.closed.lock(), vec!["A".to_string()]);
        // Descendants are removed by propagation, not here
        assert!(registry.find_node("B").is_some());
    }

    #[tokio::test]
    async fn test_remove_unknown_still_broadcasts() {
        let (registry, links) = registry();
        assert!(registry.remove_node("ghost").await.is_none());
        assert!(matches!(
            links.broadcasts.lock().as_slice(),
            [NetMessage::NodeRemove(m)] if m.node_id == "ghost"
        ));
        assert!(links.closed.lock().is_empty());
    }

    #[tokio::test]
    async fn test_grandchild_is_not_a_child() {
        let (registry, links) = registry();
        registry.add_node(node("A", "R")).await.unwrap();
        registry.add_node(node("B", "A")).await.unwrap();

        assert_eq!(registry.children(), vec!["A".to_string()]);
        assert_eq!(links.established.lock().len(), 1);
        assert_eq!(registry.find_children_of("A").len(), 1);
    }

    #[tokio::test]
    async fn test_reparent_drops_child() {
        let (registry, links) = registry();
        registry.add_node(node("A", "R")).await.unwrap();
        registry.add_node(node("C", "R")).await.unwrap();

        registry.add_node(node("C", "A")).await.unwrap();

        assert_eq!(registry.children(), vec!["A".to_string()]);
        assert_eq!(*links.closed.lock(), vec!["C".to_string()]);
    }

    #[tokio::test]
    async fn test_refresh_is_idempotent() {
        let (registry, links) = registry();
        registry.add_node(node("A", "R")).await.unwrap();
        registry.add_node(node("B", "R")).await.unwrap();

        registry.refresh_node_list().await;
        let first = registry.children();
        registry.refresh_node_list().await;
        let second = registry.children();

        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
        assert_eq!(links.established.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_sync_child_replays_everything() {
        let (registry, links) = registry();
        registry.add_node(node("A", "R")).await.unwrap();
        registry.add_node(node("B", "A")).await.unwrap();

        assert_eq!(registry.sync_child("A").await.unwrap(), 3);

        let sent = links.sent.lock();
        let ids: Vec<&str> = sent
            .iter()
            .map(|(to, msg)| {
                assert_eq!(to, "A");
                match msg {
                    NetMessage::NodeAdd(m) => m.node.id.as_str(),
                    other => panic!("unexpected {}", other.kind()),
                }
            })
            .collect();
        assert_eq!(ids, ["R", "A", "B"]);
    }

    #[tokio::test]
    async fn test_find_root() {
        let (registry, _links) = registry();
        registry.add_node(node("A", "R")).await.unwrap();
        assert_eq!(registry.find_root_node().map(|n| n.id), Some("R".into()));

        registry.add_node(node("S", "")).await.unwrap();
        assert!(registry.find_root_node().is_none());
    }

    #[tokio::test]
    async fn test_set_status_emits_event() {
        let (registry, _links) = registry();
        registry.add_node(node("A", "R")).await.unwrap();
        let mut events = registry.subscribe();

        assert!(registry.set_status("A", NodeStatus::Started, None));
        assert!(!registry.set_status("A", NodeStatus::Started, None));
        assert!(!registry.set_status("ghost", NodeStatus::Error, None));

        match events.recv().await.unwrap() {
            NodeEvent::StatusChanged { node_id, status, .. } => {
                assert_eq!(node_id, "A");
                assert_eq!(status, NodeStatus::Started);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_update_keeps_liveness() {
        let (registry, _links) = registry();
        registry.add_node(node("A", "R")).await.unwrap();
        assert!(registry.set_status("A", NodeStatus::Started, None));
        let mut events = registry.subscribe();

        // A parent replay or re-registration carries a default status
        registry
            .add_node(node("A", "R").with_name("renamed"))
            .await
            .unwrap();

        let stored = registry.find_node("A").unwrap();
        assert_eq!(stored.name, "renamed");
        assert_eq!(stored.status, NodeStatus::Started);
        match events.recv().await.unwrap() {
            NodeEvent::Updated(n) => assert_eq!(n.status, NodeStatus::Started),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_snapshot_is_stable() {
        let (registry, _links) = registry();
        let before = registry.snapshot();
        registry.add_node(node("A", "R")).await.unwrap();
        assert!(!before.contains("A"));
        assert!(registry.snapshot().contains("A"));
    }

    #[tokio::test]
    async fn test_add_remove_race_last_writer_wins() {
        for _ in 0..32 {
            let (registry, _links) = registry();
            registry.add_node(node("X", "R")).await.unwrap();
            let mut events = registry.subscribe();

            let adder = {
                let registry = registry.clone();
                tokio::spawn(async move {
                    registry
                        .add_node(node("X", "R").with_name("updated"))
                        .await
                })
            };
            let remover = {
                let registry = registry.clone();
                tokio::spawn(async move { registry.remove_node("X").await })
            };
            adder.await.unwrap().unwrap();
            remover.await.unwrap();

            let mut last = None;
            while let Ok(event) = events.try_recv() {
                last = Some(event);
            }
            match last {
                Some(NodeEvent::Removed(_)) => assert!(registry.find_node("X").is_none()),
                Some(NodeEvent::Added(n)) | Some(NodeEvent::Updated(n)) => {
                    assert_eq!(registry.find_node("X"), Some(n));
                    assert!(registry.children().contains(&"X".to_string()));
                }
                other => panic!("unexpected final event {:?}", other),
            }
        }
    }
}
