//! The process-owned set of nodes, loaded from a [`State`] once and written
//! back on its flush interval and when the registry goes away.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::clock::millis_to_uuid_time;
use crate::error::IdError;
use crate::node::{Node, NodeId, NodeSnapshot};
use crate::state::State;

/// Owner of the live node records for one generator setup.
pub struct NodeRegistry {
    state: Box<dyn State>,
    nodes: Vec<Arc<Node>>,
    last_flush: i64,
    closed: bool,
}

impl NodeRegistry {
    /// Load `state` and take ownership of its nodes.
    ///
    /// When the state knows no node, one is derived from host information
    /// (see [`NodeId::random`]).
    pub fn open(mut state: Box<dyn State>) -> Result<Self, IdError> {
        state.load()?;
        let mut nodes: Vec<Arc<Node>> = state
            .nodes()
            .iter()
            .map(|snapshot| Arc::new(Node::from(*snapshot)))
            .collect();

        if nodes.is_empty() {
            let id = NodeId::random();
            info!(target: "idgen.registry", node = %id, "no configured node, derived a random one");
            nodes.push(Arc::new(Node::new(id)));
        }

        debug!(
            target: "idgen.registry",
            nodes = nodes.len(),
            synch_interval = state.synch_interval(),
            "node registry opened"
        );

        Ok(Self {
            state,
            nodes,
            last_flush: Utc::now().timestamp_millis(),
            closed: false,
        })
    }

    /// The node new identifiers are issued from.
    pub fn node(&self) -> &Arc<Node> {
        // `open` guarantees at least one node.
        &self.nodes[0]
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    pub fn find(&self, id: NodeId) -> Option<&Arc<Node>> {
        self.nodes.iter().find(|n| n.id() == id)
    }

    pub fn synch_interval(&self) -> u64 {
        self.state.synch_interval()
    }

    pub fn is_read_only(&self) -> bool {
        self.state.is_read_only()
    }

    pub fn snapshots(&self) -> Vec<NodeSnapshot> {
        self.nodes.iter().map(|n| n.snapshot()).collect()
    }

    /// Unix milliseconds at which the next periodic flush is due.
    pub fn next_flush_at(&self) -> i64 {
        if self.is_read_only() {
            return i64::MAX;
        }
        let interval = i64::try_from(self.synch_interval()).unwrap_or(i64::MAX);
        self.last_flush.saturating_add(interval)
    }

    /// Store the current node state.
    pub fn flush(&mut self) -> Result<(), IdError> {
        self.state.store(&self.snapshots())?;
        self.last_flush = Utc::now().timestamp_millis();
        Ok(())
    }

    /// Store if the flush interval has elapsed at `now_millis`.
    ///
    /// Timestamps are written as `now + interval`, which covers everything
    /// issued before the following flush; returns whether a write happened.
    pub fn flush_if_due(&mut self, now_millis: i64) -> Result<bool, IdError> {
        if self.is_read_only() || now_millis < self.next_flush_at() {
            return Ok(false);
        }
        let interval = i64::try_from(self.synch_interval()).unwrap_or(i64::MAX);
        let pinned = millis_to_uuid_time(now_millis.saturating_add(interval));
        self.state.store_at(&self.snapshots(), pinned)?;
        self.last_flush = now_millis;
        debug!(target: "idgen.registry", pinned, "periodic node flush");
        Ok(true)
    }

    /// Flush for the last time and release the registry.
    pub fn close(mut self) -> Result<(), IdError> {
        self.closed = true;
        if self.is_read_only() {
            return Ok(());
        }
        self.flush()
    }
}

impl Drop for NodeRegistry {
    fn drop(&mut self) {
        if self.closed || self.is_read_only() {
            return;
        }
        if let Err(err) = self.flush() {
            warn!(target: "idgen.registry", error = %err, "failed to store node state on shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{FileState, ReadOnlyState, ResourceState, StateDocument};
    use std::fs;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn tmp_path(name: &str) -> PathBuf {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!(
            "idgen_registry_{}_{}_{}",
            std::process::id(),
            ts,
            name
        ))
    }

    const ID: NodeId = NodeId::new([0x02, 0, 0, 0, 0, 1]);

    #[test]
    fn test_empty_state_derives_random_node() {
        let registry = NodeRegistry::open(Box::new(ReadOnlyState::new())).unwrap();
        assert_eq!(registry.nodes().len(), 1);
        assert!(registry.node().id().is_multicast());
        assert_eq!(registry.next_flush_at(), i64::MAX);
    }

    #[test]
    fn test_configured_nodes_are_restored() {
        let state = ReadOnlyState::with_nodes(vec![NodeSnapshot {
            id: ID,
            last_timestamp: 1234,
            clock_sequence: 77,
        }])
        .unwrap();
        let registry = NodeRegistry::open(Box::new(state)).unwrap();
        assert_eq!(registry.node().id(), ID);
        assert_eq!(registry.node().clock_sequence(), 77);
        assert_eq!(registry.node().last_timestamp(), 1234);
        assert!(registry.find(ID).is_some());
        assert!(registry.find(NodeId::new([9; 6])).is_none());
    }

    #[test]
    fn test_load_failure_is_reported() {
        assert!(matches!(
            NodeRegistry::open(Box::new(ResourceState::new(None))),
            Err(IdError::Configuration(_))
        ));
    }

    #[test]
    fn test_read_only_never_flushes() {
        let mut registry = NodeRegistry::open(Box::new(ReadOnlyState::new())).unwrap();
        assert!(!registry.flush_if_due(i64::MAX - 1).unwrap());
        registry.close().unwrap();
    }

    #[test]
    fn test_periodic_flush_pins_future_timestamp() {
        let path = tmp_path("periodic.json");
        let state = FileState::new(&path).with_synch_interval(1_000);
        let mut registry = NodeRegistry::open(Box::new(state)).unwrap();
        let start = registry.next_flush_at() - 1_000;

        assert!(!registry.flush_if_due(start + 999).unwrap());
        assert!(registry.flush_if_due(start + 1_000).unwrap());
        assert_eq!(registry.next_flush_at(), start + 2_000);

        let doc = StateDocument::read(&path).unwrap();
        assert_eq!(doc.nodes.len(), 1);
        assert_eq!(doc.nodes[0].last_timestamp, millis_to_uuid_time(start + 2_000));

        registry.close().unwrap();
        let _ = fs::remove_file(path);
    }

    #[test]
    fn test_drop_persists_state() {
        let path = tmp_path("drop.json");
        let id = {
            let registry =
                NodeRegistry::open(Box::new(FileState::new(&path).with_synch_interval(60_000)))
                    .unwrap();
            registry.node().id()
        };
        let doc = StateDocument::read(&path).unwrap();
        assert_eq!(doc.nodes[0].id, id);
        let _ = fs::remove_file(path);
    }
}
