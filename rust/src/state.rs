//! Persisted node state.
//!
//! A [`State`] loads node records from somewhere durable, accepts them back
//! for storage and says how often it wants to be written. The on-disk shape
//! is a small JSON document:
//!
//! ```text
//! {
//!   "synch_interval": 5000,
//!   "nodes": [
//!     { "id": "1A-2B-3C-4D-5E-6F", "clock_sequence": 42, "timestamp": 139000000000000000 }
//!   ]
//! }
//! ```
//!
//! Numeric attributes are read leniently: anything missing or unparseable
//! becomes `0` instead of failing the whole load. A node without a usable
//! clock sequence is restored as a fresh one.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::IdError;
use crate::node::{CLOCK_SEQUENCE_MAX, NodeId, NodeSnapshot, new_clock_sequence};

/// Flush interval reported by registries that never write.
pub const READ_ONLY_SYNCH_INTERVAL: u64 = u64::MAX;

/// Flush interval of a writable registry when none is configured.
pub const DEFAULT_SYNCH_INTERVAL: u64 = 5_000;

/// Load/store contract for node records.
pub trait State: Send {
    /// Populate the node set from the backing resource.
    fn load(&mut self) -> Result<(), IdError>;

    /// Nodes known after `load`.
    fn nodes(&self) -> &[NodeSnapshot];

    /// Persist the given nodes as they are.
    fn store(&mut self, nodes: &[NodeSnapshot]) -> Result<(), IdError>;

    /// Persist the given nodes with every last timestamp pinned to
    /// `timestamp`, normally a point slightly in the future so that writes
    /// can be batched.
    fn store_at(&mut self, nodes: &[NodeSnapshot], timestamp: u64) -> Result<(), IdError>;

    /// Milliseconds between writes to stable storage.
    fn synch_interval(&self) -> u64;

    fn is_read_only(&self) -> bool {
        self.synch_interval() == READ_ONLY_SYNCH_INTERVAL
    }
}

/// Reject node sets that carry the same identity twice.
pub fn ensure_distinct(nodes: &[NodeSnapshot]) -> Result<(), IdError> {
    let mut seen = HashSet::with_capacity(nodes.len());
    for node in nodes {
        if !seen.insert(node.id) {
            return Err(IdError::InvalidArgument(format!(
                "duplicate node {} in store request",
                node.id
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RawDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    synch_interval: Option<Value>,
    #[serde(default)]
    nodes: Vec<RawNode>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RawNode {
    id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    clock_sequence: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timestamp: Option<Value>,
}

/// `None` when the attribute is missing or unparseable; the latter is logged.
fn lenient_u64(field: &str, value: Option<&Value>) -> Option<u64> {
    let parsed = match value? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    if parsed.is_none() {
        warn!(target: "idgen.state", field, value = ?value, "unparseable attribute");
    }
    parsed
}

/// Parsed registry document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateDocument {
    pub synch_interval: Option<u64>,
    pub nodes: Vec<NodeSnapshot>,
}

impl StateDocument {
    /// Parse a registry document.
    ///
    /// Nodes whose id does not decode are skipped. A node without a usable
    /// clock sequence (missing, unparseable or above 14 bits) is treated as
    /// never used: it gets a fresh random sequence and a zero timestamp.
    /// A stored `0` is a real sequence and is kept with its timestamp.
    pub fn from_json(data: &str) -> Result<Self, IdError> {
        let raw: RawDocument = serde_json::from_str(data)?;
        let synch_interval = raw
            .synch_interval
            .as_ref()
            .map(|v| lenient_u64("synch_interval", Some(v)).unwrap_or(0));

        let mut nodes: Vec<NodeSnapshot> = Vec::with_capacity(raw.nodes.len());
        for entry in &raw.nodes {
            let id: NodeId = match entry.id.parse() {
                Ok(id) => id,
                Err(_) => {
                    warn!(target: "idgen.state", id = %entry.id, "skipping node with malformed id");
                    continue;
                }
            };
            if nodes.iter().any(|n| n.id == id) {
                warn!(target: "idgen.state", %id, "skipping duplicate node");
                continue;
            }
            let seq = lenient_u64("clock_sequence", entry.clock_sequence.as_ref())
                .and_then(|seq| match u16::try_from(seq) {
                    Ok(seq) if seq <= CLOCK_SEQUENCE_MAX => Some(seq),
                    _ => {
                        warn!(target: "idgen.state", %id, seq, "clock sequence out of range");
                        None
                    }
                });
            let snapshot = match seq {
                Some(seq) => NodeSnapshot {
                    id,
                    last_timestamp: lenient_u64("timestamp", entry.timestamp.as_ref())
                        .unwrap_or(0),
                    clock_sequence: seq,
                },
                None => {
                    debug!(target: "idgen.state", %id, "no usable clock sequence, starting fresh");
                    NodeSnapshot {
                        id,
                        last_timestamp: 0,
                        clock_sequence: new_clock_sequence(),
                    }
                }
            };
            nodes.push(snapshot);
        }

        Ok(Self {
            synch_interval,
            nodes,
        })
    }

    pub fn to_json(&self) -> Result<String, IdError> {
        let raw = RawDocument {
            synch_interval: self.synch_interval.map(Value::from),
            nodes: self
                .nodes
                .iter()
                .map(|n| RawNode {
                    id: n.id.to_string(),
                    clock_sequence: Some(Value::from(n.clock_sequence)),
                    timestamp: Some(Value::from(n.last_timestamp)),
                })
                .collect(),
        };
        Ok(serde_json::to_string_pretty(&raw)?)
    }

    pub fn read(path: &Path) -> Result<Self, IdError> {
        Self::from_json(&fs::read_to_string(path)?)
    }

    /// Write through a sibling temp file and rename, so readers never see a
    /// half-written document.
    pub fn write(&self, path: &Path) -> Result<(), IdError> {
        let json = self.to_json()?;
        let ext = path.extension().unwrap_or_default().to_string_lossy();
        let tmp = path.with_extension(format!("{}.tmp", ext));
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// In-memory registry that never writes. The default when nothing is configured.
#[derive(Debug, Clone, Default)]
pub struct ReadOnlyState {
    nodes: Vec<NodeSnapshot>,
}

impl ReadOnlyState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_nodes(nodes: Vec<NodeSnapshot>) -> Result<Self, IdError> {
        ensure_distinct(&nodes)?;
        Ok(Self { nodes })
    }
}

impl State for ReadOnlyState {
    fn load(&mut self) -> Result<(), IdError> {
        Ok(())
    }

    fn nodes(&self) -> &[NodeSnapshot] {
        &self.nodes
    }

    fn store(&mut self, nodes: &[NodeSnapshot]) -> Result<(), IdError> {
        ensure_distinct(nodes)
    }

    fn store_at(&mut self, nodes: &[NodeSnapshot], _timestamp: u64) -> Result<(), IdError> {
        ensure_distinct(nodes)
    }

    fn synch_interval(&self) -> u64 {
        READ_ONLY_SYNCH_INTERVAL
    }
}

/// Read-only registry backed by a document on disk.
///
/// Loading fails with [`IdError::Configuration`] when no document is
/// configured or it cannot be read.
#[derive(Debug, Clone, Default)]
pub struct ResourceState {
    resource: Option<PathBuf>,
    nodes: Vec<NodeSnapshot>,
}

impl ResourceState {
    pub fn new(resource: Option<PathBuf>) -> Self {
        Self {
            resource,
            nodes: Vec::new(),
        }
    }
}

impl State for ResourceState {
    fn load(&mut self) -> Result<(), IdError> {
        let path = self.resource.as_ref().ok_or_else(|| {
            IdError::Configuration("no node registry resource configured".to_string())
        })?;
        let data = fs::read_to_string(path).map_err(|e| {
            IdError::Configuration(format!("cannot read node registry {}: {e}", path.display()))
        })?;
        let doc = StateDocument::from_json(&data)?;
        info!(
            target: "idgen.state",
            path = %path.display(),
            nodes = doc.nodes.len(),
            "loaded read-only node registry"
        );
        self.nodes = doc.nodes;
        Ok(())
    }

    fn nodes(&self) -> &[NodeSnapshot] {
        &self.nodes
    }

    fn store(&mut self, nodes: &[NodeSnapshot]) -> Result<(), IdError> {
        ensure_distinct(nodes)
    }

    fn store_at(&mut self, nodes: &[NodeSnapshot], _timestamp: u64) -> Result<(), IdError> {
        ensure_distinct(nodes)
    }

    fn synch_interval(&self) -> u64 {
        READ_ONLY_SYNCH_INTERVAL
    }
}

/// Writable registry backed by a document on disk.
#[derive(Debug, Clone)]
pub struct FileState {
    path: PathBuf,
    synch_interval: u64,
    interval_override: Option<u64>,
    nodes: Vec<NodeSnapshot>,
}

impl FileState {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            synch_interval: DEFAULT_SYNCH_INTERVAL,
            interval_override: None,
            nodes: Vec::new(),
        }
    }

    /// Force the flush interval regardless of what the document says.
    pub fn with_synch_interval(mut self, millis: u64) -> Self {
        self.interval_override = Some(millis);
        self.synch_interval = millis;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&mut self, nodes: Vec<NodeSnapshot>) -> Result<(), IdError> {
        let doc = StateDocument {
            synch_interval: Some(self.synch_interval),
            nodes,
        };
        doc.write(&self.path)?;
        debug!(
            target: "idgen.state",
            path = %self.path.display(),
            nodes = doc.nodes.len(),
            "stored node registry"
        );
        self.nodes = doc.nodes;
        Ok(())
    }
}

impl State for FileState {
    fn load(&mut self) -> Result<(), IdError> {
        if !self.path.exists() {
            info!(
                target: "idgen.state",
                path = %self.path.display(),
                "node registry does not exist yet, starting empty"
            );
            self.nodes.clear();
            return Ok(());
        }
        let doc = StateDocument::read(&self.path)?;
        if self.interval_override.is_none() {
            if let Some(interval) = doc.synch_interval {
                self.synch_interval = interval;
            }
        }
        self.nodes = doc.nodes;
        Ok(())
    }

    fn nodes(&self) -> &[NodeSnapshot] {
        &self.nodes
    }

    fn store(&mut self, nodes: &[NodeSnapshot]) -> Result<(), IdError> {
        ensure_distinct(nodes)?;
        self.write(nodes.to_vec())
    }

    fn store_at(&mut self, nodes: &[NodeSnapshot], timestamp: u64) -> Result<(), IdError> {
        ensure_distinct(nodes)?;
        let pinned = nodes
            .iter()
            .map(|n| NodeSnapshot {
                last_timestamp: timestamp,
                ..*n
            })
            .collect();
        self.write(pinned)
    }

    fn synch_interval(&self) -> u64 {
        self.synch_interval
    }
}
