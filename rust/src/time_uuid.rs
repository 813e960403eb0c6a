//! Version-1 (time-based) UUID generation on top of the node registry and
//! the clock-sequence allocator.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::warn;
use uuid::Uuid;

use crate::allocator::{ClockSequenceAllocator, UuidTimestamp};
use crate::clock::{Clock, SystemClock, SystemTimeSource, TimeSource};
use crate::config::StateConfig;
use crate::error::IdError;
use crate::node::{Node, NodeId};
use crate::registry::NodeRegistry;
use crate::state::ReadOnlyState;

const VERSION_TIME_BASED: u16 = 0x1000;
const VARIANT_RFC4122: u8 = 0x80;

/// Generator of version-1 UUIDs.
///
/// Identifiers are issued from the registry's primary node. The registry is
/// flushed opportunistically from the calling thread once its interval is
/// due; a caller that finds another thread already flushing does not wait.
pub struct TimeUuidGen {
    node: Arc<Node>,
    allocator: ClockSequenceAllocator,
    registry: Mutex<NodeRegistry>,
    next_flush: AtomicI64,
    time: Arc<dyn TimeSource>,
}

impl TimeUuidGen {
    pub fn new(registry: NodeRegistry, clock: Arc<dyn Clock>) -> Self {
        Self::with_sources(registry, clock, Arc::new(SystemTimeSource))
    }

    /// Use `time` to decide when the registry is due for a flush.
    pub fn with_sources(
        registry: NodeRegistry,
        clock: Arc<dyn Clock>,
        time: Arc<dyn TimeSource>,
    ) -> Self {
        Self {
            node: Arc::clone(registry.node()),
            allocator: ClockSequenceAllocator::new(clock),
            next_flush: AtomicI64::new(registry.next_flush_at()),
            registry: Mutex::new(registry),
            time,
        }
    }

    /// System clock plus an in-memory read-only registry with a derived node.
    pub fn with_defaults() -> Result<Self, IdError> {
        let registry = NodeRegistry::open(Box::new(ReadOnlyState::new()))?;
        Ok(Self::new(registry, Arc::new(SystemClock::new())))
    }

    /// System clock plus the registry named by `config`.
    pub fn from_config(config: &StateConfig) -> Result<Self, IdError> {
        let registry = NodeRegistry::open(config.open_state())?;
        Ok(Self::new(registry, Arc::new(SystemClock::new())))
    }

    pub fn node_id(&self) -> NodeId {
        self.node.id()
    }

    /// Generate the next UUID.
    pub fn next_uuid(&self) -> Result<Uuid, IdError> {
        let ts = self.allocator.next_timestamp(&self.node)?;
        self.maybe_flush();
        Ok(build_time_uuid(ts, self.node.id()))
    }

    /// Generate `n` UUIDs, stopping at the first failure.
    pub fn next_n(&self, n: usize) -> Result<Vec<Uuid>, IdError> {
        (0..n).map(|_| self.next_uuid()).collect()
    }

    /// Flush the registry and release it.
    pub fn close(self) -> Result<(), IdError> {
        self.registry
            .into_inner()
            .unwrap_or_else(|e| e.into_inner())
            .close()
    }

    fn maybe_flush(&self) {
        let now = self.time.now_millis();
        if now < self.next_flush.load(Ordering::Relaxed) {
            return;
        }
        let Ok(mut registry) = self.registry.try_lock() else {
            return;
        };
        if let Err(err) = registry.flush_if_due(now) {
            warn!(target: "idgen.time_uuid", error = %err, "periodic node flush failed");
        }
        self.next_flush
            .store(registry.next_flush_at(), Ordering::Relaxed);
    }
}

/// Lay out an RFC 4122 version-1 UUID.
pub fn build_time_uuid(ts: UuidTimestamp, node: NodeId) -> Uuid {
    let time_low = ts.ticks as u32;
    let time_mid = (ts.ticks >> 32) as u16;
    let time_hi = ((ts.ticks >> 48) as u16 & 0x0FFF) | VERSION_TIME_BASED;
    let seq = ts.clock_sequence;
    let n = node.as_bytes();
    let tail = [
        ((seq >> 8) as u8 & 0x3F) | VARIANT_RFC4122,
        seq as u8,
        n[0],
        n[1],
        n[2],
        n[3],
        n[4],
        n[5],
    ];
    Uuid::from_fields(time_low, time_mid, time_hi, &tail)
}

fn is_time_based(uuid: &Uuid) -> bool {
    uuid.get_version_num() == 1
}

/// 60-bit UUID time of a version-1 UUID.
pub fn uuid_time_of(uuid: &Uuid) -> Option<u64> {
    if !is_time_based(uuid) {
        return None;
    }
    let (low, mid, hi, _) = uuid.as_fields();
    Some((u64::from(hi & 0x0FFF) << 48) | (u64::from(mid) << 32) | u64::from(low))
}

/// 14-bit clock sequence of a version-1 UUID.
pub fn clock_sequence_of(uuid: &Uuid) -> Option<u16> {
    if !is_time_based(uuid) {
        return None;
    }
    let tail = uuid.as_fields().3;
    Some((u16::from(tail[0] & 0x3F) << 8) | u16::from(tail[1]))
}

/// Node identifier of a version-1 UUID.
pub fn node_of(uuid: &Uuid) -> Option<NodeId> {
    if !is_time_based(uuid) {
        return None;
    }
    let tail = uuid.as_fields().3;
    let mut bytes = [0u8; 6];
    bytes.copy_from_slice(&tail[2..]);
    Some(NodeId::new(bytes))
}
