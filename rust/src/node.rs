//! Node identity and the per-node clock state that time-based UUIDs depend on.

use std::env;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::clock::{Clock, SystemClock, millis_to_uuid_time};
use crate::encoding::{NODE_ID_LEN, decode_mac_address, encode_mac_address};
use crate::error::IdError;

/// Largest clock sequence value; sequences are 14 bits wide.
pub const CLOCK_SEQUENCE_MAX: u16 = 0x3FFF;

/// OR-mask marking a node identifier as multicast, i.e. not a real NIC address.
const MULTICAST_BIT: u8 = 0x80;

const UNKNOWN_HOST: &str = "Host Unknown";

/// Six-byte node identifier, written as `XX-XX-XX-XX-XX-XX`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeId([u8; NODE_ID_LEN]);

impl NodeId {
    pub const fn new(bytes: [u8; NODE_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    pub fn is_multicast(&self) -> bool {
        self.0[0] & MULTICAST_BIT != 0
    }

    /// Derive a node identifier from host information when no configured
    /// node exists.
    ///
    /// Current UUID time, host name, a random salt, the process id and every
    /// environment variable are hashed; the first six digest bytes become
    /// the identifier and the multicast bit is set so it can never clash
    /// with a hardware address. Uniqueness across hosts is probabilistic.
    pub fn random() -> Self {
        let time = SystemClock::new()
            .uuid_time()
            .unwrap_or_else(|_| millis_to_uuid_time(Utc::now().timestamp_millis()));
        let host = env::var("HOSTNAME")
            .or_else(|_| env::var("COMPUTERNAME"))
            .unwrap_or_else(|_| UNKNOWN_HOST.to_string());
        let salt: u64 = rand::random();

        let mut hasher = Sha256::new();
        hasher.update(time.to_string());
        hasher.update(host);
        hasher.update(salt.to_string());
        hasher.update(std::process::id().to_string());
        for (key, value) in env::vars_os() {
            hasher.update(key.as_encoded_bytes());
            hasher.update(value.as_encoded_bytes());
        }
        let digest = hasher.finalize();

        let mut raw = [0u8; NODE_ID_LEN];
        raw.copy_from_slice(&digest[..NODE_ID_LEN]);
        raw[0] |= MULTICAST_BIT;
        Self(raw)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&encode_mac_address(&self.0))
    }
}

impl FromStr for NodeId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_mac_address(s).map(Self)
    }
}

impl TryFrom<String> for NodeId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<NodeId> for String {
    fn from(id: NodeId) -> Self {
        id.to_string()
    }
}

impl From<[u8; NODE_ID_LEN]> for NodeId {
    fn from(bytes: [u8; NODE_ID_LEN]) -> Self {
        Self(bytes)
    }
}

/// Random 14-bit clock sequence for a node seen for the first time.
pub fn new_clock_sequence() -> u16 {
    rand::random::<u16>() & CLOCK_SEQUENCE_MAX
}

/// Mutable clock state of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeClock {
    pub last_timestamp: u64,
    pub clock_sequence: u16,
}

impl NodeClock {
    /// Advance the sequence, wrapping from `0x3FFF` back to zero.
    pub fn bump_sequence(&mut self) {
        self.clock_sequence = (self.clock_sequence + 1) & CLOCK_SEQUENCE_MAX;
    }
}

/// Point-in-time copy of a node, as handed to a registry for persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeSnapshot {
    pub id: NodeId,
    pub last_timestamp: u64,
    pub clock_sequence: u16,
}

/// A node identity plus its last used timestamp and clock sequence.
///
/// Nodes compare and hash by identity only. The clock state sits behind the
/// node's own lock so different nodes never contend with each other.
#[derive(Debug)]
pub struct Node {
    id: NodeId,
    clock: Mutex<NodeClock>,
}

impl Node {
    /// A node with no history: random clock sequence, zero timestamp.
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            clock: Mutex::new(NodeClock {
                last_timestamp: 0,
                clock_sequence: new_clock_sequence(),
            }),
        }
    }

    /// A node restored from persisted state.
    pub fn restore(id: NodeId, last_timestamp: u64, clock_sequence: u16) -> Self {
        Self {
            id,
            clock: Mutex::new(NodeClock {
                last_timestamp,
                clock_sequence: clock_sequence & CLOCK_SEQUENCE_MAX,
            }),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn clock_sequence(&self) -> u16 {
        self.lock().clock_sequence
    }

    pub fn last_timestamp(&self) -> u64 {
        self.lock().last_timestamp
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        let clock = *self.lock();
        NodeSnapshot {
            id: self.id,
            last_timestamp: clock.last_timestamp,
            clock_sequence: clock.clock_sequence,
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, NodeClock> {
        self.clock.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl From<NodeSnapshot> for Node {
    fn from(snapshot: NodeSnapshot) -> Self {
        Self::restore(snapshot.id, snapshot.last_timestamp, snapshot.clock_sequence)
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}
