//! Clock-sequence allocation for time-based UUIDs.
//!
//! Every timestamp handed out for a node is paired with the node's clock
//! sequence. Whenever the clock returns a value that does not strictly
//! exceed the node's last timestamp (same tick, or the wall clock moved
//! backwards) the sequence is advanced first, so a `(timestamp, sequence)`
//! pair is never issued twice for one node.

use std::sync::Arc;

use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::error::IdError;
use crate::node::Node;

/// A timestamp together with the clock sequence it was issued under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UuidTimestamp {
    pub ticks: u64,
    pub clock_sequence: u16,
}

/// Issues per-node timestamps from an injected [`Clock`].
#[derive(Clone)]
pub struct ClockSequenceAllocator {
    clock: Arc<dyn Clock>,
}

impl ClockSequenceAllocator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Next timestamp for `node`.
    ///
    /// The clock is read while the node is locked, so concurrent callers on
    /// one node are serialized. A clock failure leaves the node untouched.
    pub fn next_timestamp(&self, node: &Node) -> Result<UuidTimestamp, IdError> {
        let mut state = node.lock();
        let ticks = self.clock.uuid_time()?;
        if ticks <= state.last_timestamp {
            state.bump_sequence();
            debug!(
                target: "idgen.allocator",
                node = %node.id(),
                ticks,
                last = state.last_timestamp,
                clock_sequence = state.clock_sequence,
                "clock did not advance, bumped clock sequence"
            );
        }
        state.last_timestamp = ticks;
        Ok(UuidTimestamp {
            ticks,
            clock_sequence: state.clock_sequence,
        })
    }
}

impl Default for ClockSequenceAllocator {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::node::{CLOCK_SEQUENCE_MAX, NodeId};
    use std::collections::HashSet;
    use std::thread;

    fn node(seq: u16) -> Node {
        Node::restore(NodeId::new([0x80, 1, 2, 3, 4, 5]), 0, seq)
    }

    fn manual(ticks: u64) -> (Arc<ManualClock>, ClockSequenceAllocator) {
        let clock = Arc::new(ManualClock::new(0));
        clock.set_uuid_time(ticks);
        let allocator = ClockSequenceAllocator::new(clock.clone());
        (clock, allocator)
    }

    #[test]
    fn test_advancing_clock_keeps_sequence() {
        let (clock, allocator) = manual(100);
        let n = node(7);
        assert_eq!(
            allocator.next_timestamp(&n).unwrap(),
            UuidTimestamp {
                ticks: 100,
                clock_sequence: 7
            }
        );
        clock.set_uuid_time(101);
        assert_eq!(allocator.next_timestamp(&n).unwrap().clock_sequence, 7);
        assert_eq!(n.last_timestamp(), 101);
    }

    #[test]
    fn test_equal_tick_bumps_sequence() {
        let (_clock, allocator) = manual(100);
        let n = node(7);
        let a = allocator.next_timestamp(&n).unwrap();
        let b = allocator.next_timestamp(&n).unwrap();
        assert_eq!(a.ticks, b.ticks);
        assert_eq!(b.clock_sequence, 8);
        assert_ne!(a, b);
    }

    #[test]
    fn test_backward_clock_bumps_sequence() {
        let (clock, allocator) = manual(500);
        let n = node(3);
        allocator.next_timestamp(&n).unwrap();
        clock.set_uuid_time(200);
        let back = allocator.next_timestamp(&n).unwrap();
        assert_eq!(back.clock_sequence, 4);
        assert_eq!(n.last_timestamp(), 200);
    }

    #[test]
    fn test_sequence_wraps_at_14_bits() {
        let (_clock, allocator) = manual(1);
        let n = Node::restore(NodeId::new([0x80, 0, 0, 0, 0, 1]), 1, CLOCK_SEQUENCE_MAX);
        assert_eq!(allocator.next_timestamp(&n).unwrap().clock_sequence, 0);
    }

    #[test]
    fn test_restored_node_never_repeats_after_restart() {
        let (_clock, allocator) = manual(1_000);
        let n = Node::restore(NodeId::new([0x80, 0, 0, 0, 0, 2]), 5_000, 42);
        let first = allocator.next_timestamp(&n).unwrap();
        assert_eq!(first.clock_sequence, 43);
    }

    #[test]
    fn test_clock_failure_leaves_node_untouched() {
        let (clock, allocator) = manual(100);
        let n = node(9);
        allocator.next_timestamp(&n).unwrap();
        let before = n.snapshot();
        clock.set_overclocked(true);
        assert!(matches!(
            allocator.next_timestamp(&n),
            Err(IdError::OverClocked)
        ));
        assert_eq!(n.snapshot(), before);
    }

    #[test]
    fn test_no_duplicate_pairs_under_erratic_clock() {
        let (clock, allocator) = manual(0);
        let n = node(0);
        let pattern = [10u64, 10, 9, 11, 11, 11, 5, 12, 12, 3, 13];
        let mut seen = HashSet::new();
        for _ in 0..200 {
            for t in pattern {
                clock.set_uuid_time(t);
                assert!(seen.insert(allocator.next_timestamp(&n).unwrap()));
            }
        }
    }

    #[test]
    fn test_concurrent_callers_on_one_node() {
        let (_clock, allocator) = manual(77);
        let n = Arc::new(node(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let allocator = allocator.clone();
                let n = n.clone();
                thread::spawn(move || {
                    (0..500)
                        .map(|_| allocator.next_timestamp(&n).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut seen = HashSet::new();
        for h in handles {
            for ts in h.join().unwrap() {
                assert!(seen.insert(ts));
            }
        }
        assert_eq!(seen.len(), 2_000);
    }

    #[test]
    fn test_default_uses_system_clock() {
        let allocator = ClockSequenceAllocator::default();
        let n = node(1);
        let a = allocator.next_timestamp(&n).unwrap();
        let b = allocator.next_timestamp(&n).unwrap();
        assert_ne!(a, b);
    }
}
