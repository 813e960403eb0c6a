//! idgen: identifier generators that stay unique across restarts and clock
//! trouble.
//!
//! Two generator families are provided:
//!
//! - **Time-based UUIDs** (version 1). A [`NodeRegistry`] owns the node
//!   records loaded from a [`State`]; the [`ClockSequenceAllocator`] pairs
//!   each timestamp with the node's clock sequence and advances that
//!   sequence whenever the clock fails to move forward, so a
//!   `(time, node, clock sequence)` triple is never reused.
//! - **Time-based alphanumeric ids**. [`TimeBasedAlphanumericGen`] emits
//!   fixed-length, lexically sortable base-36 strings built from the
//!   milliseconds since an offset plus a per-millisecond postfix. The time
//!   can be recovered from an id with [`millis_from_id`].
//!
//! # Format
//!
//! ```text
//! ALNUM ::= TIME13 POSTFIX{P}        (lowercase base-36, P in 0..=13)
//! NODE  ::= XX "-" XX "-" XX "-" XX "-" XX "-" XX
//! ```
//!
//! # Example
//!
//! ```
//! use idgen::TimeBasedAlphanumericGen;
//!
//! let id_gen = TimeBasedAlphanumericGen::new(3).expect("valid postfix width");
//! let id = id_gen.next_id().expect("fresh millisecond");
//! assert_eq!(id.len(), 16);
//! ```

mod allocator;
mod alphanumeric;
mod async_api;
mod clock;
mod config;
mod encoding;
mod error;
mod node;
mod registry;
mod state;
mod time_uuid;

pub use allocator::{ClockSequenceAllocator, UuidTimestamp};
pub use alphanumeric::{
    DEFAULT_POSTFIX_DIGITS, ParsedAlphanumericId, TimeBasedAlphanumericGen, millis_from_id,
    parse_alphanumeric_id, validate_alphanumeric_id,
};
pub use async_api::{async_alphanumeric_stream, async_next_alphanumeric, async_next_time_uuid};
pub use clock::{
    Clock, GREGORIAN_OFFSET, ManualClock, SystemClock, SystemTimeSource, TICKS_PER_MILLI,
    TimeSource, datetime_to_uuid_time, millis_to_uuid_time, uuid_time_to_datetime,
};
pub use config::{STATE_FILE_ENV, STATE_MODE_ENV, SYNCH_INTERVAL_ENV, StateConfig, StateMode};
pub use encoding::{
    MAX_TIME_DIGITS, NODE_ID_LEN, base36_capacity, base36_len, decode_base36, decode_base36_wide,
    decode_mac_address, encode_base36, encode_base36_wide, encode_mac_address,
};
pub use error::IdError;
pub use node::{CLOCK_SEQUENCE_MAX, Node, NodeClock, NodeId, NodeSnapshot, new_clock_sequence};
pub use registry::NodeRegistry;
pub use state::{
    DEFAULT_SYNCH_INTERVAL, FileState, READ_ONLY_SYNCH_INTERVAL, ReadOnlyState, ResourceState,
    State, StateDocument, ensure_distinct,
};
pub use time_uuid::{TimeUuidGen, build_time_uuid, clock_sequence_of, node_of, uuid_time_of};
