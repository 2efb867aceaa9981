//! Weft Core
//!
//! Runtime-agnostic building blocks for the overlay hub:
//! - Big-endian serialization primitives (`serializer`)
//! - Fixed-format wire protocol + frame decoder (`wire`)
//! - Pooled frames with split routing/wire views (`message`, `pool`)
//! - Chord routing table (`node`)
//! - Topic table for multicast (`topics`)
//! - Hosts directory contract (`hosts`)
//! - Error types (`error`)

#![deny(unsafe_code)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod hosts;
pub mod message;
pub mod node;
pub mod pool;
pub mod serializer;
pub mod topics;
pub mod wire;

// A small prelude for the downstream crates; kept minimal to avoid API
// lock-in.
pub mod prelude {
    pub use crate::error::{Result, WeftError};
    pub use crate::hosts::{HostAddress, HostType, Hosts, HostsFile};
    pub use crate::message::{Message, FLAG_INVALID, FLAG_PRIORITY, FLAG_TRAP};
    pub use crate::node::{Node, CONTROLLER, KEY_BITS, MAX_ID, TABLE_SIZE};
    pub use crate::pool::{MessagePool, MessageRef};
    pub use crate::topics::{TopicSet, Topics, TOPIC_COUNT};
    pub use crate::wire::{Command, FrameDecoder, Header, Status, HEADER_SIZE, MTU};
}
