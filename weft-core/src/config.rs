//! Shared tuning constants.
//!
//! Both pools are fixed at startup and bound the hub's memory footprint;
//! exhaustion is handled by the purge policy rather than reallocation.

/// Default capacity of the message pool.
pub const DEFAULT_MESSAGE_POOL_SIZE: usize = 1024;

/// Default capacity of the connection pool.
pub const DEFAULT_CONNECTION_POOL_SIZE: usize = 1024;

/// Default outbound queue cap for client connections.
///
/// Controller, overlay and worker connections run uncapped (0).
pub const DEFAULT_CLIENT_QUEUE_LIMIT: usize = 64;

/// Slots in the recently-seen-peers ring served by `basic/bootstrap`.
///
/// Must be a power of two.
pub const NODE_CACHE_SIZE: usize = 32;

/// Default stabilization period (ms).
pub const DEFAULT_PERIOD_MS: u64 = 5000;

/// Default blocking I/O deadline (ms).
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Default wait after a stabilization error (ms).
pub const DEFAULT_PAUSE_MS: u64 = 10000;

/// Malformed frames tolerated on a connection before it is closed.
pub const DROP_THRESHOLD: u32 = 8;

/// Forwarding hops after which a message is considered looping.
pub const HOP_LIMIT: u8 = 32;
