//! Per-peer connection state.
//!
//! The hub owns every `Connection`; pumps only move bytes. A connection is
//! created with an ephemeral identifier and re-keyed when registration
//! succeeds. The outbound queue holds pool handles until the pump channel is
//! attached (proxy bring-up) or the frame is encoded and handed off.

use crate::events::ConnCmd;
use bytes::Bytes;
use flume::Sender;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use weft_core::pool::MessageRef;
use weft_core::topics::TopicSet;
use weft_core::wire::FrameDecoder;

/// First ephemeral identifier; everything at or above is non-routable.
pub const EPHEMERAL_BASE: u64 = 1 << 32;

/// Is `id` an ephemeral (pre-registration) identifier?
#[must_use]
pub const fn is_ephemeral(id: u64) -> bool {
    id >= EPHEMERAL_BASE
}

/// Shared allocator for ephemeral identifiers.
///
/// Atomic so the listener and proxy tasks can draw identifiers without going
/// through the hub.
#[derive(Debug, Clone)]
pub struct EphemeralIds(Arc<AtomicU64>);

impl Default for EphemeralIds {
    fn default() -> Self {
        Self::new()
    }
}

impl EphemeralIds {
    #[must_use]
    pub fn new() -> Self {
        Self(Arc::new(AtomicU64::new(EPHEMERAL_BASE)))
    }

    #[must_use]
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// Connection flag bits.
pub mod flags {
    /// Registration completed
    pub const ACTIVE: u16 = 1 << 0;
    /// Never dropped under pressure (controller, worker)
    pub const PRIORITY: u16 = 1 << 1;
    /// Overlay peer
    pub const OVERLAY: u16 = 1 << 2;
    /// Outbound handshake underway
    pub const PROXY: u16 = 1 << 3;
    /// Holds at least one topic subscription
    pub const MULTICAST: u16 = 1 << 4;
    /// Scheduled for close
    pub const INVALID: u16 = 1 << 5;
}

/// Hub-side state of one peer, client or worker connection.
pub struct Connection {
    pub(crate) id: u64,
    /// The identifier the pump stamps on events; fixed at accept time even
    /// after registration re-keys the connection.
    pub(crate) pump_id: u64,
    pub(crate) tx: Option<Sender<ConnCmd>>,
    pub(crate) decoder: FrameDecoder,
    pub(crate) out: VecDeque<MessageRef>,
    /// Outbound queue cap; 0 means unlimited.
    pub(crate) limit: usize,
    pub(crate) topics: TopicSet,
    pub(crate) group: u8,
    pub(crate) last_active: Instant,
    pub(crate) flags: u16,
    pub(crate) drops: u32,
}

impl Connection {
    /// An accepted connection with its pump attached.
    #[must_use]
    pub fn new(id: u64, tx: Sender<ConnCmd>, limit: usize) -> Self {
        Self {
            id,
            pump_id: id,
            tx: Some(tx),
            decoder: FrameDecoder::new(),
            out: VecDeque::new(),
            limit,
            topics: TopicSet::new(),
            group: 0,
            last_active: Instant::now(),
            flags: 0,
            drops: 0,
        }
    }

    /// An outgoing proxy connection still waiting for its socket.
    #[must_use]
    pub fn pending(id: u64) -> Self {
        let mut conn = Self::new(id, flume::bounded(0).0, 0);
        conn.tx = None;
        conn.flags = flags::PROXY;
        conn
    }

    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub const fn group(&self) -> u8 {
        self.group
    }

    pub fn set_group(&mut self, group: u8) {
        self.group = group;
    }

    #[must_use]
    pub const fn test_flags(&self, mask: u16) -> bool {
        self.flags & mask != 0
    }

    pub fn set_flags(&mut self, mask: u16) {
        self.flags |= mask;
    }

    pub fn clear_flags(&mut self, mask: u16) {
        self.flags &= !mask;
    }

    /// Record successful I/O.
    pub fn touch(&mut self) {
        self.last_active = Instant::now();
    }

    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_active.elapsed()
    }

    /// Has the activity deadline been missed?
    #[must_use]
    pub fn timed_out(&self, deadline: Duration) -> bool {
        self.idle_for() > deadline
    }

    /// Is there room for one more outbound frame?
    #[must_use]
    pub fn has_capacity(&self) -> bool {
        self.limit == 0 || self.out.len() < self.limit
    }

    /// Count another malformed frame; `true` once the threshold is crossed.
    pub fn count_drop(&mut self, threshold: u32) -> bool {
        self.drops += 1;
        self.drops >= threshold
    }

    /// Hand a serialized frame to the pump, if one is attached.
    pub(crate) fn send(&self, data: Bytes) -> bool {
        match &self.tx {
            Some(tx) => tx.send(ConnCmd::Send(data)).is_ok(),
            None => false,
        }
    }

    /// Ask the pump to close the socket.
    pub(crate) fn close(&self) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(ConnCmd::Close);
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("group", &self.group)
            .field("flags", &self.flags)
            .field("queued", &self.out.len())
            .field("limit", &self.limit)
            .finish_non_exhaustive()
    }
}
