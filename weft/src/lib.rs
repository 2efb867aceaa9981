//! Weft
//!
//! A structured peer-to-peer platform for IoT message routing. The overlay
//! hub terminates many concurrent client and peer connections, authenticates
//! them with an SRP-6a challenge/response handshake, keeps a Chord-style
//! routing table stable in the background and routes fixed-format messages
//! under a netmask-gated policy, with topic-based publish/subscribe for
//! client-to-client multicast.
//!
//! This crate re-exports the public API; the `weft-hub` binary is the server
//! process.

pub use weft_core::{config, hosts, message, node, pool, serializer, topics, wire};
pub use weft_overlay::{
    auth, connection, events, hub, identity, pki, protocol, pump, settings, srp, stabilizer,
    watch,
};

pub use weft_core::error::WeftError;
pub use weft_overlay::error::HubError;
pub use weft_overlay::hub::{HubOptions, OverlayHub};
pub use weft_overlay::settings::Settings;
