//! Weft Overlay
//!
//! The overlay hub proper, built on the `weft-core` primitives:
//! - Hub dispatcher and routing policy (`hub`)
//! - Per-peer connection state (`connection`) and socket pumps (`pump`)
//! - SRP-6a authentication (`srp`, `auth`) and RSA envelopes (`pki`)
//! - Background stabilization worker (`stabilizer`) and its wire helpers
//!   (`protocol`)
//! - Settings, key material and hot reload (`settings`, `identity`, `watch`)

#![deny(unsafe_code)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]

pub mod auth;
pub mod connection;
pub mod error;
pub mod events;
pub mod hub;
pub mod identity;
pub mod pki;
pub mod protocol;
pub mod pump;
pub mod settings;
pub mod srp;
pub mod stabilizer;
pub mod watch;

pub mod prelude {
    pub use crate::auth::{Authenticator, CredentialStore, Credentials, StaticCredentials};
    pub use crate::connection::{is_ephemeral, Connection, EphemeralIds, EPHEMERAL_BASE};
    pub use crate::error::{HubError, Result};
    pub use crate::events::{ConnCmd, FileEvent, HubEvent, WatchSlot};
    pub use crate::hub::{HubOptions, OverlayHub, PurgeMode};
    pub use crate::identity::Identity;
    pub use crate::pki::Pki;
    pub use crate::settings::Settings;
    pub use crate::stabilizer::{Stabilizer, StabilizerConfig};
}
