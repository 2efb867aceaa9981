//! Challenge/response authentication.
//!
//! One `Authenticator` per unauthenticated connection, keyed by its ephemeral
//! identifier and dropped with it. Ordering is strict: identify must precede
//! authenticate, authenticate must precede authorization; anything out of
//! order is rejected without touching state.
//!
//! A failed identify does not reveal itself: the host answers with a
//! deterministic fake salt and nonce derived from the identity, so repeated
//! probes cannot enumerate accounts through salt variance. The entry then
//! accepts nothing.

use crate::srp::{self, SrpHost, HASH_SIZE};
use hashbrown::HashMap;
use sha2::{Digest, Sha512};
use tracing::debug;

/// What the credential store hands back for a known identity.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub salt: Vec<u8>,
    pub verifier: Vec<u8>,
    pub group: u8,
}

/// Lookup interface the hub consumes. Must be side-effect-free on failure.
pub trait CredentialStore {
    fn get(&self, identity: u64) -> Option<Credentials>;
}

/// In-memory credential map.
#[derive(Debug, Default)]
pub struct StaticCredentials {
    users: HashMap<u64, Credentials>,
}

impl StaticCredentials {
    #[must_use]
    pub fn new() -> Self {
        Self {
            users: HashMap::new(),
        }
    }

    /// Provision an identity from a plaintext password.
    pub fn add_user(&mut self, identity: u64, password: &[u8], rounds: u32, group: u8) {
        let (salt, verifier) = srp::generate_verifier(identity, password, rounds);
        self.users.insert(
            identity,
            Credentials {
                salt,
                verifier,
                group,
            },
        );
    }

    /// Insert pre-computed credentials (as an external store would return).
    pub fn insert(&mut self, identity: u64, credentials: Credentials) {
        self.users.insert(identity, credentials);
    }

    /// Load credentials from a text table: `<identity> <salt> <verifier>
    /// [group]`, salt and verifier in hex, `#` comments allowed.
    pub fn load(path: impl AsRef<std::path::Path>) -> crate::error::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut store = Self::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            let parsed = (|| {
                let identity: u64 = fields.next()?.parse().ok()?;
                let salt = hex::decode(fields.next()?).ok()?;
                let verifier = hex::decode(fields.next()?).ok()?;
                let group: u8 = match fields.next() {
                    Some(raw) => raw.parse().ok()?,
                    None => 0,
                };
                Some((
                    identity,
                    Credentials {
                        salt,
                        verifier,
                        group,
                    },
                ))
            })();
            let Some((identity, credentials)) = parsed else {
                return Err(crate::error::HubError::config(format!(
                    "malformed credential entry at line {}",
                    lineno + 1
                )));
            };
            store.insert(identity, credentials);
        }
        Ok(store)
    }
}

impl CredentialStore for StaticCredentials {
    fn get(&self, identity: u64) -> Option<Credentials> {
        self.users.get(&identity).cloned()
    }
}

enum State {
    /// Unknown identity; answers were fabricated and nothing can succeed.
    Deceptive,
    /// Salt and verifier loaded, B sent; waiting for the user's proof.
    Identified(Box<SrpHost>),
    /// Proof verified; the connection may authorize a registration.
    Authenticated { key: Vec<u8> },
}

/// Host-side handshake state for one connection.
pub struct Authenticator {
    identity: u64,
    group: u8,
    state: State,
}

impl Authenticator {
    /// Step 1 (identify): look the identity up and derive the challenge.
    ///
    /// Always yields `(salt, host_nonce)` to send back; on a miss both are
    /// fakes and the authenticator is unauthenticable.
    pub fn identify(
        store: &dyn CredentialStore,
        secret: &[u8],
        identity: u64,
        user_nonce: &[u8],
    ) -> (Self, Vec<u8>, Vec<u8>) {
        let loaded = store.get(identity).and_then(|credentials| {
            SrpHost::identify(identity, user_nonce, &credentials.salt, &credentials.verifier)
                .map(|host| (host, credentials.group))
        });

        match loaded {
            Some((host, group)) => {
                let salt = host.salt().to_vec();
                let nonce = host.host_nonce();
                (
                    Self {
                        identity,
                        group,
                        state: State::Identified(Box::new(host)),
                    },
                    salt,
                    nonce,
                )
            }
            None => {
                debug!(identity, "identification failed, fabricating challenge");
                (
                    Self {
                        identity,
                        group: 0,
                        state: State::Deceptive,
                    },
                    srp::fake_salt(secret, identity),
                    srp::fake_nonce(secret, identity),
                )
            }
        }
    }

    /// Step 3 (authenticate): verify the user's proof M.
    ///
    /// On success returns the host proof H(A, M, K); on failure the caller
    /// must discard this authenticator so the connection cannot retry.
    pub fn authenticate(&mut self, proof: &[u8]) -> Option<Vec<u8>> {
        match &self.state {
            State::Identified(host) if host.verify_user_proof(proof) => {
                let response = host.host_proof().to_vec();
                let key = host.session_key().to_vec();
                self.state = State::Authenticated { key };
                Some(response)
            }
            _ => None,
        }
    }

    /// Has the user's proof been verified?
    #[must_use]
    pub const fn is_authenticated(&self) -> bool {
        matches!(self.state, State::Authenticated { .. })
    }

    /// The proven identity (valid once authenticated).
    #[must_use]
    pub const fn identity(&self) -> u64 {
        self.identity
    }

    /// Group tag loaded with the credentials.
    #[must_use]
    pub const fn group(&self) -> u8 {
        self.group
    }

    /// The SRP session key, available once authenticated.
    #[must_use]
    pub fn session_key(&self) -> Option<&[u8]> {
        match &self.state {
            State::Authenticated { key } => Some(key),
            _ => None,
        }
    }
}

/// Stateless challenge digest bound to a connection / hub pair.
///
/// Both ends can recompute it, so the hub does not have to remember the
/// challenges it handed to ephemeral connections.
#[must_use]
pub fn challenge_digest(salt: u64, id: u64) -> [u8; HASH_SIZE] {
    let mut hasher = Sha512::new();
    hasher.update(salt.to_be_bytes());
    hasher.update(id.to_be_bytes());
    hasher.finalize().into()
}
