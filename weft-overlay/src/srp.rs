//! SRP-6a key exchange (2048-bit MODP group, SHA-512).
//!
//! Host and user halves of the handshake:
//!
//! ```text
//! User -> Host:  I, A = g^a
//! Host:          B = kv + g^b, u = H(A, B), S = (A * v^u)^b, K = H(S)
//! Host -> User:  s, B
//! User:          x = H(s, H(I:p)), S = (B - k*g^x)^(a + u*x), K = H(S)
//! User -> Host:  M = H(H(N) xor H(g), H(I), s, A, B, K)
//! Host -> User:  H(A, M, K)
//! ```
//!
//! The fake salt/nonce generators hide failed identification: a probe for an
//! unknown identity always sees the same salt, so salt variance cannot be
//! used to enumerate accounts.
//!
//! @ref http://srp.stanford.edu/design.html

use num_bigint::BigUint;
use num_traits::Zero;
use rand::RngCore;
use sha2::{Digest, Sha512};

/// Digest size (SHA-512).
pub const HASH_SIZE: usize = 64;

/// Size of the public ephemeral values A and B.
pub const NONCE_SIZE: usize = 256;

/// Salt size handed to clients.
pub const SALT_SIZE: usize = 16;

// RFC 3526, 2048-bit MODP group (group 14), generator 2.
const GROUP_PRIME_HEX: &str = "\
FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74\
020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437\
4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05\
98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB\
9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718\
3995497CEA956AE515D2261898FA051015728E5A8AACAA68FFFFFFFFFFFFFFFF";
const GROUP_GENERATOR: u8 = 2;

/// Fixed group parameters shared by both roles.
struct Group {
    n: BigUint,
    g: BigUint,
    k: BigUint,
}

fn group() -> Group {
    let n = BigUint::parse_bytes(GROUP_PRIME_HEX.as_bytes(), 16)
        .unwrap_or_else(BigUint::zero);
    let g = BigUint::from(GROUP_GENERATOR);
    // k = H(N | PAD(g))
    let k = hash_to_int(&[&to_padded(&n, NONCE_SIZE), &to_padded(&g, NONCE_SIZE)]);
    Group { n, g, k }
}

fn hash_to_int(parts: &[&[u8]]) -> BigUint {
    let mut hasher = Sha512::new();
    for part in parts {
        hasher.update(part);
    }
    BigUint::from_bytes_be(&hasher.finalize())
}

fn hash_bytes(parts: &[&[u8]]) -> Vec<u8> {
    let mut hasher = Sha512::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().to_vec()
}

fn to_padded(value: &BigUint, size: usize) -> Vec<u8> {
    let raw = value.to_bytes_be();
    if raw.len() >= size {
        return raw;
    }
    let mut out = vec![0u8; size - raw.len()];
    out.extend_from_slice(&raw);
    out
}

/// x = H(s | H(I | ":" | p)), iterated `rounds` times.
fn private_key(identity: u64, password: &[u8], salt: &[u8], rounds: u32) -> BigUint {
    let inner = hash_bytes(&[&identity.to_be_bytes(), b":", password]);
    let mut x = hash_bytes(&[salt, &inner]);
    for _ in 1..rounds.max(1) {
        x = hash_bytes(&[&x]);
    }
    BigUint::from_bytes_be(&x)
}

/// M = H(H(N) xor H(g) | H(I) | s | A | B | K)
fn user_proof(
    grp: &Group,
    identity: u64,
    salt: &[u8],
    a_pub: &BigUint,
    b_pub: &BigUint,
    key: &[u8],
) -> Vec<u8> {
    let hn = hash_bytes(&[&grp.n.to_bytes_be()]);
    let hg = hash_bytes(&[&grp.g.to_bytes_be()]);
    let hx: Vec<u8> = hn.iter().zip(hg.iter()).map(|(a, b)| a ^ b).collect();
    let hi = hash_bytes(&[&identity.to_be_bytes()]);
    hash_bytes(&[
        &hx,
        &hi,
        salt,
        &to_padded(a_pub, NONCE_SIZE),
        &to_padded(b_pub, NONCE_SIZE),
        key,
    ])
}

/// Generate a random salt and the password verifier `v = g^x mod N`.
pub fn generate_verifier(identity: u64, password: &[u8], rounds: u32) -> (Vec<u8>, Vec<u8>) {
    let mut salt = vec![0u8; SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);
    let verifier = verifier_for_salt(identity, password, &salt, rounds);
    (salt, verifier)
}

/// The password verifier for a known salt.
pub fn verifier_for_salt(identity: u64, password: &[u8], salt: &[u8], rounds: u32) -> Vec<u8> {
    let grp = group();
    let x = private_key(identity, password, salt, rounds);
    grp.g.modpow(&x, &grp.n).to_bytes_be()
}

/// Deterministic fake salt for an unknown identity, keyed by a per-process
/// secret. Stable across probes; indistinguishable from a real salt.
pub fn fake_salt(secret: &[u8], identity: u64) -> Vec<u8> {
    let digest = hash_bytes(&[secret, b"salt", &identity.to_be_bytes()]);
    digest[..SALT_SIZE].to_vec()
}

/// Deterministic fake host nonce for an unknown identity.
pub fn fake_nonce(secret: &[u8], identity: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(NONCE_SIZE);
    let mut block = hash_bytes(&[secret, b"nonce", &identity.to_be_bytes()]);
    while out.len() < NONCE_SIZE {
        out.extend_from_slice(&block);
        block = hash_bytes(&[&block]);
    }
    out.truncate(NONCE_SIZE);
    out
}

/// Host side of one handshake.
pub struct SrpHost {
    identity: u64,
    salt: Vec<u8>,
    b_pub: BigUint,
    proof_m: Vec<u8>,
    proof_amk: Vec<u8>,
    key: Vec<u8>,
}

impl SrpHost {
    /// Step 1 at the host: load `(salt, verifier)` for `identity`, absorb the
    /// user's public ephemeral A and derive B, the premaster and both proofs.
    ///
    /// Fails when `A mod N == 0` (a poisoned nonce).
    pub fn identify(
        identity: u64,
        user_nonce: &[u8],
        salt: &[u8],
        verifier: &[u8],
    ) -> Option<Self> {
        let grp = group();
        let a_pub = BigUint::from_bytes_be(user_nonce);
        if (&a_pub % &grp.n).is_zero() {
            return None;
        }
        let v = BigUint::from_bytes_be(verifier);

        let mut b_raw = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut b_raw);
        let b_priv = BigUint::from_bytes_be(&b_raw);

        // B = kv + g^b
        let b_pub = (&grp.k * &v + grp.g.modpow(&b_priv, &grp.n)) % &grp.n;
        let u = hash_to_int(&[
            &to_padded(&a_pub, NONCE_SIZE),
            &to_padded(&b_pub, NONCE_SIZE),
        ]);
        if u.is_zero() {
            return None;
        }

        // S = (A * v^u)^b
        let premaster = (&a_pub * v.modpow(&u, &grp.n)).modpow(&b_priv, &grp.n);
        let key = hash_bytes(&[&premaster.to_bytes_be()]);
        let proof_m = user_proof(&grp, identity, salt, &a_pub, &b_pub, &key);
        let proof_amk = hash_bytes(&[&to_padded(&a_pub, NONCE_SIZE), &proof_m, &key]);

        Some(Self {
            identity,
            salt: salt.to_vec(),
            b_pub,
            proof_m,
            proof_amk,
            key,
        })
    }

    #[must_use]
    pub const fn identity(&self) -> u64 {
        self.identity
    }

    #[must_use]
    pub fn salt(&self) -> &[u8] {
        &self.salt
    }

    /// The host's public ephemeral B, padded to `NONCE_SIZE`.
    #[must_use]
    pub fn host_nonce(&self) -> Vec<u8> {
        to_padded(&self.b_pub, NONCE_SIZE)
    }

    /// Step 3 at the host: check the user's proof M.
    #[must_use]
    pub fn verify_user_proof(&self, proof: &[u8]) -> bool {
        !proof.is_empty() && constant_time_eq(&self.proof_m, proof)
    }

    /// The host proof H(A, M, K) returned after a successful step 3.
    #[must_use]
    pub fn host_proof(&self) -> &[u8] {
        &self.proof_amk
    }

    /// The shared session key K = H(S).
    #[must_use]
    pub fn session_key(&self) -> &[u8] {
        &self.key
    }
}

/// User side of one handshake (the client toolkit and the tests).
pub struct SrpUser {
    identity: u64,
    password: Vec<u8>,
    rounds: u32,
    a_priv: BigUint,
    a_pub: BigUint,
    proof_m: Vec<u8>,
    proof_amk: Vec<u8>,
    key: Vec<u8>,
}

impl SrpUser {
    /// Prepare step 1 at the user: generate `a` and `A = g^a`.
    #[must_use]
    pub fn new(identity: u64, password: &[u8], rounds: u32) -> Self {
        let grp = group();
        let mut a_raw = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut a_raw);
        let a_priv = BigUint::from_bytes_be(&a_raw);
        let a_pub = grp.g.modpow(&a_priv, &grp.n);
        Self {
            identity,
            password: password.to_vec(),
            rounds,
            a_priv,
            a_pub,
            proof_m: Vec::new(),
            proof_amk: Vec::new(),
            key: Vec::new(),
        }
    }

    /// The user's public ephemeral A, padded to `NONCE_SIZE`.
    #[must_use]
    pub fn user_nonce(&self) -> Vec<u8> {
        to_padded(&self.a_pub, NONCE_SIZE)
    }

    /// Step 2 at the user: absorb `(salt, B)` and compute the proof M.
    ///
    /// Fails when `B mod N == 0` or `u == 0`.
    pub fn process_challenge(&mut self, salt: &[u8], host_nonce: &[u8]) -> bool {
        let grp = group();
        let b_pub = BigUint::from_bytes_be(host_nonce);
        if (&b_pub % &grp.n).is_zero() {
            return false;
        }
        let u = hash_to_int(&[
            &to_padded(&self.a_pub, NONCE_SIZE),
            &to_padded(&b_pub, NONCE_SIZE),
        ]);
        if u.is_zero() {
            return false;
        }

        let x = private_key(self.identity, &self.password, salt, self.rounds);
        // S = (B - k*g^x)^(a + u*x); the subtraction is mod N.
        let gx = grp.g.modpow(&x, &grp.n);
        let kgx = (&grp.k * gx) % &grp.n;
        let base = ((&b_pub + &grp.n) - kgx) % &grp.n;
        let exponent = &self.a_priv + &u * &x;
        let premaster = base.modpow(&exponent, &grp.n);

        self.key = hash_bytes(&[&premaster.to_bytes_be()]);
        self.proof_m = user_proof(&grp, self.identity, salt, &self.a_pub, &b_pub, &self.key);
        self.proof_amk = hash_bytes(&[
            &to_padded(&self.a_pub, NONCE_SIZE),
            &self.proof_m,
            &self.key,
        ]);
        true
    }

    /// The user's proof M from step 2.
    #[must_use]
    pub fn user_proof(&self) -> &[u8] {
        &self.proof_m
    }

    /// Step 4 at the user: check the host proof H(A, M, K).
    #[must_use]
    pub fn verify_host_proof(&self, proof: &[u8]) -> bool {
        !self.proof_amk.is_empty() && constant_time_eq(&self.proof_amk, proof)
    }

    /// The shared session key K = H(S).
    #[must_use]
    pub fn session_key(&self) -> &[u8] {
        &self.key
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    const IDENTITY: u64 = 65543;
    const PASSWORD: &[u8] = b"pw";

    #[test]
    fn full_handshake() {
        let (salt, verifier) = generate_verifier(IDENTITY, PASSWORD, 1);

        let mut user = SrpUser::new(IDENTITY, PASSWORD, 1);
        let host = SrpHost::identify(IDENTITY, &user.user_nonce(), &salt, &verifier).unwrap();

        assert!(user.process_challenge(host.salt(), &host.host_nonce()));
        assert!(host.verify_user_proof(user.user_proof()));
        assert!(user.verify_host_proof(host.host_proof()));
        assert_eq!(host.session_key(), user.session_key());
    }

    #[test]
    fn wrong_password_is_rejected() {
        let (salt, verifier) = generate_verifier(IDENTITY, PASSWORD, 1);

        let mut user = SrpUser::new(IDENTITY, b"not-pw", 1);
        let host = SrpHost::identify(IDENTITY, &user.user_nonce(), &salt, &verifier).unwrap();

        assert!(user.process_challenge(host.salt(), &host.host_nonce()));
        assert!(!host.verify_user_proof(user.user_proof()));
    }

    #[test]
    fn hashing_rounds_must_match() {
        let (salt, verifier) = generate_verifier(IDENTITY, PASSWORD, 3);

        let mut user = SrpUser::new(IDENTITY, PASSWORD, 1);
        let host = SrpHost::identify(IDENTITY, &user.user_nonce(), &salt, &verifier).unwrap();
        assert!(user.process_challenge(host.salt(), &host.host_nonce()));
        assert!(!host.verify_user_proof(user.user_proof()));

        let mut user = SrpUser::new(IDENTITY, PASSWORD, 3);
        let host = SrpHost::identify(IDENTITY, &user.user_nonce(), &salt, &verifier).unwrap();
        assert!(user.process_challenge(host.salt(), &host.host_nonce()));
        assert!(host.verify_user_proof(user.user_proof()));
    }

    #[test]
    fn poisoned_nonces_are_refused() {
        let (salt, verifier) = generate_verifier(IDENTITY, PASSWORD, 1);
        let zero = vec![0u8; NONCE_SIZE];
        assert!(SrpHost::identify(IDENTITY, &zero, &salt, &verifier).is_none());

        let mut user = SrpUser::new(IDENTITY, PASSWORD, 1);
        assert!(!user.process_challenge(&salt, &zero));
    }

    #[test]
    fn fake_salt_is_deterministic_per_identity() {
        let secret = b"process-secret";
        assert_eq!(fake_salt(secret, 12345), fake_salt(secret, 12345));
        assert_ne!(fake_salt(secret, 12345), fake_salt(secret, 12346));
        assert_eq!(fake_salt(secret, 12345).len(), SALT_SIZE);
        assert_eq!(fake_nonce(secret, 12345).len(), NONCE_SIZE);
        assert_eq!(fake_nonce(secret, 12345), fake_nonce(secret, 12345));
    }
}
