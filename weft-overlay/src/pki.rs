//! RSA envelope for frame authentication.
//!
//! Peers sign whole frames with their long-term 2048-bit key and seal
//! handshake nonces with the remote end's public key. A missing key degrades
//! to a no-op on both sides so closed test rings can run without key files.

use crate::error::{HubError, Result};
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use sha2::Sha512;
use weft_core::message::Message;
use weft_core::wire::MTU;

/// RSA modulus size in bits.
pub const KEY_BITS: usize = 2048;

/// Signature size for 2048-bit keys.
pub const SIGNATURE_LENGTH: usize = KEY_BITS / 8;

/// Ciphertext size of a sealed nonce.
pub const ENCRYPTED_LENGTH: usize = KEY_BITS / 8;

/// Largest plaintext a single PKCS#1 v1.5 envelope can carry.
pub const ENCODING_LENGTH: usize = ENCRYPTED_LENGTH - 11;

/// Long-term key material.
///
/// Either half may be absent; operations that need the missing half turn
/// into no-ops (`sign`/`verify`) or errors (`encrypt`/`decrypt`).
#[derive(Clone, Default)]
pub struct Pki {
    private: Option<RsaPrivateKey>,
    public: Option<RsaPublicKey>,
}

impl Pki {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            private: None,
            public: None,
        }
    }

    /// Generate a throwaway keypair (tests and closed rings).
    pub fn generate() -> Result<Self> {
        let private = RsaPrivateKey::new(&mut rand::thread_rng(), KEY_BITS)
            .map_err(|e| HubError::security(e.to_string()))?;
        let public = RsaPublicKey::from(&private);
        Ok(Self {
            private: Some(private),
            public: Some(public),
        })
    }

    /// Load the private key from a PEM file (PKCS#8 or PKCS#1).
    pub fn load_private_key(&mut self, path: &std::path::Path) -> Result<()> {
        let pem = std::fs::read_to_string(path)?;
        let key = RsaPrivateKey::from_pkcs8_pem(&pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(&pem))
            .map_err(|e| HubError::security(format!("bad private key: {e}")))?;
        self.private = Some(key);
        Ok(())
    }

    /// Load the public key from a PEM file (SPKI or PKCS#1).
    pub fn load_public_key(&mut self, path: &std::path::Path) -> Result<()> {
        let pem = std::fs::read_to_string(path)?;
        let key = RsaPublicKey::from_public_key_pem(&pem)
            .or_else(|_| RsaPublicKey::from_pkcs1_pem(&pem))
            .map_err(|e| HubError::security(format!("bad public key: {e}")))?;
        self.public = Some(key);
        Ok(())
    }

    #[must_use]
    pub const fn has_private(&self) -> bool {
        self.private.is_some()
    }

    #[must_use]
    pub const fn has_public(&self) -> bool {
        self.public.is_some()
    }

    /// Sign `data`, returning the raw signature bytes.
    pub fn sign_bytes(&self, data: &[u8]) -> Option<Vec<u8>> {
        let key = self.private.as_ref()?;
        let signer = SigningKey::<Sha512>::new(key.clone());
        Some(signer.sign(data).to_vec())
    }

    /// Verify a detached signature over `data`.
    #[must_use]
    pub fn verify_bytes(&self, data: &[u8], signature: &[u8]) -> bool {
        let Some(key) = self.public.as_ref() else {
            return false;
        };
        let Ok(signature) = Signature::try_from(signature) else {
            return false;
        };
        let verifier = VerifyingKey::<Sha512>::new(key.clone());
        verifier.verify(data, &signature).is_ok()
    }

    /// Seal a nonce with the public key.
    pub fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>> {
        let key = self
            .public
            .as_ref()
            .ok_or_else(|| HubError::security("no public key"))?;
        if plain.len() > ENCODING_LENGTH {
            return Err(HubError::security("plaintext too large"));
        }
        key.encrypt(&mut rand::thread_rng(), Pkcs1v15Encrypt, plain)
            .map_err(|e| HubError::security(e.to_string()))
    }

    /// Open a sealed nonce with the private key.
    pub fn decrypt(&self, cipher: &[u8]) -> Result<Vec<u8>> {
        let key = self
            .private
            .as_ref()
            .ok_or_else(|| HubError::security("no private key"))?;
        key.decrypt(Pkcs1v15Encrypt, cipher)
            .map_err(|e| HubError::security(e.to_string()))
    }

    /// Sign a frame in place: the length grows by `SIGNATURE_LENGTH` first,
    /// then the signature over everything before it is appended.
    ///
    /// Without a private key this is a successful no-op (the other end skips
    /// verification symmetrically).
    pub fn sign_message(&self, msg: &mut Message) -> bool {
        if self.private.is_none() {
            return true;
        }
        let signed_len = msg.length() as usize;
        let total = signed_len + SIGNATURE_LENGTH;
        if total > MTU || !msg.put_length(total as u16) {
            return false;
        }
        let Some(signature) = self.sign_bytes(&msg.frame()[..signed_len]) else {
            return false;
        };
        msg.set_data_bytes(signed_len - weft_core::wire::HEADER_SIZE, &signature)
    }

    /// Verify a frame signed by `sign_message`.
    ///
    /// Without a public key this is a successful no-op.
    #[must_use]
    pub fn verify_message(&self, msg: &Message) -> bool {
        if self.public.is_none() {
            return true;
        }
        let total = msg.length() as usize;
        if total < weft_core::wire::HEADER_SIZE + SIGNATURE_LENGTH {
            return false;
        }
        let signed_len = total - SIGNATURE_LENGTH;
        let frame = msg.frame();
        self.verify_bytes(&frame[..signed_len], &frame[signed_len..])
    }
}

impl std::fmt::Debug for Pki {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pki")
            .field("private", &self.private.is_some())
            .field("public", &self.public.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::wire::{qualifier, Command, Header, HEADER_SIZE, REQUEST};

    fn test_pki() -> Pki {
        // Key generation dominates the test time; share one pair.
        use std::sync::OnceLock;
        static PKI: OnceLock<Pki> = OnceLock::new();
        PKI.get_or_init(|| Pki::generate().unwrap()).clone()
    }

    fn sample_message() -> Message {
        let mut msg = Message::new();
        msg.build(Header {
            source: 3,
            destination: 9,
            length: (HEADER_SIZE + 8) as u16,
            sequence: 1,
            command: Command::Basic as u8,
            qualifier: qualifier::REGISTER,
            status: REQUEST,
            ..Header::default()
        });
        msg.set_data64(0, 0xFEED);
        msg
    }

    #[test]
    fn detached_signature_round_trip() {
        let pki = test_pki();
        let signature = pki.sign_bytes(b"attested bytes").unwrap();
        assert_eq!(signature.len(), SIGNATURE_LENGTH);
        assert!(pki.verify_bytes(b"attested bytes", &signature));
        assert!(!pki.verify_bytes(b"attested bytez", &signature));
    }

    #[test]
    fn message_signature_round_trip() {
        let pki = test_pki();
        let mut msg = sample_message();
        let unsigned_len = msg.length() as usize;

        assert!(pki.sign_message(&mut msg));
        assert_eq!(msg.length() as usize, unsigned_len + SIGNATURE_LENGTH);
        assert!(pki.verify_message(&msg));

        // Tampering with the payload must break verification.
        msg.set_data64(0, 0xBAD);
        assert!(!pki.verify_message(&msg));
    }

    #[test]
    fn envelope_round_trip() {
        let pki = test_pki();
        let sealed = pki.encrypt(b"nonce-material").unwrap();
        assert_eq!(sealed.len(), ENCRYPTED_LENGTH);
        assert_eq!(pki.decrypt(&sealed).unwrap(), b"nonce-material");
    }

    #[test]
    fn missing_keys_degrade() {
        let empty = Pki::new();
        let mut msg = sample_message();
        let len = msg.length();
        assert!(empty.sign_message(&mut msg));
        assert_eq!(msg.length(), len);
        assert!(empty.verify_message(&msg));
        assert!(empty.encrypt(b"x").is_err());
    }
}
