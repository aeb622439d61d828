//! Crypto Primitives Gateway (§4, component B).
//!
//! The core treats signing, verification, and hashing as opaque external
//! contracts (§6: "signed-identity issuance/verification primitives ...
//! assumed"). `CryptoGateway` is the trait boundary; algorithm identifiers
//! are carried only as opaque string labels on identity/assertion records,
//! never interpreted by the core itself.
//!
//! `Sha256Gateway` is a reference implementation good enough for tests and
//! offline verification of the portable token (§4.7): it treats public keys
//! as opaque byte strings and "signatures" as an HMAC-style digest over the
//! signed bytes plus the private key, which is symmetric and deterministic
//! — sufficient to exercise the protocol without pulling in an asymmetric
//! crypto dependency the teacher pack does not otherwise use.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A 32-byte digest, matching §6's `hash(bytes) -> 32-byte digest` contract.
pub type Digest32 = [u8; 32];

/// Opaque key/signature material. Always carried as bytes; the core never
/// inspects its structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Hash)]
pub struct KeyMaterial(pub Vec<u8>);

impl KeyMaterial {
    pub fn from_str(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl From<&str> for KeyMaterial {
    fn from(s: &str) -> Self {
        Self::from_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(pub Vec<u8>);

/// External crypto primitive contract (§6). Implementations may fail with a
/// transient error; per §5 the core never retries internally — callers
/// retry at the request level.
pub trait CryptoGateway: Send + Sync {
    fn sign(&self, bytes: &[u8], private_key: &KeyMaterial) -> Signature;
    fn verify(&self, bytes: &[u8], signature: &Signature, public_key: &KeyMaterial) -> bool;
    fn hash(&self, bytes: &[u8]) -> Digest32;
}

/// Reference gateway used by tests and by callers with no external KMS.
///
/// Signing here is `H(private_key || bytes)`; verification recomputes the
/// same digest from the claimed public key and compares. This only makes
/// sense when "public key" and "private key" are the same opaque token
/// (a shared-secret stand-in), which is what the in-repo tests use — real
/// deployments are expected to supply their own `CryptoGateway`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256Gateway;

impl CryptoGateway for Sha256Gateway {
    fn sign(&self, bytes: &[u8], private_key: &KeyMaterial) -> Signature {
        let mut hasher = Sha256::new();
        hasher.update(&private_key.0);
        hasher.update(bytes);
        Signature(hasher.finalize().to_vec())
    }

    fn verify(&self, bytes: &[u8], signature: &Signature, public_key: &KeyMaterial) -> bool {
        let expected = self.sign(bytes, public_key);
        expected.0 == signature.0
    }

    fn hash(&self, bytes: &[u8]) -> Digest32 {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let out = hasher.finalize();
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&out);
        digest
    }
}

pub fn digest_to_hex(digest: &Digest32) -> String {
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_verify_roundtrips() {
        let gw = Sha256Gateway;
        let key = KeyMaterial::from_str("shared-secret");
        let sig = gw.sign(b"payload", &key);
        assert!(gw.verify(b"payload", &sig, &key));
        assert!(!gw.verify(b"tampered", &sig, &key));
    }

    #[test]
    fn wrong_key_fails_verification() {
        let gw = Sha256Gateway;
        let key = KeyMaterial::from_str("alice-key");
        let other = KeyMaterial::from_str("bob-key");
        let sig = gw.sign(b"payload", &key);
        assert!(!gw.verify(b"payload", &sig, &other));
    }

    #[test]
    fn hash_is_deterministic() {
        let gw = Sha256Gateway;
        assert_eq!(gw.hash(b"abc"), gw.hash(b"abc"));
        assert_ne!(gw.hash(b"abc"), gw.hash(b"abd"));
    }
}
