//! Cryptographic primitives for overnet.
//!
//! Provides two things:
//!   1. BLAKE3 hashing: key digests and certificate fingerprints
//!   2. Ed25519 keypairs: profile keys, network root keys, signatures
//!
//! Private key material is held in `Zeroizing` buffers and wiped on drop.
//! There is no unsafe code in this module.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

// ── BLAKE3 ────────────────────────────────────────────────────────────────────

/// Hash a byte slice, returning a 32-byte BLAKE3 digest.
pub fn hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Short hex rendering of a key for log fields (first 8 bytes).
pub fn short_hex(bytes: &[u8]) -> String {
    hex::encode(&bytes[..bytes.len().min(8)])
}

// ── Keypair ───────────────────────────────────────────────────────────────────

/// Length of an Ed25519 public key.
pub const PUBLIC_KEY_LENGTH: usize = 32;

/// Length of an Ed25519 signature.
pub const SIGNATURE_LENGTH: usize = 64;

/// A long-term Ed25519 keypair.
///
/// Used both for the local profile key (the identity presented to
/// neighbors) and for network root keys held by network creators.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Keypair {
    /// Private seed, zeroized on drop, never exposed directly.
    private: Zeroizing<[u8; 32]>,
    /// Public key: the value certificates are issued for.
    #[zeroize(skip)]
    pub public: [u8; 32],
}

impl Keypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        let mut seed = Zeroizing::new([0u8; 32]);
        rand::thread_rng().fill_bytes(&mut *seed);
        Self::from_private(*seed)
    }

    /// Reconstruct a keypair from stored private seed bytes.
    /// The public key is derived deterministically from the seed.
    pub fn from_private(private_bytes: [u8; 32]) -> Self {
        let signing = SigningKey::from_bytes(&private_bytes);
        Self {
            private: Zeroizing::new(private_bytes),
            public: signing.verifying_key().to_bytes(),
        }
    }

    /// Serialize the private seed for persistent storage.
    pub fn private_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(*self.private)
    }

    /// Sign a message, returning the 64-byte signature.
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LENGTH] {
        SigningKey::from_bytes(&self.private).sign(message).to_bytes()
    }
}

impl PartialEq for Keypair {
    fn eq(&self, other: &Self) -> bool {
        self.public == other.public
    }
}

impl Eq for Keypair {}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("public", &hex::encode(self.public))
            .finish_non_exhaustive()
    }
}

impl Serialize for Keypair {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        crate::serde_hex::array32::serialize(&self.private, serializer)
    }
}

impl<'de> Deserialize<'de> for Keypair {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let seed = Zeroizing::new(crate::serde_hex::array32::deserialize(deserializer)?);
        Ok(Self::from_private(*seed))
    }
}

/// Verify an Ed25519 signature. Malformed keys or signatures verify as false.
pub fn verify(public: &[u8; PUBLIC_KEY_LENGTH], message: &[u8], signature: &[u8]) -> bool {
    let Ok(key) = VerifyingKey::from_bytes(public) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };
    key.verify(message, &signature).is_ok()
}

/// Random bytes for certificate serial numbers.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    rand::thread_rng().fill_bytes(&mut out);
    out
}
