//! The signing capability: a "session capability" owned by the
//! authenticated agent (§9 "Global mutable `seed`"). Modeled as
//! `Option<&Keypair>` threaded through the FSM's [`crate::fsm::FsmContext`]:
//! `Some` means the agent is authenticated and can sign; `None` is
//! watchtower mode (§4.4).

use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use secrecy::{ExposeSecret, Secret};
use starlight_common::LedgerAddress;

/// 32 bytes of entropy sealed by the account password (§3 `encryptedSeed`).
/// Decrypting it is out of this crate's scope (§1: "bcrypt/secret-box key
/// encryption utilities" are an external collaborator); this type only
/// carries the decrypted bytes once unsealed.
pub type Seed = Secret<[u8; 32]>;

/// Three keypath slots are reserved per channel on creation and never
/// reused (§3 `keyIndex` invariant): escrow, host-ratchet, guest-ratchet.
pub const KEYPATH_SLOTS_PER_CHANNEL: u64 = 3;

/// Derives the signing keypair at a given keypath index from the seed.
///
/// This is a simple HKDF-free derivation (seed bytes XORed with the index,
/// then used as an ed25519 seed) deliberately kept this minimal: the spec's
/// out-of-scope list excludes "low-level ledger transaction construction",
/// and with it, any particular BIP-32-style derivation scheme. What matters
/// for the invariants this crate must uphold is that distinct indices yield
/// distinct, deterministic keypairs.
pub fn derive_keypair(seed: &Seed, keypath_index: u64) -> SigningKey {
    let mut material = *seed.expose_secret();
    for (i, byte) in keypath_index.to_be_bytes().iter().enumerate() {
        material[i] ^= byte;
    }
    SigningKey::from_bytes(&material)
}

pub fn address_for_keypair(verifying_key: &VerifyingKey) -> LedgerAddress {
    LedgerAddress::from_public_key_bytes(verifying_key.to_bytes())
}

/// The signing capability available to an FSM step: `Some(seed)` if
/// authenticated this process lifetime, `None` in watchtower mode.
pub enum SigningCapability<'a> {
    Available(&'a Seed),
    Watchtower,
}

impl<'a> SigningCapability<'a> {
    pub fn keypair_at(&self, keypath_index: u64) -> Option<SigningKey> {
        match self {
            SigningCapability::Available(seed) => Some(derive_keypair(seed, keypath_index)),
            SigningCapability::Watchtower => None,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, SigningCapability::Available(_))
    }
}

/// Signs arbitrary bytes (e.g. the preimage of a transaction hash) with the
/// keypair at `keypath_index`. Returns `None` in watchtower mode.
pub fn try_sign(
    capability: &SigningCapability<'_>,
    keypath_index: u64,
    message: &[u8],
) -> Option<ed25519_dalek::Signature> {
    capability
        .keypair_at(keypath_index)
        .map(|kp| kp.sign(message))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn distinct_indices_yield_distinct_keys() {
        let seed: Seed = Secret::new([3u8; 32]);
        let k0 = derive_keypair(&seed, 0);
        let k1 = derive_keypair(&seed, 1);
        assert_ne!(k0.to_bytes(), k1.to_bytes());
    }

    #[test]
    fn derivation_is_deterministic() {
        let seed: Seed = Secret::new([3u8; 32]);
        let k0a = derive_keypair(&seed, 5);
        let k0b = derive_keypair(&seed, 5);
        assert_eq!(k0a.to_bytes(), k0b.to_bytes());
    }

    #[test]
    fn watchtower_capability_cannot_sign() {
        let capability = SigningCapability::Watchtower;
        assert!(!capability.is_available());
        assert!(try_sign(&capability, 0, b"hello").is_none());
    }
}
