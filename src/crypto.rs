//! Payload envelope: passphrase key derivation, AES-256-GCM, content checksum
//!
//! Sealed layout: `nonce(12) || ciphertext || tag(16)`. The salt travels in the
//! Init message and the key is re-derived on each side; it is never stored.

use argon2::{Algorithm, Argon2, Params, Version};
use rand::rngs::OsRng;
use rand::RngCore;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::{digest, pbkdf2};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroU32;
use thiserror::Error;
use zeroize::Zeroizing;

pub const SALT_LEN: usize = 16;
pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Checksum bytes carried in the Fin message
pub const CHECKSUM_LEN: usize = 16;

/// Session ids are this many random bytes, hex encoded (8 characters)
const SESSION_ID_BYTES: usize = 4;

#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: {0}")]
    DecryptionFailed(&'static str),
}

/// Key derivation function types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum KdfType {
    #[default]
    Argon2,
    Pbkdf2,
}

/// Key derivation parameters. Both ends of a transfer must agree on these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KdfConfig {
    pub kind: KdfType,

    /// Argon2id memory cost in KiB
    pub argon2_memory_kib: u32,

    /// Argon2id passes over memory
    pub argon2_iterations: u32,

    /// Argon2id parallelism
    pub argon2_lanes: u32,

    /// PBKDF2-HMAC-SHA256 rounds
    pub pbkdf2_iterations: u32,
}

impl Default for KdfConfig {
    fn default() -> Self {
        Self {
            kind: KdfType::Argon2,
            argon2_memory_kib: 64 * 1024,
            argon2_iterations: 1,
            argon2_lanes: 4,
            pbkdf2_iterations: 600_000,
        }
    }
}

/// Passphrase-bound envelope shared by the sender and the assembler
#[derive(Clone)]
pub struct Envelope {
    passphrase: Zeroizing<String>,
    kdf: KdfConfig,
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("passphrase", &"<redacted>")
            .field("kdf", &self.kdf)
            .finish()
    }
}

impl Envelope {
    pub fn new(passphrase: impl Into<String>, kdf: KdfConfig) -> Self {
        Self {
            passphrase: Zeroizing::new(passphrase.into()),
            kdf,
        }
    }

    /// Derive the 256-bit transfer key for `salt`
    pub fn derive_key(&self, salt: &[u8]) -> Result<Zeroizing<[u8; KEY_LEN]>, EnvelopeError> {
        let mut key = Zeroizing::new([0u8; KEY_LEN]);

        match self.kdf.kind {
            KdfType::Argon2 => {
                let params = Params::new(
                    self.kdf.argon2_memory_kib,
                    self.kdf.argon2_iterations,
                    self.kdf.argon2_lanes,
                    Some(KEY_LEN),
                )
                .map_err(|e| EnvelopeError::KeyDerivation(e.to_string()))?;

                Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
                    .hash_password_into(self.passphrase.as_bytes(), salt, &mut key[..])
                    .map_err(|e| EnvelopeError::KeyDerivation(e.to_string()))?;
            }
            KdfType::Pbkdf2 => {
                let rounds = NonZeroU32::new(self.kdf.pbkdf2_iterations).ok_or_else(|| {
                    EnvelopeError::KeyDerivation("PBKDF2 iterations must be non-zero".into())
                })?;
                pbkdf2::derive(
                    pbkdf2::PBKDF2_HMAC_SHA256,
                    rounds,
                    salt,
                    self.passphrase.as_bytes(),
                    &mut key[..],
                );
            }
        }

        Ok(key)
    }

    /// Encrypt `plaintext` under the key derived from `salt`
    pub fn seal(&self, salt: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
        let key = self.aead_key(salt)?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut in_out = plaintext.to_vec();
        key.seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| EnvelopeError::EncryptionFailed)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + in_out.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&in_out);
        Ok(sealed)
    }

    /// Decrypt data produced by [`Envelope::seal`]
    ///
    /// Any tampering, a wrong passphrase or a wrong salt all surface as
    /// `DecryptionFailed`; wrong plaintext is never returned.
    pub fn open(&self, salt: &[u8], sealed: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
        if sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(EnvelopeError::DecryptionFailed("ciphertext too short"));
        }

        let key = self.aead_key(salt)?;

        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| EnvelopeError::DecryptionFailed("bad nonce"))?;

        let mut in_out = ciphertext.to_vec();
        let plaintext_len = key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| EnvelopeError::DecryptionFailed("authentication failed"))?
            .len();
        in_out.truncate(plaintext_len);
        Ok(in_out)
    }

    fn aead_key(&self, salt: &[u8]) -> Result<LessSafeKey, EnvelopeError> {
        let key = self.derive_key(salt)?;
        let unbound = UnboundKey::new(&AES_256_GCM, &key[..])
            .map_err(|_| EnvelopeError::KeyDerivation("invalid AES-256 key length".into()))?;
        Ok(LessSafeKey::new(unbound))
    }
}

/// Content checksum: SHA-256 truncated to [`CHECKSUM_LEN`] bytes
pub fn checksum(data: &[u8]) -> [u8; CHECKSUM_LEN] {
    let hash = digest::digest(&digest::SHA256, data);
    let mut out = [0u8; CHECKSUM_LEN];
    out.copy_from_slice(&hash.as_ref()[..CHECKSUM_LEN]);
    out
}

pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Random 8-character lowercase hex session id
pub fn generate_session_id() -> String {
    let mut bytes = [0u8; SESSION_ID_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
