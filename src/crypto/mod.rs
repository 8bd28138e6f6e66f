//! AES-256-GCM encryption of wire messages keyed by a shared passphrase
//!
//! The key is derived from the passphrase with Argon2id. Each process picks
//! a random salt once, so a key is derived a single time per process and
//! once per peer salt seen on the receiving side.
//!
//! # Envelope Format
//!
//! ```text
//! [version: u8 = 1][salt: 16 bytes][nonce: 12 bytes][ciphertext + tag]
//! ```

use std::sync::Mutex;

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use argon2::{Algorithm, Argon2, Params, Version};
use thiserror::Error;
use zeroize::Zeroizing;

const ENVELOPE_VERSION: u8 = 1;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
const TAG_LEN: usize = 16;

/// Bytes an envelope adds on top of the plaintext
pub const ENVELOPE_OVERHEAD: usize = 1 + SALT_LEN + NONCE_LEN + TAG_LEN;

/// Encryption errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Key derivation failed or parameters were rejected
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    /// Encryption failed
    #[error("Encryption failed")]
    Encryption,

    /// Wrong passphrase, mismatched KDF settings or tampered ciphertext
    #[error("Decryption failed: wrong passphrase or corrupted message")]
    Decryption,

    /// Envelope too short or of an unknown version
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),
}

/// Argon2id cost parameters. Both peers must use the same values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    /// Memory cost in KiB
    pub memory_kib: u32,

    /// Number of passes
    pub iterations: u32,

    /// Degree of parallelism
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 15000,
            iterations: 2,
            parallelism: 1,
        }
    }
}

impl KdfParams {
    fn argon2(&self) -> Result<Argon2<'static>, CryptoError> {
        let params = Params::new(
            self.memory_kib,
            self.iterations,
            self.parallelism,
            Some(KEY_LEN),
        )
        .map_err(|e| CryptoError::KeyDerivation(format!("invalid argon2 params: {}", e)))?;

        Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }
}

struct DerivedKey {
    salt: [u8; SALT_LEN],
    cipher: Aes256Gcm,
}

/// Passphrase-keyed message cipher
pub struct Cipher {
    passphrase: Zeroizing<String>,
    params: KdfParams,
    local: DerivedKey,
    remote: Mutex<Option<DerivedKey>>,
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cipher")
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

impl Cipher {
    /// Derive a cipher from `passphrase` with a fresh random salt
    pub fn new(passphrase: &str, params: KdfParams) -> Result<Self, CryptoError> {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);

        let cipher = derive(passphrase, &salt, &params)?;

        Ok(Self {
            passphrase: Zeroizing::new(passphrase.to_string()),
            params,
            local: DerivedKey { salt, cipher },
            remote: Mutex::new(None),
        })
    }

    /// Encrypt `plaintext` into a self-describing envelope
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .local
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| CryptoError::Encryption)?;

        let mut envelope = Vec::with_capacity(1 + SALT_LEN + NONCE_LEN + ciphertext.len());
        envelope.push(ENVELOPE_VERSION);
        envelope.extend_from_slice(&self.local.salt);
        envelope.extend_from_slice(&nonce);
        envelope.extend_from_slice(&ciphertext);
        Ok(envelope)
    }

    /// Decrypt an envelope produced by any peer sharing the passphrase
    pub fn decrypt(&self, envelope: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        if envelope.len() < ENVELOPE_OVERHEAD {
            return Err(CryptoError::MalformedEnvelope(format!(
                "{} bytes is shorter than the {} byte minimum",
                envelope.len(),
                ENVELOPE_OVERHEAD
            )));
        }
        if envelope[0] != ENVELOPE_VERSION {
            return Err(CryptoError::MalformedEnvelope(format!(
                "unsupported version {}",
                envelope[0]
            )));
        }

        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&envelope[1..1 + SALT_LEN]);
        let nonce = Nonce::from_slice(&envelope[1 + SALT_LEN..1 + SALT_LEN + NONCE_LEN]);
        let ciphertext = &envelope[1 + SALT_LEN + NONCE_LEN..];

        let plaintext = if salt == self.local.salt {
            self.local.cipher.decrypt(nonce, ciphertext)
        } else {
            let mut remote = self
                .remote
                .lock()
                .map_err(|_| CryptoError::KeyDerivation("key cache poisoned".to_string()))?;

            let cached = match remote.take() {
                Some(key) if key.salt == salt => key,
                _ => DerivedKey {
                    salt,
                    cipher: derive(&self.passphrase, &salt, &self.params)?,
                },
            };
            let result = cached.cipher.decrypt(nonce, ciphertext);
            *remote = Some(cached);
            result
        };

        plaintext.map(Zeroizing::new).map_err(|_| CryptoError::Decryption)
    }

    /// KDF parameters this cipher was created with
    pub fn params(&self) -> KdfParams {
        self.params
    }
}

fn derive(passphrase: &str, salt: &[u8; SALT_LEN], params: &KdfParams) -> Result<Aes256Gcm, CryptoError> {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    params
        .argon2()?
        .hash_password_into(passphrase.as_bytes(), salt, &mut key[..])
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

    Aes256Gcm::new_from_slice(&key[..]).map_err(|e| CryptoError::KeyDerivation(e.to_string()))
}
