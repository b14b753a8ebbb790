//! AES-GCM sealing of individual secret fields.
//!
//! Each secret column in the vault (password, CA certificate, client
//! certificate, client key) is sealed on its own. The AES-256 key is derived
//! once per process from the configured secret with Argon2id, so sealing and
//! opening a field only costs one AEAD operation.
//!
//! # Stored format
//! `v1:` followed by standard base64 of `nonce (12 bytes) || ciphertext || tag (16 bytes)`.
//! A fresh random nonce is drawn for every encryption, so sealing the same
//! plaintext twice yields different tokens.

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use zeroize::Zeroizing;

use crate::Result;
use crate::error::GatewayError;

const TOKEN_PREFIX: &str = "v1:";

/// AES-GCM nonce size: 96 bits
const NONCE_SIZE: usize = 12;

/// AES-GCM authentication tag size: 128 bits
const TAG_SIZE: usize = 16;

/// AES-256 key size
const KEY_SIZE: usize = 32;

/// Application salt for key derivation.
///
/// The vault has a single key per deployment, so the salt only has to
/// separate this derivation from other uses of the same secret.
const KEY_SALT: &[u8] = b"dbgateway/vault/credential-cipher/v1";

/// Argon2id cost parameters.
///
/// Defaults follow the OWASP baseline for Argon2id (19 MiB, t=2, p=1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    /// Memory cost in KiB
    pub memory_cost: u32,
    /// Iterations
    pub time_cost: u32,
    /// Lanes
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_cost: 19_456,
            time_cost: 2,
            parallelism: 1,
        }
    }
}

/// Field cipher holding a derived AES-256 key.
///
/// # Security
/// The key lives in a zeroizing buffer and is never printed.
///
/// # Example
/// ```rust
/// use dbgateway_core::security::{Cipher, KdfParams};
///
/// let params = KdfParams { memory_cost: 64, time_cost: 1, parallelism: 1 };
/// let cipher = Cipher::with_params("correct horse battery staple", params)?;
/// let token = cipher.encrypt("s3cret")?;
/// assert!(token.starts_with("v1:"));
/// assert_eq!(cipher.decrypt(&token)?.as_str(), "s3cret");
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Clone)]
pub struct Cipher {
    key: Zeroizing<[u8; KEY_SIZE]>,
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cipher").field("key", &"<redacted>").finish()
    }
}

impl Cipher {
    /// Derives a cipher from the secret with default Argon2id costs.
    ///
    /// # Errors
    /// Returns error if the secret is empty or key derivation fails
    pub fn new(secret: &str) -> Result<Self> {
        Self::with_params(secret, KdfParams::default())
    }

    /// Derives a cipher from the secret with explicit Argon2id costs.
    ///
    /// # Errors
    /// Returns error if the secret is empty or the parameters are rejected
    pub fn with_params(secret: &str, params: KdfParams) -> Result<Self> {
        if secret.is_empty() {
            return Err(GatewayError::configuration(
                "encryption secret cannot be empty",
            ));
        }

        let argon_params = Params::new(
            params.memory_cost,
            params.time_cost,
            params.parallelism,
            Some(KEY_SIZE),
        )
        .map_err(|e| GatewayError::configuration(format!("Invalid Argon2 parameters: {e}")))?;

        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);

        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        argon2
            .hash_password_into(secret.as_bytes(), KEY_SALT, key.as_mut_slice())
            .map_err(|e| GatewayError::configuration(format!("Key derivation failed: {e}")))?;

        Ok(Self { key })
    }

    fn aead(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(self.key.as_slice()))
    }

    /// Seals a plaintext field into a storable token.
    ///
    /// # Errors
    /// Returns error if the AEAD operation fails
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = self
            .aead()
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| GatewayError::configuration("Encryption failed"))?;

        let mut payload = Vec::with_capacity(NONCE_SIZE + sealed.len());
        payload.extend_from_slice(nonce.as_slice());
        payload.extend_from_slice(&sealed);

        Ok(format!("{TOKEN_PREFIX}{}", STANDARD.encode(payload)))
    }

    /// Opens a token produced by [`Cipher::encrypt`].
    ///
    /// # Errors
    /// Returns `GatewayError::Decryption` if the token is malformed, was
    /// tampered with, or was sealed under a different key
    pub fn decrypt(&self, token: &str) -> Result<Zeroizing<String>> {
        let encoded = token
            .strip_prefix(TOKEN_PREFIX)
            .ok_or_else(|| GatewayError::decryption("unrecognised token format"))?;

        let payload = STANDARD
            .decode(encoded)
            .map_err(|_| GatewayError::decryption("token is not valid base64"))?;

        if payload.len() < NONCE_SIZE + TAG_SIZE {
            return Err(GatewayError::decryption("token is truncated"));
        }

        let (nonce, sealed) = payload.split_at(NONCE_SIZE);
        let plaintext = Zeroizing::new(
            self.aead()
                .decrypt(Nonce::from_slice(nonce), sealed)
                .map_err(|_| GatewayError::decryption("authentication failed"))?,
        );

        let text = std::str::from_utf8(&plaintext)
            .map_err(|_| GatewayError::decryption("plaintext is not valid UTF-8"))?;

        Ok(Zeroizing::new(text.to_string()))
    }
}
