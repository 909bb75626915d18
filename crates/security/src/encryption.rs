//! Text encryption service used for sensitive payload leaves.
//!
//! `AesCtrHmacEncryption` is AES-256 in counter mode with a random 128-bit
//! nonce, authenticated encrypt-then-MAC with HMAC-SHA256 over
//! `nonce || ciphertext`. Cipher and MAC keys are derived from one 256-bit
//! master key.
//!
//! Token format: `enc:v1:` + base64(`nonce(16) || ciphertext || tag(32)`).

use aes::Aes256;
use aes::cipher::{BlockEncrypt, KeyInit, generic_array::GenericArray};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Marker prefix of every token produced by `AesCtrHmacEncryption`.
pub const CIPHERTEXT_PREFIX: &str = "enc:v1:";

const NONCE_LEN: usize = 16;
const TAG_LEN: usize = 32;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("value is not ciphertext")]
    NotCiphertext,

    #[error("malformed ciphertext: {0}")]
    Malformed(String),

    #[error("ciphertext authentication failed")]
    Authentication,
}

/// Encrypts and decrypts individual text values.
///
/// Implementations are CPU-bound and synchronous; a remote KMS-backed
/// implementation should cache data keys locally.
pub trait EncryptionService: Send + Sync {
    fn encrypt_text(&self, plaintext: &str) -> Result<String, CryptoError>;

    fn decrypt_text(&self, ciphertext: &str) -> Result<String, CryptoError>;

    /// Whether `value` looks like a token this service produced.
    fn is_ciphertext(&self, value: &str) -> bool {
        value.starts_with(CIPHERTEXT_PREFIX)
    }
}

/// AES-256-CTR + HMAC-SHA256 text encryption.
#[derive(Clone)]
pub struct AesCtrHmacEncryption {
    cipher_key: [u8; 32],
    mac_key: [u8; 32],
}

impl core::fmt::Debug for AesCtrHmacEncryption {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AesCtrHmacEncryption").finish_non_exhaustive()
    }
}

impl AesCtrHmacEncryption {
    pub fn new(master_key: [u8; 32]) -> Self {
        Self {
            cipher_key: derive_key(b"chronicle/cipher", &master_key),
            mac_key: derive_key(b"chronicle/mac", &master_key),
        }
    }

    /// Build from a 64-character hex master key.
    pub fn from_hex(master_key_hex: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(master_key_hex.trim())
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let key: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| {
            CryptoError::InvalidKey(format!("expected 32 bytes, got {}", b.len()))
        })?;
        Ok(Self::new(key))
    }

    fn mac(&self) -> Result<HmacSha256, CryptoError> {
        <HmacSha256 as Mac>::new_from_slice(&self.mac_key)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))
    }

    fn apply_keystream(&self, nonce: &[u8; NONCE_LEN], data: &mut [u8]) {
        let cipher = Aes256::new(GenericArray::from_slice(&self.cipher_key));
        let mut counter = u128::from_be_bytes(*nonce);

        for chunk in data.chunks_mut(16) {
            let mut block = GenericArray::clone_from_slice(&counter.to_be_bytes());
            cipher.encrypt_block(&mut block);
            for (d, k) in chunk.iter_mut().zip(block.iter()) {
                *d ^= k;
            }
            counter = counter.wrapping_add(1);
        }
    }
}

fn derive_key(label: &[u8], master: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(label);
    hasher.update(master);
    hasher.finalize().into()
}

impl EncryptionService for AesCtrHmacEncryption {
    fn encrypt_text(&self, plaintext: &str) -> Result<String, CryptoError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let mut body = plaintext.as_bytes().to_vec();
        self.apply_keystream(&nonce, &mut body);

        let mut mac = self.mac()?;
        mac.update(&nonce);
        mac.update(&body);
        let tag = mac.finalize().into_bytes();

        let mut token = Vec::with_capacity(NONCE_LEN + body.len() + TAG_LEN);
        token.extend_from_slice(&nonce);
        token.extend_from_slice(&body);
        token.extend_from_slice(&tag);

        Ok(format!("{CIPHERTEXT_PREFIX}{}", BASE64.encode(token)))
    }

    fn decrypt_text(&self, ciphertext: &str) -> Result<String, CryptoError> {
        let encoded = ciphertext
            .strip_prefix(CIPHERTEXT_PREFIX)
            .ok_or(CryptoError::NotCiphertext)?;
        let raw = BASE64
            .decode(encoded)
            .map_err(|e| CryptoError::Malformed(e.to_string()))?;
        if raw.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::Malformed(format!("token too short ({} bytes)", raw.len())));
        }

        let (nonce, rest) = raw.split_at(NONCE_LEN);
        let (body, tag) = rest.split_at(rest.len() - TAG_LEN);

        let mut mac = self.mac()?;
        mac.update(nonce);
        mac.update(body);
        mac.verify_slice(tag).map_err(|_| CryptoError::Authentication)?;

        let mut nonce_arr = [0u8; NONCE_LEN];
        nonce_arr.copy_from_slice(nonce);
        let mut plain = body.to_vec();
        self.apply_keystream(&nonce_arr, &mut plain);

        String::from_utf8(plain).map_err(|e| CryptoError::Malformed(e.to_string()))
    }
}
