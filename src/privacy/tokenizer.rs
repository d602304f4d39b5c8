//! Keyed, reversible tokenization
//!
//! Tokens are deterministic: the AES-256-GCM nonce is derived from an
//! HMAC-SHA256 over the category and value, so equal inputs give equal
//! tokens under one key while distinct values give distinct tokens.
//! Only a tokenizer built from the same key can restore the value.

use crate::error::{Error, Result};
use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use hkdf::Hkdf;
use rand::RngCore;
use regex::Regex;
use ring::hmac;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::OnceLock;
use zeroize::{Zeroize, ZeroizeOnDrop};

const NONCE_SIZE: usize = 12;
const MIN_KEY_LEN: usize = 16;
const HKDF_SALT: &[u8] = b"govshield-tokenize-v1";

/// Secret used to derive tokenization keys.
///
/// Zeroized on drop; `Debug` never prints the value.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct TokenizeKey(String);

impl TokenizeKey {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Generate a random 256-bit key, base64 encoded.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let encoded = URL_SAFE_NO_PAD.encode(bytes);
        bytes.zeroize();
        Self(encoded)
    }

    /// Expose the secret (for printing a freshly generated key only)
    pub fn expose(&self) -> &str {
        &self.0
    }

    fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl std::fmt::Debug for TokenizeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TokenizeKey(***)")
    }
}

fn token_regex() -> Option<&'static Regex> {
    static TOKEN_RE: OnceLock<Option<Regex>> = OnceLock::new();
    TOKEN_RE
        .get_or_init(|| Regex::new(r"\[TOK:([A-Z0-9_-]+):([A-Za-z0-9_-]+)\]").ok())
        .as_ref()
}

/// Deterministic pseudonymizer bound to one key
pub struct Tokenizer {
    mac_key: hmac::Key,
    cipher: Aes256Gcm,
}

impl Tokenizer {
    /// Derive MAC and encryption keys from the secret.
    pub fn new(key: &TokenizeKey) -> Result<Self> {
        if key.as_bytes().len() < MIN_KEY_LEN {
            return Err(Error::Config(format!(
                "Tokenize key must be at least {} bytes",
                MIN_KEY_LEN
            )));
        }

        let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), key.as_bytes());
        let mut mac_bytes = [0u8; 32];
        let mut enc_bytes = [0u8; 32];
        hk.expand(b"mac", &mut mac_bytes)
            .and_then(|_| hk.expand(b"enc", &mut enc_bytes))
            .map_err(|e| Error::Crypto(format!("Key derivation failed: {}", e)))?;

        let mac_key = hmac::Key::new(hmac::HMAC_SHA256, &mac_bytes);
        let cipher = Aes256Gcm::new_from_slice(&enc_bytes)
            .map_err(|e| Error::Crypto(format!("Failed to create cipher: {}", e)));
        mac_bytes.zeroize();
        enc_bytes.zeroize();

        Ok(Self {
            mac_key,
            cipher: cipher?,
        })
    }

    /// Replace `value` with a token marker carrying `label`.
    pub fn tokenize(&self, label: &str, value: &str) -> Result<String> {
        let mut mac_input = Vec::with_capacity(label.len() + 1 + value.len());
        mac_input.extend_from_slice(label.as_bytes());
        mac_input.push(0);
        mac_input.extend_from_slice(value.as_bytes());
        let tag = hmac::sign(&self.mac_key, &mac_input);
        mac_input.zeroize();

        let nonce_bytes = &tag.as_ref()[..NONCE_SIZE];
        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(nonce_bytes),
                Payload {
                    msg: value.as_bytes(),
                    aad: label.as_bytes(),
                },
            )
            .map_err(|e| Error::Crypto(format!("Encryption failed: {}", e)))?;

        let mut body = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        body.extend_from_slice(nonce_bytes);
        body.extend_from_slice(&ciphertext);

        Ok(format!("[TOK:{}:{}]", label, URL_SAFE_NO_PAD.encode(body)))
    }

    /// Recover the original value from a token body.
    pub fn detokenize(&self, label: &str, body: &str) -> Result<String> {
        let raw = URL_SAFE_NO_PAD
            .decode(body)
            .map_err(|e| Error::Crypto(format!("Malformed token: {}", e)))?;
        if raw.len() <= NONCE_SIZE {
            return Err(Error::Crypto("Token too short".to_string()));
        }

        let plaintext = self
            .cipher
            .decrypt(
                Nonce::from_slice(&raw[..NONCE_SIZE]),
                Payload {
                    msg: &raw[NONCE_SIZE..],
                    aad: label.as_bytes(),
                },
            )
            .map_err(|_| Error::Crypto("Token was not issued under this key".to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|e| Error::Crypto(format!("Token payload is not UTF-8: {}", e)))
    }

    /// Replace every token marker in `text` with its original value.
    pub fn restore(&self, text: &str) -> Result<String> {
        let re = token_regex()
            .ok_or_else(|| Error::Crypto("Token pattern failed to compile".to_string()))?;
        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        for caps in re.captures_iter(text) {
            let Some(whole) = caps.get(0) else {
                continue;
            };
            out.push_str(&text[last..whole.start()]);
            out.push_str(&self.detokenize(&caps[1], &caps[2])?);
            last = whole.end();
        }
        out.push_str(&text[last..]);
        Ok(out)
    }
}
