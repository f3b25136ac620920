// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Outbound payload encoding: zstd compression followed by optional
//! ChaCha20-Poly1305 sealing.
//!
//! Sealed payloads are laid out as `nonce (12 bytes) || ciphertext+tag`. The
//! 32-byte key is the SHA-256 digest of the configured passphrase.

use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use sha2::{Digest, Sha256};

use crate::error::RelayError;

const NONCE_LEN: usize = 12;

#[derive(Clone)]
pub struct PayloadCodec {
    compression_level: i32,
    cipher: Option<ChaCha20Poly1305>,
}

impl std::fmt::Debug for PayloadCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadCodec")
            .field("compression_level", &self.compression_level)
            .field("sealed", &self.cipher.is_some())
            .finish()
    }
}

impl PayloadCodec {
    #[must_use]
    pub fn new(compression_level: i32, passphrase: Option<&str>) -> Self {
        let cipher = passphrase.map(|passphrase| {
            let digest = Sha256::digest(passphrase.as_bytes());
            ChaCha20Poly1305::new(Key::from_slice(&digest))
        });
        Self {
            compression_level,
            cipher,
        }
    }

    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.cipher.is_some()
    }

    pub fn encode(&self, payload: &[u8]) -> Result<Vec<u8>, RelayError> {
        let compressed = zstd::encode_all(payload, self.compression_level)
            .map_err(|e| RelayError::Encoding(format!("compression failed: {e}")))?;

        let Some(cipher) = &self.cipher else {
            return Ok(compressed);
        };

        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, compressed.as_slice())
            .map_err(|e| RelayError::Encoding(format!("sealing failed: {e}")))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    pub fn decode(&self, encoded: &[u8]) -> Result<Vec<u8>, RelayError> {
        let compressed = match &self.cipher {
            Some(cipher) => {
                if encoded.len() < NONCE_LEN {
                    return Err(RelayError::Encoding(
                        "sealed payload shorter than nonce".to_string(),
                    ));
                }
                let (nonce, ciphertext) = encoded.split_at(NONCE_LEN);
                cipher
                    .decrypt(Nonce::from_slice(nonce), ciphertext)
                    .map_err(|e| RelayError::Encoding(format!("unsealing failed: {e}")))?
            }
            None => encoded.to_vec(),
        };

        zstd::decode_all(compressed.as_slice())
            .map_err(|e| RelayError::Encoding(format!("decompression failed: {e}")))
    }
}
