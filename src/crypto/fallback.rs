// ABOUTME: Degraded-mode symmetric encryption used when the KMS is unreachable
// ABOUTME: AES-256-GCM keyed by an HKDF derivation of the application secret
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Meridian CRM

//! Fallback cipher for KMS outages.
//!
//! Trades the per-tenant-key property for availability: credentials keep
//! flowing during an outage, and the encryption stays authenticated (GCM) so
//! corruption is still detectable. Rows written through this path carry
//! `encryption_method = fallback` and are re-encrypted through the envelope
//! engine by the reconciliation sweep once the KMS answers again.

use crate::errors::{AppError, AppResult};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::hkdf::{Salt, HKDF_SHA256};
use ring::rand::{SecureRandom, SystemRandom};
use zeroize::Zeroizing;

/// Nonce length for AES-256-GCM (96 bits)
const NONCE_LEN: usize = 12;

/// HKDF info string binding derived keys to this cipher version
const DERIVATION_INFO: &[u8] = b"meridian:fallback-cipher:v1";

/// Degraded-availability cipher keyed by the application secret
pub struct FallbackCipher {
    key: Zeroizing<Vec<u8>>,
    rng: SystemRandom,
}

impl FallbackCipher {
    /// Derive the cipher key from the long-lived application secret
    ///
    /// # Errors
    ///
    /// Returns an error if HKDF expansion fails.
    pub fn new(secret: &str) -> AppResult<Self> {
        let salt = Salt::new(HKDF_SHA256, &[]);
        let prk = salt.extract(secret.as_bytes());
        let info = [DERIVATION_INFO];
        let okm = prk
            .expand(&info, HKDF_SHA256)
            .map_err(|e| AppError::internal(format!("Failed to expand key material: {e}")))?;

        let mut key = Zeroizing::new(vec![0u8; 32]);
        okm.fill(&mut key)
            .map_err(|e| AppError::internal(format!("Failed to fill derived key: {e}")))?;

        Ok(Self {
            key,
            rng: SystemRandom::new(),
        })
    }

    /// Encrypt plaintext; returns `nonce(12) ‖ ciphertext+tag`
    ///
    /// # Errors
    ///
    /// Returns an error if encryption fails.
    pub fn encrypt(&self, plaintext: &[u8]) -> AppResult<Vec<u8>> {
        let unbound_key = UnboundKey::new(&AES_256_GCM, &self.key)
            .map_err(|e| AppError::internal(format!("Failed to create encryption key: {e}")))?;
        let key = LessSafeKey::new(unbound_key);

        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|e| AppError::internal(format!("Failed to generate nonce: {e}")))?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut ciphertext = plaintext.to_vec();
        key.seal_in_place_append_tag(nonce, Aad::empty(), &mut ciphertext)
            .map_err(|e| AppError::internal(format!("Fallback encryption failed: {e}")))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    /// Decrypt a `nonce ‖ ciphertext+tag` blob
    ///
    /// # Errors
    ///
    /// Returns `AuthenticationFailed` if the blob is malformed or tampered.
    pub fn decrypt(&self, blob: &[u8]) -> AppResult<Vec<u8>> {
        if blob.len() < NONCE_LEN {
            return Err(AppError::authentication_failed(
                "Fallback blob too short",
            ));
        }

        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::assume_unique_for_key(nonce_bytes.try_into().map_err(|e| {
            AppError::internal(format!("Failed to extract nonce from fallback blob: {e}"))
        })?);

        let unbound_key = UnboundKey::new(&AES_256_GCM, &self.key)
            .map_err(|e| AppError::internal(format!("Failed to create decryption key: {e}")))?;
        let key = LessSafeKey::new(unbound_key);

        let mut buffer = ciphertext.to_vec();
        let plaintext = key
            .open_in_place(nonce, Aad::empty(), &mut buffer)
            .map_err(|_| {
                AppError::authentication_failed("Fallback decryption failed (corrupted blob)")
            })?;

        Ok(plaintext.to_vec())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn roundtrip() {
        let cipher = FallbackCipher::new("test-application-secret").unwrap();
        let blob = cipher.encrypt(b"ya29.a0AfB_secret").unwrap();
        assert_ne!(&blob[NONCE_LEN..], b"ya29.a0AfB_secret".as_slice());
        assert_eq!(cipher.decrypt(&blob).unwrap(), b"ya29.a0AfB_secret");
    }

    #[test]
    fn distinct_nonces_per_encryption() {
        let cipher = FallbackCipher::new("test-application-secret").unwrap();
        let a = cipher.encrypt(b"same").unwrap();
        let b = cipher.encrypt(b"same").unwrap();
        assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);
    }

    #[test]
    fn tampered_blob_fails_closed() {
        let cipher = FallbackCipher::new("test-application-secret").unwrap();
        let mut blob = cipher.encrypt(b"secret").unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        assert!(matches!(
            cipher.decrypt(&blob),
            Err(crate::errors::AppError::AuthenticationFailed(_))
        ));
    }

    #[test]
    fn different_secret_fails() {
        let a = FallbackCipher::new("secret-one-long-enough").unwrap();
        let b = FallbackCipher::new("secret-two-long-enough").unwrap();
        let blob = a.encrypt(b"secret").unwrap();
        assert!(b.decrypt(&blob).is_err());
    }
}
