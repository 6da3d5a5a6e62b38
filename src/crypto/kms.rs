// ABOUTME: KMS provider abstraction for wrapping and unwrapping per-org DEKs
// ABOUTME: LocalKms implements the envelope under a process master key
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Meridian CRM

//! KMS provider trait and the local master-key implementation.
//!
//! The envelope engine never sees the master key: it hands wrapped DEK blobs
//! to a `KmsProvider` and receives plaintext DEKs back. Outages surface as
//! `KmsUnavailable` (transient, fallback-eligible); a failed authentication
//! tag surfaces as `AuthenticationFailed` (permanent).

use crate::errors::{AppError, AppResult};
use crate::models::OrgId;
use async_trait::async_trait;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use zeroize::Zeroizing;

/// Nonce length for AES-256-GCM (96 bits)
const NONCE_LEN: usize = 12;

/// Length of a plaintext DEK (AES-256)
pub const DEK_LEN: usize = 32;

/// Key management service operations used by the envelope engine
#[async_trait]
pub trait KmsProvider: Send + Sync {
    /// Wrap a plaintext DEK for storage on the organization row
    ///
    /// # Errors
    ///
    /// Returns `KmsUnavailable` if the service cannot be reached.
    async fn wrap_dek(&self, org_id: OrgId, dek: &[u8]) -> AppResult<Vec<u8>>;

    /// Unwrap a stored DEK blob back to plaintext key material
    ///
    /// # Errors
    ///
    /// Returns `KmsUnavailable` if the service cannot be reached, or
    /// `AuthenticationFailed` if the blob fails authentication.
    async fn unwrap_dek(&self, org_id: OrgId, wrapped: &[u8]) -> AppResult<Zeroizing<Vec<u8>>>;
}

/// Local KMS: wraps DEKs under a process-level master key.
///
/// The wrap format matches the envelope blob format (`nonce ‖ ciphertext+tag`)
/// with the AAD binding the blob to its organization, so a wrapped DEK copied
/// onto another org row fails authentication.
pub struct LocalKms {
    master_key: Zeroizing<Vec<u8>>,
    rng: SystemRandom,
}

impl LocalKms {
    /// Create a local KMS from a 32-byte master key
    #[must_use]
    pub fn new(master_key: [u8; 32]) -> Self {
        Self {
            master_key: Zeroizing::new(master_key.to_vec()),
            rng: SystemRandom::new(),
        }
    }

    fn aad_for(org_id: OrgId) -> String {
        format!("org:{org_id}:dek")
    }
}

#[async_trait]
impl KmsProvider for LocalKms {
    async fn wrap_dek(&self, org_id: OrgId, dek: &[u8]) -> AppResult<Vec<u8>> {
        let unbound_key = UnboundKey::new(&AES_256_GCM, &self.master_key)
            .map_err(|e| AppError::internal(format!("Failed to create wrapping key: {e}")))?;
        let key = LessSafeKey::new(unbound_key);

        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|e| AppError::internal(format!("Failed to generate nonce: {e}")))?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let aad_context = Self::aad_for(org_id);
        let mut ciphertext = dek.to_vec();
        key.seal_in_place_append_tag(nonce, Aad::from(aad_context.as_bytes()), &mut ciphertext)
            .map_err(|e| AppError::internal(format!("DEK wrap failed: {e}")))?;

        let mut wrapped = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        wrapped.extend_from_slice(&nonce_bytes);
        wrapped.extend_from_slice(&ciphertext);
        Ok(wrapped)
    }

    async fn unwrap_dek(&self, org_id: OrgId, wrapped: &[u8]) -> AppResult<Zeroizing<Vec<u8>>> {
        if wrapped.len() < NONCE_LEN {
            return Err(AppError::authentication_failed(
                "Wrapped DEK blob too short",
            ));
        }

        let (nonce_bytes, ciphertext) = wrapped.split_at(NONCE_LEN);
        let nonce = Nonce::assume_unique_for_key(nonce_bytes.try_into().map_err(|e| {
            AppError::internal(format!("Failed to extract nonce from wrapped DEK: {e}"))
        })?);

        let unbound_key = UnboundKey::new(&AES_256_GCM, &self.master_key)
            .map_err(|e| AppError::internal(format!("Failed to create unwrapping key: {e}")))?;
        let key = LessSafeKey::new(unbound_key);

        let aad_context = Self::aad_for(org_id);
        let mut buffer = ciphertext.to_vec();
        let plaintext = key
            .open_in_place(nonce, Aad::from(aad_context.as_bytes()), &mut buffer)
            .map_err(|_| {
                AppError::authentication_failed("DEK unwrap failed (tampered blob or wrong org)")
            })?;

        if plaintext.len() != DEK_LEN {
            return Err(AppError::authentication_failed(format!(
                "Unwrapped DEK has unexpected length {}",
                plaintext.len()
            )));
        }

        Ok(Zeroizing::new(plaintext.to_vec()))
    }
}

/// Generate a fresh random 32-byte DEK
///
/// # Errors
///
/// Returns an error if the system RNG fails.
pub fn generate_dek() -> AppResult<Zeroizing<Vec<u8>>> {
    let rng = SystemRandom::new();
    let mut dek = Zeroizing::new(vec![0u8; DEK_LEN]);
    rng.fill(&mut dek)
        .map_err(|e| AppError::internal(format!("Failed to generate DEK: {e}")))?;
    Ok(dek)
}
