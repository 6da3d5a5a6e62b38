// ABOUTME: Envelope crypto engine with per-org DEK caching and AAD-bound AES-256-GCM
// ABOUTME: Blob layout is versioned so future algorithm changes stay decodable
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Meridian CRM

//! # Envelope Crypto Engine
//!
//! Per-organization data-encryption-key management and the AEAD primitives
//! that protect stored credentials:
//!
//! - DEKs are wrapped by the KMS and stored on the organization row; the
//!   plaintext DEK is cached in-process with a short TTL to bound how long a
//!   compromised process can decrypt without re-authorizing against the KMS.
//! - Every ciphertext is bound to `org:{org_id}:{context}` via AAD, so a blob
//!   decrypted under the wrong tenant or the wrong field fails authentication
//!   even when the DEK matches.
//! - Blobs are packed as `version(1) ‖ nonce(12) ‖ ciphertext+tag`; a blob
//!   without the current version byte is treated as the legacy version-0
//!   layout (`nonce ‖ ciphertext+tag`).

/// Degraded-mode cipher for KMS outages
pub mod fallback;
/// KMS provider trait and local master-key implementation
pub mod kms;

pub use fallback::FallbackCipher;
pub use kms::{generate_dek, KmsProvider, LocalKms, DEK_LEN};

use crate::database::Database;
use crate::errors::{AppError, AppResult};
use crate::models::OrgId;
use dashmap::DashMap;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;
use zeroize::Zeroizing;

/// Current blob layout version
const BLOB_VERSION: u8 = 1;

/// Nonce length for AES-256-GCM (96 bits)
const NONCE_LEN: usize = 12;

/// GCM authentication tag length
const TAG_LEN: usize = 16;

/// Cached plaintext DEK with its expiry
struct CachedDek {
    key: Zeroizing<Vec<u8>>,
    key_version: u32,
    expires_at: Instant,
}

/// Envelope encryption engine
pub struct EnvelopeCrypto {
    database: Arc<Database>,
    kms: Arc<dyn KmsProvider>,
    dek_cache: DashMap<Uuid, CachedDek>,
    cache_ttl: Duration,
    rng: SystemRandom,
}

impl EnvelopeCrypto {
    /// Create a new engine
    #[must_use]
    pub fn new(database: Arc<Database>, kms: Arc<dyn KmsProvider>, cache_ttl: Duration) -> Self {
        Self {
            database,
            kms,
            dek_cache: DashMap::new(),
            cache_ttl,
            rng: SystemRandom::new(),
        }
    }

    /// Generate a fresh DEK for a new organization and wrap it via the KMS
    ///
    /// # Errors
    ///
    /// Returns `KmsUnavailable` if the KMS cannot wrap the key.
    pub async fn wrap_new_dek(&self, org_id: OrgId) -> AppResult<Vec<u8>> {
        let dek = generate_dek()?;
        self.kms.wrap_dek(org_id, &dek).await
    }

    /// Encrypt plaintext under the organization's DEK, bound to `context`
    /// (e.g. "oauth:google:access")
    ///
    /// # Errors
    ///
    /// Returns `KmsUnavailable` when the DEK cannot be resolved because the
    /// KMS is down; other failures are internal errors.
    pub async fn encrypt(
        &self,
        org_id: OrgId,
        plaintext: &[u8],
        context: &str,
    ) -> AppResult<Vec<u8>> {
        let (dek, _) = self.resolve_dek(org_id).await?;

        let unbound_key = UnboundKey::new(&AES_256_GCM, &dek)
            .map_err(|e| AppError::internal(format!("Failed to create encryption key: {e}")))?;
        let key = LessSafeKey::new(unbound_key);

        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|e| AppError::internal(format!("Failed to generate nonce: {e}")))?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let aad_context = aad_for(org_id, context);
        let mut ciphertext = plaintext.to_vec();
        key.seal_in_place_append_tag(nonce, Aad::from(aad_context.as_bytes()), &mut ciphertext)
            .map_err(|e| AppError::internal(format!("Encryption failed: {e}")))?;

        let mut blob = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len());
        blob.push(BLOB_VERSION);
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    /// Decrypt a blob under the organization's DEK. The caller must supply the
    /// same `context` the blob was encrypted with; the context string is part
    /// of the schema and must never change for an existing field without a
    /// migration.
    ///
    /// # Errors
    ///
    /// Returns `KmsUnavailable` when the DEK cannot be resolved, or
    /// `AuthenticationFailed` when the blob is tampered or the AAD mismatches.
    pub async fn decrypt(&self, org_id: OrgId, blob: &[u8], context: &str) -> AppResult<Vec<u8>> {
        let (dek, _) = self.resolve_dek(org_id).await?;

        let (nonce_bytes, ciphertext) = split_blob(blob)?;
        let nonce = Nonce::assume_unique_for_key(
            nonce_bytes
                .try_into()
                .map_err(|e| AppError::internal(format!("Invalid nonce size: {e}")))?,
        );

        let unbound_key = UnboundKey::new(&AES_256_GCM, &dek)
            .map_err(|e| AppError::internal(format!("Failed to create decryption key: {e}")))?;
        let key = LessSafeKey::new(unbound_key);

        let aad_context = aad_for(org_id, context);
        let mut buffer = ciphertext.to_vec();
        let plaintext = key
            .open_in_place(nonce, Aad::from(aad_context.as_bytes()), &mut buffer)
            .map_err(|_| {
                AppError::authentication_failed(
                    "Decryption failed (AAD mismatch or tampered data)",
                )
            })?;

        Ok(plaintext.to_vec())
    }

    /// DEK version that new ciphertexts will be encrypted under
    ///
    /// # Errors
    ///
    /// Returns `KmsUnavailable` when the DEK cannot be resolved.
    pub async fn current_key_version(&self, org_id: OrgId) -> AppResult<u32> {
        let (_, version) = self.resolve_dek(org_id).await?;
        Ok(version)
    }

    /// Drop a cached DEK (key rotation, offboarding)
    pub fn invalidate(&self, org_id: OrgId) {
        self.dek_cache.remove(&org_id.as_uuid());
    }

    /// Resolve the plaintext DEK for an organization: cache hit if fresh,
    /// otherwise fetch the wrapped blob and unwrap through the KMS.
    async fn resolve_dek(&self, org_id: OrgId) -> AppResult<(Zeroizing<Vec<u8>>, u32)> {
        if let Some(cached) = self.dek_cache.get(&org_id.as_uuid()) {
            if cached.expires_at > Instant::now() {
                return Ok((cached.key.clone(), cached.key_version));
            }
        }

        let (wrapped, key_version) = self.database.get_org_wrapped_dek(org_id).await?;
        let dek = self.kms.unwrap_dek(org_id, &wrapped).await?;
        debug!(org_id = %org_id, key_version, "Unwrapped DEK via KMS");

        self.dek_cache.insert(
            org_id.as_uuid(),
            CachedDek {
                key: dek.clone(),
                key_version,
                expires_at: Instant::now() + self.cache_ttl,
            },
        );

        Ok((dek, key_version))
    }
}

/// Deterministic AAD reconstruction; never stored in the blob
fn aad_for(org_id: OrgId, context: &str) -> String {
    format!("org:{org_id}:{context}")
}

/// Split a blob into nonce and ciphertext, honoring the version byte.
/// Blobs not starting with the current version byte are parsed as the
/// legacy version-0 layout.
fn split_blob(blob: &[u8]) -> AppResult<(&[u8], &[u8])> {
    let body = if blob.first() == Some(&BLOB_VERSION) && blob.len() >= 1 + NONCE_LEN + TAG_LEN {
        &blob[1..]
    } else if blob.len() >= NONCE_LEN + TAG_LEN {
        blob
    } else {
        return Err(AppError::authentication_failed(
            "Encrypted blob too short",
        ));
    };

    Ok(body.split_at(NONCE_LEN))
}
