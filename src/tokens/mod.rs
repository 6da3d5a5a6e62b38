// ABOUTME: Secure token store persisting encrypted OAuth credentials behind opaque refs
// ABOUTME: Envelope-first with fallback on KMS outage; failures become status fields
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Meridian CRM

//! # Secure Token Store
//!
//! Persists encrypted OAuth credentials keyed by opaque token references.
//! Consumers pass `token_ref` strings around; raw secrets never cross layer
//! boundaries.
//!
//! Encryption attempt order is envelope engine first, fallback cipher on
//! `KmsUnavailable`. Only a hard authentication-class failure is treated as a
//! true failure — and even then the row is persisted with
//! `encryption_status = failed` and a structured KMS error, so callers never
//! special-case a missing record. Crypto errors are converted into persisted
//! status at this boundary; they do not propagate further up.

use crate::crypto::{EnvelopeCrypto, FallbackCipher};
use crate::database::Database;
use crate::errors::{AppError, AppResult};
use crate::models::{
    EncryptionMethod, EncryptionStatus, OrgId, SecureToken, SecureTokenInfo, TokenData, TokenType,
};
use crate::security::audit::{AuditEventType, SecurityAuditor};
use chrono::{DateTime, Utc};
use rand::RngCore;
use std::sync::Arc;
use tracing::{info, warn};

/// Key version recorded on fallback rows, which are not under any org DEK
const FALLBACK_KEY_VERSION: u32 = 0;

/// Secure token store
pub struct SecureTokenStore {
    database: Arc<Database>,
    crypto: Arc<EnvelopeCrypto>,
    fallback: Arc<FallbackCipher>,
    auditor: Arc<SecurityAuditor>,
}

/// Outcome of one encryption attempt through the two-engine order
enum EncryptOutcome {
    /// Blob produced, with the engine that produced it
    Encrypted(Vec<u8>, EncryptionMethod, u32),
    /// Hard failure (not availability); carries the typed error
    Failed(AppError),
}

impl SecureTokenStore {
    /// Create a new store
    #[must_use]
    pub const fn new(
        database: Arc<Database>,
        crypto: Arc<EnvelopeCrypto>,
        fallback: Arc<FallbackCipher>,
        auditor: Arc<SecurityAuditor>,
    ) -> Self {
        Self {
            database,
            crypto,
            fallback,
            auditor,
        }
    }

    /// Store every credential present in `tokens` for the organization.
    /// A row is persisted per credential whether or not encryption succeeded;
    /// the returned summaries carry the per-token outcome.
    ///
    /// # Errors
    ///
    /// Returns an error only when persistence itself fails. Encryption
    /// failures are recorded as row status, not errors.
    pub async fn store_tokens(
        &self,
        org_id: OrgId,
        provider: &str,
        tokens: &TokenData,
        external_account_id: Option<&str>,
    ) -> AppResult<Vec<SecureTokenInfo>> {
        let mut infos = Vec::with_capacity(2);

        if let Some(access) = tokens.access_token.as_deref() {
            infos.push(
                self.store_one(
                    org_id,
                    provider,
                    TokenType::Access,
                    access,
                    tokens.expires_at,
                    external_account_id,
                )
                .await?,
            );
        }

        if let Some(refresh) = tokens.refresh_token.as_deref() {
            infos.push(
                self.store_one(
                    org_id,
                    provider,
                    TokenType::Refresh,
                    refresh,
                    None,
                    external_account_id,
                )
                .await?,
            );
        }

        Ok(infos)
    }

    /// Reconstruct plaintext credentials from token references. References
    /// whose rows are missing or not `ok` are silently skipped; callers treat
    /// absent fields as "not yet available", never as an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the database fails or an `ok` blob fails to
    /// decrypt (corrupt data).
    pub async fn get_tokens(&self, token_refs: &[String]) -> AppResult<TokenData> {
        let mut data = TokenData::default();

        for token_ref in token_refs {
            let Some(row) = self.database.get_secure_token(token_ref).await? else {
                continue;
            };
            if row.encryption_status != EncryptionStatus::Ok {
                continue;
            }
            let Some(blob) = row.encrypted_blob.as_deref() else {
                continue;
            };

            let plaintext = self.decrypt_row(&row, blob).await?;
            match row.token_type {
                TokenType::Access => {
                    data.expires_at = row.expires_at;
                    data.access_token = Some(plaintext);
                }
                TokenType::Refresh => data.refresh_token = Some(plaintext),
            }
        }

        Ok(data)
    }

    /// Re-attempt encryption of a failed token row. Idempotent against rows
    /// already `ok`: returns `false` without touching the stored blob.
    /// Retry bookkeeping is bumped on both success and failure paths.
    ///
    /// # Errors
    ///
    /// Returns the typed encryption error when the re-attempt fails; the
    /// failure is recorded on the row before the error propagates to the
    /// queue's retry mechanism.
    pub async fn retry_encryption(&self, token_ref: &str, plaintext: &str) -> AppResult<bool> {
        let row = self
            .database
            .get_secure_token(token_ref)
            .await?
            .ok_or_else(|| AppError::not_found(format!("secure token {token_ref}")))?;

        if row.encryption_status == EncryptionStatus::Ok {
            return Ok(false);
        }

        let context = credential_context(&row.provider, row.token_type);
        let outcome = self.encrypt_ordered(row.org_id, plaintext, &context).await?;

        match outcome {
            EncryptOutcome::Encrypted(blob, method, key_version) => {
                self.database
                    .update_token_encryption_success(token_ref, &blob, method, key_version)
                    .await?;
                self.database.increment_token_retry(token_ref).await?;
                self.auditor
                    .log_encryption_event(
                        row.org_id,
                        token_ref,
                        AuditEventType::EncryptionRetried,
                        true,
                        Some(method.as_str()),
                    )
                    .await;
                Ok(true)
            }
            EncryptOutcome::Failed(error) => {
                self.database
                    .mark_token_encryption_failed(token_ref, error.code())
                    .await?;
                self.database.increment_token_retry(token_ref).await?;
                self.auditor
                    .log_encryption_event(
                        row.org_id,
                        token_ref,
                        AuditEventType::EncryptionRetried,
                        false,
                        Some(error.code()),
                    )
                    .await;
                Err(error)
            }
        }
    }

    /// Replace the blob of an `ok` token after an OAuth refresh (ok → ok)
    ///
    /// # Errors
    ///
    /// Returns an error if the row does not exist or persistence fails.
    /// An encryption failure downgrades the row to `failed` exactly like the
    /// store path.
    pub async fn refresh_token(
        &self,
        token_ref: &str,
        plaintext: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> AppResult<()> {
        let row = self
            .database
            .get_secure_token(token_ref)
            .await?
            .ok_or_else(|| AppError::not_found(format!("secure token {token_ref}")))?;

        let context = credential_context(&row.provider, row.token_type);
        let outcome = self.encrypt_ordered(row.org_id, plaintext, &context).await?;

        match outcome {
            EncryptOutcome::Encrypted(blob, method, key_version) => {
                self.database
                    .update_token_encryption_success(token_ref, &blob, method, key_version)
                    .await?;
                self.database
                    .update_token_expiry(token_ref, expires_at)
                    .await?;
                Ok(())
            }
            EncryptOutcome::Failed(error) => {
                self.database
                    .mark_token_encryption_failed(token_ref, error.code())
                    .await?;
                Err(error)
            }
        }
    }

    /// Re-encrypt fallback rows through the envelope engine. Stops early if
    /// the KMS is still unavailable. Returns the number reconciled.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails mid-sweep.
    pub async fn reconcile_fallback_tokens(&self, batch: u32) -> AppResult<u32> {
        let rows = self.database.list_fallback_tokens(batch).await?;
        let mut reconciled = 0u32;

        for row in rows {
            let Some(blob) = row.encrypted_blob.as_deref() else {
                continue;
            };
            let plaintext = self.fallback.decrypt(blob)?;
            let context = credential_context(&row.provider, row.token_type);

            match self.crypto.encrypt(row.org_id, &plaintext, &context).await {
                Ok(new_blob) => {
                    let key_version = self.crypto.current_key_version(row.org_id).await?;
                    self.database
                        .update_token_encryption_success(
                            &row.token_ref,
                            &new_blob,
                            EncryptionMethod::Kms,
                            key_version,
                        )
                        .await?;
                    self.auditor
                        .log_encryption_event(
                            row.org_id,
                            &row.token_ref,
                            AuditEventType::FallbackReconciled,
                            true,
                            None,
                        )
                        .await;
                    reconciled += 1;
                }
                Err(e) if e.is_kms_unavailable() => {
                    info!("Reconciliation paused: KMS still unavailable");
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        if reconciled > 0 {
            info!(reconciled, "Reconciled fallback-encrypted tokens to KMS path");
        }
        Ok(reconciled)
    }

    /// Store one credential: mint the reference first so a row exists even
    /// when encryption subsequently fails.
    async fn store_one(
        &self,
        org_id: OrgId,
        provider: &str,
        token_type: TokenType,
        plaintext: &str,
        expires_at: Option<DateTime<Utc>>,
        external_account_id: Option<&str>,
    ) -> AppResult<SecureTokenInfo> {
        let token_ref = generate_token_ref(org_id, provider, token_type);
        let context = credential_context(provider, token_type);
        let now = Utc::now();

        let outcome = self.encrypt_ordered(org_id, plaintext, &context).await?;

        let (row, info) = match outcome {
            EncryptOutcome::Encrypted(blob, method, key_version) => {
                let event_type = match method {
                    EncryptionMethod::Kms => AuditEventType::CredentialEncrypted,
                    EncryptionMethod::Fallback => AuditEventType::FallbackCipherEngaged,
                };
                self.auditor
                    .log_encryption_event(org_id, &token_ref, event_type, true, None)
                    .await;

                let row = SecureToken {
                    token_ref: token_ref.clone(),
                    org_id,
                    provider: provider.to_owned(),
                    token_type,
                    encrypted_blob: Some(blob),
                    encryption_status: EncryptionStatus::Ok,
                    encryption_method: Some(method),
                    key_version,
                    kms_error_code: None,
                    kms_error_at: None,
                    retry_count: 0,
                    last_retry_at: None,
                    expires_at,
                    external_account_id: external_account_id.map(str::to_owned),
                    created_at: now,
                    updated_at: now,
                };
                let info = SecureTokenInfo {
                    token_ref,
                    token_type,
                    encryption_status: EncryptionStatus::Ok,
                    encryption_method: Some(method),
                };
                (row, info)
            }
            EncryptOutcome::Failed(error) => {
                warn!(
                    org_id = %org_id,
                    token_ref = %token_ref,
                    error_code = error.code(),
                    "Credential encryption failed; persisting failed row for retry queue"
                );
                self.auditor
                    .log_encryption_event(
                        org_id,
                        &token_ref,
                        AuditEventType::EncryptionFailed,
                        false,
                        Some(error.code()),
                    )
                    .await;

                let row = SecureToken {
                    token_ref: token_ref.clone(),
                    org_id,
                    provider: provider.to_owned(),
                    token_type,
                    encrypted_blob: None,
                    encryption_status: EncryptionStatus::Failed,
                    encryption_method: None,
                    key_version: FALLBACK_KEY_VERSION,
                    kms_error_code: Some(error.code().to_owned()),
                    kms_error_at: Some(now),
                    retry_count: 0,
                    last_retry_at: None,
                    expires_at,
                    external_account_id: external_account_id.map(str::to_owned),
                    created_at: now,
                    updated_at: now,
                };
                let info = SecureTokenInfo {
                    token_ref,
                    token_type,
                    encryption_status: EncryptionStatus::Failed,
                    encryption_method: None,
                };
                (row, info)
            }
        };

        self.database.insert_secure_token(&row).await?;
        Ok(info)
    }

    /// Envelope engine first; fallback cipher only on availability failures.
    /// Hard failures come back as `EncryptOutcome::Failed` so callers persist
    /// them rather than throwing.
    async fn encrypt_ordered(
        &self,
        org_id: OrgId,
        plaintext: &str,
        context: &str,
    ) -> AppResult<EncryptOutcome> {
        match self.crypto.encrypt(org_id, plaintext.as_bytes(), context).await {
            Ok(blob) => {
                let key_version = self.crypto.current_key_version(org_id).await?;
                Ok(EncryptOutcome::Encrypted(
                    blob,
                    EncryptionMethod::Kms,
                    key_version,
                ))
            }
            Err(e) if e.is_kms_unavailable() => {
                warn!(org_id = %org_id, "KMS unavailable; engaging fallback cipher");
                match self.fallback.encrypt(plaintext.as_bytes()) {
                    Ok(blob) => Ok(EncryptOutcome::Encrypted(
                        blob,
                        EncryptionMethod::Fallback,
                        FALLBACK_KEY_VERSION,
                    )),
                    Err(fallback_err) => Ok(EncryptOutcome::Failed(fallback_err)),
                }
            }
            Err(e) => Ok(EncryptOutcome::Failed(e)),
        }
    }

    /// Decrypt a row's blob through the engine that produced it
    async fn decrypt_row(&self, row: &SecureToken, blob: &[u8]) -> AppResult<String> {
        let plaintext = match row.encryption_method {
            Some(EncryptionMethod::Fallback) => self.fallback.decrypt(blob)?,
            _ => {
                let context = credential_context(&row.provider, row.token_type);
                self.crypto.decrypt(row.org_id, blob, &context).await?
            }
        };

        String::from_utf8(plaintext)
            .map_err(|e| AppError::internal(format!("Decrypted credential is not UTF-8: {e}")))
    }
}

/// AAD context for a credential field; part of the schema, never change it
/// for an existing field without a migration
#[must_use]
pub fn credential_context(provider: &str, token_type: TokenType) -> String {
    format!("oauth:{provider}:{}", token_type.as_str())
}

/// Mint an opaque, collision-resistant token reference.
/// Generated before encryption so a reference can be recorded even if
/// encryption subsequently fails; never reused.
#[must_use]
pub fn generate_token_ref(org_id: OrgId, provider: &str, token_type: TokenType) -> String {
    let mut suffix = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut suffix);
    format!(
        "st_{}_{provider}_{}_{}_{}",
        org_id.as_uuid().simple(),
        token_type.as_str(),
        Utc::now().timestamp_millis(),
        hex::encode(suffix)
    )
}
