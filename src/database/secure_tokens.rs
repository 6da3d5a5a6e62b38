// ABOUTME: SecureToken database operations for encrypted OAuth credential rows
// ABOUTME: The row always exists; encryption state lives in status columns
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Meridian CRM

use super::Database;
use crate::errors::{AppError, AppResult};
use crate::models::{EncryptionMethod, EncryptionStatus, OrgId, SecureToken, TokenType};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::str::FromStr;

impl Database {
    /// Insert a secure token row. Called exactly once per `token_ref`; the row
    /// is created whether or not encryption succeeded, so callers never need
    /// to special-case a missing record.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn insert_secure_token(&self, token: &SecureToken) -> AppResult<()> {
        sqlx::query(
            r"
            INSERT INTO secure_tokens (
                token_ref, org_id, provider, token_type, encrypted_blob,
                encryption_status, encryption_method, key_version,
                kms_error_code, kms_error_at, retry_count, last_retry_at,
                expires_at, external_account_id, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ",
        )
        .bind(&token.token_ref)
        .bind(token.org_id.to_string())
        .bind(&token.provider)
        .bind(token.token_type.as_str())
        .bind(token.encrypted_blob.as_deref())
        .bind(token.encryption_status.as_str())
        .bind(token.encryption_method.map(|m| m.as_str()))
        .bind(i64::from(token.key_version))
        .bind(token.kms_error_code.as_deref())
        .bind(token.kms_error_at)
        .bind(i64::from(token.retry_count))
        .bind(token.last_retry_at)
        .bind(token.expires_at)
        .bind(token.external_account_id.as_deref())
        .bind(token.created_at)
        .bind(token.updated_at)
        .execute(self.pool())
        .await
        .map_err(|e| AppError::database(format!("Failed to insert secure token: {e}")))?;

        Ok(())
    }

    /// Get a secure token row by reference
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or the row is malformed.
    pub async fn get_secure_token(&self, token_ref: &str) -> AppResult<Option<SecureToken>> {
        let row = sqlx::query(
            r"
            SELECT token_ref, org_id, provider, token_type, encrypted_blob,
                   encryption_status, encryption_method, key_version,
                   kms_error_code, kms_error_at, retry_count, last_retry_at,
                   expires_at, external_account_id, created_at, updated_at
            FROM secure_tokens
            WHERE token_ref = $1
            ",
        )
        .bind(token_ref)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| AppError::database(format!("Failed to query secure token: {e}")))?;

        row.map_or_else(|| Ok(None), |row| Ok(Some(row_to_secure_token(&row)?)))
    }

    /// Record a successful (re-)encryption: blob present, status `ok`
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn update_token_encryption_success(
        &self,
        token_ref: &str,
        blob: &[u8],
        method: EncryptionMethod,
        key_version: u32,
    ) -> AppResult<()> {
        sqlx::query(
            r"
            UPDATE secure_tokens
            SET encrypted_blob = $2,
                encryption_status = 'ok',
                encryption_method = $3,
                key_version = $4,
                kms_error_code = NULL,
                kms_error_at = NULL,
                updated_at = $5
            WHERE token_ref = $1
            ",
        )
        .bind(token_ref)
        .bind(blob)
        .bind(method.as_str())
        .bind(i64::from(key_version))
        .bind(Utc::now())
        .execute(self.pool())
        .await
        .map_err(|e| AppError::database(format!("Failed to update secure token: {e}")))?;

        Ok(())
    }

    /// Record a failed encryption attempt with its structured KMS error
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn mark_token_encryption_failed(
        &self,
        token_ref: &str,
        error_code: &str,
    ) -> AppResult<()> {
        let now = Utc::now();
        sqlx::query(
            r"
            UPDATE secure_tokens
            SET encrypted_blob = NULL,
                encryption_status = 'failed',
                encryption_method = NULL,
                kms_error_code = $2,
                kms_error_at = $3,
                updated_at = $3
            WHERE token_ref = $1
            ",
        )
        .bind(token_ref)
        .bind(error_code)
        .bind(now)
        .execute(self.pool())
        .await
        .map_err(|e| AppError::database(format!("Failed to mark token failed: {e}")))?;

        Ok(())
    }

    /// Bump the retry bookkeeping so operators can see staleness. Recorded on
    /// both success and failure paths of a retry attempt.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn increment_token_retry(&self, token_ref: &str) -> AppResult<()> {
        sqlx::query(
            r"
            UPDATE secure_tokens
            SET retry_count = retry_count + 1,
                last_retry_at = $2,
                updated_at = $2
            WHERE token_ref = $1
            ",
        )
        .bind(token_ref)
        .bind(Utc::now())
        .execute(self.pool())
        .await
        .map_err(|e| AppError::database(format!("Failed to increment token retry: {e}")))?;

        Ok(())
    }

    /// Update credential expiry tracking (token refresh path)
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn update_token_expiry(
        &self,
        token_ref: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> AppResult<()> {
        sqlx::query(
            r"
            UPDATE secure_tokens
            SET expires_at = $2, updated_at = $3
            WHERE token_ref = $1
            ",
        )
        .bind(token_ref)
        .bind(expires_at)
        .bind(Utc::now())
        .execute(self.pool())
        .await
        .map_err(|e| AppError::database(format!("Failed to update token expiry: {e}")))?;

        Ok(())
    }

    /// List `ok` rows still encrypted under the fallback cipher, oldest first.
    /// Feeds the reconciliation sweep.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn list_fallback_tokens(&self, limit: u32) -> AppResult<Vec<SecureToken>> {
        let rows = sqlx::query(
            r"
            SELECT token_ref, org_id, provider, token_type, encrypted_blob,
                   encryption_status, encryption_method, key_version,
                   kms_error_code, kms_error_at, retry_count, last_retry_at,
                   expires_at, external_account_id, created_at, updated_at
            FROM secure_tokens
            WHERE encryption_status = 'ok' AND encryption_method = 'fallback'
            ORDER BY updated_at ASC
            LIMIT $1
            ",
        )
        .bind(i64::from(limit))
        .fetch_all(self.pool())
        .await
        .map_err(|e| AppError::database(format!("Failed to list fallback tokens: {e}")))?;

        let mut tokens = Vec::with_capacity(rows.len());
        for row in rows {
            tokens.push(row_to_secure_token(&row)?);
        }
        Ok(tokens)
    }

    /// Delete all secure tokens for an organization (tenant offboarding only)
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub async fn delete_org_secure_tokens(&self, org_id: OrgId) -> AppResult<u64> {
        let result = sqlx::query("DELETE FROM secure_tokens WHERE org_id = $1")
            .bind(org_id.to_string())
            .execute(self.pool())
            .await
            .map_err(|e| AppError::database(format!("Failed to delete org tokens: {e}")))?;

        Ok(result.rows_affected())
    }
}

/// Convert a database row to a `SecureToken`
fn row_to_secure_token(row: &SqliteRow) -> AppResult<SecureToken> {
    let org_id_str: String = row.get("org_id");
    let token_type_str: String = row.get("token_type");
    let status_str: String = row.get("encryption_status");
    let method_str: Option<String> = row.get("encryption_method");
    let key_version: i64 = row.get("key_version");
    let retry_count: i64 = row.get("retry_count");

    Ok(SecureToken {
        token_ref: row.get("token_ref"),
        org_id: OrgId::from_str(&org_id_str)?,
        provider: row.get("provider"),
        token_type: TokenType::from_str_value(&token_type_str)
            .ok_or_else(|| AppError::database(format!("Invalid token type: {token_type_str}")))?,
        encrypted_blob: row.get("encrypted_blob"),
        encryption_status: EncryptionStatus::from_str_value(&status_str).ok_or_else(|| {
            AppError::database(format!("Invalid encryption status: {status_str}"))
        })?,
        encryption_method: method_str.as_deref().and_then(EncryptionMethod::from_str_value),
        key_version: u32::try_from(key_version)
            .map_err(|e| AppError::database(format!("Invalid key version: {e}")))?,
        kms_error_code: row.get("kms_error_code"),
        kms_error_at: row.get("kms_error_at"),
        retry_count: u32::try_from(retry_count)
            .map_err(|e| AppError::database(format!("Invalid retry count: {e}")))?,
        last_retry_at: row.get("last_retry_at"),
        expires_at: row.get("expires_at"),
        external_account_id: row.get("external_account_id"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}
