// ABOUTME: IntegrationAccount database operations (per external account connection)
// ABOUTME: Narrow field-scoped updates so each component owns its own columns
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Meridian CRM

use super::Database;
use crate::errors::{AppError, AppResult};
use crate::models::{AccountStatus, EncryptionStatus, IntegrationAccount, OrgId};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::str::FromStr;
use uuid::Uuid;

impl Database {
    /// Upsert an integration account. This is the saga commit step of the
    /// connect flow: idempotent on (org, provider, email), so a crashed
    /// callback can simply run again.
    ///
    /// # Errors
    ///
    /// Returns an error if the upsert fails.
    pub async fn upsert_integration_account(&self, account: &IntegrationAccount) -> AppResult<()> {
        sqlx::query(
            r"
            INSERT INTO integration_accounts (
                id, org_id, provider, email, status, encryption_status,
                access_token_ref, refresh_token_ref, channel_id,
                channel_resource_id, channel_expiration, watch_renewal_due,
                history_id, error_reason, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ON CONFLICT (org_id, provider, email) DO UPDATE SET
                status = excluded.status,
                encryption_status = excluded.encryption_status,
                access_token_ref = excluded.access_token_ref,
                refresh_token_ref = excluded.refresh_token_ref,
                error_reason = excluded.error_reason,
                updated_at = excluded.updated_at
            ",
        )
        .bind(account.id.to_string())
        .bind(account.org_id.to_string())
        .bind(&account.provider)
        .bind(&account.email)
        .bind(account.status.as_str())
        .bind(account.encryption_status.as_str())
        .bind(account.access_token_ref.as_deref())
        .bind(account.refresh_token_ref.as_deref())
        .bind(account.channel_id.as_deref())
        .bind(account.channel_resource_id.as_deref())
        .bind(account.channel_expiration)
        .bind(account.watch_renewal_due)
        .bind(account.history_id.as_deref())
        .bind(account.error_reason.as_deref())
        .bind(account.created_at)
        .bind(account.updated_at)
        .execute(self.pool())
        .await
        .map_err(|e| AppError::database(format!("Failed to upsert integration account: {e}")))?;

        Ok(())
    }

    /// Get an integration account by ID
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or the row is malformed.
    pub async fn get_integration_account(
        &self,
        account_id: Uuid,
    ) -> AppResult<Option<IntegrationAccount>> {
        let row = sqlx::query(
            r"
            SELECT id, org_id, provider, email, status, encryption_status,
                   access_token_ref, refresh_token_ref, channel_id,
                   channel_resource_id, channel_expiration, watch_renewal_due,
                   history_id, error_reason, created_at, updated_at
            FROM integration_accounts
            WHERE id = $1
            ",
        )
        .bind(account_id.to_string())
        .fetch_optional(self.pool())
        .await
        .map_err(|e| AppError::database(format!("Failed to query integration account: {e}")))?;

        row.map_or_else(|| Ok(None), |row| Ok(Some(row_to_account(&row)?)))
    }

    /// List all integration accounts for an organization
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn list_org_integration_accounts(
        &self,
        org_id: OrgId,
    ) -> AppResult<Vec<IntegrationAccount>> {
        let rows = sqlx::query(
            r"
            SELECT id, org_id, provider, email, status, encryption_status,
                   access_token_ref, refresh_token_ref, channel_id,
                   channel_resource_id, channel_expiration, watch_renewal_due,
                   history_id, error_reason, created_at, updated_at
            FROM integration_accounts
            WHERE org_id = $1
            ORDER BY created_at ASC
            ",
        )
        .bind(org_id.to_string())
        .fetch_all(self.pool())
        .await
        .map_err(|e| AppError::database(format!("Failed to list integration accounts: {e}")))?;

        let mut accounts = Vec::with_capacity(rows.len());
        for row in rows {
            accounts.push(row_to_account(&row)?);
        }
        Ok(accounts)
    }

    /// Write the probe/watch classification onto the account.
    /// Owned by the health probe engine and the watch manager.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn update_account_status(
        &self,
        account_id: Uuid,
        status: AccountStatus,
        error_reason: Option<&str>,
    ) -> AppResult<()> {
        sqlx::query(
            r"
            UPDATE integration_accounts
            SET status = $2, error_reason = $3, updated_at = $4
            WHERE id = $1
            ",
        )
        .bind(account_id.to_string())
        .bind(status.as_str())
        .bind(error_reason)
        .bind(Utc::now())
        .execute(self.pool())
        .await
        .map_err(|e| AppError::database(format!("Failed to update account status: {e}")))?;

        Ok(())
    }

    /// Write the credential encryption state onto the account.
    /// Owned by the retry queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn update_account_encryption_status(
        &self,
        account_id: Uuid,
        encryption_status: EncryptionStatus,
    ) -> AppResult<()> {
        sqlx::query(
            r"
            UPDATE integration_accounts
            SET encryption_status = $2, updated_at = $3
            WHERE id = $1
            ",
        )
        .bind(account_id.to_string())
        .bind(encryption_status.as_str())
        .bind(Utc::now())
        .execute(self.pool())
        .await
        .map_err(|e| {
            AppError::database(format!("Failed to update account encryption status: {e}"))
        })?;

        Ok(())
    }

    /// Persist a fresh watch channel registration and its renewal deadline.
    /// Owned by the watch manager.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn update_account_channel(
        &self,
        account_id: Uuid,
        channel_id: &str,
        resource_id: &str,
        expiration: DateTime<Utc>,
        renewal_due: DateTime<Utc>,
    ) -> AppResult<()> {
        sqlx::query(
            r"
            UPDATE integration_accounts
            SET channel_id = $2,
                channel_resource_id = $3,
                channel_expiration = $4,
                watch_renewal_due = $5,
                updated_at = $6
            WHERE id = $1
            ",
        )
        .bind(account_id.to_string())
        .bind(channel_id)
        .bind(resource_id)
        .bind(expiration)
        .bind(renewal_due)
        .bind(Utc::now())
        .execute(self.pool())
        .await
        .map_err(|e| AppError::database(format!("Failed to update account channel: {e}")))?;

        Ok(())
    }

    /// Update the provider sync cursor
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn update_account_history_id(
        &self,
        account_id: Uuid,
        history_id: &str,
    ) -> AppResult<()> {
        sqlx::query(
            r"
            UPDATE integration_accounts
            SET history_id = $2, updated_at = $3
            WHERE id = $1
            ",
        )
        .bind(account_id.to_string())
        .bind(history_id)
        .bind(Utc::now())
        .execute(self.pool())
        .await
        .map_err(|e| AppError::database(format!("Failed to update history id: {e}")))?;

        Ok(())
    }

    /// List accounts whose persisted renewal deadline has passed.
    /// The renewal sweep turns each of these into a webhook-renewal job.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn list_accounts_watch_due(
        &self,
        now: DateTime<Utc>,
    ) -> AppResult<Vec<IntegrationAccount>> {
        let rows = sqlx::query(
            r"
            SELECT id, org_id, provider, email, status, encryption_status,
                   access_token_ref, refresh_token_ref, channel_id,
                   channel_resource_id, channel_expiration, watch_renewal_due,
                   history_id, error_reason, created_at, updated_at
            FROM integration_accounts
            WHERE watch_renewal_due IS NOT NULL AND watch_renewal_due <= $1
            ORDER BY watch_renewal_due ASC
            ",
        )
        .bind(now)
        .fetch_all(self.pool())
        .await
        .map_err(|e| AppError::database(format!("Failed to list renewal-due accounts: {e}")))?;

        let mut accounts = Vec::with_capacity(rows.len());
        for row in rows {
            accounts.push(row_to_account(&row)?);
        }
        Ok(accounts)
    }

    /// Clear the renewal deadline once a renewal job has been enqueued, so the
    /// sweep enqueues exactly one job per due account.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn clear_account_watch_due(&self, account_id: Uuid) -> AppResult<()> {
        sqlx::query(
            r"
            UPDATE integration_accounts
            SET watch_renewal_due = NULL, updated_at = $2
            WHERE id = $1
            ",
        )
        .bind(account_id.to_string())
        .bind(Utc::now())
        .execute(self.pool())
        .await
        .map_err(|e| AppError::database(format!("Failed to clear renewal deadline: {e}")))?;

        Ok(())
    }
}

/// Convert a database row to an `IntegrationAccount`
fn row_to_account(row: &SqliteRow) -> AppResult<IntegrationAccount> {
    let id_str: String = row.get("id");
    let org_id_str: String = row.get("org_id");
    let status_str: String = row.get("status");
    let enc_status_str: String = row.get("encryption_status");

    Ok(IntegrationAccount {
        id: Uuid::parse_str(&id_str)?,
        org_id: OrgId::from_str(&org_id_str)?,
        provider: row.get("provider"),
        email: row.get("email"),
        status: AccountStatus::from_str_value(&status_str)
            .ok_or_else(|| AppError::database(format!("Invalid account status: {status_str}")))?,
        encryption_status: EncryptionStatus::from_str_value(&enc_status_str).ok_or_else(|| {
            AppError::database(format!("Invalid encryption status: {enc_status_str}"))
        })?,
        access_token_ref: row.get("access_token_ref"),
        refresh_token_ref: row.get("refresh_token_ref"),
        channel_id: row.get("channel_id"),
        channel_resource_id: row.get("channel_resource_id"),
        channel_expiration: row.get("channel_expiration"),
        watch_renewal_due: row.get("watch_renewal_due"),
        history_id: row.get("history_id"),
        error_reason: row.get("error_reason"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}
