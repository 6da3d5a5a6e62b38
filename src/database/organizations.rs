// ABOUTME: Organization (tenant) database operations and wrapped DEK storage
// ABOUTME: Every tenant blob decrypts through the DEK wrapped in this table
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Meridian CRM

use super::Database;
use crate::errors::{AppError, AppResult};
use crate::models::{OrgId, Organization};
use chrono::{DateTime, Utc};
use sqlx::Row;
use std::str::FromStr;

impl Database {
    /// Create an organization row with its wrapped DEK
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails (including duplicate IDs).
    pub async fn create_organization(&self, org: &Organization) -> AppResult<()> {
        sqlx::query(
            r"
            INSERT INTO organizations (id, name, encrypted_dek_blob, dek_version, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ",
        )
        .bind(org.id.to_string())
        .bind(&org.name)
        .bind(&org.encrypted_dek_blob)
        .bind(i64::from(org.dek_version))
        .bind(org.created_at)
        .execute(self.pool())
        .await
        .map_err(|e| AppError::database(format!("Failed to create organization: {e}")))?;

        Ok(())
    }

    /// Get an organization by ID
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or the row is malformed.
    pub async fn get_organization(&self, org_id: OrgId) -> AppResult<Option<Organization>> {
        let row = sqlx::query(
            r"
            SELECT id, name, encrypted_dek_blob, dek_version, created_at
            FROM organizations
            WHERE id = $1
            ",
        )
        .bind(org_id.to_string())
        .fetch_optional(self.pool())
        .await
        .map_err(|e| AppError::database(format!("Failed to query organization: {e}")))?;

        row.map_or_else(
            || Ok(None),
            |row| {
                let id_str: String = row.get("id");
                let dek_version: i64 = row.get("dek_version");
                let created_at: DateTime<Utc> = row.get("created_at");
                Ok(Some(Organization {
                    id: OrgId::from_str(&id_str)?,
                    name: row.get("name"),
                    encrypted_dek_blob: row.get("encrypted_dek_blob"),
                    dek_version: u32::try_from(dek_version)
                        .map_err(|e| AppError::database(format!("Invalid DEK version: {e}")))?,
                    created_at,
                }))
            },
        )
    }

    /// Fetch the wrapped DEK blob and its version for an organization
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the organization does not exist.
    pub async fn get_org_wrapped_dek(&self, org_id: OrgId) -> AppResult<(Vec<u8>, u32)> {
        let org = self
            .get_organization(org_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("organization {org_id}")))?;

        Ok((org.encrypted_dek_blob, org.dek_version))
    }
}
