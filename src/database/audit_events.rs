// ABOUTME: Audit event persistence for compliance and security investigation
// ABOUTME: Append-only table queried by operators, never mutated
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Meridian CRM

use super::Database;
use crate::errors::{AppError, AppResult};
use crate::models::OrgId;
use crate::security::audit::AuditEvent;
use sqlx::Row;

impl Database {
    /// Append an audit event
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn store_audit_event(&self, event: &AuditEvent) -> AppResult<()> {
        let event_type = serde_json::to_string(&event.event_type)?;

        sqlx::query(
            r"
            INSERT INTO audit_events (
                event_id, event_type, severity, timestamp, org_id,
                resource, action, result, description, metadata
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ",
        )
        .bind(event.event_id.to_string())
        .bind(event_type.trim_matches('"'))
        .bind(event.severity.as_str())
        .bind(event.timestamp)
        .bind(event.org_id.map(|o| o.to_string()))
        .bind(event.resource.as_deref())
        .bind(&event.action)
        .bind(&event.result)
        .bind(&event.description)
        .bind(event.metadata.to_string())
        .execute(self.pool())
        .await
        .map_err(|e| AppError::database(format!("Failed to store audit event: {e}")))?;

        Ok(())
    }

    /// Count audit events of a given type for an organization (operator and
    /// test visibility)
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn count_audit_events(&self, org_id: OrgId, event_type: &str) -> AppResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM audit_events WHERE org_id = $1 AND event_type = $2",
        )
        .bind(org_id.to_string())
        .bind(event_type)
        .fetch_one(self.pool())
        .await
        .map_err(|e| AppError::database(format!("Failed to count audit events: {e}")))?;

        Ok(count)
    }

    /// List the most recent audit event descriptions for an organization
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn list_recent_audit_events(
        &self,
        org_id: OrgId,
        limit: u32,
    ) -> AppResult<Vec<(String, String, String)>> {
        let rows = sqlx::query(
            r"
            SELECT event_type, result, description
            FROM audit_events
            WHERE org_id = $1
            ORDER BY timestamp DESC
            LIMIT $2
            ",
        )
        .bind(org_id.to_string())
        .bind(i64::from(limit))
        .fetch_all(self.pool())
        .await
        .map_err(|e| AppError::database(format!("Failed to list audit events: {e}")))?;

        Ok(rows
            .into_iter()
            .map(|row| {
                (
                    row.get("event_type"),
                    row.get("result"),
                    row.get("description"),
                )
            })
            .collect())
    }
}
