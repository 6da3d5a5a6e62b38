// ABOUTME: Security audit logging for credential encryption and integration lifecycle events
// ABOUTME: Events go to the structured logger immediately and to the database for retention
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Meridian CRM

//! # Security Audit Module
//!
//! Audit trails for the operations operators actually investigate:
//! - credential encryption outcomes (including fallback engagement)
//! - health probe classifications
//! - watch channel lifecycle (created, renewed, failed)
//! - dead-lettered jobs and rejected webhook notifications

use crate::database::Database;
use crate::errors::AppResult;
use crate::models::OrgId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Types of audit events tracked by the integration core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// A credential was encrypted and stored
    CredentialEncrypted,
    /// A credential was decrypted for use
    CredentialDecrypted,
    /// The KMS was unreachable and the fallback cipher was engaged
    FallbackCipherEngaged,
    /// Credential encryption failed outright
    EncryptionFailed,
    /// A queued retry re-attempted credential encryption
    EncryptionRetried,
    /// A fallback-encrypted credential was reconciled back to the KMS path
    FallbackReconciled,
    /// A health probe run finished and was persisted
    HealthProbeCompleted,
    /// A watch channel was registered
    WatchChannelCreated,
    /// A watch channel was renewed
    WatchChannelRenewed,
    /// Watch registration or renewal failed
    WatchChannelFailed,
    /// An inbound webhook notification was rejected
    WebhookRejected,
    /// A job exhausted its attempts and was parked
    JobDeadLettered,
    /// A new organization was bootstrapped with a wrapped DEK
    OrganizationCreated,
}

/// Severity levels for audit events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditSeverity {
    /// Informational event (normal operation)
    Info,
    /// Warning event (potential issue)
    Warning,
    /// Error event (operation failed)
    Error,
    /// Critical event (security incident)
    Critical,
}

impl AuditSeverity {
    /// Storage representation
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

/// Security audit event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique event identifier
    pub event_id: Uuid,
    /// Type of audit event
    pub event_type: AuditEventType,
    /// Severity level
    pub severity: AuditSeverity,
    /// Timestamp of the event
    pub timestamp: DateTime<Utc>,
    /// Organization associated with the event (if applicable)
    pub org_id: Option<OrgId>,
    /// Resource affected (e.g. "`secure_token`:abc", "account:123")
    pub resource: Option<String>,
    /// Action performed (e.g. "encrypt", "probe", "renew")
    pub action: String,
    /// Result of the action ("success", "failure", "rejected")
    pub result: String,
    /// Event description
    pub description: String,
    /// Additional event metadata
    pub metadata: serde_json::Value,
}

impl AuditEvent {
    /// Create a new audit event
    #[must_use]
    pub fn new(
        event_type: AuditEventType,
        severity: AuditSeverity,
        description: String,
        action: String,
        result: String,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            severity,
            timestamp: Utc::now(),
            org_id: None,
            resource: None,
            action,
            result,
            description,
            metadata: serde_json::Value::Null,
        }
    }

    /// Set the organization for the event
    #[must_use]
    pub const fn with_org_id(mut self, org_id: OrgId) -> Self {
        self.org_id = Some(org_id);
        self
    }

    /// Set the affected resource
    #[must_use]
    pub fn with_resource(mut self, resource: String) -> Self {
        self.resource = Some(resource);
        self
    }

    /// Add metadata
    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Audit logger for security events
pub struct SecurityAuditor {
    /// Database connection for storing audit events
    database: Arc<Database>,
}

impl SecurityAuditor {
    /// Create new security auditor
    #[must_use]
    pub const fn new(database: Arc<Database>) -> Self {
        Self { database }
    }

    /// Log an audit event: structured logger first for immediate visibility,
    /// then the database for persistence and analysis.
    ///
    /// # Errors
    ///
    /// Returns an error if the audit event cannot be stored.
    pub async fn log_event(&self, event: AuditEvent) -> AppResult<()> {
        Self::log_to_structured_logger(&event);

        self.database.store_audit_event(&event).await?;
        debug!(event_id = %event.event_id, "Stored audit event in database");

        Ok(())
    }

    /// Log an audit event, swallowing storage failures. Audit persistence
    /// must never fail the operation being audited.
    pub async fn log_event_best_effort(&self, event: AuditEvent) {
        if let Err(e) = self.log_event(event).await {
            error!("Failed to persist audit event: {}", e);
        }
    }

    fn log_to_structured_logger(event: &AuditEvent) {
        match event.severity {
            AuditSeverity::Info => info!(
                event_id = %event.event_id,
                event_type = ?event.event_type,
                org_id = ?event.org_id,
                resource = ?event.resource,
                action = %event.action,
                result = %event.result,
                "Security audit event: {}",
                event.description
            ),
            AuditSeverity::Warning => warn!(
                event_id = %event.event_id,
                event_type = ?event.event_type,
                org_id = ?event.org_id,
                resource = ?event.resource,
                action = %event.action,
                result = %event.result,
                "Security audit warning: {}",
                event.description
            ),
            AuditSeverity::Error | AuditSeverity::Critical => error!(
                event_id = %event.event_id,
                event_type = ?event.event_type,
                org_id = ?event.org_id,
                resource = ?event.resource,
                action = %event.action,
                result = %event.result,
                "Security audit error: {}",
                event.description
            ),
        }
    }

    /// Log a credential encryption outcome
    pub async fn log_encryption_event(
        &self,
        org_id: OrgId,
        token_ref: &str,
        event_type: AuditEventType,
        success: bool,
        details: Option<&str>,
    ) {
        let severity = if success {
            AuditSeverity::Info
        } else {
            AuditSeverity::Error
        };

        let description = match (event_type, success) {
            (AuditEventType::FallbackCipherEngaged, _) => {
                "Credential encrypted via fallback cipher (KMS unavailable)".to_owned()
            }
            (AuditEventType::EncryptionRetried, true) => {
                "Queued retry re-encrypted credential".to_owned()
            }
            (AuditEventType::EncryptionRetried, false) => {
                "Queued retry failed to re-encrypt credential".to_owned()
            }
            (_, true) => "Credential encrypted".to_owned(),
            (_, false) => "Credential encryption failed".to_owned(),
        };

        let mut event = AuditEvent::new(
            event_type,
            severity,
            description,
            "encrypt".to_owned(),
            if success { "success" } else { "failure" }.to_owned(),
        )
        .with_org_id(org_id)
        .with_resource(format!("secure_token:{token_ref}"));

        if let Some(details) = details {
            event = event.with_metadata(serde_json::json!({ "details": details }));
        }

        self.log_event_best_effort(event).await;
    }

    /// Log a health probe classification
    pub async fn log_probe_event(
        &self,
        org_id: OrgId,
        account_id: Uuid,
        status: &str,
        reason: Option<&str>,
    ) {
        let severity = if status == "connected" {
            AuditSeverity::Info
        } else {
            AuditSeverity::Warning
        };

        let event = AuditEvent::new(
            AuditEventType::HealthProbeCompleted,
            severity,
            format!("Health probe classified account as {status}"),
            "probe".to_owned(),
            status.to_owned(),
        )
        .with_org_id(org_id)
        .with_resource(format!("account:{account_id}"))
        .with_metadata(serde_json::json!({ "reason": reason }));

        self.log_event_best_effort(event).await;
    }

    /// Log a watch channel lifecycle event
    pub async fn log_watch_event(
        &self,
        org_id: OrgId,
        account_id: Uuid,
        event_type: AuditEventType,
        success: bool,
        details: Option<&str>,
    ) {
        let severity = if success {
            AuditSeverity::Info
        } else {
            AuditSeverity::Warning
        };

        let description = match event_type {
            AuditEventType::WatchChannelCreated => "Watch channel registered",
            AuditEventType::WatchChannelRenewed => "Watch channel renewed",
            _ => "Watch channel operation failed",
        };

        let mut event = AuditEvent::new(
            event_type,
            severity,
            description.to_owned(),
            "watch".to_owned(),
            if success { "success" } else { "failure" }.to_owned(),
        )
        .with_org_id(org_id)
        .with_resource(format!("account:{account_id}"));

        if let Some(details) = details {
            event = event.with_metadata(serde_json::json!({ "details": details }));
        }

        self.log_event_best_effort(event).await;
    }

    /// Log a dead-lettered job. Dead-letters are a human-visible signal,
    /// never a silent drop.
    pub async fn log_dead_letter(&self, job_id: Uuid, kind: &str, error: &str) {
        let event = AuditEvent::new(
            AuditEventType::JobDeadLettered,
            AuditSeverity::Error,
            format!("Job {job_id} ({kind}) exhausted retries and was dead-lettered"),
            "dead_letter".to_owned(),
            "failure".to_owned(),
        )
        .with_resource(format!("job:{job_id}"))
        .with_metadata(serde_json::json!({ "kind": kind, "error": error }));

        self.log_event_best_effort(event).await;
    }
}
