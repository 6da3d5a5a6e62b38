// ABOUTME: Job records, payloads, and the per-job state machine for the retry queue
// ABOUTME: Payloads carry idempotency-friendly identifiers only, never credentials
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Meridian CRM

use crate::constants::{queues, retry};
use crate::models::OrgId;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Job kinds consumed by the worker pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    /// Re-attempt credential encryption for a failed token row
    EncryptToken,
    /// Bootstrap initial data sync after encryption succeeded
    StartSync,
    /// Run a health probe for one account
    HealthProbe,
    /// Renew a watch channel ahead of expiry
    WebhookRenewal,
}

impl JobKind {
    /// Storage representation
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::EncryptToken => "encrypt-token",
            Self::StartSync => "start-sync",
            Self::HealthProbe => "health-probe",
            Self::WebhookRenewal => "webhook-renewal",
        }
    }

    /// Parse the storage representation
    #[must_use]
    pub fn from_str_value(s: &str) -> Option<Self> {
        match s {
            "encrypt-token" => Some(Self::EncryptToken),
            "start-sync" => Some(Self::StartSync),
            "health-probe" => Some(Self::HealthProbe),
            "webhook-renewal" => Some(Self::WebhookRenewal),
            _ => None,
        }
    }

    /// Named queue this kind is consumed from
    #[must_use]
    pub const fn queue(&self) -> &'static str {
        match self {
            Self::EncryptToken => queues::TOKEN_ENCRYPTION,
            Self::StartSync => queues::SYNC_INIT,
            Self::HealthProbe => queues::HEALTH_PROBE,
            Self::WebhookRenewal => queues::WEBHOOK_RENEWAL,
        }
    }

    /// Retry policy: (max attempts, base backoff in milliseconds)
    #[must_use]
    pub const fn retry_policy(&self) -> (u32, u64) {
        match self {
            Self::EncryptToken => (
                retry::TOKEN_ENCRYPTION_MAX_ATTEMPTS,
                retry::TOKEN_ENCRYPTION_BACKOFF_MS,
            ),
            Self::StartSync => (retry::SYNC_MAX_ATTEMPTS, retry::SYNC_BACKOFF_MS),
            Self::HealthProbe | Self::WebhookRenewal => (retry::SINGLE_ATTEMPT, 0),
        }
    }
}

/// State machine per job:
/// `waiting → active → (completed | waiting[retry-scheduled] | dead_letter)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Eligible to be claimed once `run_at` has passed
    Waiting,
    /// Claimed by a worker
    Active,
    /// Terminal success
    Completed,
    /// Terminal failure after exhausting attempts; parked for inspection
    DeadLetter,
}

impl JobStatus {
    /// Storage representation
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::DeadLetter => "dead_letter",
        }
    }

    /// Parse the storage representation
    #[must_use]
    pub fn from_str_value(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(Self::Waiting),
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            "dead_letter" => Some(Self::DeadLetter),
            _ => None,
        }
    }
}

/// Durable job row
#[derive(Debug, Clone)]
pub struct JobRecord {
    /// Job identifier
    pub id: Uuid,
    /// Named queue
    pub queue: String,
    /// Job kind
    pub kind: JobKind,
    /// JSON payload (one of the payload structs below)
    pub payload: serde_json::Value,
    /// Current state
    pub status: JobStatus,
    /// Attempts consumed so far
    pub attempts: u32,
    /// Attempts allowed before dead-lettering
    pub max_attempts: u32,
    /// Base backoff in milliseconds (doubled per attempt)
    pub backoff_base_ms: u64,
    /// Earliest execution time
    pub run_at: DateTime<Utc>,
    /// Message from the most recent failure
    pub last_error: Option<String>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last transition timestamp
    pub updated_at: DateTime<Utc>,
    /// Terminal transition timestamp
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// Exponential backoff delay for the next retry after `attempts` tries
    #[must_use]
    pub fn backoff_delay(&self) -> Duration {
        let exp = self.attempts.saturating_sub(1).min(16);
        let ms = self.backoff_base_ms.saturating_mul(1u64 << exp);
        Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX))
    }
}

/// Payload of an encrypt-token job. Duplicate delivery is safe: token retry
/// is idempotent by construction in the token store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenEncryptionPayload {
    /// Owning organization
    pub org_id: OrgId,
    /// Integration account the credential belongs to
    pub account_id: Uuid,
    /// Credential reference to retry
    pub token_ref: String,
    /// OAuth provider
    pub provider: String,
    /// Provider-side account identifier
    pub external_account_id: Option<String>,
    /// Credential material sealed under the fallback cipher (base64), carried
    /// so the retry worker can re-attempt encryption of a failed row. Never
    /// plaintext. Absent when the failed row's material could not be sealed;
    /// such jobs can only exhaust their attempts and dead-letter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sealed_credential: Option<String>,
}

/// Payload of a start-sync job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitialSyncPayload {
    /// Owning organization
    pub org_id: OrgId,
    /// Integration account to sync
    pub account_id: Uuid,
    /// OAuth provider
    pub provider: String,
}

/// Payload of a health-probe job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthProbePayload {
    /// Account to probe
    pub account_id: Uuid,
}

/// Payload of a webhook-renewal job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookRenewalPayload {
    /// Account whose channel is renewed
    pub account_id: Uuid,
}
