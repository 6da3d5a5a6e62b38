// ABOUTME: Core domain models for organizations, secure tokens, and integration accounts
// ABOUTME: Enum columns round-trip through as_str/from_str_value for storage
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Meridian CRM

//! Common data models for the secure integration lifecycle core

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Organization (tenant) identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrgId(Uuid);

impl OrgId {
    /// Generate a new random organization ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Underlying UUID
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for OrgId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OrgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for OrgId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Organization (tenant) row: owns one wrapped data-encryption key
#[derive(Debug, Clone)]
pub struct Organization {
    /// Organization identifier
    pub id: OrgId,
    /// Display name
    pub name: String,
    /// DEK wrapped by the KMS master key; every tenant blob decrypts through it
    pub encrypted_dek_blob: Vec<u8>,
    /// Version of the wrapped DEK (bumped only by explicit key rotation)
    pub dek_version: u32,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

/// Kind of OAuth credential a secure token row holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    /// Short-lived access token
    Access,
    /// Long-lived refresh token
    Refresh,
}

impl TokenType {
    /// Storage representation
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Access => "access",
            Self::Refresh => "refresh",
        }
    }

    /// Parse the storage representation
    #[must_use]
    pub fn from_str_value(s: &str) -> Option<Self> {
        match s {
            "access" => Some(Self::Access),
            "refresh" => Some(Self::Refresh),
            _ => None,
        }
    }
}

/// Encryption state of a stored credential
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionStatus {
    /// Created, not yet resolved
    Pending,
    /// Blob present and decryptable
    Ok,
    /// Encryption failed; blob is null, retry queue owns recovery
    Failed,
}

impl EncryptionStatus {
    /// Storage representation
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ok => "ok",
            Self::Failed => "failed",
        }
    }

    /// Parse the storage representation
    #[must_use]
    pub fn from_str_value(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "ok" => Some(Self::Ok),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Which engine produced a stored blob. Fallback rows are reconciled back to
/// `Kms` by a sweep once the KMS answers again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionMethod {
    /// Envelope encryption under the per-org DEK
    Kms,
    /// Degraded-mode cipher under the application secret
    Fallback,
}

impl EncryptionMethod {
    /// Storage representation
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Kms => "kms",
            Self::Fallback => "fallback",
        }
    }

    /// Parse the storage representation
    #[must_use]
    pub fn from_str_value(s: &str) -> Option<Self> {
        match s {
            "kms" => Some(Self::Kms),
            "fallback" => Some(Self::Fallback),
            _ => None,
        }
    }
}

/// One stored OAuth credential instance. The credential itself never leaves
/// the token store; consumers pass the opaque `token_ref` around.
#[derive(Debug, Clone)]
pub struct SecureToken {
    /// Opaque, globally unique reference
    pub token_ref: String,
    /// Owning organization
    pub org_id: OrgId,
    /// OAuth provider (e.g. "google")
    pub provider: String,
    /// Access or refresh
    pub token_type: TokenType,
    /// Encrypted credential; non-null iff `encryption_status == Ok`
    pub encrypted_blob: Option<Vec<u8>>,
    /// Encryption state
    pub encryption_status: EncryptionStatus,
    /// Engine that produced the blob (None while pending/failed)
    pub encryption_method: Option<EncryptionMethod>,
    /// DEK version the blob was encrypted under
    pub key_version: u32,
    /// Machine-readable code of the last KMS failure
    pub kms_error_code: Option<String>,
    /// When the last KMS failure happened
    pub kms_error_at: Option<DateTime<Utc>>,
    /// Number of retry attempts recorded by the queue
    pub retry_count: u32,
    /// Timestamp of the latest retry attempt
    pub last_retry_at: Option<DateTime<Utc>>,
    /// Tracked credential expiry (access tokens)
    pub expires_at: Option<DateTime<Utc>>,
    /// Provider-side account identifier the credential belongs to
    pub external_account_id: Option<String>,
    /// Row creation timestamp
    pub created_at: DateTime<Utc>,
    /// Row update timestamp
    pub updated_at: DateTime<Utc>,
}

/// Summary returned to callers after a store operation; never carries plaintext
#[derive(Debug, Clone, Serialize)]
pub struct SecureTokenInfo {
    /// Opaque reference for later retrieval
    pub token_ref: String,
    /// Access or refresh
    pub token_type: TokenType,
    /// Whether encryption succeeded at store time
    pub encryption_status: EncryptionStatus,
    /// Engine used when encryption succeeded
    pub encryption_method: Option<EncryptionMethod>,
}

/// Plaintext OAuth credentials handed to the token store (input) or
/// reconstructed by `get_tokens` (output, possibly partial)
#[derive(Debug, Clone, Default)]
pub struct TokenData {
    /// Access token plaintext, when present and decryptable
    pub access_token: Option<String>,
    /// Refresh token plaintext, when present and decryptable
    pub refresh_token: Option<String>,
    /// Access token expiry
    pub expires_at: Option<DateTime<Utc>>,
}

/// Usable state of an integration account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    /// Credentials decrypt and the latest probe succeeded
    Connected,
    /// User must reconnect (bad credentials, scopes, or expiry)
    ActionNeeded,
    /// Reachability could not even be determined
    Disconnected,
    /// Push channel registration failed; data degrades to polling
    WatchFailed,
    /// Push channel renewal failed; existing channel will lapse
    WatchRenewalFailed,
}

impl AccountStatus {
    /// Storage representation
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::ActionNeeded => "action_needed",
            Self::Disconnected => "disconnected",
            Self::WatchFailed => "watch_failed",
            Self::WatchRenewalFailed => "watch_renewal_failed",
        }
    }

    /// Parse the storage representation
    #[must_use]
    pub fn from_str_value(s: &str) -> Option<Self> {
        match s {
            "connected" => Some(Self::Connected),
            "action_needed" => Some(Self::ActionNeeded),
            "disconnected" => Some(Self::Disconnected),
            "watch_failed" => Some(Self::WatchFailed),
            "watch_renewal_failed" => Some(Self::WatchRenewalFailed),
            _ => None,
        }
    }
}

/// One external account connection (a mailbox + calendar pair for Google)
#[derive(Debug, Clone)]
pub struct IntegrationAccount {
    /// Account identifier
    pub id: Uuid,
    /// Owning organization
    pub org_id: OrgId,
    /// OAuth provider
    pub provider: String,
    /// Address of the connected mailbox
    pub email: String,
    /// Usable state (written by the probe engine and watch manager)
    pub status: AccountStatus,
    /// Credential encryption state (written by the retry queue)
    pub encryption_status: EncryptionStatus,
    /// Reference to the access credential
    pub access_token_ref: Option<String>,
    /// Reference to the refresh credential
    pub refresh_token_ref: Option<String>,
    /// Push channel identifier
    pub channel_id: Option<String>,
    /// Push channel resource identifier
    pub channel_resource_id: Option<String>,
    /// Push channel expiry
    pub channel_expiration: Option<DateTime<Utc>>,
    /// Persisted renewal deadline swept by the renewal scheduler
    pub watch_renewal_due: Option<DateTime<Utc>>,
    /// Provider sync cursor
    pub history_id: Option<String>,
    /// Human-readable reason for the current non-connected status
    pub error_reason: Option<String>,
    /// Row creation timestamp
    pub created_at: DateTime<Utc>,
    /// Row update timestamp
    pub updated_at: DateTime<Utc>,
}

/// Push channel registration handed back by the provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelInfo {
    /// Channel identifier
    pub channel_id: String,
    /// Resource identifier
    pub resource_id: String,
    /// Channel expiry
    pub expiration: DateTime<Utc>,
}

/// Outcome of probing one provider service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    /// Service answered in the 2xx range
    Ok,
    /// Service rejected the call
    Fail,
}

/// Per-service probe snapshot
#[derive(Debug, Clone, Serialize)]
pub struct ServiceProbe {
    /// Service name ("gmail", "calendar")
    pub service: &'static str,
    /// Classification
    pub status: ProbeStatus,
    /// Human-readable reason when not ok
    pub reason: Option<String>,
}

/// Ephemeral result of one health probe run; folded into the account row
/// and an audit entry rather than persisted as its own entity
#[derive(Debug, Clone, Serialize)]
pub struct HealthProbeResult {
    /// Probed account
    pub account_id: Uuid,
    /// Per-service snapshots (empty when a local check short-circuited)
    pub services: Vec<ServiceProbe>,
    /// Conjunction of all probed services
    pub overall_status: AccountStatus,
    /// Reason string persisted to the account when not connected
    pub error_reason: Option<String>,
}
