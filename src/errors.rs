// ABOUTME: Unified error handling with a closed error taxonomy for the integration core
// ABOUTME: Callers branch exhaustively on variants instead of inspecting error shapes
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Meridian CRM

//! # Error Module
//!
//! Single `AppError` sum type shared across the crate. The crypto and provider
//! variants form a closed taxonomy:
//!
//! - `KmsUnavailable` is transient and triggers the fallback cipher
//! - `AuthenticationFailed` is permanent (tampered or stale ciphertext)
//! - `TokenExpired` / `InsufficientPermission` persist until the user re-grants
//! - `ProviderUnreachable` is transient and retried by the job queue
//! - `ChannelExpired` / `ChannelSetupFailed` affect push plumbing only
//!
//! Encryption failures are converted into persisted status fields at the token
//! store boundary; they do not propagate past it.

use thiserror::Error;

/// Result alias used throughout the crate
pub type AppResult<T> = Result<T, AppError>;

/// Unified application error
#[derive(Debug, Error)]
pub enum AppError {
    /// KMS did not answer (outage, revoked permission, timeout). Transient;
    /// callers fall back to the degraded cipher rather than failing the write.
    #[error("KMS unavailable: {0}")]
    KmsUnavailable(String),

    /// AEAD authentication failed: tampered blob, wrong key, or AAD mismatch.
    /// Permanent; the ciphertext is unrecoverable.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Access credential expired and cannot be used until re-authorization
    #[error("token expired for {0}")]
    TokenExpired(String),

    /// Provider rejected the call for missing scopes (HTTP 403)
    #[error("insufficient permission: {0}")]
    InsufficientPermission(String),

    /// Provider could not be reached or answered outside the expected range
    #[error("provider unreachable: {0}")]
    ProviderUnreachable(String),

    /// Push channel expired before renewal
    #[error("watch channel expired: {0}")]
    ChannelExpired(String),

    /// Push channel registration or renewal failed
    #[error("watch channel setup failed: {0}")]
    ChannelSetupFailed(String),

    /// Database operation failed
    #[error("database error: {0}")]
    Database(String),

    /// Invalid input from a caller
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Requested entity does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Configuration missing or malformed
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal invariant violation or unexpected failure
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Create a KMS-unavailable error
    pub fn kms_unavailable(msg: impl Into<String>) -> Self {
        Self::KmsUnavailable(msg.into())
    }

    /// Create an authentication-failed error
    pub fn authentication_failed(msg: impl Into<String>) -> Self {
        Self::AuthenticationFailed(msg.into())
    }

    /// Create a provider-unreachable error
    pub fn provider_unreachable(msg: impl Into<String>) -> Self {
        Self::ProviderUnreachable(msg.into())
    }

    /// Create a channel-setup-failed error
    pub fn channel_setup_failed(msg: impl Into<String>) -> Self {
        Self::ChannelSetupFailed(msg.into())
    }

    /// Create a database error
    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    /// Create an invalid-input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a not-found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether this error is the transient KMS-availability class that
    /// permits the fallback cipher path
    #[must_use]
    pub const fn is_kms_unavailable(&self) -> bool {
        matches!(self, Self::KmsUnavailable(_))
    }

    /// Short machine-readable code persisted into `kms_error_code` columns
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::KmsUnavailable(_) => "kms_unavailable",
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::TokenExpired(_) => "token_expired",
            Self::InsufficientPermission(_) => "insufficient_permission",
            Self::ProviderUnreachable(_) => "provider_unreachable",
            Self::ChannelExpired(_) => "channel_expired",
            Self::ChannelSetupFailed(_) => "channel_setup_failed",
            Self::Database(_) => "database",
            Self::InvalidInput(_) => "invalid_input",
            Self::NotFound(_) => "not_found",
            Self::Config(_) => "config",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        Self::Database(e.to_string())
    }
}

impl From<uuid::Error> for AppError {
    fn from(e: uuid::Error) -> Self {
        Self::InvalidInput(format!("invalid UUID: {e}"))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal(format!("JSON serialization failed: {e}"))
    }
}
