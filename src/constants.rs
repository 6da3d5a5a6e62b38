// ABOUTME: Application constants for queue names, providers, and retry policies
// ABOUTME: Centralizes the tunables shared between producers and workers
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Meridian CRM

//! Application constants and configuration values

/// OAuth provider identifiers
pub mod providers {
    /// Google Workspace (Gmail + Calendar)
    pub const GOOGLE: &str = "google";
}

/// Named queues consumed by the worker pool
pub mod queues {
    /// Token re-encryption retries
    pub const TOKEN_ENCRYPTION: &str = "token-encryption";
    /// Initial data sync bootstrap
    pub const SYNC_INIT: &str = "sync-init";
    /// Periodic account health probes
    pub const HEALTH_PROBE: &str = "health-probe";
    /// Watch channel renewals
    pub const WEBHOOK_RENEWAL: &str = "webhook-renewal";
}

/// Retry policies per job kind
pub mod retry {
    /// Maximum attempts for token encryption jobs
    pub const TOKEN_ENCRYPTION_MAX_ATTEMPTS: u32 = 5;
    /// Base backoff for token encryption jobs (exponential)
    pub const TOKEN_ENCRYPTION_BACKOFF_MS: u64 = 2_000;
    /// Maximum attempts for initial sync jobs
    pub const SYNC_MAX_ATTEMPTS: u32 = 3;
    /// Base backoff for initial sync jobs (exponential)
    pub const SYNC_BACKOFF_MS: u64 = 5_000;
    /// Single attempt: probe and renewal jobs reschedule themselves via sweeps
    pub const SINGLE_ATTEMPT: u32 = 1;
}

/// Time spans used by schedulers
pub mod time {
    /// Seconds in one hour
    pub const HOUR_SECONDS: i64 = 3_600;
    /// Lead time before channel expiry at which renewal must run
    pub const WATCH_RENEWAL_LEAD_HOURS: i64 = 24;
    /// Default plaintext DEK cache TTL
    pub const DEK_CACHE_TTL_SECS: u64 = 60;
}

/// Outbound HTTP classification boundaries
pub mod http_status {
    /// Provider rejected the credential
    pub const UNAUTHORIZED: u16 = 401;
    /// Provider rejected the scope
    pub const FORBIDDEN: u16 = 403;
}

/// Inbound webhook correlation headers (Google push notification format)
pub mod webhook_headers {
    /// Channel identifier minted at watch setup
    pub const CHANNEL_ID: &str = "x-goog-channel-id";
    /// Provider-side resource identifier
    pub const RESOURCE_ID: &str = "x-goog-resource-id";
    /// Resource state (`sync`, `exists`, ...)
    pub const RESOURCE_STATE: &str = "x-goog-resource-state";
    /// Optional shared-secret token echoed back by the provider
    pub const CHANNEL_TOKEN: &str = "x-goog-channel-token";
}
