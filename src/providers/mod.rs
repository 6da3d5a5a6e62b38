// ABOUTME: Provider abstraction for external integration APIs (Gmail/Calendar)
// ABOUTME: Probe calls return raw HTTP status; transport failures are typed errors
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Meridian CRM

//! # Integration Provider System
//!
//! The `IntegrationApi` trait is the seam between this core and the external
//! provider. Probe calls are lightweight, read-only, and safe at probe
//! frequency; they return the raw HTTP status so the health probe engine owns
//! classification. Transport-level failures (timeouts, connection errors)
//! surface as `ProviderUnreachable` — the probe engine maps those to the
//! `disconnected` state because reachability could not be determined at all.

/// Google Workspace REST implementation
pub mod google;

pub use google::{GoogleApiClient, GoogleApiConfig};

use crate::errors::AppResult;
use crate::models::ChannelInfo;
use async_trait::async_trait;

/// Parameters for registering a push-notification channel
#[derive(Debug, Clone)]
pub struct WatchRequest {
    /// Caller-minted channel identifier
    pub channel_id: String,
    /// Webhook address the provider pushes to
    pub callback_url: String,
    /// Optional shared-secret token echoed back in notifications
    pub channel_token: Option<String>,
}

/// External provider operations used by the probe engine and watch manager
#[async_trait]
pub trait IntegrationApi: Send + Sync {
    /// Fetch the mailbox profile (read-only health probe).
    /// Returns the HTTP status; `Err` means the provider was unreachable.
    ///
    /// # Errors
    ///
    /// Returns `ProviderUnreachable` on transport failure or timeout.
    async fn probe_mailbox(&self, access_token: &str) -> AppResult<u16>;

    /// Fetch the calendar list (read-only health probe).
    /// Returns the HTTP status; `Err` means the provider was unreachable.
    ///
    /// # Errors
    ///
    /// Returns `ProviderUnreachable` on transport failure or timeout.
    async fn probe_calendar(&self, access_token: &str) -> AppResult<u16>;

    /// Register a push-notification channel
    ///
    /// # Errors
    ///
    /// Returns `ChannelSetupFailed` when the provider rejects the
    /// registration, `ProviderUnreachable` on transport failure.
    async fn register_watch(
        &self,
        access_token: &str,
        request: &WatchRequest,
    ) -> AppResult<ChannelInfo>;

    /// Stop an existing push-notification channel
    ///
    /// # Errors
    ///
    /// Returns `ProviderUnreachable` or `ChannelSetupFailed` when the stop
    /// call does not succeed. Callers treat this as best-effort.
    async fn stop_watch(
        &self,
        access_token: &str,
        channel_id: &str,
        resource_id: &str,
    ) -> AppResult<()>;
}
