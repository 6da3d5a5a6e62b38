// ABOUTME: Google Workspace REST client for health probes and watch channels
// ABOUTME: Read-only probe endpoints plus the channel watch/stop API
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Meridian CRM

//! Google Workspace API client.
//!
//! Probes use the two cheapest read-only endpoints the product depends on:
//! the Gmail profile and the Calendar list. Watch channels use the Calendar
//! events channel API. Every call carries a short timeout; a timed-out call
//! is classified exactly like any other transport failure.

use crate::errors::{AppError, AppResult};
use crate::models::ChannelInfo;
use crate::providers::{IntegrationApi, WatchRequest};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Google API client configuration
#[derive(Debug, Clone)]
pub struct GoogleApiConfig {
    /// Base URL (default <https://www.googleapis.com>; overridable for tests)
    pub base_url: String,
    /// Per-request timeout (seconds, not minutes)
    pub timeout: Duration,
}

impl Default for GoogleApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.googleapis.com".to_owned(),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Google Workspace API client
pub struct GoogleApiClient {
    client: Client,
    config: GoogleApiConfig,
}

/// Watch registration request body (Calendar channel API)
#[derive(Debug, Serialize)]
struct WatchBody<'a> {
    id: &'a str,
    #[serde(rename = "type")]
    channel_type: &'static str,
    address: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<&'a str>,
}

/// Watch registration response
#[derive(Debug, Deserialize)]
struct WatchResponse {
    id: String,
    #[serde(rename = "resourceId")]
    resource_id: String,
    /// Expiration as epoch milliseconds, stringly typed by the API
    expiration: String,
}

/// Channel stop request body
#[derive(Debug, Serialize)]
struct StopBody<'a> {
    id: &'a str,
    #[serde(rename = "resourceId")]
    resource_id: &'a str,
}

impl GoogleApiClient {
    /// Create a new client
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying HTTP client cannot be built.
    pub fn new(config: GoogleApiConfig) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| AppError::internal(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self { client, config })
    }

    async fn get_status(&self, path: &str, access_token: &str) -> AppResult<u16> {
        let url = format!("{}{path}", self.config.base_url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| AppError::provider_unreachable(format!("GET {path}: {e}")))?;

        Ok(response.status().as_u16())
    }
}

#[async_trait]
impl IntegrationApi for GoogleApiClient {
    async fn probe_mailbox(&self, access_token: &str) -> AppResult<u16> {
        self.get_status("/gmail/v1/users/me/profile", access_token)
            .await
    }

    async fn probe_calendar(&self, access_token: &str) -> AppResult<u16> {
        self.get_status(
            "/calendar/v3/users/me/calendarList?maxResults=1",
            access_token,
        )
        .await
    }

    async fn register_watch(
        &self,
        access_token: &str,
        request: &WatchRequest,
    ) -> AppResult<ChannelInfo> {
        let url = format!(
            "{}/calendar/v3/calendars/primary/events/watch",
            self.config.base_url
        );
        let body = WatchBody {
            id: &request.channel_id,
            channel_type: "web_hook",
            address: &request.callback_url,
            token: request.channel_token.as_deref(),
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(access_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::provider_unreachable(format!("watch registration: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AppError::channel_setup_failed(format!(
                "watch registration returned {status}: {text}"
            )));
        }

        let watch: WatchResponse = response
            .json()
            .await
            .map_err(|e| AppError::channel_setup_failed(format!("malformed watch response: {e}")))?;

        Ok(ChannelInfo {
            channel_id: watch.id,
            resource_id: watch.resource_id,
            expiration: parse_epoch_millis(&watch.expiration)?,
        })
    }

    async fn stop_watch(
        &self,
        access_token: &str,
        channel_id: &str,
        resource_id: &str,
    ) -> AppResult<()> {
        let url = format!("{}/calendar/v3/channels/stop", self.config.base_url);
        let body = StopBody {
            id: channel_id,
            resource_id,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(access_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::provider_unreachable(format!("channel stop: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::channel_setup_failed(format!(
                "channel stop returned {status}"
            )));
        }

        Ok(())
    }
}

/// Parse the API's stringly-typed epoch-milliseconds expiration
fn parse_epoch_millis(value: &str) -> AppResult<DateTime<Utc>> {
    let millis: i64 = value
        .parse()
        .map_err(|e| AppError::channel_setup_failed(format!("invalid expiration '{value}': {e}")))?;

    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| AppError::channel_setup_failed(format!("expiration out of range: {millis}")))
}
