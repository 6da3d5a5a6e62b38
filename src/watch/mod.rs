// ABOUTME: Watch channel manager for provider push-notification subscriptions
// ABOUTME: Renewal deadlines are persisted and swept, surviving process restarts
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Meridian CRM

//! # Webhook Channel Manager
//!
//! Creates, renews, and validates push-subscription channels so data stays
//! fresh without polling.
//!
//! Renewal scheduling is durable: `setup_watch` persists a
//! `watch_renewal_due` timestamp (expiry minus the renewal lead, clamped to
//! now) and a periodic sweep turns due accounts into renewal jobs. A crashed
//! or restarted worker therefore never loses a scheduled renewal.
//!
//! Watch failures set `watch_failed` / `watch_renewal_failed` — distinct from
//! the probe-driven states, so operators can tell "credentials bad" from
//! "push plumbing bad" even when both result in stale data.

use crate::constants::webhook_headers;
use crate::database::Database;
use crate::errors::{AppError, AppResult};
use crate::models::{AccountStatus, ChannelInfo, IntegrationAccount};
use crate::providers::{IntegrationApi, WatchRequest};
use crate::security::audit::{AuditEventType, SecurityAuditor};
use crate::tokens::SecureTokenStore;
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{info, warn};
use uuid::Uuid;

/// Watch manager configuration
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Webhook address registered with the provider
    pub callback_url: String,
    /// Optional shared secret echoed back in notifications; when configured,
    /// mismatching notifications are rejected
    pub channel_token: Option<String>,
    /// How long before channel expiry the renewal must run
    pub renewal_lead: Duration,
}

/// Validated inbound notification correlation data
#[derive(Debug, Clone)]
pub struct ValidatedNotification {
    /// Channel identifier minted at watch setup
    pub channel_id: String,
    /// Provider-side resource identifier
    pub resource_id: String,
    /// Resource state reported by the provider
    pub state: String,
}

/// Watch channel manager
pub struct WatchChannelManager {
    database: Arc<Database>,
    tokens: Arc<SecureTokenStore>,
    api: Arc<dyn IntegrationApi>,
    auditor: Arc<SecurityAuditor>,
    config: WatchConfig,
}

impl WatchChannelManager {
    /// Create a new manager
    #[must_use]
    pub const fn new(
        database: Arc<Database>,
        tokens: Arc<SecureTokenStore>,
        api: Arc<dyn IntegrationApi>,
        auditor: Arc<SecurityAuditor>,
        config: WatchConfig,
    ) -> Self {
        Self {
            database,
            tokens,
            api,
            auditor,
            config,
        }
    }

    /// Register a push subscription for the account and persist the channel
    /// state plus its renewal deadline.
    ///
    /// # Errors
    ///
    /// Returns an error when registration fails; the account is marked
    /// `watch_failed` before the error is returned.
    pub async fn setup_watch(&self, account_id: Uuid) -> AppResult<ChannelInfo> {
        let account = self.load_account(account_id).await?;
        self.register(&account, AccountStatus::WatchFailed, AuditEventType::WatchChannelCreated)
            .await
    }

    /// Renew the account's channel: best-effort stop of the old channel, then
    /// a fresh registration. A failed stop is logged but does not abort the
    /// renewal — an orphaned old channel is a lesser problem than losing push
    /// notifications entirely.
    ///
    /// # Errors
    ///
    /// Returns an error when the new registration fails; the account is
    /// marked `watch_renewal_failed` before the error is returned.
    pub async fn renew_watch(&self, account_id: Uuid) -> AppResult<ChannelInfo> {
        let account = self.load_account(account_id).await?;

        if account.channel_id.is_some() {
            if let Err(e) = self.stop_watch(account_id).await {
                warn!(
                    account_id = %account_id,
                    "Failed to stop old watch channel before renewal: {}", e
                );
            }
        }

        self.register(
            &account,
            AccountStatus::WatchRenewalFailed,
            AuditEventType::WatchChannelRenewed,
        )
        .await
    }

    /// Stop the account's current channel at the provider
    ///
    /// # Errors
    ///
    /// Returns an error if the account has no channel, credentials are
    /// unavailable, or the provider call fails.
    pub async fn stop_watch(&self, account_id: Uuid) -> AppResult<()> {
        let account = self.load_account(account_id).await?;

        let (Some(channel_id), Some(resource_id)) =
            (account.channel_id.clone(), account.channel_resource_id.clone())
        else {
            return Err(AppError::invalid_input(format!(
                "account {account_id} has no watch channel to stop"
            )));
        };

        let access_token = self.access_token(&account).await?;
        self.api
            .stop_watch(&access_token, &channel_id, &resource_id)
            .await?;

        info!(account_id = %account_id, channel_id = %channel_id, "Stopped watch channel");
        Ok(())
    }

    /// Validate an inbound webhook notification. This is the only
    /// authentication on the public webhook endpoint and fails closed: any
    /// missing or mismatched header rejects the notification.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` when a required correlation header is missing
    /// or the shared-secret channel token does not match.
    pub fn validate_notification(
        &self,
        headers: &HashMap<String, String>,
    ) -> AppResult<ValidatedNotification> {
        let channel_id = require_header(headers, webhook_headers::CHANNEL_ID)?;
        let resource_id = require_header(headers, webhook_headers::RESOURCE_ID)?;
        let state = headers
            .get(webhook_headers::RESOURCE_STATE)
            .cloned()
            .unwrap_or_default();

        if let Some(expected) = self.config.channel_token.as_deref() {
            let presented = headers
                .get(webhook_headers::CHANNEL_TOKEN)
                .map(String::as_bytes)
                .unwrap_or_default();
            if presented.ct_eq(expected.as_bytes()).unwrap_u8() != 1 {
                return Err(AppError::invalid_input(
                    "webhook notification rejected: channel token mismatch",
                ));
            }
        }

        Ok(ValidatedNotification {
            channel_id,
            resource_id,
            state,
        })
    }

    /// Shared registration path for setup and renewal
    async fn register(
        &self,
        account: &IntegrationAccount,
        failure_status: AccountStatus,
        audit_type: AuditEventType,
    ) -> AppResult<ChannelInfo> {
        let access_token = match self.access_token(account).await {
            Ok(token) => token,
            Err(e) => {
                self.record_failure(account, failure_status, &e).await;
                return Err(e);
            }
        };

        let request = WatchRequest {
            channel_id: Uuid::new_v4().to_string(),
            callback_url: self.config.callback_url.clone(),
            channel_token: self.config.channel_token.clone(),
        };

        match self.api.register_watch(&access_token, &request).await {
            Ok(channel) => {
                // Renewal must never be dropped: a non-positive lead window
                // clamps the deadline to now, which the sweep picks up on its
                // next pass.
                let renewal_due = (channel.expiration - self.config.renewal_lead).max(Utc::now());

                self.database
                    .update_account_channel(
                        account.id,
                        &channel.channel_id,
                        &channel.resource_id,
                        channel.expiration,
                        renewal_due,
                    )
                    .await?;

                self.auditor
                    .log_watch_event(account.org_id, account.id, audit_type, true, None)
                    .await;

                info!(
                    account_id = %account.id,
                    channel_id = %channel.channel_id,
                    expiration = %channel.expiration,
                    renewal_due = %renewal_due,
                    "Watch channel registered"
                );
                Ok(channel)
            }
            Err(e) => {
                self.record_failure(account, failure_status, &e).await;
                Err(e)
            }
        }
    }

    /// Persist a watch failure status and audit it
    async fn record_failure(
        &self,
        account: &IntegrationAccount,
        status: AccountStatus,
        error: &AppError,
    ) {
        let reason = error.to_string();
        if let Err(db_err) = self
            .database
            .update_account_status(account.id, status, Some(&reason))
            .await
        {
            warn!(account_id = %account.id, "Failed to persist watch failure: {}", db_err);
        }

        self.auditor
            .log_watch_event(
                account.org_id,
                account.id,
                AuditEventType::WatchChannelFailed,
                false,
                Some(&reason),
            )
            .await;
    }

    async fn load_account(&self, account_id: Uuid) -> AppResult<IntegrationAccount> {
        self.database
            .get_integration_account(account_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("integration account {account_id}")))
    }

    async fn access_token(&self, account: &IntegrationAccount) -> AppResult<String> {
        let Some(access_ref) = account.access_token_ref.clone() else {
            return Err(AppError::channel_setup_failed(format!(
                "account {} has no access credential on file",
                account.id
            )));
        };

        let data = self.tokens.get_tokens(&[access_ref]).await?;
        data.access_token.ok_or_else(|| {
            AppError::channel_setup_failed(format!(
                "access credential for account {} is not yet available",
                account.id
            ))
        })
    }
}

/// Fail-closed header extraction
fn require_header(headers: &HashMap<String, String>, name: &str) -> AppResult<String> {
    headers
        .get(name)
        .filter(|v| !v.is_empty())
        .cloned()
        .ok_or_else(|| {
            AppError::invalid_input(format!(
                "webhook notification rejected: missing {name} header"
            ))
        })
}
