// ABOUTME: Health probe engine classifying whether integration accounts are usable
// ABOUTME: Local checks short-circuit before any network probe is spent
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Meridian CRM

//! # Health Probe Engine
//!
//! Active checks against the provider API that classify an integration
//! account's usable state. Probes are the single source of truth operators
//! use to decide whether user-facing "reconnect" prompts should appear.
//!
//! Classification rules:
//! - encryption not `ok`, missing token ref, or expired credential →
//!   `action_needed` without spending any probe quota
//! - one lightweight read-only call per service; 2xx → ok, 401 → invalid or
//!   expired token, 403 → insufficient permission, anything else → provider
//!   error, all captured as human-readable reasons
//! - overall `connected` iff every probed service reports ok
//! - a transport-level failure yields `disconnected`, the most severe state,
//!   because reachability could not be determined at all
//!
//! Probe failures never propagate as errors to other components; they are
//! terminal classifications written to storage.

use crate::database::Database;
use crate::errors::{AppError, AppResult};
use crate::models::{
    AccountStatus, EncryptionStatus, HealthProbeResult, IntegrationAccount, OrgId, ProbeStatus,
    ServiceProbe,
};
use crate::providers::IntegrationApi;
use crate::security::audit::SecurityAuditor;
use crate::tokens::SecureTokenStore;
use chrono::Utc;
use futures_util::future::join_all;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{error, info};
use uuid::Uuid;

/// Health probe engine
pub struct HealthProbeEngine {
    database: Arc<Database>,
    tokens: Arc<SecureTokenStore>,
    api: Arc<dyn IntegrationApi>,
    auditor: Arc<SecurityAuditor>,
    /// Bounds simultaneous probes so neither the provider API nor the local
    /// process is overwhelmed
    concurrency: Arc<Semaphore>,
}

impl HealthProbeEngine {
    /// Create a new engine with the given probe concurrency bound
    #[must_use]
    pub fn new(
        database: Arc<Database>,
        tokens: Arc<SecureTokenStore>,
        api: Arc<dyn IntegrationApi>,
        auditor: Arc<SecurityAuditor>,
        max_concurrent_probes: usize,
    ) -> Self {
        Self {
            database,
            tokens,
            api,
            auditor,
            concurrency: Arc::new(Semaphore::new(max_concurrent_probes.max(1))),
        }
    }

    /// Run one health probe and persist its classification onto the account
    ///
    /// # Errors
    ///
    /// Returns an error if the account does not exist or persistence fails.
    /// Provider failures never surface as errors; they become the
    /// classification itself.
    pub async fn run_health_probe(&self, account_id: Uuid) -> AppResult<HealthProbeResult> {
        let account = self
            .database
            .get_integration_account(account_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("integration account {account_id}")))?;

        let result = self.classify(&account).await?;
        self.persist(&account, &result).await?;
        Ok(result)
    }

    /// Probe every account of an organization concurrently but independently:
    /// one account's probe failure never blocks or fails another's. Results
    /// are aggregated for reporting only.
    ///
    /// # Errors
    ///
    /// Returns an error only if the account listing itself fails.
    pub async fn run_org_probes(
        &self,
        org_id: OrgId,
    ) -> AppResult<Vec<(Uuid, AppResult<HealthProbeResult>)>> {
        let accounts = self.database.list_org_integration_accounts(org_id).await?;

        let probes = accounts.iter().map(|account| {
            let account_id = account.id;
            async move { (account_id, self.run_health_probe(account_id).await) }
        });

        let results = join_all(probes).await;
        for (account_id, result) in &results {
            if let Err(e) = result {
                error!(account_id = %account_id, "Health probe failed: {}", e);
            }
        }

        Ok(results)
    }

    /// Compute the classification without persisting it
    async fn classify(&self, account: &IntegrationAccount) -> AppResult<HealthProbeResult> {
        // Pure local checks first: no network probe is spent on an account
        // whose credentials cannot possibly work.
        if account.encryption_status != EncryptionStatus::Ok {
            return Ok(local_result(
                account.id,
                "Credentials are not yet encrypted; reconnect may be required",
            ));
        }

        let Some(access_ref) = account.access_token_ref.clone() else {
            return Ok(local_result(
                account.id,
                "No access credential on file; reconnect required",
            ));
        };

        let token_row = self.database.get_secure_token(&access_ref).await?;
        match &token_row {
            Some(row) if row.encryption_status == EncryptionStatus::Ok => {
                if let Some(expires_at) = row.expires_at {
                    if expires_at <= Utc::now() {
                        return Ok(local_result(
                            account.id,
                            "Access token expired; re-authorization required",
                        ));
                    }
                }
            }
            _ => {
                return Ok(local_result(
                    account.id,
                    "Access credential is not decryptable; reconnect required",
                ));
            }
        }

        let data = self.tokens.get_tokens(&[access_ref]).await?;
        let Some(access_token) = data.access_token else {
            return Ok(local_result(
                account.id,
                "Access credential unavailable; reconnect required",
            ));
        };

        // Network probes, bounded by the engine-wide concurrency limit.
        let _permit = self
            .concurrency
            .acquire()
            .await
            .map_err(|e| AppError::internal(format!("Probe semaphore closed: {e}")))?;

        let (mailbox, calendar) = tokio::join!(
            self.api.probe_mailbox(&access_token),
            self.api.probe_calendar(&access_token)
        );

        let mut services = Vec::with_capacity(2);
        let mut unreachable: Option<String> = None;

        match mailbox {
            Ok(status) => services.push(classify_service("gmail", "Gmail", status)),
            Err(e) => unreachable = Some(format!("Gmail unreachable: {e}")),
        }
        match calendar {
            Ok(status) => services.push(classify_service("calendar", "Calendar", status)),
            Err(e) => {
                let reason = format!("Calendar unreachable: {e}");
                unreachable = Some(match unreachable {
                    Some(existing) => format!("{existing}; {reason}"),
                    None => reason,
                });
            }
        }

        // A transport failure means reachability itself is unknown.
        if let Some(reason) = unreachable {
            return Ok(HealthProbeResult {
                account_id: account.id,
                services,
                overall_status: AccountStatus::Disconnected,
                error_reason: Some(reason),
            });
        }

        let all_ok = services.iter().all(|s| s.status == ProbeStatus::Ok);
        let error_reason = if all_ok {
            None
        } else {
            Some(
                services
                    .iter()
                    .filter_map(|s| s.reason.clone())
                    .collect::<Vec<_>>()
                    .join("; "),
            )
        };

        Ok(HealthProbeResult {
            account_id: account.id,
            services,
            overall_status: if all_ok {
                AccountStatus::Connected
            } else {
                AccountStatus::ActionNeeded
            },
            error_reason,
        })
    }

    /// Fold the probe outcome into the account row and the audit log
    async fn persist(
        &self,
        account: &IntegrationAccount,
        result: &HealthProbeResult,
    ) -> AppResult<()> {
        self.database
            .update_account_status(
                account.id,
                result.overall_status,
                result.error_reason.as_deref(),
            )
            .await?;

        self.auditor
            .log_probe_event(
                account.org_id,
                account.id,
                result.overall_status.as_str(),
                result.error_reason.as_deref(),
            )
            .await;

        info!(
            account_id = %account.id,
            status = result.overall_status.as_str(),
            "Health probe completed"
        );
        Ok(())
    }
}

/// Result for a local short-circuit: no services probed
fn local_result(account_id: Uuid, reason: &str) -> HealthProbeResult {
    HealthProbeResult {
        account_id,
        services: Vec::new(),
        overall_status: AccountStatus::ActionNeeded,
        error_reason: Some(reason.to_owned()),
    }
}

/// Classify one service's HTTP status into a probe snapshot
fn classify_service(service: &'static str, display: &str, status: u16) -> ServiceProbe {
    if (200..300).contains(&status) {
        return ServiceProbe {
            service,
            status: ProbeStatus::Ok,
            reason: None,
        };
    }

    let reason = match status {
        401 => format!("{display} token invalid or expired"),
        403 => format!("Insufficient {display} permissions"),
        other => format!("{display} provider error (HTTP {other})"),
    };

    ServiceProbe {
        service,
        status: ProbeStatus::Fail,
        reason: Some(reason),
    }
}
