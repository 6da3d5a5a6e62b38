// ABOUTME: Job handlers for token encryption retries, sync bootstrap, probes, and renewals
// ABOUTME: Handlers are idempotent so at-least-once delivery never double-creates side effects
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Meridian CRM

//! Job handlers executed by the worker pool.
//!
//! Ordering guarantee: within a single account, encryption must complete
//! (`ok`) strictly before the first sync job executes. Enforced twice — sync
//! jobs are only enqueued by a successfully completed encryption job, and the
//! sync handler re-checks `encryption_status` immediately before executing.

use crate::crypto::FallbackCipher;
use crate::database::Database;
use crate::errors::{AppError, AppResult};
use crate::models::{EncryptionStatus, OrgId};
use crate::probe::HealthProbeEngine;
use crate::queue::job::{
    HealthProbePayload, InitialSyncPayload, JobKind, JobRecord, TokenEncryptionPayload,
    WebhookRenewalPayload,
};
use crate::queue::QueueClient;
use crate::tokens::SecureTokenStore;
use crate::watch::WatchChannelManager;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Downstream sync bootstrap (external collaborator, out of scope here).
/// Implementations must tolerate duplicate delivery.
#[async_trait]
pub trait SyncLauncher: Send + Sync {
    /// Kick off the initial data sync for a freshly usable account
    ///
    /// # Errors
    ///
    /// Returns an error when the sync system rejects the request; the job
    /// queue retries per its policy.
    async fn start_initial_sync(
        &self,
        org_id: OrgId,
        account_id: Uuid,
        provider: &str,
    ) -> AppResult<()>;
}

/// Stand-in launcher that records the handoff in the log
pub struct LoggingSyncLauncher;

#[async_trait]
impl SyncLauncher for LoggingSyncLauncher {
    async fn start_initial_sync(
        &self,
        org_id: OrgId,
        account_id: Uuid,
        provider: &str,
    ) -> AppResult<()> {
        info!(
            org_id = %org_id,
            account_id = %account_id,
            provider,
            "Handing account to downstream sync"
        );
        Ok(())
    }
}

/// Handler set dispatched by the worker pool
pub struct JobHandlers {
    database: Arc<Database>,
    tokens: Arc<SecureTokenStore>,
    fallback: Arc<FallbackCipher>,
    queue: Arc<QueueClient>,
    probe: Arc<HealthProbeEngine>,
    watch: Arc<WatchChannelManager>,
    sync: Arc<dyn SyncLauncher>,
}

impl JobHandlers {
    /// Create the handler set
    #[must_use]
    pub const fn new(
        database: Arc<Database>,
        tokens: Arc<SecureTokenStore>,
        fallback: Arc<FallbackCipher>,
        queue: Arc<QueueClient>,
        probe: Arc<HealthProbeEngine>,
        watch: Arc<WatchChannelManager>,
        sync: Arc<dyn SyncLauncher>,
    ) -> Self {
        Self {
            database,
            tokens,
            fallback,
            queue,
            probe,
            watch,
            sync,
        }
    }

    /// Route a claimed job to its handler
    ///
    /// # Errors
    ///
    /// Propagates the handler's error so the pool can retry or dead-letter.
    pub async fn dispatch(&self, job: &JobRecord) -> AppResult<()> {
        match job.kind {
            JobKind::EncryptToken => self.process_token_encryption_job(job).await,
            JobKind::StartSync => self.process_initial_sync_job(job).await,
            JobKind::HealthProbe => self.process_health_probe_job(job).await,
            JobKind::WebhookRenewal => self.process_webhook_renewal_job(job).await,
        }
    }

    /// Re-attempt credential encryption. On success, flips the account to
    /// `encryption_status = ok` and chains the initial sync job — sync must
    /// never start against an account whose credentials cannot be decrypted.
    ///
    /// # Errors
    ///
    /// Returns an error when the re-attempt fails; the pool reschedules with
    /// backoff until attempts are exhausted.
    pub async fn process_token_encryption_job(&self, job: &JobRecord) -> AppResult<()> {
        let payload: TokenEncryptionPayload = serde_json::from_value(job.payload.clone())?;

        let row = self
            .database
            .get_secure_token(&payload.token_ref)
            .await?
            .ok_or_else(|| AppError::not_found(format!("secure token {}", payload.token_ref)))?;

        // Duplicate delivery after a successful run: the run that flipped the
        // row already chained sync. Nothing to do.
        if row.encryption_status == EncryptionStatus::Ok {
            return Ok(());
        }

        let sealed = payload.sealed_credential.as_deref().ok_or_else(|| {
            AppError::internal(format!(
                "no sealed credential material for {}; cannot recover plaintext",
                payload.token_ref
            ))
        })?;
        let sealed_bytes = STANDARD
            .decode(sealed)
            .map_err(|e| AppError::internal(format!("sealed credential is not base64: {e}")))?;
        let plaintext_bytes = self.fallback.decrypt(&sealed_bytes)?;
        let plaintext = String::from_utf8(plaintext_bytes)
            .map_err(|e| AppError::internal(format!("sealed credential is not UTF-8: {e}")))?;

        let changed = self
            .tokens
            .retry_encryption(&payload.token_ref, &plaintext)
            .await?;

        // The account flips to ok (and sync is chained, once) only when every
        // credential it references has reached ok — not per token job.
        if changed && self.account_tokens_all_ok(payload.account_id).await? {
            self.database
                .update_account_encryption_status(payload.account_id, EncryptionStatus::Ok)
                .await?;
            self.queue
                .enqueue_initial_sync(&InitialSyncPayload {
                    org_id: payload.org_id,
                    account_id: payload.account_id,
                    provider: payload.provider.clone(),
                })
                .await?;
        }

        Ok(())
    }

    /// Whether every credential referenced by the account decrypts
    async fn account_tokens_all_ok(&self, account_id: Uuid) -> AppResult<bool> {
        let Some(account) = self.database.get_integration_account(account_id).await? else {
            return Ok(false);
        };

        for token_ref in [&account.access_token_ref, &account.refresh_token_ref]
            .into_iter()
            .flatten()
        {
            let row = self.database.get_secure_token(token_ref).await?;
            if !row.is_some_and(|r| r.encryption_status == EncryptionStatus::Ok) {
                return Ok(false);
            }
        }

        Ok(true)
    }

    /// Bootstrap initial sync. Re-checks encryption state immediately before
    /// executing: defends against a race where encryption regressed between
    /// enqueue and execution.
    ///
    /// # Errors
    ///
    /// Returns an error when the account is not ready or the sync handoff
    /// fails.
    pub async fn process_initial_sync_job(&self, job: &JobRecord) -> AppResult<()> {
        let payload: InitialSyncPayload = serde_json::from_value(job.payload.clone())?;

        let account = self
            .database
            .get_integration_account(payload.account_id)
            .await?
            .ok_or_else(|| {
                AppError::not_found(format!("integration account {}", payload.account_id))
            })?;

        if account.encryption_status != EncryptionStatus::Ok {
            return Err(AppError::internal(format!(
                "account {} encryption is {}, refusing to sync",
                account.id,
                account.encryption_status.as_str()
            )));
        }

        if let Some(access_ref) = account.access_token_ref.as_deref() {
            let row = self.database.get_secure_token(access_ref).await?;
            let ready = row.is_some_and(|r| r.encryption_status == EncryptionStatus::Ok);
            if !ready {
                return Err(AppError::internal(format!(
                    "access credential for account {} regressed before sync",
                    account.id
                )));
            }
        }

        self.sync
            .start_initial_sync(payload.org_id, payload.account_id, &payload.provider)
            .await
    }

    /// Run a health probe. Classification outcomes are not errors; only a
    /// missing account or storage failure fails the job.
    ///
    /// # Errors
    ///
    /// Returns an error if the probe run itself could not execute.
    pub async fn process_health_probe_job(&self, job: &JobRecord) -> AppResult<()> {
        let payload: HealthProbePayload = serde_json::from_value(job.payload.clone())?;
        self.probe.run_health_probe(payload.account_id).await?;
        Ok(())
    }

    /// Renew a watch channel
    ///
    /// # Errors
    ///
    /// Returns an error when renewal fails; the account was already marked
    /// `watch_renewal_failed` by the manager.
    pub async fn process_webhook_renewal_job(&self, job: &JobRecord) -> AppResult<()> {
        let payload: WebhookRenewalPayload = serde_json::from_value(job.payload.clone())?;
        self.watch.renew_watch(payload.account_id).await?;
        Ok(())
    }

    /// Kind-specific terminal side effects. For encryption jobs this is the
    /// human-visible signal: `encryption_status = failed`,
    /// `status = action_needed`, exactly once at the dead-letter transition.
    pub async fn on_dead_letter(&self, job: &JobRecord, error: &AppError) {
        if job.kind != JobKind::EncryptToken {
            return;
        }

        let Ok(payload) =
            serde_json::from_value::<TokenEncryptionPayload>(job.payload.clone())
        else {
            error!(job_id = %job.id, "Dead-lettered encryption job has malformed payload");
            return;
        };

        if let Err(e) = self
            .database
            .update_account_encryption_status(payload.account_id, EncryptionStatus::Failed)
            .await
        {
            error!(account_id = %payload.account_id, "Failed to persist encryption failure: {}", e);
        }

        if let Err(e) = self
            .database
            .update_account_status(
                payload.account_id,
                crate::models::AccountStatus::ActionNeeded,
                Some("Credential encryption failed after exhausting retries; reconnect required"),
            )
            .await
        {
            error!(account_id = %payload.account_id, "Failed to persist account status: {}", e);
        }

        warn!(
            account_id = %payload.account_id,
            token_ref = %payload.token_ref,
            "Encryption retries exhausted: {}", error
        );
    }
}

/// Seal credential material for an encryption-retry payload.
/// Uses the fallback cipher so the queue never carries plaintext.
///
/// # Errors
///
/// Returns an error if sealing fails.
pub fn seal_credential(fallback: &FallbackCipher, plaintext: &str) -> AppResult<String> {
    let blob = fallback.encrypt(plaintext.as_bytes())?;
    Ok(STANDARD.encode(blob))
}
