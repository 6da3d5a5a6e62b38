// ABOUTME: Connect saga orchestrating org bootstrap, token storage, and job chaining
// ABOUTME: The integration-account upsert is the idempotent commit step of the saga
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Meridian CRM

//! Integration account onboarding and offboarding.
//!
//! The OAuth-callback handler (request layer, out of scope) calls
//! [`AccountService::connect`] with the plaintext credentials it received.
//! The saga runs: ensure organization (wrapping a fresh DEK on first
//! connect) → store tokens → commit the `IntegrationAccount` row → enqueue
//! encryption retries or initial sync → register the watch channel. The
//! account upsert is idempotent, so a crash between the token write and the
//! account write is healed by retrying the callback.

use crate::crypto::{EnvelopeCrypto, FallbackCipher};
use crate::database::Database;
use crate::errors::AppResult;
use crate::models::{
    AccountStatus, EncryptionStatus, IntegrationAccount, OrgId, Organization, SecureTokenInfo,
    TokenData, TokenType,
};
use crate::queue::workers::seal_credential;
use crate::queue::{InitialSyncPayload, QueueClient, TokenEncryptionPayload};
use crate::security::audit::{AuditEvent, AuditEventType, AuditSeverity, SecurityAuditor};
use crate::tokens::SecureTokenStore;
use crate::watch::WatchChannelManager;
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Input to the connect saga (what an OAuth callback carries)
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    /// Existing organization, or `None` to bootstrap one on first connect
    pub org_id: Option<OrgId>,
    /// Organization display name (used only when bootstrapping)
    pub org_name: String,
    /// OAuth provider
    pub provider: String,
    /// Address of the connected mailbox
    pub email: String,
    /// Provider-side account identifier
    pub external_account_id: Option<String>,
    /// Plaintext credentials from the callback
    pub tokens: TokenData,
}

/// Result of the connect saga
#[derive(Debug, Clone)]
pub struct ConnectOutcome {
    /// Organization (possibly freshly bootstrapped)
    pub org_id: OrgId,
    /// Integration account row
    pub account_id: Uuid,
    /// Per-token store outcomes
    pub token_infos: Vec<SecureTokenInfo>,
    /// Whether every stored credential reached `encryption_status = ok`
    pub encryption_ok: bool,
}

/// Account onboarding/offboarding service
pub struct AccountService {
    database: Arc<Database>,
    crypto: Arc<EnvelopeCrypto>,
    tokens: Arc<SecureTokenStore>,
    fallback: Arc<FallbackCipher>,
    queue: Arc<QueueClient>,
    watch: Arc<WatchChannelManager>,
    auditor: Arc<SecurityAuditor>,
}

impl AccountService {
    /// Create the service
    #[must_use]
    pub const fn new(
        database: Arc<Database>,
        crypto: Arc<EnvelopeCrypto>,
        tokens: Arc<SecureTokenStore>,
        fallback: Arc<FallbackCipher>,
        queue: Arc<QueueClient>,
        watch: Arc<WatchChannelManager>,
        auditor: Arc<SecurityAuditor>,
    ) -> Self {
        Self {
            database,
            crypto,
            tokens,
            fallback,
            queue,
            watch,
            auditor,
        }
    }

    /// Run the connect saga for an OAuth callback
    ///
    /// # Errors
    ///
    /// Returns an error when organization bootstrap or persistence fails.
    /// Per-token encryption failures do not fail the saga — they are
    /// persisted as status and recovered by the retry queue.
    pub async fn connect(&self, request: ConnectRequest) -> AppResult<ConnectOutcome> {
        let org_id = match request.org_id {
            Some(org_id) => org_id,
            None => self.bootstrap_organization(&request.org_name).await?,
        };

        let token_infos = self
            .tokens
            .store_tokens(
                org_id,
                &request.provider,
                &request.tokens,
                request.external_account_id.as_deref(),
            )
            .await?;

        let encryption_ok = token_infos
            .iter()
            .all(|info| info.encryption_status == EncryptionStatus::Ok);

        let access_ref = token_ref_of(&token_infos, TokenType::Access);
        let refresh_ref = token_ref_of(&token_infos, TokenType::Refresh);

        // Commit step: the account row is the authoritative record of the
        // connection. Idempotent upsert heals crashes between the writes.
        let now = Utc::now();
        let account = IntegrationAccount {
            id: Uuid::new_v4(),
            org_id,
            provider: request.provider.clone(),
            email: request.email.clone(),
            status: if encryption_ok {
                AccountStatus::Connected
            } else {
                AccountStatus::ActionNeeded
            },
            encryption_status: if encryption_ok {
                EncryptionStatus::Ok
            } else {
                EncryptionStatus::Pending
            },
            access_token_ref: access_ref.clone(),
            refresh_token_ref: refresh_ref,
            channel_id: None,
            channel_resource_id: None,
            channel_expiration: None,
            watch_renewal_due: None,
            history_id: None,
            error_reason: None,
            created_at: now,
            updated_at: now,
        };
        self.database.upsert_integration_account(&account).await?;

        // The upsert may have landed on an existing row; resolve the id the
        // commit actually points at.
        let account_id = self
            .database
            .list_org_integration_accounts(org_id)
            .await?
            .into_iter()
            .find(|a| a.provider == request.provider && a.email == request.email)
            .map_or(account.id, |a| a.id);

        if encryption_ok {
            self.queue
                .enqueue_initial_sync(&InitialSyncPayload {
                    org_id,
                    account_id,
                    provider: request.provider.clone(),
                })
                .await?;
        } else {
            self.enqueue_retries(org_id, account_id, &request, &token_infos)
                .await?;
        }

        // Watch channels only make sense once the connection is usable; a
        // watch failure degrades to polling but never fails onboarding.
        if encryption_ok {
            if let Err(e) = self.watch.setup_watch(account_id).await {
                warn!(account_id = %account_id, "Watch setup failed during connect: {}", e);
            }
        }

        info!(
            org_id = %org_id,
            account_id = %account_id,
            provider = %request.provider,
            encryption_ok,
            "Connect saga completed"
        );

        Ok(ConnectOutcome {
            org_id,
            account_id,
            token_infos,
            encryption_ok,
        })
    }

    /// Tenant offboarding: the only path that deletes secure tokens
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub async fn offboard_org(&self, org_id: OrgId) -> AppResult<u64> {
        let deleted = self.database.delete_org_secure_tokens(org_id).await?;
        self.crypto.invalidate(org_id);
        info!(org_id = %org_id, deleted, "Offboarded organization credentials");
        Ok(deleted)
    }

    /// Create an organization with a freshly wrapped DEK. Requires the KMS:
    /// a tenant without a resolvable DEK cannot decrypt anything, so
    /// bootstrap fails fast instead of minting an org that can never work.
    async fn bootstrap_organization(&self, name: &str) -> AppResult<OrgId> {
        let org_id = OrgId::new();
        let wrapped = self.crypto.wrap_new_dek(org_id).await?;

        let org = Organization {
            id: org_id,
            name: name.to_owned(),
            encrypted_dek_blob: wrapped,
            dek_version: 1,
            created_at: Utc::now(),
        };
        self.database.create_organization(&org).await?;

        self.auditor
            .log_event_best_effort(
                AuditEvent::new(
                    AuditEventType::OrganizationCreated,
                    AuditSeverity::Info,
                    format!("Organization '{name}' bootstrapped with wrapped DEK"),
                    "create".to_owned(),
                    "success".to_owned(),
                )
                .with_org_id(org_id),
            )
            .await;

        Ok(org_id)
    }

    /// Enqueue an encryption retry per failed credential, with the material
    /// sealed under the fallback cipher so the queue never carries plaintext
    async fn enqueue_retries(
        &self,
        org_id: OrgId,
        account_id: Uuid,
        request: &ConnectRequest,
        infos: &[SecureTokenInfo],
    ) -> AppResult<()> {
        for info in infos {
            if info.encryption_status == EncryptionStatus::Ok {
                continue;
            }

            let plaintext = match info.token_type {
                TokenType::Access => request.tokens.access_token.as_deref(),
                TokenType::Refresh => request.tokens.refresh_token.as_deref(),
            };

            let sealed_credential = match plaintext {
                Some(p) => match seal_credential(&self.fallback, p) {
                    Ok(sealed) => Some(sealed),
                    Err(e) => {
                        warn!(
                            token_ref = %info.token_ref,
                            "Could not seal credential for retry; job will dead-letter: {}", e
                        );
                        None
                    }
                },
                None => None,
            };

            self.queue
                .enqueue_token_encryption(&TokenEncryptionPayload {
                    org_id,
                    account_id,
                    token_ref: info.token_ref.clone(),
                    provider: request.provider.clone(),
                    external_account_id: request.external_account_id.clone(),
                    sealed_credential,
                })
                .await?;
        }

        Ok(())
    }
}

/// First reference of the given type among store outcomes
fn token_ref_of(infos: &[SecureTokenInfo], token_type: TokenType) -> Option<String> {
    infos
        .iter()
        .find(|i| i.token_type == token_type)
        .map(|i| i.token_ref.clone())
}
