// ABOUTME: Focused dependency injection context wiring the integration core together
// ABOUTME: Everything is constructed explicitly with init/teardown, never ambient globals
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Meridian CRM

//! Application context.
//!
//! All components are built once here and passed by `Arc` — the queue client,
//! worker pool, crypto engine, and stores are plain values with explicit
//! lifecycles. The KMS provider, provider API, and sync launcher are injected
//! as trait objects so deployments (and tests) choose their implementations.

use crate::accounts::AccountService;
use crate::config::ServerConfig;
use crate::crypto::{EnvelopeCrypto, FallbackCipher, KmsProvider};
use crate::database::Database;
use crate::errors::AppResult;
use crate::probe::HealthProbeEngine;
use crate::providers::IntegrationApi;
use crate::queue::{JobHandlers, QueueClient, SyncLauncher, WorkerPool};
use crate::security::audit::SecurityAuditor;
use crate::tokens::SecureTokenStore;
use crate::watch::{WatchChannelManager, WatchConfig};
use chrono::Duration;
use std::sync::Arc;

/// Fully wired application context
pub struct AppContext {
    /// Server configuration
    pub config: ServerConfig,
    /// Database pool
    pub database: Arc<Database>,
    /// Envelope crypto engine
    pub crypto: Arc<EnvelopeCrypto>,
    /// Degraded-mode cipher
    pub fallback: Arc<FallbackCipher>,
    /// Secure token store
    pub tokens: Arc<SecureTokenStore>,
    /// Job queue producer handle
    pub queue: Arc<QueueClient>,
    /// Security audit logger
    pub auditor: Arc<SecurityAuditor>,
    /// Health probe engine
    pub probe: Arc<HealthProbeEngine>,
    /// Watch channel manager
    pub watch: Arc<WatchChannelManager>,
    /// Worker pool consuming the named queues
    pub worker_pool: Arc<WorkerPool>,
    /// Connect/offboard orchestration
    pub accounts: Arc<AccountService>,
}

impl AppContext {
    /// Build the full context from configuration and the injected
    /// collaborators
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened/migrated or key
    /// material is invalid.
    pub async fn initialize(
        config: ServerConfig,
        kms: Arc<dyn KmsProvider>,
        api: Arc<dyn IntegrationApi>,
        sync: Arc<dyn SyncLauncher>,
    ) -> AppResult<Arc<Self>> {
        let database = Arc::new(Database::new(&config.database_url).await?);
        let auditor = Arc::new(SecurityAuditor::new(Arc::clone(&database)));

        let crypto = Arc::new(EnvelopeCrypto::new(
            Arc::clone(&database),
            kms,
            config.dek_cache_ttl,
        ));
        let fallback = Arc::new(FallbackCipher::new(&config.fallback_secret)?);

        let tokens = Arc::new(SecureTokenStore::new(
            Arc::clone(&database),
            Arc::clone(&crypto),
            Arc::clone(&fallback),
            Arc::clone(&auditor),
        ));

        let queue = Arc::new(QueueClient::new(Arc::clone(&database)));

        let probe = Arc::new(HealthProbeEngine::new(
            Arc::clone(&database),
            Arc::clone(&tokens),
            Arc::clone(&api),
            Arc::clone(&auditor),
            config.probe_concurrency,
        ));

        let watch = Arc::new(WatchChannelManager::new(
            Arc::clone(&database),
            Arc::clone(&tokens),
            Arc::clone(&api),
            Arc::clone(&auditor),
            WatchConfig {
                callback_url: config.webhook_callback_url.clone(),
                channel_token: config.webhook_channel_token.clone(),
                renewal_lead: Duration::hours(crate::constants::time::WATCH_RENEWAL_LEAD_HOURS),
            },
        ));

        let handlers = Arc::new(JobHandlers::new(
            Arc::clone(&database),
            Arc::clone(&tokens),
            Arc::clone(&fallback),
            Arc::clone(&queue),
            Arc::clone(&probe),
            Arc::clone(&watch),
            sync,
        ));

        let worker_pool = Arc::new(WorkerPool::new(
            Arc::clone(&database),
            Arc::clone(&queue),
            handlers,
            Arc::clone(&tokens),
            Arc::clone(&auditor),
            config.queue_poll_interval,
            config.sweep_interval,
            config.job_retention,
        ));

        let accounts = Arc::new(AccountService::new(
            Arc::clone(&database),
            Arc::clone(&crypto),
            Arc::clone(&tokens),
            Arc::clone(&fallback),
            Arc::clone(&queue),
            Arc::clone(&watch),
            Arc::clone(&auditor),
        ));

        Ok(Arc::new(Self {
            config,
            database,
            crypto,
            fallback,
            tokens,
            queue,
            auditor,
            probe,
            watch,
            worker_pool,
            accounts,
        }))
    }
}
