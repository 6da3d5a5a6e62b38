// ABOUTME: Shared test utilities and setup functions for integration tests
// ABOUTME: Provides the test context, toggleable KMS, scripted provider, and sync recorder
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Meridian CRM

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![allow(missing_docs)]
#![allow(dead_code)]

//! Shared test utilities for `meridian_crm` integration tests.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use meridian_crm::accounts::{ConnectOutcome, ConnectRequest};
use meridian_crm::config::ServerConfig;
use meridian_crm::context::AppContext;
use meridian_crm::crypto::{KmsProvider, LocalKms};
use meridian_crm::errors::{AppError, AppResult};
use meridian_crm::models::{ChannelInfo, OrgId, TokenData};
use meridian_crm::providers::{IntegrationApi, WatchRequest};
use meridian_crm::queue::SyncLauncher;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU16, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration as StdDuration;
use uuid::Uuid;
use zeroize::Zeroizing;

static INIT_LOGGER: Once = Once::new();

/// Initialize quiet logging for tests (call once per test process)
pub fn init_test_logging() {
    INIT_LOGGER.call_once(|| {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::WARN)
            .with_test_writer()
            .init();
    });
}

/// KMS behavior modes the tests can switch between at runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KmsMode {
    /// Normal operation
    Available,
    /// Simulated outage: every call returns `KmsUnavailable`
    Unavailable,
    /// Simulated hard failure: every call returns `AuthenticationFailed`
    AuthFail,
}

/// KMS wrapper with a runtime-toggleable failure mode
pub struct ToggleKms {
    inner: LocalKms,
    mode: AtomicU8,
}

impl ToggleKms {
    pub fn new(master_key: [u8; 32]) -> Self {
        Self {
            inner: LocalKms::new(master_key),
            mode: AtomicU8::new(0),
        }
    }

    pub fn set_mode(&self, mode: KmsMode) {
        let value = match mode {
            KmsMode::Available => 0,
            KmsMode::Unavailable => 1,
            KmsMode::AuthFail => 2,
        };
        self.mode.store(value, Ordering::SeqCst);
    }

    fn check(&self) -> AppResult<()> {
        match self.mode.load(Ordering::SeqCst) {
            1 => Err(AppError::kms_unavailable("simulated KMS outage")),
            2 => Err(AppError::authentication_failed("simulated KMS failure")),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl KmsProvider for ToggleKms {
    async fn wrap_dek(&self, org_id: OrgId, dek: &[u8]) -> AppResult<Vec<u8>> {
        self.check()?;
        self.inner.wrap_dek(org_id, dek).await
    }

    async fn unwrap_dek(&self, org_id: OrgId, wrapped: &[u8]) -> AppResult<Zeroizing<Vec<u8>>> {
        self.check()?;
        self.inner.unwrap_dek(org_id, wrapped).await
    }
}

/// Scripted provider API: per-service statuses, unreachability toggles, and
/// watch behavior are all adjustable at runtime; every call is counted.
pub struct ScriptedApi {
    pub mailbox_status: AtomicU16,
    pub calendar_status: AtomicU16,
    pub mailbox_unreachable: AtomicBool,
    pub calendar_unreachable: AtomicBool,
    pub watch_fail: AtomicBool,
    pub stop_fail: AtomicBool,
    /// Seconds from now until a newly minted channel expires
    pub watch_expiration_secs: AtomicI64,
    /// Probes presenting exactly this access token act unreachable
    pub unreachable_token: Mutex<Option<String>>,
    pub probe_calls: AtomicU32,
    pub watch_calls: AtomicU32,
    pub stop_calls: AtomicU32,
}

impl Default for ScriptedApi {
    fn default() -> Self {
        Self {
            mailbox_status: AtomicU16::new(200),
            calendar_status: AtomicU16::new(200),
            mailbox_unreachable: AtomicBool::new(false),
            calendar_unreachable: AtomicBool::new(false),
            watch_fail: AtomicBool::new(false),
            stop_fail: AtomicBool::new(false),
            watch_expiration_secs: AtomicI64::new(7 * 24 * 3600),
            unreachable_token: Mutex::new(None),
            probe_calls: AtomicU32::new(0),
            watch_calls: AtomicU32::new(0),
            stop_calls: AtomicU32::new(0),
        }
    }
}

impl ScriptedApi {
    fn is_unreachable_for(&self, access_token: &str) -> bool {
        self.unreachable_token
            .lock()
            .unwrap()
            .as_deref()
            .is_some_and(|t| t == access_token)
    }
}

#[async_trait]
impl IntegrationApi for ScriptedApi {
    async fn probe_mailbox(&self, access_token: &str) -> AppResult<u16> {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        if self.is_unreachable_for(access_token) || self.mailbox_unreachable.load(Ordering::SeqCst)
        {
            return Err(AppError::provider_unreachable("simulated network failure"));
        }
        Ok(self.mailbox_status.load(Ordering::SeqCst))
    }

    async fn probe_calendar(&self, access_token: &str) -> AppResult<u16> {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        if self.is_unreachable_for(access_token) || self.calendar_unreachable.load(Ordering::SeqCst)
        {
            return Err(AppError::provider_unreachable("simulated network failure"));
        }
        Ok(self.calendar_status.load(Ordering::SeqCst))
    }

    async fn register_watch(
        &self,
        _access_token: &str,
        request: &WatchRequest,
    ) -> AppResult<ChannelInfo> {
        let n = self.watch_calls.fetch_add(1, Ordering::SeqCst);
        if self.watch_fail.load(Ordering::SeqCst) {
            return Err(AppError::channel_setup_failed("simulated watch rejection"));
        }
        Ok(ChannelInfo {
            channel_id: request.channel_id.clone(),
            resource_id: format!("resource-{n}"),
            expiration: Utc::now()
                + Duration::seconds(self.watch_expiration_secs.load(Ordering::SeqCst)),
        })
    }

    async fn stop_watch(
        &self,
        _access_token: &str,
        _channel_id: &str,
        _resource_id: &str,
    ) -> AppResult<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        if self.stop_fail.load(Ordering::SeqCst) {
            return Err(AppError::channel_setup_failed("simulated stop failure"));
        }
        Ok(())
    }
}

/// Sync launcher that records every handoff
#[derive(Default)]
pub struct RecordingSync {
    pub launches: Mutex<Vec<(OrgId, Uuid, String)>>,
    pub fail: AtomicBool,
}

#[async_trait]
impl SyncLauncher for RecordingSync {
    async fn start_initial_sync(
        &self,
        org_id: OrgId,
        account_id: Uuid,
        provider: &str,
    ) -> AppResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(AppError::provider_unreachable("simulated sync failure"));
        }
        self.launches
            .lock()
            .unwrap()
            .push((org_id, account_id, provider.to_owned()));
        Ok(())
    }
}

impl RecordingSync {
    pub fn launch_count(&self) -> usize {
        self.launches.lock().unwrap().len()
    }
}

pub const TEST_MASTER_KEY: [u8; 32] = [7u8; 32];

pub fn test_config() -> ServerConfig {
    ServerConfig {
        database_url: "sqlite::memory:".to_owned(),
        master_key: TEST_MASTER_KEY,
        fallback_secret: "test-fallback-secret-material".to_owned(),
        dek_cache_ttl: StdDuration::from_secs(60),
        provider_timeout: StdDuration::from_secs(5),
        provider_base_url: "http://localhost:0".to_owned(),
        webhook_callback_url: "https://crm.test/webhooks/google".to_owned(),
        webhook_channel_token: Some("shared-webhook-secret".to_owned()),
        probe_concurrency: 4,
        queue_poll_interval: StdDuration::from_millis(50),
        // Sweeps are driven manually in tests
        sweep_interval: StdDuration::from_secs(3600),
        job_retention: Duration::hours(72),
    }
}

/// Everything a test needs to drive the core deterministically
pub struct TestHarness {
    pub ctx: Arc<AppContext>,
    pub kms: Arc<ToggleKms>,
    pub api: Arc<ScriptedApi>,
    pub sync: Arc<RecordingSync>,
}

/// Standard test setup: in-memory database, toggleable KMS, scripted provider
pub async fn create_test_harness() -> TestHarness {
    create_test_harness_with_db("sqlite::memory:").await
}

/// Test setup against a specific database URL (file-backed databases let
/// tests exercise restart behavior)
pub async fn create_test_harness_with_db(database_url: &str) -> TestHarness {
    init_test_logging();

    let kms = Arc::new(ToggleKms::new(TEST_MASTER_KEY));
    let api = Arc::new(ScriptedApi::default());
    let sync = Arc::new(RecordingSync::default());

    let mut config = test_config();
    config.database_url = database_url.to_owned();

    let ctx = AppContext::initialize(
        config,
        Arc::clone(&kms) as Arc<dyn KmsProvider>,
        Arc::clone(&api) as Arc<dyn IntegrationApi>,
        Arc::clone(&sync) as Arc<dyn SyncLauncher>,
    )
    .await
    .expect("Failed to initialize test context");

    TestHarness {
        ctx,
        kms,
        api,
        sync,
    }
}

/// Create an organization row with a freshly wrapped DEK
pub async fn create_test_org(harness: &TestHarness) -> OrgId {
    let org_id = OrgId::new();
    let wrapped = harness
        .ctx
        .crypto
        .wrap_new_dek(org_id)
        .await
        .expect("Failed to wrap DEK");

    harness
        .ctx
        .database
        .create_organization(&meridian_crm::models::Organization {
            id: org_id,
            name: "Test Org".to_owned(),
            encrypted_dek_blob: wrapped,
            dek_version: 1,
            created_at: Utc::now(),
        })
        .await
        .expect("Failed to create organization");

    org_id
}

/// Plaintext token pair used across tests
pub fn sample_tokens() -> TokenData {
    TokenData {
        access_token: Some("ya29.test-access-token".to_owned()),
        refresh_token: Some("1//refresh-token".to_owned()),
        expires_at: Some(Utc::now() + Duration::hours(1)),
    }
}

/// Run the connect saga with valid Google tokens, bootstrapping a fresh org.
/// Requires a healthy KMS (the DEK is wrapped during bootstrap).
pub async fn connect_fresh_account(harness: &TestHarness) -> ConnectOutcome {
    harness
        .ctx
        .accounts
        .connect(ConnectRequest {
            org_id: None,
            org_name: "Acme Corp".to_owned(),
            provider: "google".to_owned(),
            email: "ops@acme.test".to_owned(),
            external_account_id: Some("google-user-123".to_owned()),
            tokens: sample_tokens(),
        })
        .await
        .expect("Connect saga failed")
}

/// Run the connect saga against an existing organization
pub async fn connect_account(harness: &TestHarness, org_id: OrgId) -> ConnectOutcome {
    connect_custom(harness, org_id, "ops@acme.test", sample_tokens()).await
}

/// Run the connect saga with a specific mailbox and token pair
pub async fn connect_custom(
    harness: &TestHarness,
    org_id: OrgId,
    email: &str,
    tokens: TokenData,
) -> ConnectOutcome {
    harness
        .ctx
        .accounts
        .connect(ConnectRequest {
            org_id: Some(org_id),
            org_name: String::new(),
            provider: "google".to_owned(),
            email: email.to_owned(),
            external_account_id: Some("google-user-123".to_owned()),
            tokens,
        })
        .await
        .expect("Connect saga failed")
}

/// Make every waiting job immediately due, collapsing backoff delays so tests
/// can drive retries without sleeping
pub async fn make_jobs_due(ctx: &AppContext) {
    sqlx::query("UPDATE jobs SET run_at = $1 WHERE status = 'waiting'")
        .bind(Utc::now() - Duration::seconds(1))
        .execute(ctx.database.pool())
        .await
        .expect("Failed to fast-forward jobs");
}

/// Drain one queue to quiescence, fast-forwarding backoff between passes.
/// Returns the number of jobs processed.
pub async fn drain_queue(ctx: &AppContext, queue: &str) -> u32 {
    let mut processed = 0u32;
    loop {
        make_jobs_due(ctx).await;
        match ctx.worker_pool.run_queue_once(queue).await {
            Ok(true) => processed += 1,
            Ok(false) => break,
            Err(e) => panic!("Queue drain failed: {e}"),
        }
    }
    processed
}
