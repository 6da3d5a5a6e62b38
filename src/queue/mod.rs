// ABOUTME: Durable retry job queue with named queues, backoff, and dead-lettering
// ABOUTME: QueueClient and WorkerPool are constructed explicitly, never ambient globals
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Meridian CRM

//! # Retry Job Queue
//!
//! Durable, backoff-scheduled jobs that re-attempt credential encryption and
//! then chain into initial data sync, plus the probe and watch-renewal jobs.
//!
//! The queue is database-backed: producers insert waiting rows, workers claim
//! them with an atomic update, and terminal rows (completed or dead-lettered)
//! are retained for a bounded inspection window before being pruned. There is
//! no unbounded retry path: every kind carries a max-attempt policy, and
//! exhausting it parks the job in the dead-letter state with human-visible
//! side effects.

/// Job records, payloads, and the per-job state machine
pub mod job;
/// Job handlers executed by the worker pool
pub mod workers;

pub use job::{
    HealthProbePayload, InitialSyncPayload, JobKind, JobRecord, JobStatus, TokenEncryptionPayload,
    WebhookRenewalPayload,
};
pub use workers::{JobHandlers, LoggingSyncLauncher, SyncLauncher};

use crate::database::Database;
use crate::errors::AppResult;
use crate::security::audit::SecurityAuditor;
use crate::tokens::SecureTokenStore;
use chrono::{Duration, Utc};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Producer-side handle for enqueueing jobs
pub struct QueueClient {
    database: Arc<Database>,
}

impl QueueClient {
    /// Create a new client
    #[must_use]
    pub const fn new(database: Arc<Database>) -> Self {
        Self { database }
    }

    /// Enqueue a job of the given kind after `delay`
    ///
    /// # Errors
    ///
    /// Returns an error if the job row cannot be inserted.
    pub async fn enqueue(
        &self,
        kind: JobKind,
        payload: serde_json::Value,
        delay: Duration,
    ) -> AppResult<Uuid> {
        let (max_attempts, backoff_base_ms) = kind.retry_policy();
        let now = Utc::now();
        let job = JobRecord {
            id: Uuid::new_v4(),
            queue: kind.queue().to_owned(),
            kind,
            payload,
            status: JobStatus::Waiting,
            attempts: 0,
            max_attempts,
            backoff_base_ms,
            run_at: now + delay,
            last_error: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        };

        self.database.insert_job(&job).await?;
        info!(job_id = %job.id, kind = kind.as_str(), queue = kind.queue(), "Enqueued job");
        Ok(job.id)
    }

    /// Enqueue a token-encryption retry
    ///
    /// # Errors
    ///
    /// Returns an error if the job cannot be persisted.
    pub async fn enqueue_token_encryption(
        &self,
        payload: &TokenEncryptionPayload,
    ) -> AppResult<Uuid> {
        self.enqueue(
            JobKind::EncryptToken,
            serde_json::to_value(payload)?,
            Duration::zero(),
        )
        .await
    }

    /// Enqueue an initial sync bootstrap. Producers must only call this after
    /// the account's credentials reached `encryption_status = ok`.
    ///
    /// # Errors
    ///
    /// Returns an error if the job cannot be persisted.
    pub async fn enqueue_initial_sync(&self, payload: &InitialSyncPayload) -> AppResult<Uuid> {
        self.enqueue(
            JobKind::StartSync,
            serde_json::to_value(payload)?,
            Duration::zero(),
        )
        .await
    }

    /// Enqueue a health probe
    ///
    /// # Errors
    ///
    /// Returns an error if the job cannot be persisted.
    pub async fn enqueue_health_probe(&self, payload: &HealthProbePayload) -> AppResult<Uuid> {
        self.enqueue(
            JobKind::HealthProbe,
            serde_json::to_value(payload)?,
            Duration::zero(),
        )
        .await
    }

    /// Enqueue a watch channel renewal
    ///
    /// # Errors
    ///
    /// Returns an error if the job cannot be persisted.
    pub async fn enqueue_webhook_renewal(
        &self,
        payload: &WebhookRenewalPayload,
    ) -> AppResult<Uuid> {
        self.enqueue(
            JobKind::WebhookRenewal,
            serde_json::to_value(payload)?,
            Duration::zero(),
        )
        .await
    }
}

/// Worker pool consuming the named queues plus the periodic sweeps
/// (watch renewal, fallback reconciliation, job retention).
pub struct WorkerPool {
    database: Arc<Database>,
    queue: Arc<QueueClient>,
    handlers: Arc<JobHandlers>,
    tokens: Arc<SecureTokenStore>,
    auditor: Arc<SecurityAuditor>,
    poll_interval: StdDuration,
    sweep_interval: StdDuration,
    job_retention: Duration,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl WorkerPool {
    /// Create a new pool (explicit construction; no module-level state)
    #[must_use]
    pub fn new(
        database: Arc<Database>,
        queue: Arc<QueueClient>,
        handlers: Arc<JobHandlers>,
        tokens: Arc<SecureTokenStore>,
        auditor: Arc<SecurityAuditor>,
        poll_interval: StdDuration,
        sweep_interval: StdDuration,
        job_retention: Duration,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            database,
            queue,
            handlers,
            tokens,
            auditor,
            poll_interval,
            sweep_interval,
            job_retention,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Spawn one polling loop per named queue plus the sweep loop.
    /// Returns the task handles; await them after [`Self::shutdown`] for a
    /// clean teardown.
    #[must_use]
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let queues = [
            crate::constants::queues::TOKEN_ENCRYPTION,
            crate::constants::queues::SYNC_INIT,
            crate::constants::queues::HEALTH_PROBE,
            crate::constants::queues::WEBHOOK_RENEWAL,
        ];

        let mut handles = Vec::with_capacity(queues.len() + 1);
        for queue_name in queues {
            let pool = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                pool.queue_loop(queue_name).await;
            }));
        }

        let pool = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            pool.sweep_loop().await;
        }));

        info!("Worker pool started");
        handles
    }

    /// Signal all loops to stop after their current iteration
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        info!("Worker pool shutdown requested");
    }

    /// Claim and process at most one due job on a queue. Returns whether a
    /// job was processed. Exposed so tests and operators can drive the queue
    /// deterministically.
    ///
    /// # Errors
    ///
    /// Returns an error if claiming fails; handler failures are absorbed into
    /// the job state machine, not returned.
    pub async fn run_queue_once(&self, queue: &str) -> AppResult<bool> {
        let Some(job) = self.database.claim_due_job(queue, Utc::now()).await? else {
            return Ok(false);
        };

        self.process(job).await;
        Ok(true)
    }

    /// Enqueue renewal jobs for every account whose persisted renewal
    /// deadline has passed. Clearing the deadline in the same pass guarantees
    /// exactly one job per due account.
    ///
    /// # Errors
    ///
    /// Returns an error if listing or enqueueing fails.
    pub async fn run_renewal_sweep(&self) -> AppResult<u32> {
        let due = self.database.list_accounts_watch_due(Utc::now()).await?;
        let mut enqueued = 0u32;

        for account in due {
            self.queue
                .enqueue_webhook_renewal(&WebhookRenewalPayload {
                    account_id: account.id,
                })
                .await?;
            self.database.clear_account_watch_due(account.id).await?;
            enqueued += 1;
        }

        if enqueued > 0 {
            info!(enqueued, "Renewal sweep enqueued watch renewals");
        }
        Ok(enqueued)
    }

    /// Re-encrypt a batch of fallback-encrypted tokens through the envelope
    /// engine once the KMS answers again
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails mid-sweep.
    pub async fn run_reconciliation_sweep(&self) -> AppResult<u32> {
        self.tokens.reconcile_fallback_tokens(50).await
    }

    /// Prune terminal job rows past the retention window
    ///
    /// # Errors
    ///
    /// Returns an error if the prune fails.
    pub async fn run_retention_prune(&self) -> AppResult<u64> {
        self.database
            .prune_finished_jobs(Utc::now() - self.job_retention)
            .await
    }

    /// Drive one job through the state machine:
    /// `active → completed | waiting (retry) | dead_letter`
    async fn process(&self, job: JobRecord) {
        let job_id = job.id;
        let kind = job.kind;

        match self.handlers.dispatch(&job).await {
            Ok(()) => {
                if let Err(e) = self.database.complete_job(job_id).await {
                    error!(job_id = %job_id, "Failed to mark job completed: {}", e);
                }
            }
            Err(job_error) => {
                if job.attempts >= job.max_attempts {
                    warn!(
                        job_id = %job_id,
                        kind = kind.as_str(),
                        attempts = job.attempts,
                        "Job exhausted attempts; dead-lettering: {}", job_error
                    );
                    if let Err(e) = self
                        .database
                        .dead_letter_job(job_id, &job_error.to_string())
                        .await
                    {
                        error!(job_id = %job_id, "Failed to dead-letter job: {}", e);
                    }
                    self.auditor
                        .log_dead_letter(job_id, kind.as_str(), &job_error.to_string())
                        .await;
                    self.handlers.on_dead_letter(&job, &job_error).await;
                } else {
                    let run_at = Utc::now() + job.backoff_delay();
                    warn!(
                        job_id = %job_id,
                        kind = kind.as_str(),
                        attempt = job.attempts,
                        retry_at = %run_at,
                        "Job failed; scheduling retry: {}", job_error
                    );
                    if let Err(e) = self
                        .database
                        .reschedule_job(job_id, run_at, &job_error.to_string())
                        .await
                    {
                        error!(job_id = %job_id, "Failed to reschedule job: {}", e);
                    }
                }
            }
        }
    }

    async fn queue_loop(&self, queue: &'static str) {
        let mut shutdown = self.shutdown_rx.clone();
        let mut tick = interval(self.poll_interval);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    // Drain everything due before sleeping again.
                    loop {
                        match self.run_queue_once(queue).await {
                            Ok(true) => {}
                            Ok(false) => break,
                            Err(e) => {
                                error!(queue, "Queue poll failed: {}", e);
                                break;
                            }
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(queue, "Queue worker stopped");
                        return;
                    }
                }
            }
        }
    }

    async fn sweep_loop(&self) {
        let mut shutdown = self.shutdown_rx.clone();
        let mut tick = interval(self.sweep_interval);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = self.run_renewal_sweep().await {
                        error!("Renewal sweep failed: {}", e);
                    }
                    if let Err(e) = self.run_reconciliation_sweep().await {
                        error!("Reconciliation sweep failed: {}", e);
                    }
                    if let Err(e) = self.run_retention_prune().await {
                        error!("Job retention prune failed: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Sweep worker stopped");
                        return;
                    }
                }
            }
        }
    }
}
