// ABOUTME: Tests for the durable retry queue: chaining, backoff, dead-lettering, retention
// ABOUTME: Queues are driven deterministically; backoff is fast-forwarded via the database
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Meridian CRM

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![allow(missing_docs)]

mod common;

use chrono::{Duration, Utc};
use common::{
    connect_account, connect_fresh_account, create_test_harness, create_test_org, drain_queue,
    make_jobs_due, KmsMode,
};
use meridian_crm::constants::queues;
use meridian_crm::models::{AccountStatus, EncryptionStatus};
use meridian_crm::queue::{InitialSyncPayload, JobStatus};

#[tokio::test]
async fn failed_encryption_recovers_through_the_retry_queue() {
    let harness = create_test_harness().await;
    let org_id = create_test_org(&harness).await;

    // Connect while the KMS hard-fails: both tokens persist as failed rows
    // and one retry job per credential is enqueued.
    harness.kms.set_mode(KmsMode::AuthFail);
    let outcome = connect_account(&harness, org_id).await;
    assert!(!outcome.encryption_ok);

    let waiting = harness
        .ctx
        .database
        .list_jobs(queues::TOKEN_ENCRYPTION, JobStatus::Waiting)
        .await
        .unwrap();
    assert_eq!(waiting.len(), 2);

    // KMS recovers; drain the encryption queue.
    harness.kms.set_mode(KmsMode::Available);
    let processed = drain_queue(&harness.ctx, queues::TOKEN_ENCRYPTION).await;
    assert_eq!(processed, 2);

    // Account flipped to ok and exactly one sync job was chained.
    let account = harness
        .ctx
        .database
        .get_integration_account(outcome.account_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(account.encryption_status, EncryptionStatus::Ok);

    let sync_jobs = harness
        .ctx
        .database
        .list_jobs(queues::SYNC_INIT, JobStatus::Waiting)
        .await
        .unwrap();
    assert_eq!(sync_jobs.len(), 1, "sync must be chained exactly once");

    // Sync executes and reaches the collaborator.
    let processed = drain_queue(&harness.ctx, queues::SYNC_INIT).await;
    assert_eq!(processed, 1);
    assert_eq!(harness.sync.launch_count(), 1);

    // Nothing dead-lettered anywhere.
    for queue in [queues::TOKEN_ENCRYPTION, queues::SYNC_INIT] {
        let dead = harness
            .ctx
            .database
            .list_jobs(queue, JobStatus::DeadLetter)
            .await
            .unwrap();
        assert!(dead.is_empty());
    }
}

#[tokio::test]
async fn failed_attempt_is_rescheduled_with_backoff() {
    let harness = create_test_harness().await;
    let org_id = create_test_org(&harness).await;

    harness.kms.set_mode(KmsMode::AuthFail);
    let _outcome = connect_account(&harness, org_id).await;

    // One pass over both due jobs: each fails its first attempt.
    make_jobs_due(&harness.ctx).await;
    assert!(harness
        .ctx
        .worker_pool
        .run_queue_once(queues::TOKEN_ENCRYPTION)
        .await
        .unwrap());
    assert!(harness
        .ctx
        .worker_pool
        .run_queue_once(queues::TOKEN_ENCRYPTION)
        .await
        .unwrap());

    // Both are now backing off in the future; nothing is claimable.
    assert!(!harness
        .ctx
        .worker_pool
        .run_queue_once(queues::TOKEN_ENCRYPTION)
        .await
        .unwrap());

    let waiting = harness
        .ctx
        .database
        .list_jobs(queues::TOKEN_ENCRYPTION, JobStatus::Waiting)
        .await
        .unwrap();
    assert_eq!(waiting.len(), 2);
    for job in &waiting {
        assert_eq!(job.attempts, 1);
        assert!(job.run_at > Utc::now(), "backoff must push run_at out");
        assert!(job.last_error.is_some());
    }
}

#[tokio::test]
async fn exhausted_encryption_job_dead_letters_with_account_side_effects() {
    let harness = create_test_harness().await;
    let org_id = create_test_org(&harness).await;

    harness.kms.set_mode(KmsMode::AuthFail);
    let outcome = connect_account(&harness, org_id).await;

    // KMS never recovers: every attempt fails until both jobs park.
    let processed = drain_queue(&harness.ctx, queues::TOKEN_ENCRYPTION).await;
    assert_eq!(processed, 2 * 5, "five attempts per credential");

    let dead = harness
        .ctx
        .database
        .list_jobs(queues::TOKEN_ENCRYPTION, JobStatus::DeadLetter)
        .await
        .unwrap();
    assert_eq!(dead.len(), 2, "dead-lettered, not silently dropped");

    let waiting = harness
        .ctx
        .database
        .list_jobs(queues::TOKEN_ENCRYPTION, JobStatus::Waiting)
        .await
        .unwrap();
    assert!(waiting.is_empty(), "no further automatic retries");

    // Human-visible terminal state on the account.
    let account = harness
        .ctx
        .database
        .get_integration_account(outcome.account_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(account.encryption_status, EncryptionStatus::Failed);
    assert_eq!(account.status, AccountStatus::ActionNeeded);
    assert!(account.error_reason.is_some());

    // No sync was ever chained.
    assert_eq!(harness.sync.launch_count(), 0);
}

#[tokio::test]
async fn sync_job_never_executes_while_encryption_is_not_ok() {
    let harness = create_test_harness().await;
    let org_id = create_test_org(&harness).await;

    harness.kms.set_mode(KmsMode::AuthFail);
    let outcome = connect_account(&harness, org_id).await;

    // Adversarial producer: enqueue a sync job even though encryption failed.
    harness
        .ctx
        .queue
        .enqueue_initial_sync(&InitialSyncPayload {
            org_id: outcome.org_id,
            account_id: outcome.account_id,
            provider: "google".to_owned(),
        })
        .await
        .unwrap();

    let processed = drain_queue(&harness.ctx, queues::SYNC_INIT).await;
    assert_eq!(processed, 3, "three attempts, then dead-letter");

    let dead = harness
        .ctx
        .database
        .list_jobs(queues::SYNC_INIT, JobStatus::DeadLetter)
        .await
        .unwrap();
    assert_eq!(dead.len(), 1);

    // The pre-execution re-check held: sync never reached the collaborator.
    assert_eq!(harness.sync.launch_count(), 0);
}

#[tokio::test]
async fn completed_jobs_are_pruned_after_retention() {
    let harness = create_test_harness().await;
    let outcome = connect_fresh_account(&harness).await;
    assert!(outcome.encryption_ok);

    let processed = drain_queue(&harness.ctx, queues::SYNC_INIT).await;
    assert_eq!(processed, 1);

    // Terminal rows are retained for inspection...
    let completed = harness
        .ctx
        .database
        .list_jobs(queues::SYNC_INIT, JobStatus::Completed)
        .await
        .unwrap();
    assert_eq!(completed.len(), 1);

    // ...until they age past the retention window.
    sqlx::query("UPDATE jobs SET finished_at = $1 WHERE status = 'completed'")
        .bind(Utc::now() - Duration::hours(100))
        .execute(harness.ctx.database.pool())
        .await
        .unwrap();

    let pruned = harness.ctx.worker_pool.run_retention_prune().await.unwrap();
    assert!(pruned >= 1);

    let completed = harness
        .ctx
        .database
        .list_jobs(queues::SYNC_INIT, JobStatus::Completed)
        .await
        .unwrap();
    assert!(completed.is_empty());
}

#[tokio::test]
async fn duplicate_delivery_of_encryption_jobs_is_safe() {
    let harness = create_test_harness().await;
    let org_id = create_test_org(&harness).await;

    harness.kms.set_mode(KmsMode::AuthFail);
    let outcome = connect_account(&harness, org_id).await;

    // Duplicate one of the waiting jobs wholesale (at-least-once delivery).
    let waiting = harness
        .ctx
        .database
        .list_jobs(queues::TOKEN_ENCRYPTION, JobStatus::Waiting)
        .await
        .unwrap();
    let payload = waiting[0].payload.clone();
    harness
        .ctx
        .queue
        .enqueue(
            meridian_crm::queue::JobKind::EncryptToken,
            payload,
            Duration::zero(),
        )
        .await
        .unwrap();

    harness.kms.set_mode(KmsMode::Available);
    drain_queue(&harness.ctx, queues::TOKEN_ENCRYPTION).await;

    // Reprocessing is safe: still exactly one sync job for the account.
    let sync_jobs = harness
        .ctx
        .database
        .list_jobs(queues::SYNC_INIT, JobStatus::Waiting)
        .await
        .unwrap();
    assert_eq!(sync_jobs.len(), 1);

    let account = harness
        .ctx
        .database
        .get_integration_account(outcome.account_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(account.encryption_status, EncryptionStatus::Ok);
}
