// ABOUTME: Tests for the watch channel manager: setup, renewal sweep, fail-closed validation
// ABOUTME: Renewal deadlines are persisted state, not in-process timers
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Meridian CRM

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![allow(missing_docs)]

mod common;

use chrono::{Duration, Utc};
use common::{connect_fresh_account, create_test_harness, create_test_harness_with_db, drain_queue};
use meridian_crm::constants::{queues, webhook_headers};
use meridian_crm::errors::AppError;
use meridian_crm::models::AccountStatus;
use std::collections::HashMap;
use std::sync::atomic::Ordering;

fn notification_headers() -> HashMap<String, String> {
    HashMap::from([
        (
            webhook_headers::CHANNEL_ID.to_owned(),
            "channel-abc".to_owned(),
        ),
        (
            webhook_headers::RESOURCE_ID.to_owned(),
            "resource-1".to_owned(),
        ),
        (webhook_headers::RESOURCE_STATE.to_owned(), "exists".to_owned()),
        (
            webhook_headers::CHANNEL_TOKEN.to_owned(),
            "shared-webhook-secret".to_owned(),
        ),
    ])
}

#[tokio::test]
async fn connect_registers_watch_and_persists_renewal_deadline() {
    let harness = create_test_harness().await;
    let outcome = connect_fresh_account(&harness).await;

    assert_eq!(harness.api.watch_calls.load(Ordering::SeqCst), 1);

    let account = harness
        .ctx
        .database
        .get_integration_account(outcome.account_id)
        .await
        .unwrap()
        .unwrap();

    assert!(account.channel_id.is_some());
    assert!(account.channel_resource_id.is_some());

    let expiration = account.channel_expiration.unwrap();
    let renewal_due = account.watch_renewal_due.unwrap();

    // Renewal runs 24h ahead of expiry.
    let lead = expiration - renewal_due;
    assert!((lead - Duration::hours(24)).num_seconds().abs() < 5);
    assert!(renewal_due > Utc::now());
}

#[tokio::test]
async fn imminent_expiry_clamps_renewal_to_now() {
    let harness = create_test_harness().await;

    // Channels come back only 2 hours from expiry: the 24h lead would be
    // negative, so renewal must be due immediately rather than dropped.
    harness
        .api
        .watch_expiration_secs
        .store(2 * 3600, Ordering::SeqCst);
    let outcome = connect_fresh_account(&harness).await;

    let account = harness
        .ctx
        .database
        .get_integration_account(outcome.account_id)
        .await
        .unwrap()
        .unwrap();
    let renewal_due = account.watch_renewal_due.unwrap();
    assert!(renewal_due <= Utc::now() + Duration::seconds(5));
}

#[tokio::test]
async fn renewal_sweep_enqueues_exactly_one_job_per_due_account() {
    let harness = create_test_harness().await;
    harness
        .api
        .watch_expiration_secs
        .store(2 * 3600, Ordering::SeqCst);
    let _outcome = connect_fresh_account(&harness).await;

    let enqueued = harness.ctx.worker_pool.run_renewal_sweep().await.unwrap();
    assert_eq!(enqueued, 1);

    // The deadline was consumed; a second sweep finds nothing.
    let enqueued = harness.ctx.worker_pool.run_renewal_sweep().await.unwrap();
    assert_eq!(enqueued, 0);
}

#[tokio::test]
async fn renewal_job_stops_old_channel_and_mints_a_fresh_one() {
    let harness = create_test_harness().await;
    harness
        .api
        .watch_expiration_secs
        .store(2 * 3600, Ordering::SeqCst);
    let outcome = connect_fresh_account(&harness).await;

    let before = harness
        .ctx
        .database
        .get_integration_account(outcome.account_id)
        .await
        .unwrap()
        .unwrap();
    let old_channel = before.channel_id.clone().unwrap();

    // The renewed channel gets a healthy lifetime again.
    harness
        .api
        .watch_expiration_secs
        .store(7 * 24 * 3600, Ordering::SeqCst);

    harness.ctx.worker_pool.run_renewal_sweep().await.unwrap();
    let processed = drain_queue(&harness.ctx, queues::WEBHOOK_RENEWAL).await;
    assert_eq!(processed, 1);

    assert_eq!(harness.api.stop_calls.load(Ordering::SeqCst), 1);

    let after = harness
        .ctx
        .database
        .get_integration_account(outcome.account_id)
        .await
        .unwrap()
        .unwrap();
    let new_channel = after.channel_id.unwrap();
    assert_ne!(new_channel, old_channel);

    // New expiration persisted, next renewal scheduled ~24h ahead of it.
    let expiration = after.channel_expiration.unwrap();
    assert!(expiration > Utc::now() + Duration::days(6));
    let renewal_due = after.watch_renewal_due.unwrap();
    let lead = expiration - renewal_due;
    assert!((lead - Duration::hours(24)).num_seconds().abs() < 5);
}

#[tokio::test]
async fn failed_stop_does_not_abort_renewal() {
    let harness = create_test_harness().await;
    let outcome = connect_fresh_account(&harness).await;

    harness.api.stop_fail.store(true, Ordering::SeqCst);

    let channel = harness
        .ctx
        .watch
        .renew_watch(outcome.account_id)
        .await
        .expect("renewal must survive a failed stop");
    assert!(!channel.channel_id.is_empty());
    assert_eq!(harness.api.stop_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn setup_failure_marks_watch_failed() {
    let harness = create_test_harness().await;
    harness.api.watch_fail.store(true, Ordering::SeqCst);

    let outcome = connect_fresh_account(&harness).await;
    assert!(outcome.encryption_ok, "watch failure must not fail connect");

    let account = harness
        .ctx
        .database
        .get_integration_account(outcome.account_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(account.status, AccountStatus::WatchFailed);
    assert!(account.error_reason.is_some());
}

#[tokio::test]
async fn renewal_failure_marks_watch_renewal_failed() {
    let harness = create_test_harness().await;
    let outcome = connect_fresh_account(&harness).await;

    harness.api.watch_fail.store(true, Ordering::SeqCst);
    let result = harness.ctx.watch.renew_watch(outcome.account_id).await;
    assert!(result.is_err());

    let account = harness
        .ctx
        .database
        .get_integration_account(outcome.account_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(account.status, AccountStatus::WatchRenewalFailed);
}

#[tokio::test]
async fn renewal_deadline_survives_a_process_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("meridian.db");
    let database_url = format!("sqlite:{}", db_path.display());

    // First process: connect an account whose channel is close to expiry.
    {
        let harness = create_test_harness_with_db(&database_url).await;
        harness
            .api
            .watch_expiration_secs
            .store(2 * 3600, Ordering::SeqCst);
        let _outcome = connect_fresh_account(&harness).await;
    }

    // Second process: a fresh worker pool over the same database picks the
    // persisted deadline up on its first sweep. No in-process timer was lost.
    let harness = create_test_harness_with_db(&database_url).await;
    let enqueued = harness.ctx.worker_pool.run_renewal_sweep().await.unwrap();
    assert_eq!(enqueued, 1);

    let processed = drain_queue(&harness.ctx, queues::WEBHOOK_RENEWAL).await;
    assert_eq!(processed, 1);
}

#[tokio::test]
async fn valid_notification_passes_validation() {
    let harness = create_test_harness().await;

    let validated = harness
        .ctx
        .watch
        .validate_notification(&notification_headers())
        .unwrap();
    assert_eq!(validated.channel_id, "channel-abc");
    assert_eq!(validated.resource_id, "resource-1");
    assert_eq!(validated.state, "exists");
}

#[tokio::test]
async fn notification_validation_fails_closed() {
    let harness = create_test_harness().await;

    // Missing channel id.
    let mut headers = notification_headers();
    headers.remove(webhook_headers::CHANNEL_ID);
    assert!(matches!(
        harness.ctx.watch.validate_notification(&headers),
        Err(AppError::InvalidInput(_))
    ));

    // Empty resource id.
    let mut headers = notification_headers();
    headers.insert(webhook_headers::RESOURCE_ID.to_owned(), String::new());
    assert!(matches!(
        harness.ctx.watch.validate_notification(&headers),
        Err(AppError::InvalidInput(_))
    ));

    // Wrong shared secret.
    let mut headers = notification_headers();
    headers.insert(
        webhook_headers::CHANNEL_TOKEN.to_owned(),
        "wrong-secret".to_owned(),
    );
    assert!(matches!(
        harness.ctx.watch.validate_notification(&headers),
        Err(AppError::InvalidInput(_))
    ));

    // Missing shared secret while one is configured.
    let mut headers = notification_headers();
    headers.remove(webhook_headers::CHANNEL_TOKEN);
    assert!(matches!(
        harness.ctx.watch.validate_notification(&headers),
        Err(AppError::InvalidInput(_))
    ));
}
