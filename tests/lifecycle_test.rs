// ABOUTME: End-to-end scenarios for the connect saga across KMS health states
// ABOUTME: Mirrors the operator-visible guarantees: statuses, jobs, and audit trail
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Meridian CRM

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![allow(missing_docs)]

mod common;

use common::{
    connect_fresh_account, create_test_harness, create_test_org, drain_queue, sample_tokens,
    KmsMode,
};
use meridian_crm::accounts::ConnectRequest;
use meridian_crm::constants::queues;
use meridian_crm::errors::AppError;
use meridian_crm::models::{AccountStatus, EncryptionMethod, EncryptionStatus};
use meridian_crm::queue::JobStatus;

#[tokio::test]
async fn fresh_tenant_with_healthy_kms_connects_cleanly() {
    let harness = create_test_harness().await;
    let outcome = connect_fresh_account(&harness).await;

    // Both credentials encrypted under the envelope path.
    assert!(outcome.encryption_ok);
    assert_eq!(outcome.token_infos.len(), 2);
    for info in &outcome.token_infos {
        assert_eq!(info.encryption_status, EncryptionStatus::Ok);
        assert_eq!(info.encryption_method, Some(EncryptionMethod::Kms));
    }

    // Account committed as connected.
    let account = harness
        .ctx
        .database
        .get_integration_account(outcome.account_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(account.status, AccountStatus::Connected);
    assert_eq!(account.encryption_status, EncryptionStatus::Ok);
    assert!(account.access_token_ref.is_some());
    assert!(account.refresh_token_ref.is_some());

    // Exactly one sync-init job enqueued, zero dead-letters anywhere.
    let sync_jobs = harness
        .ctx
        .database
        .list_jobs(queues::SYNC_INIT, JobStatus::Waiting)
        .await
        .unwrap();
    assert_eq!(sync_jobs.len(), 1);

    for queue in [
        queues::TOKEN_ENCRYPTION,
        queues::SYNC_INIT,
        queues::HEALTH_PROBE,
        queues::WEBHOOK_RENEWAL,
    ] {
        let dead = harness
            .ctx
            .database
            .list_jobs(queue, JobStatus::DeadLetter)
            .await
            .unwrap();
        assert!(dead.is_empty());
    }

    // Sync hands the account to the collaborator.
    drain_queue(&harness.ctx, queues::SYNC_INIT).await;
    assert_eq!(harness.sync.launch_count(), 1);

    // Audit trail: org bootstrap plus one encryption event per credential.
    assert_eq!(
        harness
            .ctx
            .database
            .count_audit_events(outcome.org_id, "organization_created")
            .await
            .unwrap(),
        1
    );
    assert_eq!(
        harness
            .ctx
            .database
            .count_audit_events(outcome.org_id, "credential_encrypted")
            .await
            .unwrap(),
        2
    );
}

#[tokio::test]
async fn kms_outage_during_onboarding_takes_the_availability_path() {
    let harness = create_test_harness().await;
    let org_id = create_test_org(&harness).await;

    harness.kms.set_mode(KmsMode::Unavailable);
    let outcome = common::connect_account(&harness, org_id).await;

    // Availability over per-tenant keys: both tokens ok via fallback, no
    // failed status recorded anywhere.
    assert!(outcome.encryption_ok);
    for info in &outcome.token_infos {
        assert_eq!(info.encryption_status, EncryptionStatus::Ok);
        assert_eq!(info.encryption_method, Some(EncryptionMethod::Fallback));
    }

    let account = harness
        .ctx
        .database
        .get_integration_account(outcome.account_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(account.status, AccountStatus::Connected);
    assert_eq!(account.encryption_status, EncryptionStatus::Ok);

    // No retry jobs: the fallback path is success, not failure.
    let encrypt_jobs = harness
        .ctx
        .database
        .list_jobs(queues::TOKEN_ENCRYPTION, JobStatus::Waiting)
        .await
        .unwrap();
    assert!(encrypt_jobs.is_empty());

    // Fallback engagement is visible to operators.
    assert_eq!(
        harness
            .ctx
            .database
            .count_audit_events(org_id, "fallback_cipher_engaged")
            .await
            .unwrap(),
        2
    );

    // Once the KMS recovers, the sweep upgrades the rows in place.
    harness.kms.set_mode(KmsMode::Available);
    let reconciled = harness
        .ctx
        .worker_pool
        .run_reconciliation_sweep()
        .await
        .unwrap();
    assert_eq!(reconciled, 2);

    let refs: Vec<String> = [
        account.access_token_ref.clone().unwrap(),
        account.refresh_token_ref.clone().unwrap(),
    ]
    .to_vec();
    for token_ref in &refs {
        let row = harness
            .ctx
            .database
            .get_secure_token(token_ref)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.encryption_method, Some(EncryptionMethod::Kms));
    }

    let data = harness.ctx.tokens.get_tokens(&refs).await.unwrap();
    assert_eq!(data.access_token, sample_tokens().access_token);
}

#[tokio::test]
async fn org_bootstrap_requires_the_kms() {
    let harness = create_test_harness().await;

    // A tenant whose DEK cannot be wrapped would never be able to decrypt
    // anything; bootstrap fails fast instead.
    harness.kms.set_mode(KmsMode::Unavailable);
    let result = harness
        .ctx
        .accounts
        .connect(ConnectRequest {
            org_id: None,
            org_name: "Acme Corp".to_owned(),
            provider: "google".to_owned(),
            email: "ops@acme.test".to_owned(),
            external_account_id: None,
            tokens: sample_tokens(),
        })
        .await;

    assert!(matches!(result, Err(AppError::KmsUnavailable(_))));
}

#[tokio::test]
async fn reconnecting_the_same_mailbox_reuses_the_account_row() {
    let harness = create_test_harness().await;
    let first = connect_fresh_account(&harness).await;

    // The user re-runs the OAuth flow for the same mailbox.
    let second = common::connect_account(&harness, first.org_id).await;

    assert_eq!(first.account_id, second.account_id, "upsert, not duplicate");

    let accounts = harness
        .ctx
        .database
        .list_org_integration_accounts(first.org_id)
        .await
        .unwrap();
    assert_eq!(accounts.len(), 1);
}
