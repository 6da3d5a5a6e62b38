// ABOUTME: Environment-driven server configuration with startup validation
// ABOUTME: Key material is base64-decoded and length-checked before anything runs
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Meridian CRM

//! Server configuration loaded from environment variables.
//!
//! Configuration is environment-only: there is no config file layer. Key
//! material (`MERIDIAN_MASTER_KEY`, `MERIDIAN_FALLBACK_SECRET`) is validated
//! at load time so a misconfigured deployment fails before accepting work.

use crate::constants::time;
use crate::errors::{AppError, AppResult};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::env;
use std::time::Duration;

/// Expected master key length in bytes (AES-256)
const MASTER_KEY_LEN: usize = 32;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Database connection URL
    pub database_url: String,
    /// KMS master key used by the local KMS provider to wrap per-org DEKs
    pub master_key: [u8; 32],
    /// Long-lived application secret feeding the fallback cipher derivation
    pub fallback_secret: String,
    /// TTL for cached plaintext DEKs
    pub dek_cache_ttl: Duration,
    /// Timeout applied to every outbound provider call
    pub provider_timeout: Duration,
    /// Base URL for provider REST calls (overridable for tests/staging)
    pub provider_base_url: String,
    /// URL the provider pushes watch notifications to
    pub webhook_callback_url: String,
    /// Optional shared secret echoed back in webhook notifications
    pub webhook_channel_token: Option<String>,
    /// Maximum concurrently running health probes
    pub probe_concurrency: usize,
    /// Interval between worker polls of the job queue
    pub queue_poll_interval: Duration,
    /// Interval between watch-renewal / reconciliation sweeps
    pub sweep_interval: Duration,
    /// Age after which terminal job rows are pruned
    pub job_retention: chrono::Duration,
}

impl ServerConfig {
    /// Load configuration from environment variables
    ///
    /// # Errors
    ///
    /// Returns an error if a required variable is missing or malformed, or
    /// the master key is not exactly 32 bytes after base64 decoding.
    pub fn from_env() -> AppResult<Self> {
        let database_url = env::var("DATABASE_URL")
            .map_err(|_| AppError::config("DATABASE_URL is required"))?;

        let master_key_b64 = env::var("MERIDIAN_MASTER_KEY")
            .map_err(|_| AppError::config("MERIDIAN_MASTER_KEY is required"))?;
        let master_key = decode_master_key(&master_key_b64)?;

        let fallback_secret = env::var("MERIDIAN_FALLBACK_SECRET")
            .map_err(|_| AppError::config("MERIDIAN_FALLBACK_SECRET is required"))?;
        if fallback_secret.len() < 16 {
            return Err(AppError::config(
                "MERIDIAN_FALLBACK_SECRET must be at least 16 characters",
            ));
        }

        let webhook_callback_url = env::var("MERIDIAN_WEBHOOK_CALLBACK_URL")
            .unwrap_or_else(|_| "https://localhost/webhooks/google".to_owned());

        Ok(Self {
            database_url,
            master_key,
            fallback_secret,
            dek_cache_ttl: Duration::from_secs(
                env_u64("MERIDIAN_DEK_CACHE_TTL_SECS", time::DEK_CACHE_TTL_SECS)?,
            ),
            provider_timeout: Duration::from_secs(env_u64("MERIDIAN_PROVIDER_TIMEOUT_SECS", 10)?),
            provider_base_url: env::var("MERIDIAN_PROVIDER_BASE_URL")
                .unwrap_or_else(|_| "https://www.googleapis.com".to_owned()),
            webhook_callback_url,
            webhook_channel_token: env::var("MERIDIAN_WEBHOOK_CHANNEL_TOKEN").ok(),
            probe_concurrency: usize::try_from(env_u64("MERIDIAN_PROBE_CONCURRENCY", 4)?)
                .map_err(|e| AppError::config(format!("invalid probe concurrency: {e}")))?,
            queue_poll_interval: Duration::from_millis(env_u64(
                "MERIDIAN_QUEUE_POLL_INTERVAL_MS",
                500,
            )?),
            sweep_interval: Duration::from_secs(env_u64("MERIDIAN_SWEEP_INTERVAL_SECS", 60)?),
            job_retention: chrono::Duration::hours(env_i64("MERIDIAN_JOB_RETENTION_HOURS", 72)?),
        })
    }
}

/// Decode and length-check the base64 master key
fn decode_master_key(encoded: &str) -> AppResult<[u8; 32]> {
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| AppError::config(format!("MERIDIAN_MASTER_KEY is not valid base64: {e}")))?;

    if bytes.len() != MASTER_KEY_LEN {
        return Err(AppError::config(format!(
            "MERIDIAN_MASTER_KEY must be {MASTER_KEY_LEN} bytes, got {}",
            bytes.len()
        )));
    }

    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}

fn env_u64(name: &str, default: u64) -> AppResult<u64> {
    match env::var(name) {
        Ok(v) => v
            .parse()
            .map_err(|e| AppError::config(format!("{name} must be an integer: {e}"))),
        Err(_) => Ok(default),
    }
}

fn env_i64(name: &str, default: i64) -> AppResult<i64> {
    match env::var(name) {
        Ok(v) => v
            .parse()
            .map_err(|e| AppError::config(format!("{name} must be an integer: {e}"))),
        Err(_) => Ok(default),
    }
}
