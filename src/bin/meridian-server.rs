// ABOUTME: Server binary wiring configuration, storage, and the worker pool
// ABOUTME: Explicit init and teardown; shuts down cleanly on SIGINT
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Meridian CRM

//! Meridian integration worker server.
//!
//! Boots the secure integration lifecycle core: database migrations, the
//! envelope crypto engine against the local KMS, the Google provider client,
//! and the worker pool consuming the retry queues and running the periodic
//! sweeps. The request layer is deployed separately and talks to the same
//! database.

use anyhow::Result;
use clap::Parser;
use meridian_crm::config::ServerConfig;
use meridian_crm::context::AppContext;
use meridian_crm::crypto::LocalKms;
use meridian_crm::logging::init_logging;
use meridian_crm::providers::{GoogleApiClient, GoogleApiConfig};
use meridian_crm::queue::LoggingSyncLauncher;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "meridian-server", about = "Meridian CRM integration worker server")]
struct Args {
    /// Run pending database migrations and exit
    #[arg(long)]
    migrate_only: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let args = Args::parse();

    let config = ServerConfig::from_env()?;
    info!("Configuration loaded");

    let kms = Arc::new(LocalKms::new(config.master_key));
    let api = Arc::new(GoogleApiClient::new(GoogleApiConfig {
        base_url: config.provider_base_url.clone(),
        timeout: config.provider_timeout,
    })?);
    let sync = Arc::new(LoggingSyncLauncher);

    let context = AppContext::initialize(config, kms, api, sync).await?;

    if args.migrate_only {
        info!("Migrations complete, exiting");
        return Ok(());
    }

    let handles = context.worker_pool.start();
    info!("Meridian integration server running; press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    context.worker_pool.shutdown();
    for handle in handles {
        let _ = handle.await;
    }

    info!("Meridian integration server stopped");
    Ok(())
}
