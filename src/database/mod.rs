// ABOUTME: Core database management with migration system for SQLite
// ABOUTME: Handles organizations, secure tokens, integration accounts, jobs, and audit events
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Meridian CRM

//! Persistence layer for the secure integration lifecycle core.
//!
//! One focused impl file per table; all mutations are single-row,
//! last-write-wins at the field level. Each field has exactly one owning
//! component (the probe engine writes `status`, the retry queue writes
//! `encryption_status`, the watch manager writes the channel columns), so
//! row-level atomicity is all the coordination the storage layer provides.

/// Audit event persistence
pub mod audit_events;
/// Integration account rows (per external account connection)
pub mod integration_accounts;
/// Durable job rows backing the retry queue
pub mod jobs;
/// Organization (tenant) rows and wrapped DEK storage
pub mod organizations;
/// Secure token rows (encrypted OAuth credentials)
pub mod secure_tokens;

use crate::errors::{AppError, AppResult};
use sqlx::{Pool, Sqlite, SqlitePool};
use tracing::info;

/// Database connection pool
#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    /// Create a new database connection and run migrations
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Database URL is invalid or malformed
    /// - Database connection fails
    /// - `SQLite` file creation fails
    /// - Migration process fails
    pub async fn new(database_url: &str) -> AppResult<Self> {
        // Ensure SQLite creates the database file if it doesn't exist
        let connection_options = if database_url.starts_with("sqlite:") {
            format!("{database_url}?mode=rwc")
        } else {
            database_url.to_owned()
        };

        let pool = SqlitePool::connect(&connection_options)
            .await
            .map_err(|e| AppError::database(format!("Failed to connect to database: {e}")))?;

        let db = Self { pool };
        db.migrate().await?;

        Ok(db)
    }

    /// Get a reference to the database pool for advanced operations
    #[must_use]
    pub const fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Run all pending migrations embedded at compile time
    ///
    /// # Errors
    ///
    /// Returns an error if any migration fails or the connection is lost.
    pub async fn migrate(&self) -> AppResult<()> {
        info!("Running database migrations...");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::database(format!("Migration failed: {e}")))?;

        info!("Database migrations completed successfully");
        Ok(())
    }
}
