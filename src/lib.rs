// ABOUTME: Main library entry point for the Meridian CRM integration backend
// ABOUTME: Secure credential lifecycle, retry queues, health probes, and watch channels
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Meridian CRM

#![deny(unsafe_code)]

//! # Meridian CRM — Secure Integration Lifecycle
//!
//! The machinery that keeps third-party integrations (Gmail/Calendar) alive
//! for a multi-tenant CRM:
//!
//! - **Envelope crypto**: per-organization data-encryption keys wrapped by a
//!   KMS, AES-256-GCM with AAD binding every ciphertext to its tenant and
//!   field
//! - **Secure token store**: encrypted OAuth credentials behind opaque
//!   references, with failures persisted as status instead of thrown
//! - **Fallback cipher**: degraded-mode encryption that keeps onboarding
//!   working through KMS outages
//! - **Retry job queue**: durable, backoff-scheduled recovery that chains
//!   encryption into initial sync and dead-letters instead of retrying
//!   forever
//! - **Health probes**: active provider checks that classify each account's
//!   usable state
//! - **Watch channels**: push-subscription lifecycle with durable renewal
//!   deadlines
//!
//! The request layer (tRPC/REST equivalents) is a caller of these services
//! and lives elsewhere; the server binary here wires configuration, storage,
//! and workers with explicit init and teardown.

/// Connect saga and tenant offboarding
pub mod accounts;

/// Configuration management and persistence
pub mod config;

/// Application constants and configuration values
pub mod constants;

/// Focused dependency injection context
pub mod context;

/// Envelope crypto engine, KMS providers, and the fallback cipher
pub mod crypto;

/// Multi-tenant database management
pub mod database;

/// Unified error handling with a closed error taxonomy
pub mod errors;

/// Production logging and structured output
pub mod logging;

/// Common data models
pub mod models;

/// Health probe engine for integration accounts
pub mod probe;

/// External provider clients (Gmail/Calendar)
pub mod providers;

/// Durable retry job queue and worker pool
pub mod queue;

/// Security audit logging
pub mod security;

/// Secure token store for encrypted OAuth credentials
pub mod tokens;

/// Watch channel manager for provider push notifications
pub mod watch;
