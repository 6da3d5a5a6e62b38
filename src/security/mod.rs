// ABOUTME: Security module housing audit logging for the integration core
// ABOUTME: Credential access, encryption outcomes, and channel lifecycle are all audited
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Meridian CRM

//! # Security Module
//!
//! Audit logging for security-sensitive operations: credential encryption and
//! access, fallback-cipher engagement, probe classifications, and watch
//! channel lifecycle events.

/// Security audit logging
pub mod audit;

pub use audit::{AuditEvent, AuditEventType, AuditSeverity, SecurityAuditor};
