// ABOUTME: Configuration management for the integration lifecycle server
// ABOUTME: Environment-only configuration, validated once at startup
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Meridian CRM

//! Configuration management and persistence

/// Environment-driven server configuration
pub mod environment;

pub use environment::ServerConfig;
