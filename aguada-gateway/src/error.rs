// Aguada Gateway - Receive, acknowledge and forward
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Error types for Aguada Gateway

use thiserror::Error;

/// Main error type for Gateway operations
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Protocol-level error from the core crate
    #[error("Protocol error: {0}")]
    Protocol(#[from] aguada::AguadaError),

    /// Durable storage failure
    #[error("Storage error: {0}")]
    Storage(#[from] aguada::StorageError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(#[from] aguada::ConfigError),

    /// Backend could not be reached
    #[error("Backend unreachable: {reason}")]
    BackendUnreachable { reason: String },

    /// Backend answered with a non-success status
    #[error("Backend rejected record: HTTP {status}")]
    BackendStatus { status: u16 },

    /// Worker thread could not be started or panicked
    #[error("Worker {name} failed: {reason}")]
    Worker { name: &'static str, reason: String },
}

/// Result type alias for Gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;
