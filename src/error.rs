// Aguada - Water-level telemetry protocol
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Error types for Aguada
//!
//! This module defines all error types used throughout the library.

use thiserror::Error;

/// Result type alias for Aguada operations
pub type Result<T> = std::result::Result<T, AguadaError>;

/// Main error type for Aguada operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AguadaError {
    /// Encoding error
    #[error("Encoding error: {0}")]
    Encode(#[from] EncodeError),

    /// Decoding error
    #[error("Decoding error: {0}")]
    Decode(#[from] DecodeError),

    /// Durable storage error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Radio error
    #[error("Radio error: {0}")]
    Radio(#[from] RadioError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Errors during encoding
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EncodeError {
    /// Packet would not fit in a single radio frame
    #[error("Payload too large: {size} bytes exceeds maximum {max}")]
    PayloadTooLarge { size: usize, max: usize },

    /// Label longer than the wire format allows
    #[error("Label too long: {len} bytes exceeds maximum {max}")]
    LabelTooLong { len: usize, max: usize },

    /// String value longer than the wire format allows
    #[error("String value too long: {len} bytes exceeds maximum {max}")]
    ValueTooLong { len: usize, max: usize },

    /// Too many key-value pairs
    #[error("Too many pairs: maximum {max}")]
    TooManyPairs { max: usize },

    /// Field value outside its domain
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Errors during decoding
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// Leading identification byte does not match the expected format
    #[error("Bad magic: expected 0x{expected:02x}, got 0x{actual:02x}")]
    BadMagic { expected: u8, actual: u8 },

    /// Version byte not understood by this codec revision
    #[error("Bad version: expected {expected}, got {actual}")]
    BadVersion { expected: u8, actual: u8 },

    /// Length differs from the exact size or is inconsistent with the contents
    #[error("Bad length: expected {expected} bytes, got {actual}")]
    BadLength { expected: usize, actual: usize },

    /// A field value is outside its domain
    #[error("Bad field at offset {offset}: {reason}")]
    BadField { offset: usize, reason: String },
}

/// Errors from the durable key-value store
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    /// Underlying I/O failure
    #[error("I/O error on key {key}: {reason}")]
    Io { key: String, reason: String },

    /// Stored blob does not have the expected shape
    #[error("Corrupt blob {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Errors related to the radio link
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RadioError {
    /// Frame exceeds the link payload ceiling
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// Destination is not a registered peer
    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    /// Transmission failed at the driver level
    #[error("Send failed: {reason}")]
    SendFailed { reason: String },

    /// Channel outside the regulatory 2.4 GHz range
    #[error("Invalid channel: {0} (expected 1..=14)")]
    InvalidChannel(u8),
}

/// Invalid configuration, rejected at setup
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// A parameter is outside its allowed range
    #[error("Invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}
