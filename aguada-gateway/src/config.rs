// Aguada Gateway - Receive, acknowledge and forward
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Gateway configuration

use crate::queue::MAX_CAPACITY;
use aguada::{CircuitConfig, ConfigError, DEFAULT_RADIO_CHANNEL};
use serde::Deserialize;
use std::time::Duration;

/// Backend connection settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Ingest endpoint receiving JSON POSTs
    pub url: String,
    /// Per-request timeout
    pub timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8080/ingest_sensorpacket.php".to_string(),
            timeout_ms: 3000,
        }
    }
}

impl BackendConfig {
    /// Request timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Configuration for the gateway
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Identifier reported in acknowledgements and backend records
    pub gateway_id: u8,
    /// Fixed radio channel
    pub radio_channel: u8,
    /// Slots between the receive context and the processing thread
    pub inbound_queue_capacity: usize,
    /// Slots between the processing thread and the forwarder thread
    pub forward_queue_capacity: usize,
    /// Packets the durable offline queue can hold
    pub offline_queue_capacity: u32,
    /// Processing thread receive timeout
    pub processing_timeout_ms: u64,
    /// Interval between diagnostic summaries
    pub housekeeping_interval_ms: u64,
    /// Wait between backend retries while it is unreachable
    pub retry_interval_ms: u64,
    /// Consecutive backend failures before backing off
    pub failure_threshold: u32,
    pub backend: BackendConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            gateway_id: 1,
            radio_channel: DEFAULT_RADIO_CHANNEL,
            inbound_queue_capacity: 20,
            forward_queue_capacity: 20,
            offline_queue_capacity: 256,
            processing_timeout_ms: 1000,
            housekeeping_interval_ms: 60_000,
            retry_interval_ms: 5000,
            failure_threshold: 1,
            backend: BackendConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Create config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: set gateway id
    pub fn with_gateway_id(mut self, gateway_id: u8) -> Self {
        self.gateway_id = gateway_id;
        self
    }

    /// Builder: set offline queue capacity
    pub fn with_offline_capacity(mut self, capacity: u32) -> Self {
        self.offline_queue_capacity = capacity;
        self
    }

    /// Builder: set backend retry interval
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Builder: set backend URL
    pub fn with_backend_url(mut self, url: impl Into<String>) -> Self {
        self.backend.url = url.into();
        self
    }

    /// Parse from JSON
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(text).map_err(|e| ConfigError::Invalid {
            field: "json",
            reason: e.to_string(),
        })
    }

    pub fn processing_timeout(&self) -> Duration {
        Duration::from_millis(self.processing_timeout_ms)
    }

    pub fn housekeeping_interval(&self) -> Duration {
        Duration::from_millis(self.housekeeping_interval_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    /// Circuit breaker settings for the backend
    pub fn circuit(&self) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: self.failure_threshold,
            trial_successes: 1,
            open_for: self.retry_interval(),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &'static str, reason: &str| ConfigError::Invalid {
            field,
            reason: reason.to_string(),
        };

        if self.inbound_queue_capacity == 0 {
            return Err(invalid("inbound_queue_capacity", "must be at least 1"));
        }
        if self.forward_queue_capacity == 0 {
            return Err(invalid("forward_queue_capacity", "must be at least 1"));
        }
        if self.offline_queue_capacity == 0 {
            return Err(invalid("offline_queue_capacity", "must be at least 1"));
        }
        if self.offline_queue_capacity > MAX_CAPACITY {
            return Err(invalid(
                "offline_queue_capacity",
                &format!("must not exceed {}", MAX_CAPACITY),
            ));
        }
        if self.processing_timeout_ms == 0 {
            return Err(invalid("processing_timeout_ms", "must be positive"));
        }
        if self.retry_interval_ms == 0 {
            return Err(invalid("retry_interval_ms", "must be positive"));
        }
        if self.failure_threshold == 0 {
            return Err(invalid("failure_threshold", "must be at least 1"));
        }
        if !(1..=14).contains(&self.radio_channel) {
            return Err(invalid("radio_channel", "must be in 1..=14"));
        }
        if self.backend.timeout_ms == 0 {
            return Err(invalid("backend.timeout_ms", "must be positive"));
        }
        if !(self.backend.url.starts_with("http://") || self.backend.url.starts_with("https://")) {
            return Err(invalid("backend.url", "must be an http(s) URL"));
        }
        Ok(())
    }
}
