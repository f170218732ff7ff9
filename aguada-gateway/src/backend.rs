// Aguada Gateway - Receive, acknowledge and forward
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Backend ingest endpoints

use crate::config::BackendConfig;
use crate::error::{GatewayError, Result};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

/// Destination of forwarded records
pub trait Backend: Send {
    /// Deliver one record. `Ok` means the backend accepted it.
    fn post(&mut self, record: &Value) -> Result<()>;
}

impl<B: Backend + ?Sized> Backend for Box<B> {
    fn post(&mut self, record: &Value) -> Result<()> {
        (**self).post(record)
    }
}

/// JSON-over-HTTP backend
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::blocking::Client,
    url: String,
}

impl HttpBackend {
    /// Build a client with the configured per-request timeout
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(config.timeout())
            .connect_timeout(config.timeout())
            .build()
            .map_err(|e| GatewayError::BackendUnreachable {
                reason: format!("client setup failed: {}", e),
            })?;
        Ok(Self {
            client,
            url: config.url.clone(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Backend for HttpBackend {
    fn post(&mut self, record: &Value) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(record)
            .send()
            .map_err(|e| GatewayError::BackendUnreachable {
                reason: e.to_string(),
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(GatewayError::BackendStatus {
                status: status.as_u16(),
            })
        }
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    records: Vec<Value>,
    offline: bool,
    reject_status: Option<u16>,
    latency: Duration,
    attempts: u64,
}

/// In-memory backend; clones share the same record log
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Simulate the network path going up or down
    pub fn set_online(&self, online: bool) {
        self.lock().offline = !online;
    }

    /// Answer every post with `status` until cleared
    pub fn reject_with(&self, status: Option<u16>) {
        self.lock().reject_status = status;
    }

    /// Delay every post by `latency`, like a slow ingest server
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Accepted records, in arrival order
    pub fn records(&self) -> Vec<Value> {
        self.lock().records.clone()
    }

    /// Posts attempted, accepted or not
    pub fn attempts(&self) -> u64 {
        self.lock().attempts
    }
}

impl Backend for MemoryBackend {
    fn post(&mut self, record: &Value) -> Result<()> {
        let latency = self.lock().latency;
        if !latency.is_zero() {
            thread::sleep(latency);
        }
        let mut inner = self.lock();
        inner.attempts += 1;
        if inner.offline {
            return Err(GatewayError::BackendUnreachable {
                reason: "network down".to_string(),
            });
        }
        if let Some(status) = inner.reject_status {
            return Err(GatewayError::BackendStatus { status });
        }
        inner.records.push(record.clone());
        Ok(())
    }
}
