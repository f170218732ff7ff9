// Aguada - Water-level telemetry protocol
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Reliable delivery from a node to its gateways
//!
//! A packet is sent to the preferred gateway first and then round-robin to
//! the remaining configured gateways. Each gateway gets a fixed number of
//! transmissions with exponential backoff between them; each transmission
//! waits a bounded time for an acknowledgement carrying the same
//! `(node_id, sequence)`.
//!
//! The protocol lives in [`DeliveryMachine`], a pure state machine driven by
//! [`DeliveryEvent`]s. [`DeliveryEngine`] drives it against a real [`Radio`]
//! and [`AckSlot`].
//!
//! ```text
//! Idle ─start─▶ Sending ─Sent─▶ AwaitingAck ─Ack─▶ Success
//!                 ▲  │SendFailed     │AckTimeout
//!                 │  ▼               ▼
//!                 │  retries left? ──yes──▶ Backoff ─BackoffElapsed─▶ Sending
//!                 │        │no
//!                 └─ next endpoint? ──no──▶ Exhausted
//! ```

use crate::channel::{AckSlot, Radio, DEFAULT_RADIO_CHANNEL};
use crate::error::{ConfigError, StorageError};
use crate::metrics::DeliveryStats;
use crate::protocol::{AckPacket, MacAddress};
use crate::recovery::RetryStrategy;
use crate::storage::BlobStore;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Blob key of the preferred gateway index
pub const PREFERRED_GATEWAY_KEY: &str = "last_gw";

/// Blob key of the sequence counter of a single-sensor node
pub const DEFAULT_SEQUENCE_KEY: &str = "seq";

const ACK_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Delivery policy
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Static gateway list; `FF:FF:FF:FF:FF:FF` marks an unused slot
    pub gateways: Vec<MacAddress>,
    /// Transmissions per gateway before failing over
    pub attempts_per_endpoint: u32,
    /// Backoff before the first retry on the same gateway, doubling after
    pub initial_backoff_ms: u64,
    /// How long each transmission waits for its acknowledgement
    pub ack_timeout_ms: u64,
    /// Radio channel shared with the gateways, set on the radio at startup
    pub radio_channel: u8,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            gateways: vec![MacAddress::BROADCAST; 3],
            attempts_per_endpoint: 2,
            initial_backoff_ms: 100,
            ack_timeout_ms: 500,
            radio_channel: DEFAULT_RADIO_CHANNEL,
        }
    }
}

impl DeliveryConfig {
    /// Policy for a gateway list with default timing
    pub fn with_gateways(gateways: Vec<MacAddress>) -> Self {
        Self {
            gateways,
            ..Default::default()
        }
    }

    /// Check parameter ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.gateways.iter().any(MacAddress::is_configured) {
            return Err(ConfigError::invalid(
                "gateways",
                "at least one gateway address must be configured",
            ));
        }
        if self.gateways.len() > usize::from(u8::MAX) {
            return Err(ConfigError::invalid("gateways", "too many gateways"));
        }
        if self.attempts_per_endpoint == 0 {
            return Err(ConfigError::invalid("attempts_per_endpoint", "must be at least 1"));
        }
        if self.ack_timeout_ms == 0 {
            return Err(ConfigError::invalid("ack_timeout_ms", "must be positive"));
        }
        if !(1..=14).contains(&self.radio_channel) {
            return Err(ConfigError::invalid(
                "radio_channel",
                format!("{} is not in 1..=14", self.radio_channel),
            ));
        }
        Ok(())
    }

    /// Backoff schedule between transmissions to the same gateway
    pub fn retry_strategy(&self) -> RetryStrategy {
        RetryStrategy::exponential(
            self.attempts_per_endpoint.saturating_sub(1),
            Duration::from_millis(self.initial_backoff_ms),
        )
    }

    /// Acknowledgement wait per transmission
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// Attempt order: `preferred` first, then round-robin over configured slots
    pub fn endpoint_order(&self, preferred: usize) -> Vec<usize> {
        let n = self.gateways.len();
        (0..n)
            .map(|k| (preferred + k) % n.max(1))
            .filter(|&i| self.gateways[i].is_configured())
            .collect()
    }

    /// First configured slot
    pub fn first_configured(&self) -> usize {
        self.gateways
            .iter()
            .position(MacAddress::is_configured)
            .unwrap_or(0)
    }
}

/// Durable per-sensor sequence counter.
///
/// Values are reserved in memory and only written to storage once a gateway
/// confirms the packet. A value is never handed out twice within a process
/// lifetime.
#[derive(Debug, Clone)]
pub struct SequenceCounter {
    key: String,
    last_reserved: u32,
    persisted: u32,
}

impl SequenceCounter {
    /// Load the counter stored under `key` (0 when absent or unreadable)
    pub fn load<S: BlobStore + ?Sized>(store: &S, key: &str) -> Self {
        let persisted = match store.get_u32(key) {
            Ok(value) => value.unwrap_or(0),
            Err(e) => {
                log::warn!("sequence {} unreadable ({}), starting from 0", key, e);
                0
            }
        };
        Self {
            key: key.to_string(),
            last_reserved: persisted,
            persisted,
        }
    }

    /// Reserve the next sequence number
    pub fn reserve(&mut self) -> u32 {
        self.last_reserved = self.last_reserved.wrapping_add(1);
        self.last_reserved
    }

    /// Persist `sequence` after it was acknowledged
    pub fn commit<S: BlobStore + ?Sized>(&mut self, store: &mut S, sequence: u32) -> Result<(), StorageError> {
        store.set_u32(&self.key, sequence)?;
        self.persisted = sequence;
        Ok(())
    }

    /// Blob key
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Last value written to storage
    pub fn persisted(&self) -> u32 {
        self.persisted
    }

    /// Last value handed out
    pub fn last_reserved(&self) -> u32 {
        self.last_reserved
    }
}

/// Input to the delivery state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryEvent {
    /// The radio accepted the frame
    Sent,
    /// The radio reported a transmission failure
    SendFailed,
    /// An acknowledgement arrived (possibly for another packet)
    Ack(AckPacket),
    /// No matching acknowledgement within the timeout
    AckTimeout,
    /// The backoff delay has passed
    BackoffElapsed,
}

/// Delivery state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Idle,
    Sending { endpoint: usize, attempt: u32 },
    AwaitingAck { endpoint: usize, attempt: u32 },
    /// Waiting before the next retry on the same endpoint
    Backoff { endpoint: usize, attempt: u32, delay: Duration },
    Success { endpoint: usize },
    Exhausted,
}

/// What the driver has to do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Transmit the frame to this gateway
    Transmit { endpoint: usize, address: MacAddress },
    /// Wait for an acknowledgement, at most this long
    AwaitAck(Duration),
    /// Sleep before retrying
    Backoff(Duration),
    /// Delivery finished
    Finished(DeliveryOutcome),
}

/// Result of delivering one packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// A gateway confirmed the packet
    Delivered {
        endpoint: usize,
        ack: AckPacket,
        attempts: u32,
        failovers: u32,
    },
    /// Every configured gateway was tried without success
    Exhausted { attempts: u32, failovers: u32 },
}

impl DeliveryOutcome {
    /// Whether the packet was acknowledged
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered { .. })
    }
}

/// Per-packet delivery state machine
#[derive(Debug, Clone)]
pub struct DeliveryMachine {
    node_id: u8,
    sequence: u32,
    gateways: Vec<MacAddress>,
    order: Vec<usize>,
    position: usize,
    retry: RetryStrategy,
    ack_timeout: Duration,
    state: DeliveryState,
    attempts: u32,
    failovers: u32,
}

impl DeliveryMachine {
    /// Prepare delivery of `(node_id, sequence)` starting at `preferred`
    pub fn new(config: &DeliveryConfig, preferred: usize, node_id: u8, sequence: u32) -> Self {
        Self {
            node_id,
            sequence,
            gateways: config.gateways.clone(),
            order: config.endpoint_order(preferred),
            position: 0,
            retry: config.retry_strategy(),
            ack_timeout: config.ack_timeout(),
            state: DeliveryState::Idle,
            attempts: 0,
            failovers: 0,
        }
    }

    /// Current state
    pub fn state(&self) -> DeliveryState {
        self.state
    }

    /// Transmissions so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Leave `Idle` and emit the first action
    pub fn start(&mut self) -> Action {
        if self.state != DeliveryState::Idle {
            return self.pending_action();
        }
        match self.order.first() {
            Some(&endpoint) => self.transmit(endpoint, 0),
            None => self.exhaust(),
        }
    }

    /// Feed an event and get the next action
    pub fn handle(&mut self, event: DeliveryEvent) -> Action {
        match (self.state, event) {
            (DeliveryState::Sending { endpoint, attempt }, DeliveryEvent::Sent) => {
                self.state = DeliveryState::AwaitingAck { endpoint, attempt };
                Action::AwaitAck(self.ack_timeout)
            }
            (DeliveryState::Sending { endpoint, attempt }, DeliveryEvent::SendFailed) => {
                log::debug!(
                    "seq {} send to gateway {} failed (attempt {})",
                    self.sequence,
                    endpoint,
                    attempt + 1
                );
                self.attempt_failed(endpoint, attempt)
            }
            (DeliveryState::AwaitingAck { endpoint, .. }, DeliveryEvent::Ack(ack)) => {
                if !ack.confirms(self.node_id, self.sequence) {
                    log::debug!(
                        "ignoring ack for node {} seq {} while waiting for node {} seq {}",
                        ack.node_id,
                        ack.acked_sequence,
                        self.node_id,
                        self.sequence
                    );
                    return Action::AwaitAck(self.ack_timeout);
                }
                self.state = DeliveryState::Success { endpoint };
                Action::Finished(DeliveryOutcome::Delivered {
                    endpoint,
                    ack,
                    attempts: self.attempts,
                    failovers: self.failovers,
                })
            }
            (DeliveryState::AwaitingAck { endpoint, attempt }, DeliveryEvent::AckTimeout) => {
                log::debug!(
                    "seq {} no ack from gateway {} (attempt {})",
                    self.sequence,
                    endpoint,
                    attempt + 1
                );
                self.attempt_failed(endpoint, attempt)
            }
            (DeliveryState::Backoff { endpoint, attempt, .. }, DeliveryEvent::BackoffElapsed) => {
                self.transmit(endpoint, attempt)
            }
            (state, event) => {
                log::debug!("event {:?} ignored in state {:?}", event, state);
                self.pending_action()
            }
        }
    }

    fn transmit(&mut self, endpoint: usize, attempt: u32) -> Action {
        self.state = DeliveryState::Sending { endpoint, attempt };
        self.attempts += 1;
        Action::Transmit {
            endpoint,
            address: self.gateways[endpoint],
        }
    }

    fn attempt_failed(&mut self, endpoint: usize, attempt: u32) -> Action {
        if let Some(delay) = self.retry.delay_for_attempt(attempt) {
            self.state = DeliveryState::Backoff {
                endpoint,
                attempt: attempt + 1,
                delay,
            };
            return Action::Backoff(delay);
        }

        self.position += 1;
        match self.order.get(self.position) {
            Some(&next) => {
                self.failovers += 1;
                log::info!(
                    "seq {} failing over from gateway {} to gateway {}",
                    self.sequence,
                    endpoint,
                    next
                );
                self.transmit(next, 0)
            }
            None => self.exhaust(),
        }
    }

    fn exhaust(&mut self) -> Action {
        self.state = DeliveryState::Exhausted;
        Action::Finished(DeliveryOutcome::Exhausted {
            attempts: self.attempts,
            failovers: self.failovers,
        })
    }

    fn pending_action(&self) -> Action {
        match self.state {
            DeliveryState::Idle | DeliveryState::Exhausted => Action::Finished(DeliveryOutcome::Exhausted {
                attempts: self.attempts,
                failovers: self.failovers,
            }),
            DeliveryState::Sending { endpoint, .. } => Action::Transmit {
                endpoint,
                address: self.gateways[endpoint],
            },
            DeliveryState::AwaitingAck { .. } => Action::AwaitAck(self.ack_timeout),
            DeliveryState::Backoff { delay, .. } => Action::Backoff(delay),
            DeliveryState::Success { endpoint } => Action::Finished(DeliveryOutcome::Delivered {
                endpoint,
                ack: AckPacket::new(self.node_id, self.sequence, 0),
                attempts: self.attempts,
                failovers: self.failovers,
            }),
        }
    }
}

/// Drives [`DeliveryMachine`] against a radio, sleeping for real
pub struct DeliveryEngine<R: Radio> {
    config: DeliveryConfig,
    radio: R,
    acks: Arc<AckSlot>,
    preferred: usize,
    stats: DeliveryStats,
}

impl<R: Radio> DeliveryEngine<R> {
    /// Create an engine, registering every configured gateway as a peer
    pub fn new(config: DeliveryConfig, radio: R, acks: Arc<AckSlot>) -> Result<Self, ConfigError> {
        config.validate()?;
        radio
            .set_channel(config.radio_channel)
            .map_err(|e| ConfigError::invalid("radio_channel", e.to_string()))?;
        for gateway in config.gateways.iter().filter(|g| g.is_configured()) {
            if let Err(e) = radio.add_peer(*gateway) {
                log::warn!("could not register gateway {}: {}", gateway, e);
            }
        }
        let preferred = config.first_configured();
        Ok(Self {
            config,
            radio,
            acks,
            preferred,
            stats: DeliveryStats::new(),
        })
    }

    /// Restore the preferred gateway from storage
    pub fn load_preferred<S: BlobStore + ?Sized>(&mut self, store: &S) {
        match store.get_u8(PREFERRED_GATEWAY_KEY) {
            Ok(Some(index)) => {
                let index = usize::from(index);
                if self.config.gateways.get(index).is_some_and(MacAddress::is_configured) {
                    self.preferred = index;
                } else {
                    log::warn!("stored preferred gateway {} is not configured, ignoring", index);
                }
            }
            Ok(None) => {}
            Err(e) => log::warn!("preferred gateway unreadable: {}", e),
        }
    }

    /// Index of the gateway tried first
    pub fn preferred(&self) -> usize {
        self.preferred
    }

    /// Delivery statistics
    pub fn stats(&self) -> &DeliveryStats {
        &self.stats
    }

    /// Configuration in use
    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    /// Radio in use
    pub fn radio(&self) -> &R {
        &self.radio
    }

    /// Deliver one encoded frame identified by `(node_id, sequence)`
    pub fn deliver(&mut self, node_id: u8, sequence: u32, frame: &[u8]) -> DeliveryOutcome {
        self.stats.cycles += 1;
        self.acks.clear();

        let mut machine = DeliveryMachine::new(&self.config, self.preferred, node_id, sequence);
        let mut action = machine.start();
        loop {
            action = match action {
                Action::Transmit { endpoint, address } => {
                    self.stats.attempts += 1;
                    match self.radio.send(address, frame) {
                        Ok(()) => machine.handle(DeliveryEvent::Sent),
                        Err(e) => {
                            log::warn!("send to gateway {} ({}) failed: {}", endpoint, address, e);
                            machine.handle(DeliveryEvent::SendFailed)
                        }
                    }
                }
                Action::AwaitAck(timeout) => self.await_ack(&mut machine, timeout),
                Action::Backoff(delay) => {
                    std::thread::sleep(delay);
                    machine.handle(DeliveryEvent::BackoffElapsed)
                }
                Action::Finished(outcome) => {
                    self.finish(&outcome, node_id, sequence);
                    return outcome;
                }
            };
        }
    }

    fn await_ack(&self, machine: &mut DeliveryMachine, timeout: Duration) -> Action {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(ack) = self.acks.take() {
                match machine.handle(DeliveryEvent::Ack(ack)) {
                    Action::AwaitAck(_) => {}
                    next => return next,
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return machine.handle(DeliveryEvent::AckTimeout);
            }
            std::thread::sleep(ACK_POLL_INTERVAL.min(deadline - now));
        }
    }

    fn finish(&mut self, outcome: &DeliveryOutcome, node_id: u8, sequence: u32) {
        match *outcome {
            DeliveryOutcome::Delivered {
                endpoint,
                ack,
                attempts,
                failovers,
            } => {
                self.stats.acks += 1;
                self.stats.failovers += u64::from(failovers);
                log::info!(
                    "node {} seq {} acked by gateway {} (id {}, rssi {}) after {} attempt(s)",
                    node_id,
                    sequence,
                    endpoint,
                    ack.gateway_id,
                    ack.signal_strength,
                    attempts
                );
            }
            DeliveryOutcome::Exhausted { attempts, failovers } => {
                self.stats.failures += 1;
                self.stats.failovers += u64::from(failovers);
                log::error!(
                    "node {} seq {} dropped: no gateway acknowledged after {} attempt(s)",
                    node_id,
                    sequence,
                    attempts
                );
            }
        }
    }

    /// Persist the results of a delivered packet: the preferred gateway if
    /// it changed, then the sequence.
    ///
    /// Storage failures are logged and returned; the packet stays delivered.
    pub fn commit<S: BlobStore + ?Sized>(
        &mut self,
        store: &mut S,
        counter: &mut SequenceCounter,
        outcome: &DeliveryOutcome,
        sequence: u32,
    ) -> Result<(), StorageError> {
        let DeliveryOutcome::Delivered { endpoint, .. } = *outcome else {
            return Ok(());
        };

        let mut result = Ok(());
        if endpoint != self.preferred {
            log::info!("preferred gateway {} -> {}", self.preferred, endpoint);
            self.preferred = endpoint;
            if let Err(e) = store.set_u8(PREFERRED_GATEWAY_KEY, endpoint as u8) {
                log::error!("failed to persist preferred gateway: {}", e);
                result = Err(e);
            }
        }
        if let Err(e) = counter.commit(store, sequence) {
            log::error!("failed to persist sequence {}: {}", sequence, e);
            result = Err(e);
        }
        result
    }
}
