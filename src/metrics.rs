// Aguada - Water-level telemetry protocol
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Diagnostic counters
//!
//! [`DeliveryStats`] is owned by the node control loop. [`GatewayCounters`]
//! is shared between the gateway receive context and its worker threads, so
//! every field is an atomic. Neither affects protocol behavior.

use std::sync::atomic::{AtomicU64, Ordering};

/// Node delivery statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    /// Packets handed to the delivery engine
    pub cycles: u64,
    /// Radio transmissions, retries included
    pub attempts: u64,
    /// Packets confirmed by a gateway
    pub acks: u64,
    /// Packets dropped after exhausting every endpoint
    pub failures: u64,
    /// Moves from one endpoint to the next
    pub failovers: u64,
}

impl DeliveryStats {
    /// Create empty statistics
    pub fn new() -> Self {
        Self::default()
    }

    /// Fraction of cycles that were acknowledged (0.0 - 1.0)
    pub fn success_rate(&self) -> f64 {
        if self.cycles == 0 {
            return 0.0;
        }
        self.acks as f64 / self.cycles as f64
    }

    /// Average transmissions per packet
    pub fn attempts_per_cycle(&self) -> f64 {
        if self.cycles == 0 {
            return 0.0;
        }
        self.attempts as f64 / self.cycles as f64
    }

    /// Reset all counters
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// One-line summary for logs
    pub fn summary(&self) -> String {
        format!(
            "cycles={} attempts={} acks={} failures={} failovers={} success={:.1}%",
            self.cycles,
            self.attempts,
            self.acks,
            self.failures,
            self.failovers,
            self.success_rate() * 100.0
        )
    }
}

/// Gateway counters shared across threads
#[derive(Debug, Default)]
pub struct GatewayCounters {
    pub received: AtomicU64,
    pub parsed: AtomicU64,
    pub decode_errors: AtomicU64,
    pub queue_overflows: AtomicU64,
    pub acks_sent: AtomicU64,
    pub forwarded: AtomicU64,
    pub queued_offline: AtomicU64,
    pub replayed: AtomicU64,
    pub evicted: AtomicU64,
}

/// Point-in-time copy of [`GatewayCounters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GatewaySnapshot {
    pub received: u64,
    pub parsed: u64,
    pub decode_errors: u64,
    pub queue_overflows: u64,
    pub acks_sent: u64,
    pub forwarded: u64,
    pub queued_offline: u64,
    pub replayed: u64,
    pub evicted: u64,
}

impl GatewayCounters {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter by one
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy every counter
    pub fn snapshot(&self) -> GatewaySnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        GatewaySnapshot {
            received: get(&self.received),
            parsed: get(&self.parsed),
            decode_errors: get(&self.decode_errors),
            queue_overflows: get(&self.queue_overflows),
            acks_sent: get(&self.acks_sent),
            forwarded: get(&self.forwarded),
            queued_offline: get(&self.queued_offline),
            replayed: get(&self.replayed),
            evicted: get(&self.evicted),
        }
    }
}

impl GatewaySnapshot {
    /// One-line summary for logs
    pub fn summary(&self) -> String {
        format!(
            "rx={} ok={} bad={} overflow={} acks={} fwd={} offline={} replayed={} evicted={}",
            self.received,
            self.parsed,
            self.decode_errors,
            self.queue_overflows,
            self.acks_sent,
            self.forwarded,
            self.queued_offline,
            self.replayed,
            self.evicted
        )
    }
}
