// Aguada Gateway - Receive, acknowledge and forward
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Store-and-forward worker
//!
//! Owns the [`OfflineQueue`] and the [`Backend`]. A packet goes straight to
//! the backend only when nothing older is waiting and the backend circuit
//! allows a request; otherwise it joins the tail of the offline queue.
//! The backlog is replayed head first and a packet leaves the queue only
//! once the backend accepted it, so replay order is arrival order.

use crate::backend::Backend;
use crate::config::GatewayConfig;
use crate::error::Result;
use crate::packet::Envelope;
use crate::queue::OfflineQueue;
use aguada::{BlobStore, CircuitBreaker, CircuitState, GatewayCounters};
use log::{debug, error, info, warn};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

/// Forwarding worker state
pub struct Forwarder<S: BlobStore, B: Backend> {
    queue: OfflineQueue<S>,
    backend: B,
    breaker: CircuitBreaker,
    counters: Arc<GatewayCounters>,
    gateway_id: u8,
    retry_interval: Duration,
}

impl<S: BlobStore, B: Backend> Forwarder<S, B> {
    pub fn new(
        queue: OfflineQueue<S>,
        backend: B,
        config: &GatewayConfig,
        counters: Arc<GatewayCounters>,
    ) -> Self {
        Self {
            queue,
            backend,
            breaker: CircuitBreaker::with_config(config.circuit()),
            counters,
            gateway_id: config.gateway_id,
            retry_interval: config.retry_interval(),
        }
    }

    fn post(&mut self, envelope: &Envelope, is_backlog: bool) -> Result<()> {
        let record = envelope.to_record(self.gateway_id, is_backlog);
        match self.backend.post(&record) {
            Ok(()) => {
                self.breaker.record_success();
                Ok(())
            }
            Err(e) => {
                self.breaker.record_failure();
                Err(e)
            }
        }
    }

    fn enqueue(&mut self, envelope: &Envelope) -> Result<()> {
        let evicted = self.queue.push(envelope).map_err(|e| {
            error!(
                "Lost node {} seq {}: offline queue write failed: {}",
                envelope.packet.node_id(),
                envelope.packet.sequence(),
                e
            );
            e
        })?;
        if evicted {
            GatewayCounters::bump(&self.counters.evicted);
        }
        GatewayCounters::bump(&self.counters.queued_offline);
        Ok(())
    }

    /// Forward a fresh packet, or queue it behind the backlog
    pub fn handle(&mut self, envelope: Envelope) -> Result<()> {
        if !self.queue.is_empty() || !self.breaker.should_allow() {
            debug!(
                "Queueing node {} seq {} ({} waiting)",
                envelope.packet.node_id(),
                envelope.packet.sequence(),
                self.queue.len()
            );
            return self.enqueue(&envelope);
        }

        match self.post(&envelope, false) {
            Ok(()) => {
                GatewayCounters::bump(&self.counters.forwarded);
                Ok(())
            }
            Err(e) => {
                warn!(
                    "Backend failed for node {} seq {}: {}; queued offline",
                    envelope.packet.node_id(),
                    envelope.packet.sequence(),
                    e
                );
                self.enqueue(&envelope)
            }
        }
    }

    /// Replay the backlog until it is empty, the backend fails or the
    /// circuit refuses. Returns how many packets were replayed.
    pub fn drain(&mut self) -> Result<usize> {
        let mut replayed = 0;
        while self.breaker.should_allow() {
            let Some(envelope) = self.queue.peek()? else {
                break;
            };
            if let Err(e) = self.post(&envelope, true) {
                debug!(
                    "Replay of node {} seq {} failed: {}",
                    envelope.packet.node_id(),
                    envelope.packet.sequence(),
                    e
                );
                break;
            }
            self.queue.pop()?;
            GatewayCounters::bump(&self.counters.replayed);
            replayed += 1;
        }
        if replayed > 0 {
            info!(
                "Replayed {} queued packet(s), {} remaining",
                replayed,
                self.queue.len()
            );
        }
        Ok(replayed)
    }

    fn drain_logged(&mut self) {
        if let Err(e) = self.drain() {
            error!("Offline queue replay failed: {}", e);
        }
    }

    /// How long to wait for new packets before the next replay attempt
    fn next_wait(&self) -> Duration {
        self.breaker
            .remaining_open_time()
            .unwrap_or(self.retry_interval)
    }

    /// Consume packets until the processing stage disconnects
    pub fn run(mut self, inbound: Receiver<Envelope>) -> Self {
        if !self.queue.is_empty() {
            info!("Replaying {} packet(s) left from a prior run", self.queue.len());
        }
        self.drain_logged();

        loop {
            match inbound.recv_timeout(self.next_wait()) {
                Ok(envelope) => {
                    if let Err(e) = self.handle(envelope) {
                        error!("Forwarding failed: {}", e);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("Forward queue closed, {} packet(s) persisted", self.queue.len());
                    break;
                }
            }
            if !self.queue.is_empty() {
                self.drain_logged();
            }
        }
        self
    }

    pub fn backlog(&self) -> usize {
        self.queue.len()
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub fn queue(&self) -> &OfflineQueue<S> {
        &self.queue
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::packet::DataPacket;
    use aguada::{MacAddress, MemoryStore, TelemetryPacket};
    use std::sync::mpsc::sync_channel;
    use std::thread;

    fn envelope(seq: u32) -> Envelope {
        let p = TelemetryPacket::new(4, MacAddress::new([2, 0, 0, 0, 0, 4]), seq);
        Envelope::new(DataPacket::Telemetry(p), true)
    }

    fn forwarder(
        store: MemoryStore,
        backend: MemoryBackend,
        retry: Duration,
    ) -> Forwarder<MemoryStore, MemoryBackend> {
        let config = GatewayConfig::new()
            .with_offline_capacity(8)
            .with_retry_interval(retry);
        let queue = OfflineQueue::open(store, config.offline_queue_capacity).unwrap();
        Forwarder::new(queue, backend, &config, Arc::new(GatewayCounters::new()))
    }

    fn sequences(backend: &MemoryBackend) -> Vec<u64> {
        backend
            .records()
            .iter()
            .map(|r| r["sequence"].as_u64().unwrap())
            .collect()
    }

    #[test]
    fn test_online_forwards_directly() {
        let backend = MemoryBackend::new();
        let mut fwd = forwarder(MemoryStore::new(), backend.clone(), Duration::from_secs(5));

        fwd.handle(envelope(1)).unwrap();
        fwd.handle(envelope(2)).unwrap();

        assert_eq!(sequences(&backend), vec![1, 2]);
        assert_eq!(backend.records()[0]["is_backlog"], false);
        assert_eq!(fwd.backlog(), 0);
        assert_eq!(fwd.counters.snapshot().forwarded, 2);
    }

    #[test]
    fn test_offline_queues_then_replays_in_order() {
        let backend = MemoryBackend::new();
        let mut fwd = forwarder(MemoryStore::new(), backend.clone(), Duration::from_millis(30));

        backend.set_online(false);
        for seq in 1..=3 {
            fwd.handle(envelope(seq)).unwrap();
        }
        assert_eq!(fwd.backlog(), 3);
        assert_eq!(fwd.circuit_state(), CircuitState::Open);
        // Only the first packet reached the backend; the rest waited behind it
        assert_eq!(backend.attempts(), 1);

        backend.set_online(true);
        // Circuit still open: no request is made
        assert_eq!(fwd.drain().unwrap(), 0);
        assert_eq!(backend.attempts(), 1);

        thread::sleep(Duration::from_millis(40));
        fwd.handle(envelope(4)).unwrap();
        assert_eq!(fwd.drain().unwrap(), 4);

        assert_eq!(sequences(&backend), vec![1, 2, 3, 4]);
        assert!(backend.records().iter().all(|r| r["is_backlog"] == true));
        let snap = fwd.counters.snapshot();
        assert_eq!((snap.queued_offline, snap.replayed), (4, 4));
        assert_eq!(fwd.circuit_state(), CircuitState::Closed);
    }

    #[test]
    fn test_failed_replay_keeps_head() {
        let backend = MemoryBackend::new();
        let mut fwd = forwarder(MemoryStore::new(), backend.clone(), Duration::from_millis(10));

        backend.reject_with(Some(503));
        fwd.handle(envelope(1)).unwrap();
        fwd.handle(envelope(2)).unwrap();

        thread::sleep(Duration::from_millis(15));
        assert_eq!(fwd.drain().unwrap(), 0);
        assert_eq!(fwd.backlog(), 2);
        assert!(fwd.queue().store().contains(crate::queue::META_KEY));

        backend.reject_with(None);
        thread::sleep(Duration::from_millis(15));
        assert_eq!(fwd.drain().unwrap(), 2);
        assert_eq!(sequences(&backend), vec![1, 2]);
    }

    #[test]
    fn test_backlog_from_prior_run_replayed_first() {
        let store = MemoryStore::new();
        {
            let mut queue = OfflineQueue::open(store.clone(), 8).unwrap();
            queue.push(&envelope(10)).unwrap();
            queue.push(&envelope(11)).unwrap();
        }

        let backend = MemoryBackend::new();
        let fwd = forwarder(store, backend.clone(), Duration::from_millis(20));
        let (tx, rx) = sync_channel(4);
        tx.send(envelope(12)).unwrap();
        drop(tx);

        let fwd = fwd.run(rx);
        assert_eq!(fwd.backlog(), 0);
        assert_eq!(sequences(&backend), vec![10, 11, 12]);
        let records = backend.records();
        assert_eq!(records[0]["is_backlog"], true);
        assert_eq!(records[2]["is_backlog"], false);
    }

    #[test]
    fn test_storage_failure_reported() {
        let store = MemoryStore::new();
        let backend = MemoryBackend::new();
        let mut fwd = forwarder(store.clone(), backend.clone(), Duration::from_secs(5));

        backend.set_online(false);
        store.fail_all_writes(true);
        assert!(fwd.handle(envelope(1)).is_err());
        assert_eq!(fwd.backlog(), 0);
        assert_eq!(fwd.counters.snapshot().queued_offline, 0);
    }
}
