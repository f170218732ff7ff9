// Aguada Gateway - Receive, acknowledge and forward
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Gateway runtime: wires the receive path, the processing thread and the
//! forwarder thread together

use crate::backend::Backend;
use crate::clock::{Clock, SystemClock};
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::forwarder::Forwarder;
use crate::processing::{self, ProcessingConfig};
use crate::queue::OfflineQueue;
use crate::receive::Receiver;
use aguada::{BlobStore, FrameHandler, GatewayCounters, GatewaySnapshot, MacAddress, Radio};
use log::info;
use std::sync::mpsc::sync_channel;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Gateway builder
pub struct Gateway {
    config: GatewayConfig,
    clock: Arc<dyn Clock>,
}

impl Gateway {
    /// Gateway using the system clock
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock::new()),
        }
    }

    /// Replace the time source
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Open the offline queue, start both worker threads and attach the
    /// receive path to the radio built by `make_radio`.
    pub fn start<R, F, S, B>(
        self,
        make_radio: F,
        store: S,
        backend: B,
    ) -> Result<GatewayHandle<R>>
    where
        R: Radio + 'static,
        F: FnOnce(FrameHandler) -> R,
        S: BlobStore + 'static,
        B: Backend + 'static,
    {
        let config = self.config;
        config.validate()?;

        let queue = OfflineQueue::open(store, config.offline_queue_capacity)?;
        let backlog = queue.len();
        let counters = Arc::new(GatewayCounters::new());

        let (inbound_tx, inbound_rx) = sync_channel(config.inbound_queue_capacity);
        let (forward_tx, forward_rx) = sync_channel(config.forward_queue_capacity);

        let forwarder = Forwarder::new(queue, backend, &config, Arc::clone(&counters));
        let forwarder = spawn("aguada-forwarder", move || {
            forwarder.run(forward_rx);
        })?;

        let processing_config = ProcessingConfig {
            timeout: config.processing_timeout(),
            housekeeping_interval: config.housekeeping_interval(),
        };
        let processing_counters = Arc::clone(&counters);
        let processing = spawn("aguada-processing", move || {
            processing::run(inbound_rx, forward_tx, processing_config, &processing_counters);
        })?;

        let receiver = Receiver::with_radio(
            config.gateway_id,
            make_radio,
            self.clock,
            Arc::clone(&counters),
            inbound_tx,
        );

        receiver
            .radio()
            .set_channel(config.radio_channel)
            .map_err(aguada::AguadaError::from)?;

        info!(
            "Gateway {} listening as {} on channel {} ({} packet(s) backlogged)",
            config.gateway_id,
            receiver.radio().local_address(),
            receiver.radio().channel(),
            backlog
        );

        Ok(GatewayHandle {
            receiver,
            counters,
            processing,
            forwarder,
        })
    }
}

fn spawn<F>(name: &'static str, body: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(body)
        .map_err(|e| GatewayError::Worker {
            name,
            reason: e.to_string(),
        })
}

/// A running gateway
pub struct GatewayHandle<R: Radio> {
    receiver: Arc<Receiver<R>>,
    counters: Arc<GatewayCounters>,
    processing: JoinHandle<()>,
    forwarder: JoinHandle<()>,
}

impl<R: Radio> GatewayHandle<R> {
    /// Radio address of the gateway
    pub fn address(&self) -> MacAddress {
        self.receiver.radio().local_address()
    }

    /// Feed a frame directly into the receive path
    pub fn on_frame(&self, src: MacAddress, rssi: i8, bytes: &[u8]) {
        self.receiver.on_frame(src, rssi, bytes);
    }

    pub fn radio(&self) -> &R {
        self.receiver.radio()
    }

    pub fn counters(&self) -> GatewaySnapshot {
        self.counters.snapshot()
    }

    /// Detach from the radio, let both workers finish their queues and
    /// wait for them. Packets not yet forwarded stay in the offline queue.
    pub fn shutdown(self) -> Result<GatewaySnapshot> {
        let Self {
            receiver,
            counters,
            processing,
            forwarder,
        } = self;
        drop(receiver);

        join("aguada-processing", processing)?;
        join("aguada-forwarder", forwarder)?;

        let snapshot = counters.snapshot();
        info!("Gateway stopped: {}", snapshot.summary());
        Ok(snapshot)
    }
}

fn join(name: &'static str, handle: JoinHandle<()>) -> Result<()> {
    handle.join().map_err(|_| GatewayError::Worker {
        name,
        reason: "thread panicked".to_string(),
    })
}
