// Aguada Gateway - Receive, acknowledge and forward
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Radio receive path
//!
//! Runs in the radio's delivery context, so it never blocks: decode,
//! enrich, acknowledge and a non-blocking hand-off to the processing
//! thread. No storage or backend I/O happens here.

use crate::clock::Clock;
use crate::packet::{DataPacket, Envelope};
use aguada::{AckPacket, FrameHandler, GatewayCounters, InboundFrame, MacAddress, Radio};
use log::{debug, trace, warn};
use std::sync::mpsc::{SyncSender, TrySendError};
use std::sync::{Arc, Weak};

/// Receive-side state shared with the radio callback
pub struct Receiver<R: Radio> {
    gateway_id: u8,
    radio: R,
    clock: Arc<dyn Clock>,
    counters: Arc<GatewayCounters>,
    inbound: SyncSender<Envelope>,
}

impl<R: Radio + 'static> Receiver<R> {
    /// Build the receiver and its radio together.
    ///
    /// `make_radio` gets the frame handler to register with the radio
    /// driver. Frames delivered before construction completes are dropped.
    pub fn with_radio<F>(
        gateway_id: u8,
        make_radio: F,
        clock: Arc<dyn Clock>,
        counters: Arc<GatewayCounters>,
        inbound: SyncSender<Envelope>,
    ) -> Arc<Self>
    where
        F: FnOnce(FrameHandler) -> R,
    {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let weak = weak.clone();
            let handler: FrameHandler = Arc::new(move |src, rssi, bytes| {
                if let Some(receiver) = weak.upgrade() {
                    receiver.on_frame(src, rssi, bytes);
                }
            });
            Self {
                gateway_id,
                radio: make_radio(handler),
                clock,
                counters,
                inbound,
            }
        })
    }
}

impl<R: Radio> Receiver<R> {
    /// Handle one received frame
    pub fn on_frame(&self, src: MacAddress, rssi: i8, bytes: &[u8]) {
        GatewayCounters::bump(&self.counters.received);

        let frame = match InboundFrame::classify(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                GatewayCounters::bump(&self.counters.decode_errors);
                debug!("Dropping {} byte frame from {}: {}", bytes.len(), src, e);
                return;
            }
        };
        let Some(mut packet) = DataPacket::from_frame(frame) else {
            trace!("Ignoring acknowledgement from {}", src);
            return;
        };
        GatewayCounters::bump(&self.counters.parsed);

        let time = self.clock.now();
        packet.enrich(src, rssi, time);

        if !self.radio.is_peer(src) {
            if let Err(e) = self.radio.add_peer(src) {
                warn!("Cannot register peer {}: {}", src, e);
            }
        }

        if let Some((node_id, sequence)) = packet.identity() {
            let mut ack = AckPacket::new(node_id, sequence, self.gateway_id);
            ack.signal_strength = rssi;
            match self.radio.send(src, &ack.to_bytes()) {
                Ok(()) => GatewayCounters::bump(&self.counters.acks_sent),
                Err(e) => debug!("Ack for node {} seq {} not sent: {}", node_id, sequence, e),
            }
        }

        match self.inbound.try_send(Envelope::new(packet, time.synced)) {
            Ok(()) => {}
            Err(TrySendError::Full(envelope)) => {
                GatewayCounters::bump(&self.counters.queue_overflows);
                warn!(
                    "Inbound queue full, dropping node {} seq {}",
                    envelope.packet.node_id(),
                    envelope.packet.sequence()
                );
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!("Processing stopped, frame from {} discarded", src);
            }
        }
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn counters(&self) -> &GatewayCounters {
        &self.counters
    }
}
