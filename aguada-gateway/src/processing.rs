// Aguada Gateway - Receive, acknowledge and forward
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Processing stage: logs packets, hands them to the forwarder and
//! periodically reports the gateway counters
//!
//! The hand-off blocks while the forward queue is full. A packet that got
//! this far has been acknowledged to its node, so it must end up at the
//! backend or in the offline queue; back-pressure instead lands on the
//! receive side, which is allowed to drop.

use crate::packet::{DataPacket, Envelope};
use aguada::GatewayCounters;
use log::{debug, info, warn};
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender};
use std::time::{Duration, Instant};

/// Processing stage settings
#[derive(Debug, Clone, Copy)]
pub struct ProcessingConfig {
    /// Receive timeout between housekeeping checks
    pub timeout: Duration,
    /// Interval between counter summaries
    pub housekeeping_interval: Duration,
}

fn log_packet(envelope: &Envelope) {
    match &envelope.packet {
        DataPacket::Telemetry(p) => info!(
            "node {} seq {} from {}: level {} cm ({}%), {} L, alert {}, rssi {}",
            p.node_id,
            p.sequence,
            p.source_address,
            p.level_cm,
            p.percent,
            p.volume_l,
            p.alert_type,
            p.signal_strength
        ),
        DataPacket::Generic(g) => info!(
            "node {} seq {} from {}: {} field(s), rssi {}",
            g.node_id,
            g.sequence,
            g.source_address,
            g.pairs.len(),
            g.signal_strength
        ),
        DataPacket::Ultrasonic {
            packet,
            source_address,
        } => info!(
            "node {} from {}: distance {} cm, flags {:#04x}, rssi {}",
            packet.node_id,
            source_address,
            packet.distance_cm,
            packet.flags,
            packet.signal_strength
        ),
    }
}

/// Run the processing loop until the inbound side disconnects or the
/// forwarder goes away
pub fn run(
    inbound: Receiver<Envelope>,
    forward: SyncSender<Envelope>,
    config: ProcessingConfig,
    counters: &GatewayCounters,
) {
    let mut last_housekeeping = Instant::now();

    loop {
        match inbound.recv_timeout(config.timeout) {
            Ok(envelope) => {
                log_packet(&envelope);
                if forward.send(envelope).is_err() {
                    warn!("Forwarder stopped, processing exits");
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                debug!("Inbound queue closed, processing exits");
                break;
            }
        }

        if last_housekeeping.elapsed() >= config.housekeeping_interval {
            info!("Gateway stats: {}", counters.snapshot().summary());
            last_housekeeping = Instant::now();
        }
    }
}
