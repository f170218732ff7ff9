// Aguada - Water-level telemetry protocol
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Sensor node control loop
//!
//! One [`Node`] owns the radio, the durable store and the delivery engine,
//! and hosts one [`SensorChannel`] per ranging sensor. Each cycle runs
//! ranger → conditioner → level model → anomaly detector → packet →
//! delivery for every channel in turn.

use crate::anomaly::AnomalyDetector;
use crate::channel::{AckSlot, Radio};
use crate::conditioner::{Conditioned, RangeSample, SignalConditioner};
use crate::config::{NodeConfig, SensorConfig};
use crate::delivery::{DeliveryEngine, DeliveryOutcome, SequenceCounter};
use crate::error::{ConfigError, Result};
use crate::level::TankModel;
use crate::metrics::DeliveryStats;
use crate::protocol::{AlertType, MacAddress, TelemetryPacket, FLAG_ALERT, TELEMETRY_VERSION};
use crate::storage::BlobStore;
use std::collections::VecDeque;
use std::sync::Arc;

/// Ultrasonic ranging hardware
pub trait Ranger: Send {
    /// Trigger one pulse and measure the echo
    fn ping(&mut self) -> RangeSample;
}

/// Supply voltage measurement
pub trait SupplyMonitor: Send {
    /// Millivolts, or `None` if the ADC read failed
    fn read_mv(&mut self) -> Option<i16>;
}

/// Ranger replaying a fixed script of samples, repeating the last one
#[derive(Debug, Clone)]
pub struct ScriptedRanger {
    script: VecDeque<RangeSample>,
    last: RangeSample,
}

impl ScriptedRanger {
    /// Replay `samples` in order
    pub fn new(samples: impl IntoIterator<Item = RangeSample>) -> Self {
        Self {
            script: samples.into_iter().collect(),
            last: RangeSample::Timeout,
        }
    }

    /// Always return the same distance
    pub fn constant(cm: u16) -> Self {
        Self {
            script: VecDeque::new(),
            last: RangeSample::Distance(cm),
        }
    }

    /// Append more samples
    pub fn extend(&mut self, samples: impl IntoIterator<Item = RangeSample>) {
        self.script.extend(samples);
    }
}

impl Ranger for ScriptedRanger {
    fn ping(&mut self) -> RangeSample {
        if let Some(sample) = self.script.pop_front() {
            self.last = sample;
        }
        self.last
    }
}

/// Per-sensor pipeline state
pub struct SensorChannel {
    config: SensorConfig,
    ranger: Box<dyn Ranger>,
    conditioner: SignalConditioner,
    model: TankModel,
    anomaly: AnomalyDetector,
    counter: SequenceCounter,
}

impl SensorChannel {
    /// Node id carried by this channel's packets
    pub fn node_id(&self) -> u8 {
        self.config.node_id
    }

    /// Sequence counter
    pub fn counter(&self) -> &SequenceCounter {
        &self.counter
    }

    /// Anomaly detector
    pub fn anomaly(&self) -> &AnomalyDetector {
        &self.anomaly
    }

    /// Signal conditioner
    pub fn conditioner(&self) -> &SignalConditioner {
        &self.conditioner
    }
}

/// What happened to one sensor during a cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub node_id: u8,
    pub sequence: u32,
    /// Packet as sent
    pub packet: TelemetryPacket,
    /// No usable distance this cycle
    pub sensing_failure: bool,
    pub outcome: DeliveryOutcome,
}

/// A sensor node device
pub struct Node<R: Radio, S: BlobStore> {
    samples_per_cycle: usize,
    min_valid_cm: i16,
    store: S,
    engine: DeliveryEngine<R>,
    channels: Vec<SensorChannel>,
    supply: Option<Box<dyn SupplyMonitor>>,
}

impl<R: Radio, S: BlobStore> Node<R, S> {
    /// Build a node.
    ///
    /// `acks` must be the slot written by the radio's receive callback (see
    /// [`AckSlot::handler`]). One ranger is required per configured sensor.
    pub fn new(
        config: NodeConfig,
        radio: R,
        acks: Arc<AckSlot>,
        store: S,
        rangers: Vec<Box<dyn Ranger>>,
    ) -> Result<Self> {
        config.validate()?;
        if rangers.len() != config.sensors.len() {
            return Err(ConfigError::invalid(
                "sensors",
                format!(
                    "{} sensors configured but {} rangers supplied",
                    config.sensors.len(),
                    rangers.len()
                ),
            )
            .into());
        }

        let mut engine = DeliveryEngine::new(config.delivery.clone(), radio, acks)?;
        engine.load_preferred(&store);

        let mut channels = Vec::with_capacity(config.sensors.len());
        for (sensor, ranger) in config.sensors.iter().zip(rangers) {
            let counter = SequenceCounter::load(&store, &sensor.sequence_key);
            log::info!(
                "sensor node {} resuming after sequence {}",
                sensor.node_id,
                counter.persisted()
            );
            channels.push(SensorChannel {
                config: sensor.clone(),
                ranger,
                conditioner: SignalConditioner::new(config.conditioner.clone()),
                model: TankModel::from_config(sensor.tank)?,
                anomaly: AnomalyDetector::new(config.anomaly.clone(), config.sample_interval_s),
                counter,
            });
        }

        Ok(Self {
            samples_per_cycle: config.conditioner.samples_per_cycle,
            min_valid_cm: config.conditioner.min_valid_cm,
            store,
            engine,
            channels,
            supply: None,
        })
    }

    /// Attach a supply voltage monitor
    pub fn with_supply(mut self, monitor: Box<dyn SupplyMonitor>) -> Self {
        self.supply = Some(monitor);
        self
    }

    /// Radio address of this device
    pub fn address(&self) -> MacAddress {
        self.engine.radio().local_address()
    }

    /// Sensor channels
    pub fn channels(&self) -> &[SensorChannel] {
        &self.channels
    }

    /// Delivery statistics
    pub fn stats(&self) -> &DeliveryStats {
        self.engine.stats()
    }

    /// Delivery engine
    pub fn engine(&self) -> &DeliveryEngine<R> {
        &self.engine
    }

    /// Durable store
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Run one measurement-and-delivery cycle for every sensor
    pub fn run_cycle(&mut self) -> Vec<CycleReport> {
        let address = self.engine.radio().local_address();
        let supply_mv = match self.supply.as_mut().map(|s| s.read_mv()) {
            Some(Some(mv)) => mv,
            Some(None) => {
                log::warn!("supply voltage read failed");
                0
            }
            None => 0,
        };

        let mut reports = Vec::with_capacity(self.channels.len());
        for channel in self.channels.iter_mut() {
            let sequence = channel.counter.reserve();
            let (packet, sensing_failure) = build_packet(
                channel,
                self.samples_per_cycle,
                self.min_valid_cm,
                address,
                sequence,
                supply_mv,
            );

            let outcome = self
                .engine
                .deliver(packet.node_id, sequence, &packet.to_bytes());
            if outcome.is_delivered() {
                // Logged by commit; the packet was acknowledged either way
                let _ = self
                    .engine
                    .commit(&mut self.store, &mut channel.counter, &outcome, sequence);
            }

            reports.push(CycleReport {
                node_id: packet.node_id,
                sequence,
                packet,
                sensing_failure,
                outcome,
            });
        }

        log::debug!("delivery stats: {}", self.engine.stats().summary());
        reports
    }
}

fn build_packet(
    channel: &mut SensorChannel,
    samples_per_cycle: usize,
    min_valid_cm: i16,
    address: MacAddress,
    sequence: u32,
    supply_mv: i16,
) -> (TelemetryPacket, bool) {
    let samples: Vec<RangeSample> = (0..samples_per_cycle)
        .map(|_| channel.ranger.ping())
        .collect();

    let distance = match channel.conditioner.condition(&samples) {
        Conditioned::Estimate(cm) | Conditioned::Rejected { held: Some(cm) } => Some(cm),
        Conditioned::Rejected { held: None } | Conditioned::NoEcho => None,
    };

    let (distance_cm, sensing_failure) = match distance {
        Some(cm) => (cm, false),
        None => {
            log::warn!(
                "node {} seq {}: no usable distance, reporting {} cm",
                channel.config.node_id,
                sequence,
                min_valid_cm
            );
            channel.conditioner.reset();
            (min_valid_cm, true)
        }
    };

    let reading = channel.model.compute(distance_cm);
    let alert = if sensing_failure {
        channel.anomaly.sensing_failure()
    } else {
        channel.anomaly.evaluate(reading.level_cm, sequence)
    };

    let packet = TelemetryPacket {
        version: TELEMETRY_VERSION,
        node_id: channel.config.node_id,
        source_address: address,
        sequence,
        distance_cm,
        level_cm: reading.level_cm,
        percent: reading.percent,
        volume_l: reading.volume_l,
        supply_mv,
        flags: if alert != AlertType::None { FLAG_ALERT } else { 0 },
        alert_type: alert,
        signal_strength: 0,
        gateway_timestamp: 0,
    };

    log::info!(
        "node {} seq {}: distance={} cm level={} cm pct={}% vol={} L alert={}",
        packet.node_id,
        sequence,
        packet.distance_cm,
        packet.level_cm,
        packet.percent,
        packet.volume_l,
        alert
    );
    (packet, sensing_failure)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Ether, FrameHandler};
    use crate::config::DeliveryConfig;
    use crate::protocol::{AckPacket, InboundFrame};
    use crate::storage::MemoryStore;
    use std::sync::Mutex;

    const NODE: MacAddress = MacAddress([0x02, 0, 0, 0, 0, 0x10]);
    const GW: MacAddress = MacAddress([0x02, 0, 0, 0, 0, 0x01]);

    /// A gateway stand-in that acknowledges every data frame
    fn acking_gateway(ether: &Arc<Ether>) -> Arc<Mutex<Vec<TelemetryPacket>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let radio_cell: Arc<Mutex<Option<crate::channel::EtherRadio>>> = Arc::new(Mutex::new(None));
        let cell = Arc::clone(&radio_cell);
        let sink = Arc::clone(&seen);
        let handler: FrameHandler = Arc::new(move |src, _rssi, bytes: &[u8]| {
            if let Ok(InboundFrame::Telemetry(p)) = InboundFrame::classify(bytes) {
                sink.lock().unwrap().push(p.clone());
                if let Some(radio) = cell.lock().unwrap().as_ref() {
                    radio.add_peer(src).unwrap();
                    let _ = radio.send(src, &AckPacket::new(p.node_id, p.sequence, 1).to_bytes());
                }
            }
        });
        let radio = ether.attach(GW, handler);
        *radio_cell.lock().unwrap() = Some(radio);
        seen
    }

    fn fast_delivery() -> DeliveryConfig {
        DeliveryConfig {
            ack_timeout_ms: 5,
            initial_backoff_ms: 1,
            ..DeliveryConfig::with_gateways(vec![GW])
        }
    }

    fn build_node(
        ether: &Arc<Ether>,
        store: MemoryStore,
        ranger: ScriptedRanger,
    ) -> Node<crate::channel::EtherRadio, MemoryStore> {
        let acks = Arc::new(AckSlot::new());
        let radio = ether.attach(NODE, acks.handler());
        Node::new(
            NodeConfig::single(4, fast_delivery()),
            radio,
            acks,
            store,
            vec![Box::new(ranger) as Box<dyn Ranger>],
        )
        .unwrap()
    }

    #[test]
    fn test_cycle_builds_and_delivers_packet() {
        let ether = Ether::new();
        let seen = acking_gateway(&ether);
        let store = MemoryStore::new();
        let mut node = build_node(&ether, store.clone(), ScriptedRanger::constant(170));

        let reports = node.run_cycle();
        assert_eq!(reports.len(), 1);
        let report = &reports[0];
        assert!(report.outcome.is_delivered());
        assert!(!report.sensing_failure);
        assert_eq!(report.sequence, 1);
        assert_eq!(report.packet.distance_cm, 170);
        // Default tank: 450 + 20 - 170 = 300 cm
        assert_eq!(report.packet.level_cm, 300);
        assert_eq!(report.packet.percent, 66);
        assert_eq!(report.packet.source_address, NODE);
        assert_eq!(report.packet.signal_strength, 0);
        assert_eq!(report.packet.gateway_timestamp, 0);

        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(store.get_u32("seq").unwrap(), Some(1));
    }

    #[test]
    fn test_sensing_failure_forces_stuck_alert() {
        let ether = Ether::new();
        let _seen = acking_gateway(&ether);
        let mut ranger = ScriptedRanger::new([RangeSample::Distance(170); 3]);
        ranger.extend([RangeSample::Timeout; 3]);
        let mut node = build_node(&ether, MemoryStore::new(), ranger);

        node.run_cycle();
        let report = node.run_cycle().remove(0);
        assert!(report.sensing_failure);
        assert_eq!(report.packet.distance_cm, 5);
        assert_eq!(report.packet.alert_type, AlertType::SensorStuck);
        assert!(report.packet.is_alert());
        assert_eq!(
            node.channels()[0].anomaly().state(),
            crate::anomaly::AnomalyState::Uninitialized
        );
        assert_eq!(node.channels()[0].conditioner().filter().estimate(), None);
    }

    #[test]
    fn test_failed_delivery_does_not_persist_sequence() {
        let ether = Ether::new();
        let _seen = acking_gateway(&ether);
        let store = MemoryStore::new();
        let mut node = build_node(&ether, store.clone(), ScriptedRanger::constant(200));

        node.run_cycle();
        assert_eq!(store.get_u32("seq").unwrap(), Some(1));

        ether.set_online(GW, false);
        let report = node.run_cycle().remove(0);
        assert!(!report.outcome.is_delivered());
        assert_eq!(report.sequence, 2);
        assert_eq!(store.get_u32("seq").unwrap(), Some(1));

        ether.set_online(GW, true);
        let report = node.run_cycle().remove(0);
        assert_eq!(report.sequence, 3);
        assert_eq!(store.get_u32("seq").unwrap(), Some(3));
        assert_eq!(node.stats().failures, 1);
        assert_eq!(node.stats().acks, 2);
    }

    #[test]
    fn test_restart_resumes_after_persisted_sequence() {
        let ether = Ether::new();
        let _seen = acking_gateway(&ether);
        let store = MemoryStore::new();
        {
            let mut node = build_node(&ether, store.clone(), ScriptedRanger::constant(200));
            node.run_cycle();
            node.run_cycle();
        }
        let mut node = build_node(&ether, store, ScriptedRanger::constant(200));
        assert_eq!(node.run_cycle()[0].sequence, 3);
    }

    #[test]
    fn test_ranger_count_must_match() {
        let ether = Ether::new();
        let acks = Arc::new(AckSlot::new());
        let radio = ether.attach(NODE, acks.handler());
        let result = Node::new(
            NodeConfig::dual([1, 2], fast_delivery()),
            radio,
            acks,
            MemoryStore::new(),
            vec![Box::new(ScriptedRanger::constant(100)) as Box<dyn Ranger>],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_supply_monitor_reading() {
        struct Fixed(Option<i16>);
        impl SupplyMonitor for Fixed {
            fn read_mv(&mut self) -> Option<i16> {
                self.0
            }
        }

        let ether = Ether::new();
        let _seen = acking_gateway(&ether);
        let mut node = build_node(&ether, MemoryStore::new(), ScriptedRanger::constant(200))
            .with_supply(Box::new(Fixed(Some(4980))));
        assert_eq!(node.run_cycle()[0].packet.supply_mv, 4980);
    }
}
