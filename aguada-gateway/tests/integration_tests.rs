// Aguada Gateway - Integration Tests
//
// Sensor nodes and gateways talking over the in-memory radio medium, with
// the gateway forwarding into an in-memory backend. Organized as:
// 1. End-to-end delivery
// 2. Backend outage and replay
// 3. Receive path validation
// 4. Multi-gateway and multi-sensor topologies

use aguada::{
    AckSlot, AlertType, BlobStore, DeliveryConfig, DeliveryOutcome, Ether, EtherRadio, GenericPacketBuilder,
    MacAddress, MemoryStore, Node, NodeConfig, Radio, Ranger, ScriptedRanger, TelemetryPacket,
    UltrasonicPacket, Value,
};
use aguada_gateway::{Gateway, GatewayConfig, GatewayHandle, ManualClock, MemoryBackend};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const GW1: MacAddress = MacAddress::new([0x24, 0x6F, 0x28, 0, 0, 0x01]);
const GW2: MacAddress = MacAddress::new([0x24, 0x6F, 0x28, 0, 0, 0x02]);
const NODE: MacAddress = MacAddress::new([0x24, 0x6F, 0x28, 0, 0, 0x10]);
const RAW_SENDER: MacAddress = MacAddress::new([0x24, 0x6F, 0x28, 0, 0, 0x20]);
const SYNCED_AT: u32 = 1_760_000_000;

fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

fn gateway_config(gateway_id: u8) -> GatewayConfig {
    GatewayConfig {
        processing_timeout_ms: 50,
        ..GatewayConfig::new()
            .with_gateway_id(gateway_id)
            .with_offline_capacity(16)
            .with_retry_interval(Duration::from_millis(40))
    }
}

fn start_gateway(
    ether: &Arc<Ether>,
    address: MacAddress,
    config: GatewayConfig,
    store: MemoryStore,
    backend: &MemoryBackend,
) -> GatewayHandle<EtherRadio> {
    let clock = Arc::new(ManualClock::new());
    clock.sync(SYNCED_AT);
    Gateway::new(config)
        .with_clock(clock)
        .start(|handler| ether.attach(address, handler), store, backend.clone())
        .unwrap()
}

fn fast_delivery(gateways: Vec<MacAddress>) -> DeliveryConfig {
    DeliveryConfig {
        ack_timeout_ms: 20,
        initial_backoff_ms: 1,
        ..DeliveryConfig::with_gateways(gateways)
    }
}

fn start_node(
    ether: &Arc<Ether>,
    config: NodeConfig,
    store: MemoryStore,
    rangers: Vec<Box<dyn Ranger>>,
) -> Node<EtherRadio, MemoryStore> {
    let acks = Arc::new(AckSlot::new());
    let radio = ether.attach(NODE, acks.handler());
    Node::new(config, radio, acks, store, rangers).unwrap()
}

fn single_node(ether: &Arc<Ether>, gateways: Vec<MacAddress>, cm: u16) -> Node<EtherRadio, MemoryStore> {
    start_node(
        ether,
        NodeConfig::single(4, fast_delivery(gateways)),
        MemoryStore::new(),
        vec![Box::new(ScriptedRanger::constant(cm)) as Box<dyn Ranger>],
    )
}

/// A bare station for hand-made frames
fn raw_sender(ether: &Arc<Ether>) -> (EtherRadio, Arc<AckSlot>) {
    let acks = Arc::new(AckSlot::new());
    let radio = ether.attach(RAW_SENDER, acks.handler());
    radio.add_peer(GW1).unwrap();
    (radio, acks)
}

fn sequences(backend: &MemoryBackend) -> Vec<u64> {
    backend
        .records()
        .iter()
        .map(|r| r["sequence"].as_u64().unwrap())
        .collect()
}

// ============================================================================
// End-to-end delivery
// ============================================================================

#[test]
fn test_measurement_reaches_backend() {
    let ether = Ether::new();
    let backend = MemoryBackend::new();
    let gateway = start_gateway(&ether, GW1, gateway_config(1), MemoryStore::new(), &backend);
    ether.set_rssi(GW1, -67);
    let mut node = single_node(&ether, vec![GW1], 170);

    let report = node.run_cycle().remove(0);
    assert!(report.outcome.is_delivered());
    assert_eq!(report.sequence, 1);

    assert!(wait_for(|| backend.records().len() == 1));
    let records = backend.records();
    let record = &records[0];
    assert_eq!(record["node_id"], 4);
    assert_eq!(record["sequence"], 1);
    assert_eq!(record["mac"], NODE.to_string());
    assert_eq!(record["distance_cm"], 170);
    assert_eq!(record["level_cm"], 300);
    assert_eq!(record["percent"], 66);
    assert_eq!(record["signal_strength"], -67);
    assert_eq!(record["gateway_timestamp"], SYNCED_AT);
    assert_eq!(record["time_synced"], true);
    assert_eq!(record["gateway_id"], 1);
    assert_eq!(record["is_backlog"], false);

    let stats = gateway.shutdown().unwrap();
    assert_eq!(stats.received, 1);
    assert_eq!(stats.acks_sent, 1);
    assert_eq!(stats.forwarded, 1);
}

#[test]
fn test_sequence_persists_across_node_restart() {
    let ether = Ether::new();
    let backend = MemoryBackend::new();
    let gateway = start_gateway(&ether, GW1, gateway_config(1), MemoryStore::new(), &backend);
    let node_store = MemoryStore::new();

    let rangers = || vec![Box::new(ScriptedRanger::constant(200)) as Box<dyn Ranger>];
    let config = NodeConfig::single(4, fast_delivery(vec![GW1]));
    {
        let mut node = start_node(&ether, config.clone(), node_store.clone(), rangers());
        node.run_cycle();
        node.run_cycle();
    }
    let mut node = start_node(&ether, config, node_store, rangers());
    assert_eq!(node.run_cycle()[0].sequence, 3);

    assert!(wait_for(|| backend.records().len() == 3));
    assert_eq!(sequences(&backend), vec![1, 2, 3]);
    gateway.shutdown().unwrap();
}

#[test]
fn test_rapid_drop_alert_is_forwarded() {
    let ether = Ether::new();
    let backend = MemoryBackend::new();
    let gateway = start_gateway(&ether, GW1, gateway_config(1), MemoryStore::new(), &backend);
    let ranger = ScriptedRanger::new(
        [aguada::RangeSample::Distance(100); 3]
            .into_iter()
            .chain([aguada::RangeSample::Distance(400); 30]),
    );
    let mut node = start_node(
        &ether,
        NodeConfig::single(4, fast_delivery(vec![GW1])),
        MemoryStore::new(),
        vec![Box::new(ranger) as Box<dyn Ranger>],
    );

    let mut alert = AlertType::None;
    for _ in 0..10 {
        let report = node.run_cycle().remove(0);
        if report.packet.alert_type != AlertType::None {
            alert = report.packet.alert_type;
            break;
        }
    }
    assert_eq!(alert, AlertType::RapidDrop);

    assert!(wait_for(|| backend
        .records()
        .iter()
        .any(|r| r["alert_type"] == AlertType::RapidDrop as u8 && r["flags"] == 1)));
    gateway.shutdown().unwrap();
}

// ============================================================================
// Backend outage and replay
// ============================================================================

#[test]
fn test_outage_is_absorbed_and_replayed_in_order() {
    let ether = Ether::new();
    let backend = MemoryBackend::new();
    backend.set_online(false);
    let gateway = start_gateway(&ether, GW1, gateway_config(1), MemoryStore::new(), &backend);
    let mut node = single_node(&ether, vec![GW1], 170);

    for _ in 0..3 {
        // Acknowledged although the backend is down
        assert!(node.run_cycle()[0].outcome.is_delivered());
    }
    assert!(wait_for(|| gateway.counters().queued_offline == 3));
    assert!(backend.records().is_empty());

    backend.set_online(true);
    assert!(wait_for(|| backend.records().len() == 3));
    assert_eq!(sequences(&backend), vec![1, 2, 3]);
    assert!(backend.records().iter().all(|r| r["is_backlog"] == true));

    let stats = gateway.shutdown().unwrap();
    assert_eq!(stats.replayed, 3);
    assert_eq!(stats.forwarded, 0);
}

#[test]
fn test_backlog_survives_gateway_restart() {
    let ether = Ether::new();
    let store = MemoryStore::new();
    let down = MemoryBackend::new();
    down.set_online(false);

    let gateway = start_gateway(&ether, GW1, gateway_config(1), store.clone(), &down);
    let mut node = single_node(&ether, vec![GW1], 250);
    node.run_cycle();
    node.run_cycle();
    assert!(wait_for(|| gateway.counters().queued_offline == 2));
    gateway.shutdown().unwrap();

    let up = MemoryBackend::new();
    let gateway = start_gateway(&ether, GW1, gateway_config(1), store, &up);
    assert!(wait_for(|| up.records().len() == 2));
    assert_eq!(sequences(&up), vec![1, 2]);
    assert!(up.records().iter().all(|r| r["is_backlog"] == true));

    node.run_cycle();
    assert!(wait_for(|| up.records().len() == 3));
    assert_eq!(up.records()[2]["is_backlog"], false);
    gateway.shutdown().unwrap();
}

#[test]
fn test_offline_overflow_keeps_newest() {
    let ether = Ether::new();
    let backend = MemoryBackend::new();
    backend.set_online(false);
    let config = GatewayConfig {
        retry_interval_ms: 20,
        ..gateway_config(1).with_offline_capacity(3)
    };
    let gateway = start_gateway(&ether, GW1, config, MemoryStore::new(), &backend);
    let mut node = single_node(&ether, vec![GW1], 170);

    for _ in 0..5 {
        node.run_cycle();
    }
    assert!(wait_for(|| gateway.counters().queued_offline == 5));
    assert_eq!(gateway.counters().evicted, 2);

    backend.set_online(true);
    assert!(wait_for(|| backend.records().len() == 3));
    assert_eq!(sequences(&backend), vec![3, 4, 5]);
    gateway.shutdown().unwrap();
}

#[test]
fn test_slow_backend_loses_no_acknowledged_packet() {
    let ether = Ether::new();
    let backend = MemoryBackend::new();
    // Every post outlasts the processing timeout several times over
    backend.set_latency(Duration::from_millis(60));
    let config = GatewayConfig {
        forward_queue_capacity: 1,
        processing_timeout_ms: 10,
        ..gateway_config(1)
    };
    let gateway = start_gateway(&ether, GW1, config, MemoryStore::new(), &backend);
    let (radio, acks) = raw_sender(&ether);

    for seq in 1..=8 {
        radio.send(GW1, &TelemetryPacket::new(4, RAW_SENDER, seq).to_bytes()).unwrap();
        assert!(acks.take().unwrap().confirms(4, seq));
    }

    assert!(wait_for(|| backend.records().len() == 8));
    assert_eq!(sequences(&backend), (1..=8).collect::<Vec<u64>>());
    let stats = gateway.shutdown().unwrap();
    assert_eq!(stats.queue_overflows, 0);
    assert_eq!(stats.forwarded + stats.replayed, 8);
}

// ============================================================================
// Receive path validation
// ============================================================================

#[test]
fn test_malformed_frames_are_not_acknowledged() {
    let ether = Ether::new();
    let backend = MemoryBackend::new();
    let gateway = start_gateway(&ether, GW1, gateway_config(1), MemoryStore::new(), &backend);
    let (radio, acks) = raw_sender(&ether);

    let packet = TelemetryPacket::new(4, RAW_SENDER, 7).to_bytes();
    radio.send(GW1, &packet[..20]).unwrap();
    let mut bad_version = packet;
    bad_version[0] = 2;
    radio.send(GW1, &bad_version).unwrap();
    radio.send(GW1, &[]).unwrap();

    assert!(acks.take().is_none());
    let stats = gateway.shutdown().unwrap();
    assert_eq!(stats.received, 3);
    assert_eq!(stats.decode_errors, 3);
    assert_eq!(stats.parsed, 0);
    assert!(backend.records().is_empty());
}

#[test]
fn test_spoofed_source_address_is_overwritten() {
    let ether = Ether::new();
    let backend = MemoryBackend::new();
    let gateway = start_gateway(&ether, GW1, gateway_config(1), MemoryStore::new(), &backend);
    let (radio, acks) = raw_sender(&ether);

    let mut packet = TelemetryPacket::new(9, MacAddress::new([0xDE, 0xAD, 0, 0, 0, 1]), 11);
    packet.gateway_timestamp = 5;
    radio.send(GW1, &packet.to_bytes()).unwrap();

    assert!(acks.take().unwrap().confirms(9, 11));
    assert!(wait_for(|| backend.records().len() == 1));
    assert_eq!(backend.records()[0]["mac"], RAW_SENDER.to_string());
    assert_eq!(backend.records()[0]["gateway_timestamp"], SYNCED_AT);
    gateway.shutdown().unwrap();
}

#[test]
fn test_generic_packet_is_acked_and_forwarded() {
    let ether = Ether::new();
    let backend = MemoryBackend::new();
    let gateway = start_gateway(&ether, GW1, gateway_config(1), MemoryStore::new(), &backend);
    let (radio, acks) = raw_sender(&ether);

    let mut builder = GenericPacketBuilder::new(12, RAW_SENDER, 3);
    builder.push("flow_lpm", Value::Float32(12.5)).unwrap();
    builder.push("pump_on", Value::Bool(false)).unwrap();
    let bytes = builder.build().to_bytes().unwrap();
    radio.send(GW1, &bytes).unwrap();

    assert!(acks.take().unwrap().confirms(12, 3));
    assert!(wait_for(|| backend.records().len() == 1));
    let records = backend.records();
    let record = &records[0];
    assert_eq!(record["kind"], "generic");
    assert_eq!(record["node_id"], 12);
    assert_eq!(record["fields"]["flow_lpm"], 12.5);
    assert_eq!(record["fields"]["pump_on"], false);
    gateway.shutdown().unwrap();
}

#[test]
fn test_compact_reading_is_forwarded_after_outage() {
    let ether = Ether::new();
    let backend = MemoryBackend::new();
    backend.set_online(false);
    let gateway = start_gateway(&ether, GW1, gateway_config(1), MemoryStore::new(), &backend);
    let (radio, acks) = raw_sender(&ether);

    let mut compact = UltrasonicPacket::new(6, 233);
    compact.flags = 0x02;
    radio.send(GW1, &compact.to_bytes()).unwrap();

    // Nothing to confirm: the compact format has no sequence
    assert!(acks.take().is_none());
    assert!(wait_for(|| gateway.counters().queued_offline == 1));

    backend.set_online(true);
    assert!(wait_for(|| backend.records().len() == 1));
    let record = &backend.records()[0];
    assert_eq!(record["kind"], "ultrasonic");
    assert_eq!(record["node_id"], 6);
    assert_eq!(record["mac"], RAW_SENDER.to_string());
    assert_eq!(record["distance_cm"], 233);
    assert_eq!(record["sensor_error"], true);
    assert_eq!(record["gateway_timestamp"], SYNCED_AT);
    assert_eq!(record["is_backlog"], true);

    let stats = gateway.shutdown().unwrap();
    assert_eq!(stats.acks_sent, 0);
    assert_eq!(stats.replayed, 1);
}

// ============================================================================
// Multi-gateway and multi-sensor topologies
// ============================================================================

#[test]
fn test_failover_to_second_gateway() {
    let ether = Ether::new();
    let backend = MemoryBackend::new();
    let gw1 = start_gateway(&ether, GW1, gateway_config(1), MemoryStore::new(), &backend);
    let gw2 = start_gateway(&ether, GW2, gateway_config(2), MemoryStore::new(), &backend);
    ether.set_online(GW1, false);

    let mut node = single_node(&ether, vec![GW1, GW2], 170);
    let report = node.run_cycle().remove(0);
    match report.outcome {
        DeliveryOutcome::Delivered {
            endpoint,
            ack,
            attempts,
            failovers,
        } => {
            assert_eq!(endpoint, 1);
            assert_eq!(ack.gateway_id, 2);
            assert_eq!(failovers, 1);
            assert_eq!(attempts, 3);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(node.store().get_blob("last_gw").unwrap(), Some(vec![1]));

    // The next cycle starts at the gateway that answered last
    ether.set_online(GW1, true);
    let report = node.run_cycle().remove(0);
    assert!(matches!(
        report.outcome,
        DeliveryOutcome::Delivered {
            endpoint: 1,
            attempts: 1,
            ..
        }
    ));

    assert!(wait_for(|| backend.records().len() == 2));
    assert!(backend.records().iter().all(|r| r["gateway_id"] == 2));
    assert_eq!(gw1.shutdown().unwrap().received, 0);
    assert_eq!(gw2.shutdown().unwrap().received, 2);
}

#[test]
fn test_all_gateways_down_drops_packet_without_advancing_sequence() {
    let ether = Ether::new();
    let backend = MemoryBackend::new();
    let gateway = start_gateway(&ether, GW1, gateway_config(1), MemoryStore::new(), &backend);
    ether.set_online(GW1, false);

    let mut node = single_node(&ether, vec![GW1, GW2], 170);
    let report = node.run_cycle().remove(0);
    assert!(matches!(
        report.outcome,
        DeliveryOutcome::Exhausted {
            attempts: 4,
            failovers: 1
        }
    ));
    assert_eq!(node.store().get_u32("seq").unwrap(), None);

    ether.set_online(GW1, true);
    let report = node.run_cycle().remove(0);
    assert!(report.outcome.is_delivered());
    // The lost sequence number is not reused
    assert_eq!(report.sequence, 2);
    gateway.shutdown().unwrap();
}

#[test]
fn test_node_and_gateway_share_configured_channel() {
    let ether = Ether::new();
    let backend = MemoryBackend::new();
    let config = GatewayConfig {
        radio_channel: 3,
        ..gateway_config(1)
    };
    let gateway = start_gateway(&ether, GW1, config, MemoryStore::new(), &backend);

    let mut on_default = single_node(&ether, vec![GW1], 170);
    assert!(!on_default.run_cycle()[0].outcome.is_delivered());
    drop(on_default);

    let delivery = DeliveryConfig {
        radio_channel: 3,
        ..fast_delivery(vec![GW1])
    };
    let mut node = start_node(
        &ether,
        NodeConfig::single(4, delivery),
        MemoryStore::new(),
        vec![Box::new(ScriptedRanger::constant(170)) as Box<dyn Ranger>],
    );
    assert!(node.run_cycle()[0].outcome.is_delivered());
    assert!(wait_for(|| backend.records().len() == 1));
    gateway.shutdown().unwrap();
}

#[test]
fn test_dual_sensor_node_reports_both_tanks() {
    let ether = Ether::new();
    let backend = MemoryBackend::new();
    let gateway = start_gateway(&ether, GW1, gateway_config(1), MemoryStore::new(), &backend);
    let store = MemoryStore::new();
    let mut node = start_node(
        &ether,
        NodeConfig::dual([1, 2], fast_delivery(vec![GW1])),
        store.clone(),
        vec![
            Box::new(ScriptedRanger::constant(170)) as Box<dyn Ranger>,
            Box::new(ScriptedRanger::constant(420)) as Box<dyn Ranger>,
        ],
    );

    let reports = node.run_cycle();
    assert_eq!(reports.len(), 2);
    assert!(reports.iter().all(|r| r.outcome.is_delivered()));

    assert!(wait_for(|| backend.records().len() == 2));
    let records = backend.records();
    assert_eq!(records[0]["node_id"], 1);
    assert_eq!(records[0]["level_cm"], 300);
    assert_eq!(records[1]["node_id"], 2);
    assert_eq!(records[1]["level_cm"], 50);
    assert_eq!(records[0]["mac"], records[1]["mac"]);

    assert_eq!(store.get_u32("seq1").unwrap(), Some(1));
    assert_eq!(store.get_u32("seq2").unwrap(), Some(1));
    gateway.shutdown().unwrap();
}
