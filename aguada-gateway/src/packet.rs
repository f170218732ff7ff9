// Aguada Gateway - Receive, acknowledge and forward
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Enriched data packets and their backend records
//!
//! Compact ultrasonic readings carry no sender address on the air. The
//! gateway keeps the radio source next to the packet and stores it as a
//! 6-byte suffix after the wire bytes.

use crate::clock::GatewayTime;
use aguada::protocol::generic::GENERIC_VERSION;
use aguada::protocol::ULTRASONIC_VERSION;
use aguada::{
    DecodeError, GenericPacket, InboundFrame, MacAddress, TelemetryPacket, UltrasonicPacket, Value,
};
use serde_json::{json, Map, Number};

/// A measurement packet accepted by the gateway
#[derive(Debug, Clone, PartialEq)]
pub enum DataPacket {
    Telemetry(TelemetryPacket),
    Generic(GenericPacket),
    Ultrasonic {
        packet: UltrasonicPacket,
        source_address: MacAddress,
    },
}

impl DataPacket {
    /// Keep data frames, drop acknowledgements
    pub fn from_frame(frame: InboundFrame) -> Option<Self> {
        match frame {
            InboundFrame::Telemetry(p) => Some(DataPacket::Telemetry(p)),
            InboundFrame::Generic(g) => Some(DataPacket::Generic(g)),
            InboundFrame::Ultrasonic(packet) => Some(DataPacket::Ultrasonic {
                packet,
                source_address: MacAddress::default(),
            }),
            InboundFrame::Ack(_) => None,
        }
    }

    pub fn node_id(&self) -> u8 {
        match self {
            DataPacket::Telemetry(p) => p.node_id,
            DataPacket::Generic(g) => g.node_id,
            DataPacket::Ultrasonic { packet, .. } => packet.node_id,
        }
    }

    /// Sequence number; compact readings carry none and report 0
    pub fn sequence(&self) -> u32 {
        self.identity().map_or(0, |(_, sequence)| sequence)
    }

    /// Node id and sequence of packets that get acknowledged
    pub fn identity(&self) -> Option<(u8, u32)> {
        match self {
            DataPacket::Telemetry(p) => Some((p.node_id, p.sequence)),
            DataPacket::Generic(g) => Some((g.node_id, g.sequence)),
            DataPacket::Ultrasonic { .. } => None,
        }
    }

    pub fn source_address(&self) -> MacAddress {
        match self {
            DataPacket::Telemetry(p) => p.source_address,
            DataPacket::Generic(g) => g.source_address,
            DataPacket::Ultrasonic { source_address, .. } => *source_address,
        }
    }

    /// Stamp radio metadata onto the packet
    pub fn enrich(&mut self, sender: MacAddress, rssi: i8, time: GatewayTime) {
        match self {
            DataPacket::Telemetry(p) => {
                p.source_address = sender;
                p.signal_strength = rssi;
                p.gateway_timestamp = time.seconds;
            }
            DataPacket::Generic(g) => {
                g.source_address = sender;
                g.signal_strength = rssi;
                g.gateway_timestamp = time.seconds;
            }
            DataPacket::Ultrasonic {
                packet,
                source_address,
            } => {
                *source_address = sender;
                packet.signal_strength = rssi;
                packet.gateway_timestamp = time.seconds;
            }
        }
    }

    /// Wire bytes, enrichment included
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            DataPacket::Telemetry(p) => p.to_bytes().to_vec(),
            // Decoded generic packets always fit the encoder limits
            DataPacket::Generic(g) => g.to_bytes().unwrap_or_default(),
            DataPacket::Ultrasonic {
                packet,
                source_address,
            } => {
                let mut out = packet.to_bytes().to_vec();
                out.extend_from_slice(&source_address.octets());
                out
            }
        }
    }

    /// Decode wire bytes; acknowledgements are rejected
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() == UltrasonicPacket::SIZE + 6 {
            let (wire, mac) = bytes.split_at(UltrasonicPacket::SIZE);
            if let Ok(InboundFrame::Ultrasonic(packet)) = InboundFrame::classify(wire) {
                let mut octets = [0u8; 6];
                octets.copy_from_slice(mac);
                return Ok(DataPacket::Ultrasonic {
                    packet,
                    source_address: MacAddress::new(octets),
                });
            }
        }
        DataPacket::from_frame(InboundFrame::classify(bytes)?).ok_or_else(|| DecodeError::BadField {
            offset: 0,
            reason: "acknowledgement is not a data packet".to_string(),
        })
    }
}

/// A packet on its way to the backend
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub packet: DataPacket,
    /// Whether the gateway timestamp is unix time
    pub time_synced: bool,
}

impl Envelope {
    pub fn new(packet: DataPacket, time_synced: bool) -> Self {
        Self {
            packet,
            time_synced,
        }
    }

    /// JSON document posted to the backend
    pub fn to_record(&self, gateway_id: u8, is_backlog: bool) -> serde_json::Value {
        match &self.packet {
            DataPacket::Telemetry(p) => json!({
                "version": p.version,
                "node_id": p.node_id,
                "mac": p.source_address.to_string(),
                "sequence": p.sequence,
                "distance_cm": p.distance_cm,
                "level_cm": p.level_cm,
                "percent": p.percent,
                "volume_l": p.volume_l,
                "supply_mv": p.supply_mv,
                "signal_strength": p.signal_strength,
                "gateway_timestamp": p.gateway_timestamp,
                "flags": p.flags,
                "alert_type": p.alert_type as u8,
                "time_synced": self.time_synced,
                "gateway_id": gateway_id,
                "is_backlog": is_backlog,
            }),
            DataPacket::Generic(g) => {
                let mut fields = Map::new();
                for pair in &g.pairs {
                    fields.insert(pair.label.clone(), value_to_json(&pair.value));
                }
                json!({
                    "kind": "generic",
                    "version": GENERIC_VERSION,
                    "node_id": g.node_id,
                    "mac": g.source_address.to_string(),
                    "sequence": g.sequence,
                    "fields": fields,
                    "signal_strength": g.signal_strength,
                    "gateway_timestamp": g.gateway_timestamp,
                    "time_synced": self.time_synced,
                    "gateway_id": gateway_id,
                    "is_backlog": is_backlog,
                })
            }
            DataPacket::Ultrasonic {
                packet,
                source_address,
            } => json!({
                "kind": "ultrasonic",
                "version": ULTRASONIC_VERSION,
                "node_id": packet.node_id,
                "mac": source_address.to_string(),
                "distance_cm": packet.distance_cm,
                "flags": packet.flags,
                "low_battery": packet.low_battery(),
                "sensor_error": packet.sensor_error(),
                "signal_strength": packet.signal_strength,
                "gateway_timestamp": packet.gateway_timestamp,
                "time_synced": self.time_synced,
                "gateway_id": gateway_id,
                "is_backlog": is_backlog,
            }),
        }
    }
}

fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Int8(v) => json!(v),
        Value::UInt8(v) => json!(v),
        Value::Int16(v) => json!(v),
        Value::UInt16(v) => json!(v),
        Value::Int32(v) => json!(v),
        Value::UInt32(v) => json!(v),
        // NaN and infinities have no JSON form
        Value::Float32(v) => Number::from_f64(f64::from(*v))
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::Bool(v) => json!(v),
        Value::Text(s) => json!(s),
    }
}
