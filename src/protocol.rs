// Aguada - Water-level telemetry protocol
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Protocol definitions for Aguada
//!
//! This module defines the fixed-layout packets shared by nodes and gateways:
//! - [`TelemetryPacket`]: node → gateway measurement (30 bytes)
//! - [`AckPacket`]: gateway → node receipt confirmation (12 bytes)
//! - [`UltrasonicPacket`]: compact raw-distance reading (12 bytes)
//! - [`generic::GenericPacket`]: variable key-value packet (≤ 250 bytes)
//!
//! All multi-byte integers are little-endian and layouts carry no padding.
//!
//! # Telemetry layout
//!
//! ```text
//! [version:1][node_id:1][mac:6][seq:4][distance:2][level:2][percent:1]
//! [volume:4][supply_mv:2][flags:1][alert:1][rssi:1][gateway_ts:4]
//! ```
//!
//! # Compact ultrasonic layout
//!
//! ```text
//! [0xA1][version:1][node_id:1][distance:2][flags:1][reserved:1][rssi:1][gateway_ts:4]
//! ```

pub mod generic;

use crate::error::DecodeError;
use std::fmt;
use std::str::FromStr;

pub use generic::{DataPair, GenericPacket, GenericPacketBuilder, Value, ValueType};

/// Link payload ceiling of the radio in bytes
pub const MAX_FRAME_SIZE: usize = 250;

/// Telemetry packet format version
pub const TELEMETRY_VERSION: u8 = 1;

/// Acknowledgement magic byte
pub const ACK_MAGIC: u8 = 0xAC;

/// Acknowledgement format version
pub const ACK_VERSION: u8 = 1;

/// Flag bit set when an anomaly alert is raised
pub const FLAG_ALERT: u8 = 0x01;

/// Compact ultrasonic packet magic byte
pub const ULTRASONIC_MAGIC: u8 = 0xA1;

/// Compact ultrasonic packet format version
pub const ULTRASONIC_VERSION: u8 = 1;

/// Compact packet flag: supply below the low-battery threshold
pub const ULTRASONIC_FLAG_LOW_BATTERY: u8 = 0x01;

/// Compact packet flag: the ranger produced no usable reading
pub const ULTRASONIC_FLAG_SENSOR_ERROR: u8 = 0x02;

/// 6-byte radio (MAC) address
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
#[derive(serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// Broadcast address, also the reserved "unconfigured" sentinel
    pub const BROADCAST: MacAddress = MacAddress([0xFF; 6]);

    /// Create from raw bytes
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// Raw bytes
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// An endpoint is configured unless it holds the reserved sentinel
    pub fn is_configured(&self) -> bool {
        *self != Self::BROADCAST
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl fmt::Debug for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MacAddress({})", self)
    }
}

impl FromStr for MacAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 6];
        let mut parts = s.split(|c| c == ':' || c == '-');
        for byte in bytes.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| format!("too few octets in {:?}", s))?;
            *byte = u8::from_str_radix(part, 16)
                .map_err(|_| format!("invalid octet {:?} in {:?}", part, s))?;
        }
        if parts.next().is_some() {
            return Err(format!("too many octets in {:?}", s));
        }
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for MacAddress {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MacAddress> for String {
    fn from(mac: MacAddress) -> Self {
        mac.to_string()
    }
}

/// Anomaly alert carried by a telemetry packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum AlertType {
    /// No alert
    #[default]
    None = 0,
    /// Level dropped faster than the threshold (leak)
    RapidDrop = 1,
    /// Level rose faster than the threshold (pump failure / flood)
    RapidRise = 2,
    /// Reading unchanged for too long, or no echo at all
    SensorStuck = 3,
}

impl AlertType {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(AlertType::None),
            1 => Some(AlertType::RapidDrop),
            2 => Some(AlertType::RapidRise),
            3 => Some(AlertType::SensorStuck),
            _ => None,
        }
    }

    /// Stable lowercase name used in logs and backend records
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::None => "none",
            AlertType::RapidDrop => "rapid_drop",
            AlertType::RapidRise => "rapid_rise",
            AlertType::SensorStuck => "sensor_stuck",
        }
    }

    /// Whether this is an actual alert
    pub fn is_alert(&self) -> bool {
        !matches!(self, AlertType::None)
    }
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status reported by a gateway acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum AckStatus {
    /// Received and parsed
    #[default]
    Ok = 0,
    /// Received, delivery to the backend deferred
    Queued = 1,
    /// Received but could not be processed
    Error = 2,
}

impl AckStatus {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(AckStatus::Ok),
            1 => Some(AckStatus::Queued),
            2 => Some(AckStatus::Error),
            _ => None,
        }
    }
}

/// Length-checked little-endian reader over a received buffer
#[derive(Debug)]
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub(crate) fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if len > self.remaining() {
            return Err(DecodeError::BadLength {
                expected: self.pos + len,
                actual: self.buf.len(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub(crate) fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.array::<1>()?[0])
    }

    pub(crate) fn i8(&mut self) -> Result<i8, DecodeError> {
        Ok(i8::from_le_bytes(self.array()?))
    }

    pub(crate) fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub(crate) fn i16(&mut self) -> Result<i16, DecodeError> {
        Ok(i16::from_le_bytes(self.array()?))
    }

    pub(crate) fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub(crate) fn i32(&mut self) -> Result<i32, DecodeError> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    pub(crate) fn f32(&mut self) -> Result<f32, DecodeError> {
        Ok(f32::from_le_bytes(self.array()?))
    }
}

/// Node → gateway measurement packet
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TelemetryPacket {
    /// Format version (always [`TELEMETRY_VERSION`] when encoded)
    pub version: u8,
    /// Small node identifier
    pub node_id: u8,
    /// Radio address of the sender (overwritten by the gateway)
    pub source_address: MacAddress,
    /// Per-node sequence number
    pub sequence: u32,
    /// Filtered distance sensor → water surface
    pub distance_cm: i16,
    /// Water level above the tank floor
    pub level_cm: i16,
    /// Fill percentage (0..=100)
    pub percent: u8,
    /// Stored volume in liters
    pub volume_l: u32,
    /// Supply voltage in millivolts (0 if unavailable)
    pub supply_mv: i16,
    /// Flag bits, see [`FLAG_ALERT`]
    pub flags: u8,
    /// Anomaly alert
    pub alert_type: AlertType,
    /// Received signal strength, filled by the gateway
    pub signal_strength: i8,
    /// Gateway reception time, filled by the gateway
    pub gateway_timestamp: u32,
}

impl TelemetryPacket {
    /// Encoded size in bytes
    pub const SIZE: usize = 30;

    /// Create an empty packet for the given node and sequence
    pub fn new(node_id: u8, source_address: MacAddress, sequence: u32) -> Self {
        Self {
            version: TELEMETRY_VERSION,
            node_id,
            source_address,
            sequence,
            ..Default::default()
        }
    }

    /// Whether the alert flag is set
    pub fn is_alert(&self) -> bool {
        self.flags & FLAG_ALERT != 0
    }

    /// Whether the gateway has filled in reception metadata
    pub fn is_enriched(&self) -> bool {
        self.gateway_timestamp != 0
    }

    /// Serialize to the fixed 30-byte layout
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0] = self.version;
        bytes[1] = self.node_id;
        bytes[2..8].copy_from_slice(&self.source_address.0);
        bytes[8..12].copy_from_slice(&self.sequence.to_le_bytes());
        bytes[12..14].copy_from_slice(&self.distance_cm.to_le_bytes());
        bytes[14..16].copy_from_slice(&self.level_cm.to_le_bytes());
        bytes[16] = self.percent;
        bytes[17..21].copy_from_slice(&self.volume_l.to_le_bytes());
        bytes[21..23].copy_from_slice(&self.supply_mv.to_le_bytes());
        bytes[23] = self.flags;
        bytes[24] = self.alert_type as u8;
        bytes[25..26].copy_from_slice(&self.signal_strength.to_le_bytes());
        bytes[26..30].copy_from_slice(&self.gateway_timestamp.to_le_bytes());
        bytes
    }

    /// Deserialize from exactly [`Self::SIZE`] bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() != Self::SIZE {
            return Err(DecodeError::BadLength {
                expected: Self::SIZE,
                actual: bytes.len(),
            });
        }

        let mut r = Reader::new(bytes);
        let version = r.u8()?;
        if version != TELEMETRY_VERSION {
            return Err(DecodeError::BadVersion {
                expected: TELEMETRY_VERSION,
                actual: version,
            });
        }

        let node_id = r.u8()?;
        let source_address = MacAddress(r.array()?);
        let sequence = r.u32()?;
        let distance_cm = r.i16()?;
        let level_cm = r.i16()?;

        let offset = r.position();
        let percent = r.u8()?;
        if percent > 100 {
            return Err(DecodeError::BadField {
                offset,
                reason: format!("percent {} exceeds 100", percent),
            });
        }

        let volume_l = r.u32()?;
        let supply_mv = r.i16()?;
        let flags = r.u8()?;

        let offset = r.position();
        let raw_alert = r.u8()?;
        let alert_type = AlertType::from_u8(raw_alert).ok_or_else(|| DecodeError::BadField {
            offset,
            reason: format!("unknown alert type {}", raw_alert),
        })?;

        let signal_strength = r.i8()?;
        let gateway_timestamp = r.u32()?;

        Ok(Self {
            version,
            node_id,
            source_address,
            sequence,
            distance_cm,
            level_cm,
            percent,
            volume_l,
            supply_mv,
            flags,
            alert_type,
            signal_strength,
            gateway_timestamp,
        })
    }
}

/// Gateway → node acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AckPacket {
    /// Node being acknowledged
    pub node_id: u8,
    /// Sequence being acknowledged
    pub acked_sequence: u32,
    /// Signal strength measured by the gateway
    pub signal_strength: i8,
    /// Receipt status
    pub status: AckStatus,
    /// Which gateway sent the acknowledgement
    pub gateway_id: u8,
}

impl AckPacket {
    /// Encoded size in bytes
    pub const SIZE: usize = 12;

    /// Create an acknowledgement for a received packet
    pub fn new(node_id: u8, acked_sequence: u32, gateway_id: u8) -> Self {
        Self {
            node_id,
            acked_sequence,
            gateway_id,
            ..Default::default()
        }
    }

    /// Whether this acknowledgement confirms the given packet
    pub fn confirms(&self, node_id: u8, sequence: u32) -> bool {
        self.node_id == node_id && self.acked_sequence == sequence
    }

    /// Serialize to the fixed 12-byte layout
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0] = ACK_MAGIC;
        bytes[1] = ACK_VERSION;
        bytes[2] = self.node_id;
        bytes[3..7].copy_from_slice(&self.acked_sequence.to_le_bytes());
        bytes[7..8].copy_from_slice(&self.signal_strength.to_le_bytes());
        bytes[8] = self.status as u8;
        bytes[9] = self.gateway_id;
        // bytes[10..12] reserved
        bytes
    }

    /// Deserialize from exactly [`Self::SIZE`] bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() != Self::SIZE {
            return Err(DecodeError::BadLength {
                expected: Self::SIZE,
                actual: bytes.len(),
            });
        }

        let mut r = Reader::new(bytes);
        let magic = r.u8()?;
        if magic != ACK_MAGIC {
            return Err(DecodeError::BadMagic {
                expected: ACK_MAGIC,
                actual: magic,
            });
        }
        let version = r.u8()?;
        if version != ACK_VERSION {
            return Err(DecodeError::BadVersion {
                expected: ACK_VERSION,
                actual: version,
            });
        }

        let node_id = r.u8()?;
        let acked_sequence = r.u32()?;
        let signal_strength = r.i8()?;
        let offset = r.position();
        let raw_status = r.u8()?;
        let status = AckStatus::from_u8(raw_status).ok_or_else(|| DecodeError::BadField {
            offset,
            reason: format!("unknown ack status {}", raw_status),
        })?;
        let gateway_id = r.u8()?;

        Ok(Self {
            node_id,
            acked_sequence,
            signal_strength,
            status,
            gateway_id,
        })
    }
}

/// Minimal node → gateway reading: node id and raw distance only.
///
/// Level, percentage and volume are left to the backend, which holds the
/// tank geometry per node. The packet carries no sequence number and is
/// never acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UltrasonicPacket {
    /// Small node identifier
    pub node_id: u8,
    /// Raw distance sensor → water surface
    pub distance_cm: i16,
    /// See [`ULTRASONIC_FLAG_LOW_BATTERY`] and [`ULTRASONIC_FLAG_SENSOR_ERROR`]
    pub flags: u8,
    /// Received signal strength, filled by the gateway
    pub signal_strength: i8,
    /// Gateway reception time, filled by the gateway
    pub gateway_timestamp: u32,
}

impl UltrasonicPacket {
    /// Encoded size in bytes
    pub const SIZE: usize = 12;

    pub fn new(node_id: u8, distance_cm: i16) -> Self {
        Self {
            node_id,
            distance_cm,
            ..Default::default()
        }
    }

    pub fn low_battery(&self) -> bool {
        self.flags & ULTRASONIC_FLAG_LOW_BATTERY != 0
    }

    pub fn sensor_error(&self) -> bool {
        self.flags & ULTRASONIC_FLAG_SENSOR_ERROR != 0
    }

    /// Serialize to the fixed 12-byte layout
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0] = ULTRASONIC_MAGIC;
        bytes[1] = ULTRASONIC_VERSION;
        bytes[2] = self.node_id;
        bytes[3..5].copy_from_slice(&self.distance_cm.to_le_bytes());
        bytes[5] = self.flags;
        // bytes[6] reserved
        bytes[7..8].copy_from_slice(&self.signal_strength.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.gateway_timestamp.to_le_bytes());
        bytes
    }

    /// Deserialize from exactly [`Self::SIZE`] bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() != Self::SIZE {
            return Err(DecodeError::BadLength {
                expected: Self::SIZE,
                actual: bytes.len(),
            });
        }

        let mut r = Reader::new(bytes);
        let magic = r.u8()?;
        if magic != ULTRASONIC_MAGIC {
            return Err(DecodeError::BadMagic {
                expected: ULTRASONIC_MAGIC,
                actual: magic,
            });
        }
        let version = r.u8()?;
        if version != ULTRASONIC_VERSION {
            return Err(DecodeError::BadVersion {
                expected: ULTRASONIC_VERSION,
                actual: version,
            });
        }

        let node_id = r.u8()?;
        let distance_cm = r.i16()?;
        let flags = r.u8()?;
        let _reserved = r.u8()?;
        let signal_strength = r.i8()?;
        let gateway_timestamp = r.u32()?;

        Ok(Self {
            node_id,
            distance_cm,
            flags,
            signal_strength,
            gateway_timestamp,
        })
    }
}

/// Any packet that can arrive over the radio
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Fixed-layout measurement
    Telemetry(TelemetryPacket),
    /// Key-value measurement
    Generic(GenericPacket),
    /// Compact raw-distance reading
    Ultrasonic(UltrasonicPacket),
    /// Receipt confirmation
    Ack(AckPacket),
}

impl InboundFrame {
    /// Classify a received buffer by its leading byte and decode it
    pub fn classify(bytes: &[u8]) -> Result<Self, DecodeError> {
        match bytes.first() {
            Some(&generic::GENERIC_MAGIC) => GenericPacket::from_bytes(bytes).map(InboundFrame::Generic),
            Some(&ACK_MAGIC) => AckPacket::from_bytes(bytes).map(InboundFrame::Ack),
            Some(&ULTRASONIC_MAGIC) => UltrasonicPacket::from_bytes(bytes).map(InboundFrame::Ultrasonic),
            _ => TelemetryPacket::from_bytes(bytes).map(InboundFrame::Telemetry),
        }
    }

    /// Serialize back to wire bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            InboundFrame::Telemetry(p) => p.to_bytes().to_vec(),
            InboundFrame::Ack(a) => a.to_bytes().to_vec(),
            InboundFrame::Ultrasonic(u) => u.to_bytes().to_vec(),
            // A decoded or built generic packet always satisfies the encoder limits
            InboundFrame::Generic(g) => g.to_bytes().unwrap_or_default(),
        }
    }

    /// Node id and sequence, if the frame carries them as a data packet.
    ///
    /// Only frames with an identity are acknowledged.
    pub fn data_identity(&self) -> Option<(u8, u32)> {
        match self {
            InboundFrame::Telemetry(p) => Some((p.node_id, p.sequence)),
            InboundFrame::Generic(g) => Some((g.node_id, g.sequence)),
            InboundFrame::Ultrasonic(_) | InboundFrame::Ack(_) => None,
        }
    }
}
