// Aguada - Water-level telemetry protocol
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! # Aguada - Water-level telemetry protocol
//!
//! Node-side stack of a tank-level telemetry network: sensor nodes range the
//! water surface, turn the reading into a compact binary packet and deliver
//! it over a short-range peer-to-peer radio to one of several gateways.
//!
//! ## Key Features
//!
//! - **Byte-exact codecs**: fixed 30-byte telemetry, 12-byte acknowledgement
//!   and a bounded key-value packet, all decoded through a length-checked cursor
//! - **Signal conditioning**: median-of-N outlier rejection plus a scalar Kalman filter
//! - **Anomaly detection**: rapid drop, rapid rise and stuck-sensor alerts
//! - **Reliable delivery**: acknowledgement, retry with backoff and
//!   multi-gateway failover, driven by an explicit state machine
//!
//! ## Quick Start
//!
//! ```rust
//! use aguada::{AlertType, MacAddress, TelemetryPacket, TankModel};
//!
//! let model = TankModel::new(450, 20, 80_000).unwrap();
//! let reading = model.compute(170);
//! assert_eq!(reading.level_cm, 300);
//!
//! let mut packet = TelemetryPacket::new(4, MacAddress::new([2, 0, 0, 0, 0, 1]), 42);
//! packet.level_cm = reading.level_cm;
//! packet.percent = reading.percent;
//! packet.volume_l = reading.volume_l;
//!
//! let bytes = packet.to_bytes();
//! let decoded = TelemetryPacket::from_bytes(&bytes).unwrap();
//! assert_eq!(decoded.alert_type, AlertType::None);
//! assert_eq!(decoded, packet);
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Packet layouts and codecs
//! - [`conditioner`]: Median filter, range clamp and Kalman estimator
//! - [`level`]: Distance → level / percent / volume
//! - [`anomaly`]: Level anomaly detection
//! - [`delivery`]: Acknowledged delivery with retry and failover
//! - [`node`]: Per-cycle orchestration of a sensor node
//! - [`channel`]: Radio abstraction, acknowledgement handoff, in-memory medium
//! - [`storage`]: Durable blob storage
//! - [`recovery`]: Retry pacing and circuit breaker
//! - [`metrics`]: Diagnostic counters

// Modules
pub mod anomaly;
pub mod channel;
pub mod conditioner;
pub mod config;
pub mod delivery;
pub mod error;
pub mod level;
pub mod metrics;
pub mod node;
pub mod protocol;
pub mod recovery;
pub mod storage;

// Re-exports for convenient access
pub use anomaly::{AnomalyConfig, AnomalyDetector, AnomalyState};
pub use channel::{AckSlot, Ether, EtherRadio, FrameHandler, Radio, DEFAULT_RADIO_CHANNEL};
pub use conditioner::{Conditioned, ConditionerConfig, KalmanFilter, RangeSample, SignalConditioner};
pub use config::{NodeConfig, SensorConfig};
pub use delivery::{
    DeliveryConfig, DeliveryEngine, DeliveryEvent, DeliveryMachine, DeliveryOutcome,
    DeliveryState, SequenceCounter,
};
pub use error::{
    AguadaError, ConfigError, DecodeError, EncodeError, RadioError, Result, StorageError,
};
pub use level::{LevelReading, TankConfig, TankModel};
pub use metrics::{DeliveryStats, GatewayCounters, GatewaySnapshot};
pub use node::{CycleReport, Node, Ranger, ScriptedRanger, SensorChannel, SupplyMonitor};
pub use protocol::{
    AckPacket, AckStatus, AlertType, DataPair, GenericPacket, GenericPacketBuilder, InboundFrame,
    MacAddress, TelemetryPacket, UltrasonicPacket, Value, ValueType, MAX_FRAME_SIZE,
};
pub use recovery::{CircuitBreaker, CircuitConfig, CircuitState, RetryStrategy};
pub use storage::{BlobStore, FileStore, MemoryStore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
