// Aguada - Water-level telemetry protocol
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Node configuration
//!
//! Loaded once at startup (typically from JSON) and validated before the
//! node is built; immutable afterwards.

use crate::delivery::DEFAULT_SEQUENCE_KEY;
use crate::error::ConfigError;
use crate::level::TankModel;
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;

pub use crate::anomaly::AnomalyConfig;
pub use crate::conditioner::ConditionerConfig;
pub use crate::delivery::DeliveryConfig;
pub use crate::level::TankConfig;

/// One ranging sensor, reported as its own (virtual) node
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    /// Node id carried in this sensor's packets
    pub node_id: u8,
    /// Blob key of this sensor's sequence counter
    pub sequence_key: String,
    /// Geometry of the tank this sensor watches
    pub tank: TankConfig,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            sequence_key: DEFAULT_SEQUENCE_KEY.to_string(),
            tank: TankConfig::default(),
        }
    }
}

impl SensorConfig {
    /// Sensor with default tank geometry
    pub fn new(node_id: u8, sequence_key: impl Into<String>) -> Self {
        Self {
            node_id,
            sequence_key: sequence_key.into(),
            tank: TankConfig::default(),
        }
    }

    /// Set tank geometry
    pub fn with_tank(mut self, tank: TankConfig) -> Self {
        self.tank = tank;
        self
    }
}

/// Complete node configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Sensors hosted by this device
    pub sensors: Vec<SensorConfig>,
    /// Seconds between measurement cycles
    pub sample_interval_s: u32,
    pub conditioner: ConditionerConfig,
    pub anomaly: AnomalyConfig,
    pub delivery: DeliveryConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            sensors: vec![SensorConfig::default()],
            sample_interval_s: 30,
            conditioner: ConditionerConfig::default(),
            anomaly: AnomalyConfig::default(),
            delivery: DeliveryConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Single-sensor node reporting as `node_id` to the given gateways
    pub fn single(node_id: u8, delivery: DeliveryConfig) -> Self {
        Self {
            sensors: vec![SensorConfig::new(node_id, DEFAULT_SEQUENCE_KEY)],
            delivery,
            ..Default::default()
        }
    }

    /// Dual-sensor node: sequence keys `seq1` and `seq2`
    pub fn dual(node_ids: [u8; 2], delivery: DeliveryConfig) -> Self {
        Self {
            sensors: vec![
                SensorConfig::new(node_ids[0], "seq1"),
                SensorConfig::new(node_ids[1], "seq2"),
            ],
            delivery,
            ..Default::default()
        }
    }

    /// Parse from JSON
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(text).map_err(|e| ConfigError::invalid("json", e.to_string()))
    }

    /// Time between cycles
    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.sample_interval_s))
    }

    /// Check every parameter
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sensors.is_empty() {
            return Err(ConfigError::invalid("sensors", "at least one sensor is required"));
        }
        if self.sample_interval_s == 0 {
            return Err(ConfigError::invalid("sample_interval_s", "must be positive"));
        }

        let mut ids = HashSet::new();
        let mut keys = HashSet::new();
        for sensor in &self.sensors {
            if !ids.insert(sensor.node_id) {
                return Err(ConfigError::invalid(
                    "sensors",
                    format!("duplicate node id {}", sensor.node_id),
                ));
            }
            if !keys.insert(sensor.sequence_key.as_str()) {
                return Err(ConfigError::invalid(
                    "sensors",
                    format!("duplicate sequence key {:?}", sensor.sequence_key),
                ));
            }
            TankModel::from_config(sensor.tank)?;
        }

        self.conditioner.validate()?;
        self.anomaly.validate()?;
        self.delivery.validate()?;
        Ok(())
    }
}
