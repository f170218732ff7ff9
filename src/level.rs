// Aguada - Water-level telemetry protocol
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Tank level model
//!
//! Converts a sensor-to-surface distance into water level, fill percentage
//! and stored volume for a straight-walled tank.

use crate::error::ConfigError;
use serde::Deserialize;

/// Tank geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TankConfig {
    /// Water height of a full tank
    pub level_max_cm: i16,
    /// Distance from the sensor face to the full-tank surface
    pub sensor_offset_cm: i16,
    /// Volume of a full tank in liters
    pub volume_max_l: u32,
}

impl Default for TankConfig {
    fn default() -> Self {
        Self {
            level_max_cm: 450,
            sensor_offset_cm: 20,
            volume_max_l: 80_000,
        }
    }
}

/// Level, percentage and volume derived from one distance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LevelReading {
    pub level_cm: i16,
    pub percent: u8,
    pub volume_l: u32,
}

/// Validated tank model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TankModel {
    config: TankConfig,
}

impl TankModel {
    /// Build a model, rejecting a non-positive full height
    pub fn new(level_max_cm: i16, sensor_offset_cm: i16, volume_max_l: u32) -> Result<Self, ConfigError> {
        Self::from_config(TankConfig {
            level_max_cm,
            sensor_offset_cm,
            volume_max_l,
        })
    }

    /// Build a model from configuration
    pub fn from_config(config: TankConfig) -> Result<Self, ConfigError> {
        if config.level_max_cm <= 0 {
            return Err(ConfigError::invalid(
                "level_max_cm",
                format!("must be positive, got {}", config.level_max_cm),
            ));
        }
        Ok(Self { config })
    }

    /// Geometry in use
    pub fn config(&self) -> &TankConfig {
        &self.config
    }

    /// Compute level, percent and volume for a distance reading
    pub fn compute(&self, distance_cm: i16) -> LevelReading {
        let max = i64::from(self.config.level_max_cm);
        let raw = max + i64::from(self.config.sensor_offset_cm) - i64::from(distance_cm);
        let level = raw.clamp(0, max);

        let percent = level * 100 / max;
        let volume = level * i64::from(self.config.volume_max_l) / max;

        LevelReading {
            level_cm: level as i16,
            percent: percent as u8,
            volume_l: volume as u32,
        }
    }
}
