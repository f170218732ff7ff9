// Aguada - Water-level telemetry protocol
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Anomaly detection on the level series
//!
//! Flags sudden drops (leaks), sudden rises (pump failure, flooding) and a
//! reading that has not moved for too long (stuck sensor). Elapsed time is
//! derived from the sequence distance and the sampling interval, so the
//! detector needs no clock.

use crate::error::ConfigError;
use crate::protocol::AlertType;
use serde::Deserialize;

/// Detection thresholds
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AnomalyConfig {
    /// Level change versus baseline that raises a rapid alert
    pub rapid_change_threshold_cm: i16,
    /// Minutes without movement before the sensor is considered stuck
    pub no_change_minutes: u32,
    /// Changes up to this size count as "no movement"
    pub no_change_threshold_cm: i16,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            rapid_change_threshold_cm: 50,
            no_change_minutes: 120,
            no_change_threshold_cm: 2,
        }
    }
}

impl AnomalyConfig {
    /// Check parameter ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rapid_change_threshold_cm <= 0 {
            return Err(ConfigError::invalid(
                "rapid_change_threshold_cm",
                "must be positive",
            ));
        }
        if self.no_change_threshold_cm < 0
            || self.no_change_threshold_cm >= self.rapid_change_threshold_cm
        {
            return Err(ConfigError::invalid(
                "no_change_threshold_cm",
                "must be non-negative and below the rapid change threshold",
            ));
        }
        Ok(())
    }
}

/// Per-sensor detector state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AnomalyState {
    /// No valid measurement seen since start or since the last sensing failure
    #[default]
    Uninitialized,
    /// Comparing against an anchored baseline
    Tracking {
        baseline_level_cm: i16,
        sequence_at_last_change: u32,
    },
}

/// Level anomaly detector
#[derive(Debug, Clone)]
pub struct AnomalyDetector {
    config: AnomalyConfig,
    sample_interval_s: u32,
    state: AnomalyState,
}

impl AnomalyDetector {
    /// Create a detector for a sensor sampled every `sample_interval_s` seconds
    pub fn new(config: AnomalyConfig, sample_interval_s: u32) -> Self {
        Self {
            config,
            sample_interval_s,
            state: AnomalyState::Uninitialized,
        }
    }

    /// Current state
    pub fn state(&self) -> AnomalyState {
        self.state
    }

    /// Evaluate a valid level measurement taken at `sequence`
    pub fn evaluate(&mut self, level_cm: i16, sequence: u32) -> AlertType {
        let (baseline, anchor_seq) = match self.state {
            AnomalyState::Uninitialized => {
                self.anchor(level_cm, sequence);
                return AlertType::None;
            }
            AnomalyState::Tracking {
                baseline_level_cm,
                sequence_at_last_change,
            } => (baseline_level_cm, sequence_at_last_change),
        };

        let delta = i32::from(level_cm) - i32::from(baseline);
        let elapsed_minutes =
            u64::from(sequence.wrapping_sub(anchor_seq)) * u64::from(self.sample_interval_s) / 60;
        let rapid = i32::from(self.config.rapid_change_threshold_cm);
        let still = i32::from(self.config.no_change_threshold_cm);

        let alert = if delta <= -rapid {
            AlertType::RapidDrop
        } else if delta >= rapid {
            AlertType::RapidRise
        } else if elapsed_minutes >= u64::from(self.config.no_change_minutes) && delta.abs() <= still {
            AlertType::SensorStuck
        } else {
            AlertType::None
        };

        if delta.abs() > still {
            self.anchor(level_cm, sequence);
        }

        if alert.is_alert() {
            log::warn!(
                "anomaly {}: level {} cm, baseline {} cm, {} min since change",
                alert,
                level_cm,
                baseline,
                elapsed_minutes
            );
        }
        alert
    }

    /// Record a cycle with no valid reading; always alerts
    pub fn sensing_failure(&mut self) -> AlertType {
        self.reset();
        AlertType::SensorStuck
    }

    /// Return to the uninitialized state
    pub fn reset(&mut self) {
        self.state = AnomalyState::Uninitialized;
    }

    fn anchor(&mut self, level_cm: i16, sequence: u32) {
        self.state = AnomalyState::Tracking {
            baseline_level_cm: level_cm,
            sequence_at_last_change: sequence,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> AnomalyDetector {
        AnomalyDetector::new(AnomalyConfig::default(), 30)
    }

    #[test]
    fn test_first_measurement_anchors() {
        let mut d = detector();
        assert_eq!(d.evaluate(300, 1), AlertType::None);
        assert_eq!(
            d.state(),
            AnomalyState::Tracking {
                baseline_level_cm: 300,
                sequence_at_last_change: 1
            }
        );
    }

    #[test]
    fn test_rapid_drop_and_rise() {
        let mut d = detector();
        d.evaluate(300, 1);
        assert_eq!(d.evaluate(250, 2), AlertType::RapidDrop);
        // Re-anchored at 250
        assert_eq!(d.evaluate(300, 3), AlertType::RapidRise);
        assert_eq!(d.evaluate(260, 4), AlertType::None);
    }

    #[test]
    fn test_below_threshold_is_quiet() {
        let mut d = detector();
        d.evaluate(300, 1);
        assert_eq!(d.evaluate(251, 2), AlertType::None);
    }

    #[test]
    fn test_stuck_after_no_change_window() {
        let mut d = detector();
        d.evaluate(300, 0);
        // 239 samples * 30 s = 119.5 min
        assert_eq!(d.evaluate(301, 239), AlertType::None);
        // 240 samples * 30 s = 120 min
        assert_eq!(d.evaluate(302, 240), AlertType::SensorStuck);
    }

    #[test]
    fn test_movement_resets_stuck_window() {
        let mut d = detector();
        d.evaluate(300, 0);
        assert_eq!(d.evaluate(310, 200), AlertType::None);
        assert_eq!(d.evaluate(310, 300), AlertType::None);
        assert_eq!(d.evaluate(310, 440), AlertType::SensorStuck);
    }

    #[test]
    fn test_sensing_failure_alerts_and_resets() {
        let mut d = detector();
        d.evaluate(300, 1);
        assert_eq!(d.sensing_failure(), AlertType::SensorStuck);
        assert_eq!(d.state(), AnomalyState::Uninitialized);
        // Next valid reading only re-anchors
        assert_eq!(d.evaluate(100, 2), AlertType::None);
    }

    #[test]
    fn test_sequence_wraparound() {
        let mut d = detector();
        d.evaluate(300, u32::MAX - 10);
        assert_eq!(d.evaluate(300, 5), AlertType::None);
    }

    #[test]
    fn test_config_validation() {
        assert!(AnomalyConfig::default().validate().is_ok());
        let bad = AnomalyConfig {
            rapid_change_threshold_cm: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let overlap = AnomalyConfig {
            no_change_threshold_cm: 60,
            ..Default::default()
        };
        assert!(overlap.validate().is_err());
    }
}
