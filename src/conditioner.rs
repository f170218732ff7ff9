// Aguada - Water-level telemetry protocol
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Signal conditioning for ultrasonic range readings
//!
//! Each cycle takes an odd number of raw samples, reduces them to a median
//! (timeouts count as a far-away sentinel), clamps the median into the valid
//! sensor range and smooths it with a scalar Kalman filter.

use crate::error::ConfigError;
use serde::Deserialize;

/// Sentinel distance substituted for timed-out samples when computing the median
pub const TIMEOUT_SENTINEL_CM: i32 = 10_000;

/// One raw ranging attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSample {
    /// Echo received, distance in centimeters
    Distance(u16),
    /// No echo within the ranger's timeout
    Timeout,
}

impl RangeSample {
    /// Convert an echo pulse width into a distance sample.
    ///
    /// Sound travels ~58 µs per round-trip centimeter; the result is rounded.
    pub fn from_echo_micros(pulse_us: u32) -> Self {
        let cm = (pulse_us.saturating_add(29)) / 58;
        RangeSample::Distance(cm.min(u32::from(u16::MAX)) as u16)
    }

    fn as_median_input(&self) -> i32 {
        match self {
            RangeSample::Distance(cm) => i32::from(*cm),
            RangeSample::Timeout => TIMEOUT_SENTINEL_CM,
        }
    }

    /// Whether the sample carries a distance
    pub fn is_valid(&self) -> bool {
        matches!(self, RangeSample::Distance(_))
    }
}

/// Conditioner parameters
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ConditionerConfig {
    /// Raw samples per cycle (odd)
    pub samples_per_cycle: usize,
    /// Smallest distance the sensor can report
    pub min_valid_cm: i16,
    /// Largest distance the sensor can report
    pub max_valid_cm: i16,
    /// Kalman process noise
    pub process_noise: f32,
    /// Kalman measurement noise
    pub measurement_noise: f32,
}

impl Default for ConditionerConfig {
    fn default() -> Self {
        Self {
            samples_per_cycle: 3,
            min_valid_cm: 5,
            max_valid_cm: 450,
            process_noise: 1.0,
            measurement_noise: 2.0,
        }
    }
}

impl ConditionerConfig {
    /// Check parameter ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.samples_per_cycle == 0 || self.samples_per_cycle % 2 == 0 {
            return Err(ConfigError::invalid(
                "samples_per_cycle",
                format!("must be odd and positive, got {}", self.samples_per_cycle),
            ));
        }
        if self.min_valid_cm < 0 || self.min_valid_cm >= self.max_valid_cm {
            return Err(ConfigError::invalid(
                "min_valid_cm",
                format!(
                    "range [{}, {}] is empty or negative",
                    self.min_valid_cm, self.max_valid_cm
                ),
            ));
        }
        if !(self.process_noise > 0.0) {
            return Err(ConfigError::invalid("process_noise", "must be positive"));
        }
        if !(self.measurement_noise > 0.0) {
            return Err(ConfigError::invalid("measurement_noise", "must be positive"));
        }
        Ok(())
    }
}

/// Scalar recursive estimator
#[derive(Debug, Clone)]
pub struct KalmanFilter {
    process_noise: f32,
    measurement_noise: f32,
    estimate: f32,
    error_covariance: f32,
    initialized: bool,
}

impl KalmanFilter {
    /// Create an uninitialized filter
    pub fn new(process_noise: f32, measurement_noise: f32) -> Self {
        Self {
            process_noise,
            measurement_noise,
            estimate: 0.0,
            error_covariance: 0.0,
            initialized: false,
        }
    }

    /// Feed one measurement and return the new estimate
    pub fn update(&mut self, measurement: f32) -> f32 {
        if !self.initialized {
            self.estimate = measurement;
            self.error_covariance = self.measurement_noise;
            self.initialized = true;
            return self.estimate;
        }

        self.error_covariance += self.process_noise;
        let gain = self.error_covariance / (self.error_covariance + self.measurement_noise);
        self.estimate += gain * (measurement - self.estimate);
        self.error_covariance *= 1.0 - gain;
        self.estimate
    }

    /// Forget all history
    pub fn reset(&mut self) {
        self.estimate = 0.0;
        self.error_covariance = 0.0;
        self.initialized = false;
    }

    /// Current estimate, if any measurement has been seen
    pub fn estimate(&self) -> Option<f32> {
        self.initialized.then_some(self.estimate)
    }

    /// Current error covariance
    pub fn error_covariance(&self) -> f32 {
        self.error_covariance
    }
}

/// Outcome of conditioning one cycle of samples
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conditioned {
    /// Filtered distance in whole centimeters
    Estimate(i16),
    /// Most samples timed out; the estimator was left untouched and its
    /// previous output (if any) is returned
    Rejected {
        /// Last estimate, rounded
        held: Option<i16>,
    },
    /// Every sample timed out; the estimator was reset
    NoEcho,
}

/// Median + clamp + Kalman pipeline
#[derive(Debug, Clone)]
pub struct SignalConditioner {
    config: ConditionerConfig,
    filter: KalmanFilter,
}

impl SignalConditioner {
    /// Create a conditioner
    pub fn new(config: ConditionerConfig) -> Self {
        let filter = KalmanFilter::new(config.process_noise, config.measurement_noise);
        Self { config, filter }
    }

    /// Configuration in use
    pub fn config(&self) -> &ConditionerConfig {
        &self.config
    }

    /// Median of the samples with timeouts mapped to the sentinel
    pub fn median(samples: &[RangeSample]) -> Option<i32> {
        if samples.is_empty() {
            return None;
        }
        let mut values: Vec<i32> = samples.iter().map(RangeSample::as_median_input).collect();
        values.sort_unstable();
        Some(values[values.len() / 2])
    }

    /// Condition one cycle of raw samples
    pub fn condition(&mut self, samples: &[RangeSample]) -> Conditioned {
        if samples.iter().all(|s| !s.is_valid()) {
            log::warn!("no valid range samples in cycle, resetting filter");
            self.filter.reset();
            return Conditioned::NoEcho;
        }

        let median = match Self::median(samples) {
            Some(m) if m < TIMEOUT_SENTINEL_CM => m,
            _ => {
                log::warn!("median of {} samples is a timeout, holding estimate", samples.len());
                return Conditioned::Rejected {
                    held: self.filter.estimate().map(round_cm),
                };
            }
        };

        let min = i32::from(self.config.min_valid_cm);
        let max = i32::from(self.config.max_valid_cm);
        if median < min || median > max {
            log::warn!("distance {} cm outside [{}, {}], clamping", median, min, max);
        }
        let clamped = median.clamp(min, max);

        let estimate = self.filter.update(clamped as f32);
        log::debug!("median={} cm filtered={:.2} cm", clamped, estimate);
        Conditioned::Estimate(round_cm(estimate))
    }

    /// Forget filter history
    pub fn reset(&mut self) {
        self.filter.reset();
    }

    /// Underlying filter
    pub fn filter(&self) -> &KalmanFilter {
        &self.filter
    }
}

fn round_cm(value: f32) -> i16 {
    value.round().clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16
}
