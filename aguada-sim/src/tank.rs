// Aguada Simulator - Simulated sensor network
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Simulated tank with an ultrasonic ranger on its lid

use aguada::{RangeSample, Ranger, TankConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Behaviour of one simulated tank
#[derive(Debug, Clone)]
pub struct TankProfile {
    /// Starting fill fraction (0.0..=1.0)
    pub initial_fill: f32,
    /// Level change per ping while filling, in centimeters
    pub flow_cm: f32,
    /// Echo jitter amplitude in centimeters
    pub noise_cm: f32,
    /// Probability that a ping gets no echo
    pub timeout_rate: f64,
    /// Ping after which the tank loses this many centimeters at once
    pub leak: Option<(u32, f32)>,
}

impl Default for TankProfile {
    fn default() -> Self {
        Self {
            initial_fill: 0.6,
            flow_cm: 0.4,
            noise_cm: 1.5,
            timeout_rate: 0.05,
            leak: None,
        }
    }
}

/// A tank whose level slowly cycles between low and high water marks
pub struct SimulatedTank {
    geometry: TankConfig,
    profile: TankProfile,
    level_cm: f32,
    filling: bool,
    pings: u32,
    rng: StdRng,
}

impl SimulatedTank {
    pub fn new(geometry: TankConfig, profile: TankProfile, seed: u64) -> Self {
        let level_cm = f32::from(geometry.level_max_cm) * profile.initial_fill.clamp(0.0, 1.0);
        Self {
            geometry,
            profile,
            level_cm,
            filling: true,
            pings: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// True water level
    pub fn level_cm(&self) -> f32 {
        self.level_cm
    }

    fn advance(&mut self) {
        let max = f32::from(self.geometry.level_max_cm);
        if self.filling {
            self.level_cm += self.profile.flow_cm;
            if self.level_cm >= max * 0.95 {
                self.filling = false;
            }
        } else {
            self.level_cm -= self.profile.flow_cm;
            if self.level_cm <= max * 0.10 {
                self.filling = true;
            }
        }

        if let Some((at, drop_cm)) = self.profile.leak {
            if self.pings == at {
                tracing::info!("tank leak: level falls by {:.0} cm", drop_cm);
                self.level_cm -= drop_cm;
            }
        }
        self.level_cm = self.level_cm.clamp(0.0, max);
    }
}

impl Ranger for SimulatedTank {
    fn ping(&mut self) -> RangeSample {
        self.pings += 1;
        self.advance();

        if self.rng.gen_bool(self.profile.timeout_rate) {
            return RangeSample::Timeout;
        }

        let top = f32::from(self.geometry.level_max_cm) + f32::from(self.geometry.sensor_offset_cm);
        let jitter = self.rng.gen_range(-1.0f32..=1.0) * self.profile.noise_cm;
        let distance_cm = (top - self.level_cm + jitter).max(0.0);
        RangeSample::from_echo_micros((distance_cm * 58.0) as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet() -> TankProfile {
        TankProfile {
            noise_cm: 0.0,
            timeout_rate: 0.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_echo_matches_level() {
        let mut tank = SimulatedTank::new(
            TankConfig::default(),
            TankProfile {
                flow_cm: 0.0,
                initial_fill: 0.5,
                ..quiet()
            },
            1,
        );
        // 450 + 20 - 225 = 245 cm
        assert_eq!(tank.ping(), RangeSample::Distance(245));
    }

    #[test]
    fn test_level_stays_in_bounds() {
        let mut tank = SimulatedTank::new(
            TankConfig::default(),
            TankProfile {
                flow_cm: 25.0,
                ..quiet()
            },
            2,
        );
        for _ in 0..200 {
            tank.ping();
            assert!((0.0..=450.0).contains(&tank.level_cm()));
        }
    }

    #[test]
    fn test_leak_drops_level() {
        let mut tank = SimulatedTank::new(
            TankConfig::default(),
            TankProfile {
                flow_cm: 0.0,
                leak: Some((3, 100.0)),
                ..quiet()
            },
            3,
        );
        tank.ping();
        tank.ping();
        let before = tank.level_cm();
        tank.ping();
        assert_eq!(tank.level_cm(), before - 100.0);
    }
}
