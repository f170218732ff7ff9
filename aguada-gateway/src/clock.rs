// Aguada Gateway - Receive, acknowledge and forward
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Reception timestamps
//!
//! The gateway stamps every packet on arrival. Until the wall clock has
//! been synchronized the stamp falls back to seconds since gateway start,
//! and the record says so.

use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Instant;

/// Earliest wall-clock time accepted as synchronized (2024-01-01T00:00:00Z)
pub const SYNC_EPOCH_FLOOR: i64 = 1_704_067_200;

/// A reception timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayTime {
    /// Seconds (unix time if synced, else since boot)
    pub seconds: u32,
    /// Whether `seconds` is unix time
    pub synced: bool,
}

/// Time source used to stamp packets
pub trait Clock: Send + Sync {
    /// Unix seconds, or `None` if the wall clock is not synchronized
    fn wall_seconds(&self) -> Option<u32>;

    /// Seconds since gateway start
    fn boot_seconds(&self) -> u32;

    /// Timestamp for a packet received now
    fn now(&self) -> GatewayTime {
        match self.wall_seconds() {
            Some(seconds) => GatewayTime {
                seconds,
                synced: true,
            },
            None => GatewayTime {
                seconds: self.boot_seconds().max(1),
                synced: false,
            },
        }
    }
}

/// System clock; the wall clock counts as synchronized once it is past
/// [`SYNC_EPOCH_FLOOR`]
#[derive(Debug)]
pub struct SystemClock {
    started: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn wall_seconds(&self) -> Option<u32> {
        let now = Utc::now().timestamp();
        if now < SYNC_EPOCH_FLOOR {
            return None;
        }
        u32::try_from(now).ok()
    }

    fn boot_seconds(&self) -> u32 {
        u32::try_from(self.started.elapsed().as_secs()).unwrap_or(u32::MAX)
    }
}

/// Manually driven clock for tests and simulation
#[derive(Debug, Default)]
pub struct ManualClock {
    wall: AtomicU32,
    boot: AtomicU32,
    synced: AtomicBool,
}

impl ManualClock {
    /// Unsynchronized clock at boot second 0
    pub fn new() -> Self {
        Self::default()
    }

    /// Synchronize the wall clock to `unix_seconds`
    pub fn sync(&self, unix_seconds: u32) {
        self.wall.store(unix_seconds, Ordering::Relaxed);
        self.synced.store(true, Ordering::Relaxed);
    }

    /// Advance both clocks
    pub fn advance(&self, seconds: u32) {
        self.boot.fetch_add(seconds, Ordering::Relaxed);
        self.wall.fetch_add(seconds, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn wall_seconds(&self) -> Option<u32> {
        if self.synced.load(Ordering::Relaxed) {
            Some(self.wall.load(Ordering::Relaxed))
        } else {
            None
        }
    }

    fn boot_seconds(&self) -> u32 {
        self.boot.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsynced_falls_back_to_boot_time() {
        let clock = ManualClock::new();
        assert_eq!(
            clock.now(),
            GatewayTime {
                seconds: 1,
                synced: false
            }
        );

        clock.advance(90);
        assert_eq!(clock.now().seconds, 90);
        assert!(!clock.now().synced);
    }

    #[test]
    fn test_synced_uses_wall_time() {
        let clock = ManualClock::new();
        clock.sync(1_760_000_000);
        clock.advance(5);
        assert_eq!(
            clock.now(),
            GatewayTime {
                seconds: 1_760_000_005,
                synced: true
            }
        );
    }

    #[test]
    fn test_system_clock_is_synced() {
        let clock = SystemClock::new();
        let now = clock.now();
        assert!(now.synced);
        assert!(i64::from(now.seconds) >= SYNC_EPOCH_FLOOR);
    }
}
