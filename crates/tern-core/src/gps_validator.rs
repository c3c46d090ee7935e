// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Detects a stuck GPS clock.
//!
//! If two consecutive GPS fixes carry the same timestamp while the pulse
//! clock shows at least `thresh` seconds elapsed between them, the GPS is
//! deemed stuck and its fixes are dropped until the timestamps move again.
//! Pulse timestamps are not assumed to arrive in order (antennas are
//! processed in interleaved chunks), so the intervening run is tracked as a
//! widening interval.

use serde::{Deserialize, Serialize};

use crate::ident::Timestamp;

/// Stuck-GPS detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpsValidator {
    thresh: Timestamp,
    last_gps_ts: Timestamp,
    pulse_lo: Timestamp,
    pulse_hi: Timestamp,
    stuck: bool,
}

impl Default for GpsValidator {
    fn default() -> Self {
        Self::new(10.0 * 60.0)
    }
}

impl GpsValidator {
    /// Creates a detector requiring `thresh` seconds of pulse clock between
    /// identical GPS fixes.
    #[must_use]
    pub fn new(thresh: Timestamp) -> Self {
        Self {
            thresh,
            last_gps_ts: 0.0,
            pulse_lo: 0.0,
            pulse_hi: 0.0,
            stuck: false,
        }
    }

    /// Whether the latest assessment is "stuck".
    #[must_use]
    pub fn is_stuck(&self) -> bool {
        self.stuck
    }

    /// Clears the stuck flag, e.g. when replaying a stream from the start.
    pub fn unstick(&mut self) {
        self.stuck = false;
    }

    /// Feeds one timestamp from the pulse clock (`is_pulse`) or the GPS.
    /// Returns the current stuck assessment.
    pub fn accept(&mut self, ts: Timestamp, is_pulse: bool) -> bool {
        if is_pulse {
            if self.last_gps_ts != 0.0 {
                if self.pulse_hi == 0.0 {
                    self.pulse_lo = ts;
                    self.pulse_hi = ts;
                } else {
                    self.pulse_lo = self.pulse_lo.min(ts);
                    self.pulse_hi = self.pulse_hi.max(ts);
                }
            }
        } else {
            if self.pulse_hi != 0.0 && self.pulse_hi - self.pulse_lo >= self.thresh {
                self.stuck = ts == self.last_gps_ts;
            }
            self.pulse_hi = 0.0;
            self.last_gps_ts = ts;
        }
        self.stuck
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_fixes_across_a_long_pulse_run_mean_stuck() {
        let mut v = GpsValidator::new(600.0);
        assert!(!v.accept(5000.0, false));
        for i in 0..70 {
            v.accept(5000.0 + f64::from(i) * 10.0, true);
        }
        assert!(v.accept(5000.0, false));
        assert!(v.is_stuck());
    }

    #[test]
    fn moving_fixes_unstick() {
        let mut v = GpsValidator::new(600.0);
        v.accept(5000.0, false);
        for i in 0..70 {
            v.accept(5000.0 + f64::from(i) * 10.0, true);
        }
        assert!(v.accept(5000.0, false));
        for i in 0..70 {
            v.accept(5700.0 + f64::from(i) * 10.0, true);
        }
        assert!(!v.accept(6400.0, false));
    }

    #[test]
    fn short_pulse_runs_never_trip_the_detector() {
        let mut v = GpsValidator::new(600.0);
        v.accept(5000.0, false);
        v.accept(5001.0, true);
        v.accept(5002.0, true);
        assert!(!v.accept(5000.0, false));
    }
}
