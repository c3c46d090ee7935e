// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Antenna frequency settings and nominal-frequency bucketing.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::ident::{NominalKhz, Timestamp};

/// The frequency a port is currently tuned to, snapped to the registered
/// nominal-frequency set.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FreqSetting {
    /// Requested frequency, MHz.
    pub mhz: f64,
    /// Closest registered nominal bucket.
    pub nominal: NominalKhz,
    /// When the setting took effect.
    pub ts: Timestamp,
}

impl FreqSetting {
    /// Creates a setting, snapping to the closest registered nominal
    /// frequency. With no registered frequencies the setting buckets to its
    /// own kHz value.
    #[must_use]
    pub fn new(mhz: f64, ts: Timestamp, nominals: &BTreeSet<NominalKhz>) -> Self {
        Self {
            mhz,
            nominal: closest_nominal(mhz, nominals),
            ts,
        }
    }
}

/// The registered nominal frequency closest to `mhz`.
#[must_use]
pub fn closest_nominal(mhz: f64, nominals: &BTreeSet<NominalKhz>) -> NominalKhz {
    let exact = NominalKhz::from_mhz(mhz);
    if nominals.is_empty() || nominals.contains(&exact) {
        return exact;
    }
    let mut best = exact;
    let mut best_fit = f64::INFINITY;
    for &n in nominals {
        let fit = (mhz - n.as_mhz()).abs();
        if fit < best_fit {
            best_fit = fit;
            best = n;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snaps_to_closest_registered_bucket() {
        let nominals: BTreeSet<_> = [NominalKhz(166_380), NominalKhz(150_100)].into();
        assert_eq!(closest_nominal(166.376, &nominals), NominalKhz(166_380));
        assert_eq!(closest_nominal(151.0, &nominals), NominalKhz(150_100));
    }

    #[test]
    fn empty_registry_buckets_verbatim() {
        let nominals = BTreeSet::new();
        assert_eq!(closest_nominal(123.456, &nominals), NominalKhz(123_456));
    }
}
