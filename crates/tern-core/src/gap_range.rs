// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Tolerance intervals around registered gap values.

use serde::{Deserialize, Serialize};

use crate::ident::Gap;

/// Snaps `g` down to a multiple of `chunk`.
#[must_use]
pub fn chunk_down(g: Gap, chunk: Gap) -> Gap {
    chunk * (g / chunk).floor()
}

/// Snaps `g` up to a multiple of `chunk`.
#[must_use]
pub fn chunk_up(g: Gap, chunk: Gap) -> Gap {
    chunk * (g / chunk).ceil()
}

/// Half-open acceptance interval `[lo, hi)` for one gap edge.
///
/// Endpoints are snapped outward to multiples of the tolerance so that tags
/// with nearby gap values share edge endpoints instead of splintering the
/// edge map.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GapRange {
    /// Inclusive lower endpoint.
    pub lo: Gap,
    /// Exclusive upper endpoint.
    pub hi: Gap,
}

impl GapRange {
    /// Builds the acceptance interval for registered gap `g`.
    ///
    /// Two clocks that differ by a relative rate error `fuzz` agree on `g`
    /// within `g·fuzz`; the interval is the wider of that window and the
    /// absolute tolerance `±tol`, snapped outward to `tol` multiples.
    #[must_use]
    pub fn around(g: Gap, tol: Gap, fuzz: f64) -> Self {
        Self {
            lo: chunk_down((g - tol).min(g * (1.0 - fuzz)), tol),
            hi: chunk_up((g + tol).max(g * (1.0 + fuzz)), tol),
        }
    }

    /// Interval width.
    #[must_use]
    pub fn width(&self) -> Gap {
        self.hi - self.lo
    }

    /// Whether `g` falls inside `[lo, hi)`.
    #[must_use]
    pub fn contains(&self, g: Gap) -> bool {
        g >= self.lo && g < self.hi
    }
}

/// A set of acceptance intervals feeding one transition.
pub type GapRanges = Vec<GapRange>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunking_snaps_outward() {
        let r = GapRange::around(0.020, 0.0015, 50e-6);
        assert!(r.lo <= 0.020 - 0.0015);
        assert!(r.hi >= 0.020 + 0.0015);
        // endpoints are multiples of tol
        assert!((r.lo / 0.0015 - (r.lo / 0.0015).round()).abs() < 1e-9);
        assert!((r.hi / 0.0015 - (r.hi / 0.0015).round()).abs() < 1e-9);
        assert!(r.contains(0.020));
    }

    #[test]
    fn fuzz_dominates_for_long_gaps() {
        // at 50 ppm a 1000 s gap drifts 50 ms, far beyond a 1.5 ms tolerance
        let r = GapRange::around(1000.0, 0.0015, 50e-6);
        assert!(r.lo <= 1000.0 * (1.0 - 50e-6));
        assert!(r.hi >= 1000.0 * (1.0 + 50e-6));
    }

    #[test]
    fn registered_value_is_interior() {
        for &g in &[0.02, 0.025, 0.03, 5.0, 10.075] {
            let r = GapRange::around(g, 0.0015, 50e-6);
            assert!(r.contains(g), "gap {g} not inside {r:?}");
        }
    }
}
