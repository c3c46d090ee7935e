// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Width-bounded observed interval for pulse frequency and signal strength.

use serde::{Deserialize, Serialize};

/// Tracks the low/high of a stream of observations and refuses to grow wider
/// than a fixed width.
///
/// All comparisons are closed: a value exactly `width` away from the far
/// bound is still compatible.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BoundedRange {
    width: f64,
    lo: f64,
    hi: f64,
    bounded: bool,
}

impl BoundedRange {
    /// Creates an empty range with the given maximum width.
    ///
    /// A negative width disables the bound entirely: every value is
    /// compatible and extension never fails.
    #[must_use]
    pub fn new(width: f64) -> Self {
        Self {
            width,
            lo: 0.0,
            hi: 0.0,
            bounded: false,
        }
    }

    /// Creates a range seeded with a first observation.
    #[must_use]
    pub fn seeded(width: f64, value: f64) -> Self {
        let mut r = Self::new(width);
        r.extend_by(value);
        r
    }

    /// Whether `value` could join without stretching the range past `width`.
    #[must_use]
    pub fn is_compatible(&self, value: f64) -> bool {
        if self.width < 0.0 || !self.bounded {
            return true;
        }
        self.hi - value <= self.width && value - self.lo <= self.width
    }

    /// Forgets the accumulated bounds; the next observation reseeds them.
    pub fn clear(&mut self) {
        self.bounded = false;
    }

    /// Extends the range to include `value`.
    ///
    /// Returns `false`, leaving the range unchanged, when the extension
    /// would exceed the width bound.
    pub fn extend_by(&mut self, value: f64) -> bool {
        if self.width < 0.0 {
            return true;
        }
        if !self.bounded {
            self.lo = value;
            self.hi = value;
            self.bounded = true;
            return true;
        }
        if value > self.hi {
            if value - self.lo > self.width {
                return false;
            }
            self.hi = value;
        } else if value < self.lo {
            if self.hi - value > self.width {
                return false;
            }
            self.lo = value;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_interval_at_exact_width() {
        let mut r = BoundedRange::seeded(10.0, -40.0);
        // exactly the width away: still in
        assert!(r.is_compatible(-30.0));
        assert!(r.extend_by(-30.0));
        assert!(r.is_compatible(-40.0));
        // one step past the width: out
        assert!(!r.is_compatible(-29.9));
        assert!(!r.extend_by(-41.0));
    }

    #[test]
    fn negative_width_disables_the_bound() {
        let mut r = BoundedRange::seeded(-1.0, 0.0);
        assert!(r.is_compatible(1e6));
        assert!(r.extend_by(-1e6));
    }

    #[test]
    fn clear_reseeds_on_next_observation() {
        let mut r = BoundedRange::seeded(2.0, 4.0);
        r.clear();
        assert!(r.is_compatible(100.0));
        assert!(r.extend_by(100.0));
        assert!(!r.is_compatible(97.0));
    }
}
