// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Pins an invalid clock to a valid one by bracketing runs of timestamps.
//!
//! The invalid clock is assumed to differ from the valid one by an unknown
//! but constant offset, with negligible rate difference. Each time the
//! stream switches between valid and invalid timestamps, the just-finished
//! run of the other kind is bracketed between two runs of this kind, and
//! pinning the interval midpoints yields an offset estimate whose error is
//! bounded by half the difference of the interval spans.

use serde::{Deserialize, Serialize};

use crate::ident::Timestamp;

/// Classification of a timestamp fed to the pinner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TsKind {
    /// Wall-clock plausible.
    Valid,
    /// Needs the offset applied.
    Invalid,
}

/// Offset estimator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClockPinner {
    run_kind: Option<TsKind>,
    lo: [Timestamp; 2],
    hi: [Timestamp; 2],
    have_offset: bool,
    est_offset: Timestamp,
    max_error: Timestamp,
}

impl Default for ClockPinner {
    fn default() -> Self {
        Self::new()
    }
}

fn slot(kind: TsKind) -> usize {
    match kind {
        TsKind::Valid => 0,
        TsKind::Invalid => 1,
    }
}

impl ClockPinner {
    /// Creates a pinner with no runs seen.
    #[must_use]
    pub fn new() -> Self {
        Self {
            run_kind: None,
            lo: [0.0; 2],
            hi: [0.0; 2],
            have_offset: false,
            est_offset: 0.0,
            max_error: 0.0,
        }
    }

    /// Whether an estimate is available.
    #[must_use]
    pub fn have_offset(&self) -> bool {
        self.have_offset
    }

    /// Offset to add to invalid timestamps.
    #[must_use]
    pub fn offset(&self) -> Timestamp {
        self.est_offset
    }

    /// Upper bound on the estimate's error, `+∞` before any estimate.
    #[must_use]
    pub fn max_error(&self) -> Timestamp {
        if self.have_offset {
            self.max_error
        } else {
            f64::INFINITY
        }
    }

    /// Feeds one timestamp. Returns `true` when a new estimate was formed,
    /// i.e. the stream just switched kinds with runs of both kinds already
    /// on record.
    pub fn accept(&mut self, ts: Timestamp, kind: TsKind) -> bool {
        let k = slot(kind);
        let other = 1 - k;

        if self.run_kind == Some(kind) {
            // extending the current run; no new bracket
            self.hi[k] = self.hi[k].max(ts);
            self.lo[k] = self.lo[k].min(ts);
            return false;
        }
        self.run_kind = Some(kind);

        if self.lo[k] == 0.0 || self.lo[other] == 0.0 {
            // no previous run of one of the kinds: just open the new run
            self.lo[k] = ts;
            self.hi[k] = ts;
            return false;
        }

        // the latest run of the other kind sits inside [hi[k], ts]: pin the
        // midpoints of the two intervals
        let mut est = (self.hi[k] + ts) / 2.0 - (self.lo[other] + self.hi[other]) / 2.0;
        if kind == TsKind::Invalid {
            // keep the sign convention: offset = valid − invalid
            est = -est;
        }
        // |outer span − inner span| / 2; outer measured with abs since time
        // reversals do occur in raw streams
        let err = (((ts - self.hi[k]).abs()) - (self.hi[other] - self.lo[other])).abs() / 2.0;
        if !self.have_offset || err < self.max_error {
            self.est_offset = est;
            self.max_error = err;
            self.have_offset = true;
        }
        self.lo[k] = ts;
        self.hi[k] = ts;
        true
    }

    /// Commits the best estimate formed so far, if any bracketing happened;
    /// with runs of both kinds but no completed bracket, falls back to
    /// pinning the two run midpoints directly.
    pub fn force_estimate(&mut self) {
        if self.have_offset {
            return;
        }
        let (v, i) = (slot(TsKind::Valid), slot(TsKind::Invalid));
        if self.lo[v] == 0.0 || self.lo[i] == 0.0 {
            return; // nothing to pin against
        }
        self.est_offset = (self.lo[v] + self.hi[v]) / 2.0 - (self.lo[i] + self.hi[i]) / 2.0;
        self.max_error = ((self.hi[v] - self.lo[v]) + (self.hi[i] - self.lo[i])) / 2.0;
        self.have_offset = true;
    }
}
