// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Repairs receiver timestamps so everything downstream sees a
//! monotonically-plausible wall clock.
//!
//! Three eras of timestamps occur in raw streams:
//!
//! | era       | range                        | meaning                         |
//! |-----------|------------------------------|---------------------------------|
//! | monotonic | `[0, 946684800)`             | seconds since receiver boot     |
//! | pre-GPS   | `[946684800, 1262304000)`    | boot offset applied, pre-fix    |
//! | valid     | `[1262304000, now + slack]`  | real wall clock                 |
//!
//! Monotonic timestamps are promoted to pre-GPS by adding the epoch-2000
//! constant as they arrive. Records are then held back while a
//! [`ClockPinner`] estimates the single additive offset pinning the pre-GPS
//! clock to the valid one; once the estimate's error bound drops below the
//! tolerance — or a valid pulse timestamp proves no better estimate is
//! coming and forces the current best — the correction is committed, a time
//! fix is recorded, and the held records are released with repaired
//! timestamps. GPS fixes from a stuck GPS are dropped on the way in.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::clock_pinner::{ClockPinner, TsKind};
use crate::filer::{Filer, FilerError, TimeFixKind};
use crate::gps_validator::GpsValidator;
use crate::ident::Timestamp;
use crate::record::RawRecord;

/// 2000-01-01T00:00:00Z: added to monotonic timestamps.
pub const TS_BOOT_EPOCH: Timestamp = 946_684_800.0;
/// 2010-01-01T00:00:00Z: earliest believable wall-clock timestamp.
pub const TS_VALID_EPOCH: Timestamp = 1_262_304_000.0;
/// Slack beyond "now" before a timestamp is declared malformed.
const FUTURE_SLACK: Timestamp = 5.0 * 60.0;

fn is_monotonic(ts: Timestamp) -> bool {
    ts < TS_BOOT_EPOCH
}

fn is_valid(ts: Timestamp) -> bool {
    ts >= TS_VALID_EPOCH
}

/// What became of a record handed to [`ClockRepair::put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Held (or released) for downstream processing.
    Accepted,
    /// Timestamp beyond `now + 5 min`: malformed, dropped.
    DroppedFuture,
    /// GPS fix from a stuck GPS, dropped.
    DroppedStuckGps,
}

/// The repair filter. Feed records with [`Self::put`], signal end of input
/// with [`Self::finish`], and drain repaired records with [`Self::next`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClockRepair {
    tol: Timestamp,
    now: Timestamp,
    pinner: ClockPinner,
    gps: GpsValidator,
    held: VecDeque<RawRecord>,
    correcting: bool,
    offset: Timestamp,
    offset_error: Timestamp,
}

impl ClockRepair {
    /// Creates a filter that accepts a residual error of `tol` seconds and
    /// treats timestamps past `now + 5 min` as malformed.
    #[must_use]
    pub fn new(tol: Timestamp, now: Timestamp) -> Self {
        Self {
            tol,
            now,
            pinner: ClockPinner::new(),
            gps: GpsValidator::default(),
            held: VecDeque::new(),
            correcting: false,
            offset: 0.0,
            offset_error: 0.0,
        }
    }

    /// The committed pre-GPS correction, once correcting.
    #[must_use]
    pub fn offset(&self) -> Timestamp {
        self.offset
    }

    /// Feeds one parsed record.
    pub fn put(
        &mut self,
        mut rec: RawRecord,
        filer: &mut dyn Filer,
    ) -> Result<Disposition, FilerError> {
        if rec.ts() > self.now + FUTURE_SLACK {
            return Ok(Disposition::DroppedFuture);
        }

        let is_pulse = rec.is_pulse();
        let is_gps = matches!(rec, RawRecord::Gps { .. });
        if is_pulse || is_gps {
            let stuck = self.gps.accept(rec.ts(), is_pulse);
            if stuck && is_gps {
                return Ok(Disposition::DroppedStuckGps);
            }
        }

        // promote boot-relative timestamps to the pre-GPS era up front
        if is_monotonic(rec.ts()) {
            rec.shift_ts(TS_BOOT_EPOCH);
        }

        let ts = rec.ts();
        let kind = if is_valid(ts) {
            TsKind::Valid
        } else {
            TsKind::Invalid
        };
        if self.pinner.accept(ts, kind) && self.pinner.max_error() <= self.tol {
            self.commit(TimeFixKind::Pinned, filer)?;
        }

        // once a pulse carries a valid timestamp there will be no more
        // monotonic or pre-GPS ones: run with whatever estimate exists
        if !self.correcting && is_pulse && is_valid(ts) {
            self.pinner.force_estimate();
            self.commit(TimeFixKind::Forced, filer)?;
        }

        self.held.push_back(rec);
        Ok(Disposition::Accepted)
    }

    /// Signals end of input, forcing a correction so held records drain.
    pub fn finish(&mut self, filer: &mut dyn Filer) -> Result<(), FilerError> {
        if !self.correcting {
            self.pinner.force_estimate();
            self.commit(TimeFixKind::Forced, filer)?;
        }
        Ok(())
    }

    /// Next repaired record, if the correction has been committed.
    pub fn next(&mut self) -> Option<RawRecord> {
        if !self.correcting {
            return None;
        }
        let mut rec = self.held.pop_front()?;
        let ts = rec.ts();
        if !is_valid(ts) {
            rec.shift_ts(self.offset);
        }
        Some(rec)
    }

    fn commit(&mut self, kind: TimeFixKind, filer: &mut dyn Filer) -> Result<(), FilerError> {
        if self.correcting {
            return Ok(());
        }
        if self.pinner.have_offset() {
            self.offset = self.pinner.offset();
            self.offset_error = self.pinner.max_error();
        } else {
            self.offset = 0.0;
            self.offset_error = 0.0;
        }
        self.correcting = true;
        filer.add_time_fix(
            TS_BOOT_EPOCH,
            TS_VALID_EPOCH,
            self.offset,
            self.offset_error,
            kind,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filer::MemoryFiler;
    use crate::ident::Port;

    fn pulse(ts: Timestamp) -> RawRecord {
        RawRecord::Pulse {
            port: Port(1),
            ts,
            dfreq: 1.0,
            sig: -50.0,
            noise: -90.0,
        }
    }

    fn gps(ts: Timestamp) -> RawRecord {
        RawRecord::Gps {
            ts,
            lat: 44.0,
            lon: -66.0,
            alt: 10.0,
        }
    }

    const NOW: Timestamp = 1_700_000_000.0;

    #[test]
    fn valid_stream_passes_through_unchanged() {
        let mut f = MemoryFiler::new();
        let mut cr = ClockRepair::new(1.0, NOW);
        let t0 = 1_600_000_000.0;
        assert_eq!(cr.put(pulse(t0), &mut f).unwrap(), Disposition::Accepted);
        assert_eq!(cr.next().map(|r| r.ts()), Some(t0));
        assert_eq!(cr.offset(), 0.0);
        // the trivial correction is still recorded
        assert_eq!(f.time_fixes.len(), 1);
    }

    #[test]
    fn monotonic_timestamps_are_pinned_to_the_gps_clock() {
        let mut f = MemoryFiler::new();
        let mut cr = ClockRepair::new(10.0, NOW);
        // boot-relative pulses around t=100, bracketed by GPS fixes
        let g = 1_600_000_000.0;
        cr.put(gps(g), &mut f).unwrap();
        cr.put(pulse(100.0), &mut f).unwrap();
        cr.put(pulse(102.0), &mut f).unwrap();
        cr.put(gps(g + 4.0), &mut f).unwrap();
        cr.finish(&mut f).unwrap();

        let out: Vec<Timestamp> = core::iter::from_fn(|| cr.next()).map(|r| r.ts()).collect();
        assert_eq!(out.len(), 4);
        // the pulse records come back in the valid era, in order
        assert!(out[1] >= TS_VALID_EPOCH);
        assert!((out[2] - out[1] - 2.0).abs() < 1e-6);
        assert!(out[1] > out[0] && out[3] > out[2]);
        assert_eq!(f.time_fixes.len(), 1);
    }

    #[test]
    fn future_timestamps_are_dropped() {
        let mut f = MemoryFiler::new();
        let mut cr = ClockRepair::new(1.0, NOW);
        assert_eq!(
            cr.put(pulse(NOW + 3600.0), &mut f).unwrap(),
            Disposition::DroppedFuture
        );
    }

    #[test]
    fn stuck_gps_fixes_are_dropped() {
        let mut f = MemoryFiler::new();
        let mut cr = ClockRepair::new(1.0, NOW);
        let g = 1_600_000_000.0;
        cr.put(gps(g), &mut f).unwrap();
        for i in 0..70 {
            cr.put(pulse(g + f64::from(i) * 10.0), &mut f).unwrap();
        }
        // same fix timestamp after >10 min of pulse clock: stuck
        assert_eq!(cr.put(gps(g), &mut f).unwrap(), Disposition::DroppedStuckGps);
    }
}
