// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Recognition parameters. All durations are seconds, frequencies kHz/MHz as
//! noted; the CLI converts from its millisecond-denominated flags.

use serde::{Deserialize, Serialize};

use crate::ident::{Gap, PULSES_PER_BURST};

/// Full parameter set for a foray.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Params {
    /// Antenna frequency (MHz) assumed for a port before any setting record.
    pub default_freq_mhz: f64,
    /// Ignore frequency-setting records; all ports stay on the default.
    pub force_default_freq: bool,
    /// Pulses with offset frequency below this (kHz) are dropped.
    pub min_dfreq_khz: f64,
    /// Pulses with offset frequency above this (kHz) are dropped.
    pub max_dfreq_khz: f64,
    /// Tolerance on intra-burst gaps, seconds.
    pub pulse_slop: Gap,
    /// Tolerance on the inter-burst gap, seconds.
    pub burst_slop: Gap,
    /// Additional inter-burst tolerance per skipped burst, seconds.
    pub burst_slop_expansion: Gap,
    /// Maximum width of a candidate's offset-frequency range, kHz.
    pub freq_slop_khz: f64,
    /// Maximum width of a candidate's within-burst signal range, dB.
    /// Negative disables the signal filter.
    pub sig_slop_db: f64,
    /// Accepted pulses required to confirm a tag identity (≥ pulses/burst).
    pub pulses_to_confirm_id: usize,
    /// Bursts that may go missing before a run is closed.
    pub max_skipped_bursts: u32,
    /// Hard ceiling on edge reach, seconds; bounds graph size for
    /// long-period tags regardless of `max_skipped_bursts`.
    pub max_skipped_time: Gap,
    /// Relative clock-rate mismatch between tag and receiver (dimensionless,
    /// e.g. `50e-6` for 50 ppm).
    pub clock_fuzz: f64,
    /// Maximum sustained pulse rate, Hz; 0 disables rate limiting.
    pub max_pulse_rate: f64,
    /// Window over which the pulse rate is measured, seconds.
    pub pulse_rate_window: Gap,
    /// Minimum spacing between bogus-tag emissions for discarded windows,
    /// seconds.
    pub min_bogus_spacing: Gap,
    /// 1 when the input clock may jump ±1 s between records (Lotek `.DTA`
    /// streams); builds the clock-jump graph columns.
    pub timestamp_wonkiness: u32,
    /// Drive tag activation from the events table rather than activating
    /// every registered tag at the epoch.
    pub use_events: bool,
    /// Boot session recorded with the output batch.
    pub boot_num: i64,
    /// Acceptable residual error when pinning the pre-GPS clock, seconds.
    pub clock_repair_tol: f64,
    /// Minimum spacing between recorded GPS fixes, seconds.
    pub min_gps_dt: f64,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            default_freq_mhz: 0.0,
            force_default_freq: false,
            min_dfreq_khz: f64::NEG_INFINITY,
            max_dfreq_khz: f64::INFINITY,
            pulse_slop: 0.0015,
            burst_slop: 0.010,
            burst_slop_expansion: 0.001,
            freq_slop_khz: 2.0,
            sig_slop_db: 10.0,
            pulses_to_confirm_id: PULSES_PER_BURST,
            max_skipped_bursts: 60,
            max_skipped_time: 1000.0,
            clock_fuzz: 50e-6,
            max_pulse_rate: 0.0,
            pulse_rate_window: 60.0,
            min_bogus_spacing: 600.0,
            timestamp_wonkiness: 0,
            use_events: false,
            boot_num: 1,
            clock_repair_tol: 1.0,
            min_gps_dt: 300.0,
        }
    }
}

impl Params {
    /// Edge-reach ceiling for one tag: the tail gap plus one period per
    /// allowed skipped burst (plus the burst that actually arrives), capped
    /// by the global time ceiling.
    #[must_use]
    pub fn max_time_for(&self, tail_gap: Gap, period: Gap) -> Gap {
        let by_bursts = tail_gap + f64::from(self.max_skipped_bursts + 1) * period;
        by_bursts.min(self.max_skipped_time)
    }
}
