// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! A single pulse detection.

use serde::{Deserialize, Serialize};

use crate::ident::{SeqNo, Timestamp};

/// One pulse as seen by a candidate: the detector fields plus the antenna
/// frequency in force when it arrived and a global sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pulse {
    /// Detection timestamp, seconds since the epoch.
    pub ts: Timestamp,
    /// Estimated offset from the antenna frequency, kHz.
    pub dfreq: f64,
    /// Estimated signal strength, dB.
    pub sig: f64,
    /// Estimated noise level around the pulse, dB.
    pub noise: f64,
    /// Frequency the receiving antenna was tuned to, MHz.
    pub ant_freq: f64,
    /// Global arrival order; candidates use this to detect shared pulses.
    pub seq_no: SeqNo,
}
