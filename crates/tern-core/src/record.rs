// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Raw receiver records: one comma-separated line each, tagged by the first
//! character.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ident::{Port, Timestamp};

/// A malformed input line. These are data faults: the caller warns
/// (bounded) and drops the record.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordParseError {
    /// Line was empty or the leading type character is unknown.
    #[error("unrecognized record type")]
    UnknownType,
    /// A required field is missing or failed to parse.
    #[error("malformed {0} record")]
    Malformed(&'static str),
}

/// One parsed input record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RawRecord {
    /// `pPORT,TS,DFREQ,SIG,NOISE` — a pulse detection.
    Pulse {
        /// Antenna port.
        port: Port,
        /// Detection timestamp.
        ts: Timestamp,
        /// Offset frequency, kHz.
        dfreq: f64,
        /// Signal strength, dB.
        sig: f64,
        /// Noise level, dB.
        noise: f64,
    },
    /// `G,TS,LAT,LON,ALT` — a GPS fix. Latitude/longitude may be NaN.
    Gps {
        /// Fix timestamp.
        ts: Timestamp,
        /// Latitude, degrees.
        lat: f64,
        /// Longitude, degrees.
        lon: f64,
        /// Altitude, metres.
        alt: f64,
    },
    /// `S,TS,PORT,FLAG,VALUE,RC,ERR` — a parameter setting. Flag `-m` with
    /// return code 0 retunes the port to `value` MHz.
    Param {
        /// Setting timestamp.
        ts: Timestamp,
        /// Port the setting applies to.
        port: Port,
        /// Parameter flag, e.g. `-m`.
        flag: String,
        /// Parameter value.
        value: f64,
        /// Return code; non-zero means the setting failed.
        rc: i32,
        /// Error text when the setting failed.
        err: String,
    },
    /// `C,TS,LEVEL,REMAINING` — clock-sync event; carries a timestamp only.
    Clock {
        /// Event timestamp.
        ts: Timestamp,
        /// Sync level.
        level: i32,
        /// Seconds remaining at this level.
        remaining: f64,
    },
    /// `F,TS` — synthetic file timestamp used by clock repair.
    FileTs {
        /// File timestamp.
        ts: Timestamp,
    },
}

impl RawRecord {
    /// The record's timestamp, common to every type.
    #[must_use]
    pub fn ts(&self) -> Timestamp {
        match self {
            Self::Pulse { ts, .. }
            | Self::Gps { ts, .. }
            | Self::Param { ts, .. }
            | Self::Clock { ts, .. }
            | Self::FileTs { ts } => *ts,
        }
    }

    /// Shifts the record's timestamp by `dt`.
    pub fn shift_ts(&mut self, dt: f64) {
        match self {
            Self::Pulse { ts, .. }
            | Self::Gps { ts, .. }
            | Self::Param { ts, .. }
            | Self::Clock { ts, .. }
            | Self::FileTs { ts } => *ts += dt,
        }
    }

    /// Whether this is a pulse record.
    #[must_use]
    pub fn is_pulse(&self) -> bool {
        matches!(self, Self::Pulse { .. })
    }

    /// Parses one input line.
    pub fn parse(line: &str) -> Result<Self, RecordParseError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let mut chars = line.chars();
        match chars.next() {
            Some('p') => parse_pulse(chars.as_str()),
            Some('G') => parse_gps(rest_after_comma(line)),
            Some('S') => parse_param(rest_after_comma(line)),
            Some('C') => parse_clock(rest_after_comma(line)),
            Some('F') => parse_file_ts(rest_after_comma(line)),
            _ => Err(RecordParseError::UnknownType),
        }
    }
}

fn rest_after_comma(line: &str) -> &str {
    line.get(2..).unwrap_or("")
}

fn field<'a>(it: &mut impl Iterator<Item = &'a str>, what: &'static str) -> Result<&'a str, RecordParseError> {
    it.next().ok_or(RecordParseError::Malformed(what))
}

fn num(s: &str, what: &'static str) -> Result<f64, RecordParseError> {
    s.trim()
        .parse::<f64>()
        .map_err(|_| RecordParseError::Malformed(what))
}

fn parse_pulse(rest: &str) -> Result<RawRecord, RecordParseError> {
    let mut it = rest.split(',');
    let port = field(&mut it, "pulse")?
        .trim()
        .parse::<i16>()
        .map_err(|_| RecordParseError::Malformed("pulse"))?;
    let ts = num(field(&mut it, "pulse")?, "pulse")?;
    let dfreq = num(field(&mut it, "pulse")?, "pulse")?;
    let sig = num(field(&mut it, "pulse")?, "pulse")?;
    let noise = num(field(&mut it, "pulse")?, "pulse")?;
    Ok(RawRecord::Pulse {
        port: Port(port),
        ts,
        dfreq,
        sig,
        noise,
    })
}

fn parse_gps(rest: &str) -> Result<RawRecord, RecordParseError> {
    let mut it = rest.split(',');
    let ts = num(field(&mut it, "GPS")?, "GPS")?;
    let lat = num(field(&mut it, "GPS")?, "GPS")?;
    let lon = num(field(&mut it, "GPS")?, "GPS")?;
    let alt = num(field(&mut it, "GPS")?, "GPS")?;
    Ok(RawRecord::Gps { ts, lat, lon, alt })
}

fn parse_param(rest: &str) -> Result<RawRecord, RecordParseError> {
    let mut it = rest.split(',');
    let ts = num(field(&mut it, "param")?, "param")?;
    let port = field(&mut it, "param")?
        .trim()
        .parse::<i16>()
        .map_err(|_| RecordParseError::Malformed("param"))?;
    let flag = field(&mut it, "param")?.trim().to_owned();
    let value = num(field(&mut it, "param")?, "param")?;
    let rc = field(&mut it, "param")?
        .trim()
        .parse::<i32>()
        .map_err(|_| RecordParseError::Malformed("param"))?;
    // trailing error text is optional and may itself contain commas
    let err = it.collect::<Vec<_>>().join(",");
    Ok(RawRecord::Param {
        ts,
        port: Port(port),
        flag,
        value,
        rc,
        err,
    })
}

fn parse_clock(rest: &str) -> Result<RawRecord, RecordParseError> {
    let mut it = rest.split(',');
    let ts = num(field(&mut it, "clock")?, "clock")?;
    let level = field(&mut it, "clock")?
        .trim()
        .parse::<i32>()
        .map_err(|_| RecordParseError::Malformed("clock"))?;
    let remaining = it.next().map_or(Ok(0.0), |s| num(s, "clock"))?;
    Ok(RawRecord::Clock {
        ts,
        level,
        remaining,
    })
}

fn parse_file_ts(rest: &str) -> Result<RawRecord, RecordParseError> {
    let mut it = rest.split(',');
    let ts = num(field(&mut it, "file-ts")?, "file-ts")?;
    Ok(RawRecord::FileTs { ts })
}
