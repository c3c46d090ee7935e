// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The conductor: owns one gap graph per nominal frequency and one finder
//! per `(port, frequency)` pair, repairs the input clock, applies the
//! activation timeline in lockstep with the pulse stream, and routes every
//! pulse to the right finder.

use std::collections::{BTreeMap, BTreeSet};
use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::ambiguity::{Ambiguity, AmbiguityError};
use crate::clock_repair::{ClockRepair, Disposition};
use crate::filer::{Filer, FilerError};
use crate::finder::{FinderCx, FinderSlot};
use crate::freq::FreqSetting;
use crate::graph::{GapGraph, GraphError};
use crate::ident::{BatchId, MotusId, NominalKhz, Port, SeqNo, Timestamp};
use crate::params::Params;
use crate::pulse::Pulse;
use crate::record::RawRecord;
use crate::source::RecordSource;
use crate::tag::TagStore;
use crate::timeline::{EventTimeline, TagEvent};

/// Version tag embedded in the resume blob; incompatible blobs are refused.
pub const STATE_FORMAT_VERSION: u32 = 1;

/// Anything that can stop the conductor.
#[derive(Debug, Error)]
pub enum ForayError {
    /// Structural graph failure; not recoverable.
    #[error(transparent)]
    Graph(#[from] GraphError),
    /// Ambiguity bookkeeping failure; not recoverable.
    #[error(transparent)]
    Ambiguity(#[from] AmbiguityError),
    /// Output-side failure.
    #[error(transparent)]
    Filer(#[from] FilerError),
    /// Input-side failure.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// A resume blob from a different format version.
    #[error("saved state has format version {found}, expected {expected}")]
    StateVersion {
        /// Version found in the blob.
        found: u32,
        /// Version this build writes.
        expected: u32,
    },
    /// A resume blob that would not decode.
    #[error("saved state would not decode: {0}")]
    StateDecode(String),
    /// A persisted ambiguity group names a tag that is not registered.
    #[error("tag {0} is not in the registered-tag database")]
    UnknownTag(MotusId),
}

/// Per-category warning limiter: data faults are logged a bounded number of
/// times, then suppressed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct WarningGate {
    counts: BTreeMap<String, u64>,
}

impl WarningGate {
    const LIMIT: u64 = 25;

    /// Returns `true` when the caller should emit this warning.
    fn fire(&mut self, key: &str) -> bool {
        let c = self.counts.entry(key.to_owned()).or_insert(0);
        *c += 1;
        if *c <= Self::LIMIT {
            true
        } else {
            if *c == Self::LIMIT + 1 {
                warn!(category = key, "further warnings of this kind suppressed");
            }
            false
        }
    }
}

/// One foray: a batch-processing pass over a pulse stream against the
/// currently active tag set.
#[derive(Debug, Serialize, Deserialize)]
pub struct Foray {
    params: Params,
    store: TagStore,
    ambig: Ambiguity,
    graphs: BTreeMap<NominalKhz, GapGraph>,
    finders: BTreeMap<(Port, NominalKhz), FinderSlot>,
    timeline: EventTimeline,
    port_freq: BTreeMap<Port, FreqSetting>,
    nominals: BTreeSet<NominalKhz>,
    clock: ClockRepair,
    batch: BatchId,
    next_seq: u64,
    line_no: u64,
    ts_begin: Option<Timestamp>,
    ts_last: Timestamp,
    pulse_counts: BTreeMap<Port, u64>,
    prev_hour_bin: i64,
    last_gps_ts: Timestamp,
    source_pos: u64,
    warnings: WarningGate,
}

impl Foray {
    /// Creates a conductor over the registered tags and their activation
    /// timeline. `now` is the wall clock used to reject far-future
    /// timestamps and is passed in for determinism.
    #[must_use]
    pub fn new(store: TagStore, timeline: EventTimeline, params: Params, now: Timestamp) -> Self {
        let nominals = store.nominal_freqs();
        let graphs = nominals
            .iter()
            .map(|&k| (k, GapGraph::new()))
            .collect::<BTreeMap<_, _>>();
        let clock = ClockRepair::new(params.clock_repair_tol, now);
        Self {
            params,
            store,
            ambig: Ambiguity::new(-1),
            graphs,
            finders: BTreeMap::new(),
            timeline,
            port_freq: BTreeMap::new(),
            nominals,
            clock,
            batch: BatchId(0),
            next_seq: 0,
            line_no: 0,
            ts_begin: None,
            ts_last: 0.0,
            pulse_counts: BTreeMap::new(),
            prev_hour_bin: 0,
            last_gps_ts: 0.0,
            source_pos: 0,
            warnings: WarningGate::default(),
        }
    }

    /// Seeds the proxy-ID allocator, normally from the output database so
    /// realized group IDs continue downward across sessions.
    pub fn set_next_proxy_id(&mut self, next_id: i64) {
        self.ambig.set_next_id(next_id);
    }

    /// Reinstates an ambiguity group persisted by an earlier session under
    /// its realized (negative) ID, so the same tag set detected again
    /// reports the same proxy.
    pub fn install_ambiguity(
        &mut self,
        proxy_id: MotusId,
        members: &[MotusId],
    ) -> Result<(), ForayError> {
        let mut keys = Vec::with_capacity(members.len());
        for &id in members {
            keys.push(self.store.key_of(id).ok_or(ForayError::UnknownTag(id))?);
        }
        self.ambig
            .install_group(keys, proxy_id, &mut self.store)?;
        Ok(())
    }

    /// Records the batch subsequent output rows belong to.
    pub fn set_batch(&mut self, batch: BatchId) {
        self.batch = batch;
    }

    /// The batch currently in progress.
    #[must_use]
    pub fn batch(&self) -> BatchId {
        self.batch
    }

    /// Registered tags (and proxies).
    #[must_use]
    pub fn store(&self) -> &TagStore {
        &self.store
    }

    /// Ambiguity manager state.
    #[must_use]
    pub fn ambiguity(&self) -> &Ambiguity {
        &self.ambig
    }

    /// The gap graph for a nominal frequency, if any tag transmits there.
    #[must_use]
    pub fn graph(&self, nominal: NominalKhz) -> Option<&GapGraph> {
        self.graphs.get(&nominal)
    }

    /// Byte position of the input source after the last processed line;
    /// saved with the state blob so resume can seek past consumed input.
    #[must_use]
    pub fn source_position(&self) -> u64 {
        self.source_pos
    }

    /// Reads the source to exhaustion, repairing clocks and routing every
    /// record. Returns when input is drained; call [`Self::pause`] to close
    /// the batch.
    pub fn run(
        &mut self,
        source: &mut dyn RecordSource,
        filer: &mut dyn Filer,
    ) -> Result<(), ForayError> {
        loop {
            let line = source.next_line()?;
            let eof = line.is_none();
            if let Some(line) = line {
                self.line_no += 1;
                if line.trim().is_empty() {
                    continue;
                }
                match RawRecord::parse(&line) {
                    Ok(rec) => match self.clock.put(rec, filer)? {
                        Disposition::Accepted | Disposition::DroppedStuckGps => {}
                        Disposition::DroppedFuture => {
                            if self.warnings.fire("future-timestamp") {
                                warn!(line = self.line_no, "dropping record with far-future timestamp");
                            }
                        }
                    },
                    Err(err) => {
                        if self.warnings.fire("malformed-line") {
                            warn!(line = self.line_no, %err, "dropping malformed input line");
                        }
                    }
                }
            } else {
                self.clock.finish(filer)?;
            }
            while let Some(rec) = self.clock.next() {
                self.process_record(rec, filer)?;
            }
            self.source_pos = source.position();
            if eof {
                return Ok(());
            }
        }
    }

    /// Routes one repaired record.
    pub fn process_record(
        &mut self,
        rec: RawRecord,
        filer: &mut dyn Filer,
    ) -> Result<(), ForayError> {
        let ts = rec.ts();
        if self.ts_begin.is_none_or(|t| ts < t) {
            self.ts_begin = Some(ts);
        }
        self.ts_last = self.ts_last.max(ts);
        match rec {
            RawRecord::Gps { ts, lat, lon, alt } => {
                if ts - self.last_gps_ts >= self.params.min_gps_dt {
                    self.last_gps_ts = ts;
                    filer.add_gps_fix(ts, lat, lon, alt)?;
                }
            }
            RawRecord::Param {
                ts,
                port,
                flag,
                value,
                rc,
                ..
            } => {
                if flag != "-m" {
                    return Ok(());
                }
                if rc != 0 {
                    if self.warnings.fire("failed-freq-setting") {
                        warn!(%port, value, rc, "ignoring failed frequency setting");
                    }
                    return Ok(());
                }
                // force-default is an absolute override: settings are
                // acknowledged but never change the listening frequency
                if !self.params.force_default_freq {
                    self.port_freq
                        .insert(port, FreqSetting::new(value, ts, &self.nominals));
                }
            }
            RawRecord::Pulse {
                port,
                ts,
                dfreq,
                sig,
                noise,
            } => {
                self.process_pulse(port, ts, dfreq, sig, noise, filer)?;
            }
            RawRecord::Clock { .. } | RawRecord::FileTs { .. } => {}
        }
        Ok(())
    }

    fn process_pulse(
        &mut self,
        port: Port,
        ts: Timestamp,
        dfreq: f64,
        sig: f64,
        noise: f64,
        filer: &mut dyn Filer,
    ) -> Result<(), ForayError> {
        // hourly pulse totals per antenna
        let hour_bin = (ts / 3600.0).round() as i64;
        if hour_bin != self.prev_hour_bin {
            if self.prev_hour_bin != 0 {
                self.flush_pulse_counts(filer)?;
            }
            self.prev_hour_bin = hour_bin;
        }
        *self.pulse_counts.entry(port).or_insert(0) += 1;

        if dfreq < self.params.min_dfreq_khz || dfreq > self.params.max_dfreq_khz {
            return Ok(());
        }

        let setting = *self
            .port_freq
            .entry(port)
            .or_insert_with(|| FreqSetting::new(self.params.default_freq_mhz, ts, &self.nominals));
        let nominal = setting.nominal;

        let pulse = Pulse {
            ts,
            dfreq,
            sig,
            noise,
            ant_freq: setting.mhz,
            seq_no: SeqNo(self.next_seq),
        };
        self.next_seq += 1;

        // bring the graphs up to date with every event at or before this
        // pulse
        while self.timeline.next_ts() <= pulse.ts {
            self.apply_next_event(filer)?;
        }

        let key = (port, nominal);
        if !self.finders.contains_key(&key) {
            self.finders
                .insert(key, FinderSlot::build(nominal, port, &self.params));
            info!(%port, khz = nominal.0, "started finder");
        }
        let Some(finder) = self.finders.get_mut(&key) else {
            return Ok(());
        };
        let Some(graph) = self.graphs.get_mut(&nominal) else {
            // no registered tag transmits in this bucket; nothing to match
            return Ok(());
        };
        let mut cx = FinderCx {
            graph,
            store: &mut self.store,
            ambig: &self.ambig,
            filer,
            params: &self.params,
            batch: self.batch,
        };
        finder.process(&pulse, &mut cx)
    }

    /// Applies the next timeline event, mutating the graph for the tag's
    /// frequency and repointing in-flight candidates if ambiguity changed.
    fn apply_next_event(&mut self, filer: &mut dyn Filer) -> Result<(), ForayError> {
        let Some(ev) = self.timeline.pop() else {
            return Ok(());
        };
        let nominal = self.store.tag(ev.tag).nominal();
        let Some(graph) = self.graphs.get_mut(&nominal) else {
            debug_assert!(false, "event for a frequency with no graph");
            return Ok(());
        };
        let rename = match ev.kind {
            TagEvent::Activate => {
                if self.store.tag(ev.tag).active {
                    return Ok(());
                }
                self.store.tag_mut(ev.tag).active = true;
                graph.add_tag(ev.tag, &mut self.store, &mut self.ambig, &self.params)?
            }
            TagEvent::Deactivate => {
                if !self.store.tag(ev.tag).active {
                    return Ok(());
                }
                let pair = graph.del_tag(ev.tag, &mut self.store, &mut self.ambig)?;
                self.store.tag_mut(ev.tag).active = false;
                pair
            }
        };
        if let Some((from, to)) = rename {
            for ((_, nom), finder) in &mut self.finders {
                if *nom == nominal {
                    finder.rename_tag(from, to, filer)?;
                }
            }
        }
        Ok(())
    }

    /// Drains the whole timeline, activating and deactivating tags without
    /// processing any pulses. Used by the tag-database validation mode.
    pub fn apply_all_events(&mut self, filer: &mut dyn Filer) -> Result<(), ForayError> {
        while self.timeline.remaining() > 0 {
            self.apply_next_event(filer)?;
        }
        Ok(())
    }

    /// Current ambiguity groups as database IDs: `(proxy, members)`.
    /// Non-empty output from the validation mode means the active tag set
    /// is not distinguishable at the chosen tolerances.
    #[must_use]
    pub fn ambiguity_groups(&self) -> Vec<(MotusId, Vec<MotusId>)> {
        let mut out: Vec<(MotusId, Vec<MotusId>)> = self
            .store
            .iter()
            .filter(|(_, t)| t.is_proxy())
            .filter_map(|(k, t)| {
                self.ambig.members_of(k).map(|members| {
                    (
                        t.motus_id,
                        members.iter().map(|&m| self.store.tag(m).motus_id).collect(),
                    )
                })
            })
            .collect();
        out.sort();
        out
    }

    fn flush_pulse_counts(&mut self, filer: &mut dyn Filer) -> Result<(), ForayError> {
        let counts = core::mem::take(&mut self.pulse_counts);
        for (port, count) in counts {
            if count > 0 {
                filer.add_pulse_count(self.prev_hour_bin, port, count)?;
            }
        }
        Ok(())
    }

    /// Expires candidates on every finder as of `now`, closing their runs.
    pub fn reap_all(&mut self, now: Timestamp, filer: &mut dyn Filer) -> Result<(), ForayError> {
        let keys: Vec<(Port, NominalKhz)> = self.finders.keys().copied().collect();
        for key in keys {
            let Some(finder) = self.finders.get_mut(&key) else {
                continue;
            };
            let Some(graph) = self.graphs.get_mut(&key.1) else {
                continue;
            };
            let mut cx = FinderCx {
                graph,
                store: &mut self.store,
                ambig: &self.ambig,
                filer,
                params: &self.params,
                batch: self.batch,
            };
            finder.reap(now, &mut cx)?;
        }
        Ok(())
    }

    /// Closes the batch: reaps expired candidates, flushes pulse totals and
    /// records the batch's time span.
    pub fn finish_batch(&mut self, filer: &mut dyn Filer) -> Result<(), ForayError> {
        self.reap_all(self.ts_last, filer)?;
        if self.prev_hour_bin != 0 {
            self.flush_pulse_counts(filer)?;
        }
        filer.end_batch(self.batch, self.ts_begin.unwrap_or(self.ts_last), self.ts_last)?;
        Ok(())
    }

    /// Serializes the whole conductor as the resume blob and hands it to
    /// the filer together with the input cutoff. Candidates survive with
    /// their runs open so a run can span batches.
    pub fn pause(&mut self, now: Timestamp, filer: &mut dyn Filer) -> Result<(), ForayError> {
        let mut blob = Vec::new();
        ciborium::ser::into_writer(&(STATE_FORMAT_VERSION, &*self), &mut blob)
            .map_err(|e| ForayError::StateDecode(e.to_string()))?;
        filer.save_state(self.ts_last, now, &blob)?;
        Ok(())
    }

    /// Restores a conductor from a resume blob. The caller seeks the input
    /// source to [`Self::source_position`] and allocates a fresh batch.
    pub fn resume(blob: &[u8]) -> Result<Self, ForayError> {
        let (version, mut foray): (u32, Self) = ciborium::de::from_reader(blob)
            .map_err(|e| ForayError::StateDecode(e.to_string()))?;
        if version != STATE_FORMAT_VERSION {
            return Err(ForayError::StateVersion {
                found: version,
                expected: STATE_FORMAT_VERSION,
            });
        }
        for graph in foray.graphs.values_mut() {
            graph.rebuild_index();
        }
        Ok(foray)
    }
}
