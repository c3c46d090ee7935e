// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Output boundary: the engine reports batches, runs, hits and housekeeping
//! rows through this trait and never touches storage directly.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ident::{BatchId, MotusId, Port, RunId, Timestamp};

/// Storage-side failure, surfaced with context; the pipeline has no internal
/// retry loop.
#[derive(Debug, Error)]
#[error("output filer: {0}")]
pub struct FilerError(pub String);

/// One emitted burst.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Hit {
    /// Timestamp of the first pulse of the burst.
    pub ts: Timestamp,
    /// Mean signal strength (linear-power average), dB.
    pub sig: f64,
    /// Relative standard deviation of signal, percent of mean.
    pub sig_sd: f64,
    /// Mean noise (linear-power average), dB.
    pub noise: f64,
    /// Mean offset frequency, kHz.
    pub freq: f64,
    /// Standard deviation of offset frequency, kHz.
    pub freq_sd: f64,
    /// Sum over the burst of |observed gap − registered gap|, seconds.
    pub slop: f64,
    /// Observed inter-burst interval minus the registered one, modulo the
    /// period; 0 for the first burst of a run.
    pub burst_slop: f64,
}

/// Kind of clock correction recorded in the time-fix table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeFixKind {
    /// Offset estimated by bracketing runs of valid/invalid timestamps.
    Pinned,
    /// Offset forced from the best estimate when a valid pulse appeared.
    Forced,
}

/// Sink for everything the engine persists.
///
/// Implementations append to the output database (or, in tests, to memory).
/// Identifier allocation lives here so that runs and batches stay unique
/// across resumed sessions.
pub trait Filer {
    /// Opens a new batch for the given boot session.
    fn begin_batch(&mut self, boot_num: i64) -> Result<BatchId, FilerError>;

    /// Closes a batch, recording its time span and hit count.
    fn end_batch(
        &mut self,
        batch: BatchId,
        ts_start: Timestamp,
        ts_end: Timestamp,
    ) -> Result<(), FilerError>;

    /// Opens a run of consecutive bursts for a tag on an antenna.
    fn begin_run(
        &mut self,
        batch: BatchId,
        motus_id: MotusId,
        ant: Port,
        ts_begin: Timestamp,
    ) -> Result<RunId, FilerError>;

    /// Closes a run, recording its length in bursts.
    fn end_run(&mut self, run: RunId, length: u32, ts_end: Timestamp) -> Result<(), FilerError>;

    /// Appends one burst to a run.
    fn add_hit(&mut self, run: RunId, hit: &Hit) -> Result<(), FilerError>;

    /// Records a discarded-noise-window marker emitted by the rate limiter.
    fn add_bogus_burst(
        &mut self,
        ts: Timestamp,
        ant: Port,
        ant_freq: f64,
        sig: f64,
        noise: f64,
    ) -> Result<(), FilerError>;

    /// Records a (non-stuck) GPS fix.
    fn add_gps_fix(
        &mut self,
        ts: Timestamp,
        lat: f64,
        lon: f64,
        alt: f64,
    ) -> Result<(), FilerError>;

    /// Records a clock correction applied to an era of timestamps.
    fn add_time_fix(
        &mut self,
        ts_low: Timestamp,
        ts_high: Timestamp,
        offset: f64,
        error: f64,
        kind: TimeFixKind,
    ) -> Result<(), FilerError>;

    /// Records the pulse total for one antenna over one hour bin.
    fn add_pulse_count(&mut self, hour_bin: i64, ant: Port, count: u64) -> Result<(), FilerError>;

    /// Records one program parameter for the current batch.
    fn add_param(&mut self, name: &str, value: f64) -> Result<(), FilerError>;

    /// Persists a realized ambiguity group under its negative proxy ID.
    fn save_ambiguity(&mut self, proxy_id: MotusId, members: &[MotusId]) -> Result<(), FilerError>;

    /// The next negative proxy ID to allocate, continuing past every group
    /// already persisted.
    fn next_proxy_id(&mut self) -> Result<i64, FilerError>;

    /// Saves the resume blob together with the input cutoff it reflects.
    fn save_state(
        &mut self,
        ts_data: Timestamp,
        ts_run: Timestamp,
        blob: &[u8],
    ) -> Result<(), FilerError>;

    /// Loads the most recent resume blob, if any.
    fn load_state(&mut self) -> Result<Option<(Timestamp, Vec<u8>)>, FilerError>;
}

/// A recorded run row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRow {
    /// Run identifier.
    pub run: RunId,
    /// Batch the run began in.
    pub batch: BatchId,
    /// Tag (or proxy) the run belongs to.
    pub motus_id: MotusId,
    /// Antenna the run was heard on.
    pub ant: Port,
    /// First-pulse timestamp of the first burst.
    pub ts_begin: Timestamp,
    /// Closing timestamp, once ended.
    pub ts_end: Option<Timestamp>,
    /// Bursts recorded, once ended.
    pub length: Option<u32>,
}

/// In-memory filer for tests and dry runs: every row lands in a vector.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct MemoryFiler {
    /// Completed and open batches: `(batch, boot, ts_start, ts_end)`.
    pub batches: Vec<(BatchId, i64, Option<Timestamp>, Option<Timestamp>)>,
    /// Runs, in creation order.
    pub runs: Vec<RunRow>,
    /// Hits with their owning run.
    pub hits: Vec<(RunId, Hit)>,
    /// Rate-limiter bogus markers.
    pub bogus: Vec<(Timestamp, Port, f64, f64, f64)>,
    /// GPS fixes.
    pub gps_fixes: Vec<(Timestamp, f64, f64, f64)>,
    /// Clock corrections.
    pub time_fixes: Vec<(Timestamp, Timestamp, f64, f64, TimeFixKind)>,
    /// Hourly pulse totals.
    pub pulse_counts: Vec<(i64, Port, u64)>,
    /// Parameter rows.
    pub params: Vec<(String, f64)>,
    /// Realized ambiguity groups.
    pub ambiguities: Vec<(MotusId, Vec<MotusId>)>,
    /// Saved resume blob.
    pub state: Option<(Timestamp, Vec<u8>)>,
    next_run: i64,
    next_batch: i64,
    next_proxy: i64,
}

impl MemoryFiler {
    /// Creates an empty in-memory filer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_run: 1,
            next_batch: 1,
            next_proxy: -1,
            ..Self::default()
        }
    }

    /// Total hits recorded.
    #[must_use]
    pub fn hit_count(&self) -> usize {
        self.hits.len()
    }
}

impl Filer for MemoryFiler {
    fn begin_batch(&mut self, boot_num: i64) -> Result<BatchId, FilerError> {
        let id = BatchId(self.next_batch);
        self.next_batch += 1;
        self.batches.push((id, boot_num, None, None));
        Ok(id)
    }

    fn end_batch(
        &mut self,
        batch: BatchId,
        ts_start: Timestamp,
        ts_end: Timestamp,
    ) -> Result<(), FilerError> {
        let row = self
            .batches
            .iter_mut()
            .find(|(id, ..)| *id == batch)
            .ok_or_else(|| FilerError(format!("no such batch {batch:?}")))?;
        row.2 = Some(ts_start);
        row.3 = Some(ts_end);
        Ok(())
    }

    fn begin_run(
        &mut self,
        batch: BatchId,
        motus_id: MotusId,
        ant: Port,
        ts_begin: Timestamp,
    ) -> Result<RunId, FilerError> {
        let run = RunId(self.next_run);
        self.next_run += 1;
        self.runs.push(RunRow {
            run,
            batch,
            motus_id,
            ant,
            ts_begin,
            ts_end: None,
            length: None,
        });
        Ok(run)
    }

    fn end_run(&mut self, run: RunId, length: u32, ts_end: Timestamp) -> Result<(), FilerError> {
        let row = self
            .runs
            .iter_mut()
            .find(|r| r.run == run)
            .ok_or_else(|| FilerError(format!("no such run {run:?}")))?;
        row.length = Some(length);
        row.ts_end = Some(ts_end);
        Ok(())
    }

    fn add_hit(&mut self, run: RunId, hit: &Hit) -> Result<(), FilerError> {
        self.hits.push((run, *hit));
        Ok(())
    }

    fn add_bogus_burst(
        &mut self,
        ts: Timestamp,
        ant: Port,
        ant_freq: f64,
        sig: f64,
        noise: f64,
    ) -> Result<(), FilerError> {
        self.bogus.push((ts, ant, ant_freq, sig, noise));
        Ok(())
    }

    fn add_gps_fix(
        &mut self,
        ts: Timestamp,
        lat: f64,
        lon: f64,
        alt: f64,
    ) -> Result<(), FilerError> {
        self.gps_fixes.push((ts, lat, lon, alt));
        Ok(())
    }

    fn add_time_fix(
        &mut self,
        ts_low: Timestamp,
        ts_high: Timestamp,
        offset: f64,
        error: f64,
        kind: TimeFixKind,
    ) -> Result<(), FilerError> {
        self.time_fixes.push((ts_low, ts_high, offset, error, kind));
        Ok(())
    }

    fn add_pulse_count(&mut self, hour_bin: i64, ant: Port, count: u64) -> Result<(), FilerError> {
        self.pulse_counts.push((hour_bin, ant, count));
        Ok(())
    }

    fn add_param(&mut self, name: &str, value: f64) -> Result<(), FilerError> {
        self.params.push((name.to_owned(), value));
        Ok(())
    }

    fn save_ambiguity(&mut self, proxy_id: MotusId, members: &[MotusId]) -> Result<(), FilerError> {
        self.ambiguities.push((proxy_id, members.to_vec()));
        Ok(())
    }

    fn next_proxy_id(&mut self) -> Result<i64, FilerError> {
        Ok(self.next_proxy)
    }

    fn save_state(
        &mut self,
        ts_data: Timestamp,
        _ts_run: Timestamp,
        blob: &[u8],
    ) -> Result<(), FilerError> {
        self.state = Some((ts_data, blob.to_vec()));
        Ok(())
    }

    fn load_state(&mut self) -> Result<Option<(Timestamp, Vec<u8>)>, FilerError> {
        Ok(self.state.clone())
    }
}
