// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! SQLite-backed output filer: append-only detection tables in the receiver
//! database.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use tern_core::{BatchId, Filer, FilerError, Hit, MotusId, Port, RunId, TimeFixKind, Timestamp};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS batches (
    batchID     INTEGER PRIMARY KEY,
    bootSession INTEGER,
    tsStart     REAL,
    tsEnd       REAL,
    numHits     INTEGER DEFAULT 0
);
CREATE TABLE IF NOT EXISTS runs (
    runID        INTEGER PRIMARY KEY,
    batchIDbegin INTEGER NOT NULL,
    motusTagID   INTEGER NOT NULL,
    ant          INTEGER NOT NULL,
    tsBegin      REAL,
    tsEnd        REAL,
    len          INTEGER
);
CREATE TABLE IF NOT EXISTS hits (
    hitID     INTEGER PRIMARY KEY AUTOINCREMENT,
    runID     INTEGER NOT NULL,
    ts        REAL NOT NULL,
    sig       REAL,
    sigSD     REAL,
    noise     REAL,
    freq      REAL,
    freqSD    REAL,
    slop      REAL,
    burstSlop REAL
);
CREATE TABLE IF NOT EXISTS tagAmbig (
    ambigID     INTEGER PRIMARY KEY,
    motusTagID1 INTEGER NOT NULL,
    motusTagID2 INTEGER,
    motusTagID3 INTEGER,
    motusTagID4 INTEGER,
    motusTagID5 INTEGER,
    motusTagID6 INTEGER
);
CREATE TABLE IF NOT EXISTS timeFixes (
    tsLow   REAL,
    tsHigh  REAL,
    fixedBy REAL,
    error   REAL,
    comment TEXT
);
CREATE TABLE IF NOT EXISTS gpsFixes (
    ts  REAL,
    lat REAL,
    lon REAL,
    alt REAL
);
CREATE TABLE IF NOT EXISTS pulseCounts (
    hourBin INTEGER,
    ant     INTEGER,
    count   INTEGER
);
CREATE TABLE IF NOT EXISTS noiseWindows (
    ts      REAL,
    ant     INTEGER,
    antFreq REAL,
    sig     REAL,
    noise   REAL
);
CREATE TABLE IF NOT EXISTS batchParams (
    batchID   INTEGER,
    paramName TEXT,
    paramVal  REAL
);
CREATE TABLE IF NOT EXISTS batchProgs (
    batchID     INTEGER,
    progName    TEXT,
    progVersion TEXT
);
CREATE TABLE IF NOT EXISTS batchState (
    batchID INTEGER PRIMARY KEY,
    tsData  REAL,
    tsRun   REAL,
    state   BLOB,
    version INTEGER
);
";

/// Inserts are grouped into transactions of this many statements.
const STEPS_PER_TX: u32 = 50_000;

/// Filer writing to the output SQLite database.
pub struct SqliteFiler {
    conn: Connection,
    batch: Option<BatchId>,
    num_hits: i64,
    steps: u32,
    in_tx: bool,
}

fn db_err(e: impl std::fmt::Display) -> FilerError {
    FilerError(e.to_string())
}

impl SqliteFiler {
    /// Opens (creating as needed) the output database and ensures the
    /// detection tables exist.
    pub fn open(path: &Path, prog_name: &str, prog_version: &str) -> Result<Self, FilerError> {
        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        let filer = Self {
            conn,
            batch: None,
            num_hits: 0,
            steps: 0,
            in_tx: false,
        };
        filer
            .conn
            .execute(
                "INSERT INTO batchProgs (batchID, progName, progVersion)
                 VALUES ((SELECT COALESCE(MAX(batchID), 0) + 1 FROM batches), ?1, ?2)",
                params![prog_name, prog_version],
            )
            .map_err(db_err)?;
        Ok(filer)
    }

    /// Realized ambiguity groups already persisted: `(ambigID, members)`.
    pub fn load_ambiguities(&self) -> Result<Vec<(i64, Vec<i64>)>, FilerError> {
        let mut st = self
            .conn
            .prepare(
                "SELECT ambigID, motusTagID1, motusTagID2, motusTagID3,
                        motusTagID4, motusTagID5, motusTagID6
                 FROM tagAmbig ORDER BY ambigID DESC",
            )
            .map_err(db_err)?;
        let rows = st
            .query_map([], |row| {
                let id: i64 = row.get(0)?;
                let mut members = Vec::new();
                for col in 1..=6 {
                    if let Some(m) = row.get::<_, Option<i64>>(col)? {
                        members.push(m);
                    }
                }
                Ok((id, members))
            })
            .map_err(db_err)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(db_err)?);
        }
        Ok(out)
    }

    fn step(&mut self) -> Result<(), FilerError> {
        if !self.in_tx {
            self.conn.execute_batch("BEGIN").map_err(db_err)?;
            self.in_tx = true;
        }
        self.steps += 1;
        if self.steps >= STEPS_PER_TX {
            self.commit()?;
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<(), FilerError> {
        if self.in_tx {
            self.conn.execute_batch("COMMIT").map_err(db_err)?;
            self.in_tx = false;
            self.steps = 0;
        }
        Ok(())
    }
}

impl Drop for SqliteFiler {
    fn drop(&mut self) {
        let _ = self.commit();
    }
}

impl Filer for SqliteFiler {
    fn begin_batch(&mut self, boot_num: i64) -> Result<BatchId, FilerError> {
        self.commit()?;
        self.conn
            .execute(
                "INSERT INTO batches (bootSession) VALUES (?1)",
                params![boot_num],
            )
            .map_err(db_err)?;
        let id = BatchId(self.conn.last_insert_rowid());
        self.batch = Some(id);
        self.num_hits = 0;
        Ok(id)
    }

    fn end_batch(
        &mut self,
        batch: BatchId,
        ts_start: Timestamp,
        ts_end: Timestamp,
    ) -> Result<(), FilerError> {
        self.conn
            .execute(
                "UPDATE batches SET tsStart = ?2, tsEnd = ?3, numHits = ?4 WHERE batchID = ?1",
                params![batch.0, ts_start, ts_end, self.num_hits],
            )
            .map_err(db_err)?;
        self.commit()
    }

    fn begin_run(
        &mut self,
        batch: BatchId,
        motus_id: MotusId,
        ant: Port,
        ts_begin: Timestamp,
    ) -> Result<RunId, FilerError> {
        self.step()?;
        self.conn
            .execute(
                "INSERT INTO runs (batchIDbegin, motusTagID, ant, tsBegin) VALUES (?1, ?2, ?3, ?4)",
                params![batch.0, motus_id.0, ant.0, ts_begin],
            )
            .map_err(db_err)?;
        Ok(RunId(self.conn.last_insert_rowid()))
    }

    fn end_run(&mut self, run: RunId, length: u32, ts_end: Timestamp) -> Result<(), FilerError> {
        self.step()?;
        self.conn
            .execute(
                "UPDATE runs SET len = ?2, tsEnd = ?3 WHERE runID = ?1",
                params![run.0, length, ts_end],
            )
            .map_err(db_err)?;
        Ok(())
    }

    fn add_hit(&mut self, run: RunId, hit: &Hit) -> Result<(), FilerError> {
        self.step()?;
        self.conn
            .execute(
                "INSERT INTO hits (runID, ts, sig, sigSD, noise, freq, freqSD, slop, burstSlop)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    run.0,
                    hit.ts,
                    hit.sig,
                    hit.sig_sd,
                    hit.noise,
                    hit.freq,
                    hit.freq_sd,
                    hit.slop,
                    hit.burst_slop
                ],
            )
            .map_err(db_err)?;
        self.num_hits += 1;
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
        self.step()?;
        self.conn
            .execute(
                "INSERT INTO noiseWindows (ts, ant, antFreq, sig, noise)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![ts, ant.0, ant_freq, sig, noise],
            )
            .map_err(db_err)?;
        Ok(())
    }

    fn add_gps_fix(
        &mut self,
        ts: Timestamp,
        lat: f64,
        lon: f64,
        alt: f64,
    ) -> Result<(), FilerError> {
        self.step()?;
        self.conn
            .execute(
                "INSERT INTO gpsFixes (ts, lat, lon, alt) VALUES (?1, ?2, ?3, ?4)",
                params![ts, lat, lon, alt],
            )
            .map_err(db_err)?;
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
        self.step()?;
        let comment = match kind {
            TimeFixKind::Pinned => "pinned",
            TimeFixKind::Forced => "forced",
        };
        self.conn
            .execute(
                "INSERT INTO timeFixes (tsLow, tsHigh, fixedBy, error, comment)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![ts_low, ts_high, offset, error, comment],
            )
            .map_err(db_err)?;
        Ok(())
    }

    fn add_pulse_count(&mut self, hour_bin: i64, ant: Port, count: u64) -> Result<(), FilerError> {
        self.step()?;
        self.conn
            .execute(
                "INSERT INTO pulseCounts (hourBin, ant, count) VALUES (?1, ?2, ?3)",
                params![hour_bin, ant.0, count as i64],
            )
            .map_err(db_err)?;
        Ok(())
    }

    fn add_param(&mut self, name: &str, value: f64) -> Result<(), FilerError> {
        self.step()?;
        let batch = self.batch.map_or(0, |b| b.0);
        self.conn
            .execute(
                "INSERT INTO batchParams (batchID, paramName, paramVal) VALUES (?1, ?2, ?3)",
                params![batch, name, value],
            )
            .map_err(db_err)?;
        Ok(())
    }

    fn save_ambiguity(&mut self, proxy_id: MotusId, members: &[MotusId]) -> Result<(), FilerError> {
        self.step()?;
        let mut cols: [Option<i64>; 6] = [None; 6];
        for (slot, m) in cols.iter_mut().zip(members.iter()) {
            *slot = Some(m.0);
        }
        self.conn
            .execute(
                "INSERT INTO tagAmbig (ambigID, motusTagID1, motusTagID2, motusTagID3,
                                       motusTagID4, motusTagID5, motusTagID6)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![proxy_id.0, cols[0], cols[1], cols[2], cols[3], cols[4], cols[5]],
            )
            .map_err(db_err)?;
        Ok(())
    }

    fn next_proxy_id(&mut self) -> Result<i64, FilerError> {
        let lowest: Option<i64> = self
            .conn
            .query_row("SELECT MIN(ambigID) FROM tagAmbig", [], |r| r.get(0))
            .optional()
            .map_err(db_err)?
            .flatten();
        Ok(lowest.map_or(-1, |low| low - 1))
    }

    fn save_state(
        &mut self,
        ts_data: Timestamp,
        ts_run: Timestamp,
        blob: &[u8],
    ) -> Result<(), FilerError> {
        let batch = self.batch.map_or(0, |b| b.0);
        self.conn
            .execute("DELETE FROM batchState", [])
            .map_err(db_err)?;
        self.conn
            .execute(
                "INSERT INTO batchState (batchID, tsData, tsRun, state, version)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![batch, ts_data, ts_run, blob, 1],
            )
            .map_err(db_err)?;
        self.commit()
    }

    fn load_state(&mut self) -> Result<Option<(Timestamp, Vec<u8>)>, FilerError> {
        self.conn
            .query_row(
                "SELECT tsData, state FROM batchState ORDER BY batchID DESC LIMIT 1",
                [],
                |row| Ok((row.get::<_, f64>(0)?, row.get::<_, Vec<u8>>(1)?)),
            )
            .optional()
            .map_err(db_err)
    }
}
