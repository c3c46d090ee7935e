// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Loads the registered-tag database: a SQLite file with `tags` (and
//! optionally `events`) tables, or a CSV with the same columns.
//!
//! Gap columns are stored in milliseconds and the burst interval in
//! seconds; both are snapped to quarter-millisecond precision, matching the
//! registration pipeline that produced them. The burst interval is
//! start-to-start, so the stored tail gap is `bi − (g1 + g2 + g3)`.

use std::path::Path;

use anyhow::{bail, Context};
use rusqlite::{Connection, OpenFlags};
use serde::Deserialize;
use tern_core::{EventTimeline, MotusId, Tag, TagEvent, TagStore};

/// A loaded tag registry plus its activation timeline.
pub struct LoadedTagDb {
    /// All registered tags.
    pub store: TagStore,
    /// Activation events, already sorted.
    pub timeline: EventTimeline,
}

/// Quarter-millisecond snap used for registered gap values.
fn quarter_ms(seconds: f64) -> f64 {
    (4000.0 * seconds).round() / 4000.0
}

fn build_tag(motus_id: i64, freq_mhz: f64, dfreq: f64, g_ms: [f64; 3], bi_s: f64) -> Tag {
    let g = [
        quarter_ms(g_ms[0] / 1000.0),
        quarter_ms(g_ms[1] / 1000.0),
        quarter_ms(g_ms[2] / 1000.0),
    ];
    let bi = quarter_ms(bi_s);
    let tail = bi - (g[0] + g[1] + g[2]);
    Tag::new(MotusId(motus_id), freq_mhz, dfreq, [g[0], g[1], g[2], tail])
}

/// Loads a tag database by file extension (`.sqlite`/`.motus` or `.csv`).
pub fn load(path: &Path, use_events: bool) -> anyhow::Result<LoadedTagDb> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    match ext.as_str() {
        "sqlite" | "motus" => load_sqlite(path, use_events),
        "csv" => {
            if use_events {
                bail!("events are only available from a SQLite tag database");
            }
            load_csv(path)
        }
        other => bail!("unrecognized tag database extension {other:?}; expected .sqlite or .csv"),
    }
}

fn load_sqlite(path: &Path, use_events: bool) -> anyhow::Result<LoadedTagDb> {
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .with_context(|| format!("opening tag database {}", path.display()))?;

    // the offset-frequency hint is optional; fall back when absent
    let with_dfreq =
        "SELECT motusID, tagFreq, dfreq, g1, g2, g3, bi FROM tags ORDER BY tagFreq, motusID";
    let without_dfreq =
        "SELECT motusID, tagFreq, 0.0, g1, g2, g3, bi FROM tags ORDER BY tagFreq, motusID";
    let mut st = match conn.prepare(with_dfreq) {
        Ok(st) => st,
        Err(_) => conn.prepare(without_dfreq).context(
            "tag database lacks required columns: motusID, tagFreq, g1, g2, g3, bi",
        )?,
    };

    let mut store = TagStore::new();
    let rows = st.query_map([], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, f64>(1)?,
            row.get::<_, f64>(2)?,
            row.get::<_, f64>(3)?,
            row.get::<_, f64>(4)?,
            row.get::<_, f64>(5)?,
            row.get::<_, f64>(6)?,
        ))
    })?;
    for row in rows {
        let (id, freq, dfreq, g1, g2, g3, bi) = row?;
        store
            .add(build_tag(id, freq, dfreq, [g1, g2, g3], bi))
            .with_context(|| format!("registering tag {id}"))?;
    }
    drop(st);
    if store.is_empty() {
        bail!("no tags in database {}", path.display());
    }

    let mut timeline = EventTimeline::new();
    if use_events {
        let mut st = conn
            .prepare("SELECT ts, motusTagID, event FROM events ORDER BY ts")
            .context("tag database has no events table (required by --use-events)")?;
        let rows = st.query_map([], |row| {
            Ok((
                row.get::<_, f64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;
        for row in rows {
            let (ts, id, ev) = row?;
            let Some(key) = store.key_of(MotusId(id)) else {
                tracing::warn!(motus_id = id, "event for unregistered tag; skipped");
                continue;
            };
            let kind = if ev == 1 {
                TagEvent::Activate
            } else {
                TagEvent::Deactivate
            };
            timeline.push(ts, key, kind);
        }
    } else {
        for (key, _) in store.iter() {
            timeline.push(0.0, key, TagEvent::Activate);
        }
    }
    timeline.finish();
    Ok(LoadedTagDb { store, timeline })
}

#[derive(Debug, Deserialize)]
struct CsvTagRow {
    #[serde(rename = "motusID")]
    motus_id: i64,
    #[serde(rename = "tagFreq")]
    tag_freq: f64,
    #[serde(default)]
    dfreq: f64,
    g1: f64,
    g2: f64,
    g3: f64,
    bi: f64,
}

fn load_csv(path: &Path) -> anyhow::Result<LoadedTagDb> {
    let mut rdr = csv::Reader::from_path(path)
        .with_context(|| format!("opening tag database {}", path.display()))?;
    let mut store = TagStore::new();
    let mut timeline = EventTimeline::new();
    for rec in rdr.deserialize::<CsvTagRow>() {
        let row = rec.context("tag CSV lacks required columns: motusID, tagFreq, g1, g2, g3, bi")?;
        let key = store
            .add(build_tag(
                row.motus_id,
                row.tag_freq,
                row.dfreq,
                [row.g1, row.g2, row.g3],
                row.bi,
            ))
            .with_context(|| format!("registering tag {}", row.motus_id))?;
        timeline.push(0.0, key, TagEvent::Activate);
    }
    if store.is_empty() {
        bail!("no tags in database {}", path.display());
    }
    timeline.finish();
    Ok(LoadedTagDb { store, timeline })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn csv_round_trip_computes_the_tail_gap() {
        let mut tmp = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        writeln!(tmp, "motusID,tagFreq,dfreq,g1,g2,g3,bi").unwrap();
        writeln!(tmp, "501,166.380,4.0,20,25,30,5.075").unwrap();
        tmp.flush().unwrap();

        let db = load(tmp.path(), false).unwrap();
        assert_eq!(db.store.len(), 1);
        let (_, tag) = db.store.iter().next().unwrap();
        assert_eq!(tag.motus_id, MotusId(501));
        assert!((tag.gaps[0] - 0.020).abs() < 1e-9);
        assert!((tag.gaps[3] - 5.000).abs() < 1e-9);
        assert!((tag.period - 5.075).abs() < 1e-9);
    }

    #[test]
    fn sqlite_tags_and_events_load() {
        let tmp = tempfile::Builder::new().suffix(".sqlite").tempfile().unwrap();
        let conn = Connection::open(tmp.path()).unwrap();
        conn.execute_batch(
            "CREATE TABLE tags (motusID INTEGER, tagFreq REAL, dfreq REAL,
                                g1 REAL, g2 REAL, g3 REAL, bi REAL);
             INSERT INTO tags VALUES (501, 166.380, 4.0, 20, 25, 30, 5.075);
             INSERT INTO tags VALUES (502, 166.380, 0.0, 40, 20, 60, 6.3);
             CREATE TABLE events (ts REAL, motusTagID INTEGER, event INTEGER);
             INSERT INTO events VALUES (1000.0, 501, 1);
             INSERT INTO events VALUES (2000.0, 501, 0);",
        )
        .unwrap();
        drop(conn);

        let db = load(tmp.path(), true).unwrap();
        assert_eq!(db.store.len(), 2);
        assert_eq!(db.timeline.remaining(), 2);

        let db = load(tmp.path(), false).unwrap();
        // without events every registered tag activates at the epoch
        assert_eq!(db.timeline.remaining(), 2);
    }

    #[test]
    fn empty_database_is_a_configuration_error() {
        let tmp = tempfile::Builder::new().suffix(".sqlite").tempfile().unwrap();
        let conn = Connection::open(tmp.path()).unwrap();
        conn.execute_batch(
            "CREATE TABLE tags (motusID INTEGER, tagFreq REAL, dfreq REAL,
                                g1 REAL, g2 REAL, g3 REAL, bi REAL);",
        )
        .unwrap();
        drop(conn);
        assert!(load(tmp.path(), false).is_err());
    }
}
