// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! `tern`: find bursts from registered coded-VHF tags in a receiver pulse
//! stream and append the detections to the receiver database.

mod input;
mod sqlite_filer;
mod tagdb;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use input::{FileLineSource, StdinSource};
use sqlite_filer::SqliteFiler;
use tern_core::{Filer, Foray, MotusId, Params, RecordSource};

const PROG_NAME: &str = "tern";
const PROG_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Find coded-VHF tag bursts in a pulse stream.
///
/// Reads receiver records (pulses, frequency settings, GPS fixes) from a
/// file or stdin, matches pulse gap signatures against the registered tag
/// database, and appends batches, runs and hits to the output database.
#[derive(Debug, Parser)]
#[command(name = PROG_NAME, version, about)]
struct Cli {
    /// Registered-tag database (.sqlite with a `tags` table, or .csv).
    tag_db: PathBuf,

    /// Output database; detection tables are created if missing.
    out_db: PathBuf,

    /// Raw input file; stdin when omitted.
    input: Option<PathBuf>,

    /// Default antenna frequency (MHz) for ports with no setting record.
    #[arg(short = 'f', long, default_value_t = 0.0)]
    default_freq: f64,

    /// Ignore frequency-setting records; every port stays on the default.
    #[arg(short = 'F', long)]
    force_default_freq: bool,

    /// Minimum pulse offset frequency, kHz; lower pulses are dropped.
    #[arg(short = 'm', long, default_value_t = f64::NEG_INFINITY)]
    min_dfreq: f64,

    /// Maximum pulse offset frequency, kHz; higher pulses are dropped.
    #[arg(short = 'M', long, default_value_t = f64::INFINITY)]
    max_dfreq: f64,

    /// Intra-burst gap tolerance, milliseconds.
    #[arg(short = 'p', long, default_value_t = 1.5)]
    pulse_slop: f64,

    /// Inter-burst gap tolerance, milliseconds.
    #[arg(short = 'b', long, default_value_t = 10.0)]
    burst_slop: f64,

    /// Extra inter-burst tolerance per skipped burst, milliseconds.
    #[arg(short = 'B', long, default_value_t = 1.0)]
    burst_slop_expansion: f64,

    /// Frequency slop, kHz: maximum offset-frequency spread within a
    /// burst sequence.
    #[arg(short = 's', long, default_value_t = 2.0)]
    frequency_slop: f64,

    /// Signal slop, dB: maximum signal spread within a burst. Negative
    /// disables the filter.
    #[arg(short = 'l', long, default_value_t = 10.0)]
    signal_slop: f64,

    /// Pulses required to confirm a tag identity.
    #[arg(short = 'c', long, default_value_t = 4)]
    pulses_to_confirm: usize,

    /// Consecutive bursts that may go missing without ending a run.
    #[arg(short = 'S', long, default_value_t = 60)]
    max_skipped_bursts: u32,

    /// Maximum sustained pulse rate, Hz; 0 disables rate limiting.
    #[arg(short = 'R', long, default_value_t = 0.0)]
    max_pulse_rate: f64,

    /// Window over which pulse rate is measured, seconds.
    #[arg(short = 'w', long, default_value_t = 60.0)]
    pulse_rate_window: f64,

    /// Minimum seconds between bogus markers for discarded windows.
    #[arg(long, default_value_t = 600.0)]
    min_bogus_spacing: f64,

    /// 1 when the receiver clock may jump ±1 s between records.
    #[arg(long, default_value_t = 0)]
    timestamp_wonkiness: u32,

    /// Drive tag activation from the `events` table in the tag database.
    #[arg(short = 'e', long)]
    use_events: bool,

    /// Boot session recorded with this batch.
    #[arg(short = 'n', long, default_value_t = 1)]
    boot_num: i64,

    /// Continue from the saved state of a paused session.
    #[arg(long)]
    resume: bool,

    /// Validate only: exit non-zero if any two active tags are
    /// indistinguishable at the chosen tolerances.
    #[arg(short = 't', long)]
    test: bool,
}

impl Cli {
    fn params(&self) -> Params {
        Params {
            default_freq_mhz: self.default_freq,
            force_default_freq: self.force_default_freq,
            min_dfreq_khz: self.min_dfreq,
            max_dfreq_khz: self.max_dfreq,
            pulse_slop: self.pulse_slop / 1000.0,
            burst_slop: self.burst_slop / 1000.0,
            burst_slop_expansion: self.burst_slop_expansion / 1000.0,
            freq_slop_khz: self.frequency_slop,
            sig_slop_db: self.signal_slop,
            pulses_to_confirm_id: self.pulses_to_confirm,
            max_skipped_bursts: self.max_skipped_bursts,
            max_pulse_rate: self.max_pulse_rate,
            pulse_rate_window: self.pulse_rate_window,
            min_bogus_spacing: self.min_bogus_spacing,
            timestamp_wonkiness: self.timestamp_wonkiness,
            use_events: self.use_events,
            boot_num: self.boot_num,
            ..Params::default()
        }
    }
}

fn wall_clock() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0.0, |d| d.as_secs_f64())
}

fn record_params(cli: &Cli, filer: &mut SqliteFiler) -> anyhow::Result<()> {
    let p = cli.params();
    for (name, value) in [
        ("default_freq", p.default_freq_mhz),
        ("force_default_freq", f64::from(u8::from(p.force_default_freq))),
        ("min_dfreq", p.min_dfreq_khz),
        ("max_dfreq", p.max_dfreq_khz),
        ("pulse_slop", p.pulse_slop),
        ("burst_slop", p.burst_slop),
        ("burst_slop_expansion", p.burst_slop_expansion),
        ("frequency_slop", p.freq_slop_khz),
        ("signal_slop", p.sig_slop_db),
        ("pulses_to_confirm", p.pulses_to_confirm_id as f64),
        ("max_skipped_bursts", f64::from(p.max_skipped_bursts)),
        ("max_pulse_rate", p.max_pulse_rate),
        ("pulse_rate_window", p.pulse_rate_window),
        ("min_bogus_spacing", p.min_bogus_spacing),
        ("timestamp_wonkiness", f64::from(p.timestamp_wonkiness)),
        ("use_events", f64::from(u8::from(p.use_events))),
        ("boot_num", p.boot_num as f64),
    ] {
        filer.add_param(name, value)?;
    }
    Ok(())
}

fn run(cli: &Cli) -> anyhow::Result<ExitCode> {
    let now = wall_clock();
    let db = tagdb::load(&cli.tag_db, cli.use_events)
        .with_context(|| format!("loading tag database {}", cli.tag_db.display()))?;
    info!(tags = db.store.len(), "tag database loaded");

    let mut filer = SqliteFiler::open(&cli.out_db, PROG_NAME, PROG_VERSION)
        .with_context(|| format!("opening output database {}", cli.out_db.display()))?;

    if cli.test {
        let mut foray = Foray::new(db.store, db.timeline, cli.params(), now);
        foray.apply_all_events(&mut filer)?;
        let groups = foray.ambiguity_groups();
        if groups.is_empty() {
            info!("ok: all active tags are distinguishable");
            return Ok(ExitCode::SUCCESS);
        }
        for (proxy, members) in &groups {
            error!(?proxy, ?members, "tags indistinguishable at these tolerances");
        }
        return Ok(ExitCode::from(255));
    }

    let mut foray = if cli.resume {
        match filer.load_state()? {
            Some((ts_data, blob)) => {
                let foray = Foray::resume(&blob).context("restoring saved state")?;
                info!(ts_data, "resuming paused session");
                foray
            }
            None => anyhow::bail!("--resume requested but no saved state in output database"),
        }
    } else {
        let mut foray = Foray::new(db.store, db.timeline, cli.params(), now);
        foray.set_next_proxy_id(filer.next_proxy_id()?);
        for (ambig_id, members) in filer.load_ambiguities()? {
            let ids: Vec<MotusId> = members.into_iter().map(MotusId).collect();
            if let Err(err) = foray.install_ambiguity(MotusId(ambig_id), &ids) {
                tracing::warn!(ambig_id, %err, "skipping unrestorable ambiguity group");
            }
        }
        foray
    };

    let batch = filer.begin_batch(cli.boot_num)?;
    foray.set_batch(batch);
    record_params(cli, &mut filer)?;

    let mut source: Box<dyn RecordSource> = match &cli.input {
        Some(path) => Box::new(
            FileLineSource::open(path)
                .with_context(|| format!("opening input {}", path.display()))?,
        ),
        None => Box::new(StdinSource::new()),
    };
    if cli.resume {
        source
            .seek(foray.source_position())
            .context("seeking input to the saved position")?;
    }

    foray.run(source.as_mut(), &mut filer)?;
    foray.finish_batch(&mut filer)?;
    foray.pause(wall_clock(), &mut filer)?;
    info!(batch = batch.0, "batch complete");
    Ok(ExitCode::SUCCESS)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    match run(&cli) {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            ExitCode::from(2)
        }
    }
}
