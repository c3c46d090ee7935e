// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
#![allow(dead_code)]

use tern_core::{
    EventTimeline, Filer, Foray, MemoryFiler, MotusId, Params, Port, RawRecord, Tag, TagEvent,
    TagStore, Timestamp,
};

/// A wall-clock base in the valid era (2020-09-13), so scenario pulses skip
/// clock repair entirely.
pub const T0: Timestamp = 1_600_000_000.0;

/// "Now" handed to forays: an hour past the scenario window.
pub const NOW: Timestamp = T0 + 3600.0;

/// The workhorse test tag: gaps 20/25/30 ms, 5 s tail, 166.380 MHz.
pub fn tag_a() -> Tag {
    Tag::new(MotusId(501), 166.380, 4.0, [0.020, 0.025, 0.030, 5.000])
}

/// A tag identical to `tag_a` under any sane tolerance, different identity.
pub fn tag_b_identical() -> Tag {
    Tag::new(MotusId(502), 166.380, 4.0, [0.020, 0.025, 0.030, 5.000])
}

/// A clearly distinct tag on the same frequency.
pub fn tag_c_distinct() -> Tag {
    Tag::new(MotusId(503), 166.380, 4.0, [0.050, 0.070, 0.090, 7.300])
}

/// Scenario parameters: 1.5 ms pulse slop, 10 ms burst slop, 2 kHz
/// frequency slop, 10 dB signal slop, confirm at 4 pulses.
pub fn scenario_params() -> Params {
    Params {
        default_freq_mhz: 166.380,
        ..Params::default()
    }
}

/// Builds a foray over `tags`, all activated at the epoch, plus a filer
/// with a batch already open.
pub fn foray_with(tags: Vec<Tag>, params: Params) -> (Foray, MemoryFiler) {
    let mut store = TagStore::new();
    let mut timeline = EventTimeline::new();
    for t in tags {
        let key = store.add(t).expect("distinct test ids");
        timeline.push(0.0, key, TagEvent::Activate);
    }
    timeline.finish();
    let mut foray = Foray::new(store, timeline, params, NOW);
    let mut filer = MemoryFiler::new();
    let batch = filer.begin_batch(1).expect("begin batch");
    foray.set_batch(batch);
    (foray, filer)
}

/// One pulse record on port 3 at the default test frequency.
pub fn pulse(ts: Timestamp, dfreq: f64, sig: f64) -> RawRecord {
    RawRecord::Pulse {
        port: Port(3),
        ts,
        dfreq,
        sig,
        noise: -80.0,
    }
}

/// Feeds pulse records at the given offsets from `T0`, all with the same
/// frequency offset and signal.
pub fn feed_offsets(foray: &mut Foray, filer: &mut MemoryFiler, offsets: &[f64]) {
    for &dt in offsets {
        foray
            .process_record(pulse(T0 + dt, 4.0, -40.0), filer)
            .expect("process pulse");
    }
}

/// Closes out every candidate by reaping far in the future.
pub fn reap_far_future(foray: &mut Foray, filer: &mut MemoryFiler) {
    foray.reap_all(T0 + 1.0e6, filer).expect("reap");
}
