// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! End-to-end detection scenarios: pulses in, runs and hits out.

mod common;

use common::{
    feed_offsets, foray_with, pulse, reap_far_future, scenario_params, tag_a, tag_b_identical,
    T0,
};
use tern_core::{MotusId, Port, VecSource};

/// First burst: t = 0, 20, 45, 75 ms.
const BURST_1: [f64; 4] = [0.000, 0.020, 0.045, 0.075];
/// Second burst, one period (5.075 s) later.
const BURST_2: [f64; 4] = [5.075, 5.095, 5.120, 5.150];
/// Fourth burst: the third (at 10.150) goes unheard.
const BURST_4: [f64; 4] = [15.225, 15.245, 15.270, 15.300];

#[test]
fn single_unambiguous_tag_confirms_one_burst() {
    let (mut foray, mut filer) = foray_with(vec![tag_a()], scenario_params());
    feed_offsets(&mut foray, &mut filer, &BURST_1);
    reap_far_future(&mut foray, &mut filer);

    assert_eq!(filer.runs.len(), 1, "exactly one run: {:?}", filer.runs);
    let run = &filer.runs[0];
    assert_eq!(run.motus_id, MotusId(501));
    assert_eq!(run.ant, Port(3));
    assert_eq!(run.length, Some(1));

    assert_eq!(filer.hits.len(), 1);
    let (_, hit) = filer.hits[0];
    assert!((hit.ts - T0).abs() < 1e-9, "burst stamped at its first pulse");
    assert!(hit.slop.abs() < 1e-6, "gaps match registration exactly");
    assert_eq!(hit.burst_slop, 0.0, "no prior burst to measure against");
    assert_eq!(hit.freq_sd, 0.0);
    assert!((hit.freq - 4.0).abs() < 1e-9);
    assert!((hit.sig - -40.0).abs() < 1e-6);
}

#[test]
fn second_burst_extends_the_same_run() {
    let (mut foray, mut filer) = foray_with(vec![tag_a()], scenario_params());
    feed_offsets(&mut foray, &mut filer, &BURST_1);
    feed_offsets(&mut foray, &mut filer, &BURST_2);
    reap_far_future(&mut foray, &mut filer);

    assert_eq!(filer.runs.len(), 1);
    assert_eq!(filer.runs[0].length, Some(2));
    assert_eq!(filer.hits.len(), 2);
    let (_, second) = filer.hits[1];
    assert!((second.ts - (T0 + 5.075)).abs() < 1e-9);
    assert!(
        second.burst_slop.abs() < 1e-6,
        "consecutive burst arrives dead on period: {}",
        second.burst_slop
    );
}

#[test]
fn skipped_burst_is_bridged_by_a_skip_edge() {
    let (mut foray, mut filer) = foray_with(vec![tag_a()], scenario_params());
    feed_offsets(&mut foray, &mut filer, &BURST_1);
    feed_offsets(&mut foray, &mut filer, &BURST_2);
    feed_offsets(&mut foray, &mut filer, &BURST_4);
    reap_far_future(&mut foray, &mut filer);

    assert_eq!(filer.runs.len(), 1, "one run despite the missed burst");
    assert_eq!(filer.runs[0].length, Some(3));
    assert_eq!(filer.hits.len(), 3);
    let (_, third) = filer.hits[2];
    assert!((third.ts - (T0 + 15.225)).abs() < 1e-9);
    // the inter-burst gap was tail + period; measured modulo the period it
    // lands back on the registered tail
    assert!(
        third.burst_slop.abs() < 1e-6,
        "burst slop across a skipped burst: {}",
        third.burst_slop
    );
}

#[test]
fn indistinguishable_tags_confirm_under_a_proxy() {
    let (mut foray, mut filer) = foray_with(
        vec![tag_a(), tag_b_identical()],
        scenario_params(),
    );
    feed_offsets(&mut foray, &mut filer, &BURST_1);
    reap_far_future(&mut foray, &mut filer);

    assert_eq!(filer.runs.len(), 1);
    let run = &filer.runs[0];
    assert!(run.motus_id.is_proxy(), "run belongs to the proxy: {run:?}");

    // the realized group was persisted on first detection
    assert_eq!(filer.ambiguities.len(), 1);
    let (proxy, members) = &filer.ambiguities[0];
    assert_eq!(*proxy, run.motus_id);
    assert_eq!(members.as_slice(), &[MotusId(501), MotusId(502)]);
}

#[test]
fn noise_pulse_spawns_a_walker_but_does_not_derail_the_burst() {
    let (mut foray, mut filer) = foray_with(vec![tag_a()], scenario_params());
    feed_offsets(&mut foray, &mut filer, &[0.000, 0.010, 0.020, 0.045, 0.075]);
    reap_far_future(&mut foray, &mut filer);

    assert_eq!(filer.runs.len(), 1);
    assert_eq!(filer.hits.len(), 1);
    let (_, hit) = filer.hits[0];
    assert!((hit.ts - T0).abs() < 1e-9, "burst is still anchored at t0");
    assert!(hit.slop.abs() < 1e-6);
}

#[test]
fn off_frequency_pulse_blocks_confirmation() {
    let (mut foray, mut filer) = foray_with(vec![tag_a()], scenario_params());
    foray.process_record(pulse(T0 + 0.000, 4.0, -40.0), &mut filer).unwrap();
    foray.process_record(pulse(T0 + 0.020, 4.0, -40.0), &mut filer).unwrap();
    // 10 kHz offset: 6 kHz away from the candidate's envelope, slop is 2
    foray.process_record(pulse(T0 + 0.045, 10.0, -40.0), &mut filer).unwrap();
    foray.process_record(pulse(T0 + 0.075, 4.0, -40.0), &mut filer).unwrap();
    reap_far_future(&mut foray, &mut filer);

    assert!(filer.runs.is_empty(), "no run: {:?}", filer.runs);
    assert!(filer.hits.is_empty());
}

#[test]
fn out_of_signal_envelope_pulse_blocks_confirmation() {
    let (mut foray, mut filer) = foray_with(vec![tag_a()], scenario_params());
    foray.process_record(pulse(T0 + 0.000, 4.0, -40.0), &mut filer).unwrap();
    foray.process_record(pulse(T0 + 0.020, 4.0, -40.0), &mut filer).unwrap();
    // 25 dB below the envelope, slop is 10 dB
    foray.process_record(pulse(T0 + 0.045, 4.0, -65.0), &mut filer).unwrap();
    foray.process_record(pulse(T0 + 0.075, 4.0, -40.0), &mut filer).unwrap();
    reap_far_future(&mut foray, &mut filer);

    assert!(filer.hits.is_empty());
}

#[test]
fn full_pipeline_with_frequency_setting_records() {
    let (mut foray, mut filer) = foray_with(vec![tag_a()], scenario_params());
    let mut lines = String::new();
    // retune port 3 close to (but not exactly) the registered frequency;
    // the setting snaps to the nominal bucket
    lines.push_str(&format!("S,{:.3},3,-m,166.376,0,\n", T0 - 10.0));
    for dt in BURST_1 {
        lines.push_str(&format!("p3,{:.4},4.000,-40.00,-80.00\n", T0 + dt));
    }
    // a malformed line and a GPS fix ride along
    lines.push_str("this is not a record\n");
    lines.push_str(&format!("G,{:.3},44.34021,-66.11873,21.6\n", T0 + 1.0));

    let mut source = VecSource::new(lines);
    foray.run(&mut source, &mut filer).expect("run to completion");
    reap_far_future(&mut foray, &mut filer);

    assert_eq!(filer.hits.len(), 1);
    assert_eq!(filer.gps_fixes.len(), 1);
    assert_eq!(filer.runs[0].motus_id, MotusId(501));
}

#[test]
fn pulses_outside_dfreq_bounds_are_discarded() {
    let mut params = scenario_params();
    params.max_dfreq_khz = 8.0;
    let (mut foray, mut filer) = foray_with(vec![tag_a()], params);
    // a perfect burst, but at +9 kHz offset: every pulse is discarded
    for dt in BURST_1 {
        foray.process_record(pulse(T0 + dt, 9.0, -40.0), &mut filer).unwrap();
    }
    reap_far_future(&mut foray, &mut filer);
    assert!(filer.hits.is_empty());
    // the discarded pulses still show up in the hourly totals
    foray.finish_batch(&mut filer).unwrap();
    let total: u64 = filer.pulse_counts.iter().map(|(_, _, c)| c).sum();
    assert_eq!(total, 4);
}

#[test]
fn deactivation_event_removes_the_tag_mid_stream() {
    use tern_core::{EventTimeline, Filer, Foray, MemoryFiler, Params, TagEvent, TagStore};
    let mut store = TagStore::new();
    let key = store.add(tag_a()).unwrap();
    let mut timeline = EventTimeline::new();
    timeline.push(0.0, key, TagEvent::Activate);
    timeline.push(T0 + 2.0, key, TagEvent::Deactivate);
    timeline.finish();
    let params = Params {
        default_freq_mhz: 166.380,
        ..Params::default()
    };
    let mut foray = Foray::new(store, timeline, params, common::NOW);
    let mut filer = MemoryFiler::new();
    let batch = filer.begin_batch(1).unwrap();
    foray.set_batch(batch);

    feed_offsets(&mut foray, &mut filer, &BURST_1);
    // the deactivation applies before this burst; its pulses find no edges
    feed_offsets(&mut foray, &mut filer, &BURST_2);
    reap_far_future(&mut foray, &mut filer);

    assert_eq!(filer.hits.len(), 1, "only the pre-deactivation burst");
}
