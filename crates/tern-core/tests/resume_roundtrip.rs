// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Pause/resume: a foray frozen between bursts must finish exactly like one
//! that never stopped.

mod common;

use common::{feed_offsets, foray_with, reap_far_future, scenario_params, tag_a, NOW, T0};
use tern_core::{Filer, Foray, STATE_FORMAT_VERSION};

const BURST_1: [f64; 4] = [0.000, 0.020, 0.045, 0.075];
const BURST_2: [f64; 4] = [5.075, 5.095, 5.120, 5.150];

#[test]
fn resumed_foray_produces_identical_output() {
    // the uninterrupted reference
    let (mut ref_foray, mut ref_filer) = foray_with(vec![tag_a()], scenario_params());
    feed_offsets(&mut ref_foray, &mut ref_filer, &BURST_1);
    feed_offsets(&mut ref_foray, &mut ref_filer, &BURST_2);
    reap_far_future(&mut ref_foray, &mut ref_filer);

    // the interrupted one: pause between bursts, resume into the same filer
    let (mut foray, mut filer) = foray_with(vec![tag_a()], scenario_params());
    feed_offsets(&mut foray, &mut filer, &BURST_1);
    foray.pause(NOW, &mut filer).expect("pause");
    drop(foray);

    let (_, blob) = filer.load_state().expect("load").expect("state saved");
    let mut resumed = Foray::resume(&blob).expect("resume");
    feed_offsets(&mut resumed, &mut filer, &BURST_2);
    reap_far_future(&mut resumed, &mut filer);

    assert_eq!(ref_filer.hits, filer.hits);
    assert_eq!(ref_filer.runs, filer.runs);
    assert_eq!(ref_filer.ambiguities, filer.ambiguities);
}

#[test]
fn resume_refuses_a_foreign_version() {
    let (mut foray, mut filer) = foray_with(vec![tag_a()], scenario_params());
    feed_offsets(&mut foray, &mut filer, &BURST_1);
    foray.pause(NOW, &mut filer).unwrap();
    let (_, blob) = filer.load_state().unwrap().unwrap();

    // re-encode under a bumped version tag
    let (_, state): (u32, ciborium::value::Value) =
        ciborium::de::from_reader(blob.as_slice()).unwrap();
    let mut tampered = Vec::new();
    ciborium::ser::into_writer(&(STATE_FORMAT_VERSION + 1, state), &mut tampered).unwrap();

    let err = Foray::resume(&tampered).expect_err("foreign version must be refused");
    let msg = err.to_string();
    assert!(msg.contains("format version"), "unexpected error: {msg}");
}

#[test]
fn paused_state_round_trips_through_serialization() {
    let (mut foray, mut filer) = foray_with(vec![tag_a(), common::tag_b_identical()], scenario_params());
    feed_offsets(&mut foray, &mut filer, &BURST_1);
    foray.pause(NOW, &mut filer).unwrap();
    let (ts_data, blob) = filer.load_state().unwrap().unwrap();
    assert!((ts_data - (T0 + 0.075)).abs() < 1e-9);

    let resumed = Foray::resume(&blob).expect("resume");
    // the proxy survives the round trip with its members and allocator
    assert_eq!(resumed.ambiguity_groups(), foray.ambiguity_groups());
    assert_eq!(resumed.source_position(), foray.source_position());
}
