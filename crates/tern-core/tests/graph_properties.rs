// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Structural properties of the gap graph under tag churn.

use proptest::prelude::*;
use tern_core::{
    Ambiguity, GapGraph, MotusId, NodeIx, Params, Tag, TagStore, PULSES_PER_BURST,
};

fn params() -> Params {
    Params {
        default_freq_mhz: 166.380,
        ..Params::default()
    }
}

fn active_tag(id: i64, gaps: [f64; PULSES_PER_BURST]) -> Tag {
    let mut t = Tag::new(MotusId(id), 166.380, 4.0, gaps);
    t.active = true;
    t
}

#[test]
fn graph_starts_with_root_and_sentinel_only() {
    let g = GapGraph::new();
    assert_eq!(g.node_count(), 2);
    assert_eq!(g.set_count(), 1);
    g.validate().expect("fresh graph is consistent");
}

#[test]
fn add_del_cycles_leave_no_residue() {
    let mut g = GapGraph::new();
    let mut store = TagStore::new();
    let mut ambig = Ambiguity::new(-1);
    let p = params();
    let k1 = store.add(active_tag(1, [0.02, 0.025, 0.03, 5.0])).unwrap();
    let k2 = store.add(active_tag(2, [0.031, 0.06, 0.027, 6.1])).unwrap();

    for _ in 0..3 {
        g.add_tag(k1, &mut store, &mut ambig, &p).unwrap();
        g.add_tag(k2, &mut store, &mut ambig, &p).unwrap();
        g.validate().unwrap();
        g.del_tag(k2, &mut store, &mut ambig).unwrap();
        g.del_tag(k1, &mut store, &mut ambig).unwrap();
        g.validate().unwrap();
        assert_eq!(g.node_count(), 2);
        assert_eq!(g.set_count(), 1);
    }
}

#[test]
fn deletion_order_does_not_matter() {
    let gaps = [
        [0.02, 0.025, 0.03, 5.0],
        [0.04, 0.02, 0.06, 6.3],
        [0.025, 0.05, 0.02, 4.7],
    ];
    // delete in each permutation of three tags
    let perms: [[usize; 3]; 6] = [
        [0, 1, 2],
        [0, 2, 1],
        [1, 0, 2],
        [1, 2, 0],
        [2, 0, 1],
        [2, 1, 0],
    ];
    for perm in perms {
        let mut g = GapGraph::new();
        let mut store = TagStore::new();
        let mut ambig = Ambiguity::new(-1);
        let p = params();
        let keys: Vec<_> = gaps
            .iter()
            .enumerate()
            .map(|(i, &gg)| store.add(active_tag(i as i64 + 1, gg)).unwrap())
            .collect();
        for &k in &keys {
            g.add_tag(k, &mut store, &mut ambig, &p).unwrap();
        }
        g.validate().unwrap();
        for &i in &perm {
            g.del_tag(keys[i], &mut store, &mut ambig).unwrap();
            g.validate().unwrap();
        }
        assert_eq!(g.node_count(), 2, "perm {perm:?}");
    }
}

#[test]
fn every_active_tag_has_a_unique_full_burst_path() {
    let mut g = GapGraph::new();
    let mut store = TagStore::new();
    let mut ambig = Ambiguity::new(-1);
    let p = params();
    let gaps = [
        [0.02, 0.025, 0.03, 5.0],
        [0.04, 0.02, 0.06, 6.3],
        [0.025, 0.05, 0.02, 4.7],
    ];
    let keys: Vec<_> = gaps
        .iter()
        .enumerate()
        .map(|(i, &gg)| store.add(active_tag(i as i64 + 1, gg)).unwrap())
        .collect();
    for &k in &keys {
        g.add_tag(k, &mut store, &mut ambig, &p).unwrap();
    }
    for (key, gg) in keys.iter().zip(gaps.iter()) {
        let mut at = NodeIx::ROOT;
        for &gap in gg {
            at = g.advance(at, gap).expect("full-burst path");
        }
        let node = g.node(at);
        assert_eq!(node.set().len(), 1, "full-burst state is a singleton");
        assert_eq!(node.tag(), Some(*key));
        assert_eq!(node.phase(), Some(PULSES_PER_BURST as u16));
    }
}

#[test]
fn wonky_timestamp_columns_accept_a_one_second_jump() {
    let mut g = GapGraph::new();
    let mut store = TagStore::new();
    let mut ambig = Ambiguity::new(-1);
    let p = Params {
        timestamp_wonkiness: 1,
        ..params()
    };
    let k = store.add(active_tag(1, [0.02, 0.025, 0.03, 5.0])).unwrap();
    g.add_tag(k, &mut store, &mut ambig, &p).unwrap();
    g.validate().unwrap();

    // walk two bursts, then a repeat interval that lost one second
    let mut at = NodeIx::ROOT;
    for gap in [0.02, 0.025, 0.03, 5.0, 0.02, 0.025, 0.03] {
        at = g.advance(at, gap).expect("normal path");
    }
    let period = 5.075;
    let jumped = g
        .advance(at, 5.0 + period - 1.0)
        .expect("clock-jump column entry");
    let n = PULSES_PER_BURST;
    assert_eq!(g.node(jumped).phase(), Some(2 * n as u16));
    // intra-burst gaps continue inside the column
    let next = g.advance(jumped, 0.02).expect("column intra gap");
    assert_eq!(g.node(next).phase(), Some(2 * n as u16 + 1));

    g.del_tag(k, &mut store, &mut ambig).unwrap();
    g.validate().unwrap();
    assert_eq!(g.node_count(), 2);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Adding any small family of tags and deleting them all restores the
    /// empty graph, regardless of overlap or outright ambiguity.
    #[test]
    fn churn_restores_the_empty_graph(
        picks in proptest::collection::vec((0usize..4, 0usize..4, 0usize..4, 0usize..3), 1..5)
    ) {
        let short = [0.02, 0.025, 0.03, 0.04];
        let tails = [4.1, 5.3, 6.7];
        let mut g = GapGraph::new();
        let mut store = TagStore::new();
        let mut ambig = Ambiguity::new(-1);
        let p = params();
        let mut keys = Vec::new();
        for (i, &(a, b, c, t)) in picks.iter().enumerate() {
            let tag = active_tag(i as i64 + 1, [short[a], short[b], short[c], tails[t]]);
            let k = store.add(tag).unwrap();
            g.add_tag(k, &mut store, &mut ambig, &p).unwrap();
            g.validate().unwrap();
            keys.push(k);
        }
        for k in keys {
            g.del_tag(k, &mut store, &mut ambig).unwrap();
            g.validate().unwrap();
        }
        prop_assert_eq!(g.node_count(), 2);
        prop_assert_eq!(g.set_count(), 1);
    }
}
