// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The gap graph: an incrementally maintained automaton whose states are
//! hash-consed sets of `(tag, phase)` pairs and whose transitions are gap
//! intervals.
//!
//! Structure sharing is pervasive: a node is labelled by the set of tags
//! consistent with some gap history, and many histories share suffixes, so
//! edges from different parents may target the same node. Mutation is
//! copy-on-write: an edge's target is edited in place only when this edge is
//! its sole reference, otherwise the target is cloned (sharing its outgoing
//! edge map) and only this edge is repointed.
//!
//! Node lifetime is governed by two counters. `links` counts incoming graph
//! edges plus the structural pins on the root and empty sentinel; when it
//! reaches zero the node leaves the graph (its set is un-interned, its
//! children unlinked, and it is marked invalid). `pins` counts candidates
//! parked on the node; storage is reclaimed only when both reach zero, so a
//! candidate can always interrogate its state, even one that a tag
//! deactivation has severed from the graph.

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ambiguity::{Ambiguity, AmbiguityError};
use crate::gap_range::{GapRange, GapRanges};
use crate::ident::{Gap, GapKey, MotusId, NodeIx, Phase, TagKey, PULSES_PER_BURST};
use crate::node::Node;
use crate::params::Params;
use crate::set::{DuplicateTagPhase, TagPhase, TagPhaseSet};
use crate::tag::{Tag, TagStore};

/// Structural failures of the graph. None of these are recoverable; the
/// conductor flushes output and aborts.
#[derive(Debug, Error)]
pub enum GraphError {
    /// A transition was inserted twice for the same `(tag, phase)` pair.
    #[error(transparent)]
    DuplicateTagPhase(#[from] DuplicateTagPhase),
    /// A full-burst probe landed on a node labelled by more than one tag;
    /// the ambiguity manager should have collapsed it to a proxy.
    #[error("full-burst probe for tag {0} landed on an unproxied multi-tag state")]
    ProbeNotUnique(MotusId),
    /// A full-burst probe landed on a tag that is not active.
    #[error("full-burst probe landed on inactive tag {0}")]
    ProbeInactive(MotusId),
    /// Renaming a tag produced a set already interned for another node.
    #[error("hash-cons collision while renaming a tag")]
    RenameCollision,
    /// The set-to-node table disagrees with the arena.
    #[error("set-to-node table inconsistent: {0}")]
    Inconsistent(&'static str),
    /// Ambiguity bookkeeping failed.
    #[error(transparent)]
    Ambiguity(#[from] AmbiguityError),
}

/// Outcome of activating or deactivating a tag.
///
/// When ambiguity management replaced one tag with another inside the graph,
/// the pair is reported so finders can repoint in-flight candidates.
pub type RenamePair = Option<(TagKey, TagKey)>;

/// The recognition automaton for one nominal frequency.
#[derive(Debug, Serialize, Deserialize)]
pub struct GapGraph {
    /// Node arena; freed slots are `None` and recycled.
    nodes: Vec<Option<Node>>,
    /// Recycled slot indices.
    free: Vec<u32>,
    /// Interning table: label set → node. Rebuilt after deserialization.
    #[serde(skip)]
    set_to_node: FxHashMap<TagPhaseSet, NodeIx>,
    /// Current traversal stamp.
    stamp: u32,
}

impl Default for GapGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl GapGraph {
    /// Creates a graph holding only the root and the empty sentinel.
    #[must_use]
    pub fn new() -> Self {
        let mut sentinel = Node::sentinel();
        sentinel.links = 1; // pinned by the graph itself, never dropped
        let mut root = Node::new(TagPhaseSet::empty());
        root.links = 1; // pinned by the graph itself
        sentinel.links += 2; // root's two bracketing edges
        let mut set_to_node = FxHashMap::default();
        set_to_node.insert(TagPhaseSet::empty(), NodeIx::EMPTY);
        Self {
            nodes: vec![Some(sentinel), Some(root)],
            free: Vec::new(),
            set_to_node,
            stamp: 1,
        }
    }

    // ── arena plumbing ──────────────────────────────────────────────

    fn node_ref(&self, ix: NodeIx) -> &Node {
        match self.nodes.get(ix.0 as usize).and_then(Option::as_ref) {
            Some(n) => n,
            None => unreachable!("dangling node handle {ix:?}"),
        }
    }

    fn node_mut(&mut self, ix: NodeIx) -> &mut Node {
        match self.nodes.get_mut(ix.0 as usize).and_then(Option::as_mut) {
            Some(n) => n,
            None => unreachable!("dangling node handle {ix:?}"),
        }
    }

    fn alloc(&mut self, node: Node) -> NodeIx {
        if let Some(slot) = self.free.pop() {
            self.nodes[slot as usize] = Some(node);
            NodeIx(slot)
        } else {
            self.nodes.push(Some(node));
            NodeIx((self.nodes.len() - 1) as u32)
        }
    }

    fn release(&mut self, ix: NodeIx) {
        debug_assert!(ix != NodeIx::EMPTY && ix != NodeIx::ROOT);
        self.nodes[ix.0 as usize] = None;
        self.free.push(ix.0);
    }

    /// Borrows a node. Handles are only minted by this graph.
    #[must_use]
    pub fn node(&self, ix: NodeIx) -> &Node {
        self.node_ref(ix)
    }

    /// Number of live nodes, sentinel and root included.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len() - self.free.len()
    }

    /// Number of interned label sets (the empty set included).
    #[must_use]
    pub fn set_count(&self) -> usize {
        self.set_to_node.len()
    }

    /// Whether the node is still part of the graph.
    #[must_use]
    pub fn is_valid(&self, ix: NodeIx) -> bool {
        self.nodes
            .get(ix.0 as usize)
            .and_then(Option::as_ref)
            .is_some_and(Node::is_valid)
    }

    /// Follows the edge covering `gap` from `ix`, if any.
    #[must_use]
    pub fn advance(&self, ix: NodeIx, gap: Gap) -> Option<NodeIx> {
        self.node_ref(ix).advance(gap)
    }

    // ── candidate pinning ───────────────────────────────────────────

    /// Parks a candidate on a node, keeping its storage alive.
    pub fn pin(&mut self, ix: NodeIx) {
        self.node_mut(ix).pins += 1;
    }

    /// Releases a candidate's pin, reclaiming the node if it has already
    /// been severed from the graph.
    pub fn unpin(&mut self, ix: NodeIx) {
        let n = self.node_mut(ix);
        debug_assert!(n.pins > 0, "unbalanced unpin on {ix:?}");
        n.pins = n.pins.saturating_sub(1);
        if n.pins == 0 && n.links == 0 && ix != NodeIx::EMPTY && ix != NodeIx::ROOT {
            self.release(ix);
        }
    }

    // ── interning ───────────────────────────────────────────────────

    fn map_set(&mut self, set: TagPhaseSet, ix: NodeIx) {
        let prev = self.set_to_node.insert(set, ix);
        debug_assert!(prev.is_none(), "set interned twice");
    }

    fn unmap_set(&mut self, set: &TagPhaseSet) {
        if !set.is_empty() {
            self.set_to_node.remove(set);
        }
    }

    /// Reconstructs the interning table from the arena. Called once after
    /// deserializing a saved graph; the table itself is never persisted.
    pub fn rebuild_index(&mut self) {
        self.set_to_node.clear();
        self.set_to_node.insert(TagPhaseSet::empty(), NodeIx::EMPTY);
        for (i, slot) in self.nodes.iter().enumerate() {
            let ix = NodeIx(i as u32);
            if ix == NodeIx::EMPTY || ix == NodeIx::ROOT {
                continue;
            }
            if let Some(n) = slot {
                if n.valid {
                    self.set_to_node.insert(n.set.clone(), ix);
                }
            }
        }
    }

    // ── link accounting ─────────────────────────────────────────────

    fn link(&mut self, ix: NodeIx) {
        self.node_mut(ix).links += 1;
    }

    fn unlink(&mut self, ix: NodeIx) {
        {
            let n = self.node_mut(ix);
            debug_assert!(n.links > 0, "unbalanced unlink on {ix:?}");
            n.links -= 1;
            if n.links > 0 || ix == NodeIx::EMPTY || ix == NodeIx::ROOT {
                return;
            }
        }
        // last graph reference gone: sever the node
        let (set, edges) = {
            let n = self.node_mut(ix);
            n.valid = false;
            (
                core::mem::take(&mut n.set),
                core::mem::take(&mut n.edges),
            )
        };
        self.unmap_set(&set);
        for (_, child) in edges {
            self.unlink(child);
        }
        if self.node_ref(ix).pins == 0 {
            self.release(ix);
        }
    }

    // ── traversal stamps ────────────────────────────────────────────

    fn new_stamp(&mut self) -> u32 {
        self.stamp = self.stamp.wrapping_add(1);
        if self.stamp == 0 {
            for slot in self.nodes.iter_mut().flatten() {
                slot.stamp = 0;
            }
            self.stamp = 1;
        }
        self.stamp
    }

    // ── edge surgery ────────────────────────────────────────────────

    /// Ensures an endpoint exists at `b`, born covering whatever node the
    /// map already answers for `b`.
    fn ensure_edge(&mut self, n: NodeIx, b: Gap) {
        let key = GapKey(b);
        if self.node_ref(n).edges.contains_key(&key) {
            return;
        }
        let below = match self.node_ref(n).edges.range(..=key).next_back() {
            Some((_, &target)) => target,
            None => {
                debug_assert!(false, "edge map missing its -inf sentinel");
                return;
            }
        };
        self.node_mut(n).edges.insert(key, below);
        self.link(below);
    }

    /// Adds `tp` to the set labelling the target of edge `key` out of `n`,
    /// copy-on-write.
    fn augment_edge(&mut self, n: NodeIx, key: GapKey, tp: TagPhase) -> Result<(), GraphError> {
        let child = match self.node_ref(n).edges.get(&key) {
            Some(&c) => c,
            None => {
                debug_assert!(false, "augment_edge on a missing endpoint");
                return Ok(());
            }
        };
        if self.node_ref(child).set.contains(tp) {
            // ranges for distinct burst multiples may overlap after chunking;
            // the pair is already present on this edge
            return Ok(());
        }
        let new_set = self.node_ref(child).set.clone_augment(tp)?;
        if let Some(&existing) = self.set_to_node.get(&new_set) {
            self.node_mut(n).edges.insert(key, existing);
            self.link(existing);
            self.unlink(child);
            return Ok(());
        }
        if child != NodeIx::EMPTY && self.node_ref(child).links == 1 {
            // this edge is the only reference: edit the node in place
            let old = self.node_ref(child).set.clone();
            self.unmap_set(&old);
            self.node_mut(child).set = new_set.clone();
            self.map_set(new_set, child);
            return Ok(());
        }
        // clone the target, sharing its outgoing edges
        let edges = if child == NodeIx::EMPTY {
            let mut e = BTreeMap::new();
            e.insert(GapKey(f64::NEG_INFINITY), NodeIx::EMPTY);
            e.insert(GapKey(f64::INFINITY), NodeIx::EMPTY);
            e
        } else {
            self.node_ref(child).edges.clone()
        };
        let targets: Vec<NodeIx> = edges.values().copied().collect();
        for t in targets {
            self.link(t);
        }
        let nn = self.alloc(Node {
            set: new_set.clone(),
            edges,
            links: 0,
            pins: 0,
            valid: true,
            stamp: 0,
        });
        self.map_set(new_set, nn);
        self.node_mut(n).edges.insert(key, nn);
        self.link(nn);
        self.unlink(child);
        Ok(())
    }

    /// Removes every phase of `tag` from the target of edge `key`,
    /// copy-on-write.
    fn reduce_edge(&mut self, n: NodeIx, key: GapKey, tag: TagKey) {
        let child = match self.node_ref(n).edges.get(&key) {
            Some(&c) => c,
            None => return,
        };
        if child == NodeIx::EMPTY || self.node_ref(child).set.count_tag(tag) == 0 {
            return;
        }
        let new_set = self.node_ref(child).set.clone_reduce_tag(tag);
        if let Some(&existing) = self.set_to_node.get(&new_set) {
            // the empty set resolves here, to the sentinel
            self.node_mut(n).edges.insert(key, existing);
            self.link(existing);
            self.unlink(child);
            return;
        }
        if self.node_ref(child).links == 1 {
            let old = self.node_ref(child).set.clone();
            self.unmap_set(&old);
            self.node_mut(child).set = new_set.clone();
            self.map_set(new_set, child);
            return;
        }
        let edges = self.node_ref(child).edges.clone();
        let targets: Vec<NodeIx> = edges.values().copied().collect();
        for t in targets {
            self.link(t);
        }
        let nn = self.alloc(Node {
            set: new_set.clone(),
            edges,
            links: 0,
            pins: 0,
            valid: true,
            stamp: 0,
        });
        self.map_set(new_set, nn);
        self.node_mut(n).edges.insert(key, nn);
        self.link(nn);
        self.unlink(child);
    }

    /// Augments every edge of `n` covering the given intervals with `tp`.
    fn insert_ranges_at(
        &mut self,
        n: NodeIx,
        ranges: &GapRanges,
        tp: TagPhase,
    ) -> Result<(), GraphError> {
        for r in ranges {
            self.ensure_edge(n, r.hi);
            self.ensure_edge(n, r.lo);
            let keys: Vec<GapKey> = self
                .node_ref(n)
                .edges
                .range(GapKey(r.lo)..GapKey(r.hi))
                .map(|(k, _)| *k)
                .collect();
            for key in keys {
                self.augment_edge(n, key, tp)?;
            }
        }
        Ok(())
    }

    /// Inserts the transition `from → to` over `ranges` at every node whose
    /// set holds `from`, walking the shared structure depth-first.
    fn insert_transition(
        &mut self,
        from: TagPhase,
        to: TagPhase,
        ranges: &GapRanges,
    ) -> Result<(), GraphError> {
        let stamp = self.new_stamp();
        self.insert_transition_at(NodeIx::ROOT, from, to, ranges, stamp)
    }

    fn insert_transition_at(
        &mut self,
        n: NodeIx,
        from: TagPhase,
        to: TagPhase,
        ranges: &GapRanges,
        stamp: u32,
    ) -> Result<(), GraphError> {
        self.node_mut(n).stamp = stamp;
        let keys: Vec<GapKey> = self.node_ref(n).edges.keys().copied().collect();
        for key in keys {
            let child = match self.node_ref(n).edges.get(&key) {
                Some(&c) => c,
                None => continue,
            };
            if child == NodeIx::EMPTY {
                continue;
            }
            if self.node_ref(child).stamp != stamp
                && self.node_ref(child).set.count_tag(from.tag) > 0
            {
                self.insert_transition_at(child, from, to, ranges, stamp)?;
            }
        }
        if self.node_ref(n).set.contains(from) {
            self.insert_ranges_at(n, ranges, to)?;
        }
        Ok(())
    }

    /// Removes `tag` from the targets of every edge out of `n`.
    fn erase_at(&mut self, n: NodeIx, tag: TagKey) {
        let keys: Vec<GapKey> = self.node_ref(n).edges.keys().copied().collect();
        for key in keys {
            self.reduce_edge(n, key, tag);
        }
    }

    fn erase_everywhere(&mut self, tag: TagKey) {
        let stamp = self.new_stamp();
        self.erase_everywhere_at(NodeIx::ROOT, tag, stamp);
    }

    fn erase_everywhere_at(&mut self, n: NodeIx, tag: TagKey, stamp: u32) {
        self.node_mut(n).stamp = stamp;
        let here = self.node_ref(n).set.count_tag(tag) > 0;
        let keys: Vec<GapKey> = self.node_ref(n).edges.keys().copied().collect();
        for key in keys {
            let child = match self.node_ref(n).edges.get(&key) {
                Some(&c) => c,
                None => continue,
            };
            if child == NodeIx::EMPTY {
                continue;
            }
            if self.node_ref(child).stamp != stamp && self.node_ref(child).set.count_tag(tag) > 0 {
                self.erase_everywhere_at(child, tag, stamp);
            }
        }
        if here {
            self.erase_at(n, tag);
        }
    }

    // ── tag lifecycle ───────────────────────────────────────────────

    /// Activates a tag.
    ///
    /// If the tag's gap signature is already claimed by another active tag,
    /// the two are merged under an ambiguity proxy instead, and the
    /// `(superseded, replacement)` pair is returned so candidates can be
    /// repointed. Otherwise the tag's transitions are woven into the graph.
    pub fn add_tag(
        &mut self,
        key: TagKey,
        store: &mut TagStore,
        ambig: &mut Ambiguity,
        params: &Params,
    ) -> Result<RenamePair, GraphError> {
        let tag = store.tag(key).clone();
        if let Some(existing) = self.find(&tag, store, params)? {
            let proxy = ambig.join(existing, key, store)?;
            if proxy != existing {
                self.ren_tag(existing, proxy)?;
            }
            return Ok(Some((existing, proxy)));
        }
        self.insert_tag(key, &tag, params)?;
        Ok(None)
    }

    /// Deactivates a tag.
    ///
    /// A tag hidden behind a proxy shrinks the proxy's member set (possibly
    /// collapsing it back to a lone real tag); the `(proxy, replacement)`
    /// pair is returned in that case. A directly woven tag is erased.
    pub fn del_tag(
        &mut self,
        key: TagKey,
        store: &mut TagStore,
        ambig: &mut Ambiguity,
    ) -> Result<RenamePair, GraphError> {
        if let Some(proxy) = ambig.proxy_for(key) {
            let replacement = ambig.split(proxy, key, store)?;
            if replacement != proxy {
                self.ren_tag(proxy, replacement)?;
            }
            return Ok(Some((proxy, replacement)));
        }
        self.erase_everywhere(key);
        self.node_mut(NodeIx::ROOT).set.reduce_tag(key);
        Ok(None)
    }

    /// Weaves one tag's transitions into the graph.
    fn insert_tag(&mut self, key: TagKey, tag: &Tag, params: &Params) -> Result<(), GraphError> {
        let n = PULSES_PER_BURST;
        let fuzz = params.clock_fuzz;
        self.node_mut(NodeIx::ROOT)
            .set
            .augment(TagPhase::new(key, 0))?;

        // One full cycle plus the second burst: phases 0 → 2N-1. Intra-burst
        // gaps take the pulse tolerance; the tail gap takes the burst
        // tolerance.
        for i in 0..(2 * n - 1) {
            let g = tag.gaps[i % n];
            let tol = if i % n == n - 1 {
                params.burst_slop
            } else {
                params.pulse_slop
            };
            let ranges = vec![GapRange::around(g, tol, fuzz)];
            self.insert_transition(
                TagPhase::new(key, i as Phase),
                TagPhase::new(key, (i + 1) as Phase),
                &ranges,
            )?;
        }

        let tail = tag.gaps[n - 1];
        let max_time = params.max_time_for(tail, tag.period);

        // Back edges: repetition of bursts, phase 2N-1 → N, at the tail gap
        // plus every whole number of skipped periods. The tolerance widens
        // per skipped burst to absorb clock drift.
        let back = burst_multiples(tail, tag.period, max_time, 0, params);
        self.insert_transition(
            TagPhase::new(key, (2 * n - 1) as Phase),
            TagPhase::new(key, n as Phase),
            &back,
        )?;

        // Skip edges: bursts missed right after the first, phase N-1 → N.
        let skip = burst_multiples(tail, tag.period, max_time, 1, params);
        self.insert_transition(
            TagPhase::new(key, (n - 1) as Phase),
            TagPhase::new(key, n as Phase),
            &skip,
        )?;

        if params.timestamp_wonkiness > 0 {
            self.insert_wonky_columns(key, tag, &back, max_time, params)?;
        }
        Ok(())
    }

    /// Clock-jump columns for receivers whose timestamps may step ±1 s
    /// between records. Column `2N..3N-1` models a −1 s jump, `3N..4N-1` a
    /// +1 s jump; each links back to the normal graph via the opposite shift
    /// once the cumulative jump cancels. Only the repeated-burst edges are
    /// duplicated; the first-burst skip edge is not.
    fn insert_wonky_columns(
        &mut self,
        key: TagKey,
        tag: &Tag,
        back: &GapRanges,
        max_time: Gap,
        params: &Params,
    ) -> Result<(), GraphError> {
        let n = PULSES_PER_BURST;
        let fuzz = params.clock_fuzz;
        let mut minus = GapRanges::new();
        let mut plus = GapRanges::new();
        let tail = tag.gaps[n - 1];
        let mut k = 1u32;
        loop {
            let g = tail + f64::from(k) * tag.period;
            if g >= max_time {
                break;
            }
            let tol = params.burst_slop + f64::from(k) * params.burst_slop_expansion;
            minus.push(GapRange::around(g - 1.0, tol, fuzz));
            plus.push(GapRange::around(g + 1.0, tol, fuzz));
            k += 1;
        }
        coalesce(&mut minus);
        coalesce(&mut plus);

        let p = |i: usize| TagPhase::new(key, i as Phase);

        // −1 s column: enter from the normal end-of-window, walk one burst
        // inside the column, then exit with the +1 s shift (the jump
        // cancelled) or loop within the column. The column body must exist
        // before its exit and loop edges have anywhere to start from.
        self.insert_transition(p(2 * n - 1), p(2 * n), &minus)?;
        for i in 0..(n - 1) {
            let r = vec![GapRange::around(tag.gaps[i], params.pulse_slop, fuzz)];
            self.insert_transition(p(2 * n + i), p(2 * n + i + 1), &r)?;
        }
        self.insert_transition(p(3 * n - 1), p(n - 1), &plus)?;
        self.insert_transition(p(3 * n - 1), p(2 * n), back)?;

        // +1 s column, mirrored
        self.insert_transition(p(2 * n - 1), p(3 * n), &plus)?;
        for i in 0..(n - 1) {
            let r = vec![GapRange::around(tag.gaps[i], params.pulse_slop, fuzz)];
            self.insert_transition(p(3 * n + i), p(3 * n + i + 1), &r)?;
        }
        self.insert_transition(p(4 * n - 1), p(n - 1), &minus)?;
        self.insert_transition(p(4 * n - 1), p(3 * n), back)?;
        Ok(())
    }

    /// Replaces `from` with `to` in every node label that mentions it,
    /// re-interning the affected sets.
    pub fn ren_tag(&mut self, from: TagKey, to: TagKey) -> Result<(), GraphError> {
        let stamp = self.new_stamp();
        let mut affected = Vec::new();
        self.collect_mentions(NodeIx::ROOT, from, stamp, &mut affected);
        for ix in affected {
            if ix == NodeIx::ROOT {
                self.node_mut(ix).set.rename_tag(from, to);
                continue;
            }
            let old = self.node_ref(ix).set.clone();
            self.unmap_set(&old);
            self.node_mut(ix).set.rename_tag(from, to);
            let renamed = self.node_ref(ix).set.clone();
            if self.set_to_node.contains_key(&renamed) {
                return Err(GraphError::RenameCollision);
            }
            self.map_set(renamed, ix);
        }
        Ok(())
    }

    fn collect_mentions(&mut self, n: NodeIx, tag: TagKey, stamp: u32, out: &mut Vec<NodeIx>) {
        self.node_mut(n).stamp = stamp;
        let keys: Vec<GapKey> = self.node_ref(n).edges.keys().copied().collect();
        for key in keys {
            let child = match self.node_ref(n).edges.get(&key) {
                Some(&c) => c,
                None => continue,
            };
            if child == NodeIx::EMPTY {
                continue;
            }
            if self.node_ref(child).stamp != stamp && self.node_ref(child).set.count_tag(tag) > 0 {
                self.collect_mentions(child, tag, stamp, out);
            }
        }
        if self.node_ref(n).set.count_tag(tag) > 0 {
            out.push(n);
        }
    }

    /// Walks the graph with `tag`'s own gap signature to see whether an
    /// active tag already answers for it.
    ///
    /// The final (tail) gap is probed at its registered value and at both
    /// tolerance endpoints; any probe that lands must land on a singleton
    /// active tag.
    pub fn find(
        &self,
        tag: &Tag,
        store: &TagStore,
        params: &Params,
    ) -> Result<Option<TagKey>, GraphError> {
        let n = PULSES_PER_BURST;
        let mut at = NodeIx::ROOT;
        for i in 0..(n - 1) {
            match self.advance(at, tag.gaps[i]) {
                Some(next) => at = next,
                None => return Ok(None),
            }
        }
        let tail = tag.gaps[n - 1];
        let r = GapRange::around(tail, params.burst_slop, params.clock_fuzz);
        for probe in [tail, r.lo, r.hi] {
            if let Some(hit) = self.advance(at, probe) {
                let set = &self.node_ref(hit).set;
                if set.len() > 1 {
                    return Err(GraphError::ProbeNotUnique(tag.motus_id));
                }
                if let Some(tp) = set.first() {
                    if !store.tag(tp.tag).active {
                        return Err(GraphError::ProbeInactive(store.tag(tp.tag).motus_id));
                    }
                    return Ok(Some(tp.tag));
                }
            }
        }
        Ok(None)
    }

    // ── consistency ─────────────────────────────────────────────────

    /// Verifies the interning invariant and link accounting. Used by tests
    /// and by debug assertions around graph mutations.
    pub fn validate(&self) -> Result<(), GraphError> {
        for (set, &ix) in &self.set_to_node {
            let Some(node) = self.nodes.get(ix.0 as usize).and_then(Option::as_ref) else {
                return Err(GraphError::Inconsistent("interned set maps to a freed node"));
            };
            if !node.valid {
                return Err(GraphError::Inconsistent("interned set maps to a dead node"));
            }
            if node.set != *set {
                return Err(GraphError::Inconsistent("interned set differs from node label"));
            }
        }
        // recompute link counts: incoming edges + structural pins
        let mut expect: Vec<u32> = vec![0; self.nodes.len()];
        expect[NodeIx::EMPTY.0 as usize] += 1;
        expect[NodeIx::ROOT.0 as usize] += 1;
        for slot in self.nodes.iter().flatten() {
            if !slot.valid {
                continue;
            }
            for &t in slot.edges.values() {
                expect[t.0 as usize] += 1;
            }
        }
        for (i, slot) in self.nodes.iter().enumerate() {
            if let Some(node) = slot {
                if node.valid && node.links != expect[i] {
                    return Err(GraphError::Inconsistent("link count mismatch"));
                }
            }
        }
        Ok(())
    }
}

/// Acceptance intervals at the tail gap plus whole periods, from multiple
/// `first` up to (but excluding) `max_time`, with per-skip tolerance growth.
fn burst_multiples(tail: Gap, period: Gap, max_time: Gap, first: u32, params: &Params) -> GapRanges {
    let mut out = GapRanges::new();
    let mut k = first;
    loop {
        let g = tail + f64::from(k) * period;
        if g >= max_time {
            break;
        }
        let tol = params.burst_slop + f64::from(k) * params.burst_slop_expansion;
        out.push(GapRange::around(g, tol, params.clock_fuzz));
        k += 1;
    }
    coalesce(&mut out);
    out
}

/// Merges overlapping or touching intervals in place.
fn coalesce(ranges: &mut GapRanges) {
    if ranges.len() < 2 {
        return;
    }
    ranges.sort_by(|a, b| a.lo.total_cmp(&b.lo));
    let mut merged = GapRanges::with_capacity(ranges.len());
    for r in ranges.drain(..) {
        match merged.last_mut() {
            Some(last) if r.lo <= last.hi => last.hi = last.hi.max(r.hi),
            _ => merged.push(r),
        }
    }
    *ranges = merged;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ident::MotusId;

    fn store_with(gaps: &[[Gap; 4]]) -> (TagStore, Vec<TagKey>) {
        let mut store = TagStore::new();
        let mut keys = Vec::new();
        for (i, g) in gaps.iter().enumerate() {
            let mut t = Tag::new(MotusId(100 + i as i64), 166.38, 4.0, *g);
            t.active = true;
            keys.push(store.add(t).unwrap());
        }
        (store, keys)
    }

    #[test]
    fn add_then_del_restores_counts() {
        let mut g = GapGraph::new();
        let mut ambig = Ambiguity::new(-1);
        let params = Params::default();
        let (mut store, keys) = store_with(&[[0.02, 0.025, 0.03, 5.0]]);

        let nodes_before = g.node_count();
        let sets_before = g.set_count();
        assert!(g.add_tag(keys[0], &mut store, &mut ambig, &params).unwrap().is_none());
        g.validate().unwrap();
        assert!(g.node_count() > nodes_before);

        assert!(g.del_tag(keys[0], &mut store, &mut ambig).unwrap().is_none());
        g.validate().unwrap();
        assert_eq!(g.node_count(), nodes_before);
        assert_eq!(g.set_count(), sets_before);
    }

    #[test]
    fn two_tags_add_del_in_any_order_is_a_noop() {
        let mut g = GapGraph::new();
        let mut ambig = Ambiguity::new(-1);
        let params = Params::default();
        let (mut store, keys) = store_with(&[
            [0.02, 0.025, 0.03, 5.0],
            [0.021, 0.06, 0.033, 7.4],
        ]);
        let nodes_before = g.node_count();
        let sets_before = g.set_count();
        g.add_tag(keys[0], &mut store, &mut ambig, &params).unwrap();
        g.add_tag(keys[1], &mut store, &mut ambig, &params).unwrap();
        g.validate().unwrap();
        g.del_tag(keys[1], &mut store, &mut ambig).unwrap();
        g.validate().unwrap();
        g.del_tag(keys[0], &mut store, &mut ambig).unwrap();
        g.validate().unwrap();
        assert_eq!(g.node_count(), nodes_before);
        assert_eq!(g.set_count(), sets_before);
    }

    #[test]
    fn unique_path_reaches_full_burst_phase() {
        let mut g = GapGraph::new();
        let mut ambig = Ambiguity::new(-1);
        let params = Params::default();
        let (mut store, keys) = store_with(&[[0.02, 0.025, 0.03, 5.0]]);
        g.add_tag(keys[0], &mut store, &mut ambig, &params).unwrap();

        let mut at = NodeIx::ROOT;
        for gap in [0.02, 0.025, 0.03, 5.0] {
            at = g.advance(at, gap).expect("path must exist");
        }
        let node = g.node(at);
        assert_eq!(
            node.set().unique(),
            Some(TagPhase::new(keys[0], PULSES_PER_BURST as Phase))
        );
    }

    #[test]
    fn back_edge_returns_to_phase_n() {
        let mut g = GapGraph::new();
        let mut ambig = Ambiguity::new(-1);
        let params = Params::default();
        let (mut store, keys) = store_with(&[[0.02, 0.025, 0.03, 5.0]]);
        g.add_tag(keys[0], &mut store, &mut ambig, &params).unwrap();

        // first burst, tail, second burst
        let mut at = NodeIx::ROOT;
        for gap in [0.02, 0.025, 0.03, 5.0, 0.02, 0.025, 0.03] {
            at = g.advance(at, gap).expect("path must exist");
        }
        assert_eq!(g.node(at).phase(), Some(7));
        // tail again: back edge to phase 4
        let back = g.advance(at, 5.0).expect("back edge must exist");
        assert_eq!(g.node(back).phase(), Some(4));
        // one skipped burst: gap of tail + period, widened tolerance
        let skipped = g.advance(at, 5.0 + 5.075).expect("skip-multiple back edge");
        assert_eq!(g.node(skipped).phase(), Some(4));
    }

    #[test]
    fn find_reports_collision_with_identical_tag() {
        let mut g = GapGraph::new();
        let mut ambig = Ambiguity::new(-1);
        let params = Params::default();
        let (mut store, keys) = store_with(&[
            [0.02, 0.025, 0.03, 5.0],
            [0.02, 0.025, 0.03, 5.0],
        ]);
        g.add_tag(keys[0], &mut store, &mut ambig, &params).unwrap();
        let t1 = store.tag(keys[1]).clone();
        assert_eq!(g.find(&t1, &store, &params).unwrap(), Some(keys[0]));
    }

    #[test]
    fn identical_tags_merge_under_a_proxy() {
        let mut g = GapGraph::new();
        let mut ambig = Ambiguity::new(-1);
        let params = Params::default();
        let (mut store, keys) = store_with(&[
            [0.02, 0.025, 0.03, 5.0],
            [0.02, 0.025, 0.03, 5.0],
        ]);
        g.add_tag(keys[0], &mut store, &mut ambig, &params).unwrap();
        let pair = g
            .add_tag(keys[1], &mut store, &mut ambig, &params)
            .unwrap()
            .expect("second identical tag must be proxied");
        assert_eq!(pair.0, keys[0]);
        let proxy = pair.1;
        assert!(store.tag(proxy).is_proxy());
        g.validate().unwrap();

        // the unique full-burst node is now labelled by the proxy
        let mut at = NodeIx::ROOT;
        for gap in [0.02, 0.025, 0.03, 5.0] {
            at = g.advance(at, gap).expect("path must exist");
        }
        assert_eq!(g.node(at).tag(), Some(proxy));

        // dropping one member collapses back to the surviving real tag
        let pair = g
            .del_tag(keys[1], &mut store, &mut ambig)
            .unwrap()
            .expect("member removal renames the proxy");
        assert_eq!(pair.0, proxy);
        assert_eq!(pair.1, keys[0]);
        g.validate().unwrap();
    }

    #[test]
    fn severed_state_stays_allocated_while_pinned() {
        let mut g = GapGraph::new();
        let mut ambig = Ambiguity::new(-1);
        let params = Params::default();
        let (mut store, keys) = store_with(&[[0.02, 0.025, 0.03, 5.0]]);
        g.add_tag(keys[0], &mut store, &mut ambig, &params).unwrap();

        let st = g.advance(NodeIx::ROOT, 0.02).unwrap();
        g.pin(st);
        g.del_tag(keys[0], &mut store, &mut ambig).unwrap();
        assert!(!g.is_valid(st));
        assert_eq!(g.node(st).max_age(), 0.0);
        g.unpin(st);
        g.validate().unwrap();
    }
}
