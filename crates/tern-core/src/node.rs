// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Graph vertex: a labelled automaton state with an ordered gap-edge map.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ident::{Gap, GapKey, NodeIx, Phase, TagKey, PULSES_PER_BURST};
use crate::set::{TagPhase, TagPhaseSet};

/// One vertex of a [`crate::graph::GapGraph`].
///
/// The edge map is keyed by gap endpoints: the value stored at endpoint `g`
/// is the node reached for any gap in `[g, g')` where `g'` is the next
/// endpoint. The map always brackets its entries with sentinels at `−∞` and
/// `+∞`, both pointing at the empty-set sentinel node, so a lookup for any
/// gap value always lands on some endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// The set of `(tag, phase)` pairs consistent with the gap history that
    /// reaches this node.
    pub(crate) set: TagPhaseSet,
    /// Ordered transitions: gap endpoint → target node.
    pub(crate) edges: BTreeMap<GapKey, NodeIx>,
    /// Incoming graph edges plus structural pins (root and empty sentinel).
    pub(crate) links: u32,
    /// Candidates currently parked on this state.
    pub(crate) pins: u32,
    /// Cleared when the node's last graph link goes away; candidates parked
    /// here then expire on their next advance attempt.
    pub(crate) valid: bool,
    /// Visited marker for the current recursive traversal.
    pub(crate) stamp: u32,
}

impl Node {
    /// Creates a node with the given label set and bracketing sentinel edges.
    pub(crate) fn new(set: TagPhaseSet) -> Self {
        let mut edges = BTreeMap::new();
        edges.insert(GapKey(f64::NEG_INFINITY), NodeIx::EMPTY);
        edges.insert(GapKey(f64::INFINITY), NodeIx::EMPTY);
        Self {
            set,
            edges,
            links: 0,
            pins: 0,
            valid: true,
            stamp: 0,
        }
    }

    /// Creates the empty-set sentinel, which has no outgoing edges.
    pub(crate) fn sentinel() -> Self {
        Self {
            set: TagPhaseSet::empty(),
            edges: BTreeMap::new(),
            links: 0,
            pins: 0,
            valid: true,
            stamp: 0,
        }
    }

    /// The node's label set.
    #[must_use]
    pub fn set(&self) -> &TagPhaseSet {
        &self.set
    }

    /// Target of the edge covering `gap`: the value at the greatest endpoint
    /// `≤ gap`. Returns `None` when that target is the empty-set sentinel,
    /// i.e. no registered tag is consistent with this gap.
    #[must_use]
    pub fn advance(&self, gap: Gap) -> Option<NodeIx> {
        let (_, &target) = self.edges.range(..=GapKey(gap)).next_back()?;
        if target == NodeIx::EMPTY {
            None
        } else {
            Some(target)
        }
    }

    /// Largest finite gap for which an edge leaves this node, or 0 when only
    /// the sentinels remain. A candidate parked here longer than this can
    /// never advance again.
    #[must_use]
    pub fn max_age(&self) -> Gap {
        self.edges
            .range(..GapKey(f64::INFINITY))
            .next_back()
            .map_or(0.0, |(k, _)| if k.0.is_finite() { k.0 } else { 0.0 })
    }

    /// `true` when the label set is a single `(tag, phase)` pair, i.e. the
    /// gap history is consistent with exactly one registered tag.
    #[must_use]
    pub fn is_unique(&self) -> bool {
        self.set.unique().is_some()
    }

    /// The first member pair, if any.
    #[must_use]
    pub fn first_tag_phase(&self) -> Option<TagPhase> {
        self.set.first()
    }

    /// The (presumed unique) tag at this node.
    #[must_use]
    pub fn tag(&self) -> Option<TagKey> {
        self.set.first().map(|tp| tp.tag)
    }

    /// The (presumed unique) phase at this node.
    #[must_use]
    pub fn phase(&self) -> Option<Phase> {
        self.set.first().map(|tp| tp.phase)
    }

    /// Whether accepting a pulse into this state completes a burst.
    #[must_use]
    pub fn completes_burst(&self) -> bool {
        let n = PULSES_PER_BURST as Phase;
        self.phase().is_some_and(|p| p % n == n - 1)
    }

    /// `true` while this node is part of a live graph.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ident::TagKey;

    #[test]
    fn advance_picks_greatest_endpoint_at_or_left() {
        let mut n = Node::new(TagPhaseSet::empty());
        n.edges.insert(GapKey(1.0), NodeIx(7));
        n.edges.insert(GapKey(2.0), NodeIx::EMPTY);
        // left of the first finite endpoint: sentinel
        assert_eq!(n.advance(0.5), None);
        // endpoint is inclusive on its left side
        assert_eq!(n.advance(1.0), Some(NodeIx(7)));
        assert_eq!(n.advance(1.999), Some(NodeIx(7)));
        // at 2.0 the covering edge maps to the sentinel again
        assert_eq!(n.advance(2.0), None);
    }

    #[test]
    fn max_age_ignores_sentinels() {
        let mut n = Node::new(TagPhaseSet::empty());
        assert_eq!(n.max_age(), 0.0);
        n.edges.insert(GapKey(10.08), NodeIx(3));
        assert_eq!(n.max_age(), 10.08);
    }

    #[test]
    fn burst_completion_tracks_phase_modulo() {
        let n = Node::new(TagPhaseSet::singleton(TagPhase::new(TagKey(0), 3)));
        assert!(n.completes_burst());
        let m = Node::new(TagPhaseSet::singleton(TagPhase::new(TagKey(0), 4)));
        assert!(!m.completes_burst());
        // clock-jump column positions wrap the same way
        let w = Node::new(TagPhaseSet::singleton(TagPhase::new(TagKey(0), 11)));
        assert!(w.completes_burst());
    }
}
