// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Hash-consed multiset of `(tag, phase)` pairs labelling a graph node.
//!
//! Two sets are equal iff they hold identical pairs. Each set carries a
//! commutative XOR hash over its member tags so the graph can intern sets in
//! O(1); the hash deliberately ignores phases, so equality always compares
//! the full member list.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ident::{Phase, TagKey};

/// A single `(tag, phase)` membership claim.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct TagPhase {
    /// Tag-arena handle.
    pub tag: TagKey,
    /// Number of pulses of this tag matched so far in the recognition window.
    pub phase: Phase,
}

impl TagPhase {
    /// Creates a membership claim.
    #[must_use]
    pub fn new(tag: TagKey, phase: Phase) -> Self {
        Self { tag, phase }
    }
}

/// Error raised when inserting a pair that is already present.
///
/// The graph never inserts the same transition twice; hitting this is a
/// caller bug and propagates as a structural failure.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("duplicate tag-phase pair: tag {tag:?} phase {phase}")]
pub struct DuplicateTagPhase {
    /// Offending tag handle.
    pub tag: TagKey,
    /// Offending phase.
    pub phase: Phase,
}

/// Ordered multiset from tag to the phases it holds at one node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagPhaseSet {
    /// Members, sorted by `(tag, phase)`.
    items: Vec<TagPhase>,
    /// XOR of per-tag hashes; phase-insensitive.
    hash: u64,
}

impl core::hash::Hash for TagPhaseSet {
    fn hash<H: core::hash::Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl TagPhaseSet {
    /// The empty set.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Creates a singleton set.
    #[must_use]
    pub fn singleton(tp: TagPhase) -> Self {
        Self {
            items: vec![tp],
            hash: tp.tag.mix(),
        }
    }

    /// Returns `true` when no pairs are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Number of `(tag, phase)` pairs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// The commutative member hash.
    #[must_use]
    pub fn xor_hash(&self) -> u64 {
        self.hash
    }

    /// Number of phases held by `tag`.
    #[must_use]
    pub fn count_tag(&self, tag: TagKey) -> usize {
        self.items.iter().filter(|tp| tp.tag == tag).count()
    }

    /// Whether the exact pair is present.
    #[must_use]
    pub fn contains(&self, tp: TagPhase) -> bool {
        self.items.binary_search(&tp).is_ok()
    }

    /// The sole pair, when the set is a singleton.
    #[must_use]
    pub fn unique(&self) -> Option<TagPhase> {
        if self.items.len() == 1 {
            self.items.first().copied()
        } else {
            None
        }
    }

    /// First pair in `(tag, phase)` order, if any.
    #[must_use]
    pub fn first(&self) -> Option<TagPhase> {
        self.items.first().copied()
    }

    /// Iterates over all pairs in order.
    pub fn iter(&self) -> impl Iterator<Item = TagPhase> + '_ {
        self.items.iter().copied()
    }

    /// Adds a pair in place. The pair must not already be present.
    pub fn augment(&mut self, tp: TagPhase) -> Result<(), DuplicateTagPhase> {
        match self.items.binary_search(&tp) {
            Ok(_) => Err(DuplicateTagPhase {
                tag: tp.tag,
                phase: tp.phase,
            }),
            Err(pos) => {
                self.items.insert(pos, tp);
                self.hash ^= tp.tag.mix();
                Ok(())
            }
        }
    }

    /// Removes every phase of `tag` in place. Returns the number removed.
    pub fn reduce_tag(&mut self, tag: TagKey) -> usize {
        let before = self.items.len();
        self.items.retain(|tp| tp.tag != tag);
        let removed = before - self.items.len();
        // each removed pair contributed one XOR term for the tag
        for _ in 0..removed {
            self.hash ^= tag.mix();
        }
        removed
    }

    /// Returns a copy of this set with `tp` added.
    pub fn clone_augment(&self, tp: TagPhase) -> Result<Self, DuplicateTagPhase> {
        let mut s = self.clone();
        s.augment(tp)?;
        Ok(s)
    }

    /// Returns a copy of this set with every phase of `tag` removed.
    #[must_use]
    pub fn clone_reduce_tag(&self, tag: TagKey) -> Self {
        let mut s = self.clone();
        s.reduce_tag(tag);
        s
    }

    /// Replaces every occurrence of `from` with `to`, keeping phases.
    ///
    /// Returns `true` if anything changed. Used when an ambiguity proxy
    /// supersedes a tag already woven into the graph.
    pub fn rename_tag(&mut self, from: TagKey, to: TagKey) -> bool {
        let mut changed = false;
        for tp in &mut self.items {
            if tp.tag == from {
                tp.tag = to;
                changed = true;
            }
        }
        if changed {
            self.items.sort_unstable();
            self.hash = self.items.iter().fold(0, |h, tp| h ^ tp.tag.mix());
        }
        changed
    }
}
