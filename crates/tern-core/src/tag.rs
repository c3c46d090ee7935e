// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Registered tag descriptors and the arena that owns them.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ident::{Gap, MotusId, NominalKhz, TagKey, PULSES_PER_BURST};

/// Immutable description of one registered tag (real or proxy).
///
/// A tag transmits a fixed cyclic sequence of four pulses; `gaps[0..3]` are
/// the three intra-burst gaps followed by the tail gap from the last pulse of
/// one burst to the first pulse of the next. Their sum is the burst period.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tag {
    /// Database identifier; negative for ambiguity proxies.
    pub motus_id: MotusId,
    /// Nominal transmit frequency, MHz.
    pub freq_mhz: f64,
    /// Offset from nominal observed at registration, kHz.
    pub dfreq_khz: f64,
    /// Intra-burst gaps and the tail gap, seconds.
    pub gaps: [Gap; PULSES_PER_BURST],
    /// Sum of the gaps: burst-start to burst-start interval, seconds.
    pub period: Gap,
    /// Times this tag has been detected. For proxies this gates whether the
    /// ambiguity manager may still mutate the member set in place.
    pub count: u64,
    /// Only active tags participate in recognition graphs.
    pub active: bool,
}

impl Tag {
    /// Creates a tag, deriving the period from the gap sequence.
    #[must_use]
    pub fn new(motus_id: MotusId, freq_mhz: f64, dfreq_khz: f64, gaps: [Gap; PULSES_PER_BURST]) -> Self {
        Self {
            motus_id,
            freq_mhz,
            dfreq_khz,
            gaps,
            period: gaps.iter().sum(),
            count: 0,
            active: false,
        }
    }

    /// The nominal-frequency bucket this tag transmits in.
    #[must_use]
    pub fn nominal(&self) -> NominalKhz {
        NominalKhz::from_mhz(self.freq_mhz)
    }

    /// Whether this is an ambiguity proxy.
    #[must_use]
    pub fn is_proxy(&self) -> bool {
        self.motus_id.is_proxy()
    }
}

/// Error from [`TagStore`] registration.
#[derive(Debug, Error)]
pub enum TagStoreError {
    /// Two registrations claimed the same database identifier.
    #[error("duplicate tag id {0}")]
    DuplicateMotusId(MotusId),
}

/// Arena of all tags known to a foray, real and proxy alike.
///
/// Handles ([`TagKey`]) index this arena and are what every other component
/// stores; tags are never removed, only deactivated, so handles stay valid
/// for the foray's lifetime and across pause/resume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TagStore {
    tags: Vec<Tag>,
    by_motus: FxHashMap<i64, TagKey>,
}

impl TagStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tag and returns its handle.
    pub fn add(&mut self, tag: Tag) -> Result<TagKey, TagStoreError> {
        if self.by_motus.contains_key(&tag.motus_id.0) {
            return Err(TagStoreError::DuplicateMotusId(tag.motus_id));
        }
        let key = TagKey(self.tags.len() as u32);
        self.by_motus.insert(tag.motus_id.0, key);
        self.tags.push(tag);
        Ok(key)
    }

    /// Borrows a tag by handle.
    ///
    /// Handles are only minted by this store, so a miss is a logic error in
    /// the engine; callers treat it as a structural failure.
    #[must_use]
    pub fn tag(&self, key: TagKey) -> &Tag {
        &self.tags[key.0 as usize]
    }

    /// Mutably borrows a tag by handle.
    pub fn tag_mut(&mut self, key: TagKey) -> &mut Tag {
        &mut self.tags[key.0 as usize]
    }

    /// Looks up the handle for a database identifier.
    #[must_use]
    pub fn key_of(&self, id: MotusId) -> Option<TagKey> {
        self.by_motus.get(&id.0).copied()
    }

    /// Number of tags (real + proxy).
    #[must_use]
    pub fn len(&self) -> usize {
        self.tags.len()
    }

    /// Whether the store holds no tags.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Iterates over `(handle, tag)` pairs in registration order.
    pub fn iter(&self) -> impl Iterator<Item = (TagKey, &Tag)> {
        self.tags
            .iter()
            .enumerate()
            .map(|(i, t)| (TagKey(i as u32), t))
    }

    /// The distinct nominal-frequency buckets of all real tags.
    #[must_use]
    pub fn nominal_freqs(&self) -> std::collections::BTreeSet<NominalKhz> {
        self.tags
            .iter()
            .filter(|t| !t.is_proxy())
            .map(Tag::nominal)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn period_is_gap_sum() {
        let t = Tag::new(MotusId(11), 166.38, 4.0, [0.02, 0.025, 0.03, 5.0]);
        assert!((t.period - 5.075).abs() < 1e-12);
        assert_eq!(t.nominal(), NominalKhz(166_380));
    }

    #[test]
    fn store_rejects_duplicate_ids() {
        let mut s = TagStore::new();
        let t = Tag::new(MotusId(11), 166.38, 4.0, [0.02, 0.025, 0.03, 5.0]);
        let k = s.add(t.clone()).unwrap();
        assert_eq!(s.key_of(MotusId(11)), Some(k));
        assert!(s.add(t).is_err());
    }
}
