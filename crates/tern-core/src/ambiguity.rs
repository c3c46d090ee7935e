// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Proxy-tag allocation for sets of indistinguishable tags.
//!
//! When two active tags cannot be told apart at the chosen tolerances, the
//! graph carries a single *proxy* tag with a negative ID in their place, and
//! this manager remembers which real tags the proxy stands for. A proxy that
//! has never produced a detection is still fluid: more tags may join it (or
//! leave it) by mutating the member set in place. The first detection
//! freezes the group — it is persisted to the output database under its
//! negative ID, and any later membership change must allocate a fresh proxy
//! so the recorded meaning of the old ID never shifts.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::filer::{Filer, FilerError};
use crate::ident::{MotusId, TagKey};
use crate::tag::{Tag, TagStore, TagStoreError};

/// Most real tags a single proxy may represent; matches the width of the
/// output database's ambiguity-group table.
pub const MAX_TAGS_PER_AMBIGUITY_GROUP: usize = 6;

/// Ambiguity bookkeeping failures.
#[derive(Debug, Error)]
pub enum AmbiguityError {
    /// A proxy-only operation was invoked on a real tag.
    #[error("tag {0} is not an ambiguity proxy")]
    NotAProxy(MotusId),
    /// A proxy handle is missing from the bimap.
    #[error("proxy {0} is not registered with the ambiguity manager")]
    UnknownProxy(MotusId),
    /// A member-removal named a tag the proxy does not represent.
    #[error("proxy {proxy} does not represent tag {member}")]
    NotAMember {
        /// The proxy named in the request.
        proxy: MotusId,
        /// The tag that is not among its members.
        member: MotusId,
    },
    /// The merged group would exceed the persistable width.
    #[error("ambiguity group would hold {0} tags, more than the persistable limit")]
    GroupTooLarge(usize),
    /// Proxy registration in the tag store failed.
    #[error(transparent)]
    Store(#[from] TagStoreError),
    /// Persisting a detected group failed.
    #[error(transparent)]
    Filer(#[from] FilerError),
}

/// Bimap between sets of indistinguishable real tags and their proxies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ambiguity {
    /// Sorted member list → proxy handle. Frozen (detected) groups are kept
    /// even after being superseded, so a set that resurfaces reuses its
    /// realized ID instead of minting a new one.
    by_members: FxHashMap<Vec<TagKey>, TagKey>,
    /// Proxy handle → sorted member list.
    by_proxy: FxHashMap<TagKey, Vec<TagKey>>,
    /// Member → the proxy currently standing for it in the graph.
    current: FxHashMap<TagKey, TagKey>,
    /// Next negative ID to allocate; strictly decreasing, persisted across
    /// batches so realized group IDs are never reused.
    next_id: i64,
}

impl Ambiguity {
    /// Creates a manager that will allocate proxy IDs downward from
    /// `next_id` (which must be negative).
    #[must_use]
    pub fn new(next_id: i64) -> Self {
        debug_assert!(next_id < 0);
        Self {
            by_members: FxHashMap::default(),
            by_proxy: FxHashMap::default(),
            current: FxHashMap::default(),
            next_id,
        }
    }

    /// The next proxy ID that would be allocated.
    #[must_use]
    pub fn next_id(&self) -> i64 {
        self.next_id
    }

    /// Lowers the allocation floor, e.g. after reading persisted groups.
    pub fn set_next_id(&mut self, next_id: i64) {
        self.next_id = next_id;
    }

    /// The proxy currently representing `tag`, if any.
    #[must_use]
    pub fn proxy_for(&self, tag: TagKey) -> Option<TagKey> {
        self.current.get(&tag).copied()
    }

    /// The member list of `proxy`, if registered.
    #[must_use]
    pub fn members_of(&self, proxy: TagKey) -> Option<&[TagKey]> {
        self.by_proxy.get(&proxy).map(Vec::as_slice)
    }

    /// Returns the proxy representing `first` and `joiner` together.
    ///
    /// `first` may itself be a proxy; if it is undetected it absorbs the
    /// joiner in place and is returned unchanged. Otherwise the union set is
    /// looked up and a new proxy allocated if none covers it yet.
    pub fn join(
        &mut self,
        first: TagKey,
        joiner: TagKey,
        store: &mut TagStore,
    ) -> Result<TagKey, AmbiguityError> {
        let mut members: Vec<TagKey>;
        if store.tag(first).is_proxy() {
            let current = self
                .by_proxy
                .get(&first)
                .ok_or_else(|| AmbiguityError::UnknownProxy(store.tag(first).motus_id))?;
            if current.contains(&joiner) {
                return Ok(first);
            }
            if store.tag(first).count == 0 {
                // undetected: grow the group in place
                let mut grown = current.clone();
                grown.push(joiner);
                grown.sort_unstable();
                if grown.len() > MAX_TAGS_PER_AMBIGUITY_GROUP {
                    return Err(AmbiguityError::GroupTooLarge(grown.len()));
                }
                self.by_members.remove(current);
                self.by_members.insert(grown.clone(), first);
                for &m in &grown {
                    self.current.insert(m, first);
                }
                self.by_proxy.insert(first, grown);
                return Ok(first);
            }
            members = current.clone();
        } else {
            members = vec![first];
        }
        members.push(joiner);
        members.sort_unstable();
        if members.len() > MAX_TAGS_PER_AMBIGUITY_GROUP {
            return Err(AmbiguityError::GroupTooLarge(members.len()));
        }
        if let Some(&proxy) = self.by_members.get(&members) {
            for &m in &members {
                self.current.insert(m, proxy);
            }
            return Ok(proxy);
        }
        let proxy = self.new_proxy(first, None, store)?;
        self.by_members.insert(members.clone(), proxy);
        for &m in &members {
            self.current.insert(m, proxy);
        }
        self.by_proxy.insert(proxy, members);
        Ok(proxy)
    }

    /// Removes `member` from `proxy`'s group and returns the tag that now
    /// stands for the remainder: the surviving real tag when only one is
    /// left, an existing proxy covering the reduced set, the same proxy
    /// mutated in place when undetected, or a freshly allocated proxy.
    pub fn split(
        &mut self,
        proxy: TagKey,
        member: TagKey,
        store: &mut TagStore,
    ) -> Result<TagKey, AmbiguityError> {
        if !store.tag(proxy).is_proxy() {
            return Err(AmbiguityError::NotAProxy(store.tag(proxy).motus_id));
        }
        let current = self
            .by_proxy
            .get(&proxy)
            .ok_or_else(|| AmbiguityError::UnknownProxy(store.tag(proxy).motus_id))?
            .clone();
        if !current.contains(&member) {
            return Err(AmbiguityError::NotAMember {
                proxy: store.tag(proxy).motus_id,
                member: store.tag(member).motus_id,
            });
        }
        let mut reduced = current.clone();
        reduced.retain(|&t| t != member);
        self.current.remove(&member);
        if reduced.len() == 1 {
            // group dissolves: hand back the lone real tag
            self.by_members.remove(&current);
            self.by_proxy.remove(&proxy);
            self.current.remove(&reduced[0]);
            return Ok(reduced[0]);
        }
        if let Some(&existing) = self.by_members.get(&reduced) {
            self.by_members.remove(&current);
            self.by_proxy.remove(&proxy);
            for &m in &reduced {
                self.current.insert(m, existing);
            }
            return Ok(existing);
        }
        if store.tag(proxy).count == 0 {
            self.by_members.remove(&current);
            self.by_members.insert(reduced.clone(), proxy);
            for &m in &reduced {
                self.current.insert(m, proxy);
            }
            self.by_proxy.insert(proxy, reduced);
            return Ok(proxy);
        }
        let fresh = self.new_proxy(proxy, None, store)?;
        self.by_members.remove(&current);
        self.by_proxy.remove(&proxy);
        self.by_members.insert(reduced.clone(), fresh);
        for &m in &reduced {
            self.current.insert(m, fresh);
        }
        self.by_proxy.insert(fresh, reduced);
        Ok(fresh)
    }

    /// Installs a group restored from the output database under its
    /// persisted (already-realized) proxy ID.
    pub fn install_group(
        &mut self,
        members: Vec<TagKey>,
        proxy_id: MotusId,
        store: &mut TagStore,
    ) -> Result<TagKey, AmbiguityError> {
        debug_assert!(proxy_id.is_proxy());
        let template = members.first().copied().ok_or_else(|| {
            AmbiguityError::UnknownProxy(proxy_id)
        })?;
        let proxy = self.new_proxy(template, Some(proxy_id), store)?;
        // restored groups were detected in an earlier batch: frozen. They
        // are historical until a join engages them, so the member → current
        // index is left alone here.
        store.tag_mut(proxy).count = 1;
        let mut members = members;
        members.sort_unstable();
        self.by_members.insert(members.clone(), proxy);
        self.by_proxy.insert(proxy, members);
        Ok(proxy)
    }

    /// First-detection callback: persists the group under its negative ID,
    /// freezing its membership.
    pub fn note_detected(
        &self,
        proxy: TagKey,
        store: &TagStore,
        filer: &mut dyn Filer,
    ) -> Result<(), AmbiguityError> {
        let members = self
            .by_proxy
            .get(&proxy)
            .ok_or_else(|| AmbiguityError::UnknownProxy(store.tag(proxy).motus_id))?;
        let ids: Vec<MotusId> = members.iter().map(|&k| store.tag(k).motus_id).collect();
        filer.save_ambiguity(store.tag(proxy).motus_id, &ids)?;
        Ok(())
    }

    fn new_proxy(
        &mut self,
        template: TagKey,
        preassigned: Option<MotusId>,
        store: &mut TagStore,
    ) -> Result<TagKey, AmbiguityError> {
        let like = store.tag(template).clone();
        let id = match preassigned {
            Some(id) => id,
            None => {
                let id = MotusId(self.next_id);
                self.next_id -= 1;
                id
            }
        };
        let mut proxy = Tag::new(id, like.freq_mhz, like.dfreq_khz, like.gaps);
        proxy.active = true;
        Ok(store.add(proxy)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (TagStore, Vec<TagKey>) {
        let mut store = TagStore::new();
        let mut keys = Vec::new();
        for id in 1..=3 {
            let mut t = Tag::new(MotusId(id), 166.38, 4.0, [0.02, 0.025, 0.03, 5.0]);
            t.active = true;
            keys.push(store.add(t).unwrap());
        }
        (store, keys)
    }

    #[test]
    fn join_two_reals_allocates_descending_ids() {
        let (mut store, keys) = fixture();
        let mut a = Ambiguity::new(-1);
        let p = a.join(keys[0], keys[1], &mut store).unwrap();
        assert_eq!(store.tag(p).motus_id, MotusId(-1));
        assert_eq!(a.members_of(p), Some(&[keys[0], keys[1]][..]));
        assert_eq!(a.proxy_for(keys[0]), Some(p));
        assert_eq!(a.next_id(), -2);
    }

    #[test]
    fn undetected_proxy_grows_in_place() {
        let (mut store, keys) = fixture();
        let mut a = Ambiguity::new(-1);
        let p = a.join(keys[0], keys[1], &mut store).unwrap();
        let p2 = a.join(p, keys[2], &mut store).unwrap();
        assert_eq!(p2, p);
        assert_eq!(a.members_of(p).map(<[TagKey]>::len), Some(3));
    }

    #[test]
    fn detected_proxy_is_frozen() {
        let (mut store, keys) = fixture();
        let mut a = Ambiguity::new(-1);
        let p = a.join(keys[0], keys[1], &mut store).unwrap();
        store.tag_mut(p).count = 1;
        let p2 = a.join(p, keys[2], &mut store).unwrap();
        assert_ne!(p2, p);
        assert_eq!(store.tag(p2).motus_id, MotusId(-2));
        assert_eq!(a.members_of(p2).map(<[TagKey]>::len), Some(3));
        // the old group is still registered under the old proxy
        assert_eq!(a.members_of(p).map(<[TagKey]>::len), Some(2));
    }

    #[test]
    fn split_to_singleton_returns_the_real_tag() {
        let (mut store, keys) = fixture();
        let mut a = Ambiguity::new(-1);
        let p = a.join(keys[0], keys[1], &mut store).unwrap();
        let rep = a.split(p, keys[1], &mut store).unwrap();
        assert_eq!(rep, keys[0]);
        assert!(a.members_of(p).is_none());
        assert_eq!(a.proxy_for(keys[0]), None);
    }

    #[test]
    fn split_on_real_tag_is_an_error() {
        let (mut store, keys) = fixture();
        let mut a = Ambiguity::new(-1);
        assert!(a.split(keys[0], keys[1], &mut store).is_err());
    }
}
