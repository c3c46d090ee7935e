// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Time-ordered tag activation events, consumed in lockstep with the pulse
//! clock.

use serde::{Deserialize, Serialize};

use crate::ident::{TagKey, Timestamp};

/// What happens to a tag at an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TagEvent {
    /// The tag becomes active and is woven into its frequency's graph.
    Activate,
    /// The tag becomes inactive and is removed from its frequency's graph.
    Deactivate,
}

/// One timeline entry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// When the event takes effect.
    pub ts: Timestamp,
    /// Which tag it concerns.
    pub tag: TagKey,
    /// What happens.
    pub kind: TagEvent,
}

/// Sorted event sequence with a cursor.
///
/// The conductor drains all events with `ts ≤ t` before routing a pulse
/// timestamped `t`, so a pulse always sees the graph state implied by every
/// earlier event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventTimeline {
    events: Vec<Event>,
    cursor: usize,
}

impl EventTimeline {
    /// Creates an empty timeline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an event. Call [`Self::finish`] after the last push.
    pub fn push(&mut self, ts: Timestamp, tag: TagKey, kind: TagEvent) {
        self.events.push(Event { ts, tag, kind });
    }

    /// Sorts the timeline by timestamp (stable, so same-instant events keep
    /// insertion order).
    pub fn finish(&mut self) {
        self.events.sort_by(|a, b| a.ts.total_cmp(&b.ts));
    }

    /// Timestamp of the next unconsumed event, or `+∞` when drained.
    #[must_use]
    pub fn next_ts(&self) -> Timestamp {
        self.events
            .get(self.cursor)
            .map_or(f64::INFINITY, |e| e.ts)
    }

    /// Consumes and returns the next event, if any.
    pub fn pop(&mut self) -> Option<Event> {
        let e = self.events.get(self.cursor).copied()?;
        self.cursor += 1;
        Some(e)
    }

    /// Events remaining.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.events.len() - self.cursor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_in_timestamp_order() {
        let mut tl = EventTimeline::new();
        tl.push(20.0, TagKey(1), TagEvent::Deactivate);
        tl.push(10.0, TagKey(1), TagEvent::Activate);
        tl.push(15.0, TagKey(2), TagEvent::Activate);
        tl.finish();
        assert_eq!(tl.next_ts(), 10.0);
        assert_eq!(tl.pop().map(|e| e.ts), Some(10.0));
        assert_eq!(tl.pop().map(|e| e.tag), Some(TagKey(2)));
        assert_eq!(tl.pop().map(|e| e.kind), Some(TagEvent::Deactivate));
        assert!(tl.pop().is_none());
        assert_eq!(tl.next_ts(), f64::INFINITY);
    }
}
