// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! tern-core: deterministic recognition of coded-VHF tag bursts in a
//! timestamped pulse stream.
//!
//! The engine walks an incrementally maintained automaton (the gap graph)
//! whose states are hash-consed sets of `(tag, phase)` pairs, tracking many
//! parallel candidates across the live stream, resolving indistinguishable
//! tags through proxy IDs, and emitting run-structured detections through a
//! pluggable output filer. Everything is single-threaded and batch-shaped:
//! one conductor, one advancing clock, no suspension points.
#![forbid(unsafe_code)]

mod ambiguity;
mod bounded_range;
mod candidate;
mod clock_pinner;
mod clock_repair;
mod filer;
mod finder;
mod foray;
mod freq;
mod gap_range;
mod gps_validator;
mod graph;
mod ident;
mod node;
mod params;
mod pulse;
mod record;
mod set;
mod source;
mod tag;
mod timeline;

/// Proxy-tag management for indistinguishable tag sets.
pub use ambiguity::{Ambiguity, AmbiguityError, MAX_TAGS_PER_AMBIGUITY_GROUP};
/// Width-bounded observation envelope.
pub use bounded_range::BoundedRange;
/// Candidate walkers and their resolution levels.
pub use candidate::{IdLevel, TagCandidate};
/// Clock-offset estimation.
pub use clock_pinner::{ClockPinner, TsKind};
/// Timestamp repair filter and era constants.
pub use clock_repair::{ClockRepair, Disposition, TS_BOOT_EPOCH, TS_VALID_EPOCH};
/// Output boundary: trait, row types, and the in-memory implementation.
pub use filer::{Filer, FilerError, Hit, MemoryFiler, RunRow, TimeFixKind};
/// Pulse dispatch across candidate tiers.
pub use finder::{FinderCx, FinderSlot, RateLimitingTagFinder, TagFinder};
/// The conductor and its errors.
pub use foray::{Foray, ForayError, STATE_FORMAT_VERSION};
/// Port frequency settings.
pub use freq::{closest_nominal, FreqSetting};
/// Tolerance intervals around registered gaps.
pub use gap_range::{chunk_down, chunk_up, GapRange, GapRanges};
/// Stuck-GPS detection.
pub use gps_validator::GpsValidator;
/// The recognition automaton.
pub use graph::{GapGraph, GraphError, RenamePair};
/// Identifier newtypes and core aliases.
pub use ident::{
    BatchId, Gap, GapKey, MotusId, NodeIx, NominalKhz, Phase, Port, RunId, SeqNo, TagKey,
    Timestamp, PULSES_PER_BURST,
};
/// Graph vertices.
pub use node::Node;
/// Recognition parameters.
pub use params::Params;
/// Pulse detections.
pub use pulse::Pulse;
/// Raw input records.
pub use record::{RawRecord, RecordParseError};
/// Hash-consed state labels.
pub use set::{DuplicateTagPhase, TagPhase, TagPhaseSet};
/// Input boundary.
pub use source::{RecordSource, VecSource};
/// Registered tags.
pub use tag::{Tag, TagStore, TagStoreError};
/// Tag activation timeline.
pub use timeline::{Event, EventTimeline, TagEvent};
