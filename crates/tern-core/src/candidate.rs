// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! A candidate: one walker over the gap graph, accumulating the pulses it
//! has accepted and looking for full bursts from a single tag.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::ambiguity::Ambiguity;
use crate::bounded_range::BoundedRange;
use crate::filer::{Filer, Hit};
use crate::foray::ForayError;
use crate::graph::GapGraph;
use crate::ident::{BatchId, Gap, NodeIx, Port, RunId, TagKey, Timestamp, PULSES_PER_BURST};
use crate::params::Params;
use crate::pulse::Pulse;

/// How well-resolved a candidate's tag identity is. Order matters: lower
/// values claim pulses first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IdLevel {
    /// Exactly one tag fits and enough pulses have been seen to commit.
    Confirmed = 0,
    /// Exactly one tag fits, not yet enough pulses.
    Single = 1,
    /// More than one tag is still compatible.
    Multiple = 2,
}

/// A walker over the gap graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagCandidate {
    /// Current automaton state, pinned in the graph arena.
    state: NodeIx,
    /// Accepted pulses, oldest first.
    pulses: VecDeque<Pulse>,
    /// Timestamp of the most recently accepted pulse.
    last_ts: Timestamp,
    /// Timestamp of the last pulse of the last emitted burst; anchors the
    /// burst-slop measurement for the next one.
    last_dumped_ts: Option<Timestamp>,
    /// Resolved tag once the walk narrows to one.
    tag: Option<TagKey>,
    /// Resolution level.
    level: IdLevel,
    /// Open run, once the first burst has been emitted.
    run_id: Option<RunId>,
    /// Bursts emitted into the open run.
    hit_count: u32,
    /// Offset-frequency envelope, maintained across the whole candidate.
    freq_range: BoundedRange,
    /// Signal envelope, reset at each burst boundary since antenna
    /// orientation shifts between bursts.
    sig_range: BoundedRange,
}

impl TagCandidate {
    /// Starts a walker at `state` (normally the root) holding its first
    /// pulse. Pins the state.
    #[must_use]
    pub fn start(graph: &mut GapGraph, state: NodeIx, pulse: Pulse, params: &Params) -> Self {
        graph.pin(state);
        let mut pulses = VecDeque::new();
        pulses.push_back(pulse);
        Self {
            state,
            pulses,
            last_ts: pulse.ts,
            last_dumped_ts: None,
            tag: None,
            level: IdLevel::Multiple,
            run_id: None,
            hit_count: 0,
            freq_range: BoundedRange::seeded(params.freq_slop_khz, pulse.dfreq),
            sig_range: BoundedRange::seeded(params.sig_slop_db, pulse.sig),
        }
    }

    /// Clones this walker (the "did not accept that pulse" branch), taking
    /// an extra pin on the shared state.
    #[must_use]
    pub fn fork(&self, graph: &mut GapGraph) -> Self {
        graph.pin(self.state);
        self.clone()
    }

    /// The candidate's resolution level.
    #[must_use]
    pub fn level(&self) -> IdLevel {
        self.level
    }

    /// Whether the identity is confirmed.
    #[must_use]
    pub fn is_confirmed(&self) -> bool {
        self.level == IdLevel::Confirmed
    }

    /// The resolved tag, if any.
    #[must_use]
    pub fn tag(&self) -> Option<TagKey> {
        self.tag
    }

    /// The open run, if any.
    #[must_use]
    pub fn run_id(&self) -> Option<RunId> {
        self.run_id
    }

    /// Timestamp of the last accepted pulse.
    #[must_use]
    pub fn last_ts(&self) -> Timestamp {
        self.last_ts
    }

    /// A candidate expires when its state has been severed from the graph
    /// (its tag was deactivated) or when more time has passed than the
    /// largest gap its state could ever accept.
    #[must_use]
    pub fn expired(&self, graph: &GapGraph, now: Timestamp) -> bool {
        if !graph.is_valid(self.state) {
            return true;
        }
        now - self.last_ts > graph.node(self.state).max_age()
    }

    /// Whether one more accepted pulse would confirm the identity.
    #[must_use]
    pub fn next_pulse_confirms(&self, params: &Params) -> bool {
        self.level == IdLevel::Single && self.pulses.len() + 1 >= params.pulses_to_confirm_id
    }

    /// Whether a full burst is buffered and ready to emit.
    #[must_use]
    pub fn has_burst(&self) -> bool {
        self.pulses.len() >= PULSES_PER_BURST
    }

    /// Tries to advance the automaton with `p`: the pulse must sit inside
    /// the candidate's frequency and signal envelopes, and the gap since the
    /// last accepted pulse must have an edge out of the current state.
    #[must_use]
    pub fn advance_by_pulse(&self, graph: &GapGraph, p: &Pulse) -> Option<NodeIx> {
        if !(self.freq_range.is_compatible(p.dfreq) && self.sig_range.is_compatible(p.sig)) {
            return None;
        }
        graph.advance(self.state, p.ts - self.last_ts)
    }

    /// Accepts `p`, moving to `new_state`. Returns `true` when this pulse
    /// promoted the candidate to [`IdLevel::Confirmed`].
    pub fn add_pulse(
        &mut self,
        graph: &mut GapGraph,
        params: &Params,
        p: Pulse,
        new_state: NodeIx,
    ) -> bool {
        self.pulses.push_back(p);
        self.last_ts = p.ts;
        self.freq_range.extend_by(p.dfreq);
        if graph.node(new_state).completes_burst() {
            self.sig_range.clear();
        } else {
            self.sig_range.extend_by(p.sig);
        }
        graph.pin(new_state);
        graph.unpin(self.state);
        self.state = new_state;

        match self.level {
            IdLevel::Multiple => {
                if graph.node(self.state).is_unique() {
                    self.tag = graph.node(self.state).tag();
                    self.level = IdLevel::Single;
                }
                false
            }
            IdLevel::Single => {
                if self.pulses.len() >= params.pulses_to_confirm_id {
                    self.level = IdLevel::Confirmed;
                    true
                } else {
                    false
                }
            }
            IdLevel::Confirmed => false,
        }
    }

    /// Whether both candidates have resolved to the same tag.
    #[must_use]
    pub fn has_same_tag_as(&self, other: &Self) -> bool {
        self.tag.is_some() && self.tag == other.tag
    }

    /// Whether any accepted pulse is shared with `other`.
    #[must_use]
    pub fn shares_any_pulses(&self, other: &Self) -> bool {
        // both buffers are in ascending sequence order
        let mut a = self.pulses.iter().map(|p| p.seq_no).peekable();
        let mut b = other.pulses.iter().map(|p| p.seq_no).peekable();
        while let (Some(&x), Some(&y)) = (a.peek(), b.peek()) {
            match x.cmp(&y) {
                core::cmp::Ordering::Less => {
                    a.next();
                }
                core::cmp::Ordering::Greater => {
                    b.next();
                }
                core::cmp::Ordering::Equal => return true,
            }
        }
        false
    }

    /// Burst statistics over the oldest buffered burst. Advances the
    /// burst-slop anchor.
    fn burst_params(&mut self, gaps: &[Gap; PULSES_PER_BURST], period: Gap) -> Hit {
        let n = PULSES_PER_BURST;
        let mut sig_sum = 0.0f64;
        let mut sig_sum_sq = 0.0f64;
        let mut noise_sum = 0.0f64;
        let mut freq_sum = 0.0f64;
        let mut freq_sum_sq = 0.0f64;
        let mut slop = 0.0f64;
        let mut prev_ts = 0.0f64;

        let first_ts = self.pulses.front().map_or(0.0, |p| p.ts);
        let burst_slop = self.last_dumped_ts.map_or(0.0, |prev| {
            let g = first_ts - prev;
            g % period - gaps[n - 1]
        });

        for (i, p) in self.pulses.iter().take(n).enumerate() {
            let lin = 10.0f64.powf(p.sig / 10.0);
            sig_sum += lin;
            sig_sum_sq += lin * lin;
            noise_sum += 10.0f64.powf(p.noise / 10.0);
            freq_sum += p.dfreq;
            freq_sum_sq += p.dfreq * p.dfreq;
            if i > 0 {
                slop += ((p.ts - prev_ts) - gaps[i - 1]).abs();
            }
            prev_ts = p.ts;
        }
        self.last_dumped_ts = Some(prev_ts);

        let nf = n as f64;
        let sig_radicand = nf * sig_sum_sq - sig_sum * sig_sum;
        let sig_sd = if sig_radicand > 0.0 {
            (sig_radicand / (nf * (nf - 1.0))).sqrt() / (sig_sum / nf) * 100.0
        } else {
            0.0
        };
        let freq_radicand = nf * freq_sum_sq - freq_sum * freq_sum;
        let freq_sd = if freq_radicand > 0.0 {
            (freq_radicand / (nf * (nf - 1.0))).sqrt()
        } else {
            0.0
        };
        Hit {
            ts: first_ts,
            sig: 10.0 * (sig_sum / nf).log10(),
            sig_sd,
            noise: 10.0 * (noise_sum / nf).log10(),
            freq: freq_sum / nf,
            freq_sd,
            slop,
            burst_slop,
        }
    }

    /// Emits every complete buffered burst into this candidate's run,
    /// opening the run (and realizing a first-detected ambiguity proxy) as
    /// needed.
    pub fn dump_bursts(
        &mut self,
        store: &mut crate::tag::TagStore,
        ambig: &Ambiguity,
        filer: &mut dyn Filer,
        batch: BatchId,
        ant: Port,
    ) -> Result<(), ForayError> {
        let Some(tag_key) = self.tag else {
            return Ok(());
        };
        while self.pulses.len() >= PULSES_PER_BURST {
            let (gaps, period, motus_id, is_proxy, seen) = {
                let t = store.tag(tag_key);
                (t.gaps, t.period, t.motus_id, t.is_proxy(), t.count)
            };
            let first_ts = self.pulses.front().map_or(self.last_ts, |p| p.ts);
            if self.run_id.is_none() {
                self.run_id = Some(filer.begin_run(batch, motus_id, ant, first_ts)?);
            }
            if is_proxy && seen == 0 {
                // first detection realizes the group under its negative ID
                ambig.note_detected(tag_key, store, filer)?;
            }
            let hit = self.burst_params(&gaps, period);
            if let Some(run) = self.run_id {
                filer.add_hit(run, &hit)?;
            }
            self.hit_count += 1;
            store.tag_mut(tag_key).count += 1;
            self.pulses.drain(..PULSES_PER_BURST);
        }
        Ok(())
    }

    /// Repoints a candidate whose tag was superseded (ambiguity changed
    /// while it was in flight). The current run is closed; the next burst
    /// opens a fresh run under the new identity.
    pub fn ren_tag(
        &mut self,
        from: TagKey,
        to: TagKey,
        filer: &mut dyn Filer,
    ) -> Result<(), ForayError> {
        if self.tag == Some(from) {
            self.tag = Some(to);
            if let Some(run) = self.run_id.take() {
                filer.end_run(run, self.hit_count, self.last_ts)?;
                self.hit_count = 0;
            }
        }
        Ok(())
    }

    /// Ends the candidate: closes its run, if open, and releases its state
    /// pin. Must be called on every removal path.
    pub fn finish(&mut self, graph: &mut GapGraph, filer: &mut dyn Filer) -> Result<(), ForayError> {
        if let Some(run) = self.run_id.take() {
            filer.end_run(run, self.hit_count, self.last_ts)?;
        }
        graph.unpin(self.state);
        Ok(())
    }
}
