// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Per-(port, frequency) candidate management: routes each pulse through the
//! live candidates in priority order, forks sub-confirmed candidates, kills
//! losers when one confirms, and reaps the expired.

use serde::{Deserialize, Serialize};

use crate::ambiguity::Ambiguity;
use crate::candidate::TagCandidate;
use crate::filer::Filer;
use crate::foray::ForayError;
use crate::graph::GapGraph;
use crate::ident::{BatchId, NodeIx, NominalKhz, Port, TagKey, Timestamp};
use crate::params::Params;
use crate::pulse::Pulse;
use crate::tag::TagStore;

const TIER_CONFIRMED: usize = 0;
const TIER_SINGLE: usize = 1;
const TIER_MULTIPLE: usize = 2;

/// Shared mutable context for one pulse-dispatch call.
pub struct FinderCx<'a> {
    /// The graph for this finder's nominal frequency.
    pub graph: &'a mut GapGraph,
    /// All registered tags.
    pub store: &'a mut TagStore,
    /// Ambiguity manager for this foray.
    pub ambig: &'a Ambiguity,
    /// Output sink.
    pub filer: &'a mut dyn Filer,
    /// Recognition parameters.
    pub params: &'a Params,
    /// Current output batch.
    pub batch: BatchId,
}

/// Candidate collection for one `(antenna port, nominal frequency)` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagFinder {
    nom_freq: NominalKhz,
    ant: Port,
    /// Candidate tiers: confirmed, single, multiple. Within a tier,
    /// insertion order; across tiers, confirmed candidates get first claim
    /// on every pulse.
    cands: [Vec<TagCandidate>; 3],
    last_reap: Timestamp,
}

impl TagFinder {
    /// Creates an empty finder.
    #[must_use]
    pub fn new(nom_freq: NominalKhz, ant: Port) -> Self {
        Self {
            nom_freq,
            ant,
            cands: [Vec::new(), Vec::new(), Vec::new()],
            last_reap: 0.0,
        }
    }

    /// The nominal frequency this finder listens on.
    #[must_use]
    pub fn nominal(&self) -> NominalKhz {
        self.nom_freq
    }

    /// Live candidates across all tiers.
    #[must_use]
    pub fn candidate_count(&self) -> usize {
        self.cands.iter().map(Vec::len).sum()
    }

    /// Routes one pulse.
    ///
    /// Tiers are visited confirmed-first so established runs claim their
    /// pulses before speculative walkers. A sub-confirmed candidate that
    /// accepts a pulse which does not confirm it is forked first, keeping
    /// the no-accept branch alive in case the pulse was noise. The moment a
    /// candidate confirms, every unconfirmed candidate sharing a pulse with
    /// it (or resolved to the same tag) is destroyed. If no confirmed
    /// candidate claimed the pulse, a fresh walker starts at the root.
    pub fn process(&mut self, p: &Pulse, cx: &mut FinderCx<'_>) -> Result<(), ForayError> {
        let mut confirmed_acceptance = false;

        'tiers: for tier in 0..3 {
            let mut clones: Vec<TagCandidate> = Vec::new();
            let mut i = 0;
            while i < self.cands[tier].len() {
                if self.cands[tier][i].expired(cx.graph, p.ts) {
                    let mut dead = self.cands[tier].remove(i);
                    dead.finish(cx.graph, cx.filer)?;
                    continue;
                }
                let Some(next_state) = self.cands[tier][i].advance_by_pulse(cx.graph, p) else {
                    i += 1;
                    continue;
                };
                if !self.cands[tier][i].is_confirmed()
                    && !self.cands[tier][i].next_pulse_confirms(cx.params)
                {
                    clones.push(self.cands[tier][i].fork(cx.graph));
                }
                let promoted = self.cands[tier][i].add_pulse(cx.graph, cx.params, *p, next_state);
                if promoted {
                    let mut winner = self.cands[tier].remove(i);
                    self.kill_competitors(&winner, cx)?;
                    winner.dump_bursts(cx.store, cx.ambig, cx.filer, cx.batch, self.ant)?;
                    self.cands[TIER_CONFIRMED].push(winner);
                    self.cands[tier].append(&mut clones);
                    confirmed_acceptance = true;
                    break 'tiers;
                }
                if self.cands[tier][i].is_confirmed() {
                    self.cands[tier][i].dump_bursts(
                        cx.store, cx.ambig, cx.filer, cx.batch, self.ant,
                    )?;
                    self.cands[tier].append(&mut clones);
                    confirmed_acceptance = true;
                    break 'tiers;
                }
                i += 1;
            }
            self.cands[tier].append(&mut clones);
        }

        if !confirmed_acceptance {
            self.cands[TIER_MULTIPLE].push(TagCandidate::start(
                cx.graph,
                NodeIx::ROOT,
                *p,
                cx.params,
            ));
        }
        self.settle_tiers();
        Ok(())
    }

    /// Moves candidates whose level changed into the right tier. Forked
    /// clones inherit their parent's tier at creation; a clone that later
    /// resolves is re-tiered here.
    fn settle_tiers(&mut self) {
        for tier in [TIER_SINGLE, TIER_MULTIPLE] {
            let mut i = 0;
            while i < self.cands[tier].len() {
                let level = self.cands[tier][i].level() as usize;
                if level != tier {
                    let c = self.cands[tier].remove(i);
                    self.cands[level].push(c);
                } else {
                    i += 1;
                }
            }
        }
    }

    fn kill_competitors(
        &mut self,
        winner: &TagCandidate,
        cx: &mut FinderCx<'_>,
    ) -> Result<(), ForayError> {
        for tier in [TIER_SINGLE, TIER_MULTIPLE] {
            let mut i = 0;
            while i < self.cands[tier].len() {
                let loser = &self.cands[tier][i];
                if loser.has_same_tag_as(winner) || loser.shares_any_pulses(winner) {
                    let mut dead = self.cands[tier].remove(i);
                    dead.finish(cx.graph, cx.filer)?;
                } else {
                    i += 1;
                }
            }
        }
        Ok(())
    }

    /// Destroys every candidate that has expired by `now`, closing runs.
    /// Used at batch boundaries and when a pulse stream goes quiet.
    pub fn reap(
        &mut self,
        now: Timestamp,
        graph: &mut GapGraph,
        filer: &mut dyn Filer,
    ) -> Result<(), ForayError> {
        for tier in 0..3 {
            let mut i = 0;
            while i < self.cands[tier].len() {
                if self.cands[tier][i].expired(graph, now) {
                    let mut dead = self.cands[tier].remove(i);
                    dead.finish(graph, filer)?;
                } else {
                    i += 1;
                }
            }
        }
        self.last_reap = now;
        Ok(())
    }

    /// Repoints in-flight candidates after an ambiguity rename.
    pub fn rename_tag(
        &mut self,
        from: TagKey,
        to: TagKey,
        filer: &mut dyn Filer,
    ) -> Result<(), ForayError> {
        for tier in &mut self.cands {
            for c in tier.iter_mut() {
                c.ren_tag(from, to, filer)?;
            }
        }
        Ok(())
    }
}

/// A finder with a rate-limiting front buffer.
///
/// Pulses are held until the buffer spans the rate window. If the windowed
/// rate stays at or below the limit, pulses drain into the inner finder;
/// otherwise the window is noise (or a receiver fault) and is discarded,
/// leaving at most one bogus marker per `min_bogus_spacing` seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingTagFinder {
    inner: TagFinder,
    window: std::collections::VecDeque<Pulse>,
    last_bogus_ts: Timestamp,
}

impl RateLimitingTagFinder {
    /// Wraps `inner` with a rate limiter.
    #[must_use]
    pub fn new(inner: TagFinder, params: &Params) -> Self {
        Self {
            inner,
            window: std::collections::VecDeque::new(),
            last_bogus_ts: -params.min_bogus_spacing,
        }
    }

    /// Routes one pulse through the rate gate.
    pub fn process(&mut self, p: &Pulse, cx: &mut FinderCx<'_>) -> Result<(), ForayError> {
        self.window.push_back(*p);
        self.drain(false, cx)
    }

    /// Flushes the buffer at end of input or batch.
    pub fn flush(&mut self, cx: &mut FinderCx<'_>) -> Result<(), ForayError> {
        self.drain(true, cx)
    }

    fn drain(&mut self, at_end: bool, cx: &mut FinderCx<'_>) -> Result<(), ForayError> {
        while self.window.len() > 1 {
            let first = match self.window.front() {
                Some(p) => *p,
                None => break,
            };
            let last_ts = self.window.back().map_or(first.ts, |p| p.ts);
            let elapsed = last_ts - first.ts;
            if elapsed < cx.params.pulse_rate_window && !at_end {
                break;
            }
            let rate = if elapsed > 0.0 {
                (self.window.len() - 1) as f64 / elapsed
            } else {
                f64::INFINITY
            };
            self.window.pop_front();
            if rate <= cx.params.max_pulse_rate {
                self.inner.process(&first, cx)?;
            } else if !at_end && first.ts - self.last_bogus_ts >= cx.params.min_bogus_spacing {
                self.last_bogus_ts = first.ts;
                cx.filer.add_bogus_burst(
                    first.ts,
                    self.inner.ant,
                    first.ant_freq,
                    first.sig,
                    first.noise,
                )?;
            }
        }
        if at_end {
            if let Some(last) = self.window.pop_front() {
                self.inner.process(&last, cx)?;
            }
        }
        Ok(())
    }
}

/// Either finder flavor, chosen by whether rate limiting is enabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FinderSlot {
    /// Direct dispatch.
    Plain(TagFinder),
    /// Rate-gated dispatch.
    RateLimited(RateLimitingTagFinder),
}

impl FinderSlot {
    /// Builds the right flavor for the parameters.
    #[must_use]
    pub fn build(nom_freq: NominalKhz, ant: Port, params: &Params) -> Self {
        let inner = TagFinder::new(nom_freq, ant);
        if params.max_pulse_rate > 0.0 {
            Self::RateLimited(RateLimitingTagFinder::new(inner, params))
        } else {
            Self::Plain(inner)
        }
    }

    /// Routes one pulse.
    pub fn process(&mut self, p: &Pulse, cx: &mut FinderCx<'_>) -> Result<(), ForayError> {
        match self {
            Self::Plain(f) => f.process(p, cx),
            Self::RateLimited(f) => f.process(p, cx),
        }
    }

    /// Reaps expired candidates, flushing any rate-limiter backlog first.
    pub fn reap(
        &mut self,
        now: Timestamp,
        cx: &mut FinderCx<'_>,
    ) -> Result<(), ForayError> {
        match self {
            Self::Plain(f) => f.reap(now, cx.graph, cx.filer),
            Self::RateLimited(f) => {
                f.flush(cx)?;
                f.inner.reap(now, cx.graph, cx.filer)
            }
        }
    }

    /// Repoints in-flight candidates after an ambiguity rename.
    pub fn rename_tag(
        &mut self,
        from: TagKey,
        to: TagKey,
        filer: &mut dyn Filer,
    ) -> Result<(), ForayError> {
        match self {
            Self::Plain(f) => f.rename_tag(from, to, filer),
            Self::RateLimited(f) => f.inner.rename_tag(from, to, filer),
        }
    }

    /// The finder's nominal frequency.
    #[must_use]
    pub fn nominal(&self) -> NominalKhz {
        match self {
            Self::Plain(f) => f.nominal(),
            Self::RateLimited(f) => f.inner.nominal(),
        }
    }
}
