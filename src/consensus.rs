//! Weighted winner-take-all consensus over the strategy roster.
//!
//! Each cycle every strategy votes on the same snapshot. A voter that errors
//! is downgraded to HOLD; a quarantined or kill-switched voter is recorded
//! at weight zero and excluded from the tallies. The best-scoring directional
//! candidate wins outright, then a synergy filter decides whether its squad
//! is allowed to act on the evidence it has.

use crate::logging::{self, obj, v_str, Domain, Level};
use crate::signal::{Direction, GateReason, MarketSnapshot, Vote};
use crate::strategies::{Registry, Squad};
use crate::weights::WeightStore;
use std::sync::Arc;

const SCORE_BOOST_THRESHOLD: f64 = 1.5;
const SCORE_BOOST: f64 = 1.2;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DirTotals {
    pub buy: f64,
    pub sell: f64,
    pub hold: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirCounts {
    pub buy: u32,
    pub sell: u32,
    pub hold: u32,
}

impl DirCounts {
    fn for_dir(&self, dir: Direction) -> u32 {
        match dir {
            Direction::Buy => self.buy,
            Direction::Sell => self.sell,
            Direction::Hold => self.hold,
        }
    }
}

/// One cycle's outcome, with enough detail to audit the decision.
#[derive(Debug, Clone)]
pub struct Consensus {
    pub direction: Direction,
    pub confidence: f64,
    pub votes: Vec<Vote>,
    pub totals: DirTotals,
    pub counts: DirCounts,
    pub top_strategy: Option<String>,
    pub top_score: f64,
    pub reason: Option<GateReason>,
}

impl Consensus {
    fn hold(votes: Vec<Vote>, totals: DirTotals, counts: DirCounts, reason: Option<GateReason>) -> Self {
        Self {
            direction: Direction::Hold,
            confidence: 0.0,
            votes,
            totals,
            counts,
            top_strategy: None,
            top_score: 0.0,
            reason,
        }
    }
}

pub struct ConsensusAggregator {
    registry: Registry,
    weights: Arc<WeightStore>,
}

impl ConsensusAggregator {
    pub fn new(registry: Registry, weights: Arc<WeightStore>) -> Self {
        Self { registry, weights }
    }

    pub fn weights(&self) -> &Arc<WeightStore> {
        &self.weights
    }

    pub fn get_consensus(&self, snap: &MarketSnapshot) -> Consensus {
        let mut votes = Vec::with_capacity(self.registry.len());
        let mut totals = DirTotals::default();
        let mut counts = DirCounts::default();
        let mut total_weight = 0.0;

        // Best directional candidate so far; strict improvement only, so a
        // tie keeps the earlier roster entry and the outcome is stable.
        let mut best: Option<(String, Squad, Direction, f64, f64)> = None;

        for entry in self.registry.iter() {
            let status = self.weights.status(entry.name);
            if status.excluded() {
                // A benched voter still gets its view on the audit trail,
                // at zero weight and outside the tallies.
                let direction = entry.strategy.vote(snap).unwrap_or(Direction::Hold);
                votes.push(Vote { strategy: entry.name.to_string(), direction, weight: 0.0, status });
                continue;
            }

            let direction = match entry.strategy.vote(snap) {
                Ok(d) => d,
                Err(err) => {
                    // Fault isolation: one broken voter never sinks the cycle.
                    logging::log(
                        Level::Warn,
                        Domain::Consensus,
                        "voter_fault",
                        obj(&[
                            ("strategy", v_str(entry.name)),
                            ("symbol", v_str(&snap.symbol)),
                            ("error", v_str(&err.to_string())),
                        ]),
                    );
                    Direction::Hold
                }
            };

            let weight = self.weights.weight(entry.name);
            total_weight += weight;
            match direction {
                Direction::Buy => {
                    totals.buy += weight;
                    counts.buy += 1;
                }
                Direction::Sell => {
                    totals.sell += weight;
                    counts.sell += 1;
                }
                Direction::Hold => {
                    totals.hold += weight;
                    counts.hold += 1;
                }
            }

            if direction.is_actionable() {
                let score = self.weights.performance_score(entry.name).unwrap_or(weight);
                if best.as_ref().map_or(true, |(_, _, _, _, s)| score > *s) {
                    best = Some((entry.name.to_string(), entry.squad, direction, weight, score));
                }
            }

            votes.push(Vote { strategy: entry.name.to_string(), direction, weight, status });
        }

        let Some((top_name, squad, direction, weight, score)) = best else {
            return Consensus::hold(votes, totals, counts, None);
        };

        if !self.synergy_ok(squad, direction, &counts) {
            logging::log(
                Level::Debug,
                Domain::Consensus,
                "filtered",
                obj(&[
                    ("symbol", v_str(&snap.symbol)),
                    ("strategy", v_str(&top_name)),
                    ("squad", v_str(squad.as_str())),
                    ("direction", v_str(direction.as_str())),
                ]),
            );
            return Consensus::hold(votes, totals, counts, Some(GateReason::FilteredSynergy));
        }

        let boost = if score > SCORE_BOOST_THRESHOLD { SCORE_BOOST } else { 1.0 };
        let confidence = if total_weight > 0.0 {
            (weight / total_weight * boost).clamp(0.0, 1.0)
        } else {
            boost
        };

        logging::log_consensus(&snap.symbol, direction.as_str(), confidence, &top_name);

        Consensus {
            direction,
            confidence,
            votes,
            totals,
            counts,
            top_strategy: Some(top_name),
            top_score: score,
            reason: None,
        }
    }

    /// A precision sniper acts alone. Anyone else needs a second opinion,
    /// except the macro desk, whose own vote already counts as one.
    fn synergy_ok(&self, squad: Squad, direction: Direction, counts: &DirCounts) -> bool {
        match squad {
            Squad::Precision => true,
            Squad::Macro => counts.for_dir(direction) >= 1,
            Squad::Trend | Squad::Reversion => counts.for_dir(direction) >= 2,
        }
    }
}
