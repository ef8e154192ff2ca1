//! Ticket decision layer: archetype-constrained candidate generation,
//! decision-intelligence evaluation, and portfolio selection.

pub mod archetype;
pub mod evaluator;
pub mod generator;
pub mod portfolio;

use crate::model::{MarketOdds, Outcome, ProbTriple};
use crate::pipeline::prob_sets::SetKey;
use crate::pipeline::FixturePrediction;

/// Version tag stamped on every decision this layer emits.
pub const DECISION_VERSION: &str = "UDS_v1";

/// Expected value of a pick at probability `p` and decimal odds `o`:
/// `p(o-1) - (1-p)`.
pub fn expected_value(p: f64, odds: f64) -> f64 {
    p * (odds - 1.0) - (1.0 - p)
}

/// The decision layer's per-fixture view: the target probability set plus
/// the structural facts the archetype predicates and the evaluator need.
#[derive(Debug, Clone, Copy)]
pub struct SlateFixture {
    pub fixture_id: i64,
    /// Probabilities of the requested set.
    pub probs: ProbTriple,
    /// Set B probabilities, when derivable (market present).
    pub set_b: Option<ProbTriple>,
    /// Margin-removed market probabilities.
    pub market: Option<ProbTriple>,
    /// Closing odds; evaluator falls back to the import defaults when the
    /// bookmaker never quoted the fixture.
    pub odds: Option<MarketOdds>,
    pub dc_applied: bool,
    pub xg_home: f64,
    pub xg_away: f64,
    pub xg_confidence: f64,
}

impl SlateFixture {
    /// Build the decision view from a pipeline prediction for a target
    /// set. `None` when the requested set is not derivable for this
    /// fixture (market-dependent set without odds).
    pub fn from_prediction(pred: &FixturePrediction, set: SetKey) -> Option<Self> {
        let target = pred.sets.get(set)?;
        let set_b = pred.sets.get(SetKey::B).map(|s| s.probs);
        let market = pred
            .fixture
            .odds
            .map(|o| crate::pipeline::blend::market_probs(o).probs);
        Some(Self {
            fixture_id: pred.fixture.fixture_id,
            probs: target.probs,
            set_b,
            market,
            odds: pred.fixture.odds,
            dc_applied: pred.base.dc_applied,
            xg_home: pred.base.xg_home,
            xg_away: pred.base.xg_away,
            xg_confidence: pred.base.xg_confidence,
        })
    }

    /// Odds used for EV arithmetic: quoted when present, importer
    /// defaults otherwise.
    pub fn effective_odds(&self) -> MarketOdds {
        self.odds.unwrap_or_else(MarketOdds::import_default)
    }

    /// EV of the away pick under set B, the archetype gate for AWAY_EDGE.
    pub fn away_edge_ev(&self) -> Option<f64> {
        let b = self.set_b?;
        Some(expected_value(b.away, self.effective_odds().away))
    }
}

/// A candidate ticket before evaluation: one pick per fixture, in slate
/// order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketCandidate {
    pub picks: Vec<Outcome>,
    pub archetype: archetype::Archetype,
}

#[cfg(test)]
pub(crate) mod testkit {
    use super::*;

    /// A slate fixture with sensible defaults for decision-layer tests.
    pub fn slate_fixture(
        fixture_id: i64,
        probs: ProbTriple,
        odds: Option<MarketOdds>,
    ) -> SlateFixture {
        SlateFixture {
            fixture_id,
            probs,
            set_b: Some(probs),
            market: odds.map(|o| crate::pipeline::blend::market_probs(o).probs),
            odds,
            dc_applied: true,
            xg_home: 1.2,
            xg_away: 1.1,
            xg_confidence: 0.9,
        }
    }
}
