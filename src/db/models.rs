use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{MarketOdds, Outcome, ProbTriple};

/// One fixture in a jackpot slate, in slate order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JackpotFixture {
    pub fixture_id: i64,
    pub jackpot_id: i64,
    /// Position of the fixture on the coupon, 0-based.
    pub match_order: i64,
    pub league_id: i64,
    pub home_team_id: i64,
    pub away_team_id: i64,
    pub kickoff_time: DateTime<Utc>,
    /// Bookmaker 1X2 odds. Absent odds disable market-dependent sets.
    pub odds: Option<MarketOdds>,
    pub actual_result: Option<Outcome>,
    pub actual_home_goals: Option<i64>,
    pub actual_away_goals: Option<i64>,
}

/// A settled historical match used for model training.
#[derive(Debug, Clone)]
pub struct HistoricalMatch {
    pub match_id: i64,
    pub league_id: i64,
    pub match_date: NaiveDate,
    pub home_team_id: i64,
    pub away_team_id: i64,
    pub home_goals: i64,
    pub away_goals: i64,
}

/// Versioned isotonic calibrator row. Append-only: knots are never
/// updated in place; activation flips the `active` flag of at most one
/// predecessor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationRow {
    pub calibration_id: i64,
    pub model_version: String,
    pub league_id: Option<i64>,
    pub outcome: Outcome,
    /// Ordered `(x, y)` knots, both coordinates non-decreasing in [0, 1].
    pub knots: Vec<(f64, f64)>,
    pub samples_used: i64,
    pub created_at: DateTime<Utc>,
    pub valid_from: DateTime<Utc>,
    pub active: bool,
}

/// Immutable record of the model belief at ticket-generation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionSnapshot {
    pub ticket_id: i64,
    pub fixture_id: i64,
    pub model_version: String,
    pub xg_home: f64,
    pub xg_away: f64,
    pub xg_confidence: f64,
    pub dc_applied: bool,
    pub base: ProbTriple,
    pub blended: ProbTriple,
    pub calibrated: ProbTriple,
}

/// A stored ticket. Rejected tickets are persisted with `accepted = false`
/// for audit; the API never returns them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketRow {
    pub ticket_id: i64,
    pub jackpot_id: i64,
    pub archetype: String,
    pub set_key: String,
    pub decision_version: String,
    pub ev_score: f64,
    pub contradictions: i64,
    pub accepted: bool,
    pub reason: String,
    pub picks: Vec<Outcome>,
    pub created_at: DateTime<Utc>,
}

/// Joined view consumed by the threshold-learning job.
#[derive(Debug, Clone, Copy)]
pub struct ScoredOutcome {
    pub ev_score: f64,
    pub hits: i64,
    pub total_picks: i64,
}

/// One row of the calibration training set: pre-calibration belief joined
/// with the settled result.
#[derive(Debug, Clone, Copy)]
pub struct CalibrationSample {
    pub league_id: i64,
    pub predicted: ProbTriple,
    pub actual: Outcome,
}
