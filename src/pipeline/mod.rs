//! The per-jackpot probability pipeline.
//!
//! Fixtures are processed in coupon order: base probabilities from the
//! published model snapshot, draw-structural adjustment, market blend,
//! calibration, then set derivation. Feature and calibrator reads happen
//! up front; the numeric stages are pure. A request either completes for
//! every fixture or fails as a whole.

pub mod blend;
pub mod draw_adjust;
pub mod prob_sets;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::calibration::{CalibrationStore, CalibratorSet};
use crate::db::models::JackpotFixture;
use crate::error::{EngineError, EngineResult};
use crate::features::{FeatureStore, FixtureContext};
use crate::model::poisson::{self, BaseProbability};
use crate::model::{ModelSnapshot, ModelStore, ProbTriple, TeamStrength};
use crate::pipeline::blend::{market_probs, MarketProbs};
use crate::pipeline::draw_adjust::{DrawComponents, DRAW_BOUNDS, MULTIPLIER_BOUNDS};
use crate::pipeline::prob_sets::{derive_sets, EnsembleWeights, SetBundle};

/// Resolved per-request configuration. Built once at the request boundary
/// from the CLI config plus the published snapshot.
#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    pub xi: f64,
    pub rho: f64,
    pub lookback_years: f64,
    pub ev_threshold: f64,
    pub max_contradictions: i64,
    pub portfolio_lambda: f64,
    pub draw_bounds: (f64, f64),
    pub multiplier_bounds: (f64, f64),
    pub max_bundle_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            xi: 0.0065,
            rho: -0.10,
            lookback_years: 5.0,
            ev_threshold: 0.0,
            max_contradictions: 0,
            portfolio_lambda: 0.5,
            draw_bounds: DRAW_BOUNDS,
            multiplier_bounds: MULTIPLIER_BOUNDS,
            max_bundle_size: 5,
        }
    }
}

/// Request deadline. Numeric stages poll it between fixtures; exceeding it
/// aborts the request with nothing persisted.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn within(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
        }
    }

    pub fn check(&self) -> EngineResult<()> {
        if Instant::now() >= self.at {
            Err(EngineError::Timeout)
        } else {
            Ok(())
        }
    }
}

/// Everything the pipeline produced for one fixture.
#[derive(Debug, Clone)]
pub struct FixturePrediction {
    pub fixture: JackpotFixture,
    pub base: BaseProbability,
    pub components: DrawComponents,
    pub adjusted: ProbTriple,
    pub blended: ProbTriple,
    pub calibrated: ProbTriple,
    pub overround: Option<f64>,
    pub sets: SetBundle,
}

/// The assembled pipeline with its I/O collaborators. The heavy lifting is
/// in [`predict_fixture`], which is pure.
#[derive(Clone)]
pub struct Pipeline {
    features: Arc<dyn FeatureStore>,
    calibrations: CalibrationStore,
    models: ModelStore,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        features: Arc<dyn FeatureStore>,
        calibrations: CalibrationStore,
        models: ModelStore,
        config: PipelineConfig,
    ) -> Self {
        Self {
            features,
            calibrations,
            models,
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn snapshot(&self) -> Arc<ModelSnapshot> {
        self.models.current()
    }

    /// Run the full pipeline for a slate. Feature and calibrator reads are
    /// the only suspension points; the numeric pass afterwards is pure and
    /// in fixed input order.
    pub async fn predict_slate(
        &self,
        fixtures: &[JackpotFixture],
        ensemble: EnsembleWeights,
        deadline: Deadline,
    ) -> EngineResult<Vec<FixturePrediction>> {
        if fixtures.is_empty() {
            return Err(EngineError::InvalidInput("empty fixture list".into()));
        }
        // One consistent snapshot for the whole request.
        let snapshot = self.models.current();

        // Fetch all fixture contexts concurrently to cut N sequential
        // feature-store round-trips to one.
        deadline.check()?;
        let contexts = futures_util::future::join_all(
            fixtures.iter().map(|f| self.features.fixture_context(f)),
        )
        .await;

        let mut calibrator_sets: HashMap<i64, CalibratorSet> = HashMap::new();
        for fixture in fixtures {
            deadline.check()?;
            calibrator_sets
                .entry(fixture.league_id)
                .or_insert_with(|| {
                    self.calibrations
                        .load_set(&snapshot.params.model_version, Some(fixture.league_id))
                });
        }

        let mut out = Vec::with_capacity(fixtures.len());
        for (fixture, ctx) in fixtures.iter().zip(&contexts) {
            deadline.check()?;
            let calibrators = calibrator_sets
                .get(&fixture.league_id)
                .expect("prefetched above");
            out.push(predict_fixture(
                fixture,
                ctx,
                &snapshot,
                calibrators,
                ensemble,
                &self.config,
            )?);
        }
        Ok(out)
    }

    /// Inverse-Brier ensemble weights from settled snapshot history;
    /// uniform when there is none yet.
    pub fn ensemble_weights(&self, history: &[(ProbTriple, ProbTriple, ProbTriple, crate::model::Outcome)]) -> EnsembleWeights {
        if history.is_empty() {
            return EnsembleWeights::default();
        }
        let mut briers = [0.0_f64; 3];
        for (base, blended, calibrated, actual) in history {
            for (i, p) in [base, blended, calibrated].into_iter().enumerate() {
                briers[i] += brier(*p, *actual);
            }
        }
        let n = history.len() as f64;
        EnsembleWeights {
            brier_a: briers[0] / n,
            brier_b: briers[1] / n,
            brier_c: briers[2] / n,
        }
    }
}

fn brier(p: ProbTriple, actual: crate::model::Outcome) -> f64 {
    use crate::model::Outcome;
    let y = |o: Outcome| if actual == o { 1.0 } else { 0.0 };
    (p.home - y(Outcome::Home)).powi(2)
        + (p.draw - y(Outcome::Draw)).powi(2)
        + (p.away - y(Outcome::Away)).powi(2)
}

/// Team strengths for a fixture. A fully cold model serves neutral priors
/// with a warning; a trained model that simply lacks the team is a request
/// error (the slate references a team the store does not know).
fn resolve_strengths(
    fixture: &JackpotFixture,
    snapshot: &ModelSnapshot,
) -> EngineResult<(TeamStrength, TeamStrength)> {
    if snapshot.strengths.is_empty() {
        warn!(
            fixture_id = fixture.fixture_id,
            "no trained strengths published; serving neutral priors"
        );
        return Ok((TeamStrength::neutral(), TeamStrength::neutral()));
    }
    let home = snapshot.strength(fixture.home_team_id);
    let away = snapshot.strength(fixture.away_team_id);
    match (home, away) {
        (Some(h), Some(a)) => Ok((h, a)),
        _ => Err(EngineError::InvalidInput(format!(
            "fixture {} references teams without strength rows ({}, {})",
            fixture.fixture_id, fixture.home_team_id, fixture.away_team_id
        ))),
    }
}

/// The pure per-fixture pipeline: base → draw adjustment → blend →
/// calibration → sets.
pub fn predict_fixture(
    fixture: &JackpotFixture,
    ctx: &FixtureContext,
    snapshot: &ModelSnapshot,
    calibrators: &CalibratorSet,
    ensemble: EnsembleWeights,
    config: &PipelineConfig,
) -> EngineResult<FixturePrediction> {
    let (home, away) = resolve_strengths(fixture, snapshot)?;
    let base = poisson::base_probability(
        fixture.fixture_id,
        home,
        away,
        &snapshot.params,
        fixture.league_id,
    )?;

    let adjusted = draw_adjust::apply_bounded(
        &base,
        ctx,
        config.multiplier_bounds,
        config.draw_bounds,
    );

    let market: Option<MarketProbs> = match fixture.odds {
        Some(odds) => {
            odds.validate()?;
            Some(market_probs(odds))
        }
        None => None,
    };

    let blended = blend::blend(
        adjusted.probs,
        market.as_ref(),
        fixture.league_id,
        snapshot.blend.as_ref(),
    );
    let calibrated = calibrators.apply(blended);

    let sets = derive_sets(
        adjusted.probs,
        market.as_ref(),
        fixture.odds,
        fixture.league_id,
        snapshot.blend.as_ref(),
        calibrators,
        ensemble,
    );

    Ok(FixturePrediction {
        fixture: fixture.clone(),
        base,
        components: adjusted.components,
        adjusted: adjusted.probs,
        blended,
        calibrated,
        overround: market.map(|m| m.overround),
        sets,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MarketOdds, Outcome};
    use chrono::{TimeZone, Utc};

    fn fixture(id: i64, odds: Option<MarketOdds>) -> JackpotFixture {
        JackpotFixture {
            fixture_id: id,
            jackpot_id: 1,
            match_order: id,
            league_id: 10,
            home_team_id: 1,
            away_team_id: 2,
            kickoff_time: Utc.with_ymd_and_hms(2025, 8, 2, 15, 0, 0).unwrap(),
            odds,
            actual_result: None,
            actual_home_goals: None,
            actual_away_goals: None,
        }
    }

    fn trained_snapshot() -> ModelSnapshot {
        let mut snapshot = ModelSnapshot::bootstrap("test_v1", 0.0065);
        snapshot.strengths.insert(
            1,
            TeamStrength {
                attack: 0.2,
                defense: 0.1,
            },
        );
        snapshot.strengths.insert(
            2,
            TeamStrength {
                attack: -0.1,
                defense: -0.05,
            },
        );
        snapshot
    }

    #[test]
    fn pure_fixture_pipeline_produces_valid_triples() {
        let f = fixture(
            1,
            Some(MarketOdds {
                home: 2.0,
                draw: 3.4,
                away: 3.9,
            }),
        );
        let pred = predict_fixture(
            &f,
            &FixtureContext::default(),
            &trained_snapshot(),
            &CalibratorSet::identity(),
            EnsembleWeights::default(),
            &PipelineConfig::default(),
        )
        .unwrap();

        assert!(pred.base.probs.is_valid());
        assert!(pred.adjusted.is_valid());
        assert!(pred.blended.is_valid());
        assert!(pred.calibrated.is_valid());
        assert_eq!(pred.sets.len(), 7);
        assert!(pred.overround.unwrap() > 0.0);
    }

    #[test]
    fn missing_odds_limits_sets_to_pure() {
        let f = fixture(1, None);
        let pred = predict_fixture(
            &f,
            &FixtureContext::default(),
            &trained_snapshot(),
            &CalibratorSet::identity(),
            EnsembleWeights::default(),
            &PipelineConfig::default(),
        )
        .unwrap();
        assert_eq!(pred.sets.len(), 1);
        assert!(pred.overround.is_none());
        // Pass-through blend: blended equals the adjusted triple.
        assert_eq!(pred.blended, pred.adjusted);
    }

    #[test]
    fn unknown_team_fails_request_on_trained_model() {
        let mut f = fixture(1, None);
        f.home_team_id = 999;
        let err = predict_fixture(
            &f,
            &FixtureContext::default(),
            &trained_snapshot(),
            &CalibratorSet::identity(),
            EnsembleWeights::default(),
            &PipelineConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }

    #[test]
    fn cold_model_serves_neutral_priors() {
        let f = fixture(1, None);
        let snapshot = ModelSnapshot::bootstrap("cold", 0.0065);
        let pred = predict_fixture(
            &f,
            &FixtureContext::default(),
            &snapshot,
            &CalibratorSet::identity(),
            EnsembleWeights::default(),
            &PipelineConfig::default(),
        )
        .unwrap();
        // Neutral strengths plus home advantage: home favoured, valid triple.
        assert!(pred.base.probs.home > pred.base.probs.away);
    }

    #[test]
    fn bad_odds_reject_the_fixture() {
        let f = fixture(
            1,
            Some(MarketOdds {
                home: 0.9,
                draw: 3.0,
                away: 3.0,
            }),
        );
        let err = predict_fixture(
            &f,
            &FixtureContext::default(),
            &trained_snapshot(),
            &CalibratorSet::identity(),
            EnsembleWeights::default(),
            &PipelineConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }

    #[test]
    fn expired_deadline_times_out() {
        let deadline = Deadline::within(Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(2));
        assert!(matches!(deadline.check(), Err(EngineError::Timeout)));
    }

    #[test]
    fn ensemble_weights_prefer_better_lineage() {
        let history = vec![
            (
                ProbTriple::new(0.9, 0.05, 0.05), // base: right and confident
                ProbTriple::uniform(),            // blended: vague
                ProbTriple::new(0.1, 0.1, 0.8),   // calibrated lineage: wrong
                Outcome::Home,
            );
            20
        ];
        let p = Pipeline::new(
            Arc::new(NullFeatures),
            CalibrationStore::new(crate::db::Database::open_in_memory().unwrap()),
            ModelStore::new(ModelSnapshot::bootstrap("v", 0.0065)),
            PipelineConfig::default(),
        );
        let w = p.ensemble_weights(&history);
        assert!(w.brier_a < w.brier_b);
        assert!(w.brier_b < w.brier_c);
    }

    struct NullFeatures;

    #[async_trait::async_trait]
    impl FeatureStore for NullFeatures {
        async fn get_league_prior(&self, _: i64, _: &str) -> Option<f64> {
            None
        }
        async fn get_league_structure(
            &self,
            _: i64,
        ) -> Option<crate::features::LeagueStructure> {
            None
        }
        async fn get_elo(&self, _: i64, _: chrono::NaiveDate) -> Option<f64> {
            None
        }
        async fn get_h2h(&self, _: i64, _: i64) -> Option<crate::features::H2hStats> {
            None
        }
        async fn get_rest_days(&self, _: i64, _: i64) -> Option<i64> {
            None
        }
        async fn get_referee(&self, _: i64) -> Option<f64> {
            None
        }
        async fn get_weather(&self, _: i64) -> Option<crate::features::WeatherReport> {
            None
        }
        async fn get_odds_movement(&self, _: i64) -> Option<crate::features::OddsMovement> {
            None
        }
        async fn get_xg(&self, _: i64) -> Option<crate::features::XgReport> {
            None
        }
    }
}
