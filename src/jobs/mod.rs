//! Background jobs: model training, calibration refit, and threshold
//! learning.
//!
//! Each job is an interval loop in its own task, cooperative with the
//! request path: results are published by swapping whole snapshots or by
//! activating calibration versions, never by mutating live state.

use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use tracing::{info, warn};

use crate::calibration::{CalibrationStore, DEFAULT_MIN_SAMPLES};
use crate::db::Database;
use crate::model::dixon_coles::{self, EstimatorConfig, MatchRecord};
use crate::model::{ModelSnapshot, ModelStore};
use crate::pipeline::blend::{fit_blend, market_probs, BlendSample};
use crate::pipeline::PipelineConfig;
use crate::tickets::evaluator;

#[derive(Debug, Clone, Copy)]
pub struct JobIntervals {
    pub training_secs: u64,
    pub calibration_secs: u64,
    pub threshold_secs: u64,
}

/// Relative Brier improvement required before a freshly fitted calibration
/// is activated over its predecessor.
const CALIBRATION_MIN_RELATIVE_IMPROVEMENT: f64 = 0.005;

/// Spawn the three maintenance loops.
pub fn spawn_all(
    db: Database,
    models: ModelStore,
    calibrations: CalibrationStore,
    config: PipelineConfig,
    intervals: JobIntervals,
) {
    {
        let db = db.clone();
        let models = models.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(intervals.training_secs));
            loop {
                tick.tick().await;
                if let Err(e) = run_training(&db, &models, &config) {
                    warn!("training job failed: {e}");
                }
            }
        });
    }
    {
        let db = db.clone();
        let models = models.clone();
        let calibrations = calibrations.clone();
        tokio::spawn(async move {
            let mut tick =
                tokio::time::interval(Duration::from_secs(intervals.calibration_secs));
            loop {
                tick.tick().await;
                if let Err(e) = run_calibration_refit(&db, &models, &calibrations) {
                    warn!("calibration refit failed: {e}");
                }
            }
        });
    }
    {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(intervals.threshold_secs));
            loop {
                tick.tick().await;
                if let Err(e) = run_threshold_learning(&db, &models) {
                    warn!("threshold learning failed: {e}");
                }
            }
        });
    }
}

/// Fit team strengths from stored history and publish a new snapshot. The
/// learned threshold and any blend weights carry over; the blend is
/// refreshed when enough settled snapshots exist.
pub fn run_training(
    db: &Database,
    models: &ModelStore,
    config: &PipelineConfig,
) -> anyhow::Result<()> {
    let reference = Utc::now().date_naive();
    let since = reference
        - ChronoDuration::days((config.lookback_years * 365.25) as i64);
    let history = db.load_match_history(since)?;
    let records: Vec<MatchRecord> = history
        .iter()
        .map(|m| MatchRecord {
            match_id: m.match_id,
            date: m.match_date,
            league_id: m.league_id,
            home_id: m.home_team_id,
            away_id: m.away_team_id,
            home_goals: m.home_goals.max(0) as u32,
            away_goals: m.away_goals.max(0) as u32,
        })
        .collect();

    let estimator_cfg = EstimatorConfig {
        lookback_years: config.lookback_years,
        xi: config.xi,
        ..EstimatorConfig::default()
    };
    let model_version = format!("dc_{}", Utc::now().format("%Y%m%d%H%M%S"));
    let fit = dixon_coles::fit_with_retry(&records, reference, None, &estimator_cfg, &model_version)?;

    db.save_model(&fit.params, &fit.strengths)?;

    let previous = models.current();
    let mut snapshot = ModelSnapshot {
        params: fit.params,
        strengths: fit.strengths,
        blend: previous.blend.clone(),
        ev_threshold: previous.ev_threshold,
        published_at: Utc::now(),
    };

    // Blend weights train against the previous version's settled
    // snapshots; a brand-new model inherits them until its own history
    // accumulates.
    let blend_rows = db.load_blend_training(&previous.params.model_version)?;
    if !blend_rows.is_empty() {
        let samples: Vec<BlendSample> = blend_rows
            .iter()
            .map(|(belief, odds, league_id, actual)| {
                let market = market_probs(*odds);
                BlendSample {
                    model: *belief,
                    market: market.probs,
                    overround: market.overround,
                    league_id: *league_id,
                    actual: *actual,
                }
            })
            .collect();
        if let Some(weights) = fit_blend(&samples, 400, 0.3, 1e-3) {
            db.save_blend_model(&model_version, &weights)?;
            snapshot.blend = Some(weights);
        }
    }

    info!(
        model_version = %snapshot.params.model_version,
        teams = snapshot.strengths.len(),
        matches = fit.matches_used,
        "published new model snapshot"
    );
    models.publish(snapshot);
    Ok(())
}

/// Refit the global calibrators for the active model and activate them
/// when they beat the incumbent by the promotion margin.
pub fn run_calibration_refit(
    db: &Database,
    models: &ModelStore,
    calibrations: &CalibrationStore,
) -> anyhow::Result<()> {
    let snapshot = models.current();
    let model_version = &snapshot.params.model_version;
    let report = match calibrations.fit(model_version, None, DEFAULT_MIN_SAMPLES) {
        Ok(r) => r,
        Err(crate::error::EngineError::InsufficientData(why)) => {
            info!("calibration refit skipped: {why}");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let improvement = if report.brier_before > 0.0 {
        (report.brier_before - report.brier_after) / report.brier_before
    } else {
        0.0
    };
    if improvement < CALIBRATION_MIN_RELATIVE_IMPROVEMENT {
        info!(
            improvement,
            "new calibration below promotion margin; left inactive"
        );
        return Ok(());
    }
    for id in &report.calibration_ids {
        calibrations.activate(*id)?;
    }
    let _ = db.log_ingestion(
        "calibration_refit",
        &format!(
            "activated {:?} for {model_version} (brier {:.4} -> {:.4})",
            report.calibration_ids, report.brier_before, report.brier_after
        ),
    );
    Ok(())
}

/// Re-learn the EV acceptance threshold from settled tickets and publish
/// it into the live snapshot.
pub fn run_threshold_learning(db: &Database, models: &ModelStore) -> anyhow::Result<()> {
    let scored = db.load_scored_outcomes()?;
    let Some(learned) = evaluator::learn_threshold(&scored) else {
        info!(samples = scored.len(), "threshold learning skipped");
        return Ok(());
    };
    db.save_threshold(
        learned.ev_threshold,
        learned.acceptance_rate,
        learned.samples as i64,
    )?;
    models.publish_threshold(learned.ev_threshold);
    info!(
        ev_threshold = learned.ev_threshold,
        acceptance_rate = learned.acceptance_rate,
        samples = learned.samples,
        "published learned threshold"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::HistoricalMatch;
    use chrono::NaiveDate;

    fn seed_history(db: &Database) {
        // Two seasons of a four-team league.
        let teams = [1i64, 2, 3, 4];
        let mut id = 0;
        for round in 0..6 {
            for (i, &home) in teams.iter().enumerate() {
                for (j, &away) in teams.iter().enumerate() {
                    if i == j {
                        continue;
                    }
                    id += 1;
                    let (hg, ag) = match (home, away) {
                        (1, _) => (2, 0),
                        (_, 1) => (0, 2),
                        (2, _) => (2, 1),
                        (_, 2) => (1, 2),
                        _ => (1, 1),
                    };
                    db.insert_historical_match(&HistoricalMatch {
                        match_id: id,
                        league_id: 10,
                        match_date: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap()
                            + chrono::Duration::days(round * 30 + i as i64),
                        home_team_id: home,
                        away_team_id: away,
                        home_goals: hg,
                        away_goals: ag,
                    })
                    .unwrap();
                }
            }
        }
    }

    #[test]
    fn training_publishes_a_new_snapshot() {
        let db = Database::open_in_memory().unwrap();
        seed_history(&db);
        let models = ModelStore::new(ModelSnapshot::bootstrap("boot", 0.0065));
        let config = PipelineConfig::default();

        run_training(&db, &models, &config).unwrap();

        let snapshot = models.current();
        assert_ne!(snapshot.params.model_version, "boot");
        assert_eq!(snapshot.strengths.len(), 4);
        // Team 1 wins everything; it should out-rate team 4.
        assert!(snapshot.strengths[&1].attack > snapshot.strengths[&4].attack);
        // Persisted too.
        assert!(db.load_active_model().unwrap().is_some());
    }

    #[test]
    fn training_with_no_history_reports_insufficient_data() {
        let db = Database::open_in_memory().unwrap();
        let models = ModelStore::new(ModelSnapshot::bootstrap("boot", 0.0065));
        let err = run_training(&db, &models, &PipelineConfig::default()).unwrap_err();
        assert!(err.to_string().contains("insufficient data"));
    }

    #[test]
    fn threshold_learning_skips_thin_data() {
        let db = Database::open_in_memory().unwrap();
        let models = ModelStore::new(ModelSnapshot::bootstrap("boot", 0.0065));
        run_threshold_learning(&db, &models).unwrap();
        assert!(db.load_latest_threshold().unwrap().is_none());
    }

    #[test]
    fn calibration_refit_skips_without_snapshots() {
        let db = Database::open_in_memory().unwrap();
        let models = ModelStore::new(ModelSnapshot::bootstrap("boot", 0.0065));
        let calibrations = CalibrationStore::new(db.clone());
        run_calibration_refit(&db, &models, &calibrations).unwrap();
        assert!(db.list_active_calibrations("boot", None).unwrap().is_empty());
    }
}
