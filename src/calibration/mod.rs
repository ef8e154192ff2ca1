//! Versioned isotonic calibration store.
//!
//! Calibrators are fit per `(model_version, league, outcome)` with
//! pool-adjacent-violators, persisted append-only, and activated
//! atomically. Application is a pure function over a prefetched
//! [`CalibratorSet`] so the numeric kernel stays free of I/O; lookup falls
//! back league → global → pass-through.

use tracing::{info, warn};

use crate::db::models::CalibrationSample;
use crate::db::Database;
use crate::error::{EngineError, EngineResult};
use crate::model::{Outcome, ProbTriple};

pub const DEFAULT_MIN_SAMPLES: usize = 200;

/// A fitted isotonic regressor: ordered knots, both coordinates
/// non-decreasing, inputs clipped to the knot range.
#[derive(Debug, Clone, PartialEq)]
pub struct Calibrator {
    knots: Vec<(f64, f64)>,
}

impl Calibrator {
    /// Build from stored knots, validating monotonicity.
    pub fn from_knots(knots: Vec<(f64, f64)>) -> EngineResult<Self> {
        if knots.is_empty() {
            return Err(EngineError::InvalidInput("empty calibration knots".into()));
        }
        for pair in knots.windows(2) {
            if pair[1].0 < pair[0].0 || pair[1].1 < pair[0].1 {
                return Err(EngineError::InvalidInput(
                    "calibration knots must be non-decreasing".into(),
                ));
            }
        }
        for (x, y) in &knots {
            if !(0.0..=1.0).contains(x) || !(0.0..=1.0).contains(y) {
                return Err(EngineError::InvalidInput(
                    "calibration knots out of [0,1]".into(),
                ));
            }
        }
        Ok(Self { knots })
    }

    pub fn identity() -> Self {
        Self {
            knots: vec![(0.0, 0.0), (1.0, 1.0)],
        }
    }

    pub fn knots(&self) -> &[(f64, f64)] {
        &self.knots
    }

    /// Fit by pool-adjacent-violators over `(predicted, hit)` pairs.
    pub fn fit(samples: &[(f64, f64)]) -> EngineResult<Self> {
        if samples.is_empty() {
            return Err(EngineError::InsufficientData(
                "no samples for isotonic fit".into(),
            ));
        }
        let mut sorted: Vec<(f64, f64)> = samples.to_vec();
        sorted.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

        // Blocks of (x-sum, y-sum, weight); merge while the running means
        // violate monotonicity.
        let mut blocks: Vec<(f64, f64, f64)> = Vec::with_capacity(sorted.len());
        for (x, y) in sorted {
            blocks.push((x, y, 1.0));
            while blocks.len() >= 2 {
                let last = blocks[blocks.len() - 1];
                let prev = blocks[blocks.len() - 2];
                if prev.1 / prev.2 <= last.1 / last.2 {
                    break;
                }
                blocks.pop();
                let top = blocks.last_mut().expect("non-empty");
                top.0 += last.0;
                top.1 += last.1;
                top.2 += last.2;
            }
        }

        let mut knots: Vec<(f64, f64)> = blocks
            .iter()
            .map(|(xs, ys, w)| ((xs / w).clamp(0.0, 1.0), (ys / w).clamp(0.0, 1.0)))
            .collect();
        // Equal-x blocks collapse to the last (highest-y) knot.
        knots.dedup_by(|b, a| {
            if (b.0 - a.0).abs() < 1e-12 {
                a.1 = b.1.max(a.1);
                true
            } else {
                false
            }
        });

        Self::from_knots(knots)
    }

    /// Map a predicted probability through the regressor: clipped outside
    /// the knot range, linearly interpolated inside it.
    pub fn apply(&self, p: f64) -> f64 {
        let p = p.clamp(0.0, 1.0);
        let first = self.knots[0];
        let last = self.knots[self.knots.len() - 1];
        if p <= first.0 {
            return first.1;
        }
        if p >= last.0 {
            return last.1;
        }
        for pair in self.knots.windows(2) {
            let (x0, y0) = pair[0];
            let (x1, y1) = pair[1];
            if p <= x1 {
                if (x1 - x0).abs() < 1e-12 {
                    return y1;
                }
                let t = (p - x0) / (x1 - x0);
                return y0 + t * (y1 - y0);
            }
        }
        last.1
    }
}

/// The three per-outcome calibrators resolved for one `(model_version,
/// league)` pair. Missing entries behave as identity.
#[derive(Debug, Clone, Default)]
pub struct CalibratorSet {
    pub home: Option<Calibrator>,
    pub draw: Option<Calibrator>,
    pub away: Option<Calibrator>,
}

impl CalibratorSet {
    pub fn identity() -> Self {
        Self::default()
    }

    fn for_outcome(&self, outcome: Outcome) -> Option<&Calibrator> {
        match outcome {
            Outcome::Home => self.home.as_ref(),
            Outcome::Draw => self.draw.as_ref(),
            Outcome::Away => self.away.as_ref(),
        }
    }

    /// Calibrate each marginal, then renormalise the triple.
    pub fn apply(&self, p: ProbTriple) -> ProbTriple {
        let mapped = ProbTriple::new(
            self.for_outcome(Outcome::Home).map_or(p.home, |c| c.apply(p.home)),
            self.for_outcome(Outcome::Draw).map_or(p.draw, |c| c.apply(p.draw)),
            self.for_outcome(Outcome::Away).map_or(p.away, |c| c.apply(p.away)),
        );
        mapped.normalised()
    }
}

/// Outcome of one `fit` call: the three appended (inactive) versions.
#[derive(Debug, Clone)]
pub struct FitReport {
    pub calibration_ids: Vec<i64>,
    pub samples_used: usize,
    pub brier_before: f64,
    pub brier_after: f64,
}

/// Store facade over the versioned calibration tables.
#[derive(Clone)]
pub struct CalibrationStore {
    db: Database,
}

impl CalibrationStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Fit three per-outcome calibrators from the snapshot/result join and
    /// append them (inactive). `InsufficientData` if any outcome bucket is
    /// smaller than `min_samples`.
    pub fn fit(
        &self,
        model_version: &str,
        league_id: Option<i64>,
        min_samples: usize,
    ) -> EngineResult<FitReport> {
        let dataset = self
            .db
            .load_calibration_dataset(model_version, league_id)
            .map_err(|e| EngineError::InvalidInput(format!("calibration dataset: {e}")))?;
        self.fit_from_samples(model_version, league_id, &dataset, min_samples)
    }

    /// Fit from an explicit dataset; split out for tests and the refit job.
    pub fn fit_from_samples(
        &self,
        model_version: &str,
        league_id: Option<i64>,
        dataset: &[CalibrationSample],
        min_samples: usize,
    ) -> EngineResult<FitReport> {
        if dataset.len() < min_samples {
            return Err(EngineError::InsufficientData(format!(
                "{} settled fixtures, need {min_samples}",
                dataset.len()
            )));
        }

        let mut ids = Vec::with_capacity(3);
        let mut brier_before = 0.0;
        let mut brier_after = 0.0;

        for outcome in Outcome::ALL {
            let samples: Vec<(f64, f64)> = dataset
                .iter()
                .map(|s| {
                    (
                        s.predicted.get(outcome),
                        if s.actual == outcome { 1.0 } else { 0.0 },
                    )
                })
                .collect();
            // Every row carries a belief for every outcome, so the bucket
            // check is on positive labels: a class that never occurs
            // cannot be calibrated.
            let positives = samples.iter().filter(|(_, y)| *y > 0.5).count();
            if positives == 0 {
                return Err(EngineError::InsufficientData(format!(
                    "no settled {} outcomes in window",
                    outcome.as_str()
                )));
            }
            if samples.len() < min_samples {
                return Err(EngineError::InsufficientData(format!(
                    "{} samples for outcome {}, need {min_samples}",
                    samples.len(),
                    outcome.as_str()
                )));
            }

            let calibrator = Calibrator::fit(&samples)?;
            for (p, y) in &samples {
                brier_before += (p - y).powi(2);
                brier_after += (calibrator.apply(*p) - y).powi(2);
            }

            let id = self
                .db
                .insert_calibration(
                    model_version,
                    league_id,
                    outcome,
                    calibrator.knots(),
                    samples.len() as i64,
                )
                .map_err(|e| EngineError::InvalidInput(format!("persist calibration: {e}")))?;
            ids.push(id);
        }

        let n = (dataset.len() * 3) as f64;
        let report = FitReport {
            calibration_ids: ids,
            samples_used: dataset.len(),
            brier_before: brier_before / n,
            brier_after: brier_after / n,
        };
        info!(
            model_version,
            league = ?league_id,
            samples = report.samples_used,
            brier_before = report.brier_before,
            brier_after = report.brier_after,
            "fitted calibration"
        );
        Ok(report)
    }

    /// Activate a version; its predecessor for the same key is deactivated
    /// in the same transaction.
    pub fn activate(&self, calibration_id: i64) -> EngineResult<()> {
        let found = self
            .db
            .activate_calibration(calibration_id)
            .map_err(|e| EngineError::InvalidInput(format!("activate calibration: {e}")))?;
        if !found {
            return Err(EngineError::NotFound(format!(
                "calibration {calibration_id}"
            )));
        }
        Ok(())
    }

    /// Resolve the active calibrators for a league, falling back to the
    /// global (NULL-league) versions, then to pass-through.
    pub fn load_set(&self, model_version: &str, league_id: Option<i64>) -> CalibratorSet {
        let mut set = CalibratorSet::default();
        for outcome in Outcome::ALL {
            let mut row = None;
            if let Some(league) = league_id {
                row = self
                    .db
                    .load_active_calibration(model_version, Some(league), outcome)
                    .unwrap_or(None);
            }
            if row.is_none() {
                row = self
                    .db
                    .load_active_calibration(model_version, None, outcome)
                    .unwrap_or(None);
            }
            let calibrator = row.and_then(|r| match Calibrator::from_knots(r.knots) {
                Ok(c) => Some(c),
                Err(e) => {
                    warn!(
                        calibration_id = r.calibration_id,
                        "stored knots rejected: {e}; using pass-through"
                    );
                    None
                }
            });
            match outcome {
                Outcome::Home => set.home = calibrator,
                Outcome::Draw => set.draw = calibrator,
                Outcome::Away => set.away = calibrator,
            }
        }
        set
    }

    /// One-shot apply for callers without a prefetched set.
    pub fn apply(&self, model_version: &str, league_id: Option<i64>, p: ProbTriple) -> ProbTriple {
        self.load_set(model_version, league_id).apply(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn identity_knots_pass_through() {
        let set = CalibratorSet {
            home: Some(Calibrator::identity()),
            draw: Some(Calibrator::identity()),
            away: Some(Calibrator::identity()),
        };
        let p = ProbTriple::new(0.52, 0.27, 0.21);
        let out = set.apply(p);
        assert_relative_eq!(out.home, p.home, epsilon = 1e-9);
        assert_relative_eq!(out.draw, p.draw, epsilon = 1e-9);
        assert_relative_eq!(out.away, p.away, epsilon = 1e-9);
    }

    #[test]
    fn applying_is_a_function_not_a_transform() {
        // A calibrated triple re-submitted through the same active set is
        // unchanged: calibration maps raw beliefs, it does not stack.
        let set = CalibratorSet {
            home: Some(Calibrator::identity()),
            draw: Some(Calibrator::identity()),
            away: Some(Calibrator::identity()),
        };
        let p = ProbTriple::new(0.48, 0.29, 0.23);
        let once = set.apply(p);
        let twice = set.apply(once);
        assert_relative_eq!(twice.home, once.home, epsilon = 1e-9);
        assert_relative_eq!(twice.draw, once.draw, epsilon = 1e-9);
        assert_relative_eq!(twice.away, once.away, epsilon = 1e-9);
    }

    #[test]
    fn pav_output_is_monotone() {
        // Overconfident predictions with noisy labels.
        let samples: Vec<(f64, f64)> = (0..200)
            .map(|i| {
                let p = i as f64 / 200.0;
                let y = if (i * 7) % 10 < (p * 10.0) as usize { 1.0 } else { 0.0 };
                (p, y)
            })
            .collect();
        let c = Calibrator::fit(&samples).unwrap();
        for pair in c.knots().windows(2) {
            assert!(pair[1].0 >= pair[0].0);
            assert!(pair[1].1 >= pair[0].1);
        }
        // Applied outputs are monotone in the input.
        let mut last = -1.0;
        for i in 0..=20 {
            let v = c.apply(i as f64 / 20.0);
            assert!(v >= last - 1e-12);
            last = v;
        }
    }

    #[test]
    fn apply_clips_out_of_range_inputs() {
        let c = Calibrator::from_knots(vec![(0.2, 0.25), (0.8, 0.7)]).unwrap();
        assert_relative_eq!(c.apply(0.0), 0.25);
        assert_relative_eq!(c.apply(1.0), 0.7);
        let mid = c.apply(0.5);
        assert!(mid > 0.25 && mid < 0.7);
    }

    #[test]
    fn non_monotone_knots_are_rejected() {
        assert!(Calibrator::from_knots(vec![(0.0, 0.5), (1.0, 0.2)]).is_err());
        assert!(Calibrator::from_knots(vec![(0.5, 0.1), (0.2, 0.4)]).is_err());
    }

    #[test]
    fn empty_set_is_pass_through() {
        let set = CalibratorSet::identity();
        let p = ProbTriple::new(0.4, 0.35, 0.25);
        let out = set.apply(p);
        assert_relative_eq!(out.home, p.home, epsilon = 1e-12);
    }

    #[test]
    fn applied_triple_is_renormalised() {
        let shrink = Calibrator::from_knots(vec![(0.0, 0.0), (1.0, 0.5)]).unwrap();
        let set = CalibratorSet {
            home: Some(shrink.clone()),
            draw: Some(shrink.clone()),
            away: Some(shrink),
        };
        let out = set.apply(ProbTriple::new(0.5, 0.3, 0.2));
        assert!(out.is_valid());
    }

    fn sample(p: ProbTriple, actual: Outcome) -> CalibrationSample {
        CalibrationSample {
            league_id: 10,
            predicted: p,
            actual,
        }
    }

    fn synthetic_dataset(n: usize) -> Vec<CalibrationSample> {
        // Predictions are systematically overconfident on home.
        (0..n)
            .map(|i| {
                let actual = match i % 10 {
                    0..=3 => Outcome::Home,
                    4..=6 => Outcome::Draw,
                    _ => Outcome::Away,
                };
                sample(ProbTriple::new(0.6, 0.25, 0.15), actual)
            })
            .collect()
    }

    #[test]
    fn store_fit_appends_three_versions() {
        let db = Database::open_in_memory().unwrap();
        let store = CalibrationStore::new(db.clone());
        let dataset = synthetic_dataset(250);
        let report = store
            .fit_from_samples("v1", Some(10), &dataset, 200)
            .unwrap();
        assert_eq!(report.calibration_ids.len(), 3);
        // Calibration corrects the overconfident home belief.
        assert!(report.brier_after <= report.brier_before + 1e-9);

        // Not yet active until activated.
        assert!(store.load_set("v1", Some(10)).home.is_none());
        for id in &report.calibration_ids {
            store.activate(*id).unwrap();
        }
        assert!(store.load_set("v1", Some(10)).home.is_some());
    }

    #[test]
    fn store_fit_requires_min_samples() {
        let db = Database::open_in_memory().unwrap();
        let store = CalibrationStore::new(db);
        let dataset = synthetic_dataset(50);
        assert!(matches!(
            store.fit_from_samples("v1", None, &dataset, 200),
            Err(EngineError::InsufficientData(_))
        ));
    }

    #[test]
    fn league_lookup_falls_back_to_global() {
        let db = Database::open_in_memory().unwrap();
        let store = CalibrationStore::new(db.clone());
        let report = store
            .fit_from_samples("v1", None, &synthetic_dataset(250), 200)
            .unwrap();
        for id in &report.calibration_ids {
            store.activate(*id).unwrap();
        }
        // League 42 has no dedicated calibrators; global ones resolve.
        let set = store.load_set("v1", Some(42));
        assert!(set.home.is_some());
        assert!(set.draw.is_some());
        assert!(set.away.is_some());
    }

    #[test]
    fn activation_flips_predecessor() {
        let db = Database::open_in_memory().unwrap();
        let store = CalibrationStore::new(db.clone());
        let first = store
            .fit_from_samples("v1", None, &synthetic_dataset(250), 200)
            .unwrap();
        let second = store
            .fit_from_samples("v1", None, &synthetic_dataset(300), 200)
            .unwrap();
        for id in first.calibration_ids.iter().chain(&second.calibration_ids) {
            store.activate(*id).unwrap();
        }
        let active = db.list_active_calibrations("v1", None).unwrap();
        assert_eq!(active.len(), 3);
        for row in active {
            assert!(second.calibration_ids.contains(&row.calibration_id));
        }
    }
}
