//! The decision engine: ties the probability pipeline to the ticket
//! layer and owns persistence of tickets, snapshots and settlements.

use chrono::Utc;
use tracing::{info, warn};

use crate::db::models::{JackpotFixture, PredictionSnapshot, TicketRow};
use crate::db::Database;
use crate::error::{EngineError, EngineResult};
use crate::model::Outcome;
use crate::pipeline::prob_sets::SetKey;
use crate::pipeline::{Deadline, FixturePrediction, Pipeline};
use crate::tickets::archetype::SlateProfile;
use crate::tickets::portfolio::{self, BundleSelection, RankedTicket};
use crate::tickets::{evaluator, generator, SlateFixture, DECISION_VERSION};

/// Candidates proposed per requested ticket; the evaluator and optimiser
/// thin them out.
const CANDIDATE_FACTOR: usize = 3;

/// Result of one ticket-generation request.
#[derive(Debug, Clone)]
pub struct TicketGeneration {
    pub accepted: Vec<TicketRow>,
    pub bundle: BundleSelection,
    pub considered: usize,
    pub rejected: usize,
    pub rejection_reasons: Vec<String>,
}

#[derive(Clone)]
pub struct Engine {
    db: Database,
    pipeline: Pipeline,
}

impl Engine {
    pub fn new(db: Database, pipeline: Pipeline) -> Self {
        Self { db, pipeline }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    fn fixtures_for(&self, jackpot_id: i64) -> EngineResult<Vec<JackpotFixture>> {
        let fixtures = self
            .db
            .list_jackpot_fixtures(jackpot_id)
            .map_err(|e| EngineError::InvalidInput(format!("load jackpot: {e}")))?;
        if fixtures.is_empty() {
            return Err(EngineError::NotFound(format!("jackpot {jackpot_id}")));
        }
        Ok(fixtures)
    }

    /// Full pipeline output for a jackpot, all fixtures or nothing.
    pub async fn predict(
        &self,
        jackpot_id: i64,
        deadline: Deadline,
    ) -> EngineResult<Vec<FixturePrediction>> {
        let fixtures = self.fixtures_for(jackpot_id)?;
        let snapshot = self.pipeline.snapshot();
        let history = self
            .db
            .load_snapshot_history(&snapshot.params.model_version)
            .unwrap_or_default();
        let ensemble = self.pipeline.ensemble_weights(&history);
        self.pipeline
            .predict_slate(&fixtures, ensemble, deadline)
            .await
    }

    /// Generate, evaluate and select tickets for a jackpot under a target
    /// probability set. Every evaluated ticket is persisted (rejected ones
    /// with `accepted = false`); only the optimiser's bundle is returned.
    pub async fn generate_tickets(
        &self,
        jackpot_id: i64,
        set: SetKey,
        n_tickets: usize,
        deadline: Deadline,
    ) -> EngineResult<TicketGeneration> {
        if n_tickets == 0 {
            return Err(EngineError::InvalidInput("n_tickets must be positive".into()));
        }
        let predictions = self.predict(jackpot_id, deadline).await?;
        let snapshot = self.pipeline.snapshot();
        let config = *self.pipeline.config();

        // Build the decision view. Market-dependent sets fall back to the
        // always-present pure set for fixtures the bookmaker never quoted.
        let slate: Vec<SlateFixture> = predictions
            .iter()
            .map(|pred| {
                SlateFixture::from_prediction(pred, set).unwrap_or_else(|| {
                    warn!(
                        fixture_id = pred.fixture.fixture_id,
                        set = set.as_str(),
                        "set not derivable without odds; using the pure set"
                    );
                    SlateFixture::from_prediction(pred, SetKey::A)
                        .expect("set A always derivable")
                })
            })
            .collect();

        deadline.check()?;

        let profile = SlateProfile::analyse(&slate);
        let archetype = profile.choose();
        let candidates = generator::generate(
            &slate,
            archetype,
            n_tickets * CANDIDATE_FACTOR,
            jackpot_id as u64,
        );
        let considered = candidates.len();

        let mut evaluations = Vec::with_capacity(candidates.len());
        for candidate in &candidates {
            deadline.check()?;
            evaluations.push(evaluator::evaluate(
                &candidate.picks,
                &slate,
                snapshot.ev_threshold,
                config.max_contradictions,
            ));
        }

        // Evaluation done within the deadline; persistence happens after
        // the last check so a timed-out request leaves no rows behind.
        deadline.check()?;

        let mut accepted_rows = Vec::new();
        let mut ranked = Vec::new();
        let mut rejection_reasons = Vec::new();
        for (candidate, evaluation) in candidates.iter().zip(&evaluations) {
            let row = TicketRow {
                ticket_id: 0,
                jackpot_id,
                archetype: candidate.archetype.as_str().to_string(),
                set_key: set.as_str().to_string(),
                decision_version: DECISION_VERSION.to_string(),
                // SQLite keeps finite reals; a contradicted score is
                // stored at the representable floor.
                ev_score: evaluation.ev_score.max(f64::MIN),
                contradictions: evaluation.contradictions,
                accepted: evaluation.accepted,
                reason: evaluation.reason.clone(),
                picks: candidate.picks.clone(),
                created_at: Utc::now(),
            };
            let snapshots: Vec<PredictionSnapshot> = predictions
                .iter()
                .map(|pred| PredictionSnapshot {
                    ticket_id: 0,
                    fixture_id: pred.fixture.fixture_id,
                    model_version: snapshot.params.model_version.clone(),
                    xg_home: pred.base.xg_home,
                    xg_away: pred.base.xg_away,
                    xg_confidence: pred.base.xg_confidence,
                    dc_applied: pred.base.dc_applied,
                    base: pred.base.probs,
                    blended: pred.blended,
                    calibrated: pred.calibrated,
                })
                .collect();
            let ticket_id = self
                .db
                .persist_ticket(&row, &snapshots)
                .map_err(|e| EngineError::InvalidInput(format!("persist ticket: {e}")))?;

            if evaluation.accepted {
                ranked.push(RankedTicket {
                    ticket_id,
                    picks: candidate.picks.clone(),
                    score: evaluation.ev_score,
                    archetype: candidate.archetype.as_str().to_string(),
                });
                let mut stored = row;
                stored.ticket_id = ticket_id;
                accepted_rows.push(stored);
            } else {
                rejection_reasons.push(evaluation.reason.clone());
            }
        }

        let bundle = portfolio::select(
            &ranked,
            n_tickets.min(config.max_bundle_size),
            config.portfolio_lambda,
        );
        let selected_ids: Vec<i64> = bundle.selected.iter().map(|t| t.ticket_id).collect();
        let accepted: Vec<TicketRow> = accepted_rows
            .into_iter()
            .filter(|t| selected_ids.contains(&t.ticket_id))
            .collect();

        info!(
            jackpot_id,
            set = set.as_str(),
            archetype = archetype.as_str(),
            considered,
            accepted = accepted.len(),
            rejected = considered - ranked.len(),
            "ticket generation complete"
        );

        Ok(TicketGeneration {
            rejected: considered - ranked.len(),
            considered,
            accepted,
            bundle,
            rejection_reasons,
        })
    }

    /// Results import: map tokens onto fixtures, then settle every stored
    /// ticket once the slate is complete.
    pub fn import_results(
        &self,
        jackpot_id: i64,
        results: &[(i64, String, Option<i64>, Option<i64>)],
    ) -> EngineResult<usize> {
        let mut applied = 0usize;
        for (match_order, token, home_goals, away_goals) in results {
            let outcome = Outcome::parse_token(token)?;
            if let (Some(h), Some(a)) = (home_goals, away_goals) {
                if *h < 0 || *a < 0 {
                    return Err(EngineError::InvalidInput(format!(
                        "negative goals on match {match_order}"
                    )));
                }
                if Outcome::from_goals(*h, *a) != outcome {
                    return Err(EngineError::InvalidInput(format!(
                        "result token {token} disagrees with goals {h}-{a}"
                    )));
                }
            }
            let found = self
                .db
                .record_fixture_result(jackpot_id, *match_order, outcome, *home_goals, *away_goals)
                .map_err(|e| EngineError::InvalidInput(format!("record result: {e}")))?;
            if !found {
                return Err(EngineError::NotFound(format!(
                    "jackpot {jackpot_id} match {match_order}"
                )));
            }
            applied += 1;
        }
        let _ = self.db.log_ingestion(
            "results_import",
            &format!("jackpot {jackpot_id}: {applied} results"),
        );
        self.settle(jackpot_id)?;
        Ok(applied)
    }

    /// Score stored tickets against settled results. Partial slates are
    /// left alone; settlement runs once every fixture has a result.
    pub fn settle(&self, jackpot_id: i64) -> EngineResult<usize> {
        let fixtures = self.fixtures_for(jackpot_id)?;
        let results: Option<Vec<Outcome>> =
            fixtures.iter().map(|f| f.actual_result).collect();
        let Some(results) = results else {
            return Ok(0);
        };
        let tickets = self
            .db
            .list_tickets(jackpot_id, false)
            .map_err(|e| EngineError::InvalidInput(format!("list tickets: {e}")))?;
        let mut settled = 0usize;
        for ticket in &tickets {
            if ticket.picks.len() != results.len() {
                warn!(
                    ticket_id = ticket.ticket_id,
                    "pick count differs from fixture count; skipping settlement"
                );
                continue;
            }
            let hits = ticket
                .picks
                .iter()
                .zip(&results)
                .filter(|(pick, actual)| pick == actual)
                .count() as i64;
            self.db
                .upsert_ticket_outcome(ticket.ticket_id, hits)
                .map_err(|e| EngineError::InvalidInput(format!("settle ticket: {e}")))?;
            settled += 1;
        }
        Ok(settled)
    }
}
