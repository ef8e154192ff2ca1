//! HTTP surface: probability, ticket-generation, calibration and
//! result-import endpoints.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;

use crate::calibration::{CalibrationStore, DEFAULT_MIN_SAMPLES};
use crate::engine::Engine;
use crate::error::EngineError;
use crate::model::ProbTriple;
use crate::pipeline::prob_sets::SetKey;
use crate::pipeline::{Deadline, FixturePrediction};

#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    pub calibrations: CalibrationStore,
    /// Per-request compute budget; exceeding it aborts with 504.
    pub request_budget: Duration,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/jackpots/:id/probabilities", get(probabilities_handler))
        .route("/api/jackpots/:id/tickets", post(tickets_handler))
        .route("/api/jackpots/:id/results", post(results_handler))
        .route("/api/calibrations/fit", post(calibration_fit_handler))
        .route(
            "/api/calibrations/:id/activate",
            post(calibration_activate_handler),
        )
        .route("/api/calibrations/active", get(calibration_list_handler))
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

fn error_response(err: EngineError) -> (StatusCode, String) {
    let status = match &err {
        EngineError::NotFound(_) => StatusCode::NOT_FOUND,
        EngineError::InvalidInput(_) | EngineError::InvalidLambda { .. } => {
            StatusCode::BAD_REQUEST
        }
        EngineError::InsufficientData(_) => StatusCode::UNPROCESSABLE_ENTITY,
        EngineError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string())
}

// ── Health ────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    model_version: String,
    ev_threshold: f64,
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.engine.pipeline().snapshot();
    Json(HealthResponse {
        status: "ok",
        model_version: snapshot.params.model_version.clone(),
        ev_threshold: snapshot.ev_threshold,
    })
}

// ── Probabilities ─────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct TripleDto {
    home: f64,
    draw: f64,
    away: f64,
}

impl From<ProbTriple> for TripleDto {
    fn from(p: ProbTriple) -> Self {
        Self {
            home: p.home,
            draw: p.draw,
            away: p.away,
        }
    }
}

#[derive(Serialize)]
struct SetDto {
    home: f64,
    draw: f64,
    away: f64,
    entropy: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    kelly: Option<[f64; 3]>,
}

#[derive(Serialize)]
struct FixtureProbabilitiesDto {
    fixture_id: i64,
    match_order: i64,
    league_id: i64,
    xg_home: f64,
    xg_away: f64,
    xg_confidence: f64,
    dc_applied: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    overround: Option<f64>,
    base: TripleDto,
    blended: TripleDto,
    calibrated: TripleDto,
    sets: BTreeMap<String, SetDto>,
}

fn fixture_dto(pred: &FixturePrediction) -> FixtureProbabilitiesDto {
    let mut sets = BTreeMap::new();
    for set in pred.sets.iter() {
        sets.insert(
            set.key.as_str().to_string(),
            SetDto {
                home: set.probs.home,
                draw: set.probs.draw,
                away: set.probs.away,
                entropy: set.entropy,
                kelly: set.kelly,
            },
        );
    }
    FixtureProbabilitiesDto {
        fixture_id: pred.fixture.fixture_id,
        match_order: pred.fixture.match_order,
        league_id: pred.fixture.league_id,
        xg_home: pred.base.xg_home,
        xg_away: pred.base.xg_away,
        xg_confidence: pred.base.xg_confidence,
        dc_applied: pred.base.dc_applied,
        overround: pred.overround,
        base: pred.base.probs.into(),
        blended: pred.blended.into(),
        calibrated: pred.calibrated.into(),
        sets,
    }
}

#[derive(Serialize)]
struct ProbabilitiesResponse {
    jackpot_id: i64,
    model_version: String,
    fixtures: Vec<FixtureProbabilitiesDto>,
}

async fn probabilities_handler(
    State(state): State<Arc<AppState>>,
    Path(jackpot_id): Path<i64>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let deadline = Deadline::within(state.request_budget);
    let predictions = state
        .engine
        .predict(jackpot_id, deadline)
        .await
        .map_err(error_response)?;
    let model_version = state
        .engine
        .pipeline()
        .snapshot()
        .params
        .model_version
        .clone();
    Ok(Json(ProbabilitiesResponse {
        jackpot_id,
        model_version,
        fixtures: predictions.iter().map(fixture_dto).collect(),
    }))
}

// ── Tickets ───────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct TicketsRequest {
    probability_set: String,
    n_tickets: usize,
}

#[derive(Serialize)]
struct TicketDto {
    ticket_id: i64,
    archetype: String,
    picks: Vec<String>,
    decision_version: String,
    accepted: bool,
    ev_score: f64,
    contradictions: i64,
    reason: String,
}

#[derive(Serialize)]
struct TicketsResponse {
    jackpot_id: i64,
    probability_set: String,
    considered: usize,
    rejected: usize,
    rejection_reasons: Vec<String>,
    tickets: Vec<TicketDto>,
    portfolio: crate::tickets::portfolio::PortfolioDiagnostics,
}

async fn tickets_handler(
    State(state): State<Arc<AppState>>,
    Path(jackpot_id): Path<i64>,
    Json(req): Json<TicketsRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let set = SetKey::parse(&req.probability_set).map_err(error_response)?;
    let deadline = Deadline::within(state.request_budget);
    let generation = state
        .engine
        .generate_tickets(jackpot_id, set, req.n_tickets, deadline)
        .await
        .map_err(error_response)?;

    let tickets = generation
        .accepted
        .iter()
        .map(|t| TicketDto {
            ticket_id: t.ticket_id,
            archetype: t.archetype.clone(),
            picks: t.picks.iter().map(|p| p.as_str().to_string()).collect(),
            decision_version: t.decision_version.clone(),
            accepted: t.accepted,
            ev_score: t.ev_score,
            contradictions: t.contradictions,
            reason: t.reason.clone(),
        })
        .collect();

    Ok(Json(TicketsResponse {
        jackpot_id,
        probability_set: set.as_str().to_string(),
        considered: generation.considered,
        rejected: generation.rejected,
        rejection_reasons: generation.rejection_reasons,
        tickets,
        portfolio: generation.bundle.diagnostics,
    }))
}

// ── Results import ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ResultRow {
    match_order: i64,
    result: String,
    #[serde(default)]
    home_goals: Option<i64>,
    #[serde(default)]
    away_goals: Option<i64>,
}

#[derive(Deserialize)]
struct ResultsRequest {
    results: Vec<ResultRow>,
}

#[derive(Serialize)]
struct ResultsResponse {
    jackpot_id: i64,
    applied: usize,
}

async fn results_handler(
    State(state): State<Arc<AppState>>,
    Path(jackpot_id): Path<i64>,
    Json(req): Json<ResultsRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let rows: Vec<(i64, String, Option<i64>, Option<i64>)> = req
        .results
        .into_iter()
        .map(|r| (r.match_order, r.result, r.home_goals, r.away_goals))
        .collect();
    let applied = state
        .engine
        .import_results(jackpot_id, &rows)
        .map_err(error_response)?;
    Ok(Json(ResultsResponse {
        jackpot_id,
        applied,
    }))
}

// ── Calibration ───────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CalibrationFitRequest {
    model_version: String,
    #[serde(default)]
    league_id: Option<i64>,
    #[serde(default)]
    min_samples: Option<usize>,
}

#[derive(Serialize)]
struct CalibrationFitResponse {
    calibration_ids: Vec<i64>,
    samples_used: usize,
    brier_before: f64,
    brier_after: f64,
}

async fn calibration_fit_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CalibrationFitRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let report = state
        .calibrations
        .fit(
            &req.model_version,
            req.league_id,
            req.min_samples.unwrap_or(DEFAULT_MIN_SAMPLES),
        )
        .map_err(error_response)?;
    Ok(Json(CalibrationFitResponse {
        calibration_ids: report.calibration_ids,
        samples_used: report.samples_used,
        brier_before: report.brier_before,
        brier_after: report.brier_after,
    }))
}

async fn calibration_activate_handler(
    State(state): State<Arc<AppState>>,
    Path(calibration_id): Path<i64>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    state
        .calibrations
        .activate(calibration_id)
        .map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct CalibrationListQuery {
    model_version: String,
    #[serde(default)]
    league_id: Option<i64>,
}

#[derive(Serialize)]
struct CalibrationDto {
    calibration_id: i64,
    model_version: String,
    league_id: Option<i64>,
    outcome: String,
    samples_used: i64,
    active: bool,
    knots: Vec<(f64, f64)>,
}

async fn calibration_list_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CalibrationListQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let rows = state
        .engine
        .db()
        .list_active_calibrations(&query.model_version, query.league_id)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    let dto: Vec<CalibrationDto> = rows
        .into_iter()
        .map(|r| CalibrationDto {
            calibration_id: r.calibration_id,
            model_version: r.model_version,
            league_id: r.league_id,
            outcome: r.outcome.as_str().to_string(),
            samples_used: r.samples_used,
            active: r.active,
            knots: r.knots,
        })
        .collect();
    Ok(Json(dto))
}
