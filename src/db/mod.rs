use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::{NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};

pub mod models;
use models::*;

use crate::model::{
    BlendWeights, DixonColesParams, MarketOdds, Outcome, ProbTriple, TeamStrength,
};

/// Thread-safe SQLite handle (single connection behind a mutex).
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the SQLite database at the given path.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Run schema migrations (idempotent).
    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    // ── Jackpots & fixtures ─────────────────────────────────────────────────

    pub fn insert_jackpot(&self, name: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO jackpot (name, created_at) VALUES (?1, ?2)",
            params![name, Utc::now()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn insert_fixture(&self, f: &JackpotFixture) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO jackpot_fixture (
                jackpot_id, match_order, league_id, home_team_id, away_team_id,
                kickoff_time, odds_home, odds_draw, odds_away,
                actual_result, actual_home_goals, actual_away_goals
             ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
            params![
                f.jackpot_id,
                f.match_order,
                f.league_id,
                f.home_team_id,
                f.away_team_id,
                f.kickoff_time,
                f.odds.map(|o| o.home),
                f.odds.map(|o| o.draw),
                f.odds.map(|o| o.away),
                f.actual_result.map(|o| o.as_str()),
                f.actual_home_goals,
                f.actual_away_goals,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Fixtures of a jackpot in coupon order.
    pub fn list_jackpot_fixtures(&self, jackpot_id: i64) -> Result<Vec<JackpotFixture>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT fixture_id, jackpot_id, match_order, league_id, home_team_id,
                    away_team_id, kickoff_time, odds_home, odds_draw, odds_away,
                    actual_result, actual_home_goals, actual_away_goals
             FROM jackpot_fixture WHERE jackpot_id = ?1 ORDER BY match_order ASC",
        )?;
        let fixtures = stmt
            .query_map(params![jackpot_id], map_fixture)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(fixtures)
    }

    /// Write a settled result onto a fixture identified by coupon position.
    /// Fixtures without stored odds receive the import defaults.
    pub fn record_fixture_result(
        &self,
        jackpot_id: i64,
        match_order: i64,
        result: Outcome,
        home_goals: Option<i64>,
        away_goals: Option<i64>,
    ) -> Result<bool> {
        let defaults = MarketOdds::import_default();
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE jackpot_fixture SET
                actual_result = ?1,
                actual_home_goals = ?2,
                actual_away_goals = ?3,
                odds_home = COALESCE(odds_home, ?4),
                odds_draw = COALESCE(odds_draw, ?5),
                odds_away = COALESCE(odds_away, ?6)
             WHERE jackpot_id = ?7 AND match_order = ?8",
            params![
                result.as_str(),
                home_goals,
                away_goals,
                defaults.home,
                defaults.draw,
                defaults.away,
                jackpot_id,
                match_order,
            ],
        )?;
        Ok(updated > 0)
    }

    // ── Match history (training data) ───────────────────────────────────────

    pub fn insert_historical_match(&self, m: &HistoricalMatch) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO match_history (
                match_id, league_id, match_date, home_team_id, away_team_id,
                home_goals, away_goals
             ) VALUES (?1,?2,?3,?4,?5,?6,?7)",
            params![
                m.match_id,
                m.league_id,
                m.match_date,
                m.home_team_id,
                m.away_team_id,
                m.home_goals,
                m.away_goals,
            ],
        )?;
        Ok(())
    }

    pub fn load_match_history(&self, since: NaiveDate) -> Result<Vec<HistoricalMatch>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT match_id, league_id, match_date, home_team_id, away_team_id,
                    home_goals, away_goals
             FROM match_history WHERE match_date >= ?1 ORDER BY match_date ASC",
        )?;
        let rows = stmt
            .query_map(params![since], |row| {
                Ok(HistoricalMatch {
                    match_id: row.get(0)?,
                    league_id: row.get(1)?,
                    match_date: row.get(2)?,
                    home_team_id: row.get(3)?,
                    away_team_id: row.get(4)?,
                    home_goals: row.get(5)?,
                    away_goals: row.get(6)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ── Feature tables (read side of the feature-store contract) ───────────

    pub fn get_league_draw_prior(&self, league_id: i64, season: &str) -> Result<Option<f64>> {
        let conn = self.conn.lock().unwrap();
        let v = conn
            .query_row(
                "SELECT draw_rate FROM league_draw_priors
                 WHERE league_id = ?1 AND season = ?2",
                params![league_id, season],
                |r| r.get(0),
            )
            .optional()?;
        Ok(v)
    }

    pub fn get_league_structure(&self, league_id: i64) -> Result<Option<(i64, i64)>> {
        let conn = self.conn.lock().unwrap();
        let v = conn
            .query_row(
                "SELECT total_teams, relegation_zones FROM league_structure
                 WHERE league_id = ?1",
                params![league_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        Ok(v)
    }

    /// Latest Elo rating at or before the given date.
    pub fn get_elo(&self, team_id: i64, as_of: NaiveDate) -> Result<Option<f64>> {
        let conn = self.conn.lock().unwrap();
        let v = conn
            .query_row(
                "SELECT elo FROM team_elo
                 WHERE team_id = ?1 AND as_of_date <= ?2
                 ORDER BY as_of_date DESC LIMIT 1",
                params![team_id, as_of],
                |r| r.get(0),
            )
            .optional()?;
        Ok(v)
    }

    pub fn get_h2h(&self, home_team_id: i64, away_team_id: i64) -> Result<Option<(i64, f64)>> {
        let conn = self.conn.lock().unwrap();
        let v = conn
            .query_row(
                "SELECT meetings, draw_rate FROM h2h_draw_stats
                 WHERE home_team_id = ?1 AND away_team_id = ?2",
                params![home_team_id, away_team_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        Ok(v)
    }

    pub fn get_rest_days(&self, fixture_id: i64, team_id: i64) -> Result<Option<i64>> {
        let conn = self.conn.lock().unwrap();
        let v = conn
            .query_row(
                "SELECT rest_days FROM team_rest_days
                 WHERE fixture_id = ?1 AND team_id = ?2",
                params![fixture_id, team_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(v)
    }

    /// Referee career draw-rate deviation from the league norm.
    pub fn get_referee_deviation(&self, fixture_id: i64) -> Result<Option<f64>> {
        let conn = self.conn.lock().unwrap();
        let v = conn
            .query_row(
                "SELECT draw_rate_deviation FROM referee_stats WHERE fixture_id = ?1",
                params![fixture_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(v)
    }

    pub fn get_weather(&self, fixture_id: i64) -> Result<Option<(f64, f64)>> {
        let conn = self.conn.lock().unwrap();
        let v = conn
            .query_row(
                "SELECT rain_mm, wind_kph FROM match_weather WHERE fixture_id = ?1",
                params![fixture_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        Ok(v)
    }

    pub fn get_odds_movement(&self, fixture_id: i64) -> Result<Option<(f64, f64)>> {
        let conn = self.conn.lock().unwrap();
        let v = conn
            .query_row(
                "SELECT opening_draw_odds, closing_draw_odds FROM odds_movement
                 WHERE fixture_id = ?1",
                params![fixture_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        Ok(v)
    }

    pub fn get_xg(&self, fixture_id: i64) -> Result<Option<(f64, f64)>> {
        let conn = self.conn.lock().unwrap();
        let v = conn
            .query_row(
                "SELECT xg_home, xg_away FROM match_xg WHERE fixture_id = ?1",
                params![fixture_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        Ok(v)
    }

    // ── Model parameters & strengths ────────────────────────────────────────

    /// Persist a fitted model and mark it active. The previous active
    /// version stays on disk for audit; only the flag moves.
    pub fn save_model(
        &self,
        params_row: &DixonColesParams,
        strengths: &HashMap<i64, TeamStrength>,
    ) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute("UPDATE model_params SET active = 0 WHERE active = 1", [])?;
        tx.execute(
            "INSERT OR REPLACE INTO model_params (model_version, params_json, active, created_at)
             VALUES (?1, ?2, 1, ?3)",
            params![
                params_row.model_version,
                serde_json::to_string(params_row)?,
                Utc::now(),
            ],
        )?;
        for (team_id, s) in strengths {
            tx.execute(
                "INSERT OR REPLACE INTO team_strength
                    (team_id, model_version, attack, defense, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    team_id,
                    params_row.model_version,
                    s.attack,
                    s.defense,
                    Utc::now()
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn load_active_model(
        &self,
    ) -> Result<Option<(DixonColesParams, HashMap<i64, TeamStrength>)>> {
        let conn = self.conn.lock().unwrap();
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT model_version, params_json FROM model_params
                 WHERE active = 1 ORDER BY created_at DESC LIMIT 1",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let Some((version, json)) = row else {
            return Ok(None);
        };
        let params_row: DixonColesParams = serde_json::from_str(&json)?;

        let mut stmt = conn.prepare(
            "SELECT team_id, attack, defense FROM team_strength WHERE model_version = ?1",
        )?;
        let strengths = stmt
            .query_map(params![version], |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    TeamStrength {
                        attack: r.get(1)?,
                        defense: r.get(2)?,
                    },
                ))
            })?
            .collect::<rusqlite::Result<HashMap<_, _>>>()?;
        Ok(Some((params_row, strengths)))
    }

    pub fn save_blend_model(&self, model_version: &str, weights: &BlendWeights) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO blend_model (model_version, weights_json, samples_used, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                model_version,
                serde_json::to_string(weights)?,
                weights.samples_used as i64,
                Utc::now(),
            ],
        )?;
        Ok(())
    }

    pub fn load_blend_model(&self, model_version: &str) -> Result<Option<BlendWeights>> {
        let conn = self.conn.lock().unwrap();
        let json: Option<String> = conn
            .query_row(
                "SELECT weights_json FROM blend_model WHERE model_version = ?1",
                params![model_version],
                |r| r.get(0),
            )
            .optional()?;
        match json {
            Some(j) => Ok(Some(serde_json::from_str(&j)?)),
            None => Ok(None),
        }
    }

    // ── Calibration store ───────────────────────────────────────────────────

    /// Append a new calibration version (inactive until activated).
    pub fn insert_calibration(
        &self,
        model_version: &str,
        league_id: Option<i64>,
        outcome: Outcome,
        knots: &[(f64, f64)],
        samples_used: i64,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();
        conn.execute(
            "INSERT INTO probability_calibration (
                model_version, league_id, outcome, knots_json, samples_used,
                created_at, valid_from, active
             ) VALUES (?1,?2,?3,?4,?5,?6,?7,0)",
            params![
                model_version,
                league_id,
                outcome.as_str(),
                serde_json::to_string(knots)?,
                samples_used,
                now,
                now,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Activate a calibration version, atomically deactivating its
    /// predecessor for the same `(model_version, league, outcome)` key.
    pub fn activate_calibration(&self, calibration_id: i64) -> Result<bool> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let key: Option<(String, Option<i64>, String)> = tx
            .query_row(
                "SELECT model_version, league_id, outcome FROM probability_calibration
                 WHERE calibration_id = ?1",
                params![calibration_id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .optional()?;
        let Some((model_version, league_id, outcome)) = key else {
            return Ok(false);
        };
        tx.execute(
            "UPDATE probability_calibration SET active = 0
             WHERE model_version = ?1 AND league_id IS ?2 AND outcome = ?3 AND active = 1",
            params![model_version, league_id, outcome],
        )?;
        tx.execute(
            "UPDATE probability_calibration SET active = 1, valid_from = ?2
             WHERE calibration_id = ?1",
            params![calibration_id, Utc::now()],
        )?;
        tx.commit()?;
        Ok(true)
    }

    pub fn load_active_calibration(
        &self,
        model_version: &str,
        league_id: Option<i64>,
        outcome: Outcome,
    ) -> Result<Option<CalibrationRow>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT calibration_id, model_version, league_id, outcome, knots_json,
                        samples_used, created_at, valid_from, active
                 FROM probability_calibration
                 WHERE model_version = ?1 AND league_id IS ?2 AND outcome = ?3 AND active = 1",
                params![model_version, league_id, outcome.as_str()],
                map_calibration,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_active_calibrations(
        &self,
        model_version: &str,
        league_id: Option<i64>,
    ) -> Result<Vec<CalibrationRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT calibration_id, model_version, league_id, outcome, knots_json,
                    samples_used, created_at, valid_from, active
             FROM probability_calibration
             WHERE model_version = ?1 AND (?2 IS NULL OR league_id IS ?2) AND active = 1
             ORDER BY calibration_id ASC",
        )?;
        let rows = stmt
            .query_map(params![model_version, league_id], map_calibration)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Training set for calibration fitting: one belief row per settled
    /// fixture (earliest snapshot wins so a fixture is not double-counted
    /// across tickets).
    pub fn load_calibration_dataset(
        &self,
        model_version: &str,
        league_id: Option<i64>,
    ) -> Result<Vec<CalibrationSample>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT jf.league_id,
                    ps.blended_home, ps.blended_draw, ps.blended_away,
                    jf.actual_result
             FROM prediction_snapshot ps
             JOIN jackpot_fixture jf ON jf.fixture_id = ps.fixture_id
             WHERE ps.model_version = ?1
               AND jf.actual_result IS NOT NULL
               AND (?2 IS NULL OR jf.league_id = ?2)
               AND ps.ticket_id = (
                    SELECT MIN(ticket_id) FROM prediction_snapshot
                    WHERE fixture_id = ps.fixture_id AND model_version = ps.model_version
               )",
        )?;
        let rows = stmt
            .query_map(params![model_version, league_id], |r| {
                let result: String = r.get(4)?;
                Ok((
                    r.get::<_, i64>(0)?,
                    ProbTriple::new(r.get(1)?, r.get(2)?, r.get(3)?),
                    result,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut out = Vec::with_capacity(rows.len());
        for (league, predicted, result) in rows {
            let actual =
                Outcome::parse_token(&result).map_err(|_| rusqlite::Error::InvalidQuery)?;
            out.push(CalibrationSample {
                league_id: league,
                predicted,
                actual,
            });
        }
        Ok(out)
    }

    /// Training rows for the blend layer: pre-blend model belief, quoted
    /// odds, league and settled outcome.
    pub fn load_blend_training(
        &self,
        model_version: &str,
    ) -> Result<Vec<(ProbTriple, MarketOdds, i64, Outcome)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT ps.base_home, ps.base_draw, ps.base_away,
                    jf.odds_home, jf.odds_draw, jf.odds_away,
                    jf.league_id, jf.actual_result
             FROM prediction_snapshot ps
             JOIN jackpot_fixture jf ON jf.fixture_id = ps.fixture_id
             WHERE ps.model_version = ?1
               AND jf.actual_result IS NOT NULL
               AND jf.odds_home IS NOT NULL
               AND ps.ticket_id = (
                    SELECT MIN(ticket_id) FROM prediction_snapshot
                    WHERE fixture_id = ps.fixture_id AND model_version = ps.model_version
               )",
        )?;
        let rows = stmt
            .query_map(params![model_version], |r| {
                let result: String = r.get(7)?;
                Ok((
                    ProbTriple::new(r.get(0)?, r.get(1)?, r.get(2)?),
                    MarketOdds {
                        home: r.get(3)?,
                        draw: r.get(4)?,
                        away: r.get(5)?,
                    },
                    r.get::<_, i64>(6)?,
                    result,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut out = Vec::with_capacity(rows.len());
        for (belief, odds, league, result) in rows {
            let actual =
                Outcome::parse_token(&result).map_err(|_| rusqlite::Error::InvalidQuery)?;
            out.push((belief, odds, league, actual));
        }
        Ok(out)
    }

    /// Per-lineage belief history with settled outcomes, for inverse-Brier
    /// ensemble weighting.
    pub fn load_snapshot_history(
        &self,
        model_version: &str,
    ) -> Result<Vec<(ProbTriple, ProbTriple, ProbTriple, Outcome)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT ps.base_home, ps.base_draw, ps.base_away,
                    ps.blended_home, ps.blended_draw, ps.blended_away,
                    ps.calibrated_home, ps.calibrated_draw, ps.calibrated_away,
                    jf.actual_result
             FROM prediction_snapshot ps
             JOIN jackpot_fixture jf ON jf.fixture_id = ps.fixture_id
             WHERE ps.model_version = ?1
               AND jf.actual_result IS NOT NULL
               AND ps.ticket_id = (
                    SELECT MIN(ticket_id) FROM prediction_snapshot
                    WHERE fixture_id = ps.fixture_id AND model_version = ps.model_version
               )",
        )?;
        let rows = stmt
            .query_map(params![model_version], |r| {
                let result: String = r.get(9)?;
                Ok((
                    ProbTriple::new(r.get(0)?, r.get(1)?, r.get(2)?),
                    ProbTriple::new(r.get(3)?, r.get(4)?, r.get(5)?),
                    ProbTriple::new(r.get(6)?, r.get(7)?, r.get(8)?),
                    result,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut out = Vec::with_capacity(rows.len());
        for (base, blended, calibrated, result) in rows {
            let actual =
                Outcome::parse_token(&result).map_err(|_| rusqlite::Error::InvalidQuery)?;
            out.push((base, blended, calibrated, actual));
        }
        Ok(out)
    }

    // ── Tickets & snapshots ─────────────────────────────────────────────────

    /// Persist a ticket with its picks and per-fixture belief snapshots in
    /// one transaction. Returns the new ticket id.
    pub fn persist_ticket(
        &self,
        ticket: &TicketRow,
        snapshots: &[PredictionSnapshot],
    ) -> Result<i64> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO ticket (
                jackpot_id, archetype, set_key, decision_version, ev_score,
                contradictions, accepted, reason, created_at
             ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
            params![
                ticket.jackpot_id,
                ticket.archetype,
                ticket.set_key,
                ticket.decision_version,
                ticket.ev_score,
                ticket.contradictions,
                ticket.accepted,
                ticket.reason,
                ticket.created_at,
            ],
        )?;
        let ticket_id = tx.last_insert_rowid();

        for (order, pick) in ticket.picks.iter().enumerate() {
            tx.execute(
                "INSERT INTO ticket_pick (ticket_id, match_order, pick)
                 VALUES (?1, ?2, ?3)",
                params![ticket_id, order as i64, pick.as_str()],
            )?;
        }

        for s in snapshots {
            tx.execute(
                "INSERT INTO prediction_snapshot (
                    ticket_id, fixture_id, model_version,
                    xg_home, xg_away, xg_confidence, dc_applied,
                    base_home, base_draw, base_away,
                    blended_home, blended_draw, blended_away,
                    calibrated_home, calibrated_draw, calibrated_away
                 ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16)",
                params![
                    ticket_id,
                    s.fixture_id,
                    s.model_version,
                    s.xg_home,
                    s.xg_away,
                    s.xg_confidence,
                    s.dc_applied,
                    s.base.home,
                    s.base.draw,
                    s.base.away,
                    s.blended.home,
                    s.blended.draw,
                    s.blended.away,
                    s.calibrated.home,
                    s.calibrated.draw,
                    s.calibrated.away,
                ],
            )?;
        }
        tx.commit()?;
        Ok(ticket_id)
    }

    pub fn list_tickets(&self, jackpot_id: i64, accepted_only: bool) -> Result<Vec<TicketRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT ticket_id, jackpot_id, archetype, set_key, decision_version,
                    ev_score, contradictions, accepted, reason, created_at
             FROM ticket
             WHERE jackpot_id = ?1 AND (?2 = 0 OR accepted = 1)
             ORDER BY ticket_id ASC",
        )?;
        let mut tickets = stmt
            .query_map(params![jackpot_id, accepted_only as i64], |r| {
                Ok(TicketRow {
                    ticket_id: r.get(0)?,
                    jackpot_id: r.get(1)?,
                    archetype: r.get(2)?,
                    set_key: r.get(3)?,
                    decision_version: r.get(4)?,
                    ev_score: r.get(5)?,
                    contradictions: r.get(6)?,
                    accepted: r.get(7)?,
                    reason: r.get(8)?,
                    picks: Vec::new(),
                    created_at: r.get(9)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut pick_stmt = conn.prepare(
            "SELECT pick FROM ticket_pick WHERE ticket_id = ?1 ORDER BY match_order ASC",
        )?;
        for t in &mut tickets {
            let picks = pick_stmt
                .query_map(params![t.ticket_id], |r| r.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            t.picks = picks
                .iter()
                .map(|p| Outcome::parse_token(p))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| anyhow::anyhow!("corrupt pick row: {e}"))?;
        }
        Ok(tickets)
    }

    pub fn upsert_ticket_outcome(&self, ticket_id: i64, hits: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO ticket_outcome (ticket_id, hits, settled_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(ticket_id) DO UPDATE SET
                hits = excluded.hits,
                settled_at = excluded.settled_at",
            params![ticket_id, hits, Utc::now()],
        )?;
        Ok(())
    }

    /// Joined ticket scores and settlement, for the threshold learner.
    /// Tickets whose score collapsed to -inf are excluded; they carry no
    /// usable ranking signal.
    pub fn load_scored_outcomes(&self) -> Result<Vec<ScoredOutcome>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT t.ev_score, o.hits,
                    (SELECT COUNT(*) FROM ticket_pick p WHERE p.ticket_id = t.ticket_id)
             FROM ticket t
             JOIN ticket_outcome o ON o.ticket_id = t.ticket_id
             WHERE t.ev_score > -1e308",
        )?;
        let rows = stmt
            .query_map([], |r| {
                Ok(ScoredOutcome {
                    ev_score: r.get(0)?,
                    hits: r.get(1)?,
                    total_picks: r.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ── Decision threshold ──────────────────────────────────────────────────

    pub fn save_threshold(
        &self,
        ev_threshold: f64,
        acceptance_rate: f64,
        samples_used: i64,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO decision_threshold (ev_threshold, acceptance_rate, samples_used, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![ev_threshold, acceptance_rate, samples_used, Utc::now()],
        )?;
        Ok(())
    }

    pub fn load_latest_threshold(&self) -> Result<Option<f64>> {
        let conn = self.conn.lock().unwrap();
        let v = conn
            .query_row(
                "SELECT ev_threshold FROM decision_threshold
                 ORDER BY id DESC LIMIT 1",
                [],
                |r| r.get(0),
            )
            .optional()?;
        Ok(v)
    }

    // ── Audit log ───────────────────────────────────────────────────────────

    pub fn log_ingestion(&self, source: &str, detail: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO ingestion_log (source, detail, created_at) VALUES (?1, ?2, ?3)",
            params![source, detail, Utc::now()],
        )?;
        Ok(())
    }
}

// ── SQL helpers ────────────────────────────────────────────────────────────────

fn map_fixture(row: &rusqlite::Row) -> rusqlite::Result<JackpotFixture> {
    let odds_home: Option<f64> = row.get(7)?;
    let odds_draw: Option<f64> = row.get(8)?;
    let odds_away: Option<f64> = row.get(9)?;
    let odds = match (odds_home, odds_draw, odds_away) {
        (Some(h), Some(d), Some(a)) => Some(MarketOdds {
            home: h,
            draw: d,
            away: a,
        }),
        _ => None,
    };
    let actual: Option<String> = row.get(10)?;
    Ok(JackpotFixture {
        fixture_id: row.get(0)?,
        jackpot_id: row.get(1)?,
        match_order: row.get(2)?,
        league_id: row.get(3)?,
        home_team_id: row.get(4)?,
        away_team_id: row.get(5)?,
        kickoff_time: row.get(6)?,
        odds,
        actual_result: actual.and_then(|s| Outcome::parse_token(&s).ok()),
        actual_home_goals: row.get(11)?,
        actual_away_goals: row.get(12)?,
    })
}

fn map_calibration(row: &rusqlite::Row) -> rusqlite::Result<CalibrationRow> {
    let outcome: String = row.get(3)?;
    let knots_json: String = row.get(4)?;
    Ok(CalibrationRow {
        calibration_id: row.get(0)?,
        model_version: row.get(1)?,
        league_id: row.get(2)?,
        outcome: Outcome::parse_token(&outcome).map_err(|_| rusqlite::Error::InvalidQuery)?,
        knots: serde_json::from_str(&knots_json).map_err(|_| rusqlite::Error::InvalidQuery)?,
        samples_used: row.get(5)?,
        created_at: row.get(6)?,
        valid_from: row.get(7)?,
        active: row.get(8)?,
    })
}

/// SQLite schema (idempotent CREATE IF NOT EXISTS).
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS jackpot (
    jackpot_id  INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT    NOT NULL,
    created_at  TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS jackpot_fixture (
    fixture_id        INTEGER PRIMARY KEY AUTOINCREMENT,
    jackpot_id        INTEGER NOT NULL,
    match_order       INTEGER NOT NULL,
    league_id         INTEGER NOT NULL,
    home_team_id      INTEGER NOT NULL,
    away_team_id      INTEGER NOT NULL,
    kickoff_time      TEXT    NOT NULL,
    odds_home         REAL,
    odds_draw         REAL,
    odds_away         REAL,
    actual_result     TEXT,
    actual_home_goals INTEGER,
    actual_away_goals INTEGER,
    UNIQUE (jackpot_id, match_order),
    FOREIGN KEY (jackpot_id) REFERENCES jackpot(jackpot_id)
);

CREATE TABLE IF NOT EXISTS match_history (
    match_id     INTEGER PRIMARY KEY,
    league_id    INTEGER NOT NULL,
    match_date   TEXT    NOT NULL,
    home_team_id INTEGER NOT NULL,
    away_team_id INTEGER NOT NULL,
    home_goals   INTEGER NOT NULL,
    away_goals   INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS league_draw_priors (
    league_id INTEGER NOT NULL,
    season    TEXT    NOT NULL,
    draw_rate REAL    NOT NULL,
    PRIMARY KEY (league_id, season)
);

CREATE TABLE IF NOT EXISTS league_structure (
    league_id        INTEGER PRIMARY KEY,
    total_teams      INTEGER NOT NULL,
    relegation_zones INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS team_elo (
    team_id     INTEGER NOT NULL,
    as_of_date  TEXT    NOT NULL,
    elo         REAL    NOT NULL,
    PRIMARY KEY (team_id, as_of_date)
);

CREATE TABLE IF NOT EXISTS h2h_draw_stats (
    home_team_id INTEGER NOT NULL,
    away_team_id INTEGER NOT NULL,
    meetings     INTEGER NOT NULL,
    draw_rate    REAL    NOT NULL,
    PRIMARY KEY (home_team_id, away_team_id)
);

CREATE TABLE IF NOT EXISTS team_rest_days (
    fixture_id INTEGER NOT NULL,
    team_id    INTEGER NOT NULL,
    rest_days  INTEGER NOT NULL,
    PRIMARY KEY (fixture_id, team_id)
);

CREATE TABLE IF NOT EXISTS referee_stats (
    fixture_id          INTEGER PRIMARY KEY,
    referee_name        TEXT    NOT NULL,
    draw_rate_deviation REAL    NOT NULL
);

CREATE TABLE IF NOT EXISTS match_weather (
    fixture_id INTEGER PRIMARY KEY,
    rain_mm    REAL NOT NULL,
    wind_kph   REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS odds_movement (
    fixture_id         INTEGER PRIMARY KEY,
    opening_draw_odds  REAL NOT NULL,
    closing_draw_odds  REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS match_xg (
    fixture_id INTEGER PRIMARY KEY,
    xg_home    REAL NOT NULL,
    xg_away    REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS model_params (
    model_version TEXT PRIMARY KEY,
    params_json   TEXT NOT NULL,
    active        INTEGER NOT NULL DEFAULT 0,
    created_at    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS team_strength (
    team_id       INTEGER NOT NULL,
    model_version TEXT    NOT NULL,
    attack        REAL    NOT NULL,
    defense       REAL    NOT NULL,
    updated_at    TEXT    NOT NULL,
    PRIMARY KEY (team_id, model_version)
);

CREATE TABLE IF NOT EXISTS blend_model (
    model_version TEXT PRIMARY KEY,
    weights_json  TEXT NOT NULL,
    samples_used  INTEGER NOT NULL,
    created_at    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS probability_calibration (
    calibration_id INTEGER PRIMARY KEY AUTOINCREMENT,
    model_version  TEXT    NOT NULL,
    league_id      INTEGER,
    outcome        TEXT    NOT NULL,
    knots_json     TEXT    NOT NULL,
    samples_used   INTEGER NOT NULL,
    created_at     TEXT    NOT NULL,
    valid_from     TEXT    NOT NULL,
    active         INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS ticket (
    ticket_id        INTEGER PRIMARY KEY AUTOINCREMENT,
    jackpot_id       INTEGER NOT NULL,
    archetype        TEXT    NOT NULL,
    set_key          TEXT    NOT NULL,
    decision_version TEXT    NOT NULL,
    ev_score         REAL    NOT NULL,
    contradictions   INTEGER NOT NULL,
    accepted         INTEGER NOT NULL,
    reason           TEXT    NOT NULL,
    created_at       TEXT    NOT NULL,
    FOREIGN KEY (jackpot_id) REFERENCES jackpot(jackpot_id)
);

CREATE TABLE IF NOT EXISTS ticket_pick (
    ticket_id   INTEGER NOT NULL,
    match_order INTEGER NOT NULL,
    pick        TEXT    NOT NULL,
    PRIMARY KEY (ticket_id, match_order),
    FOREIGN KEY (ticket_id) REFERENCES ticket(ticket_id)
);

CREATE TABLE IF NOT EXISTS prediction_snapshot (
    ticket_id       INTEGER NOT NULL,
    fixture_id      INTEGER NOT NULL,
    model_version   TEXT    NOT NULL,
    xg_home         REAL    NOT NULL,
    xg_away         REAL    NOT NULL,
    xg_confidence   REAL    NOT NULL,
    dc_applied      INTEGER NOT NULL,
    base_home       REAL    NOT NULL,
    base_draw       REAL    NOT NULL,
    base_away       REAL    NOT NULL,
    blended_home    REAL    NOT NULL,
    blended_draw    REAL    NOT NULL,
    blended_away    REAL    NOT NULL,
    calibrated_home REAL    NOT NULL,
    calibrated_draw REAL    NOT NULL,
    calibrated_away REAL    NOT NULL,
    PRIMARY KEY (ticket_id, fixture_id),
    FOREIGN KEY (ticket_id) REFERENCES ticket(ticket_id)
);

CREATE TABLE IF NOT EXISTS ticket_outcome (
    ticket_id  INTEGER PRIMARY KEY,
    hits       INTEGER NOT NULL,
    settled_at TEXT    NOT NULL,
    FOREIGN KEY (ticket_id) REFERENCES ticket(ticket_id)
);

CREATE TABLE IF NOT EXISTS decision_threshold (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    ev_threshold    REAL    NOT NULL,
    acceptance_rate REAL    NOT NULL,
    samples_used    INTEGER NOT NULL,
    created_at      TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS ingestion_log (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    source     TEXT NOT NULL,
    detail     TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_fixture_jackpot ON jackpot_fixture(jackpot_id);
CREATE INDEX IF NOT EXISTS idx_history_date ON match_history(match_date);
CREATE INDEX IF NOT EXISTS idx_calibration_key
    ON probability_calibration(model_version, league_id, outcome, active);
CREATE INDEX IF NOT EXISTS idx_ticket_jackpot ON ticket(jackpot_id);
CREATE INDEX IF NOT EXISTS idx_snapshot_fixture ON prediction_snapshot(fixture_id);
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixture(jackpot_id: i64, order: i64, odds: Option<MarketOdds>) -> JackpotFixture {
        JackpotFixture {
            fixture_id: 0,
            jackpot_id,
            match_order: order,
            league_id: 10,
            home_team_id: 100 + order,
            away_team_id: 200 + order,
            kickoff_time: Utc.with_ymd_and_hms(2025, 8, 2, 15, 0, 0).unwrap(),
            odds,
            actual_result: None,
            actual_home_goals: None,
            actual_away_goals: None,
        }
    }

    #[test]
    fn fixtures_round_trip_in_coupon_order() {
        let db = Database::open_in_memory().unwrap();
        let jp = db.insert_jackpot("w32").unwrap();
        for order in (0..3).rev() {
            db.insert_fixture(&fixture(
                jp,
                order,
                Some(MarketOdds {
                    home: 2.1,
                    draw: 3.3,
                    away: 3.4,
                }),
            ))
            .unwrap();
        }
        let got = db.list_jackpot_fixtures(jp).unwrap();
        assert_eq!(got.len(), 3);
        assert!(got.windows(2).all(|w| w[0].match_order < w[1].match_order));
        assert!(got[0].odds.is_some());
    }

    #[test]
    fn result_import_applies_default_odds() {
        let db = Database::open_in_memory().unwrap();
        let jp = db.insert_jackpot("w33").unwrap();
        db.insert_fixture(&fixture(jp, 0, None)).unwrap();

        let found = db
            .record_fixture_result(jp, 0, Outcome::Draw, Some(1), Some(1))
            .unwrap();
        assert!(found);

        let f = &db.list_jackpot_fixtures(jp).unwrap()[0];
        assert_eq!(f.actual_result, Some(Outcome::Draw));
        let odds = f.odds.unwrap();
        assert_eq!(odds.home, 2.0);
        assert_eq!(odds.draw, 3.0);
        assert_eq!(odds.away, 2.5);
    }

    #[test]
    fn calibration_activation_is_exclusive_per_key() {
        let db = Database::open_in_memory().unwrap();
        let knots = vec![(0.0, 0.0), (1.0, 1.0)];
        let first = db
            .insert_calibration("v1", Some(10), Outcome::Draw, &knots, 250)
            .unwrap();
        let second = db
            .insert_calibration("v1", Some(10), Outcome::Draw, &knots, 300)
            .unwrap();

        assert!(db.activate_calibration(first).unwrap());
        assert!(db.activate_calibration(second).unwrap());

        let active = db
            .load_active_calibration("v1", Some(10), Outcome::Draw)
            .unwrap()
            .unwrap();
        assert_eq!(active.calibration_id, second);

        // The predecessor row still exists, inactive (append-only).
        let all = db.list_active_calibrations("v1", Some(10)).unwrap();
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn global_calibration_uses_null_league() {
        let db = Database::open_in_memory().unwrap();
        let knots = vec![(0.0, 0.0), (1.0, 1.0)];
        let id = db
            .insert_calibration("v1", None, Outcome::Home, &knots, 250)
            .unwrap();
        db.activate_calibration(id).unwrap();
        assert!(db
            .load_active_calibration("v1", None, Outcome::Home)
            .unwrap()
            .is_some());
        assert!(db
            .load_active_calibration("v1", Some(99), Outcome::Home)
            .unwrap()
            .is_none());
    }

    #[test]
    fn ticket_persists_with_picks_and_snapshots() {
        let db = Database::open_in_memory().unwrap();
        let jp = db.insert_jackpot("w34").unwrap();
        let mut fixture_ids = Vec::new();
        for order in 0..2 {
            fixture_ids.push(db.insert_fixture(&fixture(jp, order, None)).unwrap());
        }

        let ticket = TicketRow {
            ticket_id: 0,
            jackpot_id: jp,
            archetype: "BALANCED".into(),
            set_key: "B".into(),
            decision_version: "UDS_v1".into(),
            ev_score: 0.42,
            contradictions: 0,
            accepted: true,
            reason: "ok".into(),
            picks: vec![Outcome::Home, Outcome::Draw],
            created_at: Utc::now(),
        };
        let snapshots: Vec<PredictionSnapshot> = fixture_ids
            .iter()
            .map(|fid| PredictionSnapshot {
                ticket_id: 0,
                fixture_id: *fid,
                model_version: "v1".into(),
                xg_home: 1.3,
                xg_away: 1.1,
                xg_confidence: 0.9,
                dc_applied: true,
                base: ProbTriple::new(0.4, 0.3, 0.3),
                blended: ProbTriple::new(0.42, 0.28, 0.3),
                calibrated: ProbTriple::new(0.41, 0.29, 0.3),
            })
            .collect();

        let id = db.persist_ticket(&ticket, &snapshots).unwrap();
        assert!(id > 0);

        let stored = db.list_tickets(jp, true).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].picks, vec![Outcome::Home, Outcome::Draw]);
    }

    #[test]
    fn rejected_tickets_are_filtered_from_accepted_listing() {
        let db = Database::open_in_memory().unwrap();
        let jp = db.insert_jackpot("w35").unwrap();
        let mut ticket = TicketRow {
            ticket_id: 0,
            jackpot_id: jp,
            archetype: "BALANCED".into(),
            set_key: "B".into(),
            decision_version: "UDS_v1".into(),
            ev_score: f64::MIN,
            contradictions: 1,
            accepted: false,
            reason: "draw pick against home dominance".into(),
            picks: vec![Outcome::Draw],
            created_at: Utc::now(),
        };
        db.persist_ticket(&ticket, &[]).unwrap();
        ticket.accepted = true;
        ticket.ev_score = 0.1;
        ticket.contradictions = 0;
        ticket.reason = "ok".into();
        db.persist_ticket(&ticket, &[]).unwrap();

        assert_eq!(db.list_tickets(jp, true).unwrap().len(), 1);
        assert_eq!(db.list_tickets(jp, false).unwrap().len(), 2);
    }

    #[test]
    fn threshold_round_trips() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.load_latest_threshold().unwrap().is_none());
        db.save_threshold(0.08, 0.65, 120).unwrap();
        db.save_threshold(0.11, 0.61, 180).unwrap();
        assert_eq!(db.load_latest_threshold().unwrap(), Some(0.11));
    }

    #[test]
    fn model_round_trips_with_strengths() {
        let db = Database::open_in_memory().unwrap();
        let mut strengths = HashMap::new();
        strengths.insert(
            7,
            TeamStrength {
                attack: 0.3,
                defense: 0.1,
            },
        );
        let params_row = DixonColesParams::defaults("dc_v7", 0.0065);
        db.save_model(&params_row, &strengths).unwrap();

        let (loaded, s) = db.load_active_model().unwrap().unwrap();
        assert_eq!(loaded.model_version, "dc_v7");
        assert_eq!(s.len(), 1);
        assert!(s.contains_key(&7));
    }
}
