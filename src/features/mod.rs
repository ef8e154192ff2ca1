//! Feature-store contract consumed by the pipeline.
//!
//! Every getter returns `None` on absence; nothing here synthesises a
//! value. The pipeline pre-fetches a [`FixtureContext`] per fixture so the
//! numeric kernel itself never touches I/O.

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use tracing::warn;

use crate::db::models::JackpotFixture;
use crate::db::Database;

/// Structural facts about a league's season format.
#[derive(Debug, Clone, Copy)]
pub struct LeagueStructure {
    pub total_teams: i64,
    pub relegation_zones: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct H2hStats {
    pub meetings: i64,
    pub draw_rate: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct WeatherReport {
    pub rain_mm: f64,
    pub wind_kph: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct OddsMovement {
    pub opening_draw_odds: f64,
    pub closing_draw_odds: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct XgReport {
    pub xg_home: f64,
    pub xg_away: f64,
}

/// Everything the draw-structural adjuster can see for one fixture. Each
/// field is independently optional; absent data degrades that signal to a
/// neutral multiplier.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixtureContext {
    pub league_draw_rate: Option<f64>,
    pub league_structure: Option<LeagueStructure>,
    pub elo_home: Option<f64>,
    pub elo_away: Option<f64>,
    pub h2h: Option<H2hStats>,
    pub rest_days_home: Option<i64>,
    pub rest_days_away: Option<i64>,
    pub referee_draw_deviation: Option<f64>,
    pub weather: Option<WeatherReport>,
    pub odds_drift: Option<OddsMovement>,
    pub xg: Option<XgReport>,
}

#[async_trait]
pub trait FeatureStore: Send + Sync {
    async fn get_league_prior(&self, league_id: i64, season: &str) -> Option<f64>;
    async fn get_league_structure(&self, league_id: i64) -> Option<LeagueStructure>;
    async fn get_elo(&self, team_id: i64, as_of: NaiveDate) -> Option<f64>;
    async fn get_h2h(&self, home_id: i64, away_id: i64) -> Option<H2hStats>;
    async fn get_rest_days(&self, fixture_id: i64, team_id: i64) -> Option<i64>;
    async fn get_referee(&self, fixture_id: i64) -> Option<f64>;
    async fn get_weather(&self, fixture_id: i64) -> Option<WeatherReport>;
    async fn get_odds_movement(&self, fixture_id: i64) -> Option<OddsMovement>;
    async fn get_xg(&self, fixture_id: i64) -> Option<XgReport>;

    /// Assemble the full context for one fixture. Default implementation
    /// fans out to the individual getters.
    async fn fixture_context(&self, fixture: &JackpotFixture) -> FixtureContext {
        let as_of = fixture.kickoff_time.date_naive();
        let season = season_label(as_of);
        FixtureContext {
            league_draw_rate: self.get_league_prior(fixture.league_id, &season).await,
            league_structure: self.get_league_structure(fixture.league_id).await,
            elo_home: self.get_elo(fixture.home_team_id, as_of).await,
            elo_away: self.get_elo(fixture.away_team_id, as_of).await,
            h2h: self.get_h2h(fixture.home_team_id, fixture.away_team_id).await,
            rest_days_home: self
                .get_rest_days(fixture.fixture_id, fixture.home_team_id)
                .await,
            rest_days_away: self
                .get_rest_days(fixture.fixture_id, fixture.away_team_id)
                .await,
            referee_draw_deviation: self.get_referee(fixture.fixture_id).await,
            weather: self.get_weather(fixture.fixture_id).await,
            odds_drift: self.get_odds_movement(fixture.fixture_id).await,
            xg: self.get_xg(fixture.fixture_id).await,
        }
    }
}

/// European season label for a date: July onward starts the new season.
pub fn season_label(date: NaiveDate) -> String {
    let year = date.year();
    if date.month() >= 7 {
        format!("{}-{}", year, year + 1)
    } else {
        format!("{}-{}", year - 1, year)
    }
}

/// Feature store backed by the engine's SQLite feature tables.
#[derive(Clone)]
pub struct SqliteFeatureStore {
    db: Database,
}

impl SqliteFeatureStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn log_miss<T>(result: anyhow::Result<Option<T>>, what: &str) -> Option<T> {
        match result {
            Ok(v) => v,
            Err(e) => {
                warn!("feature read failed for {what}: {e}");
                None
            }
        }
    }
}

#[async_trait]
impl FeatureStore for SqliteFeatureStore {
    async fn get_league_prior(&self, league_id: i64, season: &str) -> Option<f64> {
        Self::log_miss(
            self.db.get_league_draw_prior(league_id, season),
            "league_draw_priors",
        )
    }

    async fn get_league_structure(&self, league_id: i64) -> Option<LeagueStructure> {
        Self::log_miss(self.db.get_league_structure(league_id), "league_structure").map(
            |(total_teams, relegation_zones)| LeagueStructure {
                total_teams,
                relegation_zones,
            },
        )
    }

    async fn get_elo(&self, team_id: i64, as_of: NaiveDate) -> Option<f64> {
        Self::log_miss(self.db.get_elo(team_id, as_of), "team_elo")
    }

    async fn get_h2h(&self, home_id: i64, away_id: i64) -> Option<H2hStats> {
        Self::log_miss(self.db.get_h2h(home_id, away_id), "h2h_draw_stats").map(
            |(meetings, draw_rate)| H2hStats {
                meetings,
                draw_rate,
            },
        )
    }

    async fn get_rest_days(&self, fixture_id: i64, team_id: i64) -> Option<i64> {
        Self::log_miss(self.db.get_rest_days(fixture_id, team_id), "team_rest_days")
    }

    async fn get_referee(&self, fixture_id: i64) -> Option<f64> {
        Self::log_miss(self.db.get_referee_deviation(fixture_id), "referee_stats")
    }

    async fn get_weather(&self, fixture_id: i64) -> Option<WeatherReport> {
        Self::log_miss(self.db.get_weather(fixture_id), "match_weather")
            .map(|(rain_mm, wind_kph)| WeatherReport { rain_mm, wind_kph })
    }

    async fn get_odds_movement(&self, fixture_id: i64) -> Option<OddsMovement> {
        Self::log_miss(self.db.get_odds_movement(fixture_id), "odds_movement").map(
            |(opening_draw_odds, closing_draw_odds)| OddsMovement {
                opening_draw_odds,
                closing_draw_odds,
            },
        )
    }

    async fn get_xg(&self, fixture_id: i64) -> Option<XgReport> {
        Self::log_miss(self.db.get_xg(fixture_id), "match_xg")
            .map(|(xg_home, xg_away)| XgReport { xg_home, xg_away })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn season_rolls_over_in_july() {
        let spring = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap();
        let autumn = NaiveDate::from_ymd_opt(2025, 9, 1).unwrap();
        assert_eq!(season_label(spring), "2024-2025");
        assert_eq!(season_label(autumn), "2025-2026");
    }
}
