//! Ticket archetypes: constraint families over the composition of picks.
//!
//! The archetype is chosen from the slate profile, and each archetype is a
//! predicate a candidate must satisfy before it reaches the evaluator.

use serde::{Deserialize, Serialize};

use crate::model::Outcome;
use crate::tickets::SlateFixture;

/// Odds ceiling for any pick on a FAVORITE_LOCK ticket.
const FAVORITE_LOCK_MAX_ODDS: f64 = 3.5;
/// Expected draw share of a slate for DRAW_SELECTIVE sizing.
const DRAW_SHARE: f64 = 0.22;
/// Draw picks must sit on genuinely tight fixtures.
const DRAW_XG_GAP: f64 = 0.4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Archetype {
    #[serde(rename = "FAVORITE_LOCK")]
    FavoriteLock,
    #[serde(rename = "BALANCED")]
    Balanced,
    #[serde(rename = "DRAW_SELECTIVE")]
    DrawSelective,
    #[serde(rename = "AWAY_EDGE")]
    AwayEdge,
}

impl Archetype {
    pub fn as_str(&self) -> &'static str {
        match self {
            Archetype::FavoriteLock => "FAVORITE_LOCK",
            Archetype::Balanced => "BALANCED",
            Archetype::DrawSelective => "DRAW_SELECTIVE",
            Archetype::AwayEdge => "AWAY_EDGE",
        }
    }
}

/// Counters describing the slate, driving archetype selection.
#[derive(Debug, Clone, Copy)]
pub struct SlateProfile {
    pub fixtures: usize,
    /// Fixtures whose favourite probability reaches 0.55.
    pub strong_favourites: usize,
    /// Fixtures with a positive away EV under set B.
    pub away_value: usize,
    /// Fixtures with near-equal expected goals.
    pub tight_fixtures: usize,
}

impl SlateProfile {
    pub fn analyse(slate: &[SlateFixture]) -> Self {
        let strong_favourites = slate.iter().filter(|f| f.probs.max() >= 0.55).count();
        let away_value = slate
            .iter()
            .filter(|f| f.away_edge_ev().is_some_and(|ev| ev > 0.0))
            .count();
        let tight_fixtures = slate
            .iter()
            .filter(|f| (f.xg_home - f.xg_away).abs() < DRAW_XG_GAP)
            .count();
        Self {
            fixtures: slate.len(),
            strong_favourites,
            away_value,
            tight_fixtures,
        }
    }

    /// The archetype tie-break: favourites, then away value, then draw
    /// density, then the permissive default.
    pub fn choose(&self) -> Archetype {
        if self.fixtures == 0 {
            return Archetype::Balanced;
        }
        let n = self.fixtures as f64;
        if self.strong_favourites as f64 / n >= 0.70 {
            Archetype::FavoriteLock
        } else if self.away_value as f64 / n >= 0.25 {
            Archetype::AwayEdge
        } else if self.tight_fixtures as f64 / n >= 0.30 {
            Archetype::DrawSelective
        } else {
            Archetype::Balanced
        }
    }
}

/// Target draw-pick count for a DRAW_SELECTIVE slate, with its ±1 band.
pub fn draw_selective_target(total_fixtures: usize) -> (usize, usize, usize) {
    let target = (total_fixtures as f64 * DRAW_SHARE).round() as usize;
    (target, target.saturating_sub(1), target + 1)
}

/// Away-count band for an AWAY_EDGE slate.
pub fn away_edge_band(total_fixtures: usize) -> (usize, usize) {
    let lo = (total_fixtures as f64 * 0.25).round() as usize;
    let hi = (total_fixtures as f64 * 0.40).round() as usize;
    (lo, hi.max(lo))
}

/// Validate a candidate's picks against an archetype. `Err` carries the
/// reason the composition fails.
pub fn validate(
    archetype: Archetype,
    picks: &[Outcome],
    slate: &[SlateFixture],
) -> Result<(), String> {
    if picks.len() != slate.len() {
        return Err(format!(
            "ticket has {} picks for {} fixtures",
            picks.len(),
            slate.len()
        ));
    }
    match archetype {
        Archetype::Balanced => Ok(()),
        Archetype::FavoriteLock => validate_favorite_lock(picks, slate),
        Archetype::DrawSelective => validate_draw_selective(picks, slate),
        Archetype::AwayEdge => validate_away_edge(picks, slate),
    }
}

fn validate_favorite_lock(picks: &[Outcome], slate: &[SlateFixture]) -> Result<(), String> {
    let on_favourite = picks
        .iter()
        .zip(slate)
        .filter(|(pick, f)| **pick == f.probs.favourite())
        .count();
    if (on_favourite as f64) < 0.60 * picks.len() as f64 {
        return Err(format!(
            "only {on_favourite}/{} picks on the favourite",
            picks.len()
        ));
    }
    let draws = picks.iter().filter(|p| **p == Outcome::Draw).count();
    if draws > 1 {
        return Err(format!("{draws} draws on a favourite-lock ticket"));
    }
    let aways = picks.iter().filter(|p| **p == Outcome::Away).count();
    if aways > 1 {
        return Err(format!("{aways} aways on a favourite-lock ticket"));
    }
    for (pick, f) in picks.iter().zip(slate) {
        let odds = f.effective_odds().get(*pick);
        if odds > FAVORITE_LOCK_MAX_ODDS {
            return Err(format!(
                "pick at odds {odds:.2} exceeds the {FAVORITE_LOCK_MAX_ODDS} lock ceiling"
            ));
        }
    }
    Ok(())
}

fn validate_draw_selective(picks: &[Outcome], slate: &[SlateFixture]) -> Result<(), String> {
    let draws: Vec<&SlateFixture> = picks
        .iter()
        .zip(slate)
        .filter(|(pick, _)| **pick == Outcome::Draw)
        .map(|(_, f)| f)
        .collect();
    for f in &draws {
        if !f.dc_applied {
            return Err(format!(
                "draw pick on fixture {} outside the low-scoring regime",
                f.fixture_id
            ));
        }
        if (f.xg_home - f.xg_away).abs() >= DRAW_XG_GAP {
            return Err(format!(
                "draw pick on fixture {} with xg gap {:.2}",
                f.fixture_id,
                (f.xg_home - f.xg_away).abs()
            ));
        }
    }
    let (target, lo, hi) = draw_selective_target(slate.len());
    if draws.len() < lo || draws.len() > hi {
        return Err(format!(
            "{} draws outside the target band {target}±1",
            draws.len()
        ));
    }
    Ok(())
}

fn validate_away_edge(picks: &[Outcome], slate: &[SlateFixture]) -> Result<(), String> {
    let mut aways = 0usize;
    for (pick, f) in picks.iter().zip(slate) {
        if *pick != Outcome::Away {
            continue;
        }
        aways += 1;
        match f.away_edge_ev() {
            Some(ev) if ev > 0.0 => {}
            _ => {
                return Err(format!(
                    "away pick on fixture {} without positive edge",
                    f.fixture_id
                ))
            }
        }
    }
    let (lo, hi) = away_edge_band(slate.len());
    if aways < lo || aways > hi {
        return Err(format!("{aways} away picks outside the band [{lo}, {hi}]"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MarketOdds, ProbTriple};
    use crate::tickets::testkit::slate_fixture;

    fn favourite_heavy_slate(n: usize) -> Vec<SlateFixture> {
        (0..n)
            .map(|i| {
                slate_fixture(
                    i as i64,
                    ProbTriple::new(0.60, 0.23, 0.17),
                    Some(MarketOdds {
                        home: 1.65,
                        draw: 3.8,
                        away: 5.2,
                    }),
                )
            })
            .collect()
    }

    #[test]
    fn strong_favourites_select_favorite_lock() {
        let slate = favourite_heavy_slate(13);
        let profile = SlateProfile::analyse(&slate);
        assert_eq!(profile.choose(), Archetype::FavoriteLock);
    }

    #[test]
    fn empty_slate_defaults_to_balanced() {
        let profile = SlateProfile::analyse(&[]);
        assert_eq!(profile.choose(), Archetype::Balanced);
    }

    #[test]
    fn away_value_selects_away_edge() {
        // Model sees much more away probability than the market prices.
        let slate: Vec<SlateFixture> = (0..12)
            .map(|i| {
                slate_fixture(
                    i as i64,
                    ProbTriple::new(0.30, 0.25, 0.45),
                    Some(MarketOdds {
                        home: 2.2,
                        draw: 3.3,
                        away: 3.4,
                    }),
                )
            })
            .collect();
        let profile = SlateProfile::analyse(&slate);
        assert_eq!(profile.choose(), Archetype::AwayEdge);
    }

    #[test]
    fn favorite_lock_rejects_two_draws() {
        // Scenario: five picks, two of them draws.
        let slate = favourite_heavy_slate(5);
        let picks = vec![
            Outcome::Draw,
            Outcome::Draw,
            Outcome::Home,
            Outcome::Home,
            Outcome::Home,
        ];
        let err = validate(Archetype::FavoriteLock, &picks, &slate).unwrap_err();
        assert!(err.contains("draws"));
    }

    #[test]
    fn favorite_lock_rejects_long_odds_pick() {
        let slate = favourite_heavy_slate(5);
        let picks = vec![
            Outcome::Home,
            Outcome::Home,
            Outcome::Home,
            Outcome::Home,
            Outcome::Away, // away at 5.2 > 3.5
        ];
        let err = validate(Archetype::FavoriteLock, &picks, &slate).unwrap_err();
        assert!(err.contains("ceiling"));
    }

    #[test]
    fn favorite_lock_accepts_conforming_ticket() {
        let slate = favourite_heavy_slate(5);
        let picks = vec![Outcome::Home; 5];
        assert!(validate(Archetype::FavoriteLock, &picks, &slate).is_ok());
    }

    #[test]
    fn draw_selective_enforces_band_and_eligibility() {
        let mut slate = favourite_heavy_slate(13);
        // Make every fixture draw-eligible.
        for f in &mut slate {
            f.dc_applied = true;
            f.xg_home = 1.1;
            f.xg_away = 1.0;
        }
        // Target for 13 fixtures: round(2.86) = 3, band 2..=4.
        let mut picks = vec![Outcome::Home; 13];
        picks[0] = Outcome::Draw;
        picks[1] = Outcome::Draw;
        picks[2] = Outcome::Draw;
        assert!(validate(Archetype::DrawSelective, &picks, &slate).is_ok());

        // One draw is below the band.
        let mut too_few = vec![Outcome::Home; 13];
        too_few[0] = Outcome::Draw;
        assert!(validate(Archetype::DrawSelective, &too_few, &slate).is_err());

        // A draw on a high-gap fixture is rejected outright.
        slate[0].xg_home = 2.4;
        slate[0].xg_away = 0.9;
        assert!(validate(Archetype::DrawSelective, &picks, &slate).is_err());
    }

    #[test]
    fn away_edge_requires_positive_edge_and_band() {
        let slate: Vec<SlateFixture> = (0..12)
            .map(|i| {
                slate_fixture(
                    i as i64,
                    ProbTriple::new(0.30, 0.25, 0.45),
                    Some(MarketOdds {
                        home: 2.2,
                        draw: 3.3,
                        away: 3.4,
                    }),
                )
            })
            .collect();
        // Band for 12 fixtures: [3, 5].
        let mut picks = vec![Outcome::Home; 12];
        picks[0] = Outcome::Away;
        picks[1] = Outcome::Away;
        picks[2] = Outcome::Away;
        picks[3] = Outcome::Away;
        assert!(validate(Archetype::AwayEdge, &picks, &slate).is_ok());

        let too_few = vec![Outcome::Home; 12];
        assert!(validate(Archetype::AwayEdge, &too_few, &slate).is_err());
    }

    #[test]
    fn balanced_accepts_anything_of_right_length() {
        let slate = favourite_heavy_slate(4);
        let picks = vec![
            Outcome::Away,
            Outcome::Draw,
            Outcome::Home,
            Outcome::Draw,
        ];
        assert!(validate(Archetype::Balanced, &picks, &slate).is_ok());
        assert!(validate(Archetype::Balanced, &picks[..3], &slate).is_err());
    }
}
