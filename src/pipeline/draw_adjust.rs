//! Draw-structural adjustment.
//!
//! Reshapes only the draw probability by a bounded product of structural
//! signals; home and away move by renormalisation alone, preserving their
//! ratio. Every signal degrades to a neutral 1.0 when its feature is
//! absent.

use serde::{Deserialize, Serialize};

use crate::features::FixtureContext;
use crate::model::poisson::BaseProbability;
use crate::model::ProbTriple;

/// Per-factor clamp and the clamp on the composed multiplier.
pub const MULTIPLIER_BOUNDS: (f64, f64) = (0.75, 1.35);
/// The adjusted draw probability is confined to this band.
pub const DRAW_BOUNDS: (f64, f64) = (0.12, 0.38);

/// Draw rate assumed for a league with no stored prior, when a signal
/// needs a reference point.
const FALLBACK_LEAGUE_DRAW_RATE: f64 = 0.26;

/// The audit record: one multiplier per structural signal, all defaulting
/// to 1.0.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DrawComponents {
    pub league_prior: f64,
    pub elo_symmetry: f64,
    pub h2h: f64,
    pub weather: f64,
    pub fatigue: f64,
    pub referee: f64,
    pub odds_drift: f64,
    pub xg_factor: f64,
}

impl Default for DrawComponents {
    fn default() -> Self {
        Self {
            league_prior: 1.0,
            elo_symmetry: 1.0,
            h2h: 1.0,
            weather: 1.0,
            fatigue: 1.0,
            referee: 1.0,
            odds_drift: 1.0,
            xg_factor: 1.0,
        }
    }
}

impl DrawComponents {
    /// The composed multiplier: each factor clamped, then the product
    /// clamped to the same band.
    pub fn multiplier(&self) -> f64 {
        self.multiplier_bounded(MULTIPLIER_BOUNDS)
    }

    pub fn multiplier_bounded(&self, bounds: (f64, f64)) -> f64 {
        let (lo, hi) = bounds;
        let product = [
            self.league_prior,
            self.elo_symmetry,
            self.h2h,
            self.weather,
            self.fatigue,
            self.referee,
            self.odds_drift,
            self.xg_factor,
        ]
        .iter()
        .map(|f| f.clamp(lo, hi))
        .product::<f64>();
        product.clamp(lo, hi)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AdjustedProbability {
    pub probs: ProbTriple,
    pub components: DrawComponents,
}

/// Compute the structural components for a fixture from its context.
pub fn draw_components(base: &BaseProbability, ctx: &FixtureContext) -> DrawComponents {
    let mut c = DrawComponents::default();

    if let Some(rate) = ctx.league_draw_rate {
        // Linear in the distance from the cross-league norm, scaled by the
        // league's structural profile (more teams and deeper relegation
        // battles mean more cagey fixtures).
        let structural = ctx
            .league_structure
            .map(|s| {
                let team_factor = 1.0 + (s.total_teams as f64 - 20.0) * 0.005;
                let relegation_factor = 1.0 + (s.relegation_zones as f64 / 3.0) * 0.02;
                (team_factor * relegation_factor).clamp(0.95, 1.05)
            })
            .unwrap_or(1.0);
        c.league_prior = (1.0 + (rate - 0.26) * 1.2) * structural;
    }

    if let (Some(elo_h), Some(elo_a)) = (ctx.elo_home, ctx.elo_away) {
        // Closely matched sides draw more; a 400-point gap kills it.
        let gap = (elo_h - elo_a).abs().min(400.0);
        c.elo_symmetry = 1.08 - 0.16 * gap / 400.0;
    }

    if let Some(h2h) = ctx.h2h {
        let league_rate = ctx.league_draw_rate.unwrap_or(FALLBACK_LEAGUE_DRAW_RATE);
        if h2h.meetings >= 5 && h2h.draw_rate > league_rate {
            c.h2h = 1.0 + (h2h.draw_rate - league_rate) * 0.8;
        }
    }

    if let Some(w) = ctx.weather {
        let heavy_rain = w.rain_mm >= 5.0;
        let high_wind = w.wind_kph >= 30.0;
        c.weather = match (heavy_rain, high_wind) {
            (true, true) => 1.08,
            (true, false) | (false, true) => 1.05,
            (false, false) => 1.0,
        };
    }

    {
        let tired_home = ctx.rest_days_home.is_some_and(|d| d <= 3);
        let tired_away = ctx.rest_days_away.is_some_and(|d| d <= 3);
        c.fatigue = match (tired_home, tired_away) {
            (true, true) => 1.10,
            (true, false) | (false, true) => 1.06,
            (false, false) => 1.0,
        };
    }

    if let Some(dev) = ctx.referee_draw_deviation {
        c.referee = 1.0 + dev * 0.5;
    }

    if let Some(drift) = ctx.odds_drift {
        if drift.opening_draw_odds > 1.0 {
            let shortened =
                (drift.opening_draw_odds - drift.closing_draw_odds) / drift.opening_draw_odds;
            if shortened > 0.10 {
                c.odds_drift = 1.08;
            }
        }
    }

    {
        // External xG when fed, otherwise the model's own lambdas.
        let (xg_h, xg_a) = ctx
            .xg
            .map(|x| (x.xg_home, x.xg_away))
            .unwrap_or((base.xg_home, base.xg_away));
        let total = xg_h + xg_a;
        if total < 2.2 {
            c.xg_factor = (1.0 + (2.2 - total) * 0.08).min(1.15);
        }
    }

    c
}

/// Apply the composed multiplier to the draw probability and renormalise
/// home/away onto the remaining mass.
pub fn apply(base: &BaseProbability, ctx: &FixtureContext) -> AdjustedProbability {
    apply_bounded(base, ctx, MULTIPLIER_BOUNDS, DRAW_BOUNDS)
}

/// [`apply`] with the clamp bands supplied by the resolved pipeline
/// configuration.
pub fn apply_bounded(
    base: &BaseProbability,
    ctx: &FixtureContext,
    multiplier_bounds: (f64, f64),
    draw_bounds: (f64, f64),
) -> AdjustedProbability {
    let components = draw_components(base, ctx);
    let probs = reshape_bounded(
        base.probs,
        components.multiplier_bounded(multiplier_bounds),
        draw_bounds,
    );
    AdjustedProbability { probs, components }
}

/// The pure reshaping step: `p_draw * m` clipped to the draw band, home
/// and away scaled by a common factor so the triple sums to one.
pub fn reshape(p: ProbTriple, multiplier: f64) -> ProbTriple {
    reshape_bounded(p, multiplier, DRAW_BOUNDS)
}

pub fn reshape_bounded(p: ProbTriple, multiplier: f64, draw_bounds: (f64, f64)) -> ProbTriple {
    let (draw_lo, draw_hi) = draw_bounds;
    let draw = (p.draw * multiplier).clamp(draw_lo, draw_hi);
    let side_mass = p.home + p.away;
    if side_mass <= 1e-12 {
        // Degenerate triple; keep the clamped draw and split the rest.
        let half = (1.0 - draw) / 2.0;
        return ProbTriple::new(half, draw, half);
    }
    let k = (1.0 - draw) / side_mass;
    ProbTriple::new(p.home * k, draw, p.away * k)
}
